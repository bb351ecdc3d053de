use std::collections::BTreeSet;
use std::fmt;

use crate::hierarchy::TypeHierarchy;
use crate::ir::Nullness;

/// Nullability lattice. Join order: `Null <= Nullable`, `NotNull <= Unknown <= Nullable`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum Nullability {
    Null,
    NotNull,
    Unknown,
    Nullable,
}

impl Nullability {
    pub(crate) fn from_declared(nullness: Nullness) -> Self {
        match nullness {
            Nullness::NonNull => Nullability::NotNull,
            Nullness::Nullable => Nullability::Nullable,
            Nullness::Unknown => Nullability::Unknown,
        }
    }

    pub(crate) fn join(self, other: Self) -> Self {
        use Nullability::*;
        match (self, other) {
            (left, right) if left == right => left,
            (Nullable, _) | (_, Nullable) => Nullable,
            (Null, _) | (_, Null) => Nullable,
            _ => Unknown,
        }
    }

    /// Refines with knowledge from another source; `None` when both cannot hold.
    pub(crate) fn narrow(self, other: Self) -> Option<Self> {
        use Nullability::*;
        match (self, other) {
            (Unknown, other) => Some(other),
            (current, Unknown) => Some(current),
            (Null, NotNull) | (NotNull, Null) => None,
            (Nullable, other) => Some(other),
            (current, Nullable) => Some(current),
            (current, _) => Some(current),
        }
    }

    /// Null is a known possibility on some path.
    pub(crate) fn may_be_null(self) -> bool {
        matches!(self, Nullability::Null | Nullability::Nullable)
    }
}

impl fmt::Display for Nullability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Nullability::Null => "null",
            Nullability::NotNull => "not-null",
            Nullability::Unknown => "unknown nullability",
            Nullability::Nullable => "nullable",
        };
        f.write_str(text)
    }
}

/// Exact value of a constant; doubles are kept as canonical bit patterns.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum ConstValue {
    Bool(bool),
    Int(i64),
    Double(u64),
    Str(String),
    Class(String),
}

impl ConstValue {
    pub(crate) fn double(value: f64) -> Self {
        if value.is_nan() {
            ConstValue::Double(f64::NAN.to_bits())
        } else {
            ConstValue::Double(value.to_bits())
        }
    }

    pub(crate) fn truth(&self) -> Option<bool> {
        match self {
            ConstValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn is_nan(&self) -> bool {
        matches!(self, ConstValue::Double(bits) if f64::from_bits(*bits).is_nan())
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ConstValue::Int(value) => Some(*value as f64),
            ConstValue::Double(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// Runtime `==` between two constants, when it can be decided.
    pub(crate) fn equals(&self, other: &Self) -> Option<bool> {
        match (self, other) {
            (ConstValue::Bool(left), ConstValue::Bool(right)) => Some(left == right),
            (ConstValue::Int(left), ConstValue::Int(right)) => Some(left == right),
            (ConstValue::Str(left), ConstValue::Str(right)) if left != right => Some(false),
            (ConstValue::Class(left), ConstValue::Class(right)) => Some(left == right),
            (left, right) => match (left.as_f64(), right.as_f64()) {
                (Some(left), Some(right)) => Some(left == right),
                _ => None,
            },
        }
    }

    /// Runtime ordering comparison; `None` for NaN or non-numeric operands.
    pub(crate) fn compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.as_f64()?.partial_cmp(&other.as_f64()?)
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Bool(value) => write!(f, "{value}"),
            ConstValue::Int(value) => write!(f, "{value}"),
            ConstValue::Double(bits) => write!(f, "{}", f64::from_bits(*bits)),
            ConstValue::Str(value) => write!(f, "{value:?}"),
            ConstValue::Class(value) => write!(f, "{value}.class"),
        }
    }
}

/// Closed interval of an integral value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct Range {
    pub(crate) lo: i64,
    pub(crate) hi: i64,
}

impl Range {
    pub(crate) fn point(value: i64) -> Self {
        Self {
            lo: value,
            hi: value,
        }
    }

    /// Builds a range, collapsing the full interval to `None` ("any value").
    pub(crate) fn bounded(lo: i64, hi: i64) -> Option<Self> {
        if lo == i64::MIN && hi == i64::MAX {
            None
        } else {
            Some(Self { lo, hi })
        }
    }

    pub(crate) fn bounds(range: Option<Range>) -> (i64, i64) {
        range.map_or((i64::MIN, i64::MAX), |range| (range.lo, range.hi))
    }

    fn hull(self, other: Self) -> Option<Self> {
        Self::bounded(self.lo.min(other.lo), self.hi.max(other.hi))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

/// Intersects two optional ranges. The outer `None` means the ranges are disjoint.
pub(crate) fn intersect_ranges(left: Option<Range>, right: Option<Range>) -> Option<Option<Range>> {
    let (left_lo, left_hi) = Range::bounds(left);
    let (right_lo, right_hi) = Range::bounds(right);
    let lo = left_lo.max(right_lo);
    let hi = left_hi.min(right_hi);
    if lo > hi {
        return None;
    }
    Some(Range::bounded(lo, hi))
}

/// Special markers attached to values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum Marker {
    /// Produced by a call known to return an unmodifiable collection.
    Unmodifiable,
    /// Result of `new` that has not escaped through a join.
    Fresh,
    /// Result of a boxing conversion.
    Boxed,
}

/// Narrowed and excluded runtime types of a reference.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct TypeConstraint {
    pub(crate) exact: Option<String>,
    pub(crate) instance_of: BTreeSet<String>,
    pub(crate) not_instance_of: BTreeSet<String>,
}

impl TypeConstraint {
    pub(crate) fn exactly(class: &str) -> Self {
        Self {
            exact: Some(class.to_string()),
            instance_of: BTreeSet::from([class.to_string()]),
            not_instance_of: BTreeSet::new(),
        }
    }

    fn join(&self, other: &Self) -> Self {
        let exact = if self.exact == other.exact {
            self.exact.clone()
        } else {
            None
        };
        Self {
            exact,
            instance_of: self
                .instance_of
                .intersection(&other.instance_of)
                .cloned()
                .collect(),
            not_instance_of: self
                .not_instance_of
                .intersection(&other.not_instance_of)
                .cloned()
                .collect(),
        }
    }

    fn meet(&self, other: &Self, hierarchy: &TypeHierarchy) -> Option<Self> {
        let exact = match (&self.exact, &other.exact) {
            (Some(left), Some(right)) if left != right => return None,
            (Some(exact), _) | (_, Some(exact)) => Some(exact.clone()),
            (None, None) => None,
        };
        let met = Self {
            exact,
            instance_of: self
                .instance_of
                .union(&other.instance_of)
                .cloned()
                .collect(),
            not_instance_of: self
                .not_instance_of
                .union(&other.not_instance_of)
                .cloned()
                .collect(),
        };
        met.is_consistent(hierarchy).then_some(met)
    }

    fn is_consistent(&self, hierarchy: &TypeHierarchy) -> bool {
        for positive in &self.instance_of {
            if self
                .not_instance_of
                .iter()
                .any(|negative| hierarchy.is_subtype(positive, negative) == Some(true))
            {
                return false;
            }
            if let Some(exact) = &self.exact {
                if hierarchy.is_subtype(exact, positive) == Some(false) {
                    return false;
                }
            }
            if self
                .instance_of
                .iter()
                .any(|other| !hierarchy.may_intersect(positive, other))
            {
                return false;
            }
        }
        true
    }

    /// Outcome of `instanceof class` for a non-null value, when decidable.
    pub(crate) fn test(&self, class: &str, hierarchy: &TypeHierarchy) -> Option<bool> {
        if self
            .instance_of
            .iter()
            .any(|known| hierarchy.is_subtype(known, class) == Some(true))
        {
            return Some(true);
        }
        if let Some(exact) = &self.exact {
            if let Some(outcome) = hierarchy.is_subtype(exact, class) {
                return Some(outcome);
            }
        }
        if self
            .not_instance_of
            .iter()
            .any(|excluded| hierarchy.is_subtype(class, excluded) == Some(true))
        {
            return Some(false);
        }
        if self
            .instance_of
            .iter()
            .any(|known| !hierarchy.may_intersect(known, class))
        {
            return Some(false);
        }
        None
    }
}

/// All facts known about one value.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct FactSet {
    pub(crate) nullability: Nullability,
    pub(crate) constant: Option<ConstValue>,
    pub(crate) types: TypeConstraint,
    pub(crate) range: Option<Range>,
    pub(crate) markers: BTreeSet<Marker>,
}

impl Default for FactSet {
    fn default() -> Self {
        Self::unknown()
    }
}

impl FactSet {
    pub(crate) fn unknown() -> Self {
        Self::with_nullability(Nullability::Unknown)
    }

    pub(crate) fn null() -> Self {
        Self::with_nullability(Nullability::Null)
    }

    pub(crate) fn not_null() -> Self {
        Self::with_nullability(Nullability::NotNull)
    }

    pub(crate) fn with_nullability(nullability: Nullability) -> Self {
        Self {
            nullability,
            constant: None,
            types: TypeConstraint::default(),
            range: None,
            markers: BTreeSet::new(),
        }
    }

    pub(crate) fn declared(nullness: Nullness) -> Self {
        Self::with_nullability(Nullability::from_declared(nullness))
    }

    pub(crate) fn constant(value: ConstValue) -> Self {
        let mut facts = Self::not_null();
        match &value {
            ConstValue::Int(number) => facts.range = Some(Range::point(*number)),
            ConstValue::Str(_) => facts.types = TypeConstraint::exactly("java/lang/String"),
            ConstValue::Class(_) => facts.types = TypeConstraint::exactly("java/lang/Class"),
            ConstValue::Bool(_) | ConstValue::Double(_) => {}
        }
        facts.constant = Some(value);
        facts
    }

    pub(crate) fn boolean(value: bool) -> Self {
        Self::constant(ConstValue::Bool(value))
    }

    pub(crate) fn with_range(range: Option<Range>) -> Self {
        let mut facts = Self::not_null();
        facts.range = range;
        if let Some(range) = range {
            if range.lo == range.hi {
                facts.constant = Some(ConstValue::Int(range.lo));
            }
        }
        facts
    }

    pub(crate) fn with_marker(mut self, marker: Marker) -> Self {
        self.markers.insert(marker);
        self
    }

    pub(crate) fn has_marker(&self, marker: Marker) -> bool {
        self.markers.contains(&marker)
    }

    pub(crate) fn truth(&self) -> Option<bool> {
        self.constant.as_ref().and_then(ConstValue::truth)
    }

    /// Least upper bound. Types and markers of a definitely-null side are vacuous.
    pub(crate) fn join(&self, other: &Self) -> Self {
        let nullability = self.nullability.join(other.nullability);
        let constant = if self.constant == other.constant {
            self.constant.clone()
        } else {
            None
        };
        let range = match (self.range, other.range) {
            (Some(left), Some(right)) => left.hull(right),
            _ => None,
        };
        let (types, markers) = match (self.nullability, other.nullability) {
            (Nullability::Null, _) => (other.types.clone(), other.markers.clone()),
            (_, Nullability::Null) => (self.types.clone(), self.markers.clone()),
            _ => (
                self.types.join(&other.types),
                self.markers.intersection(&other.markers).copied().collect(),
            ),
        };
        Self {
            nullability,
            constant,
            types,
            range,
            markers,
        }
    }

    /// Greatest lower bound; `None` when the facts contradict each other.
    pub(crate) fn meet(&self, other: &Self, hierarchy: &TypeHierarchy) -> Option<Self> {
        let nullability = self.nullability.narrow(other.nullability)?;
        let range = intersect_ranges(self.range, other.range)?;
        let constant = match (&self.constant, &other.constant) {
            (Some(left), Some(right)) if left != right => return None,
            (Some(value), _) | (_, Some(value)) => Some(value.clone()),
            (None, None) => range
                .filter(|range| range.lo == range.hi)
                .map(|range| ConstValue::Int(range.lo)),
        };
        if let (Some(ConstValue::Int(value)), Some(range)) = (&constant, range) {
            if *value < range.lo || *value > range.hi {
                return None;
            }
        }
        if nullability == Nullability::Null {
            if constant.is_some() {
                return None;
            }
            return Some(Self::null());
        }
        let types = self.types.meet(&other.types, hierarchy)?;
        Some(Self {
            nullability,
            constant,
            types,
            range,
            markers: self.markers.union(&other.markers).copied().collect(),
        })
    }

    /// `self` is at least as precise as `other`.
    pub(crate) fn is_within(&self, other: &Self) -> bool {
        self.join(other) == *other
    }

    /// Pushes range bounds that grew since `previous` to the integral extremes.
    pub(crate) fn widen(&self, previous: &Self) -> Self {
        let mut widened = self.clone();
        if let (Some(current), Some(previous)) = (self.range, previous.range) {
            let lo = if current.lo < previous.lo {
                i64::MIN
            } else {
                current.lo
            };
            let hi = if current.hi > previous.hi {
                i64::MAX
            } else {
                current.hi
            };
            widened.range = Range::bounded(lo, hi);
        }
        widened
    }
}

/// Join where `None` stands for "not reached yet", the identity element.
pub(crate) fn join_reached(left: Option<&FactSet>, right: Option<&FactSet>) -> Option<FactSet> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.join(right)),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}

impl fmt::Display for FactSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(constant) = &self.constant {
            return write!(f, "constant {constant}");
        }
        write!(f, "{}", self.nullability)?;
        if let Some(range) = self.range {
            write!(f, ", range {range}")?;
        }
        if let Some(exact) = &self.types.exact {
            write!(f, ", exactly {exact}")?;
        } else if !self.types.instance_of.is_empty() {
            let names: Vec<&str> = self.types.instance_of.iter().map(String::as_str).collect();
            write!(f, ", instance of {}", names.join(" & "))?;
        }
        if self.has_marker(Marker::Unmodifiable) {
            write!(f, ", unmodifiable")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_nullabilities() -> [Nullability; 4] {
        [
            Nullability::Null,
            Nullability::NotNull,
            Nullability::Unknown,
            Nullability::Nullable,
        ]
    }

    fn samples() -> Vec<FactSet> {
        vec![
            FactSet::null(),
            FactSet::not_null(),
            FactSet::unknown(),
            FactSet::declared(Nullness::Nullable),
            FactSet::constant(ConstValue::Int(3)),
            FactSet::constant(ConstValue::Int(7)),
            FactSet::boolean(true),
            FactSet::constant(ConstValue::double(f64::NAN)),
            FactSet::constant(ConstValue::Str("a".to_string())),
            FactSet::not_null().with_marker(Marker::Unmodifiable),
            FactSet {
                types: TypeConstraint::exactly("p/A"),
                ..FactSet::not_null()
            },
        ]
    }

    #[test]
    fn null_joined_with_not_null_is_nullable() {
        assert_eq!(
            Nullability::Null.join(Nullability::NotNull),
            Nullability::Nullable
        );
        assert_eq!(
            FactSet::null().join(&FactSet::not_null()).nullability,
            Nullability::Nullable
        );
    }

    #[test]
    fn nullability_join_is_commutative_and_associative() {
        for a in all_nullabilities() {
            for b in all_nullabilities() {
                assert_eq!(a.join(b), b.join(a));
                for c in all_nullabilities() {
                    assert_eq!(a.join(b).join(c), a.join(b.join(c)));
                }
            }
        }
    }

    #[test]
    fn join_never_gains_precision() {
        for a in samples() {
            for b in samples() {
                let joined = a.join(&b);
                assert!(a.is_within(&joined), "{a} not within {joined}");
                assert!(b.is_within(&joined), "{b} not within {joined}");
                assert_eq!(joined, b.join(&a));
            }
        }
    }

    #[test]
    fn unreached_is_join_identity() {
        for a in samples() {
            assert_eq!(join_reached(Some(&a), None), Some(a.clone()));
            assert_eq!(join_reached(None, Some(&a)), Some(a));
        }
    }

    #[test]
    fn differing_constants_join_to_range_hull() {
        let joined =
            FactSet::constant(ConstValue::Int(3)).join(&FactSet::constant(ConstValue::Int(7)));
        assert_eq!(joined.constant, None);
        assert_eq!(joined.range, Some(Range { lo: 3, hi: 7 }));
    }

    #[test]
    fn null_side_keeps_other_type_information() {
        let typed = FactSet {
            types: TypeConstraint::exactly("p/A"),
            ..FactSet::not_null()
        };
        let joined = typed.join(&FactSet::null());
        assert_eq!(joined.nullability, Nullability::Nullable);
        assert_eq!(joined.types.exact.as_deref(), Some("p/A"));
    }

    #[test]
    fn meet_detects_contradictions() {
        let hierarchy = TypeHierarchy::default();
        assert!(FactSet::null().meet(&FactSet::not_null(), &hierarchy).is_none());
        assert!(
            FactSet::boolean(true)
                .meet(&FactSet::boolean(false), &hierarchy)
                .is_none()
        );
        assert_eq!(
            FactSet::unknown()
                .meet(&FactSet::null(), &hierarchy)
                .map(|facts| facts.nullability),
            Some(Nullability::Null)
        );
    }

    #[test]
    fn widen_pushes_growing_bounds_to_extremes() {
        let previous = FactSet::with_range(Some(Range { lo: 0, hi: 1 }));
        let current = FactSet::with_range(Some(Range { lo: 0, hi: 2 }));
        let widened = current.widen(&previous);
        assert_eq!(widened.range, Some(Range { lo: 0, hi: i64::MAX }));
    }

    #[test]
    fn nan_is_never_equal() {
        let nan = ConstValue::double(f64::NAN);
        assert_eq!(nan.equals(&nan), Some(false));
        assert_eq!(nan.compare(&ConstValue::Int(1)), None);
    }

    #[test]
    fn type_test_uses_hierarchy() {
        let hierarchy = TypeHierarchy::default();
        let constraint = TypeConstraint::exactly("java/lang/String");
        assert_eq!(constraint.test("java/lang/Object", &hierarchy), Some(true));
        let excluded = TypeConstraint {
            not_instance_of: BTreeSet::from(["p/A".to_string()]),
            ..TypeConstraint::default()
        };
        assert_eq!(excluded.test("p/A", &hierarchy), Some(false));
        assert_eq!(excluded.test("p/B", &hierarchy), None);
    }
}
