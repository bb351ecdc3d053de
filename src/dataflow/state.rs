use std::collections::{BTreeMap, BTreeSet};

use crate::dataflow::facts::{ConstValue, FactSet, Nullability, Range, TypeConstraint, intersect_ranges};
use crate::dataflow::value::{Condition, Relation, ValueDescriptor, ValueId, ValueTable, VariableDescriptor};
use crate::hierarchy::TypeHierarchy;
use crate::ir::ResumeTarget;

/// Part of a state that must match before two states are joined.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct MergeKey {
    pub(crate) depth: usize,
    pub(crate) transfers: Vec<ResumeTarget>,
}

/// Abstract machine state at one program point.
///
/// Variables that share a value form an equivalence class whose canonical
/// member is the smallest id; facts are stored under the canonical member.
/// Singletons holding their default facts are not stored at all, so two
/// states describing the same knowledge compare equal.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub(crate) struct MemoryState {
    stack: Vec<ValueId>,
    facts: BTreeMap<ValueId, FactSet>,
    classes: BTreeMap<ValueId, ValueId>,
    distinct: BTreeSet<(ValueId, ValueId)>,
    transfers: Vec<ResumeTarget>,
}

fn ordered(left: ValueId, right: ValueId) -> (ValueId, ValueId) {
    if left <= right {
        (left, right)
    } else {
        (right, left)
    }
}

impl MemoryState {
    pub(crate) fn push(&mut self, value: ValueId) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Option<ValueId> {
        self.stack.pop()
    }

    /// Pops `count` values, returned in push order.
    pub(crate) fn pop_n(&mut self, count: usize) -> Option<Vec<ValueId>> {
        if self.stack.len() < count {
            return None;
        }
        Some(self.stack.split_off(self.stack.len() - count))
    }

    pub(crate) fn peek(&self) -> Option<ValueId> {
        self.stack.last().copied()
    }

    pub(crate) fn stack(&self) -> &[ValueId] {
        &self.stack
    }

    pub(crate) fn clear_stack(&mut self) {
        self.stack.clear();
    }

    pub(crate) fn push_transfer(&mut self, target: ResumeTarget) {
        self.transfers.push(target);
    }

    pub(crate) fn pop_transfer(&mut self) -> Option<ResumeTarget> {
        self.transfers.pop()
    }

    pub(crate) fn merge_key(&self) -> MergeKey {
        MergeKey {
            depth: self.stack.len(),
            transfers: self.transfers.clone(),
        }
    }

    pub(crate) fn canonical(&self, id: ValueId) -> ValueId {
        self.classes.get(&id).copied().unwrap_or(id)
    }

    fn members(&self, canonical: ValueId) -> Vec<ValueId> {
        let members: Vec<ValueId> = self
            .classes
            .iter()
            .filter(|(_, owner)| **owner == canonical)
            .map(|(member, _)| *member)
            .collect();
        if members.is_empty() {
            vec![canonical]
        } else {
            members
        }
    }

    pub(crate) fn are_equal(&self, left: ValueId, right: ValueId) -> bool {
        self.canonical(left) == self.canonical(right)
    }

    pub(crate) fn are_distinct(&self, left: ValueId, right: ValueId) -> bool {
        self.distinct
            .contains(&ordered(self.canonical(left), self.canonical(right)))
    }

    /// Content of a variable: the canonical member of its class and the class facts.
    pub(crate) fn lookup(&self, values: &ValueTable, variable: ValueId) -> (ValueId, FactSet) {
        let canonical = self.canonical(variable);
        (canonical, self.variable_facts(values, canonical))
    }

    fn variable_facts(&self, values: &ValueTable, variable: ValueId) -> FactSet {
        let canonical = self.canonical(variable);
        self.facts
            .get(&canonical)
            .cloned()
            .unwrap_or_else(|| values.default_facts(canonical))
    }

    /// Facts currently known for any value.
    pub(crate) fn facts(&self, values: &ValueTable, hierarchy: &TypeHierarchy, id: ValueId) -> FactSet {
        match values.descriptor(id) {
            ValueDescriptor::Variable(_) => self.variable_facts(values, id),
            ValueDescriptor::Condition(_) => match self.truth(values, hierarchy, id) {
                Some(outcome) => FactSet::boolean(outcome),
                None => values.default_facts(id),
            },
            _ => values.default_facts(id),
        }
    }

    /// Boolean value of `id`, when decided by the current facts.
    pub(crate) fn truth(&self, values: &ValueTable, hierarchy: &TypeHierarchy, id: ValueId) -> Option<bool> {
        match values.descriptor(id) {
            ValueDescriptor::Condition(Condition::Compare {
                left,
                relation,
                right,
            }) => self.evaluate_relation(values, hierarchy, *left, *relation, *right),
            ValueDescriptor::Condition(Condition::InstanceOf {
                value,
                class,
                negated,
            }) => self
                .evaluate_type_test(values, hierarchy, *value, class)
                .map(|outcome| outcome != *negated),
            _ => self.facts(values, hierarchy, id).truth(),
        }
    }

    pub(crate) fn evaluate_relation(
        &self,
        values: &ValueTable,
        hierarchy: &TypeHierarchy,
        left: ValueId,
        relation: Relation,
        right: ValueId,
    ) -> Option<bool> {
        let left_facts = self.facts(values, hierarchy, left);
        let right_facts = self.facts(values, hierarchy, right);
        let is_nan = |facts: &FactSet| facts.constant.as_ref().is_some_and(ConstValue::is_nan);
        if is_nan(&left_facts) || is_nan(&right_facts) {
            return Some(relation == Relation::Ne);
        }
        match relation {
            Relation::Eq | Relation::Ne => {
                let equal = self.evaluate_equality(values, left, &left_facts, right, &right_facts)?;
                Some(equal == (relation == Relation::Eq))
            }
            _ => {
                if let (Some(left_constant), Some(right_constant)) =
                    (&left_facts.constant, &right_facts.constant)
                {
                    if let Some(ordering) = left_constant.compare(right_constant) {
                        return Some(relation.holds(ordering));
                    }
                }
                let (Some(left_range), Some(right_range)) = (left_facts.range, right_facts.range)
                else {
                    return None;
                };
                compare_ranges(left_range, relation, right_range)
            }
        }
    }

    fn evaluate_equality(
        &self,
        values: &ValueTable,
        left: ValueId,
        left_facts: &FactSet,
        right: ValueId,
        right_facts: &FactSet,
    ) -> Option<bool> {
        if values.is_variable(left) && values.is_variable(right) {
            if self.are_equal(left, right) {
                return Some(true);
            }
            if self.are_distinct(left, right) {
                return Some(false);
            }
        }
        match (left_facts.nullability, right_facts.nullability) {
            (Nullability::Null, Nullability::Null) => return Some(true),
            (Nullability::Null, Nullability::NotNull) | (Nullability::NotNull, Nullability::Null) => {
                return Some(false);
            }
            _ => {}
        }
        if let (Some(left_constant), Some(right_constant)) =
            (&left_facts.constant, &right_facts.constant)
        {
            if let Some(outcome) = left_constant.equals(right_constant) {
                return Some(outcome);
            }
        }
        if let (Some(left_range), Some(right_range)) = (left_facts.range, right_facts.range) {
            if left_range.hi < right_range.lo || right_range.hi < left_range.lo {
                return Some(false);
            }
        }
        None
    }

    fn evaluate_type_test(
        &self,
        values: &ValueTable,
        hierarchy: &TypeHierarchy,
        value: ValueId,
        class: &str,
    ) -> Option<bool> {
        let facts = self.facts(values, hierarchy, value);
        match facts.nullability {
            Nullability::Null => Some(false),
            Nullability::NotNull => facts.types.test(class, hierarchy),
            _ => match facts.types.test(class, hierarchy) {
                Some(false) => Some(false),
                _ => None,
            },
        }
    }

    /// Refine the facts of `id`; returns `false` when the state becomes infeasible.
    pub(crate) fn narrow(
        &mut self,
        values: &ValueTable,
        hierarchy: &TypeHierarchy,
        id: ValueId,
        facts: &FactSet,
    ) -> bool {
        let current = self.facts(values, hierarchy, id);
        let Some(narrowed) = current.meet(facts, hierarchy) else {
            return false;
        };
        if values.is_variable(id) {
            let canonical = self.canonical(id);
            self.store_facts(values, canonical, narrowed);
        }
        true
    }

    fn store_facts(&mut self, values: &ValueTable, canonical: ValueId, facts: FactSet) {
        if !self.classes.contains_key(&canonical) && facts == values.default_facts(canonical) {
            self.facts.remove(&canonical);
        } else {
            self.facts.insert(canonical, facts);
        }
    }

    /// Record that two variables hold the same value; `false` when that is impossible.
    pub(crate) fn unite(
        &mut self,
        values: &ValueTable,
        hierarchy: &TypeHierarchy,
        left: ValueId,
        right: ValueId,
    ) -> bool {
        let left = self.canonical(left);
        let right = self.canonical(right);
        if left == right {
            return true;
        }
        if self.distinct.contains(&ordered(left, right)) {
            return false;
        }
        let Some(met) = self
            .variable_facts(values, left)
            .meet(&self.variable_facts(values, right), hierarchy)
        else {
            return false;
        };
        self.merge_classes(left, right);
        let canonical = left.min(right);
        self.facts.insert(canonical, met);
        true
    }

    /// Join two classes without touching facts beyond moving them to the new canonical.
    fn merge_classes(&mut self, left: ValueId, right: ValueId) {
        let canonical = left.min(right);
        let retired = left.max(right);
        let mut members = self.members(left);
        members.extend(self.members(right));
        for member in members {
            self.classes.insert(member, canonical);
        }
        if let Some(facts) = self.facts.remove(&retired) {
            self.facts.entry(canonical).or_insert(facts);
        }
        self.rename_distinct(retired, canonical);
    }

    fn rename_distinct(&mut self, from: ValueId, to: ValueId) {
        let renamed: Vec<(ValueId, ValueId)> = self
            .distinct
            .iter()
            .filter(|(left, right)| *left == from || *right == from)
            .copied()
            .collect();
        for pair in renamed {
            self.distinct.remove(&pair);
            let other = if pair.0 == from { pair.1 } else { pair.0 };
            if other != to {
                self.distinct.insert(ordered(other, to));
            }
        }
    }

    /// Record that two variables hold different values; `false` when they are known equal.
    pub(crate) fn make_distinct(&mut self, left: ValueId, right: ValueId) -> bool {
        let left = self.canonical(left);
        let right = self.canonical(right);
        if left == right {
            return false;
        }
        self.distinct.insert(ordered(left, right));
        true
    }

    /// Assign `value` to `variable`, forgetting everything the variable held before.
    pub(crate) fn set_var(
        &mut self,
        values: &mut ValueTable,
        hierarchy: &TypeHierarchy,
        variable: ValueId,
        value: ValueId,
    ) {
        self.stack.push(value);
        self.flush_variable(values, hierarchy, variable);
        let Some(value) = self.stack.pop() else {
            return;
        };
        match values.descriptor(value) {
            ValueDescriptor::Variable(_) => {
                let source = self.canonical(value);
                if !self.facts.contains_key(&source) {
                    let facts = values.default_facts(source);
                    self.facts.insert(source, facts);
                }
                self.merge_classes(variable, source);
            }
            _ => {
                let facts = self.facts(values, hierarchy, value);
                self.store_facts(values, variable, facts);
            }
        }
    }

    fn tracked_variables(&self, values: &ValueTable) -> BTreeSet<ValueId> {
        let mut tracked: BTreeSet<ValueId> = self.facts.keys().copied().collect();
        tracked.extend(self.classes.keys().copied());
        for (left, right) in &self.distinct {
            tracked.insert(*left);
            tracked.insert(*right);
        }
        tracked.extend(
            self.stack
                .iter()
                .copied()
                .filter(|id| values.is_variable(*id)),
        );
        tracked
    }

    /// Forget the content of `variable` and of every field read through it.
    pub(crate) fn flush_variable(
        &mut self,
        values: &mut ValueTable,
        hierarchy: &TypeHierarchy,
        variable: ValueId,
    ) {
        let dependents: Vec<ValueId> = self
            .tracked_variables(values)
            .into_iter()
            .filter(|id| *id != variable && values.is_field(*id) && values.depends_on(*id, variable))
            .collect();
        self.detach_stack(values, hierarchy, variable);
        self.remove_variable(values, variable);
        for dependent in dependents {
            self.detach_stack(values, hierarchy, dependent);
            self.remove_variable(values, dependent);
        }
    }

    /// Replace stack entries that read `variable` so they keep their current meaning.
    fn detach_stack(&mut self, values: &mut ValueTable, hierarchy: &TypeHierarchy, variable: ValueId) {
        let replacement_member = self
            .members(self.canonical(variable))
            .into_iter()
            .find(|member| *member != variable && !values.depends_on(*member, variable));
        for position in 0..self.stack.len() {
            let entry = self.stack[position];
            if !values.depends_on(entry, variable) {
                continue;
            }
            let replacement = match (entry == variable, replacement_member) {
                (true, Some(member)) => member,
                _ => {
                    let facts = self.facts(values, hierarchy, entry);
                    match facts.constant.clone() {
                        Some(constant) if facts == FactSet::constant(constant.clone()) => {
                            values.constant(constant)
                        }
                        _ => values.facts(facts),
                    }
                }
            };
            self.stack[position] = replacement;
        }
    }

    fn remove_variable(&mut self, values: &ValueTable, variable: ValueId) {
        let canonical = self.canonical(variable);
        let mut rest: Vec<ValueId> = self
            .members(canonical)
            .into_iter()
            .filter(|member| *member != variable)
            .collect();
        rest.sort();
        self.classes.remove(&variable);
        if rest.is_empty() {
            self.facts.remove(&variable);
            let dropped: Vec<(ValueId, ValueId)> = self
                .distinct
                .iter()
                .filter(|(left, right)| *left == variable || *right == variable)
                .copied()
                .collect();
            for pair in dropped {
                self.distinct.remove(&pair);
            }
            return;
        }
        let successor = rest[0];
        if canonical == variable {
            if let Some(facts) = self.facts.remove(&variable) {
                self.facts.insert(successor, facts);
            }
            self.rename_distinct(variable, successor);
        }
        if rest.len() == 1 {
            self.classes.remove(&successor);
            if let Some(facts) = self.facts.get(&successor).cloned() {
                self.store_facts(values, successor, facts);
            }
        } else {
            for member in rest {
                self.classes.insert(member, successor);
            }
        }
    }

    /// Forget non-final fields reached through `qualifier`, or all of them when `None`.
    pub(crate) fn flush_fields(
        &mut self,
        values: &mut ValueTable,
        hierarchy: &TypeHierarchy,
        qualifier: Option<ValueId>,
    ) {
        let qualifier = qualifier.map(|id| self.canonical(id));
        let targets: Vec<ValueId> = self
            .tracked_variables(values)
            .into_iter()
            .filter(|id| match values.as_variable(*id) {
                Some(VariableDescriptor::Field { qualifier: owner, field }) if !field.stable => {
                    match qualifier {
                        None => true,
                        Some(qualifier) => {
                            owner.map(|owner| self.canonical(owner)) == Some(qualifier)
                        }
                    }
                }
                _ => false,
            })
            .collect();
        for target in targets {
            self.flush_variable(values, hierarchy, target);
        }
    }

    /// Forget `owner.name` through every qualifier other than `keep`'s class.
    pub(crate) fn flush_aliases(
        &mut self,
        values: &mut ValueTable,
        hierarchy: &TypeHierarchy,
        owner: &str,
        name: &str,
        keep: ValueId,
    ) {
        let keep = self.canonical(keep);
        let targets: Vec<ValueId> = self
            .tracked_variables(values)
            .into_iter()
            .filter(|id| match values.as_variable(*id) {
                Some(VariableDescriptor::Field {
                    qualifier: Some(qualifier),
                    field,
                }) => {
                    field.owner == owner
                        && field.name == name
                        && self.canonical(*qualifier) != keep
                        && !self.are_distinct(*qualifier, keep)
                }
                _ => false,
            })
            .collect();
        for target in targets {
            self.flush_variable(values, hierarchy, target);
        }
    }

    /// Assume `left relation right` holds; `false` when it cannot.
    pub(crate) fn apply_relation(
        &mut self,
        values: &ValueTable,
        hierarchy: &TypeHierarchy,
        left: ValueId,
        relation: Relation,
        right: ValueId,
    ) -> bool {
        if let Some(outcome) = self.evaluate_relation(values, hierarchy, left, relation, right) {
            return outcome;
        }
        let left_facts = self.facts(values, hierarchy, left);
        let right_facts = self.facts(values, hierarchy, right);
        match relation {
            Relation::Eq => {
                if values.is_variable(left) && values.is_variable(right) {
                    return self.unite(values, hierarchy, left, right);
                }
                self.narrow(values, hierarchy, left, &equality_facts(&right_facts))
                    && self.narrow(values, hierarchy, right, &equality_facts(&left_facts))
            }
            Relation::Ne => {
                if values.is_variable(left)
                    && values.is_variable(right)
                    && !self.make_distinct(left, right)
                {
                    return false;
                }
                self.narrow(values, hierarchy, left, &inequality_facts(&left_facts, &right_facts))
                    && self.narrow(values, hierarchy, right, &inequality_facts(&right_facts, &left_facts))
            }
            _ => {
                let Some(left_range) = narrow_range(left_facts.range, relation, right_facts.range)
                else {
                    return false;
                };
                let Some(right_range) =
                    narrow_range(right_facts.range, relation.flip(), left_facts.range)
                else {
                    return false;
                };
                self.narrow(values, hierarchy, left, &range_facts(left_range))
                    && self.narrow(values, hierarchy, right, &range_facts(right_range))
            }
        }
    }

    /// Assume the boolean `id` has the given outcome; `false` when it cannot.
    pub(crate) fn apply_condition(
        &mut self,
        values: &ValueTable,
        hierarchy: &TypeHierarchy,
        id: ValueId,
        outcome: bool,
    ) -> bool {
        match values.descriptor(id).clone() {
            ValueDescriptor::Condition(Condition::Compare {
                left,
                relation,
                right,
            }) => {
                let relation = if outcome { relation } else { relation.negate() };
                self.apply_relation(values, hierarchy, left, relation, right)
            }
            ValueDescriptor::Condition(Condition::InstanceOf {
                value,
                class,
                negated,
            }) => self.apply_type_test(values, hierarchy, value, &class, outcome != negated),
            ValueDescriptor::Variable(_) => {
                self.narrow(values, hierarchy, id, &FactSet::boolean(outcome))
            }
            _ => self
                .facts(values, hierarchy, id)
                .truth()
                .is_none_or(|known| known == outcome),
        }
    }

    fn apply_type_test(
        &mut self,
        values: &ValueTable,
        hierarchy: &TypeHierarchy,
        value: ValueId,
        class: &str,
        positive: bool,
    ) -> bool {
        let facts = if positive {
            FactSet {
                types: TypeConstraint {
                    instance_of: BTreeSet::from([class.to_string()]),
                    ..TypeConstraint::default()
                },
                ..FactSet::not_null()
            }
        } else {
            FactSet {
                types: TypeConstraint {
                    not_instance_of: BTreeSet::from([class.to_string()]),
                    ..TypeConstraint::default()
                },
                ..FactSet::unknown()
            }
        };
        self.narrow(values, hierarchy, value, &facts)
    }

    /// Copy narrowed by a successful `instanceof`, or `None` when that branch is impossible.
    pub(crate) fn with_instance_of(
        &self,
        values: &ValueTable,
        hierarchy: &TypeHierarchy,
        value: ValueId,
        class: &str,
    ) -> Option<Self> {
        let mut narrowed = self.clone();
        narrowed
            .apply_type_test(values, hierarchy, value, class, true)
            .then_some(narrowed)
    }

    /// Copy narrowed by a failed `instanceof`, or `None` when that branch is impossible.
    pub(crate) fn without_instance_of(
        &self,
        values: &ValueTable,
        hierarchy: &TypeHierarchy,
        value: ValueId,
        class: &str,
    ) -> Option<Self> {
        let mut narrowed = self.clone();
        narrowed
            .apply_type_test(values, hierarchy, value, class, false)
            .then_some(narrowed)
    }

    /// Least upper bound of two states with equal merge keys.
    pub(crate) fn join(&self, other: &Self, values: &mut ValueTable, hierarchy: &TypeHierarchy) -> Self {
        let mut stack = Vec::with_capacity(self.stack.len());
        for (left, right) in self.stack.iter().zip(&other.stack) {
            if left == right {
                stack.push(*left);
                continue;
            }
            let joined = self
                .facts(values, hierarchy, *left)
                .join(&other.facts(values, hierarchy, *right));
            stack.push(values.facts(joined));
        }

        let mut tracked = self.tracked_variables(values);
        tracked.extend(other.tracked_variables(values));
        let mut groups: BTreeMap<(ValueId, ValueId), Vec<ValueId>> = BTreeMap::new();
        for variable in tracked {
            groups
                .entry((self.canonical(variable), other.canonical(variable)))
                .or_default()
                .push(variable);
        }

        let mut joined = MemoryState {
            stack,
            transfers: self.transfers.clone(),
            ..MemoryState::default()
        };
        for ((left, right), members) in &groups {
            let canonical = members[0];
            if members.len() > 1 {
                for member in members {
                    joined.classes.insert(*member, canonical);
                }
            }
            let facts = self
                .variable_facts(values, *left)
                .join(&other.variable_facts(values, *right));
            joined.store_facts(values, canonical, facts);
        }
        for (left, right) in &self.distinct {
            if other.are_distinct(*left, *right) {
                let left = joined.canonical(*left);
                let right = joined.canonical(*right);
                if left != right {
                    joined.distinct.insert(ordered(left, right));
                }
            }
        }
        joined
    }

    /// Widen range facts that grew relative to `previous`.
    pub(crate) fn widen(&self, previous: &Self, values: &mut ValueTable, hierarchy: &TypeHierarchy) -> Self {
        let mut widened = self.clone();
        for (variable, facts) in &self.facts {
            let before = previous.variable_facts(values, *variable);
            let after = facts.widen(&before);
            if after != *facts {
                widened.facts.insert(*variable, after);
            }
        }
        for (position, entry) in self.stack.iter().enumerate() {
            if values.is_variable(*entry) {
                continue;
            }
            let Some(before) = previous.stack.get(position) else {
                continue;
            };
            let current = self.facts(values, hierarchy, *entry);
            let after = current.widen(&previous.facts(values, hierarchy, *before));
            if after != current {
                widened.stack[position] = values.facts(after);
            }
        }
        widened
    }

    /// Every concrete state described by `other` is also described by `self`.
    pub(crate) fn is_superstate_of(&self, other: &Self, values: &ValueTable, hierarchy: &TypeHierarchy) -> bool {
        if self.merge_key() != other.merge_key() {
            return false;
        }
        for (mine, theirs) in self.stack.iter().zip(&other.stack) {
            if mine != theirs
                && !other
                    .facts(values, hierarchy, *theirs)
                    .is_within(&self.facts(values, hierarchy, *mine))
            {
                return false;
            }
        }
        let mut tracked = self.tracked_variables(values);
        tracked.extend(other.tracked_variables(values));
        for variable in tracked {
            if !other
                .variable_facts(values, variable)
                .is_within(&self.variable_facts(values, variable))
            {
                return false;
            }
        }
        for (member, canonical) in &self.classes {
            if !other.are_equal(*member, *canonical) {
                return false;
            }
        }
        self.distinct
            .iter()
            .all(|(left, right)| other.are_distinct(*left, *right))
    }
}

/// Facts an equality with a value of `facts` conveys to the other operand.
fn equality_facts(facts: &FactSet) -> FactSet {
    let nullability = match facts.nullability {
        Nullability::Null | Nullability::NotNull => facts.nullability,
        _ => Nullability::Unknown,
    };
    let mut conveyed = FactSet::with_nullability(nullability);
    conveyed.constant = facts.constant.clone();
    conveyed.range = facts.range;
    conveyed
}

/// Facts `own != other` conveys about the operand described by `own`.
fn inequality_facts(own: &FactSet, other: &FactSet) -> FactSet {
    let mut conveyed = FactSet::unknown();
    if other.nullability == Nullability::Null {
        conveyed.nullability = Nullability::NotNull;
    }
    if let Some(known) = other.truth() {
        conveyed.constant = Some(ConstValue::Bool(!known));
    }
    if let Some(Range { lo, hi }) = other.range {
        if lo == hi {
            if let Some(range) = narrow_range(own.range, Relation::Ne, other.range).flatten() {
                conveyed.range = Some(range);
            }
        }
    }
    conveyed
}

fn range_facts(range: Option<Range>) -> FactSet {
    let mut facts = FactSet::unknown();
    facts.range = range;
    facts
}

fn compare_ranges(left: Range, relation: Relation, right: Range) -> Option<bool> {
    match relation {
        Relation::Lt => {
            if left.hi < right.lo {
                Some(true)
            } else if left.lo >= right.hi {
                Some(false)
            } else {
                None
            }
        }
        Relation::Le => {
            if left.hi <= right.lo {
                Some(true)
            } else if left.lo > right.hi {
                Some(false)
            } else {
                None
            }
        }
        Relation::Gt | Relation::Ge => compare_ranges(right, relation.flip(), left),
        Relation::Eq | Relation::Ne => None,
    }
}

/// Range of `left` once `left relation right` is known to hold; `None` when impossible.
fn narrow_range(left: Option<Range>, relation: Relation, right: Option<Range>) -> Option<Option<Range>> {
    let (right_lo, right_hi) = Range::bounds(right);
    match relation {
        Relation::Lt => {
            let hi = right_hi.checked_sub(1)?;
            intersect_ranges(left, Range::bounded(i64::MIN, hi))
        }
        Relation::Le => intersect_ranges(left, Range::bounded(i64::MIN, right_hi)),
        Relation::Gt => {
            let lo = right_lo.checked_add(1)?;
            intersect_ranges(left, Range::bounded(lo, i64::MAX))
        }
        Relation::Ge => intersect_ranges(left, Range::bounded(right_lo, i64::MAX)),
        Relation::Eq => intersect_ranges(left, right),
        Relation::Ne => {
            if right_lo != right_hi {
                return Some(left);
            }
            let (left_lo, left_hi) = Range::bounds(left);
            if left_lo == right_lo && left_hi == right_lo {
                None
            } else if left_lo == right_lo {
                Some(Range::bounded(left_lo + 1, left_hi))
            } else if left_hi == right_lo {
                Some(Range::bounded(left_lo, left_hi - 1))
            } else {
                Some(left)
            }
        }
    }
}
