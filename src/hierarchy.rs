use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{ClassInfo, FieldRef, Nullness};

const OBJECT: &str = "java/lang/Object";

/// Known supertypes of the program's classes.
#[derive(Clone, Debug, Default)]
pub(crate) struct TypeHierarchy {
    classes: BTreeMap<String, ClassNode>,
}

#[derive(Clone, Debug)]
struct ClassNode {
    supertypes: Vec<String>,
    is_interface: bool,
}

impl TypeHierarchy {
    pub(crate) fn new(classes: &[ClassInfo]) -> Self {
        let mut nodes = BTreeMap::new();
        for class in classes {
            let mut supertypes = Vec::new();
            if let Some(super_name) = &class.super_name {
                supertypes.push(super_name.clone());
            }
            supertypes.extend(class.interfaces.iter().cloned());
            nodes.insert(
                class.name.clone(),
                ClassNode {
                    supertypes,
                    is_interface: class.is_interface,
                },
            );
        }
        Self { classes: nodes }
    }

    /// Whether `sub` is assignable to `sup`; `None` when the answer depends on unknown classes.
    pub(crate) fn is_subtype(&self, sub: &str, sup: &str) -> Option<bool> {
        if sub == sup || sup == OBJECT {
            return Some(true);
        }
        let mut complete = true;
        let mut seen = BTreeSet::new();
        let mut pending = vec![sub.to_string()];
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if current == sup {
                return Some(true);
            }
            if current == OBJECT {
                continue;
            }
            match self.classes.get(&current) {
                Some(node) => pending.extend(node.supertypes.iter().cloned()),
                None => complete = false,
            }
        }
        if complete { Some(false) } else { None }
    }

    /// Whether some object could be an instance of both types.
    pub(crate) fn may_intersect(&self, left: &str, right: &str) -> bool {
        if self.is_subtype(left, right) != Some(false) || self.is_subtype(right, left) != Some(false)
        {
            return true;
        }
        match (self.classes.get(left), self.classes.get(right)) {
            (Some(left), Some(right)) => left.is_interface || right.is_interface,
            _ => true,
        }
    }
}

/// Declared attributes of a field, looked up when a field variable is created.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct FieldAttributes {
    pub(crate) nullness: Nullness,
    pub(crate) is_final: bool,
    pub(crate) is_volatile: bool,
}

/// Field declarations indexed by owner and name.
#[derive(Clone, Debug, Default)]
pub(crate) struct FieldIndex {
    fields: BTreeMap<(String, String), FieldAttributes>,
    supers: BTreeMap<String, String>,
}

impl FieldIndex {
    pub(crate) fn new(classes: &[ClassInfo]) -> Self {
        let mut fields = BTreeMap::new();
        let mut supers = BTreeMap::new();
        for class in classes {
            for field in &class.fields {
                fields.insert(
                    (class.name.clone(), field.name.clone()),
                    FieldAttributes {
                        nullness: field.nullness,
                        is_final: field.is_final,
                        is_volatile: field.is_volatile,
                    },
                );
            }
            if let Some(super_name) = &class.super_name {
                supers.insert(class.name.clone(), super_name.clone());
            }
        }
        Self { fields, supers }
    }

    /// Resolve a field through the superclass chain; unknown fields get default attributes.
    pub(crate) fn lookup(&self, field: &FieldRef) -> FieldAttributes {
        let mut owner = field.owner.clone();
        let mut seen = BTreeSet::new();
        loop {
            if let Some(attributes) = self.fields.get(&(owner.clone(), field.name.clone())) {
                return *attributes;
            }
            if !seen.insert(owner.clone()) {
                return FieldAttributes::default();
            }
            match self.supers.get(&owner) {
                Some(parent) => owner = parent.clone(),
                None => return FieldAttributes::default(),
            }
        }
    }
}
