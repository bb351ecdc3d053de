use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};

use crate::dataflow::facts::{ConstValue, FactSet, Nullability};
use crate::ir::{BinaryOp, Nullness};

/// Interned abstract value; an index into the run's value table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct ValueId(u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Field identity plus the declared attributes that shape its default facts.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct FieldKey {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) nullness: Nullness,
    /// Final fields survive flushes.
    pub(crate) stable: bool,
}

/// A storage location whose content the state tracks.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum VariableDescriptor {
    Receiver,
    Local(u16),
    /// Value of the parameter at method entry; never reassigned.
    ParameterEntry(u16),
    Field {
        qualifier: Option<ValueId>,
        field: FieldKey,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum Relation {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Relation {
    pub(crate) fn from_op(operator: BinaryOp) -> Option<Self> {
        match operator {
            BinaryOp::Eq => Some(Relation::Eq),
            BinaryOp::Ne => Some(Relation::Ne),
            BinaryOp::Lt => Some(Relation::Lt),
            BinaryOp::Le => Some(Relation::Le),
            BinaryOp::Gt => Some(Relation::Gt),
            BinaryOp::Ge => Some(Relation::Ge),
            _ => None,
        }
    }

    pub(crate) fn negate(self) -> Self {
        match self {
            Relation::Eq => Relation::Ne,
            Relation::Ne => Relation::Eq,
            Relation::Lt => Relation::Ge,
            Relation::Le => Relation::Gt,
            Relation::Gt => Relation::Le,
            Relation::Ge => Relation::Lt,
        }
    }

    /// Same relation with operands swapped.
    pub(crate) fn flip(self) -> Self {
        match self {
            Relation::Lt => Relation::Gt,
            Relation::Le => Relation::Ge,
            Relation::Gt => Relation::Lt,
            Relation::Ge => Relation::Le,
            other => other,
        }
    }

    pub(crate) fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Relation::Eq => ordering == Equal,
            Relation::Ne => ordering != Equal,
            Relation::Lt => ordering == Less,
            Relation::Le => ordering != Greater,
            Relation::Gt => ordering == Greater,
            Relation::Ge => ordering != Less,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Relation::Eq => "==",
            Relation::Ne => "!=",
            Relation::Lt => "<",
            Relation::Le => "<=",
            Relation::Gt => ">",
            Relation::Ge => ">=",
        };
        f.write_str(text)
    }
}

/// Symbolic boolean produced by a comparison or type test.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum Condition {
    Compare {
        left: ValueId,
        relation: Relation,
        right: ValueId,
    },
    InstanceOf {
        value: ValueId,
        class: String,
        negated: bool,
    },
}

impl Condition {
    pub(crate) fn negate(&self) -> Self {
        match self {
            Condition::Compare {
                left,
                relation,
                right,
            } => Condition::Compare {
                left: *left,
                relation: relation.negate(),
                right: *right,
            },
            Condition::InstanceOf {
                value,
                class,
                negated,
            } => Condition::InstanceOf {
                value: *value,
                class: class.clone(),
                negated: !negated,
            },
        }
    }

    fn operands(&self) -> Vec<ValueId> {
        match self {
            Condition::Compare { left, right, .. } => vec![*left, *right],
            Condition::InstanceOf { value, .. } => vec![*value],
        }
    }
}

/// What an interned value stands for.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum ValueDescriptor {
    Constant(ConstValue),
    Variable(VariableDescriptor),
    /// Anonymous value known only through its facts.
    Facts(FactSet),
    Condition(Condition),
}

/// Per-run interning table for abstract values.
#[derive(Clone, Debug, Default)]
pub(crate) struct ValueTable {
    descriptors: Vec<ValueDescriptor>,
    index: BTreeMap<ValueDescriptor, ValueId>,
}

impl ValueTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the id for `descriptor`, creating it on first use.
    pub(crate) fn intern(&mut self, descriptor: ValueDescriptor) -> ValueId {
        if let Some(id) = self.index.get(&descriptor) {
            return *id;
        }
        let id = ValueId(self.descriptors.len() as u32);
        self.descriptors.push(descriptor.clone());
        self.index.insert(descriptor, id);
        id
    }

    pub(crate) fn variable(&mut self, variable: VariableDescriptor) -> ValueId {
        self.intern(ValueDescriptor::Variable(variable))
    }

    pub(crate) fn constant(&mut self, value: ConstValue) -> ValueId {
        self.intern(ValueDescriptor::Constant(value))
    }

    pub(crate) fn facts(&mut self, facts: FactSet) -> ValueId {
        self.intern(ValueDescriptor::Facts(facts))
    }

    pub(crate) fn condition(&mut self, condition: Condition) -> ValueId {
        self.intern(ValueDescriptor::Condition(condition))
    }

    pub(crate) fn descriptor(&self, id: ValueId) -> &ValueDescriptor {
        &self.descriptors[id.0 as usize]
    }

    pub(crate) fn as_variable(&self, id: ValueId) -> Option<&VariableDescriptor> {
        match self.descriptor(id) {
            ValueDescriptor::Variable(variable) => Some(variable),
            _ => None,
        }
    }

    pub(crate) fn is_variable(&self, id: ValueId) -> bool {
        self.as_variable(id).is_some()
    }

    pub(crate) fn is_field(&self, id: ValueId) -> bool {
        matches!(self.as_variable(id), Some(VariableDescriptor::Field { .. }))
    }

    /// Facts a variable holds before anything is known about it.
    pub(crate) fn default_facts(&self, id: ValueId) -> FactSet {
        match self.descriptor(id) {
            ValueDescriptor::Variable(VariableDescriptor::Receiver) => FactSet::not_null(),
            ValueDescriptor::Variable(VariableDescriptor::Field { field, .. }) => {
                FactSet::declared(field.nullness)
            }
            ValueDescriptor::Variable(_) => FactSet::unknown(),
            ValueDescriptor::Constant(value) => FactSet::constant(value.clone()),
            ValueDescriptor::Facts(facts) => facts.clone(),
            ValueDescriptor::Condition(_) => FactSet::with_nullability(Nullability::NotNull),
        }
    }

    /// Number of field dereferences needed to reach this value.
    pub(crate) fn field_depth(&self, id: ValueId) -> usize {
        match self.as_variable(id) {
            Some(VariableDescriptor::Field {
                qualifier: Some(qualifier),
                ..
            }) => 1 + self.field_depth(*qualifier),
            Some(VariableDescriptor::Field { qualifier: None, .. }) => 1,
            _ => 0,
        }
    }

    /// Whether `id` reads through `variable`, directly or via qualifiers and condition operands.
    pub(crate) fn depends_on(&self, id: ValueId, variable: ValueId) -> bool {
        if id == variable {
            return true;
        }
        match self.descriptor(id) {
            ValueDescriptor::Variable(VariableDescriptor::Field {
                qualifier: Some(qualifier),
                ..
            }) => self.depends_on(*qualifier, variable),
            ValueDescriptor::Condition(condition) => condition
                .operands()
                .into_iter()
                .any(|operand| self.depends_on(operand, variable)),
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Every descriptor must map back to the id it was stored under.
    pub(crate) fn check_consistency(&self) -> Result<()> {
        if self.index.len() != self.descriptors.len() {
            bail!(
                "value table holds {} descriptors but {} index entries",
                self.descriptors.len(),
                self.index.len()
            );
        }
        for (position, descriptor) in self.descriptors.iter().enumerate() {
            match self.index.get(descriptor) {
                Some(id) if id.0 as usize == position => {}
                Some(id) => bail!("descriptor at {position} is interned as {id}"),
                None => bail!("descriptor at {position} is missing from the index"),
            }
        }
        Ok(())
    }

    /// Human-readable name for explanations.
    pub(crate) fn describe(&self, id: ValueId) -> String {
        match self.descriptor(id) {
            ValueDescriptor::Constant(value) => value.to_string(),
            ValueDescriptor::Variable(VariableDescriptor::Receiver) => "this".to_string(),
            ValueDescriptor::Variable(VariableDescriptor::Local(index)) => {
                format!("local {index}")
            }
            ValueDescriptor::Variable(VariableDescriptor::ParameterEntry(index)) => {
                format!("parameter {}", index + 1)
            }
            ValueDescriptor::Variable(VariableDescriptor::Field {
                qualifier: Some(qualifier),
                field,
            }) => format!("{}.{}", self.describe(*qualifier), field.name),
            ValueDescriptor::Variable(VariableDescriptor::Field {
                qualifier: None,
                field,
            }) => format!("{}.{}", field.owner, field.name),
            ValueDescriptor::Facts(facts) if facts.nullability == Nullability::Null => {
                "null".to_string()
            }
            ValueDescriptor::Facts(_) => "value".to_string(),
            ValueDescriptor::Condition(Condition::Compare {
                left,
                relation,
                right,
            }) => format!(
                "{} {} {}",
                self.describe(*left),
                relation,
                self.describe(*right)
            ),
            ValueDescriptor::Condition(Condition::InstanceOf {
                value,
                class,
                negated,
            }) => {
                let prefix = if *negated { "!" } else { "" };
                format!("{prefix}({} instanceof {class})", self.describe(*value))
            }
        }
    }
}
