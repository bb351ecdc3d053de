use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Count parameters in a JVM method descriptor.
pub(crate) fn method_param_count(descriptor: &str) -> Result<usize> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor.parameter_types().len())
}

/// Return kind of a JVM method descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReturnKind {
    Void,
    Boolean,
    Primitive,
    Reference,
}

/// Determine the return kind from a JVM method descriptor.
pub(crate) fn method_return_kind(descriptor: &str) -> Result<ReturnKind> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let kind = match descriptor.return_type() {
        TypeDescriptor::Void => ReturnKind::Void,
        TypeDescriptor::Boolean => ReturnKind::Boolean,
        TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _) => ReturnKind::Reference,
        _ => ReturnKind::Primitive,
    };
    Ok(kind)
}

/// Value category of a parameter, as far as contracts care.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ParamKind {
    Reference,
    Boolean,
    Primitive,
}

/// Parameter layout: kinds in declaration order plus local slot numbers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodShape {
    pub(crate) params: Vec<ParamKind>,
    pub(crate) slots: Vec<u16>,
    pub(crate) return_kind: ReturnKind,
}

impl MethodShape {
    pub(crate) fn param_count(&self) -> usize {
        self.params.len()
    }
}

/// Parse the parameter layout of a descriptor, starting at the first free slot.
pub(crate) fn method_shape(descriptor: &str, is_static: bool) -> Result<MethodShape> {
    let parsed = MethodDescriptor::from_str(descriptor)
        .with_context(|| format!("parse method descriptor {descriptor}"))?;
    let mut slot: u16 = if is_static { 0 } else { 1 };
    let mut params = Vec::new();
    let mut slots = Vec::new();
    for param in parsed.parameter_types() {
        slots.push(slot);
        let (kind, width) = match param {
            TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _) => (ParamKind::Reference, 1),
            TypeDescriptor::Boolean => (ParamKind::Boolean, 1),
            TypeDescriptor::Long | TypeDescriptor::Double => (ParamKind::Primitive, 2),
            _ => (ParamKind::Primitive, 1),
        };
        params.push(kind);
        slot = slot.saturating_add(width);
    }
    Ok(MethodShape {
        params,
        slots,
        return_kind: method_return_kind(descriptor)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_parameters() {
        assert_eq!(
            method_param_count("(Ljava/lang/Object;I[J)V").expect("count"),
            3
        );
    }

    #[test]
    fn classifies_return_kinds() {
        assert_eq!(method_return_kind("()V").expect("void"), ReturnKind::Void);
        assert_eq!(method_return_kind("()Z").expect("bool"), ReturnKind::Boolean);
        assert_eq!(method_return_kind("()I").expect("int"), ReturnKind::Primitive);
        assert_eq!(
            method_return_kind("()[Ljava/lang/String;").expect("array"),
            ReturnKind::Reference
        );
    }

    #[test]
    fn wide_parameters_take_two_slots() {
        let shape = method_shape("(JLjava/lang/String;DZ)V", false).expect("shape");
        assert_eq!(shape.slots, vec![1, 3, 4, 6]);
        assert_eq!(
            shape.params,
            vec![
                ParamKind::Primitive,
                ParamKind::Reference,
                ParamKind::Primitive,
                ParamKind::Boolean
            ]
        );
    }

    #[test]
    fn rejects_malformed_descriptor() {
        assert!(method_shape("(Ljava/lang/String", true).is_err());
    }
}
