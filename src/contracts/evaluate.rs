use crate::contracts::syntax::{ContractClause, ContractEffect, MethodContract, ValueConstraint};
use crate::dataflow::facts::{FactSet, Nullability};

/// Whether a guard holds for given argument facts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum GuardStatus {
    Proven,
    Impossible,
    Undecided,
}

pub(crate) fn constraint_status(constraint: ValueConstraint, facts: &FactSet) -> GuardStatus {
    let decided = |holds: bool| {
        if holds {
            GuardStatus::Proven
        } else {
            GuardStatus::Impossible
        }
    };
    match constraint {
        ValueConstraint::Any => GuardStatus::Proven,
        ValueConstraint::Null | ValueConstraint::NotNull => match facts.nullability {
            Nullability::Null => decided(constraint == ValueConstraint::Null),
            Nullability::NotNull => decided(constraint == ValueConstraint::NotNull),
            Nullability::Unknown | Nullability::Nullable => GuardStatus::Undecided,
        },
        ValueConstraint::True | ValueConstraint::False => match facts.truth() {
            Some(value) => decided(value == (constraint == ValueConstraint::True)),
            None => GuardStatus::Undecided,
        },
    }
}

/// Status of a whole clause guard. A constraint on the varargs slot is never proven.
pub(crate) fn clause_status(
    clause: &ContractClause,
    arguments: &[FactSet],
    varargs_slot: Option<usize>,
) -> GuardStatus {
    let mut status = GuardStatus::Proven;
    for (index, constraint) in clause.arguments.iter().enumerate() {
        let Some(facts) = arguments.get(index) else {
            return GuardStatus::Undecided;
        };
        match constraint_status(*constraint, facts) {
            GuardStatus::Impossible => return GuardStatus::Impossible,
            GuardStatus::Undecided => status = GuardStatus::Undecided,
            GuardStatus::Proven
                if varargs_slot == Some(index) && *constraint != ValueConstraint::Any =>
            {
                status = GuardStatus::Undecided;
            }
            GuardStatus::Proven => {}
        }
    }
    status
}

/// The only constraint of a guard that the argument facts leave open.
///
/// `None` when no constraint or more than one is open. A constraint on the
/// varargs slot always counts as open.
pub(crate) fn open_constraint(
    clause: &ContractClause,
    arguments: &[FactSet],
    varargs_slot: Option<usize>,
) -> Option<(usize, ValueConstraint)> {
    let mut open = clause
        .arguments
        .iter()
        .copied()
        .enumerate()
        .filter(|(index, constraint)| {
            *constraint != ValueConstraint::Any
                && (varargs_slot == Some(*index)
                    || arguments.get(*index).is_none_or(|facts| {
                        constraint_status(*constraint, facts) != GuardStatus::Proven
                    }))
        });
    let first = open.next()?;
    open.next().is_none().then_some(first)
}

/// Result of applying a contract to a call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Evaluation {
    Effect(ContractEffect),
    Fails,
    NoMatch,
}

/// First clause not ruled out by the argument facts decides; it must be proven to fire.
pub(crate) fn evaluate(
    contract: &MethodContract,
    arguments: &[FactSet],
    varargs_slot: Option<usize>,
) -> Evaluation {
    for clause in &contract.clauses {
        match clause_status(clause, arguments, varargs_slot) {
            GuardStatus::Impossible => continue,
            GuardStatus::Undecided => return Evaluation::NoMatch,
            GuardStatus::Proven => {
                return match clause.effect {
                    ContractEffect::Fail => Evaluation::Fails,
                    effect => Evaluation::Effect(effect),
                };
            }
        }
    }
    Evaluation::NoMatch
}
