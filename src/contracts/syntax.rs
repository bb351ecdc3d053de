use std::fmt;

use anyhow::{Context, Result, bail};

use crate::dataflow::facts::FactSet;

/// Constraint on one argument in a contract guard.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum ValueConstraint {
    Any,
    Null,
    NotNull,
    True,
    False,
}

impl ValueConstraint {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "_" => Some(ValueConstraint::Any),
            "null" => Some(ValueConstraint::Null),
            "!null" => Some(ValueConstraint::NotNull),
            "true" => Some(ValueConstraint::True),
            "false" => Some(ValueConstraint::False),
            _ => None,
        }
    }

    /// The opposite constraint; `Any` has none.
    pub(crate) fn negate(self) -> Option<Self> {
        match self {
            ValueConstraint::Any => None,
            ValueConstraint::Null => Some(ValueConstraint::NotNull),
            ValueConstraint::NotNull => Some(ValueConstraint::Null),
            ValueConstraint::True => Some(ValueConstraint::False),
            ValueConstraint::False => Some(ValueConstraint::True),
        }
    }

    /// Facts an argument gains once the constraint is known to hold.
    pub(crate) fn facts(self) -> FactSet {
        match self {
            ValueConstraint::Any => FactSet::unknown(),
            ValueConstraint::Null => FactSet::null(),
            ValueConstraint::NotNull => FactSet::not_null(),
            ValueConstraint::True => FactSet::boolean(true),
            ValueConstraint::False => FactSet::boolean(false),
        }
    }
}

impl fmt::Display for ValueConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValueConstraint::Any => "_",
            ValueConstraint::Null => "null",
            ValueConstraint::NotNull => "!null",
            ValueConstraint::True => "true",
            ValueConstraint::False => "false",
        };
        f.write_str(text)
    }
}

/// Outcome of a contract clause. `Param` is zero-based.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum ContractEffect {
    Null,
    NotNull,
    True,
    False,
    Fail,
    New,
    This,
    Param(usize),
}

impl ContractEffect {
    fn parse(text: &str, param_count: usize) -> Result<Self> {
        let effect = match text {
            "null" => ContractEffect::Null,
            "!null" => ContractEffect::NotNull,
            "true" => ContractEffect::True,
            "false" => ContractEffect::False,
            "fail" => ContractEffect::Fail,
            "new" => ContractEffect::New,
            "this" => ContractEffect::This,
            other => {
                let Some(number) = other.strip_prefix("param") else {
                    bail!("unknown contract effect `{other}`");
                };
                let number: usize = number
                    .parse()
                    .with_context(|| format!("parse parameter number in `{other}`"))?;
                if number == 0 || number > param_count {
                    bail!("`{other}` is out of range for {param_count} parameters");
                }
                ContractEffect::Param(number - 1)
            }
        };
        Ok(effect)
    }

    /// Constraint the returned value satisfies under this effect, if any.
    pub(crate) fn as_constraint(self) -> Option<ValueConstraint> {
        match self {
            ContractEffect::Null => Some(ValueConstraint::Null),
            ContractEffect::NotNull | ContractEffect::New | ContractEffect::This => {
                Some(ValueConstraint::NotNull)
            }
            ContractEffect::True => Some(ValueConstraint::True),
            ContractEffect::False => Some(ValueConstraint::False),
            ContractEffect::Fail | ContractEffect::Param(_) => None,
        }
    }
}

impl fmt::Display for ContractEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractEffect::Null => f.write_str("null"),
            ContractEffect::NotNull => f.write_str("!null"),
            ContractEffect::True => f.write_str("true"),
            ContractEffect::False => f.write_str("false"),
            ContractEffect::Fail => f.write_str("fail"),
            ContractEffect::New => f.write_str("new"),
            ContractEffect::This => f.write_str("this"),
            ContractEffect::Param(index) => write!(f, "param{}", index + 1),
        }
    }
}

/// One guarded rule: when every argument matches, the call has `effect`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct ContractClause {
    pub(crate) arguments: Vec<ValueConstraint>,
    pub(crate) effect: ContractEffect,
}

impl fmt::Display for ContractClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arguments: Vec<String> = self.arguments.iter().map(ToString::to_string).collect();
        if arguments.is_empty() {
            write!(f, "-> {}", self.effect)
        } else {
            write!(f, "{} -> {}", arguments.join(", "), self.effect)
        }
    }
}

/// Ordered clauses; the first matching one applies.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct MethodContract {
    pub(crate) clauses: Vec<ContractClause>,
}

impl MethodContract {
    pub(crate) fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

impl fmt::Display for MethodContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clauses: Vec<String> = self.clauses.iter().map(ToString::to_string).collect();
        f.write_str(&clauses.join("; "))
    }
}

/// Parse contract text such as `null, _ -> fail; _, !null -> param2`.
pub(crate) fn parse_contract(text: &str, param_count: usize) -> Result<MethodContract> {
    let mut clauses = Vec::new();
    for clause in text.split(';').map(str::trim).filter(|clause| !clause.is_empty()) {
        let Some((guard, effect)) = clause.split_once("->") else {
            bail!("contract clause `{clause}` has no `->`");
        };
        let guard = guard.trim();
        let arguments: Vec<ValueConstraint> = if guard.is_empty() {
            Vec::new()
        } else {
            guard
                .split(',')
                .map(str::trim)
                .map(|argument| {
                    ValueConstraint::parse(argument)
                        .with_context(|| format!("unknown constraint `{argument}` in `{clause}`"))
                })
                .collect::<Result<_>>()?
        };
        if arguments.len() != param_count {
            bail!(
                "contract clause `{clause}` has {} constraints but the method takes {param_count} parameters",
                arguments.len()
            );
        }
        let effect = ContractEffect::parse(effect.trim(), param_count)
            .with_context(|| format!("parse contract clause `{clause}`"))?;
        clauses.push(ContractClause { arguments, effect });
    }
    Ok(MethodContract { clauses })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_contract_text() {
        let contract = parse_contract("null, _ -> fail; _, !null -> param2", 2).expect("contract");
        assert_eq!(contract.clauses.len(), 2);
        assert_eq!(contract.clauses[1].effect, ContractEffect::Param(1));
        assert_eq!(contract.to_string(), "null, _ -> fail; _, !null -> param2");
    }

    #[test]
    fn parses_zero_argument_contract() {
        let contract = parse_contract(" -> new", 0).expect("contract");
        assert_eq!(contract.clauses[0].effect, ContractEffect::New);
        assert_eq!(contract.to_string(), "-> new");
    }

    #[test]
    fn rejects_arity_mismatch_and_bad_parameters() {
        assert!(parse_contract("null -> fail", 2).is_err());
        assert!(parse_contract("_ -> param2", 1).is_err());
        assert!(parse_contract("maybe -> true", 1).is_err());
        assert!(parse_contract("_ true", 1).is_err());
    }
}
