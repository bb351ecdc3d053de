use tracing::debug;

use crate::contracts::ContractCache;
use crate::contracts::evaluate::{
    Evaluation, GuardStatus, clause_status, constraint_status, evaluate, open_constraint,
};
use crate::contracts::syntax::{ContractClause, ContractEffect, MethodContract, ValueConstraint};
use crate::dataflow::context::AnalysisContext;
use crate::dataflow::facts::{FactSet, Marker, Nullability, join_reached};
use crate::dataflow::state::MemoryState;
use crate::dataflow::value::{ValueId, VariableDescriptor};
use crate::dataflow::worklist::{ExitKind, Terminal};
use crate::descriptor::{ParamKind, ReturnKind, method_shape};
use crate::ir::{CallKind, CallSite, InstructionKind, Method};

/// Lower ranks are more specific; the most specific common effect wins.
fn specificity(effect: ContractEffect) -> (u8, usize) {
    match effect {
        ContractEffect::Fail => (0, 0),
        ContractEffect::Param(index) => (1, index),
        ContractEffect::This => (2, 0),
        ContractEffect::New => (3, 0),
        ContractEffect::Null => (4, 0),
        ContractEffect::True => (5, 0),
        ContractEffect::False => (5, 1),
        ContractEffect::NotNull => (6, 0),
    }
}

/// Parameter-entry variables and the kind of each parameter.
struct Parameters {
    entries: Vec<ValueId>,
    kinds: Vec<ParamKind>,
    receiver: Option<ValueId>,
    varargs_slot: Option<usize>,
}

impl Parameters {
    fn new(cx: &mut AnalysisContext<'_>) -> Self {
        let kinds = cx.shape.params.clone();
        let entries = (0..kinds.len())
            .map(|index| cx.variable(VariableDescriptor::ParameterEntry(index as u16)))
            .collect();
        let receiver =
            (!cx.method.access.is_static).then(|| cx.variable(VariableDescriptor::Receiver));
        let varargs_slot = (cx.method.access.is_varargs && !kinds.is_empty())
            .then(|| kinds.len() - 1);
        Self {
            entries,
            kinds,
            receiver,
            varargs_slot,
        }
    }

    /// Single-parameter guards worth trying, in parameter order.
    fn candidates(&self) -> Vec<(usize, ValueConstraint)> {
        let mut candidates = Vec::new();
        for (index, kind) in self.kinds.iter().enumerate() {
            if self.varargs_slot == Some(index) {
                continue;
            }
            match kind {
                ParamKind::Reference => {
                    candidates.push((index, ValueConstraint::Null));
                    candidates.push((index, ValueConstraint::NotNull));
                }
                ParamKind::Boolean => {
                    candidates.push((index, ValueConstraint::True));
                    candidates.push((index, ValueConstraint::False));
                }
                ParamKind::Primitive => {}
            }
        }
        candidates
    }
}

/// Summarize terminal states into a contract that holds on every observed path.
///
/// Returns `None` when nothing beyond the declared signature can be said.
pub(crate) fn infer_contract(
    cx: &mut AnalysisContext<'_>,
    terminals: &[Terminal],
) -> Option<MethodContract> {
    if terminals.is_empty() {
        return None;
    }
    let parameters = Parameters::new(cx);
    let universal = common_effect(cx, &parameters, terminals, &[]);
    let reached = reached_facts(cx, &parameters, terminals);

    let mut clauses = Vec::new();
    let mut emitted = Vec::new();
    for (index, constraint) in parameters.candidates() {
        // No terminal can satisfy a guard the joined facts already rule out.
        if reached[index]
            .as_ref()
            .is_some_and(|facts| constraint_status(constraint, facts) == GuardStatus::Impossible)
        {
            continue;
        }
        let Some(effect) = common_effect(cx, &parameters, terminals, &[(index, constraint)])
        else {
            continue;
        };
        if Some(effect) == universal {
            continue;
        }
        clauses.push(clause(parameters.kinds.len(), &[(index, constraint)], effect));
        emitted.push((index, constraint));
    }

    let fallback = match universal {
        Some(effect) => Some(effect),
        None if !emitted.is_empty() => {
            let negated: Option<Vec<(usize, ValueConstraint)>> = emitted
                .iter()
                .map(|(index, constraint)| constraint.negate().map(|negated| (*index, negated)))
                .collect();
            negated.and_then(|negated| common_effect(cx, &parameters, terminals, &negated))
        }
        None => None,
    };
    if let Some(effect) = fallback {
        clauses.push(clause(parameters.kinds.len(), &[], effect));
    }
    if clauses.is_empty() {
        return None;
    }
    let contract = MethodContract { clauses };
    if let Some(terminal) = terminals
        .iter()
        .find(|terminal| !describes(cx, &parameters, &contract, terminal))
    {
        debug!(
            "dropping inferred contract {} for {}: contradicted at offset {}",
            contract, cx.method.id, terminal.offset
        );
        return None;
    }
    Some(contract)
}

/// Parameter facts joined over every terminal state.
fn reached_facts(
    cx: &AnalysisContext<'_>,
    parameters: &Parameters,
    terminals: &[Terminal],
) -> Vec<Option<FactSet>> {
    parameters
        .entries
        .iter()
        .map(|entry| {
            terminals.iter().fold(None, |joined, terminal| {
                let facts = cx.facts(&terminal.state, *entry);
                join_reached(joined.as_ref(), Some(&facts))
            })
        })
        .collect()
}

/// Whether applying `contract` to this terminal's parameter facts agrees with how it exited.
fn describes(
    cx: &AnalysisContext<'_>,
    parameters: &Parameters,
    contract: &MethodContract,
    terminal: &Terminal,
) -> bool {
    let arguments = argument_facts(cx, parameters, &terminal.state);
    match evaluate(contract, &arguments, parameters.varargs_slot) {
        Evaluation::NoMatch => true,
        Evaluation::Fails => terminal.kind == ExitKind::Throw,
        Evaluation::Effect(effect) => {
            terminal_effects(cx, parameters, &terminal.state, terminal.kind).contains(&effect)
        }
    }
}

fn clause(
    param_count: usize,
    guard: &[(usize, ValueConstraint)],
    effect: ContractEffect,
) -> ContractClause {
    let mut arguments = vec![ValueConstraint::Any; param_count];
    for (index, constraint) in guard {
        arguments[*index] = *constraint;
    }
    ContractClause { arguments, effect }
}

/// Most specific effect shared by every terminal compatible with `guard`.
///
/// `None` when no terminal is compatible or the terminals disagree.
fn common_effect(
    cx: &AnalysisContext<'_>,
    parameters: &Parameters,
    terminals: &[Terminal],
    guard: &[(usize, ValueConstraint)],
) -> Option<ContractEffect> {
    let mut common: Option<Vec<ContractEffect>> = None;
    for terminal in terminals {
        let mut state = terminal.state.clone();
        let compatible = guard.iter().all(|(index, constraint)| {
            cx.narrow(&mut state, parameters.entries[*index], &constraint.facts())
        });
        if !compatible {
            continue;
        }
        let effects = terminal_effects(cx, parameters, &state, terminal.kind);
        common = Some(match common {
            None => effects,
            Some(previous) => previous
                .into_iter()
                .filter(|effect| effects.contains(effect))
                .collect(),
        });
    }
    common?.into_iter().min_by_key(|effect| specificity(*effect))
}

fn argument_facts(
    cx: &AnalysisContext<'_>,
    parameters: &Parameters,
    state: &MemoryState,
) -> Vec<FactSet> {
    parameters
        .entries
        .iter()
        .map(|entry| state.lookup(&cx.values, *entry).1)
        .collect()
}

/// Exit whose state contradicts a clause of the declared contract.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ContractMismatch {
    pub(crate) offset: u32,
    pub(crate) clause: ContractClause,
    /// What the exit did instead.
    pub(crate) observed: String,
}

/// Check the method's exits against its declared contract.
///
/// An exit counts for a clause when its state survives narrowing by the
/// clause guard and by the negation of every earlier clause that may still
/// apply. Only provable disagreements are reported.
pub(crate) fn check_declared_contract(
    cx: &mut AnalysisContext<'_>,
    contract: &MethodContract,
    terminals: &[Terminal],
) -> Vec<ContractMismatch> {
    let parameters = Parameters::new(cx);
    let mut mismatches = Vec::new();
    for terminal in terminals {
        for (position, clause) in contract.clauses.iter().enumerate() {
            let guards_varargs = parameters.varargs_slot.is_some_and(|slot| {
                clause
                    .arguments
                    .get(slot)
                    .is_some_and(|constraint| *constraint != ValueConstraint::Any)
            });
            if guards_varargs {
                continue;
            }
            let Some(state) = clause_state(
                cx,
                &parameters,
                &contract.clauses[..position],
                clause,
                &terminal.state,
            ) else {
                continue;
            };
            if let Some(observed) = contradiction(cx, &parameters, clause.effect, &state, terminal.kind)
            {
                mismatches.push(ContractMismatch {
                    offset: terminal.offset,
                    clause: clause.clone(),
                    observed,
                });
            }
        }
    }
    mismatches
}

/// Exit state restricted to the calls `clause` decides, or `None` when it decides none of them.
fn clause_state(
    cx: &AnalysisContext<'_>,
    parameters: &Parameters,
    earlier: &[ContractClause],
    clause: &ContractClause,
    state: &MemoryState,
) -> Option<MemoryState> {
    let mut state = state.clone();
    for previous in earlier {
        let arguments = argument_facts(cx, parameters, &state);
        match clause_status(previous, &arguments, parameters.varargs_slot) {
            GuardStatus::Proven => return None,
            GuardStatus::Impossible => {}
            GuardStatus::Undecided => {
                if let Some((index, constraint)) =
                    open_constraint(previous, &arguments, parameters.varargs_slot)
                {
                    if let Some(negated) = constraint
                        .negate()
                        .filter(|_| parameters.varargs_slot != Some(index))
                    {
                        if !cx.narrow(&mut state, parameters.entries[index], &negated.facts()) {
                            return None;
                        }
                    }
                }
            }
        }
    }
    for (index, constraint) in clause.arguments.iter().enumerate() {
        if *constraint == ValueConstraint::Any {
            continue;
        }
        let entry = *parameters.entries.get(index)?;
        if !cx.narrow(&mut state, entry, &constraint.facts()) {
            return None;
        }
    }
    Some(state)
}

/// Description of how the exit disagrees with `effect`, when it provably does.
fn contradiction(
    cx: &AnalysisContext<'_>,
    parameters: &Parameters,
    effect: ContractEffect,
    state: &MemoryState,
    kind: ExitKind,
) -> Option<String> {
    if kind == ExitKind::Throw {
        return None;
    }
    if effect == ContractEffect::Fail {
        return Some("a normal return".to_string());
    }
    if cx.shape.return_kind == ReturnKind::Void {
        return None;
    }
    let value = state.peek()?;
    let facts = cx.facts(state, value);
    let disagrees = match effect {
        ContractEffect::Param(index) => {
            let entry = *parameters.entries.get(index)?;
            state.are_distinct(value, entry)
                || cx
                    .facts(state, entry)
                    .meet(&facts, &cx.env.hierarchy)
                    .is_none()
        }
        effect => {
            let constraint = effect.as_constraint()?;
            constraint_status(constraint, &facts) == GuardStatus::Impossible
        }
    };
    disagrees.then(|| format!("a return of {facts}"))
}

/// Every effect that describes how this terminal state left the method.
fn terminal_effects(
    cx: &AnalysisContext<'_>,
    parameters: &Parameters,
    state: &MemoryState,
    kind: ExitKind,
) -> Vec<ContractEffect> {
    if kind == ExitKind::Throw {
        return vec![ContractEffect::Fail];
    }
    let Some(value) = state.peek() else {
        return Vec::new();
    };
    let facts = cx.facts(state, value);
    let mut effects = Vec::new();
    match cx.shape.return_kind {
        ReturnKind::Void | ReturnKind::Primitive => {}
        ReturnKind::Boolean => match facts.truth() {
            Some(true) => effects.push(ContractEffect::True),
            Some(false) => effects.push(ContractEffect::False),
            None => {}
        },
        ReturnKind::Reference => {
            for (index, entry) in parameters.entries.iter().enumerate() {
                if parameters.kinds[index] == ParamKind::Reference
                    && state.are_equal(value, *entry)
                {
                    effects.push(ContractEffect::Param(index));
                }
            }
            if parameters
                .receiver
                .is_some_and(|receiver| state.are_equal(value, receiver))
            {
                effects.push(ContractEffect::This);
            }
            if facts.has_marker(Marker::Fresh) {
                effects.push(ContractEffect::New);
            }
            match facts.nullability {
                Nullability::Null => effects.push(ContractEffect::Null),
                Nullability::NotNull => effects.push(ContractEffect::NotNull),
                Nullability::Unknown | Nullability::Nullable => {}
            }
        }
    }
    effects
}

/// Contract of a method whose body only forwards its parameters to another call.
///
/// Argument positions are remapped to the caller's parameters; the callee's
/// contract is reused verbatim when the mapping is the identity.
pub(crate) fn delegated_contract(
    method: &Method,
    contracts: &ContractCache,
) -> Option<MethodContract> {
    let mut loads = Vec::new();
    let mut call: Option<&CallSite> = None;
    let mut returns = false;
    for block in &method.cfg.blocks {
        for instruction in &block.instructions {
            match &instruction.kind {
                InstructionKind::Load { index } if call.is_none() => loads.push(*index),
                InstructionKind::Invoke { call: site } if call.is_none() => call = Some(site),
                InstructionKind::Return | InstructionKind::ReturnVoid
                    if call.is_some() && !returns =>
                {
                    returns = true;
                }
                _ => return None,
            }
        }
    }
    let call = call?;
    if !returns {
        return None;
    }
    let caller = method_shape(&method.id.descriptor, method.access.is_static).ok()?;
    let callee = method_shape(&call.descriptor, call.kind == CallKind::Static).ok()?;
    if (caller.return_kind == ReturnKind::Void) != (callee.return_kind == ReturnKind::Void) {
        return None;
    }
    let contract = contracts.contract(&call.method_id())?;

    let receiver_slot = if call.kind == CallKind::Static {
        None
    } else {
        Some(*loads.first()?)
    };
    let argument_slots = &loads[usize::from(receiver_slot.is_some())..];
    if argument_slots.len() != callee.param_count() {
        return None;
    }
    let mapping: Option<Vec<usize>> = argument_slots
        .iter()
        .map(|slot| caller.slots.iter().position(|candidate| candidate == slot))
        .collect();
    let mapping = mapping?;
    let receiver_is_this = !method.access.is_static && receiver_slot == Some(0);

    let identity = mapping.len() == caller.param_count()
        && mapping.iter().enumerate().all(|(index, mapped)| index == *mapped);
    if identity && (receiver_slot.is_none() || receiver_is_this) {
        return Some(contract);
    }

    let mut clauses = Vec::new();
    for callee_clause in &contract.clauses {
        let mut arguments = vec![ValueConstraint::Any; caller.param_count()];
        for (index, constraint) in callee_clause.arguments.iter().enumerate() {
            if *constraint == ValueConstraint::Any {
                continue;
            }
            let target = &mut arguments[*mapping.get(index)?];
            if *target != ValueConstraint::Any && *target != *constraint {
                return None;
            }
            *target = *constraint;
        }
        let effect = match callee_clause.effect {
            ContractEffect::Param(index) => ContractEffect::Param(*mapping.get(index)?),
            ContractEffect::This if receiver_is_this => ContractEffect::This,
            ContractEffect::This => return None,
            effect => effect,
        };
        clauses.push(ContractClause { arguments, effect });
    }
    Some(MethodContract { clauses })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::syntax::parse_contract;
    use crate::dataflow::context::{AnalysisContext, CancellationToken};
    use crate::dataflow::worklist::run_method;
    use crate::ir::{BinaryOp, EdgeKind, Nullness};
    use crate::test_harness::{
        MethodBuilder, ProgramBuilder, binary, branch, invoke_static, load, new, push_bool,
        push_null, ret, throw,
    };

    fn inferred(method: &Method) -> Option<String> {
        let env = ProgramBuilder::new().method(method.clone()).environment();
        let mut cx = AnalysisContext::new(method, &env).expect("context");
        let result = run_method(&mut cx, &CancellationToken::new()).expect("worklist run");
        infer_contract(&mut cx, &result.terminals).map(|contract| contract.to_string())
    }

    fn null_check(method: MethodBuilder) -> MethodBuilder {
        method
            .block(0, vec![load(0), push_null(), binary(BinaryOp::Eq), branch()])
            .edge(0, 10, EdgeKind::BranchTrue)
            .edge(0, 20, EdgeKind::BranchFalse)
    }

    #[test]
    fn infers_null_check_result() {
        let method = null_check(
            MethodBuilder::new("p/A", "isNull", "(Ljava/lang/Object;)Z").static_method(),
        )
        .block(10, vec![push_bool(true), ret()])
        .block(20, vec![push_bool(false), ret()])
        .build();

        assert_eq!(
            inferred(&method).as_deref(),
            Some("null -> true; !null -> false")
        );
    }

    #[test]
    fn infers_guard_failure_and_identity() {
        let method = null_check(
            MethodBuilder::new("p/A", "check", "(Ljava/lang/Object;)Ljava/lang/Object;")
                .static_method(),
        )
        .block(
            10,
            vec![new("java/lang/IllegalArgumentException"), throw()],
        )
        .block(20, vec![load(0), ret()])
        .build();

        assert_eq!(
            inferred(&method).as_deref(),
            Some("null -> fail; !null -> param1")
        );
    }

    #[test]
    fn universal_effect_drops_redundant_clauses() {
        let method = MethodBuilder::new("p/A", "same", "(Ljava/lang/Object;)Ljava/lang/Object;")
            .static_method()
            .block(0, vec![load(0), ret()])
            .build();

        assert_eq!(inferred(&method).as_deref(), Some("_ -> param1"));
    }

    #[test]
    fn unknown_result_yields_no_contract() {
        let method = MethodBuilder::new("p/A", "call", "(Ljava/lang/Object;)Ljava/lang/Object;")
            .static_method()
            .returns(Nullness::Unknown)
            .block(
                0,
                vec![invoke_static("p/B", "lookup", "()Ljava/lang/Object;"), ret()],
            )
            .build();

        assert_eq!(inferred(&method), None);
    }

    #[test]
    fn delegation_remaps_argument_positions() {
        let method = MethodBuilder::new(
            "p/A",
            "check",
            "(Ljava/lang/String;Ljava/lang/Object;)Ljava/lang/Object;",
        )
        .static_method()
        .block(
            0,
            vec![
                load(1),
                invoke_static(
                    "java/util/Objects",
                    "requireNonNull",
                    "(Ljava/lang/Object;)Ljava/lang/Object;",
                ),
                ret(),
            ],
        )
        .build();
        let program = ProgramBuilder::new().method(method.clone()).program();
        let cache = ContractCache::for_program(&program);

        let contract = delegated_contract(&method, &cache).expect("delegated");

        assert_eq!(contract.to_string(), "_, null -> fail; _, _ -> param2");
    }

    #[test]
    fn delegation_with_identity_mapping_is_verbatim() {
        let method = MethodBuilder::new("p/A", "check", "(Ljava/lang/Object;)Ljava/lang/Object;")
            .static_method()
            .block(
                0,
                vec![
                    load(0),
                    invoke_static(
                        "java/util/Objects",
                        "requireNonNull",
                        "(Ljava/lang/Object;)Ljava/lang/Object;",
                    ),
                    ret(),
                ],
            )
            .build();
        let program = ProgramBuilder::new().method(method.clone()).program();
        let cache = ContractCache::for_program(&program);

        let contract = delegated_contract(&method, &cache).expect("delegated");

        assert_eq!(
            contract,
            parse_contract("null -> fail; _ -> param1", 1).expect("contract")
        );
    }
}
