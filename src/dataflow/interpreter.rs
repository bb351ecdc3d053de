use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tracing::info;

use crate::contracts::evaluate::{GuardStatus, clause_status, open_constraint};
use crate::contracts::syntax::{ContractEffect, ValueConstraint};
use crate::dataflow::context::{AnalysisContext, Callee};
use crate::dataflow::facts::{ConstValue, FactSet, Marker, Nullability, Range, TypeConstraint};
use crate::dataflow::state::MemoryState;
use crate::dataflow::value::{Condition, Relation, ValueDescriptor, ValueId, VariableDescriptor};
use crate::descriptor::{ParamKind, ReturnKind};
use crate::ir::{
    BinaryOp, CallKind, CallSite, Constant, FieldRef, Instruction, InstructionKind, Nullness,
    ResumeTarget, UnaryOp,
};
use crate::report::{DereferenceKind, Explanation};

/// How control leaves an instruction for one successor state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Flow {
    Next,
    Branch(bool),
    Goto(u32),
    /// Method exit; the returned value, if any, is on top of the stack.
    Returned,
    /// Exceptional method exit; the thrown value is on top of the stack.
    Threw,
}

/// Successor states of one instruction.
#[derive(Debug, Default)]
pub(crate) struct InstructionStep {
    pub(crate) flows: Vec<(MemoryState, Flow)>,
    /// States entering the block's exception handlers.
    pub(crate) exceptions: Vec<MemoryState>,
}

impl InstructionStep {
    fn next(state: MemoryState) -> Self {
        Self::flow(state, Flow::Next)
    }

    fn flow(state: MemoryState, flow: Flow) -> Self {
        Self {
            flows: vec![(state, flow)],
            exceptions: Vec::new(),
        }
    }

    fn terminate() -> Self {
        Self::default()
    }
}

/// Position facts about an instruction that shape its semantics.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Site {
    pub(crate) has_handlers: bool,
    /// The pushed boolean is consumed by a branch, possibly through negations.
    pub(crate) feeds_branch: bool,
}

const THROWABLE: &str = "java/lang/Throwable";

/// Execute one instruction against `state`.
pub(crate) fn execute(
    cx: &mut AnalysisContext<'_>,
    instruction: &Instruction,
    mut state: MemoryState,
    site: Site,
) -> Result<InstructionStep> {
    if cx.debug {
        info!(
            "interpreter debug: method={} offset={} op={} depth={}",
            cx.method.id,
            instruction.offset,
            instruction.kind.name(),
            state.stack().len()
        );
    }
    if !matches!(instruction.kind, InstructionKind::Unknown { .. }) {
        cx.coverage.handled += 1;
    }
    let implicit_exception = (site.has_handlers && may_throw(&instruction.kind))
        .then(|| exception_state(cx, &state, None));

    let mut step = match &instruction.kind {
        InstructionKind::Push { value } => {
            let value = constant_value(cx, value);
            state.push(value);
            InstructionStep::next(state)
        }
        InstructionKind::New { class } => {
            let facts = FactSet {
                types: TypeConstraint::exactly(class),
                ..FactSet::not_null()
            };
            let value = cx.values.facts(facts.with_marker(Marker::Fresh));
            state.push(value);
            InstructionStep::next(state)
        }
        InstructionKind::NewArray { .. } => {
            pop(&mut state, instruction)?;
            let value = cx
                .values
                .facts(FactSet::not_null().with_marker(Marker::Fresh));
            state.push(value);
            InstructionStep::next(state)
        }
        InstructionKind::Load { index } => {
            let local = cx.variable(VariableDescriptor::Local(*index));
            state.push(local);
            InstructionStep::next(state)
        }
        InstructionKind::Store { index } => {
            let value = pop(&mut state, instruction)?;
            let local = cx.variable(VariableDescriptor::Local(*index));
            state.set_var(&mut cx.values, &cx.env.hierarchy, local, value);
            InstructionStep::next(state)
        }
        InstructionKind::GetField { field } => {
            let qualifier = pop(&mut state, instruction)?;
            if !dereference(cx, &mut state, qualifier, DereferenceKind::Field, instruction) {
                InstructionStep::terminate()
            } else {
                let value = read_field(cx, &mut state, Some(qualifier), field);
                state.push(value);
                InstructionStep::next(state)
            }
        }
        InstructionKind::PutField { field } => {
            let value = pop(&mut state, instruction)?;
            let qualifier = pop(&mut state, instruction)?;
            if !dereference(cx, &mut state, qualifier, DereferenceKind::Field, instruction) {
                InstructionStep::terminate()
            } else {
                write_field(cx, &mut state, qualifier, field, value);
                InstructionStep::next(state)
            }
        }
        InstructionKind::GetStatic { field } => {
            let value = read_field(cx, &mut state, None, field);
            state.push(value);
            InstructionStep::next(state)
        }
        InstructionKind::PutStatic { field } => {
            let value = pop(&mut state, instruction)?;
            if let Some(variable) = cx.field_variable(&state, None, field) {
                state.set_var(&mut cx.values, &cx.env.hierarchy, variable, value);
            }
            InstructionStep::next(state)
        }
        InstructionKind::ArrayLoad => {
            pop(&mut state, instruction)?;
            let array = pop(&mut state, instruction)?;
            if !dereference(cx, &mut state, array, DereferenceKind::Array, instruction) {
                InstructionStep::terminate()
            } else {
                let value = cx.values.facts(FactSet::unknown());
                state.push(value);
                InstructionStep::next(state)
            }
        }
        InstructionKind::ArrayStore => {
            let operands = pop_operands(&mut state, instruction, 3)?;
            if !dereference(cx, &mut state, operands[0], DereferenceKind::Array, instruction) {
                InstructionStep::terminate()
            } else {
                InstructionStep::next(state)
            }
        }
        InstructionKind::ArrayLength => {
            let array = pop(&mut state, instruction)?;
            if !dereference(cx, &mut state, array, DereferenceKind::Array, instruction) {
                InstructionStep::terminate()
            } else {
                let length = FactSet::with_range(Range::bounded(0, i64::from(i32::MAX)));
                let value = cx.values.facts(length);
                state.push(value);
                InstructionStep::next(state)
            }
        }
        InstructionKind::Pop => {
            pop(&mut state, instruction)?;
            InstructionStep::next(state)
        }
        InstructionKind::Dup => {
            let top = state
                .peek()
                .with_context(|| stack_underflow(instruction))?;
            state.push(top);
            InstructionStep::next(state)
        }
        InstructionKind::Swap => {
            let top = pop(&mut state, instruction)?;
            let below = pop(&mut state, instruction)?;
            state.push(top);
            state.push(below);
            InstructionStep::next(state)
        }
        InstructionKind::Unary { operator } => {
            let operand = pop(&mut state, instruction)?;
            let value = unary(cx, &state, *operator, operand);
            state.push(value);
            InstructionStep::next(state)
        }
        InstructionKind::Binary { operator } => {
            let right = pop(&mut state, instruction)?;
            let left = pop(&mut state, instruction)?;
            let value = binary(cx, &state, *operator, left, right, instruction, site);
            state.push(value);
            InstructionStep::next(state)
        }
        InstructionKind::InstanceOf { class } => {
            let value = pop(&mut state, instruction)?;
            let test = cx.values.condition(Condition::InstanceOf {
                value,
                class: class.clone(),
                negated: false,
            });
            state.push(test);
            InstructionStep::next(state)
        }
        InstructionKind::CheckCast { class } => check_cast(cx, state, class, instruction)?,
        InstructionKind::Invoke { call } => invoke(cx, state, call, instruction, site)?,
        InstructionKind::Box { class } => {
            let value = pop(&mut state, instruction)?;
            let facts = cx.facts(&state, value);
            let boxed = FactSet {
                constant: facts.constant,
                range: facts.range,
                types: TypeConstraint::exactly(class),
                ..FactSet::not_null()
            };
            let boxed = cx.values.facts(boxed.with_marker(Marker::Boxed));
            state.push(boxed);
            InstructionStep::next(state)
        }
        InstructionKind::Unbox { .. } => {
            let value = pop(&mut state, instruction)?;
            if !dereference(cx, &mut state, value, DereferenceKind::Unbox, instruction) {
                InstructionStep::terminate()
            } else {
                let facts = cx.facts(&state, value);
                let unboxed = FactSet {
                    constant: facts.constant,
                    range: facts.range,
                    ..FactSet::not_null()
                };
                let unboxed = intern_facts(cx, unboxed);
                state.push(unboxed);
                InstructionStep::next(state)
            }
        }
        InstructionKind::Return => {
            let value = state
                .peek()
                .with_context(|| stack_underflow(instruction))?;
            check_return(cx, &state, value, instruction);
            InstructionStep::flow(state, Flow::Returned)
        }
        InstructionKind::ReturnVoid => InstructionStep::flow(state, Flow::Returned),
        InstructionKind::Throw => {
            let thrown = pop(&mut state, instruction)?;
            if !dereference(cx, &mut state, thrown, DereferenceKind::Throw, instruction) {
                InstructionStep::terminate()
            } else {
                throw(cx, &state, Some(thrown), site)
            }
        }
        InstructionKind::Branch => branch(cx, state, instruction)?,
        InstructionKind::MonitorEnter | InstructionKind::MonitorExit => {
            let monitor = pop(&mut state, instruction)?;
            if !dereference(cx, &mut state, monitor, DereferenceKind::Monitor, instruction) {
                InstructionStep::terminate()
            } else {
                state.flush_fields(&mut cx.values, &cx.env.hierarchy, None);
                InstructionStep::next(state)
            }
        }
        InstructionKind::TryEnter | InstructionKind::TryExit => InstructionStep::next(state),
        InstructionKind::EnterFinally { resume } => {
            state.push_transfer(*resume);
            InstructionStep::next(state)
        }
        InstructionKind::ExitFinally => match state.pop_transfer() {
            None => InstructionStep::next(state),
            Some(ResumeTarget::Block(block)) => InstructionStep::flow(state, Flow::Goto(block)),
            Some(ResumeTarget::Return) => InstructionStep::flow(state, Flow::Returned),
            Some(ResumeTarget::Rethrow) => {
                let thrown = state.peek();
                throw(cx, &state, thrown, site)
            }
        },
        InstructionKind::Unknown { name, pops, pushes } => {
            pop_operands(&mut state, instruction, *pops)?;
            state.flush_fields(&mut cx.values, &cx.env.hierarchy, None);
            for _ in 0..*pushes {
                let value = cx.values.facts(FactSet::unknown());
                state.push(value);
            }
            cx.coverage.record_fallback(name);
            InstructionStep::next(state)
        }
    };
    if let Some(exception) = implicit_exception {
        step.exceptions.push(exception);
    }
    Ok(step)
}

fn stack_underflow(instruction: &Instruction) -> String {
    format!(
        "stack underflow at offset {} ({})",
        instruction.offset,
        instruction.kind.name()
    )
}

fn pop(state: &mut MemoryState, instruction: &Instruction) -> Result<ValueId> {
    state.pop().with_context(|| stack_underflow(instruction))
}

fn pop_operands(
    state: &mut MemoryState,
    instruction: &Instruction,
    count: usize,
) -> Result<Vec<ValueId>> {
    state
        .pop_n(count)
        .with_context(|| stack_underflow(instruction))
}

/// Instructions whose implicit runtime exceptions reach local handlers.
fn may_throw(kind: &InstructionKind) -> bool {
    matches!(
        kind,
        InstructionKind::GetField { .. }
            | InstructionKind::PutField { .. }
            | InstructionKind::ArrayLoad
            | InstructionKind::ArrayStore
            | InstructionKind::ArrayLength
            | InstructionKind::Unbox { .. }
            | InstructionKind::MonitorEnter
            | InstructionKind::Unknown { .. }
    )
}

fn exception_state(
    cx: &mut AnalysisContext<'_>,
    state: &MemoryState,
    thrown: Option<ValueId>,
) -> MemoryState {
    let mut handler = state.clone();
    handler.clear_stack();
    let thrown = thrown.unwrap_or_else(|| {
        let facts = FactSet {
            types: TypeConstraint {
                instance_of: BTreeSet::from([THROWABLE.to_string()]),
                ..TypeConstraint::default()
            },
            ..FactSet::not_null()
        };
        cx.values.facts(facts)
    });
    handler.push(thrown);
    handler
}

fn throw(
    cx: &mut AnalysisContext<'_>,
    state: &MemoryState,
    thrown: Option<ValueId>,
    site: Site,
) -> InstructionStep {
    let exception = exception_state(cx, state, thrown);
    if site.has_handlers {
        InstructionStep {
            flows: Vec::new(),
            exceptions: vec![exception],
        }
    } else {
        InstructionStep::flow(exception, Flow::Threw)
    }
}

/// Record a dereference of `value`; returns `false` when it is definitely null.
fn dereference(
    cx: &mut AnalysisContext<'_>,
    state: &mut MemoryState,
    value: ValueId,
    kind: DereferenceKind,
    instruction: &Instruction,
) -> bool {
    let facts = cx.facts(state, value);
    let explanation = if facts.nullability.may_be_null() {
        cx.explain(state, value)
    } else {
        Vec::new()
    };
    cx.observations.record_dereference(
        instruction.offset,
        instruction.line,
        kind,
        facts.nullability,
        explanation,
    );
    if facts.nullability == Nullability::Null {
        return false;
    }
    cx.narrow(state, value, &FactSet::not_null())
}

fn constant_value(cx: &mut AnalysisContext<'_>, constant: &Constant) -> ValueId {
    match constant {
        Constant::Null => cx.values.facts(FactSet::null()),
        Constant::Bool(value) => cx.values.constant(ConstValue::Bool(*value)),
        Constant::Int(value) => cx.values.constant(ConstValue::Int(*value)),
        Constant::Double(value) => cx.values.constant(ConstValue::double(*value)),
        Constant::Nan => cx.values.constant(ConstValue::double(f64::NAN)),
        Constant::String(value) => cx.values.constant(ConstValue::Str(value.clone())),
        Constant::Class(value) => cx.values.constant(ConstValue::Class(value.clone())),
    }
}

/// Intern computed facts, preferring a plain constant when that is all they say.
fn intern_facts(cx: &mut AnalysisContext<'_>, facts: FactSet) -> ValueId {
    if let Some(constant) = facts.constant.clone() {
        if FactSet::constant(constant.clone()) == facts {
            return cx.values.constant(constant);
        }
    }
    cx.values.facts(facts)
}

/// Source literal such as `true` or `null`.
fn is_literal(cx: &AnalysisContext<'_>, value: ValueId) -> bool {
    match cx.values.descriptor(value) {
        ValueDescriptor::Constant(_) => true,
        ValueDescriptor::Facts(facts) => facts.nullability == Nullability::Null,
        _ => false,
    }
}

fn read_field(
    cx: &mut AnalysisContext<'_>,
    state: &mut MemoryState,
    qualifier: Option<ValueId>,
    field: &FieldRef,
) -> ValueId {
    if let Some(variable) = cx.field_variable(state, qualifier, field) {
        return variable;
    }
    let attributes = cx.env.fields.lookup(field);
    if attributes.is_volatile {
        state.flush_fields(&mut cx.values, &cx.env.hierarchy, None);
    }
    cx.values.facts(FactSet::declared(attributes.nullness))
}

fn write_field(
    cx: &mut AnalysisContext<'_>,
    state: &mut MemoryState,
    qualifier: ValueId,
    field: &FieldRef,
    value: ValueId,
) {
    state.flush_aliases(
        &mut cx.values,
        &cx.env.hierarchy,
        &field.owner,
        &field.name,
        qualifier,
    );
    if let Some(variable) = cx.field_variable(state, Some(qualifier), field) {
        state.set_var(&mut cx.values, &cx.env.hierarchy, variable, value);
    }
}

fn unary(
    cx: &mut AnalysisContext<'_>,
    state: &MemoryState,
    operator: UnaryOp,
    operand: ValueId,
) -> ValueId {
    match operator {
        UnaryOp::Not => match cx.values.descriptor(operand).clone() {
            ValueDescriptor::Condition(condition) => cx.values.condition(condition.negate()),
            ValueDescriptor::Variable(_) => {
                let false_value = cx.values.constant(ConstValue::Bool(false));
                cx.values.condition(Condition::Compare {
                    left: operand,
                    relation: Relation::Eq,
                    right: false_value,
                })
            }
            _ => match cx.facts(state, operand).truth() {
                Some(known) => cx.values.constant(ConstValue::Bool(!known)),
                None => cx.values.facts(FactSet::not_null()),
            },
        },
        UnaryOp::Neg => {
            let facts = cx.facts(state, operand);
            let negated = match &facts.constant {
                Some(ConstValue::Int(value)) => value
                    .checked_neg()
                    .map(|value| FactSet::constant(ConstValue::Int(value))),
                Some(ConstValue::Double(bits)) => Some(FactSet::constant(ConstValue::double(
                    -f64::from_bits(*bits),
                ))),
                _ => None,
            };
            let negated = negated.unwrap_or_else(|| {
                let range = facts.range.and_then(|range| {
                    let lo = range.hi.checked_neg()?;
                    let hi = range.lo.checked_neg()?;
                    Range::bounded(lo, hi)
                });
                FactSet::with_range(range)
            });
            intern_facts(cx, negated)
        }
    }
}

fn binary(
    cx: &mut AnalysisContext<'_>,
    state: &MemoryState,
    operator: BinaryOp,
    left: ValueId,
    right: ValueId,
    instruction: &Instruction,
    site: Site,
) -> ValueId {
    if let Some(relation) = Relation::from_op(operator) {
        if !site.feeds_branch {
            let outcome =
                state.evaluate_relation(&cx.values, &cx.env.hierarchy, left, relation, right);
            let literal = is_literal(cx, left) && is_literal(cx, right);
            let explanation = if outcome.is_some() {
                explain_operands(cx, state, &[left, right])
            } else {
                Vec::new()
            };
            cx.observations.record_comparison(
                instruction.offset,
                instruction.line,
                outcome,
                literal,
                explanation,
            );
        }
        return cx.values.condition(Condition::Compare {
            left,
            relation,
            right,
        });
    }
    let left_facts = cx.facts(state, left);
    let right_facts = cx.facts(state, right);
    let result = arithmetic(operator, &left_facts, &right_facts);
    intern_facts(cx, result)
}

fn arithmetic(operator: BinaryOp, left: &FactSet, right: &FactSet) -> FactSet {
    let is_nan = |facts: &FactSet| facts.constant.as_ref().is_some_and(ConstValue::is_nan);
    if is_nan(left) || is_nan(right) {
        return FactSet::constant(ConstValue::double(f64::NAN));
    }
    match (&left.constant, &right.constant) {
        (Some(ConstValue::Int(a)), Some(ConstValue::Int(b))) => {
            let folded = match operator {
                BinaryOp::Add => a.checked_add(*b),
                BinaryOp::Sub => a.checked_sub(*b),
                BinaryOp::Mul => a.checked_mul(*b),
                BinaryOp::Div => a.checked_div(*b),
                BinaryOp::Rem => a.checked_rem(*b),
                BinaryOp::And => Some(a & b),
                BinaryOp::Or => Some(a | b),
                BinaryOp::Xor => Some(a ^ b),
                _ => None,
            };
            if let Some(value) = folded {
                return FactSet::constant(ConstValue::Int(value));
            }
        }
        (Some(ConstValue::Bool(a)), Some(ConstValue::Bool(b))) => {
            let folded = match operator {
                BinaryOp::And => Some(*a && *b),
                BinaryOp::Or => Some(*a || *b),
                BinaryOp::Xor => Some(a != b),
                _ => None,
            };
            if let Some(value) = folded {
                return FactSet::boolean(value);
            }
        }
        _ => {}
    }
    match (operator, left.truth(), right.truth()) {
        (BinaryOp::And, Some(false), _) | (BinaryOp::And, _, Some(false)) => {
            return FactSet::boolean(false);
        }
        (BinaryOp::Or, Some(true), _) | (BinaryOp::Or, _, Some(true)) => {
            return FactSet::boolean(true);
        }
        _ => {}
    }
    let range = match (operator, left.range, right.range) {
        (BinaryOp::Add, Some(l), Some(r)) => l
            .lo
            .checked_add(r.lo)
            .zip(l.hi.checked_add(r.hi))
            .and_then(|(lo, hi)| Range::bounded(lo, hi)),
        (BinaryOp::Sub, Some(l), Some(r)) => l
            .lo
            .checked_sub(r.hi)
            .zip(l.hi.checked_sub(r.lo))
            .and_then(|(lo, hi)| Range::bounded(lo, hi)),
        _ => None,
    };
    FactSet::with_range(range)
}

fn explain_operands(
    cx: &AnalysisContext<'_>,
    state: &MemoryState,
    operands: &[ValueId],
) -> Vec<Explanation> {
    operands
        .iter()
        .filter(|operand| !is_literal(cx, **operand))
        .flat_map(|operand| cx.explain(state, *operand))
        .collect()
}

/// Facts that make a branch condition constant.
fn explain_condition(
    cx: &AnalysisContext<'_>,
    state: &MemoryState,
    condition: ValueId,
) -> Vec<Explanation> {
    match cx.values.descriptor(condition) {
        ValueDescriptor::Condition(Condition::Compare { left, right, .. }) => {
            explain_operands(cx, state, &[*left, *right])
        }
        ValueDescriptor::Condition(Condition::InstanceOf { value, .. }) => {
            explain_operands(cx, state, &[*value])
        }
        _ => cx.explain(state, condition),
    }
}

fn branch(
    cx: &mut AnalysisContext<'_>,
    mut state: MemoryState,
    instruction: &Instruction,
) -> Result<InstructionStep> {
    let condition = pop(&mut state, instruction)?;
    let literal = matches!(cx.values.descriptor(condition), ValueDescriptor::Constant(_));
    let explanation = explain_condition(cx, &state, condition);

    let (when_true, when_false) = split_on_condition(cx, state, condition);
    cx.observations.record_branch(
        instruction.offset,
        instruction.line,
        when_true.is_some(),
        when_false.is_some(),
        literal,
        explanation,
    );

    let mut step = InstructionStep::terminate();
    if let Some(state) = when_true {
        step.flows.push((state, Flow::Branch(true)));
    }
    if let Some(state) = when_false {
        step.flows.push((state, Flow::Branch(false)));
    }
    Ok(step)
}

/// States in which `condition` holds and fails; `None` marks an infeasible side.
fn split_on_condition(
    cx: &AnalysisContext<'_>,
    state: MemoryState,
    condition: ValueId,
) -> (Option<MemoryState>, Option<MemoryState>) {
    if let ValueDescriptor::Condition(Condition::InstanceOf {
        value,
        class,
        negated,
    }) = cx.values.descriptor(condition)
    {
        let passed = state.with_instance_of(&cx.values, &cx.env.hierarchy, *value, class);
        let failed = state.without_instance_of(&cx.values, &cx.env.hierarchy, *value, class);
        return if *negated {
            (failed, passed)
        } else {
            (passed, failed)
        };
    }
    let mut when_true = state.clone();
    let can_be_true =
        when_true.apply_condition(&cx.values, &cx.env.hierarchy, condition, true);
    let mut when_false = state;
    let can_be_false =
        when_false.apply_condition(&cx.values, &cx.env.hierarchy, condition, false);
    (
        can_be_true.then_some(when_true),
        can_be_false.then_some(when_false),
    )
}

fn check_cast(
    cx: &mut AnalysisContext<'_>,
    mut state: MemoryState,
    class: &str,
    instruction: &Instruction,
) -> Result<InstructionStep> {
    let value = pop(&mut state, instruction)?;
    let facts = cx.facts(&state, value);
    let always_fails = facts.nullability == Nullability::NotNull
        && facts.types.test(class, &cx.env.hierarchy) == Some(false);
    let explanation = if always_fails {
        cx.explain(&state, value)
    } else {
        Vec::new()
    };
    cx.observations
        .record_cast(instruction.offset, instruction.line, always_fails, explanation);
    if always_fails {
        return Ok(InstructionStep::terminate());
    }
    let cast = FactSet {
        types: TypeConstraint {
            instance_of: BTreeSet::from([class.to_string()]),
            ..TypeConstraint::default()
        },
        ..FactSet::unknown()
    };
    // A value that cannot have the type only survives the cast as null.
    if !cx.narrow(&mut state, value, &cast) && !cx.narrow(&mut state, value, &FactSet::null()) {
        return Ok(InstructionStep::terminate());
    }
    state.push(value);
    Ok(InstructionStep::next(state))
}

fn check_return(
    cx: &mut AnalysisContext<'_>,
    state: &MemoryState,
    value: ValueId,
    instruction: &Instruction,
) {
    if cx.declared.return_nullness != Nullness::NonNull
        || cx.shape.return_kind != ReturnKind::Reference
    {
        return;
    }
    let facts = cx.facts(state, value);
    let explanation = if facts.nullability.may_be_null() {
        cx.explain(state, value)
    } else {
        Vec::new()
    };
    cx.observations.record_return(
        instruction.offset,
        instruction.line,
        facts.nullability,
        explanation,
    );
}

/// Collection methods that change their receiver.
fn is_mutator_call(call: &CallSite) -> bool {
    if !call.owner.starts_with("java/util/") {
        return false;
    }
    matches!(
        call.name.as_str(),
        "add"
            | "addAll"
            | "clear"
            | "compute"
            | "computeIfAbsent"
            | "computeIfPresent"
            | "merge"
            | "put"
            | "putAll"
            | "putIfAbsent"
            | "remove"
            | "removeAll"
            | "removeIf"
            | "replace"
            | "replaceAll"
            | "retainAll"
            | "set"
            | "sort"
    )
}

fn invoke(
    cx: &mut AnalysisContext<'_>,
    mut state: MemoryState,
    call: &CallSite,
    instruction: &Instruction,
    site: Site,
) -> Result<InstructionStep> {
    let callee = cx.callee(call)?;
    let arguments = pop_operands(&mut state, instruction, callee.shape.param_count())?;
    let receiver = if call.kind == CallKind::Static {
        None
    } else {
        Some(pop(&mut state, instruction)?)
    };

    if let Some(receiver) = receiver {
        if !dereference(cx, &mut state, receiver, DereferenceKind::Call, instruction) {
            return Ok(InstructionStep::terminate());
        }
        if is_mutator_call(call) {
            let unmodifiable = cx.facts(&state, receiver).has_marker(Marker::Unmodifiable);
            let explanation = if unmodifiable {
                cx.explain(&state, receiver)
            } else {
                Vec::new()
            };
            cx.observations.record_mutation(
                instruction.offset,
                instruction.line,
                unmodifiable,
                explanation,
            );
        }
    }

    for (index, argument) in arguments.iter().enumerate() {
        if callee.declared.parameter(index) != Nullness::NonNull
            || callee.shape.params.get(index) != Some(&ParamKind::Reference)
        {
            continue;
        }
        let facts = cx.facts(&state, *argument);
        let explanation = if facts.nullability.may_be_null() {
            cx.explain(&state, *argument)
        } else {
            Vec::new()
        };
        cx.observations.record_argument(
            instruction.offset,
            instruction.line,
            index,
            facts.nullability,
            explanation,
        );
        if facts.nullability != Nullability::Null {
            cx.narrow(&mut state, *argument, &FactSet::not_null());
        }
    }

    let mut step = InstructionStep::terminate();
    if site.has_handlers {
        let mut thrown = state.clone();
        if !callee.declared.pure {
            thrown.flush_fields(&mut cx.values, &cx.env.hierarchy, None);
        }
        step.exceptions.push(exception_state(cx, &thrown, None));
    }

    for (mut state, effect) in resolve_contract(cx, state, &callee, &arguments, instruction) {
        if effect == Some(ContractEffect::Fail) {
            if site.has_handlers {
                step.exceptions.push(exception_state(cx, &state, None));
            }
            continue;
        }
        if effect.is_some() {
            cx.coverage.contract_applied += 1;
        } else if !callee.declared.pure {
            state.flush_fields(&mut cx.values, &cx.env.hierarchy, None);
            cx.coverage.flushed_calls += 1;
        }
        if callee.shape.return_kind != ReturnKind::Void {
            let result = call_result(cx, &callee, effect, &arguments, receiver);
            state.push(result);
        }
        step.flows.push((state, Flow::Next));
    }
    Ok(step)
}

/// Assume an argument satisfies a guard constraint; `false` when it cannot.
fn assume(
    cx: &AnalysisContext<'_>,
    state: &mut MemoryState,
    argument: ValueId,
    constraint: ValueConstraint,
) -> bool {
    match constraint {
        ValueConstraint::True => {
            state.apply_condition(&cx.values, &cx.env.hierarchy, argument, true)
        }
        ValueConstraint::False => {
            state.apply_condition(&cx.values, &cx.env.hierarchy, argument, false)
        }
        other => cx.narrow(state, argument, &other.facts()),
    }
}

/// Split the call state by the callee's contract clauses.
///
/// Each returned state carries the effect that applies on it, or `None` when
/// the contract says nothing for that state.
fn resolve_contract(
    cx: &mut AnalysisContext<'_>,
    state: MemoryState,
    callee: &Callee,
    arguments: &[ValueId],
    instruction: &Instruction,
) -> Vec<(MemoryState, Option<ContractEffect>)> {
    let Some(contract) = &callee.contract else {
        return vec![(state, None)];
    };
    let varargs_slot = (callee.declared.varargs && !arguments.is_empty())
        .then(|| arguments.len() - 1);
    let mut resolved = Vec::new();
    let mut pending = Some(state);
    let mut splits = 0;
    let mut violation = None;
    for clause in &contract.clauses {
        let Some(current) = pending.take() else {
            break;
        };
        let facts: Vec<FactSet> = arguments
            .iter()
            .map(|argument| cx.facts(&current, *argument))
            .collect();
        match clause_status(clause, &facts, varargs_slot) {
            GuardStatus::Impossible => pending = Some(current),
            GuardStatus::Proven => {
                if clause.effect == ContractEffect::Fail && splits == 0 {
                    let constrained: Vec<ValueId> = clause
                        .arguments
                        .iter()
                        .zip(arguments)
                        .filter(|(constraint, _)| **constraint != ValueConstraint::Any)
                        .map(|(_, argument)| *argument)
                        .collect();
                    violation = Some(explain_operands(cx, &current, &constrained));
                }
                resolved.push((current, Some(clause.effect)));
            }
            GuardStatus::Undecided => match open_constraint(clause, &facts, varargs_slot) {
                Some((index, constraint))
                    if splits < cx.env.config.max_contract_splits
                        && varargs_slot != Some(index) =>
                {
                    splits += 1;
                    let argument = arguments[index];
                    let mut holds = current.clone();
                    if assume(cx, &mut holds, argument, constraint) {
                        resolved.push((holds, Some(clause.effect)));
                    }
                    let mut fails = current;
                    let feasible = constraint
                        .negate()
                        .is_none_or(|negated| assume(cx, &mut fails, argument, negated));
                    if feasible {
                        pending = Some(fails);
                    }
                }
                _ => resolved.push((current, None)),
            },
        }
    }
    if let Some(rest) = pending {
        resolved.push((rest, None));
    }
    cx.coverage.contract_splits += splits;
    let fails = violation.is_some();
    cx.observations.record_call(
        instruction.offset,
        instruction.line,
        fails,
        violation.unwrap_or_default(),
    );
    resolved
}

fn call_result(
    cx: &mut AnalysisContext<'_>,
    callee: &Callee,
    effect: Option<ContractEffect>,
    arguments: &[ValueId],
    receiver: Option<ValueId>,
) -> ValueId {
    let mut declared = FactSet::declared(callee.declared.return_nullness);
    if callee.declared.returns_unmodifiable {
        declared = declared.with_marker(Marker::Unmodifiable);
    }
    let facts = match effect {
        Some(ContractEffect::Param(index)) => match arguments.get(index) {
            Some(argument) => return *argument,
            None => declared.clone(),
        },
        Some(ContractEffect::This) => match receiver {
            Some(receiver) => return receiver,
            None => declared.clone(),
        },
        Some(ContractEffect::True) => return cx.values.constant(ConstValue::Bool(true)),
        Some(ContractEffect::False) => return cx.values.constant(ConstValue::Bool(false)),
        Some(ContractEffect::New) => FactSet::not_null().with_marker(Marker::Fresh),
        Some(effect) => effect
            .as_constraint()
            .map_or_else(|| declared.clone(), ValueConstraint::facts),
        None => declared.clone(),
    };
    let facts = facts
        .meet(&declared, &cx.env.hierarchy)
        .unwrap_or(facts);
    cx.values.facts(facts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::context::AnalysisContext;
    use crate::report::FindingKind;
    use crate::test_harness::{
        MethodBuilder, ProgramBuilder, binary, invoke_static, invoke_virtual, load, push_int,
        push_null,
    };

    fn instruction(offset: u32, kind: InstructionKind) -> Instruction {
        Instruction {
            offset,
            line: None,
            kind,
        }
    }

    #[test]
    fn dereference_of_null_terminates_path() {
        let method = MethodBuilder::new("p/A", "run", "()V").build();
        let env = ProgramBuilder::new().method(method.clone()).environment();
        let mut cx = AnalysisContext::new(&method, &env).expect("context");
        let mut state = MemoryState::default();
        let null = cx.values.facts(FactSet::null());
        state.push(null);

        let step = execute(
            &mut cx,
            &instruction(3, invoke_virtual("java/lang/Object", "hashCode", "()I")),
            state,
            Site::default(),
        )
        .expect("execute");

        assert!(step.flows.is_empty());
        let findings = cx.observations.into_findings(true);
        assert_eq!(findings[0].kind, FindingKind::NullDereference);
    }

    #[test]
    fn branch_on_comparison_forks_two_states() {
        let method = MethodBuilder::new("p/A", "run", "(Ljava/lang/Object;)V").build();
        let env = ProgramBuilder::new().method(method.clone()).environment();
        let mut cx = AnalysisContext::new(&method, &env).expect("context");
        let mut state = MemoryState::default();
        for (offset, kind) in [(0, load(1)), (1, push_null()), (2, binary(BinaryOp::Eq))] {
            let site = Site {
                feeds_branch: true,
                ..Site::default()
            };
            let mut step = execute(&mut cx, &instruction(offset, kind), state, site)
                .expect("execute");
            state = step.flows.pop().expect("state").0;
        }

        let step = execute(
            &mut cx,
            &instruction(3, InstructionKind::Branch),
            state,
            Site::default(),
        )
        .expect("execute");

        assert_eq!(step.flows.len(), 2);
        let local = cx.variable(VariableDescriptor::Local(1));
        let (true_state, true_flow) = &step.flows[0];
        assert_eq!(*true_flow, Flow::Branch(true));
        assert_eq!(cx.facts(true_state, local).nullability, Nullability::Null);
        assert_eq!(
            cx.facts(&step.flows[1].0, local).nullability,
            Nullability::NotNull
        );
    }

    #[test]
    fn require_non_null_contract_narrows_argument() {
        let method = MethodBuilder::new("p/A", "run", "(Ljava/lang/Object;)V").build();
        let env = ProgramBuilder::new().method(method.clone()).environment();
        let mut cx = AnalysisContext::new(&method, &env).expect("context");
        let mut state = MemoryState::default();
        let local = cx.variable(VariableDescriptor::Local(1));
        state.push(local);

        let step = execute(
            &mut cx,
            &instruction(
                0,
                invoke_static(
                    "java/util/Objects",
                    "requireNonNull",
                    "(Ljava/lang/Object;)Ljava/lang/Object;",
                ),
            ),
            state,
            Site::default(),
        )
        .expect("execute");

        assert_eq!(step.flows.len(), 1);
        let (after, _) = &step.flows[0];
        assert_eq!(after.peek(), Some(local));
        assert_eq!(cx.facts(after, local).nullability, Nullability::NotNull);
        assert_eq!(cx.coverage.contract_splits, 1);
    }

    #[test]
    fn contract_splits_on_the_one_open_argument() {
        let method = MethodBuilder::new("p/A", "run", "(Ljava/lang/Object;)V").build();
        let env = ProgramBuilder::new().method(method.clone()).environment();
        let mut cx = AnalysisContext::new(&method, &env).expect("context");
        let mut state = MemoryState::default();
        let local = cx.variable(VariableDescriptor::Local(1));
        let fresh = cx.values.facts(FactSet::not_null());
        state.push(local);
        state.push(fresh);

        let step = execute(
            &mut cx,
            &instruction(
                0,
                invoke_static(
                    "java/util/Objects",
                    "equals",
                    "(Ljava/lang/Object;Ljava/lang/Object;)Z",
                ),
            ),
            state,
            Site::default(),
        )
        .expect("execute");

        assert_eq!(step.flows.len(), 2);
        assert_eq!(cx.coverage.contract_splits, 1);
        let (null_state, _) = step
            .flows
            .iter()
            .find(|(after, _)| cx.facts(after, local).nullability == Nullability::Null)
            .expect("state with null argument");
        let result = null_state.peek().expect("call result");
        assert_eq!(
            cx.facts(null_state, result).constant,
            Some(ConstValue::Bool(false))
        );
        assert!(
            step.flows
                .iter()
                .any(|(after, _)| cx.facts(after, local).nullability == Nullability::NotNull)
        );
    }

    #[test]
    fn unknown_instruction_flushes_and_counts_fallback() {
        let method = MethodBuilder::new("p/A", "run", "()V").build();
        let env = ProgramBuilder::new().method(method.clone()).environment();
        let mut cx = AnalysisContext::new(&method, &env).expect("context");
        let mut state = MemoryState::default();
        let two = cx.values.constant(ConstValue::Int(2));
        state.push(two);

        let step = execute(
            &mut cx,
            &instruction(
                0,
                InstructionKind::Unknown {
                    name: "invokedynamic".to_string(),
                    pops: 1,
                    pushes: 1,
                },
            ),
            state,
            Site::default(),
        )
        .expect("execute");

        let (after, _) = &step.flows[0];
        assert_eq!(after.stack().len(), 1);
        assert_eq!(cx.coverage.fallback_ops().get("invokedynamic"), Some(&1));
    }

    #[test]
    fn arithmetic_folds_integer_constants() {
        let method = MethodBuilder::new("p/A", "run", "()V").build();
        let env = ProgramBuilder::new().method(method.clone()).environment();
        let mut cx = AnalysisContext::new(&method, &env).expect("context");
        let mut state = MemoryState::default();
        for (offset, kind) in [(0, push_int(2)), (1, push_int(3)), (2, binary(BinaryOp::Mul))] {
            let mut step = execute(&mut cx, &instruction(offset, kind), state, Site::default())
                .expect("execute");
            state = step.flows.pop().expect("state").0;
        }
        let top = state.peek().expect("result");
        assert_eq!(
            cx.facts(&state, top).constant,
            Some(ConstValue::Int(6))
        );
    }

    #[test]
    fn stack_underflow_is_an_error() {
        let method = MethodBuilder::new("p/A", "run", "()V").build();
        let env = ProgramBuilder::new().method(method.clone()).environment();
        let mut cx = AnalysisContext::new(&method, &env).expect("context");
        let result = execute(
            &mut cx,
            &instruction(7, InstructionKind::Pop),
            MemoryState::default(),
            Site::default(),
        );
        let message = format!("{:#}", result.expect_err("underflow"));
        assert!(message.contains("offset 7"), "{message}");
    }
}
