use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::KeyValue;

use crate::contracts::DeclaredMethod;
use crate::contracts::syntax::MethodContract;
use crate::dataflow::facts::FactSet;
use crate::dataflow::state::MemoryState;
use crate::dataflow::value::{FieldKey, ValueId, ValueTable, VariableDescriptor};
use crate::descriptor::{MethodShape, method_shape};
use crate::engine::Environment;
use crate::ir::{CallKind, CallSite, FieldRef, Method};
use crate::report::{Explanation, Observations};

/// Tunables for one analysis session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AnalysisConfig {
    /// Ceiling on processed (block, state) visits per method.
    pub(crate) max_states: usize,
    pub(crate) infer_contracts: bool,
    pub(crate) report_nullable: bool,
    /// Verify join results and the value table while running.
    pub(crate) check_invariants: bool,
    /// Undecided contract guards split a state at most this many times per call.
    pub(crate) max_contract_splits: usize,
    /// Fields deeper than this are not tracked as variables.
    pub(crate) max_field_depth: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_states: 50_000,
            infer_contracts: true,
            report_nullable: true,
            check_invariants: true,
            max_contract_splits: 8,
            max_field_depth: 3,
        }
    }
}

/// Cooperative cancellation shared between the driver and running analyses.
#[derive(Clone, Debug, Default)]
pub(crate) struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub(crate) fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Relaxed) {
            return true;
        }
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Coverage counters for interpreter execution.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct InterpreterCoverage {
    pub(crate) handled: usize,
    pub(crate) contract_applied: usize,
    pub(crate) contract_splits: usize,
    pub(crate) flushed_calls: usize,
    pub(crate) fallback: usize,
    fallback_ops: BTreeMap<String, usize>,
}

impl InterpreterCoverage {
    pub(crate) fn record_fallback(&mut self, name: &str) {
        self.fallback += 1;
        *self.fallback_ops.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Instructions left to fallback handling, by name.
    pub(crate) fn fallback_ops(&self) -> &BTreeMap<String, usize> {
        &self.fallback_ops
    }

    /// Merges another coverage snapshot into this one.
    pub(crate) fn merge_from(&mut self, other: &InterpreterCoverage) {
        self.handled += other.handled;
        self.contract_applied += other.contract_applied;
        self.contract_splits += other.contract_splits;
        self.flushed_calls += other.flushed_calls;
        self.fallback += other.fallback;
        for (name, count) in &other.fallback_ops {
            *self.fallback_ops.entry(name.clone()).or_insert(0) += count;
        }
    }
}

/// Returns whether per-instruction debug logging is enabled.
pub(crate) fn interpreter_debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("NULLFLOW_DEBUG_INTERPRETER")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

/// Emits one summary event for interpreter coverage counters.
pub(crate) fn emit_interpreter_summary_event(coverage: &InterpreterCoverage) {
    let attributes = [
        KeyValue::new("nullflow.debug_summary", "interpreter"),
        KeyValue::new("nullflow.handled_count", coverage.handled as i64),
        KeyValue::new(
            "nullflow.contract_applied_count",
            coverage.contract_applied as i64,
        ),
        KeyValue::new(
            "nullflow.contract_split_count",
            coverage.contract_splits as i64,
        ),
        KeyValue::new("nullflow.flushed_call_count", coverage.flushed_calls as i64),
        KeyValue::new("nullflow.fallback_count", coverage.fallback as i64),
    ];
    crate::telemetry::add_current_span_event("nullflow.debug.summary", &attributes);
}

/// What the interpreter needs to know about a call target.
#[derive(Debug)]
pub(crate) struct Callee {
    pub(crate) declared: DeclaredMethod,
    pub(crate) contract: Option<MethodContract>,
    pub(crate) shape: MethodShape,
}

/// Per-run state threaded through the runner and interpreter.
pub(crate) struct AnalysisContext<'a> {
    pub(crate) method: &'a Method,
    pub(crate) env: &'a Environment,
    pub(crate) shape: MethodShape,
    pub(crate) declared: DeclaredMethod,
    pub(crate) values: ValueTable,
    pub(crate) observations: Observations,
    pub(crate) coverage: InterpreterCoverage,
    pub(crate) debug: bool,
    callees: BTreeMap<(String, String, String), Rc<Callee>>,
}

impl<'a> AnalysisContext<'a> {
    pub(crate) fn new(method: &'a Method, env: &'a Environment) -> Result<Self> {
        let shape = method_shape(&method.id.descriptor, method.access.is_static)?;
        Ok(Self {
            method,
            env,
            shape,
            declared: env.contracts.declared(&method.id),
            values: ValueTable::new(),
            observations: Observations::new(method.id.clone()),
            coverage: InterpreterCoverage::default(),
            debug: interpreter_debug_enabled(),
            callees: BTreeMap::new(),
        })
    }

    pub(crate) fn variable(&mut self, variable: VariableDescriptor) -> ValueId {
        self.values.variable(variable)
    }

    pub(crate) fn facts(&self, state: &MemoryState, id: ValueId) -> FactSet {
        state.facts(&self.values, &self.env.hierarchy, id)
    }

    pub(crate) fn narrow(&self, state: &mut MemoryState, id: ValueId, facts: &FactSet) -> bool {
        state.narrow(&self.values, &self.env.hierarchy, id, facts)
    }

    /// Variable for `field`, or `None` when the field is not tracked through this qualifier.
    pub(crate) fn field_variable(
        &mut self,
        state: &MemoryState,
        qualifier: Option<ValueId>,
        field: &FieldRef,
    ) -> Option<ValueId> {
        let attributes = self.env.fields.lookup(field);
        if attributes.is_volatile {
            return None;
        }
        let qualifier = match qualifier {
            Some(qualifier) if !self.values.is_variable(qualifier) => return None,
            Some(qualifier) => Some(state.canonical(qualifier)),
            None => None,
        };
        let depth = qualifier.map_or(0, |qualifier| self.values.field_depth(qualifier)) + 1;
        if depth > self.env.config.max_field_depth {
            return None;
        }
        Some(self.values.variable(VariableDescriptor::Field {
            qualifier,
            field: FieldKey {
                owner: field.owner.clone(),
                name: field.name.clone(),
                nullness: attributes.nullness,
                stable: attributes.is_final,
            },
        }))
    }

    /// Declared information and contract of a call target, cached per run.
    pub(crate) fn callee(&mut self, call: &CallSite) -> Result<Rc<Callee>> {
        let key = (
            call.owner.clone(),
            call.name.clone(),
            call.descriptor.clone(),
        );
        if let Some(callee) = self.callees.get(&key) {
            return Ok(Rc::clone(callee));
        }
        let id = call.method_id();
        let shape = method_shape(&call.descriptor, call.kind == CallKind::Static)?;
        let callee = Rc::new(Callee {
            declared: self.env.contracts.declared(&id),
            contract: self.env.contracts.contract(&id),
            shape,
        });
        self.callees.insert(key, Rc::clone(&callee));
        Ok(callee)
    }

    /// One-link explanation naming `id` and its current facts.
    pub(crate) fn explain(&self, state: &MemoryState, id: ValueId) -> Vec<Explanation> {
        vec![Explanation::new(
            self.values.describe(id),
            self.facts(state, id),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl InterpreterCoverage {
        fn fallback_count(&self, name: &str) -> usize {
            self.fallback_ops().get(name).copied().unwrap_or(0)
        }
    }

    #[test]
    fn token_reports_manual_cancellation() {
        let token = CancellationToken::new();
        let shared = token.clone();
        assert!(!token.is_cancelled());
        shared.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn token_expires_after_deadline() {
        let token = CancellationToken::with_deadline(Duration::from_millis(0));
        assert!(token.is_cancelled());
        let later = CancellationToken::with_deadline(Duration::from_secs(3600));
        assert!(!later.is_cancelled());
    }

    #[test]
    fn coverage_merge_adds_counters() {
        let mut total = InterpreterCoverage::default();
        let mut run = InterpreterCoverage {
            handled: 3,
            ..InterpreterCoverage::default()
        };
        run.record_fallback("invokedynamic");
        total.merge_from(&run);
        total.merge_from(&run);
        assert_eq!(total.handled, 6);
        assert_eq!(total.fallback, 2);
        assert_eq!(total.fallback_count("invokedynamic"), 2);
    }
}
