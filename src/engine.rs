use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry::Context as OtelContext;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::callgraph::build_call_graph;
use crate::contracts::ContractCache;
use crate::contracts::inference::{check_declared_contract, delegated_contract, infer_contract};
use crate::contracts::syntax::MethodContract;
use crate::dataflow::context::{
    AnalysisConfig, AnalysisContext, CancellationToken, InterpreterCoverage,
    emit_interpreter_summary_event,
};
use crate::dataflow::worklist::{RunOutcome, run_method};
use crate::hierarchy::{FieldIndex, TypeHierarchy};
use crate::ir::{Method, MethodId, Program};
use crate::report::{Explanation, Finding, sort_findings};
use crate::telemetry::{Telemetry, with_child_span, with_span};

/// Read-only inputs shared by every method analysis in a session.
pub(crate) struct Environment {
    pub(crate) hierarchy: TypeHierarchy,
    pub(crate) fields: FieldIndex,
    pub(crate) contracts: ContractCache,
    pub(crate) config: AnalysisConfig,
}

impl Environment {
    pub(crate) fn new(program: &Program, config: AnalysisConfig) -> Self {
        Self {
            hierarchy: TypeHierarchy::new(&program.classes),
            fields: FieldIndex::new(&program.classes),
            contracts: ContractCache::for_program(program),
            config,
        }
    }
}

/// Counters for one method run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct RunStats {
    pub(crate) visits: usize,
    pub(crate) values: usize,
    pub(crate) terminals: usize,
    pub(crate) duration_ms: u128,
}

/// Result of analyzing one method body.
#[derive(Debug)]
pub(crate) struct AnalysisResult {
    pub(crate) method: MethodId,
    pub(crate) findings: Vec<Finding>,
    pub(crate) inferred_contract: Option<MethodContract>,
    pub(crate) outcome: RunOutcome,
    pub(crate) stats: RunStats,
    pub(crate) coverage: InterpreterCoverage,
}

/// Analyze one method body against the session environment.
///
/// Aborted runs report neither findings nor an inferred contract.
pub(crate) fn analyze(
    method: &Method,
    env: &Environment,
    token: &CancellationToken,
) -> Result<AnalysisResult> {
    let started_at = Instant::now();
    let mut cx = AnalysisContext::new(method, env)?;
    let run = run_method(&mut cx, token)?;
    let mut stats = RunStats {
        visits: run.visits,
        values: cx.values.len(),
        terminals: run.terminals.len(),
        duration_ms: 0,
    };

    if run.outcome != RunOutcome::Completed {
        warn!(
            "analysis of {} stopped early: {:?} after {} visits",
            method.id, run.outcome, run.visits
        );
        stats.duration_ms = started_at.elapsed().as_millis();
        return Ok(AnalysisResult {
            method: method.id.clone(),
            findings: Vec::new(),
            inferred_contract: None,
            outcome: run.outcome,
            stats,
            coverage: cx.coverage,
        });
    }

    let inferred_contract = if env.config.infer_contracts && cx.declared.contract.is_none() {
        delegated_contract(method, &env.contracts)
            .or_else(|| infer_contract(&mut cx, &run.terminals))
    } else {
        None
    };
    if let Some(contract) = &inferred_contract {
        debug!("inferred contract for {}: {}", method.id, contract);
    }

    if let Some(contract) = cx.declared.contract.clone() {
        for mismatch in check_declared_contract(&mut cx, &contract, &run.terminals) {
            debug!(
                "{} breaks `{}` at offset {}",
                method.id, mismatch.clause, mismatch.offset
            );
            cx.observations.record_contract_mismatch(
                mismatch.offset,
                line_at(method, mismatch.offset),
                vec![
                    Explanation::new("contract clause", &mismatch.clause),
                    Explanation::new("exit", mismatch.observed),
                ],
            );
        }
    }

    if cx.debug {
        emit_interpreter_summary_event(&cx.coverage);
    }
    let AnalysisContext {
        observations,
        coverage,
        ..
    } = cx;
    let mut findings = observations.into_findings(env.config.report_nullable);
    sort_findings(&mut findings);
    stats.duration_ms = started_at.elapsed().as_millis();
    Ok(AnalysisResult {
        method: method.id.clone(),
        findings,
        inferred_contract,
        outcome: run.outcome,
        stats,
        coverage,
    })
}

fn line_at(method: &Method, offset: u32) -> Option<u32> {
    method
        .cfg
        .blocks
        .iter()
        .flat_map(|block| &block.instructions)
        .find(|instruction| instruction.offset == offset)
        .and_then(|instruction| instruction.line)
}

/// Aggregated results of a whole-program session.
#[derive(Debug, Default)]
pub(crate) struct ProgramReport {
    pub(crate) findings: Vec<Finding>,
    /// Inferred contracts that other methods may rely on.
    pub(crate) inferred: BTreeMap<MethodId, MethodContract>,
    pub(crate) aborted: BTreeMap<MethodId, RunOutcome>,
    pub(crate) coverage: InterpreterCoverage,
    pub(crate) analyzed_methods: usize,
    pub(crate) visits: usize,
    pub(crate) waves: usize,
    pub(crate) call_edges: usize,
}

/// Analyze every method of the program, callees before callers.
///
/// Methods of one wave run in parallel; contracts inferred in a wave become
/// visible to the waves after it. Contracts of methods that a program class
/// overrides are not published, since a call may dispatch to the override.
pub(crate) fn analyze_program(
    program: &Program,
    config: AnalysisConfig,
    token: &CancellationToken,
    telemetry: Option<&Telemetry>,
) -> Result<ProgramReport> {
    let env = Environment::new(program, config);
    env.contracts.start_session();
    debug!(
        "contract sources: {}",
        env.contracts.source_names().join(", ")
    );
    let graph = with_span(telemetry, "nullflow.callgraph", &[], || {
        build_call_graph(program)
    });
    let methods: BTreeMap<&MethodId, &Method> = program
        .methods
        .iter()
        .map(|method| (&method.id, method))
        .collect();
    let waves = graph.waves();
    let mut report = ProgramReport {
        waves: waves.len(),
        call_edges: graph.edge_count(),
        ..ProgramReport::default()
    };

    for (wave_index, wave) in waves.iter().enumerate() {
        let attributes = [
            KeyValue::new("nullflow.wave.index", wave_index as i64),
            KeyValue::new("nullflow.wave.method_count", wave.len() as i64),
        ];
        let results = with_span(telemetry, "nullflow.wave", &attributes, || {
            let parent = OtelContext::current();
            wave.par_iter()
                .filter_map(|id| methods.get(id).copied())
                .map(|method| {
                    let attributes = [KeyValue::new("nullflow.method", method.id.to_string())];
                    with_child_span(telemetry, "nullflow.method", &attributes, &parent, || {
                        let result = analyze(method, &env, token);
                        if result.is_err() {
                            // A failed method fails the session; stop the rest of the wave.
                            token.cancel();
                        }
                        result
                    })
                })
                .collect::<Vec<_>>()
        });

        for result in results {
            let result = result?;
            debug!(
                "{}: {} visits, {} values, {} exits in {} ms",
                result.method,
                result.stats.visits,
                result.stats.values,
                result.stats.terminals,
                result.stats.duration_ms
            );
            report.analyzed_methods += 1;
            report.visits += result.stats.visits;
            report.coverage.merge_from(&result.coverage);
            if result.outcome != RunOutcome::Completed {
                report.aborted.insert(result.method.clone(), result.outcome);
            }
            if let Some(contract) = result.inferred_contract {
                if !graph.is_overridden(&result.method) {
                    env.contracts.record_inferred(result.method.clone(), contract);
                }
            }
            report.findings.extend(result.findings);
        }
    }
    report.inferred = env.contracts.inferred();

    sort_findings(&mut report.findings);
    info!(
        "analyzed {} methods in {} waves: {} findings, {} inferred contracts, {} aborted",
        report.analyzed_methods,
        report.waves,
        report.findings.len(),
        report.inferred.len(),
        report.aborted.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, EdgeKind, FieldInfo, Nullness};
    use crate::report::FindingKind;
    use crate::test_harness::{
        MethodBuilder, ProgramBuilder, binary, branch, check_cast, get_field, invoke_static,
        invoke_interface, invoke_virtual, load, new, push_bool, push_int, push_null, put_field,
        ret, ret_void, store,
    };
    use crate::ir::InstructionKind;

    fn kinds(findings: &[Finding]) -> Vec<(u32, FindingKind)> {
        findings
            .iter()
            .map(|finding| (finding.location.offset, finding.kind))
            .collect()
    }

    fn analyze_alone(method: &Method) -> AnalysisResult {
        let env = ProgramBuilder::new().method(method.clone()).environment();
        analyze(method, &env, &CancellationToken::new()).expect("analysis")
    }

    fn analyze_with(method: &Method, others: Vec<Method>) -> AnalysisResult {
        let env = others
            .into_iter()
            .fold(ProgramBuilder::new(), ProgramBuilder::method)
            .method(method.clone())
            .environment();
        analyze(method, &env, &CancellationToken::new()).expect("analysis")
    }

    fn null_to_checker(checker: &str) -> Method {
        MethodBuilder::new("p/A", "run", "()V")
            .static_method()
            .block(
                0,
                vec![push_null(), invoke_static("p/A", "check", checker), ret_void()],
            )
            .build()
    }

    #[test]
    fn null_literal_dereference_is_reported() {
        let method = MethodBuilder::new("p/A", "run", "()V")
            .static_method()
            .block(
                0,
                vec![
                    push_null(),
                    store(0),
                    load(0),
                    invoke_virtual("java/lang/Object", "hashCode", "()I"),
                    ret_void(),
                ],
            )
            .build();

        let result = analyze_alone(&method);

        assert_eq!(kinds(&result.findings), vec![(3, FindingKind::NullDereference)]);
        assert!(result.findings[0].message().contains("local 0 is null"));
    }

    #[test]
    fn checked_parameter_is_not_reported() {
        let method = MethodBuilder::new("p/A", "run", "(Ljava/lang/Object;)V")
            .static_method()
            .block(0, vec![load(0), push_null(), binary(BinaryOp::Eq), branch()])
            .block(10, vec![ret_void()])
            .block(
                20,
                vec![
                    load(0),
                    invoke_virtual("java/lang/Object", "hashCode", "()I"),
                    ret_void(),
                ],
            )
            .edge(0, 10, EdgeKind::BranchTrue)
            .edge(0, 20, EdgeKind::BranchFalse)
            .build();

        let result = analyze_alone(&method);

        assert!(result.findings.is_empty(), "{:?}", result.findings);
    }

    #[test]
    fn repeated_null_check_is_always_false() {
        let method = MethodBuilder::new("p/A", "run", "(Ljava/lang/Object;)V")
            .static_method()
            .block(0, vec![load(0), push_null(), binary(BinaryOp::Eq), branch()])
            .block(10, vec![ret_void()])
            .block(20, vec![load(0), push_null(), binary(BinaryOp::Eq), branch()])
            .block(30, vec![ret_void()])
            .block(40, vec![ret_void()])
            .edge(0, 10, EdgeKind::BranchTrue)
            .edge(0, 20, EdgeKind::BranchFalse)
            .edge(20, 30, EdgeKind::BranchTrue)
            .edge(20, 40, EdgeKind::BranchFalse)
            .build();

        let result = analyze_alone(&method);

        assert_eq!(
            kinds(&result.findings),
            vec![(23, FindingKind::AlwaysFalseCondition)]
        );
    }

    #[test]
    fn nullable_parameter_dereference_is_a_warning() {
        let method = MethodBuilder::new("p/A", "run", "(Ljava/lang/Object;)I")
            .static_method()
            .param_nullness(vec![Nullness::Nullable])
            .block(
                0,
                vec![
                    load(0),
                    invoke_virtual("java/lang/Object", "hashCode", "()I"),
                    ret(),
                ],
            )
            .build();

        let result = analyze_alone(&method);
        assert_eq!(
            kinds(&result.findings),
            vec![(1, FindingKind::NullableDereference)]
        );

        let env = ProgramBuilder::new()
            .method(method.clone())
            .config(AnalysisConfig {
                report_nullable: false,
                ..AnalysisConfig::default()
            })
            .environment();
        let quiet = analyze(&method, &env, &CancellationToken::new()).expect("analysis");
        assert!(quiet.findings.is_empty());
    }

    #[test]
    fn require_non_null_on_null_violates_contract() {
        let method = MethodBuilder::new("p/A", "run", "()V")
            .static_method()
            .block(
                0,
                vec![
                    push_null(),
                    invoke_static(
                        "java/util/Objects",
                        "requireNonNull",
                        "(Ljava/lang/Object;)Ljava/lang/Object;",
                    ),
                    ret_void(),
                ],
            )
            .build();

        let result = analyze_alone(&method);

        assert_eq!(
            kinds(&result.findings),
            vec![(1, FindingKind::ContractViolated)]
        );
    }

    #[test]
    fn impossible_cast_is_reported() {
        let method = MethodBuilder::new("p/A", "run", "()V")
            .static_method()
            .block(
                0,
                vec![
                    new("java/lang/Integer"),
                    check_cast("java/lang/String"),
                    ret_void(),
                ],
            )
            .build();
        let program = ProgramBuilder::new()
            .class_named("java/lang/Integer", Some("java/lang/Number"))
            .class_named("java/lang/Number", Some("java/lang/Object"))
            .class_named("java/lang/String", Some("java/lang/Object"))
            .method(method.clone());

        let result = analyze(&method, &program.environment(), &CancellationToken::new())
            .expect("analysis");

        assert_eq!(
            kinds(&result.findings),
            vec![(1, FindingKind::CastAlwaysFails)]
        );
    }

    #[test]
    fn non_null_field_read_is_trusted() {
        let method = MethodBuilder::new("p/A", "run", "()I")
            .block(
                0,
                vec![
                    load(0),
                    get_field("p/A", "name"),
                    invoke_virtual("java/lang/Object", "hashCode", "()I"),
                    ret(),
                ],
            )
            .build();
        let env = ProgramBuilder::new()
            .class_named("p/A", Some("java/lang/Object"))
            .field(
                "p/A",
                FieldInfo {
                    name: "name".to_string(),
                    nullness: Nullness::NonNull,
                    is_final: true,
                    is_volatile: false,
                },
            )
            .method(method.clone())
            .environment();

        let result = analyze(&method, &env, &CancellationToken::new()).expect("analysis");

        assert!(result.findings.is_empty(), "{:?}", result.findings);
    }

    #[test]
    fn aborted_run_has_no_findings_or_contract() {
        let method = MethodBuilder::new("p/A", "run", "()Ljava/lang/Object;")
            .static_method()
            .block(0, vec![push_null(), store(0)])
            .block(10, vec![load(0), invoke_virtual("java/lang/Object", "hashCode", "()I")])
            .block(20, vec![push_null(), ret()])
            .edge(0, 10, EdgeKind::FallThrough)
            .edge(10, 20, EdgeKind::FallThrough)
            .build();
        let env = ProgramBuilder::new()
            .method(method.clone())
            .config(AnalysisConfig {
                max_states: 1,
                ..AnalysisConfig::default()
            })
            .environment();

        let result = analyze(&method, &env, &CancellationToken::new()).expect("analysis");

        assert_eq!(result.outcome, RunOutcome::TooComplex);
        assert!(result.findings.is_empty());
        assert!(result.inferred_contract.is_none());
    }

    #[test]
    fn inferred_contract_reaches_callers_in_later_waves() {
        let callee = MethodBuilder::new("p/A", "nothing", "()Ljava/lang/Object;")
            .static_method()
            .block(0, vec![push_null(), ret()])
            .build();
        let caller = MethodBuilder::new("p/A", "run", "()I")
            .static_method()
            .block(
                0,
                vec![
                    invoke_static("p/A", "nothing", "()Ljava/lang/Object;"),
                    invoke_virtual("java/lang/Object", "hashCode", "()I"),
                    ret(),
                ],
            )
            .build();
        let program = ProgramBuilder::new().method(callee).method(caller).program();

        let report = analyze_program(
            &program,
            AnalysisConfig::default(),
            &CancellationToken::new(),
            None,
        )
        .expect("analysis");

        assert_eq!(report.waves, 2);
        assert_eq!(
            report.inferred.get(&MethodId::new("p/A", "nothing", "()Ljava/lang/Object;"))
                .map(ToString::to_string)
                .as_deref(),
            Some("-> null")
        );
        let kinds: Vec<FindingKind> = report.findings.iter().map(|finding| finding.kind).collect();
        assert_eq!(kinds, vec![FindingKind::NullDereference]);
        assert_eq!(report.findings[0].location.method.name, "run");
    }

    #[test]
    fn loop_counter_terminates() {
        let method = MethodBuilder::new("p/A", "count", "()V")
            .static_method()
            .block(0, vec![push_int(0), store(0)])
            .block(
                10,
                vec![
                    load(0),
                    push_int(10),
                    binary(BinaryOp::Lt),
                    branch(),
                ],
            )
            .block(
                20,
                vec![load(0), push_int(1), binary(BinaryOp::Add), store(0)],
            )
            .block(30, vec![ret_void()])
            .edge(0, 10, EdgeKind::FallThrough)
            .edge(10, 20, EdgeKind::BranchTrue)
            .edge(10, 30, EdgeKind::BranchFalse)
            .edge(20, 10, EdgeKind::Jump)
            .build();

        let result = analyze_alone(&method);

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert!(result.findings.is_empty(), "{:?}", result.findings);
    }

    #[test]
    fn field_write_is_seen_by_later_read() {
        let method = MethodBuilder::new("p/A", "reset", "()V")
            .block(
                0,
                vec![
                    load(0),
                    push_null(),
                    put_field("p/A", "cache"),
                    load(0),
                    get_field("p/A", "cache"),
                    invoke_virtual("java/lang/Object", "hashCode", "()I"),
                    InstructionKind::Pop,
                    ret_void(),
                ],
            )
            .build();

        let result = analyze_alone(&method);

        assert_eq!(kinds(&result.findings), vec![(5, FindingKind::NullDereference)]);
    }

    #[test]
    fn mutating_unmodifiable_collection_is_reported() {
        let method = MethodBuilder::new("p/A", "fill", "()V")
            .static_method()
            .block(
                0,
                vec![
                    invoke_static("java/util/Collections", "emptyList", "()Ljava/util/List;"),
                    push_null(),
                    invoke_interface("java/util/List", "add", "(Ljava/lang/Object;)Z"),
                    InstructionKind::Pop,
                    ret_void(),
                ],
            )
            .build();

        let result = analyze_alone(&method);

        assert!(
            kinds(&result.findings).contains(&(2, FindingKind::UnmodifiableMutation)),
            "{:?}",
            result.findings
        );
    }

    #[test]
    fn declared_callee_contract_proves_failure() {
        let checker = MethodBuilder::new("p/A", "check", "(Ljava/lang/Object;)V")
            .static_method()
            .contract("null -> fail")
            .block(0, vec![ret_void()])
            .build();

        let result = analyze_with(&null_to_checker("(Ljava/lang/Object;)V"), vec![checker]);

        assert_eq!(kinds(&result.findings), vec![(1, FindingKind::ContractViolated)]);
    }

    #[test]
    fn varargs_guard_never_proves_failure() {
        let checker = MethodBuilder::new("p/A", "check", "([Ljava/lang/Object;)V")
            .static_method()
            .varargs()
            .contract("null -> fail")
            .block(0, vec![ret_void()])
            .build();

        let result = analyze_with(&null_to_checker("([Ljava/lang/Object;)V"), vec![checker]);

        assert!(result.findings.is_empty(), "{:?}", result.findings);
    }

    #[test]
    fn null_returned_from_non_null_method_is_reported() {
        let method = MethodBuilder::new("p/A", "label", "()Ljava/lang/String;")
            .static_method()
            .returns(Nullness::NonNull)
            .block(0, vec![push_null(), ret()])
            .build();

        let result = analyze_alone(&method);

        assert_eq!(kinds(&result.findings), vec![(1, FindingKind::NullReturn)]);
    }

    fn null_check_returning(contract: &str, when_null: bool) -> Method {
        MethodBuilder::new("p/A", "isNull", "(Ljava/lang/Object;)Z")
            .static_method()
            .contract(contract)
            .block(0, vec![load(0), push_null(), binary(BinaryOp::Eq), branch()])
            .block(10, vec![push_bool(when_null), ret()])
            .block(20, vec![push_bool(!when_null), ret()])
            .edge(0, 10, EdgeKind::BranchTrue)
            .edge(0, 20, EdgeKind::BranchFalse)
            .build()
    }

    #[test]
    fn body_contradicting_declared_contract_is_reported() {
        let method = null_check_returning("null -> false", true);

        let result = analyze_alone(&method);

        assert_eq!(kinds(&result.findings), vec![(11, FindingKind::ContractMismatch)]);
        let message = result.findings[0].message();
        assert!(message.contains("null -> false"), "{message}");
        assert!(message.contains("constant true"), "{message}");
        assert!(result.inferred_contract.is_none());
    }

    #[test]
    fn body_honouring_declared_contract_is_quiet() {
        let method = null_check_returning("null -> true; !null -> false", true);

        let result = analyze_alone(&method);

        assert!(result.findings.is_empty(), "{:?}", result.findings);
    }

    #[test]
    fn fail_clause_with_normal_return_is_reported() {
        let method = MethodBuilder::new("p/A", "check", "(Ljava/lang/Object;)V")
            .static_method()
            .contract("null -> fail")
            .block(0, vec![ret_void()])
            .build();

        let result = analyze_alone(&method);

        assert_eq!(kinds(&result.findings), vec![(0, FindingKind::ContractMismatch)]);
        assert!(result.findings[0].message().contains("a normal return"));
    }

    #[test]
    fn dereferencing_returned_non_null_parameter_is_quiet() {
        let callee = MethodBuilder::new("p/A", "keep", "(Ljava/lang/Object;)Ljava/lang/Object;")
            .static_method()
            .param_nullness(vec![Nullness::NonNull])
            .block(0, vec![load(0), ret()])
            .build();
        let caller = MethodBuilder::new("p/A", "run", "(Ljava/lang/Object;)I")
            .static_method()
            .block(
                0,
                vec![
                    load(0),
                    invoke_static("p/A", "keep", "(Ljava/lang/Object;)Ljava/lang/Object;"),
                    invoke_virtual("java/lang/Object", "hashCode", "()I"),
                    ret(),
                ],
            )
            .build();
        let program = ProgramBuilder::new().method(callee).method(caller).program();

        let report = analyze_program(
            &program,
            AnalysisConfig::default(),
            &CancellationToken::new(),
            None,
        )
        .expect("analysis");

        assert!(report.findings.is_empty(), "{:?}", report.findings);
        assert_eq!(
            report
                .inferred
                .get(&MethodId::new("p/A", "keep", "(Ljava/lang/Object;)Ljava/lang/Object;"))
                .map(ToString::to_string)
                .as_deref(),
            Some("_ -> param1")
        );
    }
}
