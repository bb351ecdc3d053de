mod callgraph;
mod contracts;
mod dataflow;
mod descriptor;
mod engine;
mod hierarchy;
mod input;
mod ir;
mod report;
mod telemetry;
#[cfg(test)]
mod test_harness;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;
use serde_json::json;
use serde_sarif::sarif::{
    Artifact, ArtifactLocation, Invocation, PropertyBag, Run, SCHEMA_URL, Sarif, Tool,
    ToolComponent,
};

use crate::dataflow::context::{AnalysisConfig, CancellationToken};
use crate::engine::{ProgramReport, analyze_program};
use crate::input::load_program;
use crate::ir::Program;
use crate::report::{rule_descriptors, sarif_result, source_uri};
use crate::telemetry::{Telemetry, current_trace_id, init_logging, with_span};

/// CLI arguments for nullflow execution.
#[derive(Parser, Debug)]
#[command(
    name = "nullflow",
    about = "Nullability and contract dataflow analysis with SARIF output.",
    version
)]
struct Cli {
    /// Program document (JSON) to analyze.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Where to write SARIF; `-` or absent means stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Ceiling on processed (block, state) visits per method.
    #[arg(long, value_name = "N")]
    max_states: Option<usize>,
    #[arg(long)]
    no_inference: bool,
    #[arg(long)]
    no_nullable_warnings: bool,
    /// Cancel analyses still running after this many milliseconds.
    #[arg(long, value_name = "N")]
    timeout_ms: Option<u64>,
    /// OTLP/HTTP collector endpoint for trace export.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if !cli.quiet {
        init_logging();
    }
    let telemetry = cli.otel.clone().map(Telemetry::new).transpose()?;
    let result = with_span(telemetry.as_ref(), "nullflow.run", &[], || {
        run(&cli, telemetry.as_ref())
    });
    if let Some(telemetry) = &telemetry {
        telemetry.shutdown()?;
    }
    result
}

fn run(cli: &Cli, telemetry: Option<&Telemetry>) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }

    let started_at = Instant::now();
    let load_started_at = Instant::now();
    let program = with_span(telemetry, "nullflow.load", &[], || load_program(&cli.input))?;
    let load_duration_ms = load_started_at.elapsed().as_millis();

    let config = analysis_config(cli);
    let token = match cli.timeout_ms {
        Some(timeout) => CancellationToken::with_deadline(Duration::from_millis(timeout)),
        None => CancellationToken::new(),
    };
    let analyze_started_at = Instant::now();
    let attributes = [KeyValue::new(
        "nullflow.method_count",
        program.methods.len() as i64,
    )];
    let report = with_span(telemetry, "nullflow.analyze", &attributes, || {
        analyze_program(&program, config, &token, telemetry)
    })?;
    let analyze_duration_ms = analyze_started_at.elapsed().as_millis();

    let invocation = build_invocation(&InvocationStats {
        load_duration_ms,
        analyze_duration_ms,
        report: &report,
    });
    let sarif = build_sarif(&program, &report, invocation);

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &sarif)
        .context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} load_ms={} analyze_ms={} methods={} waves={} visits={}",
            started_at.elapsed().as_millis(),
            load_duration_ms,
            analyze_duration_ms,
            report.analyzed_methods,
            report.waves,
            report.visits
        );
    }

    Ok(())
}

fn analysis_config(cli: &Cli) -> AnalysisConfig {
    let defaults = AnalysisConfig::default();
    AnalysisConfig {
        max_states: cli.max_states.unwrap_or(defaults.max_states),
        infer_contracts: !cli.no_inference,
        report_nullable: !cli.no_nullable_warnings,
        ..defaults
    }
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

/// Metadata captured for SARIF invocation properties.
struct InvocationStats<'a> {
    load_duration_ms: u128,
    analyze_duration_ms: u128,
    report: &'a ProgramReport,
}

fn build_invocation(stats: &InvocationStats<'_>) -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");
    let report = stats.report;
    let inferred: BTreeMap<String, String> = report
        .inferred
        .iter()
        .map(|(method, contract)| (method.to_string(), contract.to_string()))
        .collect();
    let aborted: BTreeMap<String, &str> = report
        .aborted
        .iter()
        .map(|(method, outcome)| (method.to_string(), outcome.name()))
        .collect();

    let mut properties = BTreeMap::new();
    properties.insert("nullflow.load_ms".to_string(), json!(stats.load_duration_ms));
    properties.insert(
        "nullflow.analyze_ms".to_string(),
        json!(stats.analyze_duration_ms),
    );
    properties.insert(
        "nullflow.analyzed_methods".to_string(),
        json!(report.analyzed_methods),
    );
    properties.insert("nullflow.waves".to_string(), json!(report.waves));
    properties.insert("nullflow.call_edges".to_string(), json!(report.call_edges));
    properties.insert("nullflow.inferred_contracts".to_string(), json!(inferred));
    properties.insert("nullflow.aborted_methods".to_string(), json!(aborted));
    properties.insert(
        "nullflow.interpreter".to_string(),
        json!({
            "handled": report.coverage.handled,
            "contract_applied": report.coverage.contract_applied,
            "contract_splits": report.coverage.contract_splits,
            "flushed_calls": report.coverage.flushed_calls,
            "fallback": report.coverage.fallback,
            "fallback_ops": report.coverage.fallback_ops(),
        }),
    );
    if let Some(trace_id) = current_trace_id() {
        properties.insert("nullflow.trace_id".to_string(), json!(trace_id));
    }

    Invocation::builder()
        .execution_successful(true)
        .arguments(arguments)
        .command_line(command_line)
        .properties(PropertyBag::builder().additional_properties(properties).build())
        .build()
}

fn build_sarif(program: &Program, report: &ProgramReport, invocation: Invocation) -> Sarif {
    let sources: BTreeMap<&str, Option<&str>> = program
        .classes
        .iter()
        .map(|class| (class.name.as_str(), class.source_file.as_deref()))
        .collect();
    let mut artifact_uris = BTreeSet::new();
    let results: Vec<serde_sarif::sarif::Result> = report
        .findings
        .iter()
        .map(|finding| {
            let owner = finding.location.method.owner.as_str();
            let uri = source_uri(owner, sources.get(owner).copied().flatten());
            if let Some(uri) = &uri {
                artifact_uris.insert(uri.clone());
            }
            sarif_result(finding, uri.as_deref())
        })
        .collect();
    let artifacts: Vec<Artifact> = artifact_uris
        .into_iter()
        .map(|uri| {
            Artifact::builder()
                .location(ArtifactLocation::builder().uri(uri).build())
                .build()
        })
        .collect();

    let driver = ToolComponent::builder()
        .name("nullflow")
        .information_uri("https://github.com/nullflow/nullflow")
        .rules(rule_descriptors())
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}
