use std::collections::BTreeMap;
use std::fmt;

use serde_json::json;
use serde_sarif::sarif::{
    ArtifactLocation, Location, LogicalLocation, Message, MultiformatMessageString,
    PhysicalLocation, PropertyBag, Region, ReportingDescriptor, Result as SarifResult,
};

use crate::dataflow::facts::Nullability;
use crate::ir::MethodId;

/// Kinds of problems the analysis reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum FindingKind {
    NullDereference,
    NullableDereference,
    AlwaysTrueCondition,
    AlwaysFalseCondition,
    ConstantCondition,
    ContractViolated,
    ContractMismatch,
    NullArgument,
    NullReturn,
    CastAlwaysFails,
    UnmodifiableMutation,
}

impl FindingKind {
    pub(crate) const ALL: [FindingKind; 11] = [
        FindingKind::NullDereference,
        FindingKind::NullableDereference,
        FindingKind::AlwaysTrueCondition,
        FindingKind::AlwaysFalseCondition,
        FindingKind::ConstantCondition,
        FindingKind::ContractViolated,
        FindingKind::ContractMismatch,
        FindingKind::NullArgument,
        FindingKind::NullReturn,
        FindingKind::CastAlwaysFails,
        FindingKind::UnmodifiableMutation,
    ];

    pub(crate) fn id(self) -> &'static str {
        match self {
            FindingKind::NullDereference => "NULL_DEREFERENCE",
            FindingKind::NullableDereference => "NULLABLE_DEREFERENCE",
            FindingKind::AlwaysTrueCondition => "ALWAYS_TRUE_CONDITION",
            FindingKind::AlwaysFalseCondition => "ALWAYS_FALSE_CONDITION",
            FindingKind::ConstantCondition => "CONSTANT_CONDITION",
            FindingKind::ContractViolated => "CONTRACT_VIOLATED",
            FindingKind::ContractMismatch => "CONTRACT_MISMATCH",
            FindingKind::NullArgument => "NULL_ARGUMENT",
            FindingKind::NullReturn => "NULL_RETURN",
            FindingKind::CastAlwaysFails => "CAST_ALWAYS_FAILS",
            FindingKind::UnmodifiableMutation => "UNMODIFIABLE_MUTATION",
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            FindingKind::NullDereference => "Null dereference",
            FindingKind::NullableDereference => "Possible null dereference",
            FindingKind::AlwaysTrueCondition => "Condition is always true",
            FindingKind::AlwaysFalseCondition => "Condition is always false",
            FindingKind::ConstantCondition => "Comparison has a constant result",
            FindingKind::ContractViolated => "Call always fails",
            FindingKind::ContractMismatch => "Method breaks its declared contract",
            FindingKind::NullArgument => "Null passed to non-null parameter",
            FindingKind::NullReturn => "Null returned from non-null method",
            FindingKind::CastAlwaysFails => "Cast always fails",
            FindingKind::UnmodifiableMutation => "Mutation of unmodifiable collection",
        }
    }

    pub(crate) fn description(self) -> &'static str {
        match self {
            FindingKind::NullDereference => {
                "A value that is null on every path reaching this point is dereferenced."
            }
            FindingKind::NullableDereference => {
                "A value that may be null on some path is dereferenced."
            }
            FindingKind::AlwaysTrueCondition => "A branch condition never evaluates to false.",
            FindingKind::AlwaysFalseCondition => "A branch condition never evaluates to true.",
            FindingKind::ConstantCondition => {
                "A comparison whose result does not depend on the executed path."
            }
            FindingKind::ContractViolated => {
                "The callee's contract guarantees that this call throws."
            }
            FindingKind::ContractMismatch => {
                "An exit of the method contradicts a clause of its own contract."
            }
            FindingKind::NullArgument => {
                "A null value is passed to a parameter declared not-null."
            }
            FindingKind::NullReturn => "A method declared not-null may return null.",
            FindingKind::CastAlwaysFails => {
                "A non-null value is cast to a type it can never have."
            }
            FindingKind::UnmodifiableMutation => {
                "A mutating method is called on a collection created unmodifiable."
            }
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct FindingLocation {
    pub(crate) method: MethodId,
    pub(crate) offset: u32,
    pub(crate) line: Option<u32>,
}

/// One link of the fact chain justifying a finding.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct Explanation {
    pub(crate) subject: String,
    pub(crate) fact: String,
}

impl Explanation {
    pub(crate) fn new(subject: impl Into<String>, fact: impl ToString) -> Self {
        Self {
            subject: subject.into(),
            fact: fact.to_string(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Finding {
    pub(crate) location: FindingLocation,
    pub(crate) kind: FindingKind,
    pub(crate) explanation: Vec<Explanation>,
}

impl Finding {
    pub(crate) fn message(&self) -> String {
        if self.explanation.is_empty() {
            return self.kind.name().to_string();
        }
        let chain: Vec<String> = self
            .explanation
            .iter()
            .map(|link| format!("{} is {}", link.subject, link.fact))
            .collect();
        format!("{}: {}", self.kind.name(), chain.join(", "))
    }
}

/// Operation that needs a non-null operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum DereferenceKind {
    Field,
    Call,
    Array,
    Throw,
    Monitor,
    Unbox,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum SiteKind {
    Dereference(DereferenceKind),
    Branch,
    Comparison,
    Call,
    Argument(usize),
    Return,
    Cast,
    Mutation,
    Contract,
}

#[derive(Clone, Debug, Default)]
struct SiteRecord {
    line: Option<u32>,
    visits: usize,
    definite: usize,
    possible: usize,
    saw_true: bool,
    saw_false: bool,
    undecided: bool,
    literal: bool,
    explanation: Vec<Explanation>,
}

impl SiteRecord {
    fn explain(&mut self, explanation: Vec<Explanation>) {
        if self.explanation.is_empty() {
            self.explanation = explanation;
        }
    }
}

/// Per-site aggregates collected while the fixpoint runs.
#[derive(Clone, Debug)]
pub(crate) struct Observations {
    method: MethodId,
    sites: BTreeMap<(u32, SiteKind), SiteRecord>,
}

impl Observations {
    pub(crate) fn new(method: MethodId) -> Self {
        Self {
            method,
            sites: BTreeMap::new(),
        }
    }

    fn site(&mut self, offset: u32, line: Option<u32>, kind: SiteKind) -> &mut SiteRecord {
        let record = self.sites.entry((offset, kind)).or_default();
        record.line = record.line.or(line);
        record.visits += 1;
        record
    }

    pub(crate) fn record_dereference(
        &mut self,
        offset: u32,
        line: Option<u32>,
        kind: DereferenceKind,
        nullability: Nullability,
        explanation: Vec<Explanation>,
    ) {
        let record = self.site(offset, line, SiteKind::Dereference(kind));
        match nullability {
            Nullability::Null => record.definite += 1,
            Nullability::Nullable => record.possible += 1,
            _ => return,
        }
        record.explain(explanation);
    }

    /// Outcomes that were feasible on one visit of a branch.
    pub(crate) fn record_branch(
        &mut self,
        offset: u32,
        line: Option<u32>,
        can_be_true: bool,
        can_be_false: bool,
        literal: bool,
        explanation: Vec<Explanation>,
    ) {
        let record = self.site(offset, line, SiteKind::Branch);
        record.saw_true |= can_be_true;
        record.saw_false |= can_be_false;
        record.literal |= literal;
        if can_be_true != can_be_false {
            record.explain(explanation);
        }
    }

    pub(crate) fn record_comparison(
        &mut self,
        offset: u32,
        line: Option<u32>,
        outcome: Option<bool>,
        literal: bool,
        explanation: Vec<Explanation>,
    ) {
        let record = self.site(offset, line, SiteKind::Comparison);
        match outcome {
            Some(true) => record.saw_true = true,
            Some(false) => record.saw_false = true,
            None => record.undecided = true,
        }
        record.literal |= literal;
        if outcome.is_some() {
            record.explain(explanation);
        }
    }

    pub(crate) fn record_call(
        &mut self,
        offset: u32,
        line: Option<u32>,
        fails: bool,
        explanation: Vec<Explanation>,
    ) {
        let record = self.site(offset, line, SiteKind::Call);
        if fails {
            record.definite += 1;
            record.explain(explanation);
        }
    }

    /// Argument passed to a parameter declared not-null.
    pub(crate) fn record_argument(
        &mut self,
        offset: u32,
        line: Option<u32>,
        index: usize,
        nullability: Nullability,
        explanation: Vec<Explanation>,
    ) {
        let record = self.site(offset, line, SiteKind::Argument(index));
        match nullability {
            Nullability::Null => record.definite += 1,
            Nullability::Nullable => record.possible += 1,
            _ => return,
        }
        record.explain(explanation);
    }

    /// Value returned from a method declared not-null.
    pub(crate) fn record_return(
        &mut self,
        offset: u32,
        line: Option<u32>,
        nullability: Nullability,
        explanation: Vec<Explanation>,
    ) {
        let record = self.site(offset, line, SiteKind::Return);
        match nullability {
            Nullability::Null => record.definite += 1,
            Nullability::Nullable => record.possible += 1,
            _ => return,
        }
        record.explain(explanation);
    }

    pub(crate) fn record_cast(
        &mut self,
        offset: u32,
        line: Option<u32>,
        always_fails: bool,
        explanation: Vec<Explanation>,
    ) {
        let record = self.site(offset, line, SiteKind::Cast);
        if always_fails {
            record.definite += 1;
            record.explain(explanation);
        }
    }

    pub(crate) fn record_mutation(
        &mut self,
        offset: u32,
        line: Option<u32>,
        unmodifiable: bool,
        explanation: Vec<Explanation>,
    ) {
        let record = self.site(offset, line, SiteKind::Mutation);
        if unmodifiable {
            record.definite += 1;
            record.explain(explanation);
        }
    }

    /// Method exit that contradicts a clause of the method's declared contract.
    pub(crate) fn record_contract_mismatch(
        &mut self,
        offset: u32,
        line: Option<u32>,
        explanation: Vec<Explanation>,
    ) {
        let record = self.site(offset, line, SiteKind::Contract);
        record.definite += 1;
        record.explain(explanation);
    }

    /// Turn aggregates into findings sorted by offset and kind.
    pub(crate) fn into_findings(self, report_nullable: bool) -> Vec<Finding> {
        let mut findings = Vec::new();
        for ((offset, site), record) in self.sites {
            let always = record.visits > 0 && record.definite == record.visits;
            let sometimes = record.definite + record.possible > 0;
            let kind = match site {
                SiteKind::Dereference(_) if always => Some(FindingKind::NullDereference),
                SiteKind::Dereference(_) if sometimes && report_nullable => {
                    Some(FindingKind::NullableDereference)
                }
                SiteKind::Dereference(_) => None,
                SiteKind::Branch if record.literal => None,
                SiteKind::Branch => match (record.saw_true, record.saw_false) {
                    (true, false) => Some(FindingKind::AlwaysTrueCondition),
                    (false, true) => Some(FindingKind::AlwaysFalseCondition),
                    _ => None,
                },
                SiteKind::Comparison => (!record.literal
                    && !record.undecided
                    && record.saw_true != record.saw_false)
                    .then_some(FindingKind::ConstantCondition),
                SiteKind::Call => always.then_some(FindingKind::ContractViolated),
                SiteKind::Argument(_) => (record.definite > 0
                    || (record.possible > 0 && report_nullable))
                    .then_some(FindingKind::NullArgument),
                SiteKind::Return => (record.definite > 0
                    || (record.possible > 0 && report_nullable))
                    .then_some(FindingKind::NullReturn),
                SiteKind::Cast => always.then_some(FindingKind::CastAlwaysFails),
                SiteKind::Mutation => sometimes.then_some(FindingKind::UnmodifiableMutation),
                SiteKind::Contract => Some(FindingKind::ContractMismatch),
            };
            if let Some(kind) = kind {
                findings.push(Finding {
                    location: FindingLocation {
                        method: self.method.clone(),
                        offset,
                        line: record.line,
                    },
                    kind,
                    explanation: record.explanation,
                });
            }
        }
        sort_findings(&mut findings);
        findings
    }
}

pub(crate) fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|left, right| {
        left.location
            .method
            .cmp(&right.location.method)
            .then(left.location.offset.cmp(&right.location.offset))
            .then(left.kind.cmp(&right.kind))
    });
}

/// Rules for every finding kind, in id order.
pub(crate) fn rule_descriptors() -> Vec<ReportingDescriptor> {
    let mut kinds = FindingKind::ALL.to_vec();
    kinds.sort_by_key(|kind| kind.id());
    kinds
        .into_iter()
        .map(|kind| {
            ReportingDescriptor::builder()
                .id(kind.id())
                .name(kind.name())
                .short_description(
                    MultiformatMessageString::builder()
                        .text(kind.description())
                        .build(),
                )
                .build()
        })
        .collect()
}

pub(crate) fn method_logical_location(method: &MethodId) -> LogicalLocation {
    LogicalLocation::builder()
        .name(method.to_string())
        .kind("function")
        .build()
}

pub(crate) fn method_location_with_line(
    method: &MethodId,
    artifact_uri: Option<&str>,
    line: Option<u32>,
) -> Location {
    let logical = method_logical_location(method);
    let Some(uri) = artifact_uri else {
        return Location::builder().logical_locations(vec![logical]).build();
    };
    let artifact_location = ArtifactLocation::builder().uri(uri.to_string()).build();
    let physical = if let Some(line) = line {
        let region = Region::builder().start_line(line as i64).build();
        PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .region(region)
            .build()
    } else {
        PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .build()
    };
    Location::builder()
        .logical_locations(vec![logical])
        .physical_location(physical)
        .build()
}

/// Source path of a class: its package directory joined with the declared source file.
pub(crate) fn source_uri(class_name: &str, source_file: Option<&str>) -> Option<String> {
    let source_file = source_file?;
    match class_name.rsplit_once('/') {
        Some((package, _)) => Some(format!("{package}/{source_file}")),
        None => Some(source_file.to_string()),
    }
}

pub(crate) fn result_message(text: impl Into<String>) -> Message {
    Message::builder().text(text.into()).build()
}

pub(crate) fn sarif_result(finding: &Finding, artifact_uri: Option<&str>) -> SarifResult {
    let location =
        method_location_with_line(&finding.location.method, artifact_uri, finding.location.line);
    let chain: Vec<serde_json::Value> = finding
        .explanation
        .iter()
        .map(|link| json!({ "subject": link.subject, "fact": link.fact }))
        .collect();
    let mut properties = BTreeMap::new();
    properties.insert("nullflow.offset".to_string(), json!(finding.location.offset));
    properties.insert("nullflow.explanation".to_string(), json!(chain));
    let mut result = SarifResult::builder()
        .message(result_message(finding.message()))
        .locations(vec![location])
        .properties(PropertyBag::builder().additional_properties(properties).build())
        .build();
    result.rule_id = Some(finding.kind.id().to_string());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method() -> MethodId {
        MethodId::new("p/A", "run", "(Ljava/lang/String;)V")
    }

    #[test]
    fn dereference_null_on_every_visit_is_definite() {
        let mut observations = Observations::new(method());
        for _ in 0..2 {
            observations.record_dereference(
                4,
                Some(7),
                DereferenceKind::Call,
                Nullability::Null,
                vec![Explanation::new("local 1", Nullability::Null)],
            );
        }
        let findings = observations.into_findings(true);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::NullDereference);
        assert_eq!(findings[0].location.line, Some(7));
        assert_eq!(
            findings[0].message(),
            "Null dereference: local 1 is null"
        );
    }

    #[test]
    fn partially_null_dereference_respects_nullable_switch() {
        let build = || {
            let mut observations = Observations::new(method());
            observations.record_dereference(
                4,
                None,
                DereferenceKind::Field,
                Nullability::Nullable,
                Vec::new(),
            );
            observations.record_dereference(
                4,
                None,
                DereferenceKind::Field,
                Nullability::NotNull,
                Vec::new(),
            );
            observations
        };
        let findings = build().into_findings(true);
        assert_eq!(findings[0].kind, FindingKind::NullableDereference);
        assert!(build().into_findings(false).is_empty());
    }

    #[test]
    fn branch_with_one_outcome_is_reported_unless_literal() {
        let mut observations = Observations::new(method());
        observations.record_branch(10, None, false, true, false, Vec::new());
        observations.record_branch(20, None, true, false, true, Vec::new());
        observations.record_branch(30, None, true, false, false, Vec::new());
        observations.record_branch(30, None, false, true, false, Vec::new());
        let findings = observations.into_findings(true);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::AlwaysFalseCondition);
        assert_eq!(findings[0].location.offset, 10);
    }

    #[test]
    fn findings_sort_by_offset_then_kind() {
        let mut observations = Observations::new(method());
        observations.record_cast(9, None, true, Vec::new());
        observations.record_call(3, None, true, Vec::new());
        observations.record_argument(3, None, 0, Nullability::Null, Vec::new());
        let kinds: Vec<FindingKind> = observations
            .into_findings(true)
            .into_iter()
            .map(|finding| finding.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                FindingKind::ContractViolated,
                FindingKind::NullArgument,
                FindingKind::CastAlwaysFails
            ]
        );
    }

    #[test]
    fn rule_descriptors_cover_every_kind() {
        let rules = rule_descriptors();
        assert_eq!(rules.len(), FindingKind::ALL.len());
        let mut ids: Vec<&str> = rules.iter().map(|rule| rule.id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), FindingKind::ALL.len());
    }

    #[test]
    fn sarif_result_carries_rule_and_physical_location() {
        let finding = Finding {
            location: FindingLocation {
                method: method(),
                offset: 4,
                line: Some(12),
            },
            kind: FindingKind::NullReturn,
            explanation: vec![Explanation::new("null", Nullability::Null)],
        };
        let uri = source_uri("p/A", Some("A.java"));
        let value = serde_json::to_value(sarif_result(&finding, uri.as_deref())).expect("json");
        assert_eq!(value["ruleId"], "NULL_RETURN");
        assert_eq!(
            value["locations"][0]["physicalLocation"]["artifactLocation"]["uri"],
            "p/A.java"
        );
        assert_eq!(
            value["locations"][0]["physicalLocation"]["region"]["startLine"],
            12
        );
        assert_eq!(
            value["locations"][0]["logicalLocations"][0]["name"],
            "p/A.run(Ljava/lang/String;)V"
        );
        assert_eq!(value["properties"]["nullflow.offset"], 4);
    }
}
