use std::collections::BTreeMap;

use dashmap::DashMap;
use tracing::warn;

use crate::contracts::syntax::{MethodContract, parse_contract};
use crate::descriptor::method_param_count;
use crate::ir::{MethodId, Nullness, Program};

pub(crate) mod evaluate;
pub(crate) mod inference;
pub(crate) mod syntax;

/// Built-in contract tables for library methods.
pub(crate) mod hardcoded {
    // Table modules are auto-discovered by build.rs.
    include!(concat!(env!("OUT_DIR"), "/contract_tables.rs"));
}

/// Everything known about a method without looking at its body.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct DeclaredMethod {
    pub(crate) contract: Option<MethodContract>,
    pub(crate) pure: bool,
    pub(crate) return_nullness: Nullness,
    pub(crate) parameter_nullness: Vec<Nullness>,
    pub(crate) returns_unmodifiable: bool,
    pub(crate) varargs: bool,
}

impl DeclaredMethod {
    pub(crate) fn parameter(&self, index: usize) -> Nullness {
        self.parameter_nullness
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    /// Fill attributes still unknown here from a lower-priority source.
    fn merge_from(&mut self, other: DeclaredMethod) {
        if self.contract.is_none() {
            self.contract = other.contract;
        }
        self.pure |= other.pure;
        if self.return_nullness == Nullness::Unknown {
            self.return_nullness = other.return_nullness;
        }
        if self.parameter_nullness.len() < other.parameter_nullness.len() {
            self.parameter_nullness
                .resize(other.parameter_nullness.len(), Nullness::Unknown);
        }
        for (index, nullness) in other.parameter_nullness.into_iter().enumerate() {
            if self.parameter_nullness[index] == Nullness::Unknown {
                self.parameter_nullness[index] = nullness;
            }
        }
        self.returns_unmodifiable |= other.returns_unmodifiable;
        self.varargs |= other.varargs;
    }
}

/// Provider of declared method information.
pub(crate) trait ContractSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn lookup(&self, method: &MethodId) -> Option<DeclaredMethod>;
}

fn parse_declared_contract(source: &str, method: &MethodId, text: &str) -> Option<MethodContract> {
    let parsed = method_param_count(&method.descriptor)
        .and_then(|count| parse_contract(text, count));
    match parsed {
        Ok(contract) if contract.is_empty() => None,
        Ok(contract) => Some(contract),
        Err(err) => {
            warn!("ignoring {source} contract `{text}` on {method}: {err:#}");
            None
        }
    }
}

/// Declarations carried by the input program: annotations and the analyzed methods themselves.
pub(crate) struct AnnotationContracts {
    methods: BTreeMap<MethodId, DeclaredMethod>,
}

impl AnnotationContracts {
    pub(crate) fn new(program: &Program) -> Self {
        let mut methods: BTreeMap<MethodId, DeclaredMethod> = BTreeMap::new();
        for annotation in &program.annotations {
            let declared = DeclaredMethod {
                contract: annotation.contract.as_deref().and_then(|text| {
                    parse_declared_contract("annotated", &annotation.method, text)
                }),
                pure: annotation.pure,
                return_nullness: annotation.return_nullness,
                parameter_nullness: annotation.parameter_nullness.clone(),
                returns_unmodifiable: annotation.returns_unmodifiable,
                varargs: false,
            };
            methods
                .entry(annotation.method.clone())
                .or_default()
                .merge_from(declared);
        }
        for method in &program.methods {
            let declared = DeclaredMethod {
                contract: method
                    .contract
                    .as_deref()
                    .and_then(|text| parse_declared_contract("declared", &method.id, text)),
                pure: method.pure,
                return_nullness: method.nullness.return_nullness,
                parameter_nullness: method.nullness.parameter_nullness.clone(),
                returns_unmodifiable: false,
                varargs: method.access.is_varargs,
            };
            methods.entry(method.id.clone()).or_default().merge_from(declared);
        }
        Self { methods }
    }
}

impl ContractSource for AnnotationContracts {
    fn name(&self) -> &'static str {
        "annotations"
    }

    fn lookup(&self, method: &MethodId) -> Option<DeclaredMethod> {
        self.methods.get(method).cloned()
    }
}

/// One built-in entry. `owner` and `descriptor` accept `*` as a wildcard.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HardcodedContract {
    pub(crate) owner: &'static str,
    pub(crate) name: &'static str,
    pub(crate) descriptor: &'static str,
    pub(crate) contract: Option<&'static str>,
    pub(crate) pure: bool,
    pub(crate) return_nullness: Nullness,
    pub(crate) returns_unmodifiable: bool,
}

impl HardcodedContract {
    pub(crate) const fn method(owner: &'static str, name: &'static str, descriptor: &'static str) -> Self {
        Self {
            owner,
            name,
            descriptor,
            contract: None,
            pure: false,
            return_nullness: Nullness::Unknown,
            returns_unmodifiable: false,
        }
    }

    pub(crate) const fn contract(mut self, text: &'static str) -> Self {
        self.contract = Some(text);
        self
    }

    pub(crate) const fn pure(mut self) -> Self {
        self.pure = true;
        self
    }

    pub(crate) const fn not_null(mut self) -> Self {
        self.return_nullness = Nullness::NonNull;
        self
    }

    pub(crate) const fn unmodifiable(mut self) -> Self {
        self.returns_unmodifiable = true;
        self.return_nullness = Nullness::NonNull;
        self
    }

    fn matches(&self, method: &MethodId) -> bool {
        (self.owner == "*" || self.owner == method.owner)
            && self.name == method.name
            && (self.descriptor == "*" || self.descriptor == method.descriptor)
    }

    fn declared(&self, method: &MethodId) -> DeclaredMethod {
        DeclaredMethod {
            contract: self
                .contract
                .and_then(|text| parse_declared_contract("built-in", method, text)),
            pure: self.pure,
            return_nullness: self.return_nullness,
            parameter_nullness: Vec::new(),
            returns_unmodifiable: self.returns_unmodifiable,
            varargs: false,
        }
    }
}

/// A named group of built-in entries.
pub(crate) struct ContractTable {
    pub(crate) name: &'static str,
    pub(crate) entries: &'static [HardcodedContract],
}

inventory::collect!(ContractTable);

/// Macro to register a built-in contract table.
///
/// Usage: `register_contracts!("group", ENTRIES);`
#[macro_export]
macro_rules! register_contracts {
    ($name:expr, $entries:expr) => {
        inventory::submit! {
            $crate::contracts::ContractTable {
                name: $name,
                entries: $entries,
            }
        }
    };
}

/// Returns all registered tables sorted by name.
pub(crate) fn all_tables() -> Vec<&'static ContractTable> {
    let mut tables: Vec<&'static ContractTable> = inventory::iter::<ContractTable>
        .into_iter()
        .collect();
    tables.sort_by_key(|table| table.name);
    tables
}

/// Library contracts shipped with the analyzer.
pub(crate) struct HardcodedContracts {
    by_name: BTreeMap<&'static str, Vec<HardcodedContract>>,
}

impl HardcodedContracts {
    pub(crate) fn new() -> Self {
        let mut by_name: BTreeMap<&'static str, Vec<HardcodedContract>> = BTreeMap::new();
        for table in all_tables() {
            for entry in table.entries {
                by_name.entry(entry.name).or_default().push(*entry);
            }
        }
        Self { by_name }
    }
}

impl ContractSource for HardcodedContracts {
    fn name(&self) -> &'static str {
        "built-in"
    }

    fn lookup(&self, method: &MethodId) -> Option<DeclaredMethod> {
        let candidates = self.by_name.get(method.name.as_str())?;
        // Exact owners win over wildcard owners.
        candidates
            .iter()
            .filter(|entry| entry.matches(method))
            .min_by_key(|entry| (entry.owner == "*", entry.descriptor == "*"))
            .map(|entry| entry.declared(method))
    }
}

/// Declared sources plus contracts inferred during the current session.
pub(crate) struct ContractCache {
    sources: Vec<Box<dyn ContractSource>>,
    inferred: DashMap<MethodId, MethodContract>,
}

impl ContractCache {
    pub(crate) fn new(sources: Vec<Box<dyn ContractSource>>) -> Self {
        Self {
            sources,
            inferred: DashMap::new(),
        }
    }

    /// Program annotations first, then built-in tables.
    pub(crate) fn for_program(program: &Program) -> Self {
        Self::new(vec![
            Box::new(AnnotationContracts::new(program)),
            Box::new(HardcodedContracts::new()),
        ])
    }

    /// Forget contracts inferred by an earlier run.
    pub(crate) fn start_session(&self) {
        self.inferred.clear();
    }

    /// Declared information merged across sources; earlier sources take precedence.
    pub(crate) fn declared(&self, method: &MethodId) -> DeclaredMethod {
        let mut declared = DeclaredMethod::default();
        for source in &self.sources {
            if let Some(found) = source.lookup(method) {
                declared.merge_from(found);
            }
        }
        declared
    }

    /// Effective contract: a declared one, else one inferred earlier in this session.
    pub(crate) fn contract(&self, method: &MethodId) -> Option<MethodContract> {
        self.declared(method).contract.or_else(|| {
            self.inferred
                .get(method)
                .map(|contract| contract.value().clone())
        })
    }

    /// Record an inferred contract. The first writer wins; returns whether this call stored it.
    pub(crate) fn record_inferred(&self, method: MethodId, contract: MethodContract) -> bool {
        let mut stored = false;
        self.inferred.entry(method).or_insert_with(|| {
            stored = true;
            contract
        });
        stored
    }

    /// Sorted snapshot of the inferred contracts.
    pub(crate) fn inferred(&self) -> BTreeMap<MethodId, MethodContract> {
        self.inferred
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|source| source.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::syntax::ContractEffect;
    use crate::ir::MethodAnnotations;

    fn annotation(method: MethodId, contract: &str) -> MethodAnnotations {
        MethodAnnotations {
            method,
            contract: Some(contract.to_string()),
            pure: true,
            return_nullness: Nullness::Unknown,
            parameter_nullness: Vec::new(),
            returns_unmodifiable: false,
        }
    }

    #[test]
    fn all_tables_have_unique_names_and_entries() {
        let tables = all_tables();
        assert!(!tables.is_empty(), "at least one table must be registered");
        let mut names: Vec<_> = tables.iter().map(|table| table.name).collect();
        let total = names.len();
        names.dedup();
        assert_eq!(names.len(), total, "table names must be unique");
        for table in tables {
            assert!(!table.entries.is_empty(), "table {} is empty", table.name);
        }
    }

    #[test]
    fn every_builtin_contract_parses() {
        for table in all_tables() {
            for entry in table.entries {
                let Some(text) = entry.contract else {
                    continue;
                };
                assert_ne!(entry.descriptor, "*", "{} needs a descriptor", entry.name);
                let count = method_param_count(entry.descriptor).expect("descriptor");
                parse_contract(text, count).expect("built-in contract");
            }
        }
    }

    #[test]
    fn require_non_null_is_builtin() {
        let cache = ContractCache::for_program(&Program::default());
        let contract = cache
            .contract(&MethodId::new(
                "java/util/Objects",
                "requireNonNull",
                "(Ljava/lang/Object;)Ljava/lang/Object;",
            ))
            .expect("contract");
        assert_eq!(contract.to_string(), "null -> fail; _ -> param1");
    }

    #[test]
    fn wildcard_owner_covers_equals() {
        let cache = ContractCache::for_program(&Program::default());
        let declared = cache.declared(&MethodId::new("p/Point", "equals", "(Ljava/lang/Object;)Z"));
        assert!(declared.pure);
        assert_eq!(
            declared.contract.map(|contract| contract.to_string()),
            Some("null -> false".to_string())
        );
    }

    #[test]
    fn annotations_take_precedence_and_invalid_contracts_are_ignored() {
        let overridden = MethodId::new("java/util/Objects", "isNull", "(Ljava/lang/Object;)Z");
        let broken = MethodId::new("p/A", "broken", "(Ljava/lang/Object;)V");
        let program = Program {
            annotations: vec![
                annotation(overridden.clone(), "_ -> true"),
                annotation(broken.clone(), "null, null -> fail"),
            ],
            ..Program::default()
        };
        let cache = ContractCache::for_program(&program);
        assert_eq!(
            cache.contract(&overridden).map(|contract| contract.to_string()),
            Some("_ -> true".to_string())
        );
        assert_eq!(cache.contract(&broken), None);
        assert!(cache.declared(&broken).pure);
        assert_eq!(cache.source_names(), vec!["annotations", "built-in"]);
    }

    #[test]
    fn inferred_contracts_are_first_writer_wins_and_session_scoped() {
        let cache = ContractCache::for_program(&Program::default());
        let method = MethodId::new("p/A", "id", "(Ljava/lang/Object;)Ljava/lang/Object;");
        let first = parse_contract("_ -> param1", 1).expect("contract");
        let second = parse_contract("_ -> !null", 1).expect("contract");
        assert!(cache.record_inferred(method.clone(), first));
        assert!(!cache.record_inferred(method.clone(), second));
        assert_eq!(
            cache.contract(&method).map(|contract| contract.clauses[0].effect),
            Some(ContractEffect::Param(0))
        );
        cache.start_session();
        assert!(cache.inferred().is_empty());
    }

    #[test]
    fn collection_factories_return_unmodifiable_values() {
        let cache = ContractCache::for_program(&Program::default());
        let declared = cache.declared(&MethodId::new(
            "java/util/List",
            "of",
            "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/util/List;",
        ));
        assert!(declared.returns_unmodifiable);
        assert_eq!(declared.return_nullness, Nullness::NonNull);
    }
}
