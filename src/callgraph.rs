use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{CallKind, CallSite, InstructionKind, Method, MethodId, Program};

/// Call graph between the program's own methods, built from a CHA baseline.
#[derive(Clone, Debug, Default)]
pub(crate) struct CallGraph {
    methods: BTreeSet<MethodId>,
    callees: BTreeMap<MethodId, BTreeSet<MethodId>>,
    overridden: BTreeSet<MethodId>,
}

/// Build a call graph using a CHA baseline.
pub(crate) fn build_call_graph(program: &Program) -> CallGraph {
    let descendants = build_descendants(program);
    let methods: BTreeSet<MethodId> = program
        .methods
        .iter()
        .map(|method| method.id.clone())
        .collect();

    let mut callees: BTreeMap<MethodId, BTreeSet<MethodId>> = BTreeMap::new();
    for method in &program.methods {
        let targets = callees.entry(method.id.clone()).or_default();
        for call in method_calls(method) {
            targets.extend(resolve_targets(call, &descendants, &methods));
        }
    }

    let overridden = methods
        .iter()
        .filter(|method| {
            descendants.get(&method.owner).is_some_and(|classes| {
                classes.iter().any(|class| {
                    methods.contains(&MethodId::new(class, &method.name, &method.descriptor))
                })
            })
        })
        .cloned()
        .collect();

    CallGraph {
        methods,
        callees,
        overridden,
    }
}

fn method_calls(method: &Method) -> impl Iterator<Item = &CallSite> {
    method
        .cfg
        .blocks
        .iter()
        .flat_map(|block| &block.instructions)
        .filter_map(|instruction| match &instruction.kind {
            InstructionKind::Invoke { call } => Some(call),
            _ => None,
        })
}

fn resolve_targets(
    call: &CallSite,
    descendants: &BTreeMap<String, BTreeSet<String>>,
    methods: &BTreeSet<MethodId>,
) -> Vec<MethodId> {
    let base = call.method_id();
    match call.kind {
        CallKind::Static | CallKind::Special => {
            if methods.contains(&base) {
                vec![base]
            } else {
                Vec::new()
            }
        }
        CallKind::Virtual | CallKind::Interface => {
            let mut candidates = BTreeSet::from([call.owner.clone()]);
            if let Some(classes) = descendants.get(&call.owner) {
                candidates.extend(classes.iter().cloned());
            }
            candidates
                .into_iter()
                .map(|class| MethodId::new(&class, &call.name, &call.descriptor))
                .filter(|candidate| methods.contains(candidate))
                .collect()
        }
    }
}

/// Transitive subclasses and implementors of every named type.
fn build_descendants(program: &Program) -> BTreeMap<String, BTreeSet<String>> {
    let mut direct: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for class in &program.classes {
        for parent in class.super_name.iter().chain(&class.interfaces) {
            direct
                .entry(parent.as_str())
                .or_default()
                .push(class.name.as_str());
        }
    }
    let mut descendants = BTreeMap::new();
    for parent in direct.keys() {
        let mut seen = BTreeSet::new();
        let mut pending = vec![*parent];
        while let Some(current) = pending.pop() {
            for child in direct.get(current).into_iter().flatten() {
                if seen.insert(child.to_string()) {
                    pending.push(child);
                }
            }
        }
        descendants.insert(parent.to_string(), seen);
    }
    descendants
}

impl CallGraph {
    /// Whether a program class overrides or implements `method` further down the hierarchy.
    pub(crate) fn is_overridden(&self, method: &MethodId) -> bool {
        self.overridden.contains(method)
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.callees.values().map(BTreeSet::len).sum()
    }

    /// Methods grouped bottom-up: every callee outside a method's own cycle sits in an earlier wave.
    pub(crate) fn waves(&self) -> Vec<Vec<MethodId>> {
        let nodes: Vec<&MethodId> = self.methods.iter().collect();
        let position: BTreeMap<&MethodId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(index, method)| (*method, index))
            .collect();
        let successors: Vec<Vec<usize>> = nodes
            .iter()
            .map(|method| {
                self.callees
                    .get(*method)
                    .into_iter()
                    .flatten()
                    .filter_map(|callee| position.get(callee).copied())
                    .collect()
            })
            .collect();

        let components = strongly_connected(&successors);
        let mut component_of = vec![0; nodes.len()];
        for (index, component) in components.iter().enumerate() {
            for node in component {
                component_of[*node] = index;
            }
        }
        // Components come out callees first, so every outside callee already has its wave.
        let mut wave_of = vec![0usize; components.len()];
        for (index, component) in components.iter().enumerate() {
            let wave = component
                .iter()
                .flat_map(|node| &successors[*node])
                .map(|successor| component_of[*successor])
                .filter(|other| *other != index)
                .map(|other| wave_of[other] + 1)
                .max()
                .unwrap_or(0);
            wave_of[index] = wave;
        }

        let mut waves: Vec<Vec<MethodId>> = Vec::new();
        for (index, component) in components.iter().enumerate() {
            let wave = wave_of[index];
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].extend(component.iter().map(|node| nodes[*node].clone()));
        }
        for wave in &mut waves {
            wave.sort();
        }
        waves
    }
}

/// Iterative Tarjan; components are emitted in reverse topological order.
fn strongly_connected(successors: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let count = successors.len();
    let mut index: Vec<Option<usize>> = vec![None; count];
    let mut lowlink = vec![0; count];
    let mut on_stack = vec![false; count];
    let mut stack = Vec::new();
    let mut next_index = 0;
    let mut components = Vec::new();

    for root in 0..count {
        if index[root].is_some() {
            continue;
        }
        index[root] = Some(next_index);
        lowlink[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;
        let mut frames = vec![(root, 0usize)];

        while let Some(&(node, child)) = frames.last() {
            if let Some(&next) = successors[node].get(child) {
                if let Some(frame) = frames.last_mut() {
                    frame.1 += 1;
                }
                match index[next] {
                    None => {
                        index[next] = Some(next_index);
                        lowlink[next] = next_index;
                        next_index += 1;
                        stack.push(next);
                        on_stack[next] = true;
                        frames.push((next, 0));
                    }
                    Some(visited) if on_stack[next] => {
                        lowlink[node] = lowlink[node].min(visited);
                    }
                    Some(_) => {}
                }
                continue;
            }
            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[node]);
            }
            if index[node] == Some(lowlink[node]) {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                component.sort_unstable();
                components.push(component);
            }
        }
    }
    components
}
