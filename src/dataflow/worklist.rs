use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::dataflow::context::{AnalysisContext, CancellationToken};
use crate::dataflow::facts::{FactSet, TypeConstraint};
use crate::dataflow::interpreter::{Flow, Site, execute};
use crate::dataflow::state::{MemoryState, MergeKey};
use crate::dataflow::value::VariableDescriptor;
use crate::descriptor::ParamKind;
use crate::ir::{BasicBlock, EdgeKind, Instruction, InstructionKind, Method, Nullness, UnaryOp};

/// How a worklist run ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RunOutcome {
    Completed,
    /// The state budget ran out before a fixpoint.
    TooComplex,
    Cancelled,
}

impl RunOutcome {
    pub(crate) fn name(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::TooComplex => "too_complex",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum ExitKind {
    Return,
    Throw,
}

/// Joined state reaching one method exit.
#[derive(Clone, Debug)]
pub(crate) struct Terminal {
    pub(crate) offset: u32,
    pub(crate) kind: ExitKind,
    pub(crate) state: MemoryState,
}

#[derive(Debug)]
pub(crate) struct RunResult {
    pub(crate) outcome: RunOutcome,
    pub(crate) terminals: Vec<Terminal>,
    pub(crate) visits: usize,
}

/// Deterministic intraprocedural fixpoint over the method's blocks.
///
/// States are kept per (block, merge key); a state that reaches a block again
/// is joined into the recorded one and the block is revisited only when the
/// join changed something. Blocks are dequeued in reverse postorder.
pub(crate) fn run_method(
    cx: &mut AnalysisContext<'_>,
    token: &CancellationToken,
) -> Result<RunResult> {
    let graph = MethodGraph::new(cx.method);
    let mut run = Run::default();
    let Some(entry) = graph.entry else {
        return Ok(run.finish(RunOutcome::Completed));
    };
    let Some(initial) = entry_state(cx) else {
        return Ok(run.finish(RunOutcome::Completed));
    };
    run.merge_into(cx, &graph, entry, initial)?;

    while let Some((_, block_start, key)) = run.queue.pop_first() {
        if token.is_cancelled() {
            return Ok(run.finish(RunOutcome::Cancelled));
        }
        run.visits += 1;
        if run.visits > cx.env.config.max_states {
            return Ok(run.finish(RunOutcome::TooComplex));
        }
        let Some(state) = run.recorded.get(&(block_start, key)).cloned() else {
            continue;
        };
        let Some(block) = graph.blocks.get(&block_start) else {
            continue;
        };
        for successor in execute_block(cx, &graph, block, state)? {
            match successor {
                Successor::Block(target, state) => run.merge_into(cx, &graph, target, state)?,
                Successor::Exit(offset, kind, state) => run.record_exit(cx, offset, kind, state),
            }
        }
    }

    if cx.env.config.check_invariants {
        cx.values
            .check_consistency()
            .with_context(|| format!("value table of {} is inconsistent", cx.method.id))?;
    }
    if cx.debug {
        info!(
            "worklist debug: method={} visits={} values={}",
            cx.method.id,
            run.visits,
            cx.values.len()
        );
    }
    Ok(run.finish(RunOutcome::Completed))
}

/// Entry state: receiver and parameters tied to their local slots.
fn entry_state(cx: &mut AnalysisContext<'_>) -> Option<MemoryState> {
    let mut state = MemoryState::default();
    if !cx.method.access.is_static {
        let receiver = cx.variable(VariableDescriptor::Receiver);
        let local = cx.variable(VariableDescriptor::Local(0));
        let owner = FactSet {
            types: TypeConstraint {
                instance_of: BTreeSet::from([cx.method.id.owner.clone()]),
                ..TypeConstraint::default()
            },
            ..FactSet::not_null()
        };
        if !state.unite(&cx.values, &cx.env.hierarchy, receiver, local)
            || !cx.narrow(&mut state, receiver, &owner)
        {
            return None;
        }
    }
    let slots = cx.shape.slots.clone();
    for (index, slot) in slots.into_iter().enumerate() {
        let entry = cx.variable(VariableDescriptor::ParameterEntry(index as u16));
        let local = cx.variable(VariableDescriptor::Local(slot));
        if !state.unite(&cx.values, &cx.env.hierarchy, entry, local) {
            return None;
        }
        let facts = match cx.shape.params.get(index) {
            Some(ParamKind::Reference) => {
                let declared = match cx.method.nullness.parameter(index) {
                    Nullness::Unknown => cx.declared.parameter(index),
                    nullness => nullness,
                };
                FactSet::declared(declared)
            }
            _ => FactSet::not_null(),
        };
        if !cx.narrow(&mut state, entry, &facts) {
            return None;
        }
    }
    Some(state)
}

#[derive(Default)]
struct Run {
    recorded: BTreeMap<(u32, MergeKey), MemoryState>,
    queue: BTreeSet<(usize, u32, MergeKey)>,
    exits: BTreeMap<(u32, ExitKind, MergeKey), MemoryState>,
    visits: usize,
}

impl Run {
    fn merge_into(
        &mut self,
        cx: &mut AnalysisContext<'_>,
        graph: &MethodGraph<'_>,
        target: u32,
        state: MemoryState,
    ) -> Result<()> {
        let Some(order) = graph.order.get(&target).copied() else {
            bail!("{} jumps to unknown block {target}", cx.method.id);
        };
        let key = state.merge_key();
        let slot = (target, key.clone());
        let merged = match self.recorded.get(&slot) {
            None => state,
            Some(previous) => {
                if previous.is_superstate_of(&state, &cx.values, &cx.env.hierarchy) {
                    return Ok(());
                }
                let mut joined = previous.join(&state, &mut cx.values, &cx.env.hierarchy);
                if graph.loop_headers.contains(&target) {
                    joined = joined.widen(previous, &mut cx.values, &cx.env.hierarchy);
                }
                if cx.env.config.check_invariants
                    && !(joined.is_superstate_of(previous, &cx.values, &cx.env.hierarchy)
                        && joined.is_superstate_of(&state, &cx.values, &cx.env.hierarchy))
                {
                    bail!(
                        "join at block {target} of {} is not an upper bound of its inputs",
                        cx.method.id
                    );
                }
                if joined == *previous {
                    return Ok(());
                }
                joined
            }
        };
        self.recorded.insert(slot, merged);
        self.queue.insert((order, target, key));
        Ok(())
    }

    fn record_exit(
        &mut self,
        cx: &mut AnalysisContext<'_>,
        offset: u32,
        kind: ExitKind,
        state: MemoryState,
    ) {
        let slot = (offset, kind, state.merge_key());
        let joined = match self.exits.get(&slot) {
            Some(previous) => previous.join(&state, &mut cx.values, &cx.env.hierarchy),
            None => state,
        };
        self.exits.insert(slot, joined);
    }

    fn finish(self, outcome: RunOutcome) -> RunResult {
        let terminals = self
            .exits
            .into_iter()
            .map(|((offset, kind, _), state)| Terminal {
                offset,
                kind,
                state,
            })
            .collect();
        RunResult {
            outcome,
            terminals,
            visits: self.visits,
        }
    }
}

enum Successor {
    Block(u32, MemoryState),
    Exit(u32, ExitKind, MemoryState),
}

fn execute_block(
    cx: &mut AnalysisContext<'_>,
    graph: &MethodGraph<'_>,
    block: &BasicBlock,
    state: MemoryState,
) -> Result<Vec<Successor>> {
    let handlers = graph.targets(block.start_offset, |kind| kind == EdgeKind::Exception);
    let has_handlers = !handlers.is_empty();
    let mut live = vec![state];
    let mut successors = Vec::new();

    for (index, instruction) in block.instructions.iter().enumerate() {
        let site = Site {
            has_handlers,
            feeds_branch: feeds_branch(&block.instructions, index),
        };
        let mut next = Vec::new();
        for state in live {
            let step = execute(cx, instruction, state, site)?;
            for exception in step.exceptions {
                for handler in &handlers {
                    successors.push(Successor::Block(*handler, exception.clone()));
                }
            }
            for (state, flow) in step.flows {
                match flow {
                    Flow::Next => {
                        if !next.contains(&state) {
                            next.push(state);
                        }
                    }
                    Flow::Branch(outcome) => {
                        let wanted = if outcome {
                            EdgeKind::BranchTrue
                        } else {
                            EdgeKind::BranchFalse
                        };
                        let mut targets = graph.targets(block.start_offset, |kind| kind == wanted);
                        if targets.is_empty() && !outcome {
                            targets = graph.targets(block.start_offset, EdgeKind::is_normal);
                        }
                        if targets.is_empty() {
                            bail!(
                                "{} block {} has no {} edge",
                                cx.method.id,
                                block.start_offset,
                                if outcome { "true" } else { "false" }
                            );
                        }
                        for target in targets {
                            successors.push(Successor::Block(target, state.clone()));
                        }
                    }
                    Flow::Goto(target) => successors.push(Successor::Block(target, state)),
                    Flow::Returned => successors.push(Successor::Exit(
                        instruction.offset,
                        ExitKind::Return,
                        state,
                    )),
                    Flow::Threw => successors.push(Successor::Exit(
                        instruction.offset,
                        ExitKind::Throw,
                        state,
                    )),
                }
            }
        }
        live = next;
        if live.is_empty() {
            break;
        }
    }

    let normal = graph.targets(block.start_offset, EdgeKind::is_normal);
    for state in live {
        for target in &normal {
            successors.push(Successor::Block(*target, state.clone()));
        }
    }
    Ok(successors)
}

/// Whether the value pushed at `index` reaches a branch, possibly through negations.
fn feeds_branch(instructions: &[Instruction], index: usize) -> bool {
    instructions[index + 1..]
        .iter()
        .find(|instruction| {
            !matches!(
                instruction.kind,
                InstructionKind::Unary {
                    operator: UnaryOp::Not
                }
            )
        })
        .is_some_and(|instruction| matches!(instruction.kind, InstructionKind::Branch))
}

/// CFG lookup tables used by the worklist loop.
struct MethodGraph<'a> {
    blocks: BTreeMap<u32, &'a BasicBlock>,
    edges: BTreeMap<u32, Vec<(u32, EdgeKind)>>,
    entry: Option<u32>,
    /// Reverse postorder position of each block; unreachable blocks sort last.
    order: BTreeMap<u32, usize>,
    loop_headers: BTreeSet<u32>,
}

impl<'a> MethodGraph<'a> {
    fn new(method: &'a Method) -> Self {
        let mut blocks = BTreeMap::new();
        for block in &method.cfg.blocks {
            blocks.insert(block.start_offset, block);
        }

        let mut edges: BTreeMap<u32, Vec<(u32, EdgeKind)>> = BTreeMap::new();
        for block in &method.cfg.blocks {
            edges.entry(block.start_offset).or_default();
        }
        for edge in &method.cfg.edges {
            edges.entry(edge.from).or_default().push((edge.to, edge.kind));
        }
        for targets in edges.values_mut() {
            targets.sort();
            targets.dedup();
        }

        let entry = method.cfg.blocks.first().map(|block| block.start_offset);
        let mut graph = Self {
            blocks,
            edges,
            entry,
            order: BTreeMap::new(),
            loop_headers: BTreeSet::new(),
        };
        graph.compute_order();
        graph
    }

    fn targets(&self, block_start: u32, wanted: impl Fn(EdgeKind) -> bool) -> Vec<u32> {
        let mut targets: Vec<u32> = self
            .edges
            .get(&block_start)
            .into_iter()
            .flatten()
            .filter(|(_, kind)| wanted(*kind))
            .map(|(target, _)| *target)
            .collect();
        targets.dedup();
        targets
    }

    fn successors(&self, block_start: u32) -> Vec<u32> {
        self.targets(block_start, |_| true)
    }

    /// Iterative depth-first search; a retreating edge marks its target as a loop header.
    fn compute_order(&mut self) {
        let Some(entry) = self.entry else {
            return;
        };
        let mut postorder = Vec::new();
        let mut on_path = BTreeSet::from([entry]);
        let mut seen = BTreeSet::from([entry]);
        let mut stack = vec![(entry, self.successors(entry), 0usize)];
        while let Some((block, successors, next)) = stack.last_mut() {
            if let Some(target) = successors.get(*next).copied() {
                *next += 1;
                if on_path.contains(&target) {
                    self.loop_headers.insert(target);
                } else if self.blocks.contains_key(&target) && seen.insert(target) {
                    on_path.insert(target);
                    let successors = self.successors(target);
                    stack.push((target, successors, 0));
                }
                continue;
            }
            let block = *block;
            on_path.remove(&block);
            postorder.push(block);
            stack.pop();
        }
        let reachable = postorder.len();
        for (position, block) in postorder.into_iter().rev().enumerate() {
            self.order.insert(block, position);
        }
        for (extra, block) in self
            .blocks
            .keys()
            .filter(|block| !seen.contains(*block))
            .enumerate()
        {
            self.order.insert(*block, reachable + extra);
        }
    }
}
