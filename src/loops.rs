use crate::{
    config::Config,
    error::ConfigError,
    flow::Step,
    graph::DependencyGraph,
    order::EvalOrder,
    types::{Direction, HashMap, HashSet, LoopId, NodeId},
};
use core::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::{debug, warn};

/// A cyclic region closed by recurrent edges, executed one time step at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    id: LoopId,
    name: String,
    source: NodeId,
    direction: Direction,
    members: Vec<NodeId>,
}

impl Loop {
    /// Discovery index; stable across re-analysis of an unchanged graph.
    #[must_use]
    pub fn id(&self) -> LoopId {
        self.id
    }

    /// `Loop_<source name>`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Representative member: the first recurrent node in global order.
    #[must_use]
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// Stepping direction through time.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Members in the order they run within one time step.
    #[must_use]
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Whether `node` belongs to this loop.
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }
}

/// Finds and caches the loops of a network.
///
/// Loops are the non-trivial strongly connected components of the predecessor
/// graph. Detection is cached against the structure version it ran on, so
/// re-running it on an unchanged graph hands back the very same loops and ids.
#[derive(Debug, Default, Clone)]
pub struct LoopAnalyzer {
    loops: Vec<Loop>,
    membership: HashMap<NodeId, LoopId>,
    analyzed_version: Option<u64>,
}

impl LoopAnalyzer {
    /// Empty analyzer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect the loops of `graph`, whose global order is `global`.
    ///
    /// `version` identifies the graph structure; if it matches the previous
    /// run, the cached loops are returned untouched.
    ///
    /// # Errors
    /// - [`ConfigError::UncontrolledCycle`] for a cycle that no recurrent edge
    ///   breaks.
    /// - [`ConfigError::ConflictingLoopDirection`] for a loop closed by both
    ///   past-value and future-value edges.
    /// - [`ConfigError::OverlappingLoops`] if a node would land in two loops.
    pub fn detect_loops<C: Config>(
        &mut self,
        graph: &DependencyGraph<'_, C>,
        global: &EvalOrder,
        version: u64,
    ) -> Result<&[Loop], ConfigError> {
        if self.analyzed_version == Some(version) {
            debug!(version, loops = self.loops.len(), "loop analysis is up to date");
            return Ok(&self.loops);
        }
        self.invalidate();

        let position: HashMap<NodeId, usize> =
            global.iter().enumerate().map(|(pos, &node)| (node, pos)).collect();
        let mut components: Vec<Vec<NodeId>> =
            strongly_connected_components(graph, global.iter().copied())
                .into_iter()
                .filter(|component| is_cyclic(graph, component))
                .collect();
        for component in &mut components {
            component.sort_by_key(|node| position[node]);
        }
        // Discovery order: by the earliest member in the global order.
        components.sort_by_key(|component| position[&component[0]]);

        let mut loops = Vec::with_capacity(components.len());
        let mut membership = HashMap::default();
        for (id, component) in components.into_iter().enumerate() {
            let lp = build_loop(graph, id, component, &position)?;
            for &member in &lp.members {
                if let Some(first) = membership.insert(member, id) {
                    return Err(ConfigError::OverlappingLoops {
                        node: graph.name(member),
                        first,
                        second: id,
                    });
                }
            }
            debug!(
                loop_id = id,
                name = %lp.name,
                direction = %lp.direction,
                members = lp.members.len(),
                "detected loop"
            );
            loops.push(lp);
        }
        validate_detached_cycles(graph, &position)?;

        self.loops = loops;
        self.membership = membership;
        self.analyzed_version = Some(version);
        Ok(&self.loops)
    }

    /// Cached loops, indexed by id.
    #[must_use]
    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// Loop by id.
    #[must_use]
    pub fn get(&self, id: LoopId) -> Option<&Loop> {
        self.loops.get(id)
    }

    /// Loop containing `node`, if any.
    #[must_use]
    pub fn loop_of(&self, node: NodeId) -> Option<LoopId> {
        self.membership.get(&node).copied()
    }

    pub(crate) fn membership(&self) -> &HashMap<NodeId, LoopId> {
        &self.membership
    }

    /// Whether the cache is valid for structure `version`.
    #[must_use]
    pub fn is_current(&self, version: u64) -> bool {
        self.analyzed_version == Some(version)
    }

    /// Forget every loop.
    pub fn invalidate(&mut self) {
        self.loops.clear();
        self.membership.clear();
        self.analyzed_version = None;
    }

    /// `global` with each loop's members moved together, in their intra-step
    /// order, to where the loop's last member used to be. Everything a loop
    /// reads from outside precedes that position and everything reading from
    /// the loop follows it, so the result is still dependencies-first.
    #[must_use]
    pub fn regroup(&self, global: &EvalOrder) -> EvalOrder {
        let mut last_member: HashMap<LoopId, NodeId> = HashMap::default();
        for &node in global.iter() {
            if let Some(id) = self.loop_of(node) {
                last_member.insert(id, node);
            }
        }
        let mut regrouped = Vec::with_capacity(global.len());
        for &node in global.iter() {
            match self.loop_of(node) {
                None => regrouped.push(node),
                Some(id) if last_member[&id] == node => {
                    regrouped.extend_from_slice(&self.loops[id].members);
                }
                Some(_) => {}
            }
        }
        EvalOrder::new(regrouped)
    }

    /// Collapse `order` into flow-control steps: plain nodes stay, every loop
    /// becomes one [`Step::Loop`] at its first member's position.
    #[must_use]
    pub fn collapse(&self, order: &[NodeId]) -> Vec<Step> {
        let mut seen: HashSet<LoopId> = HashSet::default();
        order
            .iter()
            .filter_map(|&node| match self.loop_of(node) {
                None => Some(Step::Node(node)),
                Some(id) => seen.insert(id).then_some(Step::Loop(id)),
            })
            .collect()
    }
}

/// Whether a component is a real cycle: several nodes, or one reading itself.
fn is_cyclic<C: Config>(graph: &DependencyGraph<'_, C>, component: &[NodeId]) -> bool {
    match component {
        [single] => graph.predecessors(*single).contains(single),
        _ => true,
    }
}

/// Cycles among nodes no root reaches never run, but they are part of the
/// network and must be just as well formed. `reachable` maps the nodes of the
/// global order to their position.
fn validate_detached_cycles<C: Config>(
    graph: &DependencyGraph<'_, C>,
    reachable: &HashMap<NodeId, usize>,
) -> Result<(), ConfigError> {
    let detached: Vec<NodeId> = graph
        .node_ids()
        .filter(|node| !reachable.contains_key(node))
        .collect();
    if detached.is_empty() {
        return Ok(());
    }
    let position: HashMap<NodeId, usize> =
        detached.iter().enumerate().map(|(pos, &node)| (node, pos)).collect();
    // A component is reachable as a whole or not at all, so the search may
    // wander into reachable nodes but never mixes the two.
    for mut component in strongly_connected_components(graph, detached.iter().copied()) {
        if !position.contains_key(&component[0]) || !is_cyclic(graph, &component) {
            continue;
        }
        component.sort_by_key(|node| position[node]);
        let lp = build_loop(graph, 0, component, &position)?;
        warn!(name = %lp.name, "loop is not reachable from any root");
    }
    Ok(())
}

/// Tarjan's algorithm over the predecessor graph, started from `starts` in
/// order. Iterative for the same reason as the post-order walk.
fn strongly_connected_components<C: Config>(
    graph: &DependencyGraph<'_, C>,
    starts: impl IntoIterator<Item = NodeId>,
) -> Vec<Vec<NodeId>> {
    let capacity = graph.capacity();
    let mut index: Vec<Option<usize>> = vec![None; capacity];
    let mut lowlink = vec![0usize; capacity];
    let mut on_stack = vec![false; capacity];
    let mut stack: Vec<NodeId> = Vec::new();
    let mut next_index = 0usize;
    let mut components = Vec::new();

    for start in starts {
        if index[start.index()].is_some() {
            continue;
        }
        let mut call_stack: Vec<(NodeId, usize)> = vec![(start, 0)];
        index[start.index()] = Some(next_index);
        lowlink[start.index()] = next_index;
        next_index += 1;
        stack.push(start);
        on_stack[start.index()] = true;

        while let Some(&(node, next_input)) = call_stack.last() {
            let v = node.index();
            if let Some(&input) = graph.predecessors(node).get(next_input) {
                call_stack.last_mut().expect("strongly_connected_components: [1]").1 += 1;
                if graph.node(input).is_none() {
                    continue;
                }
                let w = input.index();
                match index[w] {
                    None => {
                        index[w] = Some(next_index);
                        lowlink[w] = next_index;
                        next_index += 1;
                        stack.push(input);
                        on_stack[w] = true;
                        call_stack.push((input, 0));
                    }
                    Some(w_index) if on_stack[w] => lowlink[v] = lowlink[v].min(w_index),
                    Some(_) => {}
                }
            } else {
                call_stack.pop();
                if let Some(&(parent, _)) = call_stack.last() {
                    let p = parent.index();
                    lowlink[p] = lowlink[p].min(lowlink[v]);
                }
                if Some(lowlink[v]) == index[v] {
                    let mut component = Vec::new();
                    loop {
                        let member = stack.pop().expect("strongly_connected_components: [2]");
                        on_stack[member.index()] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
    }
    components
}

/// Validate one cyclic component and turn it into a [`Loop`].
/// `component` is sorted by global position.
fn build_loop<C: Config>(
    graph: &DependencyGraph<'_, C>,
    id: LoopId,
    component: Vec<NodeId>,
    position: &HashMap<NodeId, usize>,
) -> Result<Loop, ConfigError> {
    let names = |nodes: &[NodeId]| nodes.iter().map(|&n| graph.name(n)).collect::<Vec<_>>();
    let offsets: Vec<(NodeId, isize)> = component
        .iter()
        .filter_map(|&n| graph.node(n).map(|node| (n, node.time_offset())))
        .filter(|&(_, offset)| offset != 0)
        .collect();
    let Some(&(source, first_offset)) = offsets.first() else {
        return Err(ConfigError::UncontrolledCycle {
            nodes: names(&component),
        });
    };
    let name = format!("Loop_{}", graph.name(source));
    let direction = Direction::from_offset(first_offset).expect("build_loop: [1]");
    if offsets
        .iter()
        .any(|&(_, offset)| Direction::from_offset(offset) != Some(direction))
    {
        return Err(ConfigError::ConflictingLoopDirection { name });
    }

    // Within one time step, recurrent nodes read an earlier step, so their
    // inputs are not dependencies. What remains must be acyclic.
    let members: HashSet<NodeId> = component.iter().copied().collect();
    let mut pending_inputs: HashMap<NodeId, usize> = HashMap::default();
    let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::default();
    for &node in &component {
        let recurrent = graph.node(node).is_some_and(|n| n.is_recurrent());
        let mut count = 0;
        if !recurrent {
            let mut distinct: HashSet<NodeId> = HashSet::default();
            for &input in graph.predecessors(node) {
                if members.contains(&input) && distinct.insert(input) {
                    count += 1;
                    dependents.entry(input).or_default().push(node);
                }
            }
        }
        pending_inputs.insert(node, count);
    }
    // Kahn's algorithm with global position as the tie-break.
    let mut ready: BinaryHeap<Reverse<(usize, NodeId)>> = component
        .iter()
        .filter(|node| pending_inputs[*node] == 0)
        .map(|&node| Reverse((position[&node], node)))
        .collect();
    let mut step_order = Vec::with_capacity(component.len());
    while let Some(Reverse((_, node))) = ready.pop() {
        step_order.push(node);
        for &dependent in dependents.get(&node).map(Vec::as_slice).unwrap_or_default() {
            let count = pending_inputs
                .get_mut(&dependent)
                .expect("build_loop: [2]");
            *count -= 1;
            if *count == 0 {
                ready.push(Reverse((position[&dependent], dependent)));
            }
        }
    }
    if step_order.len() != component.len() {
        let stuck: Vec<NodeId> = component
            .iter()
            .copied()
            .filter(|node| !step_order.contains(node))
            .collect();
        return Err(ConfigError::UncontrolledCycle {
            nodes: names(&stuck),
        });
    }

    Ok(Loop {
        id,
        name,
        source,
        direction,
        members: step_order,
    })
}
