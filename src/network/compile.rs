use super::{Compiled, ExecutionPlan, Network};
use crate::{
    config::Config,
    error::{ConfigError, Result},
    flow::{FlowControlUnit, ParallelUnit, SequentialUnit},
    graph::DependencyGraph,
    node::{NodeArena, NodeGroup},
    order::EvalOrder,
    pool::BufferLifetimes,
    types::{HashMap, HashSet, IndexSet, NodeId},
};
use tracing::{debug, warn};

impl<C: Config> Network<C> {
    /// Derive everything evaluation needs from the graph: the roots, the global
    /// order, the loops, every root's order and plan, the retained set and the
    /// nodes needing a gradient.
    ///
    /// Idempotent: compiling an unchanged network again is a no-op.
    ///
    /// # Errors
    /// Any [`ConfigError`] describing a malformed graph. The network stays
    /// uncompiled.
    #[allow(clippy::too_many_lines)]
    pub fn compile(&mut self) -> Result<()> {
        if self.compiled.is_some() {
            debug!(version = self.structure_version, "network already compiled");
            return Ok(());
        }
        let Self {
            nodes,
            slots,
            explicit_roots,
            roots,
            orders,
            loops,
            compiled,
            structure_version,
            ..
        } = self;

        // Phase 1: every edge must point at a live node, and only recurrent
        // nodes may read themselves.
        validate_edges(nodes)?;
        for &root in explicit_roots.iter() {
            if !nodes.contains(root) {
                return Err(ConfigError::MissingRoot { id: root }.into());
            }
        }

        // Phase 2: roots are tagged outputs, nodes nobody consumes and whatever
        // the caller added explicitly.
        *roots = determine_roots(nodes, explicit_roots);
        if roots.is_empty() && nodes.len() != 0 {
            return Err(ConfigError::NoRoots.into());
        }

        // Phase 3: the global order, and what it leaves out.
        orders.clear();
        let graph = DependencyGraph::new(nodes, roots);
        let global = orders.build_order(&graph, None)?.clone();
        let reachable: HashSet<NodeId> = global.iter().copied().collect();
        for node in nodes.iter().filter(|node| !reachable.contains(&node.id)) {
            warn!(node = %node.name, "node is not reachable from any root");
        }

        // Phase 4: loops, then the global order with each loop made contiguous.
        loops.detect_loops(&graph, &global, *structure_version)?;
        orders.replace_global(loops.regroup(&global));

        // Phase 5: per-root orders, filtered from the regrouped global order.
        let mut root_orders: Vec<(NodeId, EvalOrder)> = Vec::with_capacity(roots.len());
        for &root in roots.iter() {
            let order = orders.build_order(&graph, Some(root))?.clone();
            root_orders.push((root, order));
        }

        // Phase 6: values outliving a pass. A node in two roots' orders is
        // computed by whichever root runs first and reused by the other.
        let mut appearances: HashMap<NodeId, usize> = HashMap::default();
        for (_, order) in &root_orders {
            for &node in order.iter() {
                *appearances.entry(node).or_default() += 1;
            }
        }
        let retained: HashSet<NodeId> = roots
            .iter()
            .copied()
            .chain(
                appearances
                    .into_iter()
                    .filter(|&(_, count)| count > 1)
                    .map(|(node, _)| node),
            )
            .collect();

        let needs_gradient = gradient_closure(&graph, orders.order(&graph, None)?);

        // Phase 7: execution plans.
        let units: Vec<SequentialUnit> = loops
            .loops()
            .iter()
            .map(|lp| SequentialUnit::new(lp, &graph))
            .collect();
        let plans: HashMap<NodeId, ExecutionPlan> = root_orders
            .iter()
            .map(|(root, order)| {
                let steps = loops.collapse(order);
                let lifetimes = BufferLifetimes::new(&graph, &steps, loops);
                let node = graph.node(*root).expect("Network::compile: [1]");
                let plan = ExecutionPlan {
                    root: *root,
                    unit: FlowControlUnit::Parallel(ParallelUnit::new(node.name.clone(), steps)),
                    lifetimes,
                    keep_values: node.groups.contains(NodeGroup::Criterion),
                };
                (*root, plan)
            })
            .collect();
        let capacity = graph.capacity();
        let membership: HashSet<NodeId> = loops.membership().keys().copied().collect();

        for node in nodes.iter_mut() {
            node.part_of_loop = membership.contains(&node.id);
        }
        slots.grow(capacity);

        debug!(
            nodes = nodes.len(),
            roots = roots.len(),
            loops = units.len(),
            retained = retained.len(),
            needs_gradient = needs_gradient.len(),
            version = *structure_version,
            "compiled network"
        );
        *compiled = Some(Compiled {
            units,
            plans,
            retained,
            needs_gradient,
        });
        Ok(())
    }

    /// Build (or rebuild) and cache the order of `root`, `None` meaning the
    /// global order. Without a compile, the global order covers the roots the
    /// graph would be compiled with; with one, loops stay contiguous in the
    /// rebuilt global order.
    ///
    /// # Errors
    /// - [`ConfigError::MissingRoot`] if `root` is not a live node.
    /// - [`crate::error::SequencingError::GlobalOrderNotBuilt`] for a root
    ///   before the global order.
    /// - [`crate::error::SequencingError::OutsideGlobalOrder`] for a node the
    ///   global order does not reach.
    pub fn build_order(&mut self, root: Option<NodeId>) -> Result<&EvalOrder> {
        if let Some(root) = root {
            if !self.nodes.contains(root) {
                return Err(ConfigError::MissingRoot { id: root }.into());
            }
        } else if self.compiled.is_none() {
            self.roots = determine_roots(&self.nodes, &self.explicit_roots);
        }
        let graph = DependencyGraph::new(&self.nodes, &self.roots);
        self.orders.build_order(&graph, root)?;
        if root.is_none() && self.loops.is_current(self.structure_version) {
            let regrouped = self.loops.regroup(self.orders.order(&graph, None)?);
            self.orders.replace_global(regrouped);
        }
        Ok(self.orders.order(&graph, root)?)
    }

    /// The cached order of `root`, `None` meaning the global order.
    ///
    /// # Errors
    /// [`crate::error::SequencingError::OrderNotBuilt`] naming the root, or
    /// [`crate::error::SequencingError::GlobalOrderNotBuilt`].
    pub fn eval_order(&self, root: Option<NodeId>) -> Result<&EvalOrder> {
        Ok(self.orders.order(&self.graph(), root)?)
    }

    /// `nodes` in global order.
    ///
    /// # Errors
    /// [`crate::error::SequencingError::GlobalOrderNotBuilt`].
    pub fn sort_by_global_order(&self, nodes: impl IntoIterator<Item = NodeId>) -> Result<Vec<NodeId>> {
        Ok(self.orders.sort_by_global_order(nodes)?)
    }
}

fn validate_edges<C: Config>(nodes: &NodeArena<C>) -> Result<(), ConfigError> {
    for node in nodes.iter() {
        if let Some(&input) = node.inputs.iter().find(|&&input| !nodes.contains(input)) {
            return Err(ConfigError::DanglingInput {
                name: node.name.clone(),
                input,
            });
        }
        if node.inputs.contains(&node.id) && !node.is_recurrent() {
            return Err(ConfigError::SelfInput {
                name: node.name.clone(),
            });
        }
    }
    Ok(())
}

/// Tagged outputs, unconsumed nodes and explicit roots, in creation order.
fn determine_roots<C: Config>(nodes: &NodeArena<C>, explicit: &IndexSet<NodeId>) -> Vec<NodeId> {
    let mut consumed = vec![false; nodes.capacity()];
    for node in nodes.iter() {
        for &input in &node.inputs {
            // A recurrent node reading itself still has no consumer.
            if input != node.id {
                if let Some(flag) = consumed.get_mut(input.index()) {
                    *flag = true;
                }
            }
        }
    }
    nodes
        .iter()
        .filter(|node| {
            explicit.contains(&node.id)
                || !consumed[node.id.index()]
                || node.groups.iter().any(NodeGroup::is_root_group)
        })
        .map(|node| node.id)
        .collect()
}

/// Learnable parameters and everything downstream of one. Iterated to a
/// fixpoint because loop members can read nodes that come later in `order`.
fn gradient_closure<C: Config>(graph: &DependencyGraph<'_, C>, order: &EvalOrder) -> HashSet<NodeId> {
    let mut needs: HashSet<NodeId> = HashSet::default();
    loop {
        let before = needs.len();
        for &id in order.iter() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if node.learnable || node.inputs.iter().any(|input| needs.contains(input)) {
                needs.insert(id);
            }
        }
        if needs.len() == before {
            return needs;
        }
    }
}
