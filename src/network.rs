mod compile;
mod edit;
mod eval;

use crate::{
    clock::EvalClock,
    config::{Config, NetworkOptions},
    error::{ConfigError, Result, SequencingError},
    flow::{FlowControlUnit, SequentialUnit, Step},
    graph::DependencyGraph,
    loops::{Loop, LoopAnalyzer},
    node::{Node, NodeArena, NodeGroup},
    order::{EvalOrder, OrderBuilder},
    pool::{BufferLifetimes, BufferPool, BufferSlots, PoolStats},
    types::{HashMap, HashSet, IndexSet, LoopId, MinibatchLayout, NodeId},
};
use derive_more::Debug;

/// A computation network: owns the nodes, their buffers and every cache the
/// scheduler derives from the graph.
///
/// Lifecycle:
/// 1. Add nodes with [`Network::add_node`] (and wire cycles with
///    [`Network::set_inputs`]).
/// 2. [`Network::compile`]: roots, global order, loops, per-root plans.
/// 3. Inject data, [`Network::notify_inputs_modified`], then
///    [`Network::forward_propagate`] / [`Network::backpropagate`] as often as
///    needed.
///
/// Any structural edit throws the compiled state away; evaluation refuses to
/// run until the next `compile`.
#[derive(Debug)]
pub struct Network<C: Config> {
    nodes: NodeArena<C>,
    slots: BufferSlots<C::Buffer>,
    pool: BufferPool<C::Buffer>,
    options: NetworkOptions,
    clock: EvalClock,
    layout: MinibatchLayout,
    explicit_roots: IndexSet<NodeId>,
    /// Roots the cached orders were built for.
    roots: Vec<NodeId>,
    orders: OrderBuilder,
    loops: LoopAnalyzer,
    compiled: Option<Compiled>,
    structure_version: u64,
    /// Input nodes written since the last notification.
    dirty_inputs: IndexSet<NodeId>,
}

/// Everything `compile` derives, dropped wholesale by a structural edit.
#[derive(Debug, Clone)]
pub(crate) struct Compiled {
    /// Loop units, indexed by loop id.
    pub(crate) units: Vec<SequentialUnit>,
    pub(crate) plans: HashMap<NodeId, ExecutionPlan>,
    /// Roots, and nodes shared by more than one root's order.
    pub(crate) retained: HashSet<NodeId>,
    pub(crate) needs_gradient: HashSet<NodeId>,
}

/// How one root is evaluated: its collapsed order wrapped in a parallel unit,
/// plus the buffer lifetimes along that order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    root: NodeId,
    unit: FlowControlUnit,
    lifetimes: BufferLifetimes,
    keep_values: bool,
}

impl ExecutionPlan {
    /// The root this plan evaluates.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Top-level unit.
    #[must_use]
    pub fn unit(&self) -> &FlowControlUnit {
        &self.unit
    }

    /// Steps of the top-level unit, loops collapsed.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        self.unit.as_parallel().map(|unit| unit.steps()).unwrap_or_default()
    }

    /// Consumer counts along [`Self::steps`].
    #[must_use]
    pub fn lifetimes(&self) -> &BufferLifetimes {
        &self.lifetimes
    }

    /// Whether a forward pass keeps every value for a later backward pass.
    #[must_use]
    pub fn keeps_values(&self) -> bool {
        self.keep_values
    }
}

impl<C: Config> Network<C> {
    /// Empty network.
    #[must_use]
    pub fn new(options: NetworkOptions) -> Self {
        Self {
            nodes: NodeArena::new(),
            slots: BufferSlots::new(),
            pool: BufferPool::new(),
            options,
            clock: EvalClock::new(),
            layout: MinibatchLayout::default(),
            explicit_roots: IndexSet::default(),
            roots: Vec::new(),
            orders: OrderBuilder::new(),
            loops: LoopAnalyzer::new(),
            compiled: None,
            structure_version: 0,
            dirty_inputs: IndexSet::default(),
        }
    }

    /// Runtime switches.
    #[must_use]
    pub fn options(&self) -> &NetworkOptions {
        &self.options
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the network has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 0
    }

    /// Whether [`Self::compile`] ran since the last structural edit.
    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Counter bumped by every structural edit.
    #[must_use]
    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    /// The evaluation clock, shared with forks.
    #[must_use]
    pub fn clock(&self) -> &EvalClock {
        &self.clock
    }

    /// Layout announced by the last [`Self::notify_inputs_modified`].
    #[must_use]
    pub fn layout(&self) -> MinibatchLayout {
        self.layout
    }

    /// Roots of the last compile (or the last global order built).
    #[must_use]
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Read-only adjacency view over the current roots.
    #[must_use]
    pub fn graph(&self) -> DependencyGraph<'_, C> {
        DependencyGraph::new(&self.nodes, &self.roots)
    }

    /// Cached evaluation orders.
    #[must_use]
    pub fn orders(&self) -> &OrderBuilder {
        &self.orders
    }

    /// Loop cache.
    #[must_use]
    pub fn loop_analyzer(&self) -> &LoopAnalyzer {
        &self.loops
    }

    /// Loops found by the last compile, indexed by id.
    #[must_use]
    pub fn loops(&self) -> &[Loop] {
        self.loops.loops()
    }

    /// The unit that runs loop `id`.
    #[must_use]
    pub fn loop_unit(&self, id: LoopId) -> Option<&SequentialUnit> {
        self.compiled.as_ref()?.units.get(id)
    }

    /// Evaluation plan of a compiled root.
    ///
    /// # Errors
    /// - [`SequencingError::NotCompiled`].
    /// - [`SequencingError::OrderNotBuilt`] if `root` is not a root.
    pub fn plan(&self, root: NodeId) -> Result<&ExecutionPlan> {
        let compiled = self.compiled("plan")?;
        compiled.plans.get(&root).ok_or_else(|| {
            SequencingError::OrderNotBuilt {
                root: self.nodes.display_name(root),
            }
            .into()
        })
    }

    /// Collapsed steps of `root`'s order.
    ///
    /// # Errors
    /// As [`Self::plan`].
    pub fn flow_steps(&self, root: NodeId) -> Result<&[Step]> {
        Ok(self.plan(root)?.steps())
    }

    /// The node behind a handle.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node<C>> {
        self.nodes.get(id)
    }

    /// Mutable access to a node, e.g. to reach its kernel.
    #[must_use]
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<C>> {
        self.nodes.get_mut(id)
    }

    /// Live nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node<C>> {
        self.nodes.iter()
    }

    /// Handle of the node called `name`.
    ///
    /// # Errors
    /// [`ConfigError::UnknownName`].
    pub fn node_by_name(&self, name: &str) -> Result<NodeId> {
        self.nodes.id_of(name).ok_or_else(|| {
            ConfigError::UnknownName {
                name: name.to_owned(),
            }
            .into()
        })
    }

    /// Nodes whose name matches `pattern`, in name insertion order. A single
    /// `*` matches any run of characters; without one, the match is exact.
    #[must_use]
    pub fn nodes_matching(&self, pattern: &str) -> Vec<NodeId> {
        match pattern.split_once('*') {
            None => self.nodes.id_of(pattern).into_iter().collect(),
            Some((prefix, suffix)) => self
                .nodes
                .names()
                .filter(|(name, _)| {
                    name.len() >= prefix.len() + suffix.len()
                        && name.starts_with(prefix)
                        && name.ends_with(suffix)
                })
                .map(|(_, id)| id)
                .collect(),
        }
    }

    /// Nodes listing `id` among their inputs, in creation order.
    #[must_use]
    pub fn consumers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.inputs.contains(&id))
            .map(Node::id)
            .collect()
    }

    /// Nodes whose kernel reports `operation`: all of them in creation order,
    /// or those of `root`'s order in evaluation order.
    ///
    /// # Errors
    /// [`SequencingError::OrderNotBuilt`] if `root`'s order was never built.
    pub fn nodes_with_operation(&self, operation: &str, root: Option<NodeId>) -> Result<Vec<NodeId>> {
        self.filter_nodes(root, |node| node.operation() == operation)
    }

    /// Every node tagged with `group`, in creation order.
    #[must_use]
    pub fn group(&self, group: NodeGroup) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.groups.contains(group))
            .map(Node::id)
            .collect()
    }

    /// Members of `group` that `root` depends on, in evaluation order.
    ///
    /// # Errors
    /// [`SequencingError::OrderNotBuilt`] if `root`'s order was never built.
    pub fn nodes_in_group(&self, group: NodeGroup, root: NodeId) -> Result<Vec<NodeId>> {
        self.filter_nodes(Some(root), |node| node.groups.contains(group))
    }

    /// Leaves of `root`'s order that are not learnable: the data it reads.
    ///
    /// # Errors
    /// [`SequencingError::OrderNotBuilt`] if `root`'s order was never built.
    pub fn input_nodes(&self, root: NodeId) -> Result<Vec<NodeId>> {
        self.filter_nodes(Some(root), |node| node.is_leaf() && !node.learnable)
    }

    /// Learnable parameters `root` depends on, in evaluation order.
    ///
    /// # Errors
    /// [`SequencingError::OrderNotBuilt`] if `root`'s order was never built.
    pub fn learnable_parameters(&self, root: NodeId) -> Result<Vec<NodeId>> {
        self.filter_nodes(Some(root), |node| node.learnable)
    }

    /// Whether back-propagation computes a gradient for `id`.
    #[must_use]
    pub fn needs_gradient(&self, id: NodeId) -> bool {
        self.compiled
            .as_ref()
            .is_some_and(|compiled| compiled.needs_gradient.contains(&id))
    }

    /// Current value of `id`, if it holds one.
    #[must_use]
    pub fn value(&self, id: NodeId) -> Option<&C::Buffer> {
        self.slots.values.get(id.index())?.as_ref()
    }

    /// Current gradient of `id`, if it holds one.
    #[must_use]
    pub fn gradient(&self, id: NodeId) -> Option<&C::Buffer> {
        self.slots.gradients.get(id.index())?.as_ref()
    }

    /// Allocation counters of the buffer pool.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Idle blocks held by the buffer pool.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.pool.free_blocks()
    }

    fn compiled(&self, operation: &'static str) -> Result<&Compiled> {
        self.compiled
            .as_ref()
            .ok_or_else(|| SequencingError::NotCompiled { operation }.into())
    }

    fn filter_nodes(
        &self,
        root: Option<NodeId>,
        predicate: impl Fn(&Node<C>) -> bool,
    ) -> Result<Vec<NodeId>> {
        let candidates: Vec<NodeId> = match root {
            None => self.nodes.iter().map(Node::id).collect(),
            Some(root) => self.order_of(root)?.to_vec(),
        };
        Ok(candidates
            .into_iter()
            .filter(|&id| self.nodes.get(id).is_some_and(&predicate))
            .collect())
    }

    fn order_of(&self, root: NodeId) -> Result<&EvalOrder> {
        Ok(self.orders.order(&self.graph(), Some(root))?)
    }

    fn require(&self, id: NodeId) -> Result<&Node<C>> {
        self.nodes
            .get(id)
            .ok_or_else(|| ConfigError::UnknownNode { id }.into())
    }
}

impl<C: Config> Default for Network<C> {
    fn default() -> Self {
        Self::new(NetworkOptions::default())
    }
}
