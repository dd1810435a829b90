use crate::{
    clock::EvalClock,
    config::Config,
    error::{Result, SequencingError},
    graph::DependencyGraph,
    loops::Loop,
    node::{BackwardApi, ForwardApi, Kernel, NodeArena},
    pool::{Buffer, BufferPool, BufferSlots, LiveCounts},
    types::{
        BufferDescriptor, Direction, FrameRange, HashMap, HashSet, IndexSet, LoopId,
        MinibatchLayout, NodeId, Timestamp,
    },
};
use tracing::trace;

/// One entry of a collapsed evaluation order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    /// A node outside every loop.
    Node(NodeId),
    /// A whole loop, executed by its [`SequentialUnit`].
    Loop(LoopId),
}

/// Executes a group of nodes in a mode-specific way.
///
/// Both variants expose the contract of a single node, so a caller drives a
/// loop exactly like any other step. The begin/end and buffer hooks bracket
/// one call of [`FlowControl::forward`] or [`FlowControl::backward`].
pub trait FlowControl<C: Config> {
    /// Whether any member has to be recomputed.
    fn is_out_of_date(&self, ctx: &ExecContext<'_, C>) -> bool;

    /// Hook before [`Self::forward`].
    fn begin_forward(&self, ctx: &mut ExecContext<'_, C>);

    /// Compute the members for `frame`.
    ///
    /// # Errors
    /// Failures of the members; the pass is then invalid.
    fn forward(&self, ctx: &mut ExecContext<'_, C>, frame: FrameRange) -> Result<()>;

    /// Hook after [`Self::forward`].
    fn end_forward(&self, ctx: &mut ExecContext<'_, C>);

    /// Hook before [`Self::backward`].
    fn begin_backward(&self, ctx: &mut ExecContext<'_, C>);

    /// Push gradients from the members to their inputs. Inputs in the same
    /// loop as the pushing member are served if `children_in_this_loop`, the
    /// rest if `children_in_outer_loop`.
    ///
    /// # Errors
    /// Failures of the members; the pass is then invalid.
    fn backward(
        &self,
        ctx: &mut ExecContext<'_, C>,
        frame: FrameRange,
        children_in_this_loop: bool,
        children_in_outer_loop: bool,
    ) -> Result<()>;

    /// Hook after [`Self::backward`].
    fn end_backward(&self, ctx: &mut ExecContext<'_, C>);

    /// Acquire the value buffers the forward pass writes.
    ///
    /// # Errors
    /// Allocation failures.
    fn request_buffers_for_forward(&self, ctx: &mut ExecContext<'_, C>) -> Result<()>;

    /// Retire the consumers this unit represents and recycle inputs whose
    /// last consumer just ran.
    fn release_buffers_after_forward(&self, ctx: &mut ExecContext<'_, C>);

    /// Acquire the gradient buffers the backward pass writes.
    ///
    /// # Errors
    /// Allocation failures.
    fn request_buffers_for_backward(&self, ctx: &mut ExecContext<'_, C>) -> Result<()>;

    /// Recycle what the backward pass no longer needs.
    fn release_buffers_after_backward(&self, ctx: &mut ExecContext<'_, C>);
}

/// The two ways of executing a node group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowControlUnit {
    /// A loop, one time step at a time.
    Sequential(SequentialUnit),
    /// Everything else, whole minibatch at once.
    Parallel(ParallelUnit),
}

impl FlowControlUnit {
    /// Display name of the unit.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Sequential(unit) => unit.name(),
            Self::Parallel(unit) => unit.name(),
        }
    }

    /// Single-input back-propagation is not defined for a node group.
    ///
    /// # Errors
    /// Always [`SequencingError::AggregateBackpropTo`].
    pub fn backprop_to(&self, input_index: usize) -> Result<(), SequencingError> {
        match self {
            Self::Sequential(unit) => unit.backprop_to(input_index),
            Self::Parallel(unit) => unit.backprop_to(input_index),
        }
    }

    /// The loop unit, if this is one.
    #[must_use]
    pub fn as_sequential(&self) -> Option<&SequentialUnit> {
        match self {
            Self::Sequential(unit) => Some(unit),
            Self::Parallel(_) => None,
        }
    }

    /// The batched unit, if this is one.
    #[must_use]
    pub fn as_parallel(&self) -> Option<&ParallelUnit> {
        match self {
            Self::Parallel(unit) => Some(unit),
            Self::Sequential(_) => None,
        }
    }
}

impl<C: Config> FlowControl<C> for FlowControlUnit {
    fn is_out_of_date(&self, ctx: &ExecContext<'_, C>) -> bool {
        match self {
            Self::Sequential(unit) => unit.is_out_of_date(ctx),
            Self::Parallel(unit) => unit.is_out_of_date(ctx),
        }
    }

    fn begin_forward(&self, ctx: &mut ExecContext<'_, C>) {
        match self {
            Self::Sequential(unit) => unit.begin_forward(ctx),
            Self::Parallel(unit) => unit.begin_forward(ctx),
        }
    }

    fn forward(&self, ctx: &mut ExecContext<'_, C>, frame: FrameRange) -> Result<()> {
        match self {
            Self::Sequential(unit) => unit.forward(ctx, frame),
            Self::Parallel(unit) => unit.forward(ctx, frame),
        }
    }

    fn end_forward(&self, ctx: &mut ExecContext<'_, C>) {
        match self {
            Self::Sequential(unit) => unit.end_forward(ctx),
            Self::Parallel(unit) => unit.end_forward(ctx),
        }
    }

    fn begin_backward(&self, ctx: &mut ExecContext<'_, C>) {
        match self {
            Self::Sequential(unit) => unit.begin_backward(ctx),
            Self::Parallel(unit) => unit.begin_backward(ctx),
        }
    }

    fn backward(
        &self,
        ctx: &mut ExecContext<'_, C>,
        frame: FrameRange,
        children_in_this_loop: bool,
        children_in_outer_loop: bool,
    ) -> Result<()> {
        match self {
            Self::Sequential(unit) => {
                unit.backward(ctx, frame, children_in_this_loop, children_in_outer_loop)
            }
            Self::Parallel(unit) => {
                unit.backward(ctx, frame, children_in_this_loop, children_in_outer_loop)
            }
        }
    }

    fn end_backward(&self, ctx: &mut ExecContext<'_, C>) {
        match self {
            Self::Sequential(unit) => unit.end_backward(ctx),
            Self::Parallel(unit) => unit.end_backward(ctx),
        }
    }

    fn request_buffers_for_forward(&self, ctx: &mut ExecContext<'_, C>) -> Result<()> {
        match self {
            Self::Sequential(unit) => unit.request_buffers_for_forward(ctx),
            Self::Parallel(unit) => unit.request_buffers_for_forward(ctx),
        }
    }

    fn release_buffers_after_forward(&self, ctx: &mut ExecContext<'_, C>) {
        match self {
            Self::Sequential(unit) => unit.release_buffers_after_forward(ctx),
            Self::Parallel(unit) => unit.release_buffers_after_forward(ctx),
        }
    }

    fn request_buffers_for_backward(&self, ctx: &mut ExecContext<'_, C>) -> Result<()> {
        match self {
            Self::Sequential(unit) => unit.request_buffers_for_backward(ctx),
            Self::Parallel(unit) => unit.request_buffers_for_backward(ctx),
        }
    }

    fn release_buffers_after_backward(&self, ctx: &mut ExecContext<'_, C>) {
        match self {
            Self::Sequential(unit) => unit.release_buffers_after_backward(ctx),
            Self::Parallel(unit) => unit.release_buffers_after_backward(ctx),
        }
    }
}

/// Runs one loop through the time axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequentialUnit {
    loop_id: LoopId,
    name: String,
    direction: Direction,
    nodes: Vec<NodeId>,
    external_inputs: Vec<NodeId>,
}

impl SequentialUnit {
    /// Unit executing `lp`.
    #[must_use]
    pub fn new<C: Config>(lp: &Loop, graph: &DependencyGraph<'_, C>) -> Self {
        let mut external_inputs: IndexSet<NodeId> = IndexSet::default();
        for &member in lp.members() {
            external_inputs.extend(
                graph
                    .predecessors(member)
                    .iter()
                    .copied()
                    .filter(|input| !lp.contains(*input)),
            );
        }
        Self {
            loop_id: lp.id(),
            name: lp.name().to_owned(),
            direction: lp.direction(),
            nodes: lp.members().to_vec(),
            external_inputs: external_inputs.into_iter().collect(),
        }
    }

    /// Id of the wrapped loop.
    #[must_use]
    pub fn loop_id(&self) -> LoopId {
        self.loop_id
    }

    /// Name of the wrapped loop.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direction of the forward pass through time.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Members in intra-step order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Distinct nodes outside the loop read by its members.
    #[must_use]
    pub fn external_inputs(&self) -> &[NodeId] {
        &self.external_inputs
    }

    /// Time indices a forward pass over `frame` visits, in visiting order.
    #[must_use]
    pub fn forward_steps(&self, frame: FrameRange, layout: MinibatchLayout) -> Vec<usize> {
        match frame {
            FrameRange::All => self.direction.time_steps(layout.num_time_steps).collect(),
            FrameRange::TimeStep(t) => vec![t],
        }
    }

    /// Time indices a backward pass over `frame` visits: the forward sequence
    /// reversed, whatever the loop's direction.
    #[must_use]
    pub fn backward_steps(&self, frame: FrameRange, layout: MinibatchLayout) -> Vec<usize> {
        let mut steps = self.forward_steps(frame, layout);
        steps.reverse();
        steps
    }

    /// # Errors
    /// Always [`SequencingError::AggregateBackpropTo`].
    pub fn backprop_to(&self, input_index: usize) -> Result<(), SequencingError> {
        Err(SequencingError::AggregateBackpropTo {
            unit: self.name.clone(),
            input_index,
        })
    }

    fn needs_gradient<C: Config>(&self, ctx: &ExecContext<'_, C>) -> bool {
        self.nodes.iter().any(|node| ctx.needs_gradient.contains(node))
    }
}

impl<C: Config> FlowControl<C> for SequentialUnit {
    fn is_out_of_date(&self, ctx: &ExecContext<'_, C>) -> bool {
        self.nodes.iter().any(|&node| !ctx.has_value(node))
            || ctx.is_stale(&self.nodes, &self.external_inputs, &HashSet::default())
    }

    fn begin_forward(&self, ctx: &mut ExecContext<'_, C>) {
        trace!(unit = %self.name, direction = %self.direction, layout = %ctx.layout, "begin forward");
    }

    fn forward(&self, ctx: &mut ExecContext<'_, C>, frame: FrameRange) -> Result<()> {
        for t in self.forward_steps(frame, ctx.layout) {
            for &node in &self.nodes {
                ctx.compute_node(node, FrameRange::TimeStep(t))?;
            }
        }
        Ok(())
    }

    fn end_forward(&self, ctx: &mut ExecContext<'_, C>) {
        ctx.stamp(&self.nodes);
    }

    fn begin_backward(&self, ctx: &mut ExecContext<'_, C>) {
        trace!(
            unit = %self.name,
            direction = %self.direction.reversed(),
            layout = %ctx.layout,
            "begin backward"
        );
    }

    fn backward(
        &self,
        ctx: &mut ExecContext<'_, C>,
        frame: FrameRange,
        children_in_this_loop: bool,
        children_in_outer_loop: bool,
    ) -> Result<()> {
        // Gradients inside the loop flow one step at a time from the end of
        // the sequence; what leaves the loop is pushed once, batched, after
        // every step has contributed.
        if children_in_this_loop {
            for t in self.backward_steps(frame, ctx.layout) {
                for &node in self.nodes.iter().rev() {
                    ctx.backprop_node(node, FrameRange::TimeStep(t), true, false)?;
                }
            }
        }
        if children_in_outer_loop {
            for &node in self.nodes.iter().rev() {
                ctx.backprop_node(node, frame, false, true)?;
            }
        }
        Ok(())
    }

    fn end_backward(&self, ctx: &mut ExecContext<'_, C>) {
        trace!(unit = %self.name, layout = %ctx.layout, "end backward");
    }

    fn request_buffers_for_forward(&self, ctx: &mut ExecContext<'_, C>) -> Result<()> {
        // Members read each other across steps, so all of them need storage
        // before the first step runs.
        for &node in &self.nodes {
            ctx.request_value(node)?;
        }
        Ok(())
    }

    fn release_buffers_after_forward(&self, ctx: &mut ExecContext<'_, C>) {
        ctx.consume_inputs(&self.external_inputs);
    }

    fn request_buffers_for_backward(&self, ctx: &mut ExecContext<'_, C>) -> Result<()> {
        for &node in self.nodes.iter().chain(&self.external_inputs) {
            if ctx.needs_gradient.contains(&node) {
                ctx.request_gradient(node)?;
            }
        }
        Ok(())
    }

    fn release_buffers_after_backward(&self, ctx: &mut ExecContext<'_, C>) {
        for &node in &self.nodes {
            ctx.release_gradient(node);
            ctx.release_value(node);
        }
    }
}

/// Runs its steps once each over the whole minibatch; loops among them are
/// delegated to their [`SequentialUnit`]s. The unit a root evaluates is the
/// root's collapsed order wrapped in one of these.
///
/// A forward pass skips steps whose results still reflect their inputs. A
/// recycled value is recomputed only when a running step, a retained value or
/// a following backward pass needs it, and then keeps the stamp it had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelUnit {
    name: String,
    steps: Vec<Step>,
}

impl ParallelUnit {
    /// Unit running `steps` in order.
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in forward order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// # Errors
    /// Always [`SequencingError::AggregateBackpropTo`].
    pub fn backprop_to(&self, input_index: usize) -> Result<(), SequencingError> {
        Err(SequencingError::AggregateBackpropTo {
            unit: self.name.clone(),
            input_index,
        })
    }

    /// Nodes a step computes.
    fn members<'u>(step: &'u Step, units: &'u [SequentialUnit]) -> &'u [NodeId] {
        match step {
            Step::Node(node) => core::slice::from_ref(node),
            Step::Loop(id) => units[*id].nodes(),
        }
    }

    /// What the next forward pass does with each step.
    fn schedule<C: Config>(&self, ctx: &ExecContext<'_, C>) -> Vec<Action> {
        let units = ctx.units;
        let inputs_of = |step: &Step| -> Vec<NodeId> {
            match step {
                Step::Node(node) => ctx.nodes_inputs(*node),
                Step::Loop(id) => units[*id].external_inputs().to_vec(),
            }
        };

        // Phase 1: stale results, directly or through a stale input.
        let mut stale: HashSet<NodeId> = HashSet::default();
        let mut is_stale = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let members = Self::members(step, units);
            let outdated = ctx.is_stale(members, &inputs_of(step), &stale);
            if outdated {
                stale.extend(members.iter().copied());
            }
            is_stale.push(outdated);
        }

        // Phase 2: from the end, whichever recycled value is still needed.
        let mut wanted: HashSet<NodeId> = HashSet::default();
        let mut actions = vec![Action::Skip; self.steps.len()];
        for (k, step) in self.steps.iter().enumerate().rev() {
            let members = Self::members(step, units);
            let missing = members.iter().any(|&node| !ctx.has_value(node));
            let needed = ctx.keep_values
                || members
                    .iter()
                    .any(|node| wanted.contains(node) || ctx.retained.contains(node));
            actions[k] = if is_stale[k] {
                Action::Recompute
            } else if missing && needed {
                Action::Refresh
            } else {
                Action::Skip
            };
            if actions[k] != Action::Skip {
                wanted.extend(inputs_of(step));
            }
        }
        actions
    }
}

/// What a forward pass does with one step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Action {
    Skip,
    /// Recycled but needed again: recompute from unchanged inputs.
    Refresh,
    Recompute,
}

impl<C: Config> FlowControl<C> for ParallelUnit {
    fn is_out_of_date(&self, ctx: &ExecContext<'_, C>) -> bool {
        self.schedule(ctx).contains(&Action::Recompute)
    }

    fn begin_forward(&self, ctx: &mut ExecContext<'_, C>) {
        trace!(unit = %self.name, steps = self.steps.len(), layout = %ctx.layout, "begin forward");
    }

    fn forward(&self, ctx: &mut ExecContext<'_, C>, frame: FrameRange) -> Result<()> {
        let units = ctx.units;
        let actions = self.schedule(ctx);
        for (step, action) in self.steps.iter().zip(actions) {
            let members = Self::members(step, units);
            let previous: Vec<(NodeId, Timestamp)> =
                members.iter().map(|&node| (node, ctx.stamp_of(node))).collect();
            match *step {
                Step::Node(node) => {
                    if action != Action::Skip {
                        ctx.request_value(node)?;
                        ctx.compute_node(node, frame)?;
                        ctx.stamp(&[node]);
                    }
                    let inputs = ctx.nodes_inputs(node);
                    ctx.consume_inputs(&inputs);
                }
                Step::Loop(id) => {
                    let unit = &units[id];
                    if action != Action::Skip {
                        unit.request_buffers_for_forward(ctx)?;
                        unit.begin_forward(ctx);
                        unit.forward(ctx, FrameRange::All)?;
                        unit.end_forward(ctx);
                    }
                    unit.release_buffers_after_forward(ctx);
                }
            }
            if action == Action::Refresh {
                ctx.restore_stamps(&previous);
            }
        }
        Ok(())
    }

    fn end_forward(&self, ctx: &mut ExecContext<'_, C>) {
        trace!(unit = %self.name, clock = ctx.clock.now(), "end forward");
    }

    fn begin_backward(&self, ctx: &mut ExecContext<'_, C>) {
        trace!(unit = %self.name, steps = self.steps.len(), layout = %ctx.layout, "begin backward");
    }

    fn backward(
        &self,
        ctx: &mut ExecContext<'_, C>,
        frame: FrameRange,
        children_in_this_loop: bool,
        children_in_outer_loop: bool,
    ) -> Result<()> {
        let units = ctx.units;
        for &step in self.steps.iter().rev() {
            match step {
                Step::Node(node) => {
                    if ctx.needs_gradient.contains(&node) {
                        ctx.backprop_node(node, frame, children_in_this_loop, children_in_outer_loop)?;
                    }
                    ctx.release_gradient(node);
                    ctx.release_value(node);
                }
                Step::Loop(id) => {
                    let unit = &units[id];
                    if unit.needs_gradient(ctx) {
                        unit.request_buffers_for_backward(ctx)?;
                        unit.begin_backward(ctx);
                        unit.backward(ctx, FrameRange::All, true, true)?;
                        unit.end_backward(ctx);
                    }
                    unit.release_buffers_after_backward(ctx);
                }
            }
        }
        Ok(())
    }

    fn end_backward(&self, ctx: &mut ExecContext<'_, C>) {
        trace!(unit = %self.name, pool = ?ctx.pool.stats(), "end backward");
    }

    fn request_buffers_for_forward(&self, _ctx: &mut ExecContext<'_, C>) -> Result<()> {
        // Each step acquires its value right before running, so a block
        // released by one step can serve the next.
        Ok(())
    }

    fn release_buffers_after_forward(&self, ctx: &mut ExecContext<'_, C>) {
        // Values nothing in this pass read and nothing retains.
        for &step in &self.steps {
            match step {
                Step::Node(node) if ctx.live.remaining(node) == 0 => ctx.release_value(node),
                _ => {}
            }
        }
    }

    fn request_buffers_for_backward(&self, ctx: &mut ExecContext<'_, C>) -> Result<()> {
        // Parameter gradients persist across calls and restart from zero, as
        // does anything else still holding one.
        let units = ctx.units;
        for step in &self.steps {
            let members = Self::members(step, units);
            for &member in members {
                let learnable = ctx.nodes.get(member).is_some_and(|n| n.learnable);
                if learnable && ctx.needs_gradient.contains(&member) {
                    ctx.request_gradient(member)?;
                }
                if let Some(gradient) = ctx.slots.gradients[member.index()].as_mut() {
                    gradient.fill(0.0);
                }
            }
        }
        Ok(())
    }

    fn release_buffers_after_backward(&self, ctx: &mut ExecContext<'_, C>) {
        let units = ctx.units;
        for step in &self.steps {
            let members = Self::members(step, units);
            for &member in members {
                ctx.release_gradient(member);
                ctx.release_value(member);
            }
        }
    }
}

/// Everything a pass mutates, borrowed from the network for its duration.
pub struct ExecContext<'a, C: Config> {
    pub(crate) nodes: &'a mut NodeArena<C>,
    pub(crate) slots: &'a mut BufferSlots<C::Buffer>,
    pub(crate) pool: &'a mut BufferPool<C::Buffer>,
    /// Loop units, indexed by loop id.
    pub(crate) units: &'a [SequentialUnit],
    pub(crate) loop_of: &'a HashMap<NodeId, LoopId>,
    pub(crate) clock: &'a EvalClock,
    pub(crate) layout: MinibatchLayout,
    pub(crate) live: LiveCounts,
    /// Nodes whose values outlive the pass.
    pub(crate) retained: &'a HashSet<NodeId>,
    pub(crate) needs_gradient: &'a HashSet<NodeId>,
    /// Suspend every release, e.g. to keep values for a backward pass.
    pub(crate) keep_values: bool,
    pub(crate) share_buffers: bool,
}

impl<C: Config> ExecContext<'_, C> {
    fn descriptor(&self, node: NodeId) -> BufferDescriptor {
        self.nodes
            .get(node)
            .expect("ExecContext::descriptor: [1]")
            .descriptor(self.layout)
    }

    /// Stamp of the last result of `node`, even if its buffer was recycled
    /// since.
    pub(crate) fn stamp_of(&self, node: NodeId) -> Timestamp {
        self.nodes.get(node).map_or(0, |n| match n.eval_timestamp {
            0 => n.recycled_stamp,
            stamp => stamp,
        })
    }

    /// Whether the last result of `members`, which share one stamp, no longer
    /// reflects `inputs`: never computed, or an input is newer or in `stale`.
    pub(crate) fn is_stale(&self, members: &[NodeId], inputs: &[NodeId], stale: &HashSet<NodeId>) -> bool {
        let oldest = members
            .iter()
            .map(|&node| self.stamp_of(node))
            .min()
            .unwrap_or(0);
        oldest == 0
            || inputs
                .iter()
                .any(|input| stale.contains(input) || self.stamp_of(*input) > oldest)
    }

    pub(crate) fn has_value(&self, node: NodeId) -> bool {
        self.slots.values.get(node.index()).is_some_and(Option::is_some)
    }

    fn nodes_inputs(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes.get(node).map(|n| n.inputs.clone()).unwrap_or_default()
    }

    /// Never computed, released since, or older than one of its inputs.
    pub(crate) fn is_out_of_date(&self, node: NodeId) -> bool {
        let Some(n) = self.nodes.get(node) else {
            return false;
        };
        n.eval_timestamp == 0
            || !self.has_value(node)
            || n.inputs.iter().any(|&input| self.stamp_of(input) > n.eval_timestamp)
    }

    /// Give every node in `nodes` one fresh timestamp.
    pub(crate) fn stamp(&mut self, nodes: &[NodeId]) {
        let now = self.clock.tick();
        for &node in nodes {
            if let Some(n) = self.nodes.get_mut(node) {
                n.eval_timestamp = now;
            }
        }
    }

    /// Put back the stamps a recomputation from unchanged inputs replaced.
    fn restore_stamps(&mut self, stamps: &[(NodeId, Timestamp)]) {
        for &(node, stamp) in stamps {
            if let Some(n) = self.nodes.get_mut(node) {
                n.eval_timestamp = stamp;
            }
        }
    }

    /// Make sure `node` owns a value buffer matching the current layout.
    pub(crate) fn request_value(&mut self, node: NodeId) -> Result<()> {
        let descriptor = self.descriptor(node);
        let slot = &mut self.slots.values[node.index()];
        if slot.as_ref().is_some_and(|b| *b.descriptor() == descriptor) {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            self.pool.release(stale);
        }
        *slot = Some(self.pool.acquire(&descriptor)?);
        if let Some(n) = self.nodes.get_mut(node) {
            n.eval_timestamp = 0;
        }
        Ok(())
    }

    /// Make sure `node` owns a gradient buffer; a new one starts at zero.
    pub(crate) fn request_gradient(&mut self, node: NodeId) -> Result<()> {
        let descriptor = self.descriptor(node);
        let slot = &mut self.slots.gradients[node.index()];
        if slot.as_ref().is_some_and(|b| *b.descriptor() == descriptor) {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            self.pool.release(stale);
        }
        let mut gradient = self.pool.acquire(&descriptor)?;
        gradient.fill(0.0);
        *slot = Some(gradient);
        Ok(())
    }

    /// Whether the value of `node` may go back to the pool once unused.
    /// Leaves hold injected data or parameters and always keep theirs.
    pub(crate) fn is_releasable(&self, node: NodeId) -> bool {
        self.share_buffers
            && !self.keep_values
            && !self.retained.contains(&node)
            && self
                .nodes
                .get(node)
                .is_some_and(|n| n.value_sharable && !n.is_leaf())
    }

    /// Recycle the value of `node` if allowed. The node then holds no result.
    pub(crate) fn release_value(&mut self, node: NodeId) {
        if !self.is_releasable(node) {
            return;
        }
        if let Some(buffer) = self.slots.values[node.index()].take() {
            trace!(node = %self.nodes.display_name(node), "released value");
            self.pool.release(buffer);
            if let Some(n) = self.nodes.get_mut(node) {
                n.recycled_stamp = core::mem::take(&mut n.eval_timestamp);
            }
        }
    }

    /// Recycle the gradient of `node` unless it is a learnable parameter.
    pub(crate) fn release_gradient(&mut self, node: NodeId) {
        if !self.share_buffers || self.nodes.get(node).is_none_or(|n| n.learnable) {
            return;
        }
        if let Some(buffer) = self.slots.gradients[node.index()].take() {
            self.pool.release(buffer);
        }
    }

    /// One consumer of each distinct node in `inputs` has run; recycle those
    /// that have no consumer left.
    pub(crate) fn consume_inputs(&mut self, inputs: &[NodeId]) {
        let mut seen: HashSet<NodeId> = HashSet::default();
        for &input in inputs {
            if seen.insert(input) && self.live.consume(input) {
                self.release_value(input);
            }
        }
    }

    /// Run the kernel of `node` on `frame`.
    pub(crate) fn compute_node(&mut self, node: NodeId, frame: FrameRange) -> Result<()> {
        let inputs = self.nodes_inputs(node);
        if let Some(&missing) = inputs.iter().find(|&&input| !self.has_value(input)) {
            return Err(SequencingError::ValueNotComputed {
                name: self.nodes.display_name(missing),
            }
            .into());
        }
        let n = self.nodes.get_mut(node).expect("ExecContext::compute_node: [1]");
        trace!(node = %n.name, %frame, "forward");
        let mut api = ForwardApiImpl::<C> {
            layout: self.layout,
            node,
            inputs: &n.inputs,
            values: self.slots.values.as_mut_slice(),
        };
        n.kernel.forward(&mut api, frame);
        Ok(())
    }

    /// Push the gradient of `node` to the inputs selected by the two flags
    /// that need one.
    pub(crate) fn backprop_node(
        &mut self,
        node: NodeId,
        frame: FrameRange,
        children_in_this_loop: bool,
        children_in_outer_loop: bool,
    ) -> Result<()> {
        let own_loop = self.loop_of.get(&node).copied();
        let targets: Vec<(usize, NodeId)> = self
            .nodes
            .get(node)
            .expect("ExecContext::backprop_node: [1]")
            .inputs
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, input)| {
                let same_loop = self.loop_of.get(&input).copied() == own_loop;
                ((children_in_this_loop && same_loop) || (children_in_outer_loop && !same_loop))
                    && self.needs_gradient.contains(&input)
            })
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let inputs = self.nodes_inputs(node);
        if let Some(&missing) = core::iter::once(&node)
            .chain(&inputs)
            .find(|&&readable| !self.has_value(readable))
        {
            return Err(SequencingError::ValueNotComputed {
                name: self.nodes.display_name(missing),
            }
            .into());
        }
        self.request_gradient(node)?;
        for &(_, input) in &targets {
            self.request_gradient(input)?;
        }

        let n = self.nodes.get_mut(node).expect("ExecContext::backprop_node: [2]");
        for (input_index, _) in targets {
            trace!(node = %n.name, input_index, %frame, "backward");
            let mut api = BackwardApiImpl::<C> {
                layout: self.layout,
                node,
                inputs: &n.inputs,
                input_index,
                values: self.slots.values.as_slice(),
                gradients: self.slots.gradients.as_mut_slice(),
            };
            n.kernel.backward(input_index, &mut api, frame);
        }
        Ok(())
    }
}

struct ForwardApiImpl<'a, C: Config> {
    layout: MinibatchLayout,
    node: NodeId,
    inputs: &'a [NodeId],
    values: &'a mut [Option<C::Buffer>],
}

impl<C: Config> ForwardApi<C> for ForwardApiImpl<'_, C> {
    fn layout(&self) -> MinibatchLayout {
        self.layout
    }

    fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    fn input(&self, index: usize) -> &C::Buffer {
        self.values[self.inputs[index].index()]
            .as_ref()
            .expect("ForwardApiImpl::input: [1]")
    }

    fn output(&mut self) -> &mut C::Buffer {
        self.values[self.node.index()]
            .as_mut()
            .expect("ForwardApiImpl::output: [1]")
    }
}

struct BackwardApiImpl<'a, C: Config> {
    layout: MinibatchLayout,
    node: NodeId,
    inputs: &'a [NodeId],
    input_index: usize,
    values: &'a [Option<C::Buffer>],
    gradients: &'a mut [Option<C::Buffer>],
}

impl<C: Config> BackwardApi<C> for BackwardApiImpl<'_, C> {
    fn layout(&self) -> MinibatchLayout {
        self.layout
    }

    fn value(&self) -> &C::Buffer {
        self.values[self.node.index()]
            .as_ref()
            .expect("BackwardApiImpl::value: [1]")
    }

    fn gradient(&self) -> &C::Buffer {
        self.gradients[self.node.index()]
            .as_ref()
            .expect("BackwardApiImpl::gradient: [1]")
    }

    fn input_value(&self, index: usize) -> &C::Buffer {
        self.values[self.inputs[index].index()]
            .as_ref()
            .expect("BackwardApiImpl::input_value: [1]")
    }

    fn input_gradient(&mut self) -> &mut C::Buffer {
        self.gradients[self.inputs[self.input_index].index()]
            .as_mut()
            .expect("BackwardApiImpl::input_gradient: [1]")
    }
}
