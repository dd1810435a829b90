use super::{Compiled, Network};
use crate::{
    config::Config,
    error::{ConfigError, Result, SequencingError},
    flow::{ExecContext, FlowControl, FlowControlUnit, ParallelUnit},
    node::{Node, NodeGroup},
    pool::{Buffer, BufferLifetimes, LiveCounts},
    types::{FrameRange, HashSet, LoopId, MinibatchLayout, NodeId},
};
use tracing::debug;

impl<C: Config> Network<C> {
    /// Bring `root` up to date: every out-of-date step of its plan runs once
    /// over the whole minibatch, loops one time step at a time.
    ///
    /// # Errors
    /// - [`SequencingError::NotCompiled`].
    /// - [`SequencingError::InputsNotNotified`] after unannounced writes to
    ///   input buffers.
    /// - [`SequencingError::OrderNotBuilt`] if `root` is not a compiled root.
    /// - [`crate::error::ResourceError`] from the buffer pool.
    pub fn forward_propagate(&mut self, root: NodeId) -> Result<()> {
        let (mut ctx, compiled) = self.context("forward_propagate")?;
        let Some(plan) = compiled.plans.get(&root) else {
            return Err(SequencingError::OrderNotBuilt {
                root: ctx.nodes.display_name(root),
            }
            .into());
        };
        forward_pass(&mut ctx, &plan.unit, &plan.lifetimes, plan.keep_values)
    }

    /// Bring several roots up to date in one pass over the union of their
    /// orders. Shared nodes and loops run at most once.
    ///
    /// # Errors
    /// As [`Self::forward_propagate`].
    pub fn forward_propagate_many(&mut self, roots: &[NodeId]) -> Result<()> {
        if let [root] = roots {
            return self.forward_propagate(*root);
        }
        let mut members: Vec<NodeId> = Vec::new();
        let mut keep_values = false;
        for &root in roots {
            let plan = self.plan(root)?;
            keep_values |= plan.keep_values;
            members.extend_from_slice(self.order_of(root)?);
        }
        let members = self.sort_by_global_order(members)?;
        let (unit, lifetimes) = self.adhoc_plan("<many>", &members);

        let (mut ctx, _) = self.context("forward_propagate_many")?;
        forward_pass(&mut ctx, &unit, &lifetimes, keep_values)
    }

    /// Back-propagate from `root`, whose forward values must still be
    /// present: roots tagged [`NodeGroup::Criterion`] keep them.
    ///
    /// The gradient of `root` is seeded with ones; every other gradient in its
    /// order starts at zero. Learnable parameters keep their gradients; the
    /// rest are recycled as soon as their owner has pushed them on.
    ///
    /// # Errors
    /// As [`Self::forward_propagate`], plus
    /// [`SequencingError::ValueNotComputed`] for a missing forward value.
    pub fn backpropagate(&mut self, root: NodeId) -> Result<()> {
        let (mut ctx, compiled) = self.context("backpropagate")?;
        let Some(plan) = compiled.plans.get(&root) else {
            return Err(SequencingError::OrderNotBuilt {
                root: ctx.nodes.display_name(root),
            }
            .into());
        };
        if ctx.is_out_of_date(root) {
            return Err(SequencingError::ValueNotComputed {
                name: ctx.nodes.display_name(root),
            }
            .into());
        }
        let unit = &plan.unit;
        ctx.live = plan.lifetimes.start_pass();
        unit.request_buffers_for_backward(&mut ctx)?;
        unit.begin_backward(&mut ctx);
        ctx.request_gradient(root)?;
        if let Some(seed) = ctx.slots.gradients[root.index()].as_mut() {
            seed.fill(1.0);
        }
        unit.backward(&mut ctx, FrameRange::All, true, true)?;
        unit.end_backward(&mut ctx);
        unit.release_buffers_after_backward(&mut ctx);
        debug!(root = %ctx.nodes.display_name(root), pool = ?ctx.pool.stats(), "backpropagated");
        Ok(())
    }

    /// The nodes to run to get from an evaluated `frontier` to `targets`, in
    /// global order: dependencies of a target that read from the frontier,
    /// directly or through each other. Side branches that don't depend on the
    /// frontier are left alone. A frontier node inside a loop stands for its
    /// whole loop, and a loop is selected as a whole. Not cached.
    ///
    /// # Errors
    /// - [`SequencingError::NotCompiled`].
    /// - [`ConfigError::UnknownNode`] for a stale handle.
    pub fn partial_forward_order(&self, frontier: &[NodeId], targets: &[NodeId]) -> Result<Vec<NodeId>> {
        self.compiled("partial_forward_order")?;
        for &id in frontier.iter().chain(targets) {
            self.require(id)?;
        }
        let mut reached: HashSet<NodeId> = HashSet::default();
        for &id in frontier {
            match self.loops.loop_of(id).and_then(|lp| self.loops.get(lp)) {
                Some(lp) => reached.extend(lp.members().iter().copied()),
                None => {
                    reached.insert(id);
                }
            }
        }
        let frontier_nodes = reached.clone();
        let graph = self.graph();
        let relevant: HashSet<NodeId> = graph.post_order(targets).into_iter().collect();

        let mut selected = Vec::new();
        let mut seen_loops: HashSet<LoopId> = HashSet::default();
        for &node in self.eval_order(None)?.iter() {
            if !relevant.contains(&node) || frontier_nodes.contains(&node) {
                continue;
            }
            let members: &[NodeId] = match self.loops.loop_of(node) {
                None => core::slice::from_ref(&node),
                // Decided at its first member.
                Some(id) if !seen_loops.insert(id) => continue,
                Some(id) => self.loops.get(id).map(|lp| lp.members()).unwrap_or_default(),
            };
            let downstream = members.iter().any(|&member| {
                graph
                    .predecessors(member)
                    .iter()
                    .any(|input| !members.contains(input) && reached.contains(input))
            });
            if downstream {
                selected.extend_from_slice(members);
                reached.extend(members.iter().copied());
            }
        }
        Ok(selected)
    }

    /// Compute `targets` from an already evaluated `frontier` without
    /// touching the frontier. Frontier and targets keep their values.
    ///
    /// # Errors
    /// As [`Self::forward_propagate`] and [`Self::partial_forward_order`];
    /// [`SequencingError::ValueNotComputed`] if the frontier holds no value.
    pub fn forward_propagate_from_to(&mut self, frontier: &[NodeId], targets: &[NodeId]) -> Result<()> {
        let members = self.partial_forward_order(frontier, targets)?;
        let (unit, lifetimes) = self.adhoc_plan("<from-to>", &members);
        let mut retained = self.compiled("forward_propagate_from_to")?.retained.clone();
        retained.extend(frontier.iter().copied());
        retained.extend(targets.iter().copied());

        let (mut ctx, _) = self.context("forward_propagate_from_to")?;
        ctx.retained = &retained;
        forward_pass(&mut ctx, &unit, &lifetimes, false)
    }

    /// Direct access to the value of a leaf, for a data source to write into.
    /// Allocates the buffer for the current layout if the node has none. Call
    /// [`Self::notify_inputs_modified`] before the next evaluation.
    ///
    /// # Errors
    /// - [`ConfigError::UnknownNode`].
    /// - [`SequencingError::NotAnInputNode`] for a node with inputs.
    /// - [`crate::error::ResourceError`] from the buffer pool.
    pub fn input_value_mut(&mut self, id: NodeId) -> Result<&mut C::Buffer> {
        let descriptor = self.input_node(id)?.descriptor(self.layout);
        self.slots.grow(self.nodes.capacity());
        let slot = &mut self.slots.values[id.index()];
        if slot.is_none() {
            *slot = Some(self.pool.acquire(&descriptor)?);
        }
        self.dirty_inputs.insert(id);
        Ok(slot.as_mut().expect("Network::input_value_mut: [1]"))
    }

    /// Replace the value of a leaf. The previous buffer goes back to the pool.
    /// Call [`Self::notify_inputs_modified`] before the next evaluation.
    ///
    /// # Errors
    /// - [`ConfigError::UnknownNode`].
    /// - [`SequencingError::NotAnInputNode`] for a node with inputs.
    pub fn set_input_value(&mut self, id: NodeId, buffer: C::Buffer) -> Result<()> {
        self.input_node(id)?;
        self.slots.grow(self.nodes.capacity());
        if let Some(previous) = self.slots.values[id.index()].replace(buffer) {
            self.pool.release(previous);
        }
        self.dirty_inputs.insert(id);
        Ok(())
    }

    /// Announce that input buffers were written for a minibatch packed as
    /// `layout`. Every written input gets a fresh timestamp, so whatever
    /// depends on it is recomputed. A layout change also marks every result
    /// shaped by the old layout stale.
    ///
    /// # Errors
    /// [`ConfigError::InputShapeMismatch`] if a written buffer, or after a
    /// layout change any feature or label buffer, disagrees with `layout`.
    /// The inputs then stay unannounced.
    pub fn notify_inputs_modified(&mut self, layout: MinibatchLayout) -> Result<()> {
        let layout_changed = layout != self.layout;
        let is_data = |node: &Node<C>| node.groups.iter().any(NodeGroup::is_input_group);
        for node in self.nodes.iter() {
            let checked = self.dirty_inputs.contains(&node.id) || (layout_changed && is_data(node));
            if !checked {
                continue;
            }
            let Some(value) = self.slots.values.get(node.id.index()).and_then(Option::as_ref) else {
                continue;
            };
            let expected = node.descriptor(layout);
            if *value.descriptor() != expected {
                return Err(ConfigError::InputShapeMismatch {
                    name: node.name.clone(),
                    expected,
                    actual: *value.descriptor(),
                }
                .into());
            }
        }

        if layout_changed {
            debug!(from = %self.layout, to = %layout, "minibatch layout changed");
            self.layout = layout;
            for node in self.nodes.iter_mut() {
                if !node.learnable && !is_data(&*node) && !self.dirty_inputs.contains(&node.id) {
                    node.reset_stamp();
                }
            }
        }
        for id in core::mem::take(&mut self.dirty_inputs) {
            let stamp = self.clock.tick();
            if let Some(node) = self.nodes.get_mut(id) {
                node.eval_timestamp = stamp;
            }
        }
        Ok(())
    }

    /// Give `nodes` fresh timestamps, so everything downstream of them is
    /// recomputed by the next pass. For buffers mutated out of band.
    ///
    /// # Errors
    /// [`ConfigError::UnknownNode`]; no stamp changes then.
    pub fn bump_eval_timestamps(&mut self, nodes: &[NodeId]) -> Result<()> {
        for &id in nodes {
            self.require(id)?;
        }
        for &id in nodes {
            let stamp = self.clock.tick();
            if let Some(node) = self.nodes.get_mut(id) {
                node.eval_timestamp = stamp;
            }
        }
        Ok(())
    }

    /// Mark every result stale.
    pub fn reset_eval_timestamps(&mut self) {
        for node in self.nodes.iter_mut() {
            node.reset_stamp();
        }
    }

    fn input_node(&self, id: NodeId) -> Result<&Node<C>> {
        let node = self.require(id)?;
        if !node.is_leaf() {
            return Err(SequencingError::NotAnInputNode {
                name: node.name.clone(),
            }
            .into());
        }
        Ok(node)
    }

    /// Unit and lifetimes over an arbitrary dependencies-first node list.
    fn adhoc_plan(&self, name: &str, members: &[NodeId]) -> (FlowControlUnit, BufferLifetimes) {
        let steps = self.loops.collapse(members);
        let lifetimes = BufferLifetimes::new(&self.graph(), &steps, &self.loops);
        (FlowControlUnit::Parallel(ParallelUnit::new(name, steps)), lifetimes)
    }

    /// Borrow everything a pass mutates.
    fn context(&mut self, operation: &'static str) -> Result<(ExecContext<'_, C>, &Compiled)> {
        let Self {
            nodes,
            slots,
            pool,
            options,
            clock,
            layout,
            loops,
            compiled,
            dirty_inputs,
            ..
        } = self;
        let compiled = compiled
            .as_ref()
            .ok_or(SequencingError::NotCompiled { operation })?;
        if !dirty_inputs.is_empty() {
            return Err(SequencingError::InputsNotNotified.into());
        }
        let ctx = ExecContext {
            nodes,
            slots,
            pool,
            units: &compiled.units,
            loop_of: loops.membership(),
            clock,
            layout: *layout,
            live: LiveCounts::default(),
            retained: &compiled.retained,
            needs_gradient: &compiled.needs_gradient,
            keep_values: false,
            share_buffers: options.share_buffers,
        };
        Ok((ctx, compiled))
    }
}

/// One forward pass over `unit`.
fn forward_pass<C: Config>(
    ctx: &mut ExecContext<'_, C>,
    unit: &FlowControlUnit,
    lifetimes: &BufferLifetimes,
    keep_values: bool,
) -> Result<()> {
    ctx.live = lifetimes.start_pass();
    ctx.keep_values = keep_values;
    unit.request_buffers_for_forward(ctx)?;
    unit.begin_forward(ctx);
    unit.forward(ctx, FrameRange::All)?;
    unit.end_forward(ctx);
    unit.release_buffers_after_forward(ctx);
    Ok(())
}
