use crate::{
    config::Config,
    types::{
        BufferDescriptor, Device, FrameRange, IndexMap, MinibatchLayout, NodeId, Shape, Timestamp,
    },
};
use core::fmt::Debug;
use derive_more::Display;

/// The computation a node performs.
///
/// The scheduler decides *when* a kernel runs and on which frames; the kernel
/// decides *what* it computes. Kernels read their inputs and write their result
/// through the APIs handed to them, never through the network.
pub trait Kernel<C: Config>: Debug {
    /// Opaque operation tag, e.g. `"Times"` or `"PastValue"`.
    fn operation(&self) -> &str;

    /// Time offset of a recurrent node: `d > 0` reads inputs at `t - d`
    /// (past value), `d < 0` at `t - d` in the other direction (future value).
    /// Edges out of a node with a nonzero offset are the only edges allowed to
    /// close a cycle.
    fn time_offset(&self) -> isize {
        0
    }

    /// Compute the node's value for `frame`.
    fn forward(&mut self, api: &mut impl ForwardApi<C>, frame: FrameRange);

    /// Accumulate the gradient of input `input_index` for `frame`.
    fn backward(&mut self, input_index: usize, api: &mut impl BackwardApi<C>, frame: FrameRange);
}

/// API available to kernels while computing a value.
pub trait ForwardApi<C: Config> {
    /// Packing of the current minibatch.
    fn layout(&self) -> MinibatchLayout;
    /// Number of inputs of the running node.
    fn num_inputs(&self) -> usize;
    /// Value of input `index`.
    ///
    /// Available for every input: the scheduler refuses to run a node whose
    /// inputs hold no value.
    fn input(&self, index: usize) -> &C::Buffer;
    /// The running node's own result buffer.
    fn output(&mut self) -> &mut C::Buffer;
}

/// API available to kernels while back-propagating.
pub trait BackwardApi<C: Config> {
    /// Packing of the current minibatch.
    fn layout(&self) -> MinibatchLayout;
    /// Value of the running node.
    fn value(&self) -> &C::Buffer;
    /// Gradient flowing into the running node.
    fn gradient(&self) -> &C::Buffer;
    /// Value of input `index`.
    fn input_value(&self, index: usize) -> &C::Buffer;
    /// Gradient of the input being back-propagated to.
    fn input_gradient(&mut self) -> &mut C::Buffer;
}

/// Named node groups. By convention a node belongs to at most one of the input
/// groups (feature, label) and any number of the output-side groups.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NodeGroup {
    /// Model inputs filled by a data source.
    #[display("feature")]
    Feature,
    /// Supervision inputs filled by a data source.
    #[display("label")]
    Label,
    /// Training criteria; back-propagation starts here.
    #[display("criterion")]
    Criterion,
    /// Evaluation metrics.
    #[display("evaluation")]
    Evaluation,
    /// Externally consumed outputs.
    #[display("output")]
    Output,
}

impl NodeGroup {
    /// Every group, in a fixed order.
    pub const ALL: [Self; 5] = [
        Self::Feature,
        Self::Label,
        Self::Criterion,
        Self::Evaluation,
        Self::Output,
    ];

    const fn bit(self) -> u8 {
        1 << self as u8
    }

    /// Whether members of this group are evaluation targets.
    #[must_use]
    pub fn is_root_group(self) -> bool {
        matches!(self, Self::Criterion | Self::Evaluation | Self::Output)
    }

    /// Whether members of this group receive external data.
    #[must_use]
    pub fn is_input_group(self) -> bool {
        matches!(self, Self::Feature | Self::Label)
    }
}

/// Set of [`NodeGroup`]s a node is tagged with.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeGroups(u8);

impl NodeGroups {
    /// Tag with `group`. Returns whether the tag is new.
    pub fn insert(&mut self, group: NodeGroup) -> bool {
        let fresh = !self.contains(group);
        self.0 |= group.bit();
        fresh
    }

    /// Drop the `group` tag.
    pub fn remove(&mut self, group: NodeGroup) {
        self.0 &= !group.bit();
    }

    /// Whether the node carries `group`.
    #[must_use]
    pub fn contains(self, group: NodeGroup) -> bool {
        self.0 & group.bit() != 0
    }

    /// Tagged groups in [`NodeGroup::ALL`] order.
    pub fn iter(self) -> impl Iterator<Item = NodeGroup> {
        NodeGroup::ALL.into_iter().filter(move |&g| self.contains(g))
    }
}

/// Everything needed to add a node to a network.
#[derive(derive_more::Debug)]
pub struct NodeSpec<C: Config> {
    pub(crate) name: String,
    pub(crate) kernel: C::Kernel,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) sample_len: usize,
    pub(crate) device: Option<Device>,
    pub(crate) groups: NodeGroups,
    pub(crate) learnable: bool,
    pub(crate) value_sharable: bool,
}

impl<C: Config> NodeSpec<C> {
    /// A node called `name` computing with `kernel`, no inputs, one element
    /// per frame.
    pub fn new(name: impl Into<String>, kernel: C::Kernel) -> Self {
        Self {
            name: name.into(),
            kernel,
            inputs: Vec::new(),
            sample_len: 1,
            device: None,
            groups: NodeGroups::default(),
            learnable: false,
            value_sharable: true,
        }
    }

    /// Wire the inputs, in kernel argument order.
    #[must_use]
    pub fn inputs(mut self, inputs: &[NodeId]) -> Self {
        self.inputs = inputs.to_vec();
        self
    }

    /// Elements per frame of the node's result.
    #[must_use]
    pub fn sample_len(mut self, sample_len: usize) -> Self {
        self.sample_len = sample_len;
        self
    }

    /// Device affinity of the node's result.
    #[must_use]
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Add a group tag.
    #[must_use]
    pub fn tag(mut self, group: NodeGroup) -> Self {
        self.groups.insert(group);
        self
    }

    /// Mark as a learnable parameter: needs a gradient, keeps its value and
    /// gradient across calls.
    #[must_use]
    pub fn learnable(mut self) -> Self {
        self.learnable = true;
        self.value_sharable = false;
        self
    }

    /// Keep the value across calls instead of returning it to the pool.
    #[must_use]
    pub fn non_sharable(mut self) -> Self {
        self.value_sharable = false;
        self
    }
}

/// A vertex of the computation network.
#[derive(derive_more::Debug)]
pub struct Node<C: Config> {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) kernel: C::Kernel,
    pub(crate) groups: NodeGroups,
    pub(crate) sample_len: usize,
    pub(crate) device: Device,
    pub(crate) learnable: bool,
    pub(crate) value_sharable: bool,
    pub(crate) part_of_loop: bool,
    pub(crate) eval_timestamp: Timestamp,
    /// Stamp the value had when its buffer went back to the pool. Recomputing
    /// from unchanged inputs restores it instead of taking a new one.
    pub(crate) recycled_stamp: Timestamp,
}

impl<C: Config> Node<C> {
    pub(crate) fn from_spec(id: NodeId, spec: NodeSpec<C>, default_device: Device) -> Self {
        let NodeSpec {
            name,
            kernel,
            inputs,
            sample_len,
            device,
            groups,
            learnable,
            value_sharable,
        } = spec;
        // Recurrent nodes carry state from one call to the next.
        let carries_state = kernel.time_offset() != 0;
        Self {
            id,
            name,
            inputs,
            kernel,
            groups,
            sample_len,
            device: device.unwrap_or(default_device),
            learnable,
            value_sharable: value_sharable && !carries_state,
            part_of_loop: false,
            eval_timestamp: 0,
            recycled_stamp: 0,
        }
    }

    /// Stable handle.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inputs in kernel argument order.
    #[must_use]
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Operation tag reported by the kernel.
    #[must_use]
    pub fn operation(&self) -> &str {
        self.kernel.operation()
    }

    /// The node's kernel.
    #[must_use]
    pub fn kernel(&self) -> &C::Kernel {
        &self.kernel
    }

    /// Mutable access to the kernel, e.g. to change hyper-parameters between
    /// calls. Structure-affecting changes (the time offset) require a recompile.
    pub fn kernel_mut(&mut self) -> &mut C::Kernel {
        &mut self.kernel
    }

    /// Time offset of the kernel; nonzero for recurrent nodes.
    #[must_use]
    pub fn time_offset(&self) -> isize {
        self.kernel.time_offset()
    }

    /// Whether edges out of this node may close a cycle.
    #[must_use]
    pub fn is_recurrent(&self) -> bool {
        self.time_offset() != 0
    }

    /// Group tags.
    #[must_use]
    pub fn groups(&self) -> NodeGroups {
        self.groups
    }

    /// Elements per frame.
    #[must_use]
    pub fn sample_len(&self) -> usize {
        self.sample_len
    }

    /// Device affinity.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Whether the node is a learnable parameter.
    #[must_use]
    pub fn is_learnable(&self) -> bool {
        self.learnable
    }

    /// Whether the value may be recycled through the buffer pool.
    #[must_use]
    pub fn is_value_sharable(&self) -> bool {
        self.value_sharable
    }

    /// Whether the last compile placed this node inside a loop.
    #[must_use]
    pub fn is_part_of_loop(&self) -> bool {
        self.part_of_loop
    }

    /// Whether the node has no inputs.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Buffer this node's value and gradient need under `layout`. Learnable
    /// parameters don't depend on the minibatch and always have one frame.
    #[must_use]
    pub fn descriptor(&self, layout: MinibatchLayout) -> BufferDescriptor {
        BufferDescriptor {
            shape: Shape {
                sample_len: self.sample_len,
                num_frames: if self.learnable { 1 } else { layout.num_frames() },
            },
            device: self.device,
        }
    }

    /// Clock value of the current result, `0` if there is none.
    #[must_use]
    pub fn eval_timestamp(&self) -> Timestamp {
        self.eval_timestamp
    }

    /// Forget the current result and whatever it was recycled from.
    pub(crate) fn reset_stamp(&mut self) {
        self.eval_timestamp = 0;
        self.recycled_stamp = 0;
    }
}

impl<C: Config> Clone for Node<C>
where
    C::Kernel: Clone,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            kernel: self.kernel.clone(),
            groups: self.groups,
            sample_len: self.sample_len,
            device: self.device,
            learnable: self.learnable,
            value_sharable: self.value_sharable,
            part_of_loop: self.part_of_loop,
            eval_timestamp: self.eval_timestamp,
            recycled_stamp: self.recycled_stamp,
        }
    }
}

/// Owner of all nodes, indexed by handle.
#[derive(derive_more::Debug)]
pub(crate) struct NodeArena<C: Config> {
    slots: Vec<Option<Node<C>>>,
    names: IndexMap<String, NodeId>,
}

impl<C: Config> NodeArena<C> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            names: IndexMap::default(),
        }
    }

    /// Number of handles ever issued; every live `NodeId::index()` is below it.
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.names.len()
    }

    pub(crate) fn next_id(&self) -> NodeId {
        NodeId::from_index(self.slots.len())
    }

    pub(crate) fn insert(&mut self, node: Node<C>) -> NodeId {
        let id = node.id;
        assert_eq!(id.index(), self.slots.len(), "NodeArena::insert: [1]");
        let previous = self.names.insert(node.name.clone(), id);
        assert!(previous.is_none(), "NodeArena::insert: [2]");
        self.slots.push(Some(node));
        id
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Node<C>> {
        let node = self.slots.get_mut(id.index())?.take()?;
        self.names.shift_remove(&node.name);
        Some(node)
    }

    pub(crate) fn rename(&mut self, id: NodeId, new_name: String) {
        let node = self.get_mut(id).expect("NodeArena::rename: [1]");
        let old_name = core::mem::replace(&mut node.name, new_name.clone());
        self.names.shift_remove(&old_name);
        self.names.insert(new_name, id);
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node<C>> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node<C>> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn id_of(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub(crate) fn contains_name(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Name of a live node, or its handle rendered as text.
    pub(crate) fn display_name(&self, id: NodeId) -> String {
        self.get(id).map_or_else(|| id.to_string(), |node| node.name.clone())
    }

    /// Live nodes in creation order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Node<C>> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node<C>> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    /// Names in insertion order, with rename/replace moving a name to the end.
    pub(crate) fn names(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.names.iter().map(|(name, &id)| (name.as_str(), id))
    }
}

impl<C: Config> Clone for NodeArena<C>
where
    C::Kernel: Clone,
{
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            names: self.names.clone(),
        }
    }
}
