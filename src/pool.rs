use crate::{
    config::Config,
    error::ResourceError,
    flow::Step,
    graph::DependencyGraph,
    loops::LoopAnalyzer,
    types::{BufferDescriptor, IndexMap, IndexSet, NodeId},
};
use core::fmt::Debug;
use tracing::trace;

/// A block of storage holding one node's value or gradient.
pub trait Buffer: Debug + Sized {
    /// Allocate a block for `descriptor`. Contents are unspecified.
    ///
    /// # Errors
    /// [`ResourceError::Allocation`] if the device cannot provide the block.
    fn allocate(descriptor: &BufferDescriptor) -> Result<Self, ResourceError>;

    /// Shape and device this block was allocated for.
    fn descriptor(&self) -> &BufferDescriptor;

    /// Set every element to `value`.
    fn fill(&mut self, value: f64);
}

/// Allocation counters of a [`BufferPool`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks obtained from the allocator.
    pub allocated: usize,
    /// Acquisitions served from a free list.
    pub recycled: usize,
    /// Blocks handed back.
    pub released: usize,
}

/// Free lists of interchangeable blocks keyed by descriptor.
///
/// The pool never shrinks: released blocks stay around for the next request
/// with the same shape and device instead of going back to the allocator.
#[derive(Debug)]
pub struct BufferPool<B> {
    free: IndexMap<BufferDescriptor, Vec<B>>,
    stats: PoolStats,
}

impl<B: Buffer> BufferPool<B> {
    /// Empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            free: IndexMap::default(),
            stats: PoolStats::default(),
        }
    }

    /// A block for `descriptor`, recycled when possible.
    ///
    /// # Errors
    /// [`ResourceError::Allocation`] from the allocator.
    pub fn acquire(&mut self, descriptor: &BufferDescriptor) -> Result<B, ResourceError> {
        if let Some(buffer) = self.free.get_mut(descriptor).and_then(Vec::pop) {
            self.stats.recycled += 1;
            trace!(%descriptor, "recycled buffer");
            return Ok(buffer);
        }
        let buffer = B::allocate(descriptor)?;
        self.stats.allocated += 1;
        trace!(%descriptor, "allocated buffer");
        Ok(buffer)
    }

    /// Hand a block back for reuse.
    pub fn release(&mut self, buffer: B) {
        self.stats.released += 1;
        self.free.entry(*buffer.descriptor()).or_default().push(buffer);
    }

    /// Number of idle blocks across all descriptors.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Allocation counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

impl<B: Buffer> Default for BufferPool<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Value and gradient buffers of every node, indexed by handle.
#[derive(Debug, Clone)]
pub(crate) struct BufferSlots<B> {
    pub(crate) values: Vec<Option<B>>,
    pub(crate) gradients: Vec<Option<B>>,
}

impl<B> BufferSlots<B> {
    pub(crate) fn new() -> Self {
        Self {
            values: Vec::new(),
            gradients: Vec::new(),
        }
    }

    /// Make room for handles below `capacity`.
    pub(crate) fn grow(&mut self, capacity: usize) {
        if self.values.len() < capacity {
            self.values.resize_with(capacity, || None);
            self.gradients.resize_with(capacity, || None);
        }
    }

    /// Take both buffers of `node` out, e.g. when it is deleted.
    pub(crate) fn take(&mut self, node: NodeId) -> (Option<B>, Option<B>) {
        let index = node.index();
        (
            self.values.get_mut(index).and_then(Option::take),
            self.gradients.get_mut(index).and_then(Option::take),
        )
    }
}

/// Reference counts of every value consumed along one evaluation order.
///
/// Built once per order from its parent map (input -> consuming steps); a loop
/// counts as a single consumer, and reads between members of the same loop
/// don't count at all.
#[derive(Debug, Clone, Default)]
pub struct BufferLifetimes {
    consumers: Vec<u32>,
}

impl BufferLifetimes {
    /// Lifetimes of the values read along `steps`.
    #[must_use]
    pub fn new<C: Config>(
        graph: &DependencyGraph<'_, C>,
        steps: &[Step],
        loops: &LoopAnalyzer,
    ) -> Self {
        let mut parents: IndexMap<NodeId, IndexSet<Step>> = IndexMap::default();
        for &step in steps {
            let members: &[NodeId] = match step {
                Step::Node(ref node) => core::slice::from_ref(node),
                Step::Loop(id) => loops.get(id).map(|lp| lp.members()).unwrap_or_default(),
            };
            for &member in members {
                for &input in graph.predecessors(member) {
                    if !members.contains(&input) {
                        parents.entry(input).or_default().insert(step);
                    }
                }
            }
        }
        let mut consumers = vec![0u32; graph.capacity()];
        for (input, steps) in &parents {
            consumers[input.index()] = u32::try_from(steps.len()).expect("BufferLifetimes::new: [1]");
        }
        Self { consumers }
    }

    /// Number of steps reading `node`.
    #[must_use]
    pub fn consumers(&self, node: NodeId) -> u32 {
        self.consumers.get(node.index()).copied().unwrap_or(0)
    }

    /// Fresh counters for one pass.
    #[must_use]
    pub fn start_pass(&self) -> LiveCounts {
        LiveCounts {
            remaining: self.consumers.clone(),
        }
    }
}

/// Per-pass countdown of outstanding consumers, indexed by handle.
#[derive(Debug, Clone, Default)]
pub struct LiveCounts {
    remaining: Vec<u32>,
}

impl LiveCounts {
    /// Record that one consumer of `node` has run. Returns `true` when that was
    /// the last one.
    ///
    /// # Panics
    /// If `node` has no outstanding consumer: counts never go negative.
    pub fn consume(&mut self, node: NodeId) -> bool {
        let remaining = self
            .remaining
            .get_mut(node.index())
            .filter(|count| **count > 0)
            .expect("LiveCounts::consume: [1]");
        *remaining -= 1;
        *remaining == 0
    }

    /// Outstanding consumers of `node`.
    #[must_use]
    pub fn remaining(&self, node: NodeId) -> u32 {
        self.remaining.get(node.index()).copied().unwrap_or(0)
    }
}
