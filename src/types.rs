use core::{num::NonZeroU32, ops::Range};
use derive_more::Display;
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::{HashMap as _HashMap, HashSet as _HashSet};

/// Stable handle of a node inside a network's arena.
///
/// Handles are assigned in creation order and never reused, so a handle that
/// outlives its node (after a delete or replace) is detected as unknown rather
/// than aliasing a newer node.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("#{_0}")]
#[repr(transparent)]
pub struct NodeId(NonZeroU32);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        let raw = u32::try_from(index)
            .ok()
            .and_then(|index| index.checked_add(1))
            .and_then(NonZeroU32::new)
            .expect("NodeId::from_index: [1]");
        Self(raw)
    }

    /// Zero-based arena slot of this node.
    #[must_use]
    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Raw numeric identifier (starts at 1).
    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Index of a loop in the network's loop list, assigned in discovery order.
pub type LoopId = usize;

/// Value of the evaluation clock at which a node's result was produced.
///
/// `0` means the node holds no valid result.
pub type Timestamp = u64;

/// Device a node's result buffer lives on.
#[derive(Debug, Display, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory.
    #[default]
    #[display("cpu")]
    Cpu,
    /// Accelerator with the given ordinal.
    #[display("accel:{_0}")]
    Accelerator(u16),
}

/// Shape of a result buffer: `sample_len` elements for each of `num_frames`
/// frames (parallel sequences times time steps).
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[display("{sample_len}x{num_frames}")]
pub struct Shape {
    /// Elements per frame.
    pub sample_len: usize,
    /// Number of frames in the minibatch.
    pub num_frames: usize,
}

impl Shape {
    /// Total number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sample_len * self.num_frames
    }

    /// Whether the shape holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the buffer pool needs to decide whether two blocks are
/// interchangeable.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[display("{shape} on {device}")]
pub struct BufferDescriptor {
    /// Buffer shape.
    pub shape: Shape,
    /// Buffer device.
    pub device: Device,
}

/// How the current minibatch is packed: `num_parallel_sequences` sequences of
/// `num_time_steps` steps each, stored time-major (all sequences of step 0,
/// then all sequences of step 1, ...).
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[display("{num_parallel_sequences} sequences x {num_time_steps} steps")]
pub struct MinibatchLayout {
    /// Sequences processed side by side.
    pub num_parallel_sequences: usize,
    /// Length of each sequence.
    pub num_time_steps: usize,
}

impl MinibatchLayout {
    /// Layout with the given dimensions.
    #[must_use]
    pub fn new(num_parallel_sequences: usize, num_time_steps: usize) -> Self {
        Self {
            num_parallel_sequences,
            num_time_steps,
        }
    }

    /// Number of frames (columns) in a buffer laid out this way.
    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.num_parallel_sequences * self.num_time_steps
    }
}

impl Default for MinibatchLayout {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// Portion of the minibatch a compute call operates on.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FrameRange {
    /// Every frame at once (batched execution).
    #[display("all frames")]
    All,
    /// A single time step across all parallel sequences.
    #[display("t={_0}")]
    TimeStep(usize),
}

impl FrameRange {
    /// Frame columns covered by this range under `layout`.
    #[must_use]
    pub fn frames(self, layout: MinibatchLayout) -> Range<usize> {
        match self {
            Self::All => 0..layout.num_frames(),
            Self::TimeStep(t) => {
                let start = t * layout.num_parallel_sequences;
                start..start + layout.num_parallel_sequences
            }
        }
    }
}

/// Stepping direction of a loop through the time axis.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    /// `t = 0..T`, loops closed by past-value edges.
    #[display("forward")]
    Forward,
    /// `t = T..0`, loops closed by future-value edges.
    #[display("backward")]
    Backward,
}

impl Direction {
    /// Direction implied by a recurrent node's time offset: positive offsets
    /// read the past, so the loop has to step forward.
    #[must_use]
    pub fn from_offset(offset: isize) -> Option<Self> {
        match offset.signum() {
            1 => Some(Self::Forward),
            -1 => Some(Self::Backward),
            _ => None,
        }
    }

    /// The opposite direction.
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }

    /// Time indices `0..num_steps` visited in this direction.
    pub fn time_steps(self, num_steps: usize) -> impl Iterator<Item = usize> {
        (0..num_steps).map(move |i| match self {
            Self::Forward => i,
            Self::Backward => num_steps - 1 - i,
        })
    }
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
/// `IndexSet` type with fast hasher.
pub type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
