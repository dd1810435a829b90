use crate::{node::Kernel, pool::Buffer, types::Device};

/// Configuration entry-point for instantiating a network.
///
/// A concrete `Config` binds the node kernel implementation and the result
/// buffer type of one network instantiation. The scheduler never looks inside
/// either: kernels compute, buffers hold results.
pub trait Config: Sized + 'static {
    /// The per-node compute implementation.
    type Kernel: Kernel<Self>;
    /// The storage block holding a node's value or gradient.
    type Buffer: Buffer;
}

/// Runtime switches of a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    /// Recycle result buffers through the pool once their last consumer ran.
    /// With this off, every node keeps its buffer for the lifetime of the
    /// network.
    pub share_buffers: bool,
    /// Device for nodes that don't request one.
    pub default_device: Device,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            share_buffers: true,
            default_device: Device::Cpu,
        }
    }
}
