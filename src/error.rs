use crate::types::{BufferDescriptor, LoopId, NodeId};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Any failure reported by the scheduler.
///
/// None of these are recoverable within a pass: an evaluation either completes
/// in dependency order or its results must be discarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The graph itself is malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The API was used in the wrong order.
    #[error(transparent)]
    Sequencing(#[from] SequencingError),
    /// Buffer storage could not be obtained.
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Malformed graph. Reported with the offending node, never auto-corrected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Two nodes share a name.
    #[error("node name `{name}` is already taken")]
    DuplicateName {
        /// The contested name.
        name: String,
    },
    /// A handle refers to no live node.
    #[error("node {id} does not exist in this network")]
    UnknownNode {
        /// The stale or foreign handle.
        id: NodeId,
    },
    /// A name refers to no node.
    #[error("network has no node named `{name}`")]
    UnknownName {
        /// The requested name.
        name: String,
    },
    /// An evaluation target is not a node of this network.
    #[error("root {id} is not part of the network")]
    MissingRoot {
        /// The requested root.
        id: NodeId,
    },
    /// The network has nodes but nothing to evaluate.
    #[error("network has nodes but no roots")]
    NoRoots,
    /// A node lists a deleted or foreign node as input.
    #[error("input {input} of node `{name}` does not exist")]
    DanglingInput {
        /// The consuming node.
        name: String,
        /// The missing input.
        input: NodeId,
    },
    /// A node without a time offset feeds itself.
    #[error("node `{name}` lists itself as an input but is not recurrent")]
    SelfInput {
        /// The offending node.
        name: String,
    },
    /// A cycle is not broken by any recurrent edge.
    #[error("cycle without a recurrent edge through {nodes:?}")]
    UncontrolledCycle {
        /// Nodes on the cycle.
        nodes: Vec<String>,
    },
    /// A node was claimed by two loops.
    #[error("node `{node}` belongs to both loop {first} and loop {second}")]
    OverlappingLoops {
        /// The shared node.
        node: String,
        /// Loop that claimed the node first.
        first: LoopId,
        /// Loop that claimed it again.
        second: LoopId,
    },
    /// A loop is closed by both past-value and future-value edges.
    #[error("loop `{name}` mixes past-value and future-value edges")]
    ConflictingLoopDirection {
        /// Name of the loop.
        name: String,
    },
    /// A node cannot be deleted while other nodes consume it.
    #[error("node `{name}` is still an input of {consumers:?}")]
    NodeInUse {
        /// The node to delete.
        name: String,
        /// Its consumers.
        consumers: Vec<String>,
    },
    /// An injected input buffer disagrees with the announced layout.
    #[error("injected buffer of `{name}` is {actual}, expected {expected}")]
    InputShapeMismatch {
        /// The input node.
        name: String,
        /// Descriptor implied by the layout.
        expected: BufferDescriptor,
        /// Descriptor of the injected buffer.
        actual: BufferDescriptor,
    },
}

/// Incorrect use of the API, as opposed to a bad graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SequencingError {
    /// An operation needs `Network::compile` first.
    #[error("{operation}: network is not compiled")]
    NotCompiled {
        /// The operation that was attempted.
        operation: &'static str,
    },
    /// `eval_order` for a root that never had `build_order`.
    #[error("evaluation order for `{root}` was never built")]
    OrderNotBuilt {
        /// The root.
        root: String,
    },
    /// A per-root order needs the global order first.
    #[error("the global evaluation order was never built")]
    GlobalOrderNotBuilt,
    /// A root depends on a node the global order does not cover.
    #[error("`{node}`, needed by `{root}`, is not in the global evaluation order")]
    OutsideGlobalOrder {
        /// The root whose order was requested.
        root: String,
        /// The first dependency missing from the global order.
        node: String,
    },
    /// Single-input backward on a node group.
    #[error("`{unit}` cannot back-propagate to input {input_index}; use the aggregate backward")]
    AggregateBackpropTo {
        /// The flow-control unit.
        unit: String,
        /// The requested input.
        input_index: usize,
    },
    /// Input buffers were written without `notify_inputs_modified`.
    #[error("input buffers were modified without notification")]
    InputsNotNotified,
    /// A node's value was needed but is not available.
    #[error("value of `{name}` has not been computed")]
    ValueNotComputed {
        /// The node.
        name: String,
    },
    /// Direct buffer access is reserved for leaf nodes.
    #[error("`{name}` is not an input node")]
    NotAnInputNode {
        /// The node.
        name: String,
    },
}

/// Storage could not be obtained.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResourceError {
    /// The buffer implementation failed to allocate.
    #[error("cannot allocate {descriptor}: {reason}")]
    Allocation {
        /// The requested block.
        descriptor: BufferDescriptor,
        /// Reason reported by the allocator.
        reason: String,
    },
}
