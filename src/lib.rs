//! Evaluation scheduler for computation networks with recurrent loops.
//!
//! A network is a directed graph of nodes whose only cycles are closed by
//! recurrent (time-delay) edges. This crate decides in which order nodes run,
//! how loops are stepped through time, and when result buffers can be
//! recycled. It never looks at the numbers: kernels compute, buffers store.
//! It:
//! - Builds a global dependencies-first order over every root, and derives the
//!   order of each root by filtering it, so all roots agree on shared nodes.
//! - Finds loops as strongly connected components, checks that recurrent edges
//!   close them, and collapses each into a single sequential step.
//! - Runs acyclic parts over the whole minibatch and loops one time step at a
//!   time, forward in their direction and backward in the exact reverse.
//! - Counts the consumers of every value along an order and hands its buffer
//!   back to a pool as soon as the last one ran.
//!
//! Key modules:
//! - `config`: binds a concrete kernel and buffer type via the `Config` trait.
//! - `node`: nodes, kernels and the APIs kernels compute through.
//! - `order`, `loops`: evaluation orders and loop detection.
//! - `flow`: sequential and parallel flow-control units.
//! - `pool`: buffer pool and per-order buffer lifetimes.
//! - `network`: the facade tying it all together.
//!
//! Quick start:
//! 1. Implement `Config` with your `Kernel` and `Buffer` types.
//! 2. Add nodes to a `Network` and `compile` it.
//! 3. Write input buffers, call `notify_inputs_modified`, then
//!    `forward_propagate` (and `backpropagate` from a criterion).
//!
//! Evaluation is single-threaded and deterministic. For concurrent work, fork
//! the network and evaluate the forks in parallel (see `parallel`).

/// Monotonic evaluation clock shared by forked networks.
pub mod clock;
/// Public interface to configure a network.
///
/// Exposes the `Config` trait which binds the kernel and buffer types for a
/// concrete instantiation, and the runtime `NetworkOptions`.
pub mod config;
/// Error taxonomy: malformed graphs, API misuse, allocation failures.
pub mod error;
/// Flow-control units executing plain steps and loops.
///
/// `ParallelUnit` runs its steps over the whole minibatch; `SequentialUnit`
/// steps one loop through time. Both implement `FlowControl`.
pub mod flow;
/// Read-only adjacency view over a network.
pub mod graph;
/// Loop detection and loop-aware order rewriting.
pub mod loops;
/// The network facade: construction, compilation, evaluation and editing.
pub mod network;
/// Nodes, their kernels and the APIs kernels compute through.
pub mod node;
/// Cached per-root evaluation orders.
pub mod order;
/// Evaluating independent forks of a network concurrently.
pub mod parallel;
/// Buffer pool and per-order buffer lifetimes.
///
/// Values are reference counted along an order; the pool recycles blocks
/// keyed by shape and device and never shrinks.
pub mod pool;
mod sync;
/// Core types used across the crate (ids, shapes, layouts, collections).
pub mod types;
