//! The pipelining runtime.
//!
//! Graphs of cooperating nodes are composed declaratively with the `|`
//! operator, planned into phases at materialization points, given memory
//! by the planner, and driven through `prepare → propagate → begin → go →
//! end` with progress reporting.

pub mod factory;
pub mod graph;
pub mod node;
pub mod nodes;
pub mod parallel;
pub mod runtime;
pub mod virtual_chunk;

pub use factory::{
    GraphBuilder, PipeBegin, PipeEnd, PipeMiddle, PullPipeBegin, PullPipeEnd, PullPipeMiddle,
};
pub use graph::{NodeMap, Phase, Plan};
pub use node::{
    EdgeKind, LifecycleState, Node, NodeCtx, NodeEntry, NodeId, PullNode, PullSource, PushNode,
    PushTarget,
};
pub use nodes::{
    bitbucket, buffer, filter, identity, input, input_vector, linear, map, multiply, output,
    output_vector, pull_identity, pull_input, pull_input_vector, pull_output, pull_output_vector,
    reverser, sort, sort_by, tee, PassiveBuffer,
};
pub use parallel::{parallel, Ordering};
pub use runtime::Pipeline;
pub use virtual_chunk::VirtualChunk;
