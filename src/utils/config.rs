//! Crate configuration constants.
//! Tuning and thresholds in one place.

// ---- Streams ----

/// Block-stream geometry and accounting defaults.
pub struct StreamConsts;

impl StreamConsts {
    /// Default filesystem block size assumed when the caller does not say
    /// otherwise (bytes).
    pub const DEFAULT_OS_BLOCK_SIZE: u64 = 4096;
    /// Default logical block factor: a logical block is this many OS blocks.
    pub const DEFAULT_BLOCK_FACTOR: u64 = 8;
    /// Per-allocation bookkeeping charged by the memory query, per `Box`/`Vec`
    /// the stream owns.
    pub const ALLOC_OVERHEAD: u64 = 64;
}

// ---- Sorting ----

/// External sort tuning.
pub struct SortConsts;

impl SortConsts {
    /// Smallest useful merge fan-in. Below this the memory budget cannot
    /// support a merge at all.
    pub const MIN_FAN_IN: usize = 2;
    /// Cap on fan-in regardless of memory; beyond this the heap root
    /// comparisons dominate and more open streams stop paying off.
    pub const MAX_FAN_IN: usize = 128;
    /// Run buffer floor (items). Keeps degenerate budgets from producing
    /// one-item runs.
    pub const MIN_RUN_LENGTH: usize = 16;
}

// ---- Pipelining ----

/// Planner and runtime overhead accounting.
pub struct PipelineConsts;

impl PipelineConsts {
    /// Memory charged per phase for the framework itself before node
    /// assignment runs.
    pub const PHASE_OVERHEAD: u64 = 4096;
    /// Memory charged per node in a phase for map entries and handles.
    pub const NODE_OVERHEAD: u64 = 256;
    /// Items buffered at a virtual-chunk boundary before flushing across
    /// the type-erased call.
    pub const VIRTUAL_BATCH_SIZE: usize = 64;
}

// ---- Progress ----

/// Progress reporting cadence.
pub struct ProgressConsts;

impl ProgressConsts {
    /// Steps accumulated in a node before the shared sink is advanced
    /// (reduces per-item sink traffic).
    pub const STEP_BATCH: u64 = 100;
}

// ---- Parallel operator ----

/// Worker fan-out tuning for the parallel push operator.
pub struct ParallelConsts;

impl ParallelConsts {
    /// Items per batch handed to a worker.
    pub const BATCH_SIZE: usize = 64;
    /// Bounded capacity of each worker's input and output queue, in batches.
    pub const CHANNEL_CAP: usize = 4;
}
