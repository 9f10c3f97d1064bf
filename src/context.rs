//! Explicit runtime context shared by streams, sorting, and pipelines.
//!
//! Everything that would otherwise be process-wide state (block geometry
//! defaults, the memory budget, temp-file naming) lives on a [`Context`]
//! value that callers pass to constructors. Contexts clone cheaply and two
//! contexts never interfere, so tests can run several side by side.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::config::StreamConsts;

/// Runtime knobs for stream and pipeline construction.
///
/// Clones share the temp-name counter, so paths handed out by a context and
/// its clones never collide.
#[derive(Clone, Debug)]
pub struct Context {
    os_block_size: u64,
    block_factor: u64,
    memory_limit: u64,
    temp_dir: PathBuf,
    temp_counter: Arc<AtomicU64>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Context with default geometry, a 64 MiB memory budget, and the
    /// system temp directory.
    pub fn new() -> Self {
        Context {
            os_block_size: StreamConsts::DEFAULT_OS_BLOCK_SIZE,
            block_factor: StreamConsts::DEFAULT_BLOCK_FACTOR,
            memory_limit: 64 * 1024 * 1024,
            temp_dir: std::env::temp_dir(),
            temp_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override the assumed filesystem block size. The header occupies one
    /// OS block and logical blocks are multiples of it, so the block must
    /// at least hold the encoded header. Small values are legal and are
    /// what the boundary tests use.
    pub fn with_os_block_size(mut self, bytes: u64) -> Self {
        assert!(
            bytes >= crate::stream::header::HEADER_ENCODED_LEN as u64,
            "os block size must hold the stream header"
        );
        self.os_block_size = bytes;
        self
    }

    /// Override the default logical block factor used by `open` when the
    /// caller passes no explicit factor.
    pub fn with_block_factor(mut self, lbf: u64) -> Self {
        self.block_factor = lbf;
        self
    }

    /// Set the memory budget handed to the pipeline planner and the sort
    /// manager.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Directory for temp streams (sort runs, pipeline buffers).
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn os_block_size(&self) -> u64 {
        self.os_block_size
    }

    pub fn block_factor(&self) -> u64 {
        self.block_factor
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Hand out a fresh path for a temp stream. Names carry the pid and a
    /// per-context counter, so concurrent processes and contexts sharing a
    /// directory stay apart.
    pub fn temp_stream_path(&self) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.temp_dir
            .join(format!("{}_{}_{n}.dps", env!("CARGO_PKG_NAME"), process::id()))
    }
}
