//! External-memory streams and pipelining.
//!
//! diskpipe computes over data sets far larger than main memory by
//! streaming fixed-size records through files on disk while keeping
//! resident memory bounded. Two subsystems carry the load:
//!
//! - [`stream`] holds the block-buffered typed stream: a sequential,
//!   seekable container of fixed-size records backed by one file, with a
//!   single resident block, dirty write-back, substream views, and an
//!   on-disk header that preserves the logical end of stream across
//!   reopens.
//! - [`pipeline`] holds the pipelining runtime: computation nodes
//!   composed declaratively with the `|` operator, planned into phases at
//!   materialization points, assigned memory against a budget, and driven
//!   through `prepare → propagate → begin → go → end`.
//!
//! They meet in [`sort`], the external merge sort that consumes streams
//! and feeds pipelines. Everything is parameterized by an explicit
//! [`Context`] (geometry, memory budget, temp-file naming); there is no
//! process-wide state and contexts can coexist.
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use diskpipe::pipeline::{input_vector, multiply, output_vector};
//! use diskpipe::progress::Progress;
//! use diskpipe::Context;
//!
//! fn main() -> diskpipe::Result<()> {
//!     let ctx = Context::new();
//!     let out = Rc::new(RefCell::new(Vec::new()));
//!     let mut p = input_vector((0i64..20).collect())
//!         | multiply(3)
//!         | multiply(2)
//!         | output_vector(Rc::clone(&out));
//!     p.run(ctx.memory_limit(), &Progress::null())?;
//!     assert_eq!(out.borrow()[1], 6);
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod pipeline;
pub mod progress;
pub mod sort;
pub mod stream;
pub mod utils;

pub use context::Context;
pub use progress::{Progress, ProgressSink};
pub use stream::{BlockStream, MemoryUsage, Mode, Persist, Record, StreamError};

/// Result alias used by the pipeline-facing API.
pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;
