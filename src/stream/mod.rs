//! Block-buffered typed streams on disk.
//!
//! A [`BlockStream`] is a sequential, seekable container of fixed-size
//! records backed by a single file: one resident block, dirty write-back,
//! substream views sharing the file, and an on-disk header that preserves
//! the logical end of stream across reopens.

pub mod block_io;
pub mod buffered;
pub mod error;
pub mod header;
pub mod record;

pub use buffered::{BlockStream, MemoryUsage, Mode, Persist, Status};
pub use error::StreamError;
pub use header::StreamHeader;
pub use record::Record;
