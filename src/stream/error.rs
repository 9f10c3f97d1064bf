//! Stream-layer error codes.
//!
//! Every backend call is a potential I/O failure and callers branch on the
//! outcome, so the stream layer reports errors as values rather than
//! panicking. An I/O failure leaves the stream invalid; the invalid state
//! is sticky and later operations short-circuit with [`StreamError::Invalid`].

use std::io;

/// Result of a stream operation that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The cursor is at the logical end of stream (reads), or a substream
    /// write hit its upper bound.
    #[error("end of stream")]
    EndOfStream,

    /// Write attempted on a read-only stream.
    #[error("stream is read-only")]
    ReadOnly,

    /// The requested substream mode exceeds what the super-stream permits.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// Truncate attempted on a substream view.
    #[error("stream is a substream")]
    StreamIsSubstream,

    /// Seek or truncate target outside `[0, stream_len()]`.
    #[error("offset {offset} out of range (stream holds {len} items)")]
    OffsetOutOfRange { offset: u64, len: u64 },

    /// An operating-system I/O call failed. The stream is invalid afterwards.
    #[error("I/O error: {0}")]
    Os(#[from] io::Error),

    /// The stream is unusable: a bad header, an earlier I/O failure, or an
    /// unsupported geometry. Sticky.
    #[error("invalid stream: {0}")]
    Invalid(String),
}

impl StreamError {
    /// The raw OS errno, if this error carries one.
    pub fn os_errno(&self) -> Option<i32> {
        match self {
            StreamError::Os(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
