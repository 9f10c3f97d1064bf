//! On-disk stream header.
//!
//! The first OS block of a stream file holds the header followed by zero
//! padding. The header records the geometry the file was written with and
//! the logical item count as of the last clean close, so a reopened stream
//! knows where its data ends without trusting the physical file length.

use crate::stream::error::StreamError;

/// `"dpbs"`, the block stream magic.
pub const HEADER_MAGIC: u32 = u32::from_le_bytes(*b"dpbs");

/// Current header layout version.
pub const HEADER_VERSION: u16 = 1;

/// Backend type byte for the block-buffered stream.
pub const BLOCK_BUFFERED_TYPE: u8 = 85;

/// Encoded header length; the rest of the first OS block is zero.
pub const HEADER_ENCODED_LEN: usize = 32;

/// Persisted stream preamble. All multi-byte fields little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamHeader {
    pub magic: u32,
    pub version: u16,
    /// Backend tag; 85 for this implementation. Foreign tags are accepted
    /// with a warning.
    pub stream_type: u8,
    /// Logical block size `B` in bytes; a nonzero multiple of the OS block.
    pub block_size: u64,
    /// Number of items in the stream as of the last clean close.
    pub item_eof: u64,
}

impl StreamHeader {
    /// Fresh header for a newly created stream.
    pub fn new(block_size: u64) -> Self {
        StreamHeader {
            magic: HEADER_MAGIC,
            version: HEADER_VERSION,
            stream_type: BLOCK_BUFFERED_TYPE,
            block_size,
            item_eof: 0,
        }
    }

    /// Encode into the leading bytes of a header block.
    pub fn encode(&self) -> [u8; HEADER_ENCODED_LEN] {
        let mut buf = [0u8; HEADER_ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.stream_type;
        // buf[7] is padding, buf[24..32] reserved; both stay zero.
        buf[8..16].copy_from_slice(&self.block_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.item_eof.to_le_bytes());
        buf
    }

    /// Decode and validate the leading bytes of a header block.
    ///
    /// Magic and version mismatches are hard errors; geometry checks
    /// against the OS block size happen here because a header is unusable
    /// without them.
    pub fn decode(buf: &[u8], os_block_size: u64) -> Result<Self, StreamError> {
        if buf.len() < HEADER_ENCODED_LEN {
            return Err(StreamError::Invalid("header block too short".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(StreamError::Invalid(format!(
                "bad magic {magic:#010x}, expected {HEADER_MAGIC:#010x}"
            )));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != HEADER_VERSION {
            return Err(StreamError::Invalid(format!(
                "unsupported header version {version}"
            )));
        }
        let stream_type = buf[6];
        let block_size = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let item_eof = u64::from_le_bytes(buf[16..24].try_into().unwrap());

        if block_size == 0 || block_size % os_block_size != 0 {
            return Err(StreamError::Invalid(format!(
                "header block size {block_size} is not a nonzero multiple of the OS block ({os_block_size})"
            )));
        }

        Ok(StreamHeader {
            magic,
            version,
            stream_type,
            block_size,
            item_eof,
        })
    }
}
