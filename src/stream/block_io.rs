//! Positioned block I/O over one file descriptor.
//!
//! Wraps a `File` with a cached kernel position so consecutive block
//! transfers skip redundant seeks, and tracks the physical length so the
//! stream layer never has to re-stat the file. Anything that may move the
//! kernel position behind our back (truncate, a failed transfer) poisons
//! the cache.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// One file descriptor plus position and length bookkeeping.
#[derive(Debug)]
pub struct BlockFile {
    file: File,
    /// Physical file length in bytes.
    len: u64,
    /// Where the kernel's file pointer is, when known.
    pointer: Option<u64>,
}

impl BlockFile {
    /// Open an existing file, read-only or read-write.
    pub fn open(path: &Path, read_only: bool) -> io::Result<BlockFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(BlockFile {
            file,
            len,
            pointer: Some(0),
        })
    }

    /// Create a file that must not already exist, read-write.
    pub fn create_new(path: &Path) -> io::Result<BlockFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(BlockFile {
            file,
            len: 0,
            pointer: Some(0),
        })
    }

    /// Current physical length.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        if self.pointer != Some(offset) {
            self.pointer = None;
            self.file.seek(SeekFrom::Start(offset))?;
            self.pointer = Some(offset);
        }
        Ok(())
    }

    /// Fill `buf` from `offset`. Short reads are errors.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek_to(offset)?;
        match self.file.read_exact(buf) {
            Ok(()) => {
                self.pointer = Some(offset + buf.len() as u64);
                Ok(())
            }
            Err(e) => {
                self.pointer = None;
                Err(e)
            }
        }
    }

    /// Write all of `buf` at `offset`, extending the tracked length when the
    /// write goes past the current end.
    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek_to(offset)?;
        match self.file.write_all(buf) {
            Ok(()) => {
                let end = offset + buf.len() as u64;
                self.pointer = Some(end);
                if end > self.len {
                    self.len = end;
                }
                Ok(())
            }
            Err(e) => {
                self.pointer = None;
                Err(e)
            }
        }
    }

    /// Filesystem truncate (or extend) to `len` bytes.
    pub fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.pointer = None;
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    /// Flush userspace buffers. `File` writes are unbuffered, so this only
    /// matters for callers that want an explicit barrier before closing.
    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let mut f = BlockFile::create_new(&path).unwrap();
        f.write_all_at(0, &[1u8; 16]).unwrap();
        f.write_all_at(16, &[2u8; 16]).unwrap();
        assert_eq!(f.len(), 32);

        let mut buf = [0u8; 16];
        f.read_exact_at(16, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 16]);
        f.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16]);
    }

    #[test]
    fn set_len_truncates_and_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let mut f = BlockFile::create_new(&path).unwrap();
        f.write_all_at(0, &[9u8; 64]).unwrap();
        f.set_len(32).unwrap();
        assert_eq!(f.len(), 32);

        let mut buf = [0u8; 16];
        assert!(f.read_exact_at(24, &mut buf).is_err());
    }
}
