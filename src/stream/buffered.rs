//! The block-buffered typed stream.
//!
//! A [`BlockStream`] keeps a logical item cursor over a file whose first OS
//! block is the header and whose remainder is fixed-size logical blocks. At
//! most one block is resident per handle; a modified block is written back
//! when the cursor leaves it, when a substream is created, or at close.
//! Substreams are independent descriptors over the same file sharing the
//! super-stream's header snapshot.

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, warn};

use crate::context::Context;
use crate::stream::block_io::BlockFile;
use crate::stream::error::StreamError;
use crate::stream::header::{HEADER_ENCODED_LEN, StreamHeader};
use crate::stream::header::BLOCK_BUFFERED_TYPE;
use crate::stream::record::Record;
use crate::utils::config::StreamConsts;

/// How a stream is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Existing file, read-only.
    Read,
    /// Read-write; creates the file when missing, cursor at the start.
    Write,
    /// Read-write, opened for writing from scratch. Behaves as [`Mode::Write`];
    /// kept as a distinct intent for callers that never read back.
    WriteOnly,
    /// Read-write; creates the file when missing, cursor at the end.
    Append,
}

impl Mode {
    fn read_only(self) -> bool {
        matches!(self, Mode::Read)
    }
}

/// Whether the backing file outlives the handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Persist {
    /// Keep the file; the header is flushed at close.
    Keep,
    /// Unlink the file at close (temp streams).
    Delete,
}

/// Health of a stream handle. Invalid is sticky: once an I/O failure or a
/// structural problem marks the stream invalid, every later operation fails
/// fast with [`StreamError::Invalid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Valid,
    Invalid,
}

/// Kinds of memory-usage figures a stream reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Object plus header plus small per-allocation constants. Substreams
    /// report no header cost; it is attributed to the level-0 stream.
    Overhead,
    /// The block buffer, whether or not it is allocated.
    Buffer,
    /// Overhead plus the buffer if currently allocated.
    Current,
    /// Overhead plus the buffer unconditionally.
    Maximum,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    /// No block resident.
    Invalid,
    /// Resident, matches disk.
    Clean,
    /// Resident, modified since mapping.
    Dirty,
}

/// The one resident block and the cursor's position inside it.
#[derive(Debug)]
struct ResidentBlock {
    /// Lazily allocated on first mapping, `block_size` bytes.
    buf: Option<Vec<u8>>,
    state: BlockState,
    /// Byte offset of the block in the file while resident.
    file_offset: u64,
    /// Item slot the cursor points at while resident.
    index: usize,
}

impl ResidentBlock {
    fn new() -> Self {
        ResidentBlock {
            buf: None,
            state: BlockState::Invalid,
            file_offset: 0,
            index: 0,
        }
    }

    fn resident(&self) -> bool {
        self.state != BlockState::Invalid
    }
}

/// A sequential, seekable container of fixed-size records backed by a file.
#[derive(Debug)]
pub struct BlockStream<T: Record> {
    path: PathBuf,
    io: BlockFile,
    header: Rc<StreamHeader>,
    read_only: bool,
    substream_level: u32,
    persist: Persist,
    status: Status,
    os_errno: Option<i32>,
    os_block: u64,
    items_per_block: u64,
    aligned: bool,
    /// Byte offset of the first item of this view.
    bos: u64,
    /// Byte offset just past the last valid item of this view.
    eos: u64,
    /// Byte cursor; `bos <= file_offset <= eos` except transiently past a
    /// write that extends `eos`.
    file_offset: u64,
    block: ResidentBlock,
    closed: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: Record> BlockStream<T> {
    /// Open or create a stream at `path`.
    ///
    /// `lbf` is the logical block factor for a newly created file (blocks of
    /// `lbf * os_block` bytes); `None` takes the context default. An existing
    /// file keeps whatever factor its header records; a factor different
    /// from the requested one is accepted with a warning.
    pub fn open(
        ctx: &Context,
        path: impl AsRef<Path>,
        mode: Mode,
        lbf: Option<u64>,
    ) -> Result<Self, StreamError> {
        let path = path.as_ref().to_path_buf();
        let os_block = ctx.os_block_size();
        let mut lbf = lbf.unwrap_or(ctx.block_factor());
        if lbf == 0 {
            warn!("block factor 0 requested; using 1 instead");
            lbf = 1;
        }
        if T::SIZE == 0 {
            return Err(StreamError::Invalid("zero-size records are unsupported".into()));
        }

        let (io, header, created) = match mode {
            Mode::Read => {
                let mut io = BlockFile::open(&path, true)?;
                let header = Self::read_header(&mut io, os_block, &path)?;
                (io, header, false)
            }
            Mode::Write | Mode::WriteOnly | Mode::Append => match BlockFile::create_new(&path) {
                Ok(mut io) => {
                    // Fresh file: reserve the header block now so the data
                    // region starts at a fixed offset.
                    io.write_all_at(0, &vec![0u8; os_block as usize])?;
                    (io, StreamHeader::new(lbf * os_block), true)
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let mut io = BlockFile::open(&path, false)?;
                    let header = Self::read_header(&mut io, os_block, &path)?;
                    (io, header, false)
                }
                Err(e) => return Err(StreamError::Os(e)),
            },
        };

        if !created {
            if header.stream_type != BLOCK_BUFFERED_TYPE {
                warn!(
                    "{}: stream type {} differs from the block-buffered backend ({}); contents may not be compatible",
                    path.display(),
                    header.stream_type,
                    BLOCK_BUFFERED_TYPE
                );
            }
            if header.block_size != lbf * os_block {
                warn!(
                    "{}: stream uses block factor {} instead of the requested {}",
                    path.display(),
                    header.block_size / os_block,
                    lbf
                );
            }
        }

        let block_size = header.block_size;
        if T::SIZE as u64 > block_size {
            return Err(StreamError::Invalid(format!(
                "record size {} exceeds block size {block_size}",
                T::SIZE
            )));
        }

        let items_per_block = block_size / T::SIZE as u64;
        let aligned = block_size % T::SIZE as u64 == 0;

        let mut stream = BlockStream {
            path,
            io,
            header: Rc::new(header),
            read_only: mode.read_only(),
            substream_level: 0,
            persist: Persist::Keep,
            status: Status::Valid,
            os_errno: None,
            os_block,
            items_per_block,
            aligned,
            bos: os_block,
            eos: os_block,
            file_offset: os_block,
            block: ResidentBlock::new(),
            closed: false,
            _item: PhantomData,
        };

        stream.eos = stream.clamped_eos(stream.header.item_eof);
        if mode == Mode::Append {
            stream.file_offset = stream.eos;
        }
        debug!(
            "opened {} ({:?}, {} items, block size {})",
            stream.path.display(),
            mode,
            stream.stream_len(),
            block_size
        );
        Ok(stream)
    }

    fn read_header(
        io: &mut BlockFile,
        os_block: u64,
        path: &Path,
    ) -> Result<StreamHeader, StreamError> {
        if io.len() < os_block {
            return Err(StreamError::Invalid(format!(
                "{}: no header block",
                path.display()
            )));
        }
        let mut buf = vec![0u8; os_block as usize];
        io.read_exact_at(0, &mut buf)?;
        StreamHeader::decode(&buf, os_block)
    }

    // ---- Geometry ----

    fn item_size(&self) -> u64 {
        T::SIZE as u64
    }

    fn block_size(&self) -> u64 {
        self.header.block_size
    }

    /// Byte offset of item `i` counted from the file start.
    fn item_to_byte(&self, item: u64) -> u64 {
        if self.aligned {
            self.os_block + item * self.item_size()
        } else {
            self.os_block
                + (item / self.items_per_block) * self.block_size()
                + (item % self.items_per_block) * self.item_size()
        }
    }

    /// Inverse of [`Self::item_to_byte`] for offsets pointing at item slots.
    fn byte_to_item(&self, byte: u64) -> u64 {
        let data = byte - self.os_block;
        if self.aligned {
            data / self.item_size()
        } else {
            (data / self.block_size()) * self.items_per_block
                + (data % self.block_size()) / self.item_size()
        }
    }

    /// End-of-stream byte offset for a view holding `items` items, clamped
    /// so that a last item sitting in the final slot of an unaligned block
    /// ends the stream right after its own bytes rather than at the next
    /// block boundary. Without the clamp, the cursor after reading that
    /// item would still compare below the end and a one-block over-read
    /// would follow.
    fn clamped_eos(&self, items: u64) -> u64 {
        let eos = self.item_to_byte(items);
        if items >= 1 {
            let last_end = self.item_to_byte(items - 1) + self.item_size();
            if eos > last_end {
                return last_end;
            }
        }
        eos
    }

    // ---- State queries ----

    pub fn status(&self) -> Status {
        self.status
    }

    /// Errno from the most recent failed OS call, if any.
    pub fn os_errno(&self) -> Option<i32> {
        self.os_errno
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_substream(&self) -> bool {
        self.substream_level > 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of items in this view.
    pub fn stream_len(&self) -> u64 {
        self.byte_to_item(self.eos) - self.byte_to_item(self.bos)
    }

    /// Item offset of the cursor within this view.
    pub fn tell(&self) -> u64 {
        self.byte_to_item(self.file_offset) - self.byte_to_item(self.bos)
    }

    /// Items per logical block.
    pub fn chunk_size(&self) -> u64 {
        self.items_per_block
    }

    pub fn set_persist(&mut self, persist: Persist) {
        self.persist = persist;
    }

    /// Memory attributed to this handle, by kind.
    pub fn memory_usage(&self, kind: MemoryUsage) -> u64 {
        let object = std::mem::size_of::<Self>() as u64;
        let overhead = if self.substream_level == 0 {
            object + HEADER_ENCODED_LEN as u64 + 2 * StreamConsts::ALLOC_OVERHEAD
        } else {
            object + StreamConsts::ALLOC_OVERHEAD
        };
        let buffer = self.block_size() + StreamConsts::ALLOC_OVERHEAD;
        match kind {
            MemoryUsage::Overhead => overhead,
            MemoryUsage::Buffer => buffer,
            MemoryUsage::Current => {
                overhead + if self.block.buf.is_some() { buffer } else { 0 }
            }
            MemoryUsage::Maximum => overhead + buffer,
        }
    }

    fn ensure_valid(&self) -> Result<(), StreamError> {
        match self.status {
            Status::Valid => Ok(()),
            Status::Invalid => Err(StreamError::Invalid(format!(
                "{}: stream previously failed",
                self.path.display()
            ))),
        }
    }

    /// Record an OS failure: log, remember errno, mark the stream invalid.
    fn fail_io(&mut self, what: &str, e: io::Error) -> StreamError {
        warn!("{}: {what} failed: {e}", self.path.display());
        self.os_errno = e.raw_os_error();
        self.status = Status::Invalid;
        StreamError::Os(e)
    }

    // ---- Block lifecycle ----

    /// Ensure the resident block holds a whole item slot at the cursor.
    /// In the unaligned case a block may end with space for only part of an
    /// item; the cursor then skips the padding into the next block.
    fn validate_current(&mut self) -> Result<(), StreamError> {
        if self.block.resident() {
            let used = self.block.index as u64 * self.item_size();
            let space = self.block_size() - used;
            if space >= self.item_size() {
                return Ok(());
            }
            self.unmap_current()?;
            self.file_offset += space;
        } else {
            // The cursor may sit at a clamped end of stream, in the
            // padding tail of an unaligned block. Its item lives at the
            // start of the next block; canonicalize before mapping.
            self.file_offset = self.item_to_byte(self.byte_to_item(self.file_offset));
        }
        self.map_current()
    }

    /// Bring the block containing the cursor into memory. The buffer is
    /// allocated on first need. A block past the physical end of a writable
    /// file is started fresh without a read.
    fn map_current(&mut self) -> Result<(), StreamError> {
        let b = self.block_size();
        let block_offset = ((self.file_offset - self.os_block) / b) * b + self.os_block;

        let needs_read = self.io.len() >= block_offset + b;
        if !needs_read && self.read_only {
            return Err(StreamError::EndOfStream);
        }

        let buf = self
            .block
            .buf
            .get_or_insert_with(|| vec![0u8; b as usize]);
        if needs_read {
            if let Err(e) = self.io.read_exact_at(block_offset, buf) {
                return Err(self.fail_io("block read", e));
            }
        } else {
            buf.fill(0);
        }

        self.block.state = BlockState::Clean;
        self.block.file_offset = block_offset;
        self.block.index = ((self.file_offset - block_offset) / self.item_size()) as usize;
        Ok(())
    }

    /// Drop the resident block, writing it back first when dirty.
    fn unmap_current(&mut self) -> Result<(), StreamError> {
        match self.block.state {
            BlockState::Invalid => Ok(()),
            BlockState::Clean => {
                self.block.state = BlockState::Invalid;
                Ok(())
            }
            BlockState::Dirty => {
                let offset = self.block.file_offset;
                let buf = self.block.buf.as_deref().expect("dirty block without buffer");
                match self.io.write_all_at(offset, buf) {
                    Ok(()) => {
                        self.block.state = BlockState::Invalid;
                        Ok(())
                    }
                    Err(e) => Err(self.fail_io("block write", e)),
                }
            }
        }
    }

    fn advance(&mut self) {
        self.block.index += 1;
        self.file_offset += self.item_size();
    }

    // ---- Item operations ----

    /// Read the item at the cursor and advance past it.
    pub fn read(&mut self) -> Result<T, StreamError> {
        self.ensure_valid()?;
        if self.file_offset >= self.eos {
            return Err(StreamError::EndOfStream);
        }
        self.validate_current()?;
        let idx = self.block.index;
        let buf = self.block.buf.as_deref().expect("resident block");
        let item = T::load(&buf[idx * T::SIZE..(idx + 1) * T::SIZE]);
        self.advance();
        Ok(item)
    }

    /// Write `item` at the cursor and advance past it. Writing past the end
    /// of a non-substream extends the stream; a substream write at its
    /// upper bound fails with [`StreamError::EndOfStream`].
    pub fn write(&mut self, item: &T) -> Result<(), StreamError> {
        self.ensure_valid()?;
        if self.read_only {
            return Err(StreamError::ReadOnly);
        }
        if self.substream_level > 0 && self.file_offset >= self.eos {
            return Err(StreamError::EndOfStream);
        }
        self.validate_current()?;
        let idx = self.block.index;
        let buf = self.block.buf.as_deref_mut().expect("resident block");
        item.store(&mut buf[idx * T::SIZE..(idx + 1) * T::SIZE]);
        self.block.state = BlockState::Dirty;
        self.advance();
        if self.substream_level == 0 && self.file_offset > self.eos {
            self.eos = self.file_offset;
        }
        Ok(())
    }

    /// Move the cursor to item `offset` of this view; `offset` may equal
    /// `stream_len()` (the end position). A seek inside the resident block
    /// does no I/O.
    pub fn seek(&mut self, offset: u64) -> Result<(), StreamError> {
        self.ensure_valid()?;
        let len = self.stream_len();
        if offset > len {
            warn!(
                "{}: seek to {offset} outside [0, {len}]",
                self.path.display()
            );
            return Err(StreamError::OffsetOutOfRange { offset, len });
        }
        let new_off = self.item_to_byte(self.byte_to_item(self.bos) + offset);
        let in_resident = self.block.resident()
            && new_off >= self.block.file_offset
            && new_off < self.block.file_offset + self.block_size();
        if in_resident {
            self.block.index =
                ((new_off - self.block.file_offset) / self.item_size()) as usize;
        } else {
            self.unmap_current()?;
        }
        self.file_offset = new_off;
        Ok(())
    }

    /// Cut the stream to `offset` items. The physical file shrinks to whole
    /// blocks; cursor and end of stream move to the cut. Growing via
    /// truncate is not supported, and substream views cannot truncate.
    pub fn truncate(&mut self, offset: u64) -> Result<(), StreamError> {
        self.ensure_valid()?;
        if self.substream_level > 0 {
            return Err(StreamError::StreamIsSubstream);
        }
        if self.read_only {
            return Err(StreamError::ReadOnly);
        }
        let len = self.stream_len();
        if offset > len {
            return Err(StreamError::OffsetOutOfRange { offset, len });
        }
        // Clamped like the end of stream computed at open: a cut at a
        // block boundary of an unaligned stream must end right after the
        // last item's bytes, or reads at the new end walk into the next
        // block.
        let new_off = self.clamped_eos(offset);
        let in_resident = self.block.resident()
            && new_off >= self.block.file_offset
            && new_off < self.block.file_offset + self.block_size();
        if !in_resident {
            self.unmap_current()?;
        }
        let blocks = offset.div_ceil(self.items_per_block);
        let physical = self.os_block + blocks * self.block_size();
        if let Err(e) = self.io.set_len(physical) {
            return Err(self.fail_io("truncate", e));
        }
        if in_resident {
            self.block.index =
                ((new_off - self.block.file_offset) / self.item_size()) as usize;
        }
        self.file_offset = new_off;
        self.eos = new_off;
        Ok(())
    }

    // ---- Substreams ----

    /// A bounded view over items `range` of this stream (half-open: the
    /// view holds `range.len()` items). The view has its own descriptor,
    /// cursor, and resident block, shares this stream's header snapshot,
    /// and cannot be truncated. Creating a view commits this stream's
    /// dirty block so the new descriptor reads current data.
    pub fn substream(
        &mut self,
        range: Range<u64>,
        mode: Mode,
    ) -> Result<BlockStream<T>, StreamError> {
        self.ensure_valid()?;
        let len = self.stream_len();
        if range.start > range.end || range.end > len {
            return Err(StreamError::OffsetOutOfRange {
                offset: range.end,
                len,
            });
        }
        let read_only = match mode {
            Mode::Read => true,
            Mode::Write => {
                if self.read_only {
                    return Err(StreamError::PermissionDenied(
                        "writable substream of a read-only stream",
                    ));
                }
                false
            }
            Mode::WriteOnly | Mode::Append => {
                return Err(StreamError::PermissionDenied(
                    "substreams open as read or write only",
                ));
            }
        };

        self.unmap_current()?;

        let io = BlockFile::open(&self.path, read_only)?;
        let bos_item = self.byte_to_item(self.bos);
        let bos = self.item_to_byte(bos_item + range.start);
        let mut eos = self.item_to_byte(bos_item + range.end);
        if range.end > range.start {
            let last_end =
                self.item_to_byte(bos_item + range.end - 1) + self.item_size();
            if eos > last_end {
                eos = last_end;
            }
        }
        debug_assert!(
            eos <= self.eos,
            "substream end {eos} beyond super-stream end {}",
            self.eos
        );

        Ok(BlockStream {
            path: self.path.clone(),
            io,
            header: Rc::clone(&self.header),
            read_only,
            substream_level: self.substream_level + 1,
            persist: Persist::Keep,
            status: Status::Valid,
            os_errno: None,
            os_block: self.os_block,
            items_per_block: self.items_per_block,
            aligned: self.aligned,
            bos,
            eos,
            file_offset: bos,
            block: ResidentBlock::new(),
            closed: false,
            _item: PhantomData,
        })
    }

    // ---- Close ----

    /// Flush and close explicitly, surfacing any write-back or header
    /// error. Dropping without `close` does the same work but only logs
    /// failures.
    pub fn close(mut self) -> Result<(), StreamError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.status == Status::Invalid {
            warn!("{}: closing a stream marked invalid", self.path.display());
            return Err(StreamError::Invalid(
                "stream was invalid at close".into(),
            ));
        }

        let mut result = Ok(());
        if !self.read_only {
            let items = self.byte_to_item(self.eos) - self.byte_to_item(self.os_block);
            if let Err(e) = self.unmap_current() {
                result = Err(e);
            }
            if self.substream_level == 0
                && self.persist == Persist::Keep
                && result.is_ok()
            {
                let mut h = (*self.header).clone();
                h.item_eof = items;
                if let Err(e) = self.io.write_all_at(0, &h.encode()) {
                    result = Err(self.fail_io("header write", e));
                }
            }
        }

        if self.substream_level == 0 && self.persist == Persist::Delete {
            if self.read_only {
                warn!(
                    "{}: delete-on-close requested for a read-only stream; keeping the file",
                    self.path.display()
                );
            } else if let Err(e) = fs::remove_file(&self.path) {
                warn!("{}: unlink failed: {e}", self.path.display());
            }
        }
        result
    }
}

impl<T: Record> Drop for BlockStream<T> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.finish() {
                warn!("{}: error while closing: {e}", self.path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_ctx(dir: &Path) -> Context {
        // 32-byte OS blocks so block-boundary cases stay small.
        Context::new()
            .with_os_block_size(32)
            .with_block_factor(1)
            .with_temp_dir(dir)
    }

    #[test]
    fn byte_item_mapping_round_trips_unaligned() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = tiny_ctx(dir.path());
        let path = dir.path().join("s");
        // 3-byte items in 32-byte blocks: 10 per block, 2 padding bytes.
        let s: BlockStream<[u8; 3]> =
            BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
        assert_eq!(s.chunk_size(), 10);
        for i in 0..25u64 {
            assert_eq!(s.byte_to_item(s.item_to_byte(i)), i);
        }
        // Item 10 starts in the second block, past the padding.
        assert_eq!(s.item_to_byte(10), 32 + 32);
    }

    #[test]
    fn eos_clamp_when_last_item_fills_its_block() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = tiny_ctx(dir.path());
        let path = dir.path().join("s");
        let s: BlockStream<[u8; 3]> =
            BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
        // Ten items fill block 0's slots; eos stops after the thirtieth
        // byte, not at the block boundary.
        assert_eq!(s.clamped_eos(10), 32 + 30);
        // One item: eos is its end, no clamping needed.
        assert_eq!(s.clamped_eos(1), 32 + 3);
    }
}
