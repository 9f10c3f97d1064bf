//! Block-buffered stream integration tests: persistence, cursor
//! discipline, substreams, and the unaligned-geometry corner cases.

use diskpipe::{BlockStream, Context, MemoryUsage, Mode, Persist, StreamError};

fn ctx_in(dir: &tempfile::TempDir) -> Context {
    Context::new().with_temp_dir(dir.path())
}

/// Small-geometry context: 32-byte OS blocks, one OS block per logical
/// block. Three-byte records then give ten items per block with two
/// bytes of padding.
fn tiny_ctx(dir: &tempfile::TempDir) -> Context {
    ctx_in(dir).with_os_block_size(32).with_block_factor(1)
}

#[test]
fn write_close_reopen_read() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..5u64 {
        s.write(&i).unwrap();
    }
    assert_eq!(s.stream_len(), 5);
    s.close().unwrap();

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Read, None).unwrap();
    assert_eq!(s.stream_len(), 5);
    for i in 0..5u64 {
        assert_eq!(s.read().unwrap(), i);
    }
    assert!(matches!(s.read(), Err(StreamError::EndOfStream)));
}

#[test]
fn seek_tell_identity() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u32> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..100u32 {
        s.write(&i).unwrap();
    }
    for i in 0..=100u64 {
        s.seek(i).unwrap();
        assert_eq!(s.tell(), i);
    }
    assert!(matches!(
        s.seek(101),
        Err(StreamError::OffsetOutOfRange { .. })
    ));
}

#[test]
fn seek_back_and_overwrite_mid_stream() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..10u64 {
        s.write(&i).unwrap();
    }
    s.seek(4).unwrap();
    s.write(&99).unwrap();
    s.seek(0).unwrap();
    let items: Vec<u64> = (0..10).map(|_| s.read().unwrap()).collect();
    assert_eq!(items, vec![0, 1, 2, 3, 99, 5, 6, 7, 8, 9]);
    // Overwriting did not extend the stream.
    assert_eq!(s.stream_len(), 10);
}

#[test]
fn append_mode_continues_at_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..3u64 {
        s.write(&i).unwrap();
    }
    s.close().unwrap();

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Append, None).unwrap();
    assert_eq!(s.tell(), 3);
    s.write(&3).unwrap();
    s.close().unwrap();

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Read, None).unwrap();
    let items: Vec<u64> = (0..4).map(|_| s.read().unwrap()).collect();
    assert_eq!(items, vec![0, 1, 2, 3]);
}

#[test]
fn read_only_stream_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    s.write(&1).unwrap();
    s.close().unwrap();

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Read, None).unwrap();
    assert!(matches!(s.write(&2), Err(StreamError::ReadOnly)));
}

#[test]
fn substream_window_reads_the_slice() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for v in [10, 11, 12, 13, 14u64] {
        s.write(&v).unwrap();
    }
    // Items 1..4 of [10..14] are [11, 12, 13].
    let mut sub = s.substream(1..4, Mode::Read).unwrap();
    assert_eq!(sub.stream_len(), 3);
    for expect in [11, 12, 13u64] {
        assert_eq!(sub.read().unwrap(), expect);
    }
    assert!(matches!(sub.read(), Err(StreamError::EndOfStream)));
}

#[test]
fn substream_of_substream() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..10u64 {
        s.write(&i).unwrap();
    }
    let mut outer = s.substream(2..8, Mode::Read).unwrap();
    let mut inner = outer.substream(1..3, Mode::Read).unwrap();
    assert_eq!(inner.stream_len(), 2);
    assert_eq!(inner.read().unwrap(), 3);
    assert_eq!(inner.read().unwrap(), 4);
}

#[test]
fn substream_write_stops_at_its_bound() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..6u64 {
        s.write(&i).unwrap();
    }
    let mut sub = s.substream(2..4, Mode::Write).unwrap();
    sub.write(&77).unwrap();
    sub.write(&88).unwrap();
    assert!(matches!(sub.write(&99), Err(StreamError::EndOfStream)));
    drop(sub); // flushes the substream's dirty block

    s.seek(0).unwrap();
    let items: Vec<u64> = (0..6).map(|_| s.read().unwrap()).collect();
    assert_eq!(items, vec![0, 1, 77, 88, 4, 5]);
}

#[test]
fn writable_substream_of_read_only_stream_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    s.write(&1).unwrap();
    s.close().unwrap();

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Read, None).unwrap();
    assert!(matches!(
        s.substream(0..1, Mode::Write),
        Err(StreamError::PermissionDenied(_))
    ));
}

#[test]
fn substream_cannot_truncate() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..4u64 {
        s.write(&i).unwrap();
    }
    let mut sub = s.substream(0..4, Mode::Write).unwrap();
    assert!(matches!(
        sub.truncate(1),
        Err(StreamError::StreamIsSubstream)
    ));
}

#[test]
fn truncate_mid_block_and_at_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = tiny_ctx(&dir);
    let path = dir.path().join("s.dps");

    // Ten items per block: 25 items span blocks [0,1,2].
    let mut s: BlockStream<[u8; 3]> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..25u8 {
        s.write(&[i, i, i]).unwrap();
    }

    // Mid-block: 15 items leaves a half-full second block.
    s.truncate(15).unwrap();
    assert_eq!(s.stream_len(), 15);
    assert_eq!(s.tell(), 15);

    // Exactly a block boundary: the end clamps to the last item's bytes,
    // so a read at the cut sees end of stream rather than the next block.
    s.truncate(10).unwrap();
    assert_eq!(s.stream_len(), 10);
    assert!(matches!(s.read(), Err(StreamError::EndOfStream)));

    // Truncate cannot extend.
    assert!(matches!(
        s.truncate(12),
        Err(StreamError::OffsetOutOfRange { .. })
    ));

    s.seek(0).unwrap();
    for i in 0..10u8 {
        assert_eq!(s.read().unwrap(), [i, i, i]);
    }
    assert!(matches!(s.read(), Err(StreamError::EndOfStream)));
}

#[test]
fn truncate_shrinks_the_physical_file_to_whole_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = tiny_ctx(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<[u8; 3]> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..25u8 {
        s.write(&[i, 0, 0]).unwrap();
    }
    s.truncate(13).unwrap();
    s.close().unwrap();

    // Header block plus two logical blocks holding items 0..13.
    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, 32 + 2 * 32);

    let mut s: BlockStream<[u8; 3]> = BlockStream::open(&ctx, &path, Mode::Read, None).unwrap();
    assert_eq!(s.stream_len(), 13);
    assert_eq!(s.read().unwrap(), [0, 0, 0]);
}

#[test]
fn unaligned_records_pad_and_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = tiny_ctx(&dir);
    let path = dir.path().join("s.dps");

    // Three-byte records in 32-byte blocks: ten per block.
    let mut s: BlockStream<[u8; 3]> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    assert_eq!(s.chunk_size(), 10);
    for i in 0..16u8 {
        s.write(&[i, i + 100, i + 200]).unwrap();
    }
    s.close().unwrap();

    let mut s: BlockStream<[u8; 3]> = BlockStream::open(&ctx, &path, Mode::Read, None).unwrap();
    assert_eq!(s.stream_len(), 16);
    for i in 0..16u8 {
        assert_eq!(s.read().unwrap(), [i, i + 100, i + 200]);
    }
    assert!(matches!(s.read(), Err(StreamError::EndOfStream)));

    // Sixteen items occupy two blocks; the file is whole blocks plus the
    // header block.
    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, 32 + 2 * 32);
}

#[test]
fn append_after_clamped_end_of_stream() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = tiny_ctx(&dir);
    let path = dir.path().join("s.dps");

    // Ten 3-byte items fill every slot of block 0; the end of stream is
    // clamped to the end of the tenth item, inside the padding tail.
    let mut s: BlockStream<[u8; 3]> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    for i in 0..10u8 {
        s.write(&[i, i, i]).unwrap();
    }
    s.close().unwrap();

    // Appending continues at the start of the next block, not in the
    // padding.
    let mut s: BlockStream<[u8; 3]> = BlockStream::open(&ctx, &path, Mode::Append, None).unwrap();
    assert_eq!(s.tell(), 10);
    s.write(&[10, 10, 10]).unwrap();
    s.close().unwrap();

    let mut s: BlockStream<[u8; 3]> = BlockStream::open(&ctx, &path, Mode::Read, None).unwrap();
    assert_eq!(s.stream_len(), 11);
    for i in 0..11u8 {
        assert_eq!(s.read().unwrap(), [i, i, i]);
    }
}

#[test]
fn record_as_large_as_the_block() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = tiny_ctx(&dir);
    let path = dir.path().join("s.dps");

    // One item per block.
    let mut s: BlockStream<[u8; 32]> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    assert_eq!(s.chunk_size(), 1);
    for i in 0..3u8 {
        s.write(&[i; 32]).unwrap();
    }
    s.close().unwrap();

    let mut s: BlockStream<[u8; 32]> = BlockStream::open(&ctx, &path, Mode::Read, None).unwrap();
    for i in 0..3u8 {
        assert_eq!(s.read().unwrap(), [i; 32]);
    }
}

#[test]
fn record_larger_than_block_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = tiny_ctx(&dir);
    let path = dir.path().join("s.dps");

    let result: Result<BlockStream<[u8; 33]>, _> =
        BlockStream::open(&ctx, &path, Mode::Write, None);
    assert!(matches!(result, Err(StreamError::Invalid(_))));
}

#[test]
fn foreign_block_factor_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, Some(2)).unwrap();
    for i in 0..100u64 {
        s.write(&i).unwrap();
    }
    s.close().unwrap();

    // Reopening with a different requested factor warns but works; the
    // header's factor wins.
    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Read, Some(4)).unwrap();
    assert_eq!(s.stream_len(), 100);
    for i in 0..100u64 {
        assert_eq!(s.read().unwrap(), i);
    }
}

#[test]
fn non_persistent_stream_unlinks_its_file() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("temp.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    s.set_persist(Persist::Delete);
    s.write(&1).unwrap();
    drop(s);
    assert!(!path.exists());
}

#[test]
fn memory_usage_shapes() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    let mut s: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None).unwrap();
    let overhead = s.memory_usage(MemoryUsage::Overhead);
    let maximum = s.memory_usage(MemoryUsage::Maximum);
    // No block resident yet.
    assert_eq!(s.memory_usage(MemoryUsage::Current), overhead);
    assert_eq!(maximum, overhead + s.memory_usage(MemoryUsage::Buffer));

    s.write(&1).unwrap();
    assert_eq!(s.memory_usage(MemoryUsage::Current), maximum);

    // Substreams do not account for the shared header.
    let sub = s.substream(0..1, Mode::Read).unwrap();
    assert!(sub.memory_usage(MemoryUsage::Overhead) < overhead);
}

#[test]
fn file_without_a_header_block_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(&dir);
    let path = dir.path().join("s.dps");

    // A file that is too short to hold a header.
    std::fs::write(&path, b"short").unwrap();
    let result: Result<BlockStream<u64>, _> = BlockStream::open(&ctx, &path, Mode::Read, None);
    assert!(matches!(result, Err(StreamError::Invalid(_))));
}
