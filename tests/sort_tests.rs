//! External sort integration tests, including budgets small enough to
//! force many runs and multiple merge passes.

use diskpipe::progress::Progress;
use diskpipe::sort::{sort, sort_by};
use diskpipe::{BlockStream, Context, Mode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn write_stream(ctx: &Context, path: &std::path::Path, data: &[u64]) -> BlockStream<u64> {
    let mut s: BlockStream<u64> = BlockStream::open(ctx, path, Mode::Write, None).unwrap();
    for item in data {
        s.write(item).unwrap();
    }
    s
}

fn read_all(s: &mut BlockStream<u64>) -> Vec<u64> {
    s.seek(0).unwrap();
    (0..s.stream_len()).map(|_| s.read().unwrap()).collect()
}

#[test]
fn sorts_random_input() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::new().with_temp_dir(dir.path());
    let mut rng = StdRng::seed_from_u64(7);
    let data: Vec<u64> = (0..20).map(|_| rng.gen()).collect();

    let mut input = write_stream(&ctx, &dir.path().join("in.dps"), &data);
    let mut output: BlockStream<u64> =
        BlockStream::open(&ctx, &dir.path().join("out.dps"), Mode::Write, None).unwrap();
    sort(&ctx, &mut input, &mut output, &Progress::null()).unwrap();

    let sorted = read_all(&mut output);
    let mut expected = data;
    expected.sort_unstable();
    assert_eq!(sorted, expected);
}

#[test]
fn tiny_budget_forces_multiple_merge_passes() {
    let dir = tempfile::tempdir().unwrap();
    // 64-byte blocks and a 256-byte budget: 32-item runs and a low
    // fan-in, so 2000 items need several passes.
    let ctx = Context::new()
        .with_temp_dir(dir.path())
        .with_os_block_size(64)
        .with_block_factor(1)
        .with_memory_limit(256);
    let mut rng = StdRng::seed_from_u64(11);
    let data: Vec<u64> = (0..2000).map(|_| rng.gen_range(0..500)).collect();

    let mut input = write_stream(&ctx, &dir.path().join("in.dps"), &data);
    let mut output: BlockStream<u64> =
        BlockStream::open(&ctx, &dir.path().join("out.dps"), Mode::Write, None).unwrap();
    sort(&ctx, &mut input, &mut output, &Progress::null()).unwrap();

    let sorted = read_all(&mut output);
    let mut expected = data;
    expected.sort_unstable();
    assert_eq!(sorted, expected);
}

#[test]
fn empty_input_sorts_to_empty_output() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::new().with_temp_dir(dir.path());

    let mut input = write_stream(&ctx, &dir.path().join("in.dps"), &[]);
    let mut output: BlockStream<u64> =
        BlockStream::open(&ctx, &dir.path().join("out.dps"), Mode::Write, None).unwrap();
    sort(&ctx, &mut input, &mut output, &Progress::null()).unwrap();
    assert_eq!(output.stream_len(), 0);
}

#[test]
fn custom_comparator_reverses_the_order() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::new().with_temp_dir(dir.path());
    let data: Vec<u64> = vec![5, 1, 9, 9, 3, 0, 7];

    let mut input = write_stream(&ctx, &dir.path().join("in.dps"), &data);
    let mut output: BlockStream<u64> =
        BlockStream::open(&ctx, &dir.path().join("out.dps"), Mode::Write, None).unwrap();
    sort_by(&ctx, &mut input, &mut output, |a, b| b.cmp(a), &Progress::null()).unwrap();

    let sorted = read_all(&mut output);
    assert_eq!(sorted, vec![9, 9, 7, 5, 3, 1, 0]);
}

#[test]
fn temp_runs_are_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    std::fs::create_dir(&scratch).unwrap();
    let ctx = Context::new()
        .with_temp_dir(&scratch)
        .with_os_block_size(64)
        .with_block_factor(1)
        .with_memory_limit(256);
    let mut rng = StdRng::seed_from_u64(13);
    let data: Vec<u64> = (0..500).map(|_| rng.gen()).collect();

    let mut input = write_stream(&ctx, &dir.path().join("in.dps"), &data);
    let mut output: BlockStream<u64> =
        BlockStream::open(&ctx, &dir.path().join("out.dps"), Mode::Write, None).unwrap();
    sort(&ctx, &mut input, &mut output, &Progress::null()).unwrap();

    // Every run stream was non-persistent; the scratch directory is empty
    // again.
    assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
}
