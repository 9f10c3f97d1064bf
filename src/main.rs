//! diskpipe CLI: self-checks for the stream, sort, and pipelining cores.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use diskpipe::pipeline::{
    input_vector, multiply, output_vector, EdgeKind, Node, NodeCtx, NodeEntry, PipeBegin, PipeEnd,
    PushNode, PushTarget,
};
use diskpipe::progress::Progress;
use diskpipe::utils::config::PipelineConsts;
use diskpipe::utils::setup_logging;
use diskpipe::{BlockStream, Context, Mode};

/// External-memory stream and pipelining checks.
#[derive(Parser)]
#[command(name = "diskpipe")]
#[command(about = "Run the diskpipe self-checks; exit 0 when everything passes.")]
struct Cli {
    /// Number of items each check works with.
    #[arg(long, default_value_t = 1000)]
    test_size: u64,

    /// Memory budget in bytes for sorting and pipeline execution.
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    mm_size: u64,

    /// Seed for generated data.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Verbose output: debug logging and progress bars.
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, Subcommand)]
enum Command {
    /// Write/reopen/read, seek, and substream checks.
    Stream,
    /// External merge sort on random input.
    Sort,
    /// Push pipeline end-to-end checks.
    Pipeline,
    /// Planner memory-assignment check.
    Memory,
    /// Everything (the default).
    All,
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let checks: Vec<(&str, fn(&Cli) -> Result<()>)> = match cli.command.unwrap_or(Command::All) {
        Command::Stream => vec![("stream", check_stream as fn(&Cli) -> Result<()>)],
        Command::Sort => vec![("sort", check_sort)],
        Command::Pipeline => vec![("pipeline", check_pipeline)],
        Command::Memory => vec![("memory", check_memory)],
        Command::All => vec![
            ("stream", check_stream as fn(&Cli) -> Result<()>),
            ("sort", check_sort),
            ("pipeline", check_pipeline),
            ("memory", check_memory),
        ],
    };

    let mut failures = 0;
    for (name, check) in checks {
        match check(&cli) {
            Ok(()) => println!("{} {name}", "PASS".green()),
            Err(e) => {
                println!("{} {name}: {e:#}", "FAIL".red());
                failures += 1;
            }
        }
    }
    if failures > 0 {
        std::process::exit(1);
    }
}

fn scratch_context(cli: &Cli) -> Result<(tempfile::TempDir, Context)> {
    let dir = tempfile::tempdir().context("create scratch directory")?;
    let ctx = Context::new()
        .with_memory_limit(cli.mm_size)
        .with_temp_dir(dir.path());
    Ok((dir, ctx))
}

fn progress(cli: &Cli) -> Progress {
    if cli.verbose {
        Progress::bar()
    } else {
        Progress::null()
    }
}

/// Write 0..n, close, reopen, read back; then exercise seek/tell and a
/// substream window.
fn check_stream(cli: &Cli) -> Result<()> {
    let (dir, ctx) = scratch_context(cli)?;
    let path = dir.path().join("check.dps");
    let n = cli.test_size;

    let mut stream: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Write, None)?;
    for i in 0..n {
        stream.write(&i)?;
    }
    stream.close()?;

    let mut stream: BlockStream<u64> = BlockStream::open(&ctx, &path, Mode::Read, None)?;
    anyhow::ensure!(
        stream.stream_len() == n,
        "reopened stream holds {} items, wrote {n}",
        stream.stream_len()
    );
    for i in 0..n {
        let item = stream.read()?;
        anyhow::ensure!(item == i, "item {i} read back as {item}");
    }

    for probe in [0, n / 2, n] {
        stream.seek(probe)?;
        anyhow::ensure!(stream.tell() == probe, "seek/tell mismatch at {probe}");
    }

    if n >= 4 {
        let mut sub = stream.substream(1..4, Mode::Read)?;
        anyhow::ensure!(sub.stream_len() == 3, "substream length");
        for expect in 1..4 {
            let item = sub.read()?;
            anyhow::ensure!(item == expect, "substream item {expect} read as {item}");
        }
    }
    Ok(())
}

/// Sort random 64-bit integers; verify order and multiset equality.
fn check_sort(cli: &Cli) -> Result<()> {
    let (dir, ctx) = scratch_context(cli)?;
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let data: Vec<u64> = (0..cli.test_size).map(|_| rng.gen()).collect();

    let in_path = dir.path().join("unsorted.dps");
    let out_path = dir.path().join("sorted.dps");
    let mut input: BlockStream<u64> = BlockStream::open(&ctx, &in_path, Mode::Write, None)?;
    for item in &data {
        input.write(item)?;
    }
    let mut output: BlockStream<u64> = BlockStream::open(&ctx, &out_path, Mode::Write, None)?;
    diskpipe::sort::sort(&ctx, &mut input, &mut output, &progress(cli))?;

    output.seek(0)?;
    let mut sorted = Vec::with_capacity(data.len());
    for _ in 0..output.stream_len() {
        sorted.push(output.read()?);
    }
    anyhow::ensure!(sorted.len() == data.len(), "sort changed the item count");
    anyhow::ensure!(
        sorted.windows(2).all(|w| w[0] <= w[1]),
        "sort output is not non-decreasing"
    );
    let mut expected = data;
    expected.sort_unstable();
    anyhow::ensure!(sorted == expected, "sort output is not the input multiset");
    Ok(())
}

/// `input_vector(0..20) | multiply(3) | multiply(2) | output_vector`.
fn check_pipeline(cli: &Cli) -> Result<()> {
    let out = Rc::new(RefCell::new(Vec::new()));
    let mut p = input_vector((0i64..20).collect())
        | multiply(3)
        | multiply(2)
        | output_vector(Rc::clone(&out));
    p.run(cli.mm_size, &progress(cli))?;

    let got = out.borrow();
    let expected: Vec<i64> = (0..20).map(|i| i * 6).collect();
    anyhow::ensure!(*got == expected, "pipeline produced {got:?}");
    Ok(())
}

#[derive(Clone, Copy, Default)]
struct MemProbeSettings {
    min: u64,
    max: u64,
    fraction: f64,
}

#[derive(Default)]
struct MemProbeResults {
    assigned: [Option<u64>; 2],
}

struct MemProbe {
    slot: usize,
    settings: MemProbeSettings,
    results: Rc<RefCell<MemProbeResults>>,
}

impl Node for MemProbe {
    fn prepare(&mut self, ctx: &mut NodeCtx<'_>) {
        ctx.set_minimum_memory(self.settings.min);
        if self.settings.max > 0 {
            ctx.set_maximum_memory(self.settings.max);
        }
        ctx.set_memory_fraction(self.settings.fraction);
    }

    fn set_available_memory(&mut self, bytes: u64) {
        self.results.borrow_mut().assigned[self.slot] = Some(bytes);
    }

    fn go(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        Ok(())
    }
}

impl PushNode<u64> for MemProbe {
    fn push(&mut self, _item: u64) {}
}

/// Two probe nodes with min 500/700 under a 2000-byte budget and equal
/// fractions: both minima met, nothing over budget.
fn check_memory(_cli: &Cli) -> Result<()> {
    let budget: u64 = 2000;
    let results = Rc::new(RefCell::new(MemProbeResults::default()));

    let first = MemProbe {
        slot: 0,
        settings: MemProbeSettings {
            min: 500,
            max: 0,
            fraction: 1.0,
        },
        results: Rc::clone(&results),
    };
    let second = MemProbe {
        slot: 1,
        settings: MemProbeSettings {
            min: 700,
            max: 0,
            fraction: 1.0,
        },
        results: Rc::clone(&results),
    };

    let begin = PipeBegin::raw(move |b, dest: PushTarget<u64>| {
        let (_, id) = b.register(first, NodeEntry::initiator("memory probe 1"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
    });
    let end = PipeEnd::raw(move |b| {
        let (rc, id) = b.register(second, NodeEntry::named("memory probe 2"));
        PushTarget::new(id, rc)
    });

    // Hand the runtime enough extra to cover its bookkeeping so the
    // solver sees exactly `budget`.
    let overhead = PipelineConsts::PHASE_OVERHEAD + 2 * PipelineConsts::NODE_OVERHEAD;
    let mut p = begin | end;
    p.run(budget + overhead, &Progress::null())?;

    let results = results.borrow();
    let a = results.assigned[0].context("first node got no assignment")?;
    let b = results.assigned[1].context("second node got no assignment")?;
    anyhow::ensure!(a + b <= budget, "assigned {a}+{b} over budget {budget}");
    anyhow::ensure!(a >= 500 && b >= 700, "minima not honored: {a}, {b}");
    Ok(())
}
