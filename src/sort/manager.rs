//! The external sort manager.
//!
//! Pass 1 streams the input once, cutting it into sorted runs sized to the
//! memory budget and writing each run to a non-persistent temp stream.
//! Merge passes then fold runs together with a fan-in chosen so the block
//! buffers plus the merge heap fit in the budget, until one merged
//! sequence remains. Comparator equality is stable within a single run;
//! across runs ties fall back to run order.

use std::cmp::Ordering;

use anyhow::{Context as AnyhowContext, Result};
use log::debug;

use crate::context::Context;
use crate::progress::Progress;
use crate::sort::merge::MergeHeap;
use crate::stream::{BlockStream, Mode, Persist, Record, StreamError};
use crate::utils::config::SortConsts;

/// Run length and fan-in derived from a memory budget.
#[derive(Clone, Copy, Debug)]
pub struct SortBudget {
    /// Items per run in pass 1.
    pub run_length: usize,
    /// Runs merged simultaneously in each merge pass.
    pub fan_in: usize,
}

impl SortBudget {
    /// Fit run formation and merging into `memory` bytes given the item
    /// size and the block size temp streams will use.
    pub fn plan(memory: u64, item_size: usize, block_size: u64) -> SortBudget {
        let item_size = item_size.max(1) as u64;
        let run_length = (memory / item_size).max(SortConsts::MIN_RUN_LENGTH as u64);
        // Each open run costs one block buffer plus a heap slot.
        let per_input = block_size + item_size;
        let fan_in = (memory / per_input.max(1))
            .clamp(SortConsts::MIN_FAN_IN as u64, SortConsts::MAX_FAN_IN as u64);
        SortBudget {
            run_length: run_length as usize,
            fan_in: fan_in as usize,
        }
    }
}

/// Pass-1 run formation: buffer items, sort, spill each full buffer as one
/// temp stream positioned back at its start.
pub struct RunWriter<T: Record, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    ctx: Context,
    cmp: C,
    run_length: usize,
    buf: Vec<T>,
    runs: Vec<BlockStream<T>>,
    items: u64,
}

impl<T: Record, C> RunWriter<T, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    pub fn new(ctx: &Context, run_length: usize, cmp: C) -> Self {
        let run_length = run_length.max(1);
        RunWriter {
            ctx: ctx.clone(),
            cmp,
            run_length,
            buf: Vec::with_capacity(run_length),
            runs: Vec::new(),
            items: 0,
        }
    }

    /// Total items accepted so far.
    pub fn items(&self) -> u64 {
        self.items
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        self.buf.push(item);
        self.items += 1;
        if self.buf.len() == self.run_length {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.buf.sort_by(|a, b| (self.cmp)(a, b));
        let path = self.ctx.temp_stream_path();
        let mut run: BlockStream<T> =
            BlockStream::open(&self.ctx, &path, Mode::Write, None)
                .with_context(|| format!("create sort run at {}", path.display()))?;
        run.set_persist(Persist::Delete);
        for item in self.buf.drain(..) {
            run.write(&item)?;
        }
        run.seek(0)?;
        debug!(
            "spilled run {} ({} items) to {}",
            self.runs.len(),
            run.stream_len(),
            path.display()
        );
        self.runs.push(run);
        Ok(())
    }

    /// Flush the partial last run and hand back all runs.
    pub fn finish(mut self) -> Result<Vec<BlockStream<T>>> {
        self.spill()?;
        Ok(self.runs)
    }
}

/// Merge `runs` into `sink`, fan-in runs at a time. Intermediate passes
/// write temp runs; the final pass feeds the sink directly.
pub fn merge_runs<T, C>(
    ctx: &Context,
    mut runs: Vec<BlockStream<T>>,
    fan_in: usize,
    cmp: &C,
    sink: &mut dyn FnMut(T) -> Result<()>,
) -> Result<()>
where
    T: Record,
    C: Fn(&T, &T) -> Ordering,
{
    let fan_in = fan_in.max(SortConsts::MIN_FAN_IN);
    let mut pass = 0;
    while runs.len() > fan_in {
        pass += 1;
        debug!("merge pass {pass}: {} runs, fan-in {fan_in}", runs.len());
        let mut next = Vec::new();
        while !runs.is_empty() {
            let take = fan_in.min(runs.len());
            let group: Vec<BlockStream<T>> = runs.drain(..take).collect();
            let path = ctx.temp_stream_path();
            let mut out: BlockStream<T> = BlockStream::open(ctx, &path, Mode::Write, None)
                .with_context(|| format!("create merge output at {}", path.display()))?;
            out.set_persist(Persist::Delete);
            merge_group(group, cmp, &mut |item| {
                out.write(&item)?;
                Ok(())
            })?;
            out.seek(0)?;
            next.push(out);
        }
        runs = next;
    }
    merge_group(runs, cmp, sink)
}

/// One k-way merge of `group` into `sink`.
fn merge_group<T, C>(
    mut group: Vec<BlockStream<T>>,
    cmp: &C,
    sink: &mut dyn FnMut(T) -> Result<()>,
) -> Result<()>
where
    T: Record,
    C: Fn(&T, &T) -> Ordering,
{
    let mut heap = MergeHeap::with_capacity(group.len(), cmp);
    for (source, run) in group.iter_mut().enumerate() {
        match run.read() {
            Ok(item) => heap.push(item, source),
            Err(StreamError::EndOfStream) => {}
            Err(e) => return Err(e.into()),
        }
    }
    while let Some((item, source)) = heap.pop() {
        sink(item)?;
        match group[source].read() {
            Ok(next) => heap.push(next, source),
            Err(StreamError::EndOfStream) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Sort `input` into `output` under the default ordering.
pub fn sort<T>(
    ctx: &Context,
    input: &mut BlockStream<T>,
    output: &mut BlockStream<T>,
    progress: &Progress,
) -> Result<()>
where
    T: Record + Ord,
{
    sort_by(ctx, input, output, T::cmp, progress)
}

/// Sort `input` into `output` under `cmp`.
pub fn sort_by<T, C>(
    ctx: &Context,
    input: &mut BlockStream<T>,
    output: &mut BlockStream<T>,
    cmp: C,
    progress: &Progress,
) -> Result<()>
where
    T: Record,
    C: Fn(&T, &T) -> Ordering,
{
    let n = input.stream_len();
    let block_size = ctx.block_factor() * ctx.os_block_size();
    let budget = SortBudget::plan(ctx.memory_limit(), T::SIZE, block_size);
    debug!(
        "sorting {n} items: run length {}, fan-in {}",
        budget.run_length, budget.fan_in
    );

    progress.begin_work("forming runs", n);
    let stepper = progress.stepper();
    input.seek(0)?;
    let mut writer = RunWriter::new(ctx, budget.run_length, &cmp);
    loop {
        match input.read() {
            Ok(item) => {
                writer.push(item)?;
                stepper.step();
            }
            Err(StreamError::EndOfStream) => break,
            Err(e) => return Err(e.into()),
        }
    }
    let runs = writer.finish()?;
    stepper.flush();
    progress.end_work();

    progress.begin_work("merging runs", n);
    let stepper = progress.stepper();
    merge_runs(ctx, runs, budget.fan_in, &cmp, &mut |item| {
        output.write(&item)?;
        stepper.step();
        Ok(())
    })?;
    stepper.flush();
    progress.end_work();
    Ok(())
}
