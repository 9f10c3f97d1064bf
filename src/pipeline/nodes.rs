//! Stock pipeline nodes: vector and stream endpoints, numeric transforms,
//! closure adapters, materializing buffers, the reverser, and pipelined
//! sort.
//!
//! Every constructor here returns a pipe value; graphs are composed with
//! the `|` operator and sealed into a [`crate::pipeline::Pipeline`].

use std::cell::RefCell;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::ops::{Add, Mul};
use std::rc::Rc;

use anyhow::{Context as AnyhowContext, Result};
use log::warn;

use crate::context::Context;
use crate::pipeline::factory::{
    GraphBuilder, PipeBegin, PipeEnd, PipeMiddle, PullPipeBegin, PullPipeEnd, PullPipeMiddle,
};
use crate::pipeline::node::{
    EdgeKind, Node, NodeCtx, NodeEntry, NodeId, PullNode, PullSource, PushNode, PushTarget,
};
use crate::progress::StepHandle;
use crate::sort::manager::{merge_runs, RunWriter};
use crate::stream::{BlockStream, MemoryUsage, Mode, Persist, Record};
use crate::stream::StreamError;
use crate::utils::config::SortConsts;

// ---- Vector endpoints ----

struct InputVector<T: 'static> {
    data: Vec<T>,
    dest: PushTarget<T>,
    stepper: Option<StepHandle>,
}

impl<T> Node for InputVector<T> {
    fn propagate(&mut self, ctx: &mut NodeCtx<'_>) {
        ctx.forward("items", self.data.len() as u64);
        ctx.set_steps(self.data.len() as u64);
    }

    fn begin(&mut self, ctx: &mut NodeCtx<'_>) {
        self.stepper = Some(ctx.stepper());
    }

    fn go(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        let stepper = self.stepper.clone().expect("go before begin");
        for item in std::mem::take(&mut self.data) {
            self.dest.push(item);
            stepper.step();
        }
        stepper.flush();
        Ok(())
    }
}

/// Push every element of `data` downstream.
pub fn input_vector<T: 'static>(data: Vec<T>) -> PipeBegin<T> {
    PipeBegin::raw(move |b, dest| {
        let node = InputVector {
            data,
            dest: dest.clone(),
            stepper: None,
        };
        let (_, id) = b.register(node, NodeEntry::initiator("input vector"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
    })
}

struct OutputVector<T: 'static> {
    out: Rc<RefCell<Vec<T>>>,
}

impl<T> Node for OutputVector<T> {}

impl<T> PushNode<T> for OutputVector<T> {
    fn push(&mut self, item: T) {
        self.out.borrow_mut().push(item);
    }
}

/// Collect pushed items into the shared vector.
pub fn output_vector<T: 'static>(out: Rc<RefCell<Vec<T>>>) -> PipeEnd<T> {
    PipeEnd::raw(move |b| {
        let (rc, id) = b.register(OutputVector { out }, NodeEntry::named("output vector"));
        PushTarget::new(id, rc)
    })
}

struct PullVector<T: 'static> {
    /// Stored reversed so pull is a pop.
    data: Vec<T>,
}

impl<T> Node for PullVector<T> {
    fn propagate(&mut self, ctx: &mut NodeCtx<'_>) {
        ctx.forward("items", self.data.len() as u64);
    }
}

impl<T> PullNode<T> for PullVector<T> {
    fn can_pull(&mut self) -> bool {
        !self.data.is_empty()
    }

    fn pull(&mut self) -> T {
        self.data.pop().expect("pull past end of vector")
    }
}

/// Yield the elements of `data` on demand.
pub fn pull_input_vector<T: 'static>(mut data: Vec<T>) -> PullPipeBegin<T> {
    data.reverse();
    PullPipeBegin::raw(move |b| {
        let (rc, id) = b.register(PullVector { data }, NodeEntry::named("pull input vector"));
        PullSource::new(id, rc)
    })
}

struct PullToVector<T: 'static> {
    source: PullSource<T>,
    out: Rc<RefCell<Vec<T>>>,
    stepper: Option<StepHandle>,
}

impl<T> Node for PullToVector<T> {
    fn propagate(&mut self, ctx: &mut NodeCtx<'_>) {
        if let Some(n) = ctx.try_fetch::<u64>("items") {
            ctx.set_steps(n);
        }
    }

    fn begin(&mut self, ctx: &mut NodeCtx<'_>) {
        self.stepper = Some(ctx.stepper());
    }

    fn go(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        let stepper = self.stepper.clone().expect("go before begin");
        while self.source.can_pull() {
            self.out.borrow_mut().push(self.source.pull());
            stepper.step();
        }
        stepper.flush();
        Ok(())
    }
}

/// Pull everything upstream offers into the shared vector. The pull
/// terminal drives its phase.
pub fn pull_output_vector<T: 'static>(out: Rc<RefCell<Vec<T>>>) -> PullPipeEnd<T> {
    PullPipeEnd::raw(move |b, source| {
        let node = PullToVector {
            source: source.clone(),
            out,
            stepper: None,
        };
        let (_, id) = b.register(node, NodeEntry::initiator("pull output vector"));
        b.add_edge(id, source.id(), EdgeKind::Pulls);
    })
}

// ---- Stream endpoints ----

struct StreamInput<T: Record> {
    stream: BlockStream<T>,
    dest: PushTarget<T>,
    stepper: Option<StepHandle>,
}

impl<T: Record> Node for StreamInput<T> {
    fn prepare(&mut self, ctx: &mut NodeCtx<'_>) {
        ctx.set_minimum_memory(self.stream.memory_usage(MemoryUsage::Maximum));
    }

    fn propagate(&mut self, ctx: &mut NodeCtx<'_>) {
        ctx.forward("items", self.stream.stream_len());
        ctx.set_steps(self.stream.stream_len());
    }

    fn begin(&mut self, ctx: &mut NodeCtx<'_>) {
        self.stepper = Some(ctx.stepper());
    }

    fn go(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        let stepper = self.stepper.clone().expect("go before begin");
        self.stream.seek(0).context("rewind pipeline input stream")?;
        loop {
            match self.stream.read() {
                Ok(item) => {
                    self.dest.push(item);
                    stepper.step();
                }
                Err(StreamError::EndOfStream) => break,
                Err(e) => return Err(e).context("read pipeline input stream"),
            }
        }
        stepper.flush();
        Ok(())
    }
}

/// Push every item of `stream` downstream.
pub fn input<T: Record>(stream: BlockStream<T>) -> PipeBegin<T> {
    PipeBegin::raw(move |b, dest| {
        let node = StreamInput {
            stream,
            dest: dest.clone(),
            stepper: None,
        };
        let (_, id) = b.register(node, NodeEntry::initiator("stream input"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
    })
}

struct StreamOutput<T: Record> {
    stream: Option<BlockStream<T>>,
    error: Option<StreamError>,
}

impl<T: Record> Node for StreamOutput<T> {
    fn prepare(&mut self, ctx: &mut NodeCtx<'_>) {
        if let Some(stream) = &self.stream {
            ctx.set_minimum_memory(stream.memory_usage(MemoryUsage::Maximum));
        }
    }

    fn end(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e).context("write pipeline output stream");
        }
        if let Some(stream) = self.stream.take() {
            stream.close().context("close pipeline output stream")?;
        }
        Ok(())
    }
}

impl<T: Record> PushNode<T> for StreamOutput<T> {
    fn push(&mut self, item: T) {
        if self.error.is_some() {
            return;
        }
        if let Some(stream) = &mut self.stream {
            if let Err(e) = stream.write(&item) {
                warn!("pipeline output stream write failed: {e}");
                self.error = Some(e);
            }
        }
    }
}

/// Write every pushed item to `stream`; the stream is closed (header
/// flushed) when the phase ends.
pub fn output<T: Record>(stream: BlockStream<T>) -> PipeEnd<T> {
    PipeEnd::raw(move |b| {
        let node = StreamOutput {
            stream: Some(stream),
            error: None,
        };
        let (rc, id) = b.register(node, NodeEntry::named("stream output"));
        PushTarget::new(id, rc)
    })
}

struct PullStreamInput<T: Record> {
    stream: BlockStream<T>,
    remaining: u64,
}

impl<T: Record> Node for PullStreamInput<T> {
    fn prepare(&mut self, ctx: &mut NodeCtx<'_>) {
        ctx.set_minimum_memory(self.stream.memory_usage(MemoryUsage::Maximum));
    }

    fn propagate(&mut self, ctx: &mut NodeCtx<'_>) {
        ctx.forward("items", self.stream.stream_len());
    }

    fn begin(&mut self, _ctx: &mut NodeCtx<'_>) {
        if let Err(e) = self.stream.seek(0) {
            warn!("rewind of pull input stream failed: {e}");
        }
        self.remaining = self.stream.stream_len();
    }
}

impl<T: Record> PullNode<T> for PullStreamInput<T> {
    fn can_pull(&mut self) -> bool {
        self.remaining > 0
    }

    fn pull(&mut self) -> T {
        self.remaining -= 1;
        self.stream
            .read()
            .expect("pull within verified stream bounds")
    }
}

/// Yield the items of `stream` on demand.
pub fn pull_input<T: Record>(stream: BlockStream<T>) -> PullPipeBegin<T> {
    PullPipeBegin::raw(move |b| {
        let node = PullStreamInput {
            stream,
            remaining: 0,
        };
        let (rc, id) = b.register(node, NodeEntry::named("pull stream input"));
        PullSource::new(id, rc)
    })
}

struct PullStreamOutput<T: Record> {
    source: PullSource<T>,
    stream: Option<BlockStream<T>>,
    stepper: Option<StepHandle>,
}

impl<T: Record> Node for PullStreamOutput<T> {
    fn prepare(&mut self, ctx: &mut NodeCtx<'_>) {
        if let Some(stream) = &self.stream {
            ctx.set_minimum_memory(stream.memory_usage(MemoryUsage::Maximum));
        }
    }

    fn propagate(&mut self, ctx: &mut NodeCtx<'_>) {
        if let Some(n) = ctx.try_fetch::<u64>("items") {
            ctx.set_steps(n);
        }
    }

    fn begin(&mut self, ctx: &mut NodeCtx<'_>) {
        self.stepper = Some(ctx.stepper());
    }

    fn go(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        let stepper = self.stepper.clone().expect("go before begin");
        let stream = self.stream.as_mut().expect("go after end");
        while self.source.can_pull() {
            stream
                .write(&self.source.pull())
                .context("write pull output stream")?;
            stepper.step();
        }
        stepper.flush();
        Ok(())
    }

    fn end(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.close().context("close pull output stream")?;
        }
        Ok(())
    }
}

/// Pull everything upstream offers into `stream`. The pull terminal
/// drives its phase.
pub fn pull_output<T: Record>(stream: BlockStream<T>) -> PullPipeEnd<T> {
    PullPipeEnd::raw(move |b, source| {
        let node = PullStreamOutput {
            source: source.clone(),
            stream: Some(stream),
            stepper: None,
        };
        let (_, id) = b.register(node, NodeEntry::initiator("pull stream output"));
        b.add_edge(id, source.id(), EdgeKind::Pulls);
    })
}

// ---- Plumbing and transforms ----

struct Identity<T: 'static> {
    dest: PushTarget<T>,
}

impl<T> Node for Identity<T> {}

impl<T> PushNode<T> for Identity<T> {
    fn push(&mut self, item: T) {
        self.dest.push(item);
    }
}

/// Pass items through unchanged.
pub fn identity<T: 'static>() -> PipeMiddle<T, T> {
    PipeMiddle::raw(|b, dest| {
        let (rc, id) = b.register(
            Identity { dest: dest.clone() },
            NodeEntry::named("identity"),
        );
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
        PushTarget::new(id, rc)
    })
}

struct PullIdentity<T: 'static> {
    source: PullSource<T>,
}

impl<T> Node for PullIdentity<T> {}

impl<T> PullNode<T> for PullIdentity<T> {
    fn can_pull(&mut self) -> bool {
        self.source.can_pull()
    }

    fn pull(&mut self) -> T {
        self.source.pull()
    }
}

/// Pull-side pass-through.
pub fn pull_identity<T: 'static>() -> PullPipeMiddle<T, T> {
    PullPipeMiddle::raw(|b, source| {
        let node = PullIdentity {
            source: source.clone(),
        };
        let (rc, id) = b.register(node, NodeEntry::named("pull identity"));
        b.add_edge(id, source.id(), EdgeKind::Pulls);
        PullSource::new(id, rc)
    })
}

struct MapNode<I: 'static, O: 'static, F> {
    dest: PushTarget<O>,
    f: F,
    _in: PhantomData<fn(I)>,
}

impl<I, O, F: FnMut(I) -> O> Node for MapNode<I, O, F> {}

impl<I, O, F: FnMut(I) -> O> PushNode<I> for MapNode<I, O, F> {
    fn push(&mut self, item: I) {
        self.dest.push((self.f)(item));
    }
}

/// Apply `f` to every item.
pub fn map<I: 'static, O: 'static, F>(f: F) -> PipeMiddle<I, O>
where
    F: FnMut(I) -> O + 'static,
{
    PipeMiddle::raw(move |b, dest| {
        let node = MapNode {
            dest: dest.clone(),
            f,
            _in: PhantomData,
        };
        let (rc, id) = b.register(node, NodeEntry::named("map"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
        PushTarget::new(id, rc)
    })
}

struct FilterNode<T: 'static, F> {
    dest: PushTarget<T>,
    keep: F,
}

impl<T, F: FnMut(&T) -> bool> Node for FilterNode<T, F> {}

impl<T, F: FnMut(&T) -> bool> PushNode<T> for FilterNode<T, F> {
    fn push(&mut self, item: T) {
        if (self.keep)(&item) {
            self.dest.push(item);
        }
    }
}

/// Drop items for which `keep` returns false.
pub fn filter<T: 'static, F>(keep: F) -> PipeMiddle<T, T>
where
    F: FnMut(&T) -> bool + 'static,
{
    PipeMiddle::raw(move |b, dest| {
        let node = FilterNode {
            dest: dest.clone(),
            keep,
        };
        let (rc, id) = b.register(node, NodeEntry::named("filter"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
        PushTarget::new(id, rc)
    })
}

struct Linear<T: 'static> {
    dest: PushTarget<T>,
    factor: T,
    term: T,
}

impl<T: Copy + Mul<Output = T> + Add<Output = T>> Node for Linear<T> {}

impl<T: Copy + Mul<Output = T> + Add<Output = T>> PushNode<T> for Linear<T> {
    fn push(&mut self, item: T) {
        self.dest.push(item * self.factor + self.term);
    }
}

/// Push `item * factor + term`.
pub fn linear<T>(factor: T, term: T) -> PipeMiddle<T, T>
where
    T: Copy + Mul<Output = T> + Add<Output = T> + 'static,
{
    PipeMiddle::raw(move |b, dest| {
        let node = Linear {
            dest: dest.clone(),
            factor,
            term,
        };
        let (rc, id) = b.register(node, NodeEntry::named("linear transform"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
        PushTarget::new(id, rc)
    })
}

struct Multiply<T: 'static> {
    dest: PushTarget<T>,
    factor: T,
}

impl<T: Copy + Mul<Output = T>> Node for Multiply<T> {}

impl<T: Copy + Mul<Output = T>> PushNode<T> for Multiply<T> {
    fn push(&mut self, item: T) {
        self.dest.push(item * self.factor);
    }
}

/// Push `item * factor`.
pub fn multiply<T>(factor: T) -> PipeMiddle<T, T>
where
    T: Copy + Mul<Output = T> + 'static,
{
    PipeMiddle::raw(move |b, dest| {
        let node = Multiply {
            dest: dest.clone(),
            factor,
        };
        let (rc, id) = b.register(node, NodeEntry::named("multiply"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
        PushTarget::new(id, rc)
    })
}

struct Bitbucket<T: 'static> {
    _item: PhantomData<fn(T)>,
}

impl<T> Node for Bitbucket<T> {}

impl<T> PushNode<T> for Bitbucket<T> {
    fn push(&mut self, _item: T) {}
}

/// Discard everything pushed here.
pub fn bitbucket<T: 'static>() -> PipeEnd<T> {
    PipeEnd::raw(|b| {
        let (rc, id) = b.register(
            Bitbucket::<T> { _item: PhantomData },
            NodeEntry::named("bitbucket"),
        );
        PushTarget::new(id, rc)
    })
}

struct Tee<T: Record> {
    dest: PushTarget<T>,
    stream: Option<BlockStream<T>>,
    error: Option<StreamError>,
}

impl<T: Record> Node for Tee<T> {
    fn prepare(&mut self, ctx: &mut NodeCtx<'_>) {
        if let Some(stream) = &self.stream {
            ctx.set_minimum_memory(stream.memory_usage(MemoryUsage::Maximum));
        }
    }

    fn end(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e).context("write tee stream");
        }
        if let Some(stream) = self.stream.take() {
            stream.close().context("close tee stream")?;
        }
        Ok(())
    }
}

impl<T: Record> PushNode<T> for Tee<T> {
    fn push(&mut self, item: T) {
        if self.error.is_none() {
            if let Some(stream) = &mut self.stream {
                if let Err(e) = stream.write(&item) {
                    warn!("tee stream write failed: {e}");
                    self.error = Some(e);
                }
            }
        }
        self.dest.push(item);
    }
}

/// Write a copy of every item to `stream` while passing it downstream.
pub fn tee<T: Record>(stream: BlockStream<T>) -> PipeMiddle<T, T> {
    PipeMiddle::raw(move |b, dest| {
        let node = Tee {
            dest: dest.clone(),
            stream: Some(stream),
            error: None,
        };
        let (rc, id) = b.register(node, NodeEntry::named("tee"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
        PushTarget::new(id, rc)
    })
}

// ---- Materializing buffers ----

struct BufState<T: Record> {
    stream: Option<BlockStream<T>>,
}

struct BufIn<T: Record> {
    ctx: Context,
    state: Rc<RefCell<BufState<T>>>,
    stream: Option<BlockStream<T>>,
    error: Option<anyhow::Error>,
}

impl<T: Record> Node for BufIn<T> {
    fn prepare(&mut self, ctx: &mut NodeCtx<'_>) {
        let block = self.ctx.block_factor() * self.ctx.os_block_size();
        ctx.set_minimum_memory(block);
    }

    fn begin(&mut self, _ctx: &mut NodeCtx<'_>) {
        let path = self.ctx.temp_stream_path();
        match BlockStream::open(&self.ctx, &path, Mode::Write, None) {
            Ok(mut stream) => {
                stream.set_persist(Persist::Delete);
                self.stream = Some(stream);
            }
            Err(e) => {
                warn!("buffer temp stream creation failed: {e}");
                self.error = Some(e.into());
            }
        }
    }

    fn end(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e).context("buffer input failed");
        }
        if let Some(mut stream) = self.stream.take() {
            stream.seek(0).context("rewind buffer stream")?;
            self.state.borrow_mut().stream = Some(stream);
        }
        Ok(())
    }
}

impl<T: Record> PushNode<T> for BufIn<T> {
    fn push(&mut self, item: T) {
        if self.error.is_some() {
            return;
        }
        if let Some(stream) = &mut self.stream {
            if let Err(e) = stream.write(&item) {
                warn!("buffer write failed: {e}");
                self.error = Some(e.into());
            }
        }
    }
}

struct BufOut<T: Record> {
    state: Rc<RefCell<BufState<T>>>,
    dest: PushTarget<T>,
    reverse: bool,
    stepper: Option<StepHandle>,
}

impl<T: Record> Node for BufOut<T> {
    fn propagate(&mut self, ctx: &mut NodeCtx<'_>) {
        let items = self
            .state
            .borrow()
            .stream
            .as_ref()
            .map(|s| s.stream_len())
            .unwrap_or(0);
        ctx.forward("items", items);
        ctx.set_steps(items);
    }

    fn begin(&mut self, ctx: &mut NodeCtx<'_>) {
        self.stepper = Some(ctx.stepper());
    }

    fn go(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        let stepper = self.stepper.clone().expect("go before begin");
        let Some(mut stream) = self.state.borrow_mut().stream.take() else {
            return Ok(());
        };
        let n = stream.stream_len();
        if self.reverse {
            for i in (0..n).rev() {
                stream.seek(i).context("seek in reverser buffer")?;
                let item = stream.read().context("read reverser buffer")?;
                self.dest.push(item);
                stepper.step();
            }
        } else {
            stream.seek(0).context("rewind buffer stream")?;
            for _ in 0..n {
                let item = stream.read().context("read buffer stream")?;
                self.dest.push(item);
                stepper.step();
            }
        }
        stepper.flush();
        Ok(())
    }
}

fn materialize<T: Record>(ctx: &Context, reverse: bool, label: &'static str) -> PipeMiddle<T, T> {
    let ctx = ctx.clone();
    PipeMiddle::raw(move |b, dest| {
        let state = Rc::new(RefCell::new(BufState { stream: None }));
        let out = BufOut {
            state: Rc::clone(&state),
            dest: dest.clone(),
            reverse,
            stepper: None,
        };
        let (_, out_id) = b.register(out, NodeEntry::initiator(label));
        b.add_edge(out_id, dest.id(), EdgeKind::Pushes);

        let input = BufIn {
            ctx,
            state,
            stream: None,
            error: None,
        };
        let (in_rc, in_id) = b.register(input, NodeEntry::named(label));
        b.add_edge(out_id, in_id, EdgeKind::Depends);
        PushTarget::new(in_id, in_rc)
    })
}

/// Materialize the flow into a temp stream, splitting the graph into two
/// phases; the next phase replays the items in order.
pub fn buffer<T: Record>(ctx: &Context) -> PipeMiddle<T, T> {
    materialize(ctx, false, "buffer")
}

/// Materialize the flow and replay it backwards.
pub fn reverser<T: Record>(ctx: &Context) -> PipeMiddle<T, T> {
    materialize(ctx, true, "reverser")
}

// ---- Pipelined sort ----

struct SortState<T: Record> {
    runs: Option<Vec<BlockStream<T>>>,
    items: u64,
}

struct SortIn<T: Record, C>
where
    C: Fn(&T, &T) -> Ordering + Clone + 'static,
{
    ctx: Context,
    cmp: C,
    state: Rc<RefCell<SortState<T>>>,
    writer: Option<RunWriter<T, C>>,
    error: Option<anyhow::Error>,
}

impl<T: Record, C> Node for SortIn<T, C>
where
    C: Fn(&T, &T) -> Ordering + Clone + 'static,
{
    fn prepare(&mut self, ctx: &mut NodeCtx<'_>) {
        let block = self.ctx.block_factor() * self.ctx.os_block_size();
        ctx.set_minimum_memory(block + (SortConsts::MIN_RUN_LENGTH * T::SIZE) as u64);
        if !ctx.memory_fraction_set() {
            ctx.set_memory_fraction(1.0);
        }
    }

    fn begin(&mut self, ctx: &mut NodeCtx<'_>) {
        let run_length =
            (ctx.available_memory() / T::SIZE as u64).max(SortConsts::MIN_RUN_LENGTH as u64);
        self.writer = Some(RunWriter::new(
            &self.ctx,
            run_length as usize,
            self.cmp.clone(),
        ));
    }

    fn end(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e).context("sort run formation failed");
        }
        if let Some(writer) = self.writer.take() {
            let items = writer.items();
            let runs = writer.finish().context("flush final sort run")?;
            let mut state = self.state.borrow_mut();
            state.items = items;
            state.runs = Some(runs);
        }
        Ok(())
    }
}

impl<T: Record, C> PushNode<T> for SortIn<T, C>
where
    C: Fn(&T, &T) -> Ordering + Clone + 'static,
{
    fn push(&mut self, item: T) {
        if let Some(writer) = &mut self.writer {
            if let Err(e) = writer.push(item) {
                warn!("sort run spill failed: {e:#}");
                self.error = Some(e);
                self.writer = None;
            }
        }
    }
}

struct SortOut<T: Record, C>
where
    C: Fn(&T, &T) -> Ordering + Clone + 'static,
{
    ctx: Context,
    cmp: C,
    state: Rc<RefCell<SortState<T>>>,
    dest: PushTarget<T>,
    stepper: Option<StepHandle>,
}

impl<T: Record, C> Node for SortOut<T, C>
where
    C: Fn(&T, &T) -> Ordering + Clone + 'static,
{
    fn prepare(&mut self, ctx: &mut NodeCtx<'_>) {
        let block = self.ctx.block_factor() * self.ctx.os_block_size();
        let per_input = block + T::SIZE as u64;
        ctx.set_minimum_memory(SortConsts::MIN_FAN_IN as u64 * per_input);
        if !ctx.memory_fraction_set() {
            ctx.set_memory_fraction(1.0);
        }
    }

    fn propagate(&mut self, ctx: &mut NodeCtx<'_>) {
        let items = self.state.borrow().items;
        ctx.forward("items", items);
        ctx.set_steps(items);
    }

    fn begin(&mut self, ctx: &mut NodeCtx<'_>) {
        self.stepper = Some(ctx.stepper());
    }

    fn go(&mut self, ctx: &mut NodeCtx<'_>) -> Result<()> {
        let stepper = self.stepper.clone().expect("go before begin");
        let runs = self.state.borrow_mut().runs.take().unwrap_or_default();
        let block = self.ctx.block_factor() * self.ctx.os_block_size();
        let per_input = block + T::SIZE as u64;
        let fan_in = (ctx.available_memory() / per_input.max(1))
            .clamp(SortConsts::MIN_FAN_IN as u64, SortConsts::MAX_FAN_IN as u64)
            as usize;
        let dest = self.dest.clone();
        merge_runs(&self.ctx, runs, fan_in, &self.cmp, &mut |item| {
            dest.push(item);
            stepper.step();
            Ok(())
        })?;
        stepper.flush();
        Ok(())
    }
}

/// Sort the flow under `cmp`: run formation on the push side, a merge
/// initiator on the far side of the phase boundary.
pub fn sort_by<T: Record, C>(ctx: &Context, cmp: C) -> PipeMiddle<T, T>
where
    C: Fn(&T, &T) -> Ordering + Clone + 'static,
{
    let ctx = ctx.clone();
    PipeMiddle::raw(move |b, dest| {
        let state = Rc::new(RefCell::new(SortState {
            runs: None,
            items: 0,
        }));
        let out = SortOut {
            ctx: ctx.clone(),
            cmp: cmp.clone(),
            state: Rc::clone(&state),
            dest: dest.clone(),
            stepper: None,
        };
        let (_, out_id) = b.register(out, NodeEntry::initiator("sort merge"));
        b.add_edge(out_id, dest.id(), EdgeKind::Pushes);

        let input = SortIn {
            ctx: ctx.clone(),
            cmp: cmp.clone(),
            state,
            writer: None,
            error: None,
        };
        let (in_rc, in_id) = b.register(input, NodeEntry::named("sort input"));
        b.add_edge(out_id, in_id, EdgeKind::Depends);
        PushTarget::new(in_id, in_rc)
    })
}

/// Sort the flow under the default ordering.
pub fn sort<T: Record + Ord>(ctx: &Context) -> PipeMiddle<T, T> {
    sort_by(ctx, T::cmp)
}

// ---- Passive buffer ----

/// Shared hand-off between independently composed pipelines: one pipeline
/// pushes into [`PassiveBuffer::input`], another pulls the materialized
/// items from [`PassiveBuffer::output`]. The two node maps merge when the
/// second side is constructed; run exactly one of the sealed pipelines
/// and the phases execute in dependency order.
pub struct PassiveBuffer<T: Record> {
    ctx: Context,
    shared: Rc<RefCell<PassiveShared<T>>>,
}

struct PassiveShared<T: Record> {
    state: Rc<RefCell<BufState<T>>>,
    input: Option<(crate::pipeline::graph::NodeMap, NodeId)>,
    output: Option<(crate::pipeline::graph::NodeMap, NodeId)>,
}

struct PassiveOut<T: Record> {
    state: Rc<RefCell<BufState<T>>>,
    stream: Option<BlockStream<T>>,
    remaining: u64,
}

impl<T: Record> Node for PassiveOut<T> {
    fn propagate(&mut self, ctx: &mut NodeCtx<'_>) {
        let items = self
            .state
            .borrow()
            .stream
            .as_ref()
            .map(|s| s.stream_len())
            .unwrap_or(0);
        ctx.forward("items", items);
    }

    fn begin(&mut self, _ctx: &mut NodeCtx<'_>) {
        if let Some(stream) = self.state.borrow_mut().stream.take() {
            self.remaining = stream.stream_len();
            self.stream = Some(stream);
        }
    }

    fn end(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        self.stream = None;
        Ok(())
    }
}

impl<T: Record> PullNode<T> for PassiveOut<T> {
    fn can_pull(&mut self) -> bool {
        self.remaining > 0
    }

    fn pull(&mut self) -> T {
        self.remaining -= 1;
        self.stream
            .as_mut()
            .expect("pull before begin")
            .read()
            .expect("pull within verified buffer bounds")
    }
}

impl<T: Record> PassiveBuffer<T> {
    pub fn new(ctx: &Context) -> Self {
        PassiveBuffer {
            ctx: ctx.clone(),
            shared: Rc::new(RefCell::new(PassiveShared {
                state: Rc::new(RefCell::new(BufState { stream: None })),
                input: None,
                output: None,
            })),
        }
    }

    /// The push terminator that fills the buffer.
    pub fn input(&self) -> PipeEnd<T> {
        let ctx = self.ctx.clone();
        let shared = Rc::clone(&self.shared);
        PipeEnd::raw(move |b| {
            let state = Rc::clone(&shared.borrow().state);
            let node = BufIn {
                ctx,
                state,
                stream: None,
                error: None,
            };
            let (rc, id) = b.register(node, NodeEntry::named("passive buffer input"));
            shared.borrow_mut().input = Some((b.map().clone(), id));
            link_passive(b, &shared);
            PushTarget::new(id, rc)
        })
    }

    /// The pull producer that replays the buffer in a later phase.
    pub fn output(&self) -> PullPipeBegin<T> {
        let shared = Rc::clone(&self.shared);
        PullPipeBegin::raw(move |b| {
            let state = Rc::clone(&shared.borrow().state);
            let node = PassiveOut {
                state,
                stream: None,
                remaining: 0,
            };
            let (rc, id) = b.register(node, NodeEntry::named("passive buffer output"));
            shared.borrow_mut().output = Some((b.map().clone(), id));
            link_passive(b, &shared);
            PullSource::new(id, rc)
        })
    }
}

/// Once both sides exist, merge their maps and order the phases.
fn link_passive<T: Record>(b: &mut GraphBuilder, shared: &Rc<RefCell<PassiveShared<T>>>) {
    let sh = shared.borrow();
    if let (Some((in_map, in_id)), Some((out_map, out_id))) = (&sh.input, &sh.output) {
        b.merge_map(in_map);
        b.merge_map(out_map);
        b.add_edge(*out_id, *in_id, EdgeKind::Depends);
    }
}
