//! Parallel push operator.
//!
//! Partitions push work across worker threads. The dispatcher batches
//! incoming items and hands batches to workers round-robin over bounded
//! single-producer single-consumer queues; results return over a matching
//! queue per worker and are pushed downstream on the pipeline thread.
//! `MaintainOrder` replays results in dispatch order; `ArbitraryOrder`
//! forwards whatever is ready first. Inside each worker the usual
//! cooperative rule applies: one batch at a time, no shared state.

use std::collections::VecDeque;
use std::thread::JoinHandle;

use anyhow::{bail, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use log::debug;

use crate::pipeline::factory::PipeMiddle;
use crate::pipeline::node::{EdgeKind, Node, NodeCtx, NodeEntry, PushNode, PushTarget};
use crate::utils::config::ParallelConsts;

/// Whether downstream sees results in input order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ordering {
    /// Workers finish in any order; results forward as they arrive.
    ArbitraryOrder,
    /// A reassembly queue restores the input order.
    MaintainOrder,
}

struct Workers<I, O> {
    txs: Vec<Sender<Vec<I>>>,
    rxs: Vec<Receiver<Vec<O>>>,
    handles: Vec<JoinHandle<()>>,
    /// Worker indices with an outstanding batch, in dispatch order.
    pending: VecDeque<usize>,
    next_worker: usize,
}

struct Parallel<I: 'static, O: 'static, F> {
    dest: PushTarget<O>,
    f: F,
    worker_count: usize,
    mode: Ordering,
    batch: Vec<I>,
    workers: Option<Workers<I, O>>,
}

impl<I, O, F> Parallel<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Clone + Send + 'static,
{
    /// Forward one finished batch downstream. Blocks on the oldest
    /// outstanding worker; safe because every pending worker has a batch
    /// to answer for.
    fn drain_one(&mut self) {
        let Some(workers) = self.workers.as_mut() else {
            return;
        };
        let Some(worker) = workers.pending.pop_front() else {
            return;
        };
        if let Ok(out) = workers.rxs[worker].recv() {
            for item in out {
                self.dest.push(item);
            }
        }
    }

    /// Forward whatever is already finished, without blocking. Arbitrary
    /// order only.
    fn drain_ready(&mut self) {
        let Some(workers) = self.workers.as_mut() else {
            return;
        };
        let mut remaining = VecDeque::new();
        while let Some(worker) = workers.pending.pop_front() {
            match workers.rxs[worker].try_recv() {
                Ok(out) => {
                    for item in out {
                        self.dest.push(item);
                    }
                }
                Err(TryRecvError::Empty) => remaining.push_back(worker),
                Err(TryRecvError::Disconnected) => {}
            }
        }
        workers.pending = remaining;
    }

    fn dispatch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let mut batch = std::mem::take(&mut self.batch);
        loop {
            let workers = self.workers.as_mut().expect("push before begin");
            let worker = workers.next_worker;
            match workers.txs[worker].try_send(batch) {
                Ok(()) => {
                    workers.pending.push_back(worker);
                    workers.next_worker = (worker + 1) % workers.txs.len();
                    match self.mode {
                        Ordering::ArbitraryOrder => self.drain_ready(),
                        // Emitting here would block on stragglers; order is
                        // restored by draining FIFO when queues back up and
                        // at end().
                        Ordering::MaintainOrder => {}
                    }
                    return;
                }
                Err(TrySendError::Full(returned)) => {
                    batch = returned;
                    self.drain_one();
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("parallel worker {worker} is gone; dropping batch");
                    return;
                }
            }
        }
    }
}

impl<I, O, F> Node for Parallel<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Clone + Send + 'static,
{
    fn begin(&mut self, _ctx: &mut NodeCtx<'_>) {
        let mut txs = Vec::with_capacity(self.worker_count);
        let mut rxs = Vec::with_capacity(self.worker_count);
        let mut handles = Vec::with_capacity(self.worker_count);
        for worker in 0..self.worker_count {
            let (in_tx, in_rx) = bounded::<Vec<I>>(ParallelConsts::CHANNEL_CAP);
            let (out_tx, out_rx) = bounded::<Vec<O>>(ParallelConsts::CHANNEL_CAP);
            let f = self.f.clone();
            let handle = std::thread::Builder::new()
                .name(format!("diskpipe-par-{worker}"))
                .spawn(move || {
                    while let Ok(batch) = in_rx.recv() {
                        let out: Vec<O> = batch.into_iter().map(&f).collect();
                        if out_tx.send(out).is_err() {
                            break;
                        }
                    }
                })
                .expect("spawn parallel worker");
            txs.push(in_tx);
            rxs.push(out_rx);
            handles.push(handle);
        }
        debug!("parallel operator started {} worker(s)", self.worker_count);
        self.workers = Some(Workers {
            txs,
            rxs,
            handles,
            pending: VecDeque::new(),
            next_worker: 0,
        });
    }

    fn end(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        self.dispatch();
        // Closing the input queues lets the workers exit once drained.
        if let Some(workers) = self.workers.as_mut() {
            workers.txs.clear();
        }
        while self
            .workers
            .as_ref()
            .is_some_and(|w| !w.pending.is_empty())
        {
            self.drain_one();
        }
        if let Some(workers) = self.workers.take() {
            for handle in workers.handles {
                if handle.join().is_err() {
                    bail!("a parallel worker panicked");
                }
            }
        }
        Ok(())
    }
}

impl<I, O, F> PushNode<I> for Parallel<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Clone + Send + 'static,
{
    fn push(&mut self, item: I) {
        self.batch.push(item);
        if self.batch.len() == ParallelConsts::BATCH_SIZE {
            self.dispatch();
        }
    }
}

/// Apply `f` to every item on `workers` worker threads.
///
/// The computation itself leaves the pipeline thread; pushes downstream
/// still happen on it, so downstream nodes need no thread safety.
pub fn parallel<I, O, F>(workers: usize, mode: Ordering, f: F) -> PipeMiddle<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Clone + Send + 'static,
{
    let worker_count = if workers > 0 {
        workers
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    };
    PipeMiddle::raw(move |b, dest| {
        let node = Parallel {
            dest: dest.clone(),
            f,
            worker_count,
            mode,
            batch: Vec::with_capacity(ParallelConsts::BATCH_SIZE),
            workers: None,
        };
        let (rc, id) = b.register(node, NodeEntry::named("parallel"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
        PushTarget::new(id, rc)
    })
}
