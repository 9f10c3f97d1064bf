//! Progress reporting for long-running stream and pipeline work.
//!
//! The runtime and the sort manager talk to a [`ProgressSink`]; the CLI
//! plugs in a kdam bar, the library default is the silent sink. Nodes step
//! through batched [`StepHandle`]s to keep per-item sink traffic down.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use kdam::{Bar, BarExt};

use crate::utils::config::ProgressConsts;

/// Receiver for work announcements and step updates.
///
/// `begin_work` opens a unit of work (one pipeline phase, one sort pass),
/// `advance` moves it forward, `end_work` closes it. Units never nest.
pub trait ProgressSink {
    fn begin_work(&mut self, desc: &str, total: u64);
    fn advance(&mut self, n: u64);
    fn end_work(&mut self);
}

/// Cloneable handle to a shared sink.
#[derive(Clone)]
pub struct Progress {
    inner: Rc<RefCell<dyn ProgressSink>>,
}

impl Progress {
    pub fn new(sink: impl ProgressSink + 'static) -> Self {
        Progress {
            inner: Rc::new(RefCell::new(sink)),
        }
    }

    /// The silent sink.
    pub fn null() -> Self {
        Progress::new(NullProgress)
    }

    /// A terminal progress bar.
    pub fn bar() -> Self {
        Progress::new(BarProgress::new())
    }

    pub fn begin_work(&self, desc: &str, total: u64) {
        self.inner.borrow_mut().begin_work(desc, total);
    }

    pub fn advance(&self, n: u64) {
        if n > 0 {
            self.inner.borrow_mut().advance(n);
        }
    }

    pub fn end_work(&self) {
        self.inner.borrow_mut().end_work();
    }

    /// A batched stepper over this sink. Steps accumulate locally and hit
    /// the sink every [`ProgressConsts::STEP_BATCH`] steps; the runtime
    /// flushes the remainder when the work unit ends.
    pub fn stepper(&self) -> StepHandle {
        StepHandle {
            progress: self.clone(),
            pending: Rc::new(Cell::new(0)),
        }
    }
}

/// Batched step counter handed to nodes. Cloning shares the pending count.
#[derive(Clone)]
pub struct StepHandle {
    progress: Progress,
    pending: Rc<Cell<u64>>,
}

impl StepHandle {
    pub fn step(&self) {
        self.step_n(1);
    }

    pub fn step_n(&self, n: u64) {
        let pending = self.pending.get() + n;
        if pending >= ProgressConsts::STEP_BATCH {
            self.progress.advance(pending);
            self.pending.set(0);
        } else {
            self.pending.set(pending);
        }
    }

    /// Push any buffered steps to the sink.
    pub fn flush(&self) {
        let pending = self.pending.take();
        self.progress.advance(pending);
    }
}

/// Sink that ignores everything.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn begin_work(&mut self, _desc: &str, _total: u64) {}
    fn advance(&mut self, _n: u64) {}
    fn end_work(&mut self) {}
}

/// kdam-backed terminal bar, one bar per unit of work.
pub struct BarProgress {
    bar: Option<Bar>,
}

impl BarProgress {
    pub fn new() -> Self {
        BarProgress { bar: None }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarProgress {
    fn begin_work(&mut self, desc: &str, total: u64) {
        let mut bar = kdam::tqdm!(total = total as usize, desc = desc.to_string());
        let _ = bar.refresh();
        self.bar = Some(bar);
    }

    fn advance(&mut self, n: u64) {
        if let Some(bar) = self.bar.as_mut() {
            let _ = bar.update(n as usize);
        }
    }

    fn end_work(&mut self) {
        if let Some(mut bar) = self.bar.take() {
            let _ = bar.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording {
        begun: Vec<(String, u64)>,
        advanced: u64,
        ended: usize,
    }

    impl ProgressSink for Rc<RefCell<Recording>> {
        fn begin_work(&mut self, desc: &str, total: u64) {
            self.borrow_mut().begun.push((desc.to_string(), total));
        }
        fn advance(&mut self, n: u64) {
            self.borrow_mut().advanced += n;
        }
        fn end_work(&mut self) {
            self.borrow_mut().ended += 1;
        }
    }

    #[test]
    fn stepper_batches_and_flushes() {
        let rec = Rc::new(RefCell::new(Recording {
            begun: Vec::new(),
            advanced: 0,
            ended: 0,
        }));
        let progress = Progress::new(Rc::clone(&rec));
        progress.begin_work("work", 250);
        let stepper = progress.stepper();
        for _ in 0..250 {
            stepper.step();
        }
        // Two full batches reported, 50 still pending.
        assert_eq!(rec.borrow().advanced, 200);
        stepper.flush();
        assert_eq!(rec.borrow().advanced, 250);
        progress.end_work();
        assert_eq!(rec.borrow().ended, 1);
        assert_eq!(rec.borrow().begun, vec![("work".to_string(), 250)]);
    }
}
