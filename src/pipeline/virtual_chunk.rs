//! Virtual chunks: type-erased pipe segments for runtime-built graphs.
//!
//! A chunk fixes the item types at its boundary and hides everything in
//! between, so fragments can be chosen, stored, and composed at runtime.
//! The boundary buffers a small batch of items (64 by default) and
//! flushes them together to amortize the indirect calls across the
//! erased edge. Composing chunks with mismatched boundary types does not
//! compile.

use crate::pipeline::factory::PipeMiddle;
use crate::pipeline::node::{EdgeKind, Node, NodeCtx, NodeEntry, PushNode, PushTarget};
use crate::utils::config::PipelineConsts;

use anyhow::Result;

struct BatchBoundary<T: 'static> {
    dest: PushTarget<T>,
    buf: Vec<T>,
}

impl<T> BatchBoundary<T> {
    fn flush(&mut self) {
        for item in self.buf.drain(..) {
            self.dest.push(item);
        }
    }
}

impl<T> Node for BatchBoundary<T> {
    fn end(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        self.flush();
        Ok(())
    }
}

impl<T> PushNode<T> for BatchBoundary<T> {
    fn push(&mut self, item: T) {
        self.buf.push(item);
        if self.buf.len() == PipelineConsts::VIRTUAL_BATCH_SIZE {
            self.flush();
        }
    }
}

fn batch_boundary<T: 'static>() -> PipeMiddle<T, T> {
    PipeMiddle::raw(|b, dest| {
        let node = BatchBoundary {
            dest: dest.clone(),
            buf: Vec::with_capacity(PipelineConsts::VIRTUAL_BATCH_SIZE),
        };
        let (rc, id) = b.register(node, NodeEntry::named("virtual boundary"));
        b.add_edge(id, dest.id(), EdgeKind::Pushes);
        PushTarget::new(id, rc)
    })
}

/// A type-erased pipe fragment accepting `I` and producing `O`.
pub struct VirtualChunk<I: 'static, O: 'static> {
    pipe: PipeMiddle<I, O>,
}

impl<I: 'static, O: 'static> VirtualChunk<I, O> {
    /// Erase `pipe` behind an `I -> O` boundary.
    pub fn new(pipe: PipeMiddle<I, O>) -> Self {
        VirtualChunk {
            pipe: batch_boundary() | pipe,
        }
    }

    /// Chain another chunk after this one. The boundary types must line
    /// up, which the signature enforces.
    pub fn compose<P: 'static>(self, next: VirtualChunk<O, P>) -> VirtualChunk<I, P> {
        VirtualChunk {
            pipe: self.pipe | next.pipe,
        }
    }

    /// Recover a pipe segment usable in `|` composition.
    pub fn into_pipe(self) -> PipeMiddle<I, O> {
        self.pipe
    }
}

impl<I: 'static> VirtualChunk<I, I> {
    /// The identity chunk: items cross the boundary unchanged.
    pub fn empty() -> Self {
        VirtualChunk {
            pipe: batch_boundary(),
        }
    }
}
