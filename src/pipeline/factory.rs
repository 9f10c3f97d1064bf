//! Factories and pipe composition.
//!
//! A factory is a deferred constructor: invoked with the already-built
//! downstream target, it registers its node(s) and hands back its own
//! head. Pipe values wrap factories with adornments (name, breadcrumb,
//! memory fraction) that apply to every node the factory constructs, and
//! compose with the `|` operator. Sealing an initiator against a
//! terminator constructs the graph and yields an executable
//! [`Pipeline`].

use std::cell::RefCell;
use std::ops::BitOr;
use std::rc::Rc;

use crate::pipeline::graph::NodeMap;
use crate::pipeline::node::{
    EdgeKind, Node, NodeEntry, NodeId, PullSource, PushTarget, PRIORITY_USER,
};
use crate::pipeline::runtime::Pipeline;

/// Per-segment decorations recorded on a pipe value and applied to the
/// nodes its factory constructs.
#[derive(Clone, Default)]
pub struct Adornments {
    name: Option<String>,
    breadcrumb: Option<String>,
    fraction: Option<f64>,
    hooks: Vec<Rc<dyn Fn(&mut NodeEntry)>>,
}

impl Adornments {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.breadcrumb.is_none()
            && self.fraction.is_none()
            && self.hooks.is_empty()
    }

    fn apply(&self, entry: &mut NodeEntry) {
        for hook in &self.hooks {
            hook(entry);
        }
        if let Some(name) = &self.name {
            if entry.name_priority < PRIORITY_USER {
                entry.name = name.clone();
                entry.name_priority = PRIORITY_USER;
            }
        }
        if let Some(crumb) = &self.breadcrumb {
            entry.breadcrumb = Some(match &entry.breadcrumb {
                Some(old) => format!("{crumb} | {old}"),
                None => crumb.clone(),
            });
        }
        if let Some(fraction) = self.fraction {
            if !entry.fraction_set {
                entry.fraction = fraction;
                entry.fraction_set = true;
            }
        }
    }
}

/// Construction-time handle: the node map being built plus the adornment
/// scopes of the factories currently constructing.
pub struct GraphBuilder {
    map: NodeMap,
    scopes: Vec<Vec<NodeId>>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder {
            map: NodeMap::new(),
            scopes: Vec::new(),
        }
    }

    pub fn map(&self) -> &NodeMap {
        &self.map
    }

    /// Register a node, returning the shared cell (for data-plane handles)
    /// and its id.
    pub fn register<N: Node + 'static>(
        &mut self,
        node: N,
        entry: NodeEntry,
    ) -> (Rc<RefCell<N>>, NodeId) {
        let cell = Rc::new(RefCell::new(node));
        let control: Rc<RefCell<dyn Node>> = cell.clone();
        let id = self.map.register(control, entry);
        for scope in &mut self.scopes {
            scope.push(id);
        }
        (cell, id)
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) {
        self.map.add_edge(from, to, kind);
    }

    /// Absorb another pipeline's node map into this one (shared nodes).
    pub fn merge_map(&mut self, other: &NodeMap) {
        self.map.union(other);
    }

    /// Run `f`, then apply `adorn` to every node it registered.
    pub(crate) fn scoped<R>(
        &mut self,
        adorn: &Adornments,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.scopes.push(Vec::new());
        let result = f(self);
        let created = self.scopes.pop().expect("scope stack underflow");
        if !adorn.is_empty() {
            self.map.with_inner(|inner| {
                for id in created {
                    adorn.apply(inner.entry_mut(id));
                }
            });
        }
        result
    }
}

macro_rules! adornment_methods {
    () => {
        /// Name the node(s) this segment constructs.
        pub fn name(mut self, name: &str) -> Self {
            self.adorn.name = Some(name.to_string());
            self
        }

        /// Prefix a breadcrumb onto the node(s) this segment constructs.
        pub fn breadcrumb(mut self, crumb: &str) -> Self {
            self.adorn.breadcrumb = Some(crumb.to_string());
            self
        }

        /// Memory fraction for the node(s) this segment constructs.
        pub fn memory_fraction(mut self, fraction: f64) -> Self {
            self.adorn.fraction = Some(fraction);
            self
        }

        /// Run `hook` on the map entry of every node this segment
        /// constructs, before the user-facing adornments apply.
        pub fn hook_initialization(
            mut self,
            hook: impl Fn(&mut crate::pipeline::node::NodeEntry) + 'static,
        ) -> Self {
            self.adorn.hooks.push(std::rc::Rc::new(hook));
            self
        }
    };
}

// ---- Push pipes ----

/// A push segment consuming `I` and feeding a downstream consumer of `O`.
pub struct PipeMiddle<I: 'static, O: 'static> {
    ctor: Box<dyn FnOnce(&mut GraphBuilder, PushTarget<O>) -> PushTarget<I>>,
    adorn: Adornments,
}

impl<I: 'static, O: 'static> PipeMiddle<I, O> {
    pub fn raw(
        ctor: impl FnOnce(&mut GraphBuilder, PushTarget<O>) -> PushTarget<I> + 'static,
    ) -> Self {
        PipeMiddle {
            ctor: Box::new(ctor),
            adorn: Adornments::default(),
        }
    }

    adornment_methods!();

    pub(crate) fn construct(
        self,
        builder: &mut GraphBuilder,
        dest: PushTarget<O>,
    ) -> PushTarget<I> {
        let PipeMiddle { ctor, adorn } = self;
        builder.scoped(&adorn, move |b| ctor(b, dest))
    }
}

/// A push terminator consuming `I`.
pub struct PipeEnd<I: 'static> {
    ctor: Box<dyn FnOnce(&mut GraphBuilder) -> PushTarget<I>>,
    adorn: Adornments,
}

impl<I: 'static> PipeEnd<I> {
    pub fn raw(ctor: impl FnOnce(&mut GraphBuilder) -> PushTarget<I> + 'static) -> Self {
        PipeEnd {
            ctor: Box::new(ctor),
            adorn: Adornments::default(),
        }
    }

    adornment_methods!();

    pub(crate) fn construct(self, builder: &mut GraphBuilder) -> PushTarget<I> {
        let PipeEnd { ctor, adorn } = self;
        builder.scoped(&adorn, move |b| ctor(b))
    }
}

/// A push producer: the segment containing the phase's initiator.
pub struct PipeBegin<O: 'static> {
    ctor: Box<dyn FnOnce(&mut GraphBuilder, PushTarget<O>)>,
    adorn: Adornments,
}

impl<O: 'static> PipeBegin<O> {
    pub fn raw(ctor: impl FnOnce(&mut GraphBuilder, PushTarget<O>) + 'static) -> Self {
        PipeBegin {
            ctor: Box::new(ctor),
            adorn: Adornments::default(),
        }
    }

    adornment_methods!();

    pub(crate) fn construct(self, builder: &mut GraphBuilder, dest: PushTarget<O>) {
        let PipeBegin { ctor, adorn } = self;
        builder.scoped(&adorn, move |b| ctor(b, dest))
    }
}

impl<I: 'static, M: 'static, O: 'static> BitOr<PipeMiddle<M, O>> for PipeMiddle<I, M> {
    type Output = PipeMiddle<I, O>;

    fn bitor(self, rhs: PipeMiddle<M, O>) -> PipeMiddle<I, O> {
        PipeMiddle::raw(move |b, dest| {
            let mid = rhs.construct(b, dest);
            self.construct(b, mid)
        })
    }
}

impl<I: 'static, M: 'static> BitOr<PipeEnd<M>> for PipeMiddle<I, M> {
    type Output = PipeEnd<I>;

    fn bitor(self, rhs: PipeEnd<M>) -> PipeEnd<I> {
        PipeEnd::raw(move |b| {
            let mid = rhs.construct(b);
            self.construct(b, mid)
        })
    }
}

impl<M: 'static, O: 'static> BitOr<PipeMiddle<M, O>> for PipeBegin<M> {
    type Output = PipeBegin<O>;

    fn bitor(self, rhs: PipeMiddle<M, O>) -> PipeBegin<O> {
        PipeBegin::raw(move |b, dest| {
            let mid = rhs.construct(b, dest);
            self.construct(b, mid)
        })
    }
}

impl<M: 'static> BitOr<PipeEnd<M>> for PipeBegin<M> {
    type Output = Pipeline;

    fn bitor(self, rhs: PipeEnd<M>) -> Pipeline {
        let mut builder = GraphBuilder::new();
        let dest = rhs.construct(&mut builder);
        self.construct(&mut builder, dest);
        Pipeline::sealed(builder.map.clone())
    }
}

// ---- Pull pipes ----

/// A pull producer yielding items of `O`.
pub struct PullPipeBegin<O: 'static> {
    ctor: Box<dyn FnOnce(&mut GraphBuilder) -> PullSource<O>>,
    adorn: Adornments,
}

impl<O: 'static> PullPipeBegin<O> {
    pub fn raw(ctor: impl FnOnce(&mut GraphBuilder) -> PullSource<O> + 'static) -> Self {
        PullPipeBegin {
            ctor: Box::new(ctor),
            adorn: Adornments::default(),
        }
    }

    adornment_methods!();

    pub(crate) fn construct(self, builder: &mut GraphBuilder) -> PullSource<O> {
        let PullPipeBegin { ctor, adorn } = self;
        builder.scoped(&adorn, move |b| ctor(b))
    }
}

/// A pull transform: pulls `I` from upstream, yields `O`.
pub struct PullPipeMiddle<I: 'static, O: 'static> {
    ctor: Box<dyn FnOnce(&mut GraphBuilder, PullSource<I>) -> PullSource<O>>,
    adorn: Adornments,
}

impl<I: 'static, O: 'static> PullPipeMiddle<I, O> {
    pub fn raw(
        ctor: impl FnOnce(&mut GraphBuilder, PullSource<I>) -> PullSource<O> + 'static,
    ) -> Self {
        PullPipeMiddle {
            ctor: Box::new(ctor),
            adorn: Adornments::default(),
        }
    }

    adornment_methods!();

    pub(crate) fn construct(
        self,
        builder: &mut GraphBuilder,
        source: PullSource<I>,
    ) -> PullSource<O> {
        let PullPipeMiddle { ctor, adorn } = self;
        builder.scoped(&adorn, move |b| ctor(b, source))
    }
}

/// A pull terminal: the initiator that drives `pull` loops.
pub struct PullPipeEnd<I: 'static> {
    ctor: Box<dyn FnOnce(&mut GraphBuilder, PullSource<I>)>,
    adorn: Adornments,
}

impl<I: 'static> PullPipeEnd<I> {
    pub fn raw(ctor: impl FnOnce(&mut GraphBuilder, PullSource<I>) + 'static) -> Self {
        PullPipeEnd {
            ctor: Box::new(ctor),
            adorn: Adornments::default(),
        }
    }

    adornment_methods!();

    pub(crate) fn construct(self, builder: &mut GraphBuilder, source: PullSource<I>) {
        let PullPipeEnd { ctor, adorn } = self;
        builder.scoped(&adorn, move |b| ctor(b, source))
    }
}

impl<M: 'static, O: 'static> BitOr<PullPipeMiddle<M, O>> for PullPipeBegin<M> {
    type Output = PullPipeBegin<O>;

    fn bitor(self, rhs: PullPipeMiddle<M, O>) -> PullPipeBegin<O> {
        PullPipeBegin::raw(move |b| {
            let source = self.construct(b);
            rhs.construct(b, source)
        })
    }
}

impl<I: 'static, M: 'static, O: 'static> BitOr<PullPipeMiddle<M, O>> for PullPipeMiddle<I, M> {
    type Output = PullPipeMiddle<I, O>;

    fn bitor(self, rhs: PullPipeMiddle<M, O>) -> PullPipeMiddle<I, O> {
        PullPipeMiddle::raw(move |b, source| {
            let mid = self.construct(b, source);
            rhs.construct(b, mid)
        })
    }
}

impl<I: 'static, M: 'static> BitOr<PullPipeEnd<M>> for PullPipeMiddle<I, M> {
    type Output = PullPipeEnd<I>;

    fn bitor(self, rhs: PullPipeEnd<M>) -> PullPipeEnd<I> {
        PullPipeEnd::raw(move |b, source| {
            let mid = self.construct(b, source);
            rhs.construct(b, mid)
        })
    }
}

impl<M: 'static> BitOr<PullPipeEnd<M>> for PullPipeBegin<M> {
    type Output = Pipeline;

    fn bitor(self, rhs: PullPipeEnd<M>) -> Pipeline {
        let mut builder = GraphBuilder::new();
        let source = self.construct(&mut builder);
        rhs.construct(&mut builder, source);
        Pipeline::sealed(builder.map.clone())
    }
}
