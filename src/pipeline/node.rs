//! The node framework.
//!
//! A pipeline is a graph of cooperating nodes. The control plane
//! ([`Node`]) is driven by the runtime through `prepare`, `propagate`,
//! `begin`, `go`, and `end`; the data plane ([`PushNode`]/[`PullNode`]) is
//! plain method calls between neighbors through typed handles. Nodes are
//! shared as `Rc<RefCell<..>>`; the same allocation serves both planes.
//!
//! Each node moves through an explicit lifecycle
//! (`Constructed → Prepared → Begun → Ended`) tracked by the runtime.
//! Driving a node out of order is a programmer error and panics.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Result};

use crate::pipeline::graph::NodeMapInner;
use crate::progress::{Progress, StepHandle};

/// Identifier of a node within the (merged) node map. Unique per process.
pub type NodeId = u64;

/// Relationship between two nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    /// `from` pushes items to `to`.
    Pushes,
    /// `from` is pulled from by `to`.
    Pulls,
    /// `to` must run in a later phase than `from`; data materializes
    /// between them.
    Depends,
}

/// Where a node is in its life. Transitions are driven by the runtime
/// only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    Prepared,
    Begun,
    Ended,
}

/// Name priority: node-assigned default names lose to user-assigned ones.
pub const PRIORITY_INSIGNIFICANT: u32 = 0;
/// Name priority for names picked by the user through pipe adornments.
pub const PRIORITY_USER: u32 = 10;

/// Per-node bookkeeping held in the node map: identity, memory contract,
/// progress declaration, lifecycle.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub name: String,
    pub name_priority: u32,
    pub breadcrumb: Option<String>,
    pub min_memory: u64,
    pub max_memory: Option<u64>,
    pub fraction: f64,
    pub fraction_set: bool,
    /// Memory granted by the planner.
    pub available: u64,
    /// Steps declared for progress reporting.
    pub steps: u64,
    pub state: LifecycleState,
    /// Whether the runtime calls `go` on this node.
    pub initiator: bool,
}

impl NodeEntry {
    pub fn named(name: &str) -> Self {
        NodeEntry {
            name: name.to_string(),
            name_priority: PRIORITY_INSIGNIFICANT,
            breadcrumb: None,
            min_memory: 0,
            max_memory: None,
            fraction: 0.0,
            fraction_set: false,
            available: 0,
            steps: 0,
            state: LifecycleState::Constructed,
            initiator: false,
        }
    }

    pub fn initiator(name: &str) -> Self {
        NodeEntry {
            initiator: true,
            ..NodeEntry::named(name)
        }
    }

    /// Display name with breadcrumbs, as shown in logs.
    pub fn display_name(&self) -> String {
        match &self.breadcrumb {
            Some(b) => format!("{b} | {}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Control-plane interface every pipeline node implements.
///
/// All methods default to no-ops so a node only spells out the stages it
/// cares about. `go` is only ever invoked on initiators.
pub trait Node {
    /// Declare the memory contract and forward planning-time values.
    fn prepare(&mut self, _ctx: &mut NodeCtx<'_>) {}

    /// Publish derived metadata once memory is assigned (item counts and
    /// the like).
    fn propagate(&mut self, _ctx: &mut NodeCtx<'_>) {}

    /// Per-phase startup; buffers sized to the assigned memory are
    /// allocated here.
    fn begin(&mut self, _ctx: &mut NodeCtx<'_>) {}

    /// Drive the phase's data flow. Called on initiators only.
    fn go(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        bail!("go() called on a node that is not an initiator")
    }

    /// Per-phase teardown. Runs even when an earlier node's `end` failed.
    fn end(&mut self, _ctx: &mut NodeCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// Planner callback announcing the memory grant.
    fn set_available_memory(&mut self, _bytes: u64) {}
}

/// A node that accepts pushed items of type `T`.
pub trait PushNode<T>: Node {
    fn push(&mut self, item: T);
}

/// A node that surrenders items of type `T` on demand.
pub trait PullNode<T>: Node {
    fn can_pull(&mut self) -> bool;
    /// Next item; only valid after `can_pull` returned true.
    fn pull(&mut self) -> T;
}

/// Typed handle to a downstream push node.
pub struct PushTarget<T> {
    id: NodeId,
    node: Rc<RefCell<dyn PushNode<T>>>,
}

impl<T> PushTarget<T> {
    pub fn new(id: NodeId, node: Rc<RefCell<dyn PushNode<T>>>) -> Self {
        PushTarget { id, node }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn push(&self, item: T) {
        self.node.borrow_mut().push(item);
    }
}

impl<T> Clone for PushTarget<T> {
    fn clone(&self) -> Self {
        PushTarget {
            id: self.id,
            node: Rc::clone(&self.node),
        }
    }
}

/// Typed handle to an upstream pull node.
pub struct PullSource<T> {
    id: NodeId,
    node: Rc<RefCell<dyn PullNode<T>>>,
}

impl<T> PullSource<T> {
    pub(crate) fn new(id: NodeId, node: Rc<RefCell<dyn PullNode<T>>>) -> Self {
        PullSource { id, node }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn can_pull(&self) -> bool {
        self.node.borrow_mut().can_pull()
    }

    pub fn pull(&self) -> T {
        self.node.borrow_mut().pull()
    }
}

impl<T> Clone for PullSource<T> {
    fn clone(&self) -> Self {
        PullSource {
            id: self.id,
            node: Rc::clone(&self.node),
        }
    }
}

/// Per-call view the runtime hands to control-plane methods: the node's
/// map entry, the forwarding store, and the phase progress.
pub struct NodeCtx<'a> {
    pub(crate) id: NodeId,
    pub(crate) map: &'a mut NodeMapInner,
    pub(crate) progress: Progress,
}

impl NodeCtx<'_> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Bytes the planner must grant this node at minimum.
    pub fn set_minimum_memory(&mut self, bytes: u64) {
        self.map.entry_mut(self.id).min_memory = bytes;
    }

    /// Bytes beyond which extra memory is wasted on this node.
    pub fn set_maximum_memory(&mut self, bytes: u64) {
        self.map.entry_mut(self.id).max_memory = Some(bytes);
    }

    /// Share of the phase's residual memory relative to sibling nodes.
    pub fn set_memory_fraction(&mut self, fraction: f64) {
        let entry = self.map.entry_mut(self.id);
        entry.fraction = fraction;
        entry.fraction_set = true;
    }

    /// Whether a fraction was already chosen (by an adornment or an
    /// earlier call); node defaults check this before overriding.
    pub fn memory_fraction_set(&self) -> bool {
        self.map.entry(self.id).fraction_set
    }

    /// Memory granted to this node. Zero before assignment.
    pub fn available_memory(&self) -> u64 {
        self.map.entry(self.id).available
    }

    /// Declare how many progress steps this node will take this phase.
    pub fn set_steps(&mut self, steps: u64) {
        self.map.entry_mut(self.id).steps = steps;
    }

    /// Batched step counter over the phase progress sink.
    pub fn stepper(&self) -> StepHandle {
        self.progress.stepper()
    }

    /// Publish `value` under `key` to every node reachable downstream of
    /// this one (along push, pull, and dependency edges alike).
    pub fn forward<V: 'static>(&mut self, key: &str, value: V) {
        self.map.forward_from(self.id, key, Rc::new(value));
    }

    /// Whether an upstream node forwarded `key` here.
    pub fn can_fetch(&self, key: &str) -> bool {
        self.map.visible(self.id, key).is_some()
    }

    /// Fetch a forwarded value, cloning it out.
    ///
    /// # Panics
    ///
    /// Panics when the key is missing or holds a different type; both are
    /// programmer errors in graph construction.
    pub fn fetch<V: Clone + 'static>(&self, key: &str) -> V {
        match self.try_fetch(key) {
            Some(v) => v,
            None => panic!(
                "node '{}' fetched forwarded key '{key}', which no upstream node forwarded with the expected type",
                self.map.entry(self.id).display_name()
            ),
        }
    }

    /// Fetch a forwarded value if present and of the expected type.
    pub fn try_fetch<V: Clone + 'static>(&self, key: &str) -> Option<V> {
        self.map
            .visible(self.id, key)
            .and_then(|any| any.downcast_ref::<V>().cloned())
    }
}
