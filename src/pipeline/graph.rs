//! Node map and graph planner.
//!
//! The node map is the registry behind a pipeline: control handles, map
//! entries, edges, and forwarded values. Maps merge through a union-find
//! authority pointer when two pipelines turn out to share a node (passive
//! buffers do this), and the planner always works on the authority.
//!
//! Edges are stored in actor orientation: `(a, b, Pushes)` means `a`
//! pushes to `b`, `(a, b, Pulls)` means `a` pulls from `b`, and
//! `(a, b, Depends)` means `a` requires `b`'s phase to have completed.
//! The planner derives two views: the item-flow graph (producers before
//! consumers; drives propagate order and value forwarding) and the actor
//! graph (drives begin/end order).

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use anyhow::{bail, Result};
use log::{debug, warn};

use crate::pipeline::node::{EdgeKind, Node, NodeEntry, NodeId};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

fn next_node_id() -> NodeId {
    NEXT_NODE_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Item-flow orientation of an edge: producer first.
fn flow_edge(from: NodeId, to: NodeId, kind: EdgeKind) -> (NodeId, NodeId) {
    match kind {
        // a pushes to b: items flow a -> b.
        EdgeKind::Pushes => (from, to),
        // a pulls from b: items flow b -> a.
        EdgeKind::Pulls => (to, from),
        // a depends on b: whatever b materializes flows into a's phase.
        EdgeKind::Depends => (to, from),
    }
}

/// One registered node: its control handle, bookkeeping entry, and
/// forwarded values (own publications plus what upstream made visible).
pub struct NodeSlot {
    pub control: Rc<RefCell<dyn Node>>,
    pub entry: NodeEntry,
    /// Values this node forwarded.
    pub forwarded: HashMap<String, Rc<dyn Any>>,
    /// Values visible to this node (published by reachable upstream nodes
    /// or seeded at the pipeline level).
    pub visible: HashMap<String, Rc<dyn Any>>,
}

/// The actual registry. Iteration is in `NodeId` order, which is
/// registration order, so planning is deterministic.
#[derive(Default)]
pub struct NodeMapInner {
    pub(crate) slots: BTreeMap<NodeId, NodeSlot>,
    pub(crate) edges: Vec<(NodeId, NodeId, EdgeKind)>,
}

impl NodeMapInner {
    pub fn entry(&self, id: NodeId) -> &NodeEntry {
        &self.slots.get(&id).expect("unknown node id").entry
    }

    pub fn entry_mut(&mut self, id: NodeId) -> &mut NodeEntry {
        &mut self.slots.get_mut(&id).expect("unknown node id").entry
    }

    pub fn control(&self, id: NodeId) -> Rc<RefCell<dyn Node>> {
        Rc::clone(&self.slots.get(&id).expect("unknown node id").control)
    }

    /// Forward `value` from `id` to every node reachable downstream in the
    /// item-flow graph. Resolution is eager: downstream nodes see the
    /// value as soon as it is forwarded. The first forward of a key wins
    /// at each receiver.
    pub fn forward_from(&mut self, id: NodeId, key: &str, value: Rc<dyn Any>) {
        self.slots
            .get_mut(&id)
            .expect("unknown node id")
            .forwarded
            .insert(key.to_string(), Rc::clone(&value));
        for reached in self.reachable_from(id) {
            self.slots
                .get_mut(&reached)
                .expect("reachable node id")
                .visible
                .entry(key.to_string())
                .or_insert_with(|| Rc::clone(&value));
        }
    }

    /// Make `value` visible to `id` and everything downstream of it
    /// (pipeline-level seeding).
    pub fn seed(&mut self, id: NodeId, key: &str, value: Rc<dyn Any>) {
        self.slots
            .get_mut(&id)
            .expect("unknown node id")
            .visible
            .insert(key.to_string(), Rc::clone(&value));
        for reached in self.reachable_from(id) {
            self.slots
                .get_mut(&reached)
                .expect("reachable node id")
                .visible
                .entry(key.to_string())
                .or_insert_with(|| Rc::clone(&value));
        }
    }

    pub fn visible(&self, id: NodeId, key: &str) -> Option<Rc<dyn Any>> {
        self.slots
            .get(&id)
            .and_then(|slot| slot.visible.get(key))
            .cloned()
    }

    /// Nodes with no incoming item-flow edge; pipeline-level forwards seed
    /// these.
    pub fn sources(&self) -> Vec<NodeId> {
        let mut has_incoming: HashMap<NodeId, bool> =
            self.slots.keys().map(|&id| (id, false)).collect();
        for &(from, to, kind) in &self.edges {
            let (_, sink) = flow_edge(from, to, kind);
            if let Some(flag) = has_incoming.get_mut(&sink) {
                *flag = true;
            }
        }
        self.slots
            .keys()
            .copied()
            .filter(|id| !has_incoming[id])
            .collect()
    }

    /// Everything downstream of `start` in the item-flow graph.
    fn reachable_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut seen: Vec<NodeId> = Vec::new();
        let mut queue: VecDeque<NodeId> = VecDeque::from([start]);
        while let Some(at) = queue.pop_front() {
            for &(from, to, kind) in &self.edges {
                let (src, sink) = flow_edge(from, to, kind);
                if src == at && sink != start && !seen.contains(&sink) {
                    seen.push(sink);
                    queue.push_back(sink);
                }
            }
        }
        seen
    }
}

enum MapCell {
    Authority(NodeMapInner),
    Link(NodeMap),
}

/// Shared, mergeable handle to a node registry.
#[derive(Clone)]
pub struct NodeMap {
    cell: Rc<RefCell<MapCell>>,
}

impl Default for NodeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMap {
    pub fn new() -> Self {
        NodeMap {
            cell: Rc::new(RefCell::new(MapCell::Authority(NodeMapInner::default()))),
        }
    }

    /// Follow the union-find chain to the map that actually holds the
    /// nodes.
    pub fn find_authority(&self) -> NodeMap {
        let mut at = self.clone();
        loop {
            let next = match &*at.cell.borrow() {
                MapCell::Authority(_) => None,
                MapCell::Link(next) => Some(next.clone()),
            };
            match next {
                None => return at,
                Some(next) => at = next,
            }
        }
    }

    /// Whether two handles resolve to the same registry.
    pub fn same_authority(&self, other: &NodeMap) -> bool {
        Rc::ptr_eq(&self.find_authority().cell, &other.find_authority().cell)
    }

    /// Merge `other`'s registry into this one. `other` (and every handle
    /// linked to it) becomes an alias of this map.
    pub fn union(&self, other: &NodeMap) {
        let this = self.find_authority();
        let that = other.find_authority();
        if Rc::ptr_eq(&this.cell, &that.cell) {
            return;
        }
        let moved = {
            let mut cell = that.cell.borrow_mut();
            let taken = std::mem::replace(&mut *cell, MapCell::Link(this.clone()));
            match taken {
                MapCell::Authority(inner) => inner,
                MapCell::Link(_) => unreachable!("authority resolved to a link"),
            }
        };
        this.with_inner(|inner| {
            inner.slots.extend(moved.slots);
            inner.edges.extend(moved.edges);
        });
    }

    /// Run `f` against the authority registry.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut NodeMapInner) -> R) -> R {
        let auth = self.find_authority();
        let mut cell = auth.cell.borrow_mut();
        match &mut *cell {
            MapCell::Authority(inner) => f(inner),
            MapCell::Link(_) => unreachable!("authority resolved to a link"),
        }
    }

    /// Register a control handle under a fresh id.
    pub fn register(&self, control: Rc<RefCell<dyn Node>>, entry: NodeEntry) -> NodeId {
        let id = next_node_id();
        self.with_inner(|inner| {
            inner.slots.insert(
                id,
                NodeSlot {
                    control,
                    entry,
                    forwarded: HashMap::new(),
                    visible: HashMap::new(),
                },
            );
        });
        id
    }

    pub fn add_edge(&self, from: NodeId, to: NodeId, kind: EdgeKind) {
        self.with_inner(|inner| inner.edges.push((from, to, kind)));
    }
}

// ---- Planning ----

/// One phase: a maximal set of nodes connected without a dependency edge,
/// executed together.
pub struct Phase {
    pub name: String,
    /// Item-flow topological order (producers before consumers); drives
    /// prepare and propagate.
    pub flow_order: Vec<NodeId>,
    /// Actor-graph topological order; begin runs it reversed, end runs it
    /// forward.
    pub actor_order: Vec<NodeId>,
    pub initiators: Vec<NodeId>,
}

pub struct Plan {
    pub phases: Vec<Phase>,
}

/// Topological analysis and phase partition.
///
/// The item-flow and actor graphs must both be acyclic; phases split at
/// dependency edges; each phase must contain an initiator to drive it.
pub fn plan(inner: &NodeMapInner) -> Result<Plan> {
    let ids: Vec<NodeId> = inner.slots.keys().copied().collect();
    if ids.is_empty() {
        return Ok(Plan { phases: Vec::new() });
    }

    let flow_edges: Vec<(NodeId, NodeId)> = inner
        .edges
        .iter()
        .map(|&(from, to, kind)| flow_edge(from, to, kind))
        .collect();
    let actor_edges: Vec<(NodeId, NodeId)> = inner
        .edges
        .iter()
        .map(|&(from, to, _)| (from, to))
        .collect();

    let flow_order = topo_sort(&ids, &flow_edges).map_err(|id| {
        anyhow::anyhow!(
            "pipeline graph contains a cycle through node '{}'",
            inner.entry(id).display_name()
        )
    })?;
    let actor_order = topo_sort(&ids, &actor_edges).map_err(|id| {
        anyhow::anyhow!(
            "pipeline actor graph contains a cycle through node '{}'",
            inner.entry(id).display_name()
        )
    })?;

    // Connected components over push/pull edges form the phases.
    let mut component: HashMap<NodeId, usize> = HashMap::new();
    let mut n_components: usize = 0;
    for &id in &ids {
        if component.contains_key(&id) {
            continue;
        }
        let comp = n_components;
        n_components += 1;
        let mut queue = VecDeque::from([id]);
        component.insert(id, comp);
        while let Some(at) = queue.pop_front() {
            for &(from, to, kind) in &inner.edges {
                if kind == EdgeKind::Depends {
                    continue;
                }
                for (a, b) in [(from, to), (to, from)] {
                    if a == at && !component.contains_key(&b) {
                        component.insert(b, comp);
                        queue.push_back(b);
                    }
                }
            }
        }
    }

    // Order components by their dependency edges: `a depends on b` puts
    // b's component first.
    let comp_ids: Vec<NodeId> = (0..n_components as u64).collect();
    let comp_edges: Vec<(NodeId, NodeId)> = inner
        .edges
        .iter()
        .filter(|&&(_, _, kind)| kind == EdgeKind::Depends)
        .map(|&(a, b, _)| (component[&b] as u64, component[&a] as u64))
        .filter(|&(x, y)| x != y)
        .collect();
    let comp_order = topo_sort(&comp_ids, &comp_edges)
        .map_err(|_| anyhow::anyhow!("dependency edges between phases form a cycle"))?;

    let mut phases = Vec::new();
    for comp in comp_order {
        let in_comp = |id: &NodeId| component[id] as u64 == comp;
        let flow: Vec<NodeId> = flow_order.iter().copied().filter(in_comp).collect();
        let actor: Vec<NodeId> = actor_order.iter().copied().filter(in_comp).collect();
        if flow.is_empty() {
            continue;
        }
        let initiators: Vec<NodeId> = flow
            .iter()
            .copied()
            .filter(|&id| inner.entry(id).initiator)
            .collect();
        if initiators.is_empty() {
            bail!(
                "phase containing '{}' has no initiator to drive it",
                inner.entry(flow[0]).display_name()
            );
        }
        // The phase borrows its name from its most prominent node.
        let name = flow
            .iter()
            .map(|id| inner.entry(*id))
            .max_by_key(|e| e.name_priority)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| "phase".to_string());
        phases.push(Phase {
            name,
            flow_order: flow,
            actor_order: actor,
            initiators,
        });
    }
    debug!("planned {} phase(s)", phases.len());
    Ok(Plan { phases })
}

/// Kahn's algorithm. Ties resolve by node id (registration order) for
/// determinism. On a cycle, returns a node on it.
fn topo_sort(
    ids: &[NodeId],
    edges: &[(NodeId, NodeId)],
) -> std::result::Result<Vec<NodeId>, NodeId> {
    let mut indegree: BTreeMap<NodeId, usize> = ids.iter().map(|&id| (id, 0)).collect();
    let mut out: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for &(from, to) in edges {
        if indegree.contains_key(&from) && indegree.contains_key(&to) {
            *indegree.get_mut(&to).expect("known node") += 1;
            out.entry(from).or_default().push(to);
        }
    }
    let mut ready: VecDeque<NodeId> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        if let Some(succs) = out.get(&id) {
            for &succ in succs {
                let d = indegree.get_mut(&succ).expect("known node");
                *d -= 1;
                if *d == 0 {
                    ready.push_back(succ);
                }
            }
        }
    }
    if order.len() == ids.len() {
        Ok(order)
    } else {
        let on_cycle = indegree
            .keys()
            .find(|id| !order.contains(id))
            .copied()
            .expect("cycle implies a leftover node");
        Err(on_cycle)
    }
}

// ---- Memory assignment ----

/// Constraints of one node in a phase.
#[derive(Clone, Copy, Debug)]
pub struct MemoryConstraint {
    pub min: u64,
    pub max: Option<u64>,
    pub fraction: f64,
}

fn granted(c: &MemoryConstraint, factor: f64) -> u64 {
    let share = (c.fraction.max(0.0) * factor) as u64;
    let share = share.max(c.min);
    match c.max {
        Some(max) => share.min(max.max(c.min)),
        None => share,
    }
}

fn total_granted(constraints: &[MemoryConstraint], factor: f64) -> u64 {
    constraints.iter().map(|c| granted(c, factor)).sum()
}

/// Distribute `budget` bytes over `constraints`.
///
/// Every minimum is satisfied first; the residual is spread proportionally
/// to the fractions, clamped at each maximum. The proportionality factor
/// is found by binary search, which is the fixed point of the
/// clamp-and-redistribute iteration. When the minima alone exceed the
/// budget, the unmet demand is logged and the minima are granted anyway.
pub fn assign_memory(constraints: &[MemoryConstraint], budget: u64) -> Vec<u64> {
    let minimum: u64 = constraints.iter().map(|c| c.min).sum();
    if minimum > budget {
        warn!(
            "memory minima ({minimum} bytes) exceed the phase budget ({budget} bytes); \
             granting minima regardless"
        );
        return constraints.iter().map(|c| c.min).collect();
    }
    if constraints.iter().all(|c| c.fraction <= 0.0) {
        return constraints.iter().map(|c| c.min).collect();
    }

    // Bracket the factor, then bisect. total_granted is monotone in the
    // factor, flat stretches notwithstanding.
    let mut hi = 1.0f64;
    while total_granted(constraints, hi) < budget && hi < 1e18 {
        hi *= 2.0;
    }
    let mut lo = 0.0f64;
    for _ in 0..64 {
        let mid = (lo + hi) / 2.0;
        if total_granted(constraints, mid) <= budget {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    constraints.iter().map(|c| granted(c, lo)).collect()
}
