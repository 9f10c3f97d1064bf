//! The runtime driver.
//!
//! Executes a sealed pipeline phase by phase: prepare every node, assign
//! memory, propagate metadata, begin (receivers first), run the
//! initiators, and end (producers first). `end` is best-effort: when a
//! node fails, the remaining nodes still get their teardown and the first
//! error wins. Progress is aggregated per phase from the steps nodes
//! declared.

use std::any::Any;
use std::rc::Rc;

use anyhow::{bail, Context as AnyhowContext, Result};
use log::{debug, warn};

use crate::pipeline::graph::{assign_memory, plan, MemoryConstraint, NodeMap, NodeMapInner, Phase};
use crate::pipeline::node::{LifecycleState, NodeCtx, NodeId};
use crate::progress::Progress;
use crate::utils::config::PipelineConsts;

/// A sealed pipeline: an initiator-to-terminator composition ready to run.
pub struct Pipeline {
    map: NodeMap,
    executed: bool,
    pending_forwards: Vec<(String, Rc<dyn Any>)>,
}

impl Pipeline {
    pub(crate) fn sealed(map: NodeMap) -> Self {
        Pipeline {
            map,
            executed: false,
            pending_forwards: Vec::new(),
        }
    }

    /// The node map behind this pipeline (its authority may be shared with
    /// other pipelines).
    pub fn node_map(&self) -> &NodeMap {
        &self.map
    }

    /// Make `value` visible under `key` to the pipeline's source nodes and
    /// everything downstream of them, before the run.
    pub fn forward<V: 'static>(&mut self, key: &str, value: V) {
        self.pending_forwards
            .push((key.to_string(), Rc::new(value)));
    }

    /// Look up a value some node forwarded, after the run.
    pub fn try_fetch<V: Clone + 'static>(&self, key: &str) -> Option<V> {
        self.map.with_inner(|inner| {
            inner
                .slots
                .values()
                .find_map(|slot| slot.forwarded.get(key))
                .and_then(|any| any.downcast_ref::<V>().cloned())
        })
    }

    /// Execute with an explicit memory budget and progress sink.
    ///
    /// When this pipeline shares nodes with others (passive buffers), the
    /// merged graph runs as a whole; run exactly one of the pipelines
    /// involved.
    pub fn run(&mut self, memory: u64, progress: &Progress) -> Result<()> {
        if self.executed {
            bail!("pipeline has already been executed");
        }
        self.executed = true;
        if memory == 0 {
            warn!("no memory for pipelining");
        }

        let pending = std::mem::take(&mut self.pending_forwards);
        let auth = self.map.find_authority();
        auth.with_inner(|inner| {
            for (key, value) in &pending {
                for source in inner.sources() {
                    inner.seed(source, key, Rc::clone(value));
                }
            }

            let plan = plan(inner)?;
            let overhead = PipelineConsts::PHASE_OVERHEAD * plan.phases.len() as u64;
            let budget = memory.saturating_sub(overhead);
            if budget == 0 && memory > 0 {
                warn!("memory budget does not cover the pipelining framework overhead");
            }
            debug!(
                "running {} phase(s) with {budget} bytes per phase",
                plan.phases.len()
            );

            for phase in &plan.phases {
                let phase_budget = budget
                    .saturating_sub(PipelineConsts::NODE_OVERHEAD * phase.flow_order.len() as u64);
                run_phase(inner, phase, phase_budget, progress)?;
            }
            Ok(())
        })
    }
}

/// Assert and perform a lifecycle transition. Driving a node out of order
/// is a programmer error.
fn advance_state(
    inner: &mut NodeMapInner,
    id: NodeId,
    from: LifecycleState,
    to: LifecycleState,
    what: &str,
) {
    let entry = inner.entry_mut(id);
    assert!(
        entry.state == from,
        "node '{}' driven out of order: {what} while {:?}",
        entry.display_name(),
        entry.state
    );
    entry.state = to;
}

fn run_phase(
    inner: &mut NodeMapInner,
    phase: &Phase,
    budget: u64,
    progress: &Progress,
) -> Result<()> {
    debug!(
        "phase '{}': {} node(s), budget {budget} bytes",
        phase.name,
        phase.flow_order.len()
    );

    // Prepare in item-flow order; forwarding resolves eagerly as nodes
    // publish.
    for &id in &phase.flow_order {
        advance_state(inner, id, LifecycleState::Constructed, LifecycleState::Prepared, "prepare");
        let control = inner.control(id);
        control.borrow_mut().prepare(&mut NodeCtx {
            id,
            map: &mut *inner,
            progress: progress.clone(),
        });
    }

    // Solve the phase's memory assignment and announce the grants.
    let constraints: Vec<MemoryConstraint> = phase
        .flow_order
        .iter()
        .map(|&id| {
            let e = inner.entry(id);
            MemoryConstraint {
                min: e.min_memory,
                max: e.max_memory,
                fraction: e.fraction,
            }
        })
        .collect();
    let grants = assign_memory(&constraints, budget);
    for (&id, &bytes) in phase.flow_order.iter().zip(&grants) {
        let entry = inner.entry_mut(id);
        entry.available = bytes;
        debug!(
            "  {}: min={} max={:?} fraction={} granted={bytes}",
            entry.display_name(),
            entry.min_memory,
            entry.max_memory,
            entry.fraction
        );
        inner.control(id).borrow_mut().set_available_memory(bytes);
    }

    // Propagate derived metadata in item-flow order.
    for &id in &phase.flow_order {
        let control = inner.control(id);
        control.borrow_mut().propagate(&mut NodeCtx {
            id,
            map: &mut *inner,
            progress: progress.clone(),
        });
    }

    // Begin receivers before producers so pushes and pulls land on ready
    // nodes.
    for &id in phase.actor_order.iter().rev() {
        advance_state(inner, id, LifecycleState::Prepared, LifecycleState::Begun, "begin");
        let control = inner.control(id);
        control.borrow_mut().begin(&mut NodeCtx {
            id,
            map: &mut *inner,
            progress: progress.clone(),
        });
    }

    let total_steps: u64 = phase
        .flow_order
        .iter()
        .map(|&id| inner.entry(id).steps)
        .sum();
    progress.begin_work(&phase.name, total_steps);

    // Drive the phase.
    let mut failure: Option<anyhow::Error> = None;
    for &id in &phase.initiators {
        let control = inner.control(id);
        let name = inner.entry(id).display_name();
        let result = control.borrow_mut().go(&mut NodeCtx {
            id,
            map: &mut *inner,
            progress: progress.clone(),
        });
        if let Err(e) = result {
            failure = Some(e.context(format!("initiator '{name}' failed")));
            break;
        }
    }

    // Tear down producers first so buffered items drain downstream. Every
    // node gets its end even after a failure.
    for &id in &phase.actor_order {
        advance_state(inner, id, LifecycleState::Begun, LifecycleState::Ended, "end");
        let control = inner.control(id);
        let name = inner.entry(id).display_name();
        let result = control.borrow_mut().end(&mut NodeCtx {
            id,
            map: &mut *inner,
            progress: progress.clone(),
        });
        if let Err(e) = result {
            if failure.is_none() {
                failure = Some(e.context(format!("node '{name}' failed during end")));
            } else {
                warn!("node '{name}' also failed during end: {e:#}");
            }
        }
    }

    progress.end_work();
    match failure {
        Some(e) => Err(e).context(format!("pipeline phase '{}' failed", phase.name)),
        None => Ok(()),
    }
}
