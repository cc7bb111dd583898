//! Run context and callback traits
//!
//! A [`GraphContext`] is passed explicitly through refresh, planning and
//! execution instead of living in a global. It pairs the immutable desired
//! graph with the working copy of state that is updated as actions complete.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ConflictError;
use crate::graph::ResourceGraph;
use crate::kinds::KindRegistry;
use crate::planner::StepOp;
use crate::state::StateSnapshot;
use crate::types::{ExecuteSummary, NodeOutcome, ResourceId};

/// Everything a run needs to know about desired and recorded state
#[derive(Debug)]
pub struct GraphContext<'g> {
    pub graph: &'g ResourceGraph,
    pub kinds: &'g KindRegistry,
    /// Working copy of state, kept in lockstep with the store
    pub state: StateSnapshot,
    /// Drift found by refresh; these nodes are skipped
    pub conflicts: BTreeMap<ResourceId, ConflictError>,
}

impl<'g> GraphContext<'g> {
    pub fn new(graph: &'g ResourceGraph, kinds: &'g KindRegistry, state: StateSnapshot) -> Self {
        Self {
            graph,
            kinds,
            state,
            conflicts: BTreeMap::new(),
        }
    }
}

/// Cooperative cancellation flag shared with whoever handles interrupts
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop dispatching new actions; in-flight actions still finish
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Progress callback for execution
///
/// All calls happen on the coordinating thread, in completion order.
pub trait ProgressCallback {
    /// Called once with the number of steps to run
    fn on_run_start(&mut self, steps: usize);

    /// Called when a step is handed to a worker
    fn on_step_start(&mut self, id: &ResourceId, op: &StepOp);

    /// Called when a step finishes, including skipped and blocked steps
    fn on_step_complete(&mut self, id: &ResourceId, outcome: &NodeOutcome);

    /// Called once at the end of the run
    fn on_run_complete(&mut self, summary: &ExecuteSummary);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&mut self, _steps: usize) {}
    fn on_step_start(&mut self, _id: &ResourceId, _op: &StepOp) {}
    fn on_step_complete(&mut self, _id: &ResourceId, _outcome: &NodeOutcome) {}
    fn on_run_complete(&mut self, _summary: &ExecuteSummary) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_shared() {
        let token = CancellationToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }
}
