//! Engine - refresh, plan and apply in one place
//!
//! Holds the provider and kind registries and wires the stages together so
//! callers don't have to thread a [`GraphContext`] through by hand.

use crate::context::{CancellationToken, GraphContext, ProgressCallback};
use crate::error::Result;
use crate::graph::ResourceGraph;
use crate::kinds::KindRegistry;
use crate::planner::{self, Plan};
use crate::provider::ProviderRegistry;
use crate::refresh::{self, RefreshReport};
use crate::resolver;
use crate::scheduler::{self, RunReport};
use crate::state::StateStore;
use crate::types::{ExecuteOptions, PlanOptions};

/// A computed plan together with the context it was computed against
#[derive(Debug)]
pub struct Planned<'g> {
    pub plan: Plan,
    pub context: GraphContext<'g>,
    pub refresh: RefreshReport,
}

/// Reconciliation engine
#[derive(Debug, Clone, Default)]
pub struct Engine {
    providers: ProviderRegistry,
    kinds: KindRegistry,
    options: ExecuteOptions,
}

impl Engine {
    pub fn new(providers: ProviderRegistry, kinds: KindRegistry) -> Self {
        Self {
            providers,
            kinds,
            options: ExecuteOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate, refresh and diff.
    ///
    /// Validation (cycles, missing providers) happens before any provider
    /// is contacted. Records reconciled by refresh are written to `store`
    /// only after the plan computed from them validated.
    pub fn plan<'g>(
        &'g self,
        graph: &'g ResourceGraph,
        store: &mut dyn StateStore,
        opts: &PlanOptions,
    ) -> Result<Planned<'g>> {
        resolver::resolve(graph)?;

        let snapshot = store.load()?;
        self.providers.check(graph, snapshot.keys())?;

        let mut context = GraphContext::new(graph, &self.kinds, snapshot.clone());
        let refresh = refresh::refresh(&mut context, &self.providers, opts)?;
        let plan = planner::plan(&context, opts)?;
        refresh::persist(&snapshot, &context.state, store)?;

        let summary = plan.summary();
        log::info!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            summary.create,
            summary.update,
            summary.replace,
            summary.delete,
            summary.no_op
        );

        Ok(Planned {
            plan,
            context,
            refresh,
        })
    }

    /// Execute a previously computed plan
    pub fn apply(
        &self,
        planned: &mut Planned<'_>,
        store: &mut dyn StateStore,
        progress: &mut dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        scheduler::execute(
            &planned.plan,
            &mut planned.context,
            &self.providers,
            store,
            &self.options,
            progress,
            cancel,
        )
    }

    /// Plan and apply in one go
    pub fn converge(
        &self,
        graph: &ResourceGraph,
        store: &mut dyn StateStore,
        opts: &PlanOptions,
        progress: &mut dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let mut planned = self.plan(graph, store, opts)?;
        self.apply(&mut planned, store, progress, cancel)
    }

    /// Delete everything on record
    pub fn destroy(
        &self,
        store: &mut dyn StateStore,
        opts: &PlanOptions,
        progress: &mut dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let empty = ResourceGraph::empty();
        self.converge(&empty, store, opts, progress, cancel)
    }
}
