// Project inspection
pub mod graph;
pub mod plan;
pub mod validate;

// Converging
pub mod apply;
pub mod destroy;
pub mod refresh;

// State file
pub mod state;

use anyhow::{Result, bail};
use declarative::{
    CancellationToken, Engine, FileStateStore, Planned, ProviderRegistry, StateStore,
};
use std::sync::Arc;

use crate::Context;
use crate::config::Project;
use crate::interrupt;
use crate::progress::RunProgress;
use crate::provider::LocalProvider;
use crate::render;
use crate::ui;

pub(crate) fn load_project(ctx: &Context) -> Result<Project> {
    Project::load(ctx.config.as_deref())
}

/// Engine wired to the local provider, with per-run overrides
pub(crate) fn engine(project: &Project, jobs: Option<usize>, timeout_secs: Option<u64>) -> Engine {
    let provider = Arc::new(LocalProvider::new(project.provider_root()));
    Engine::new(ProviderRegistry::single(provider), project.kinds.clone())
        .with_options(project.execute_options(jobs, timeout_secs))
}

pub(crate) fn open_store(project: &Project) -> FileStateStore {
    let store = FileStateStore::new(project.state_path());
    log::debug!("Using state file {}", store.path().display());
    store
}

/// Show a plan, confirm it and run it
pub(crate) fn execute(
    ctx: &Context,
    engine: &Engine,
    planned: &mut Planned<'_>,
    store: &mut dyn StateStore,
    prompt: &str,
    assume_yes: bool,
) -> Result<()> {
    render::print_refresh(&planned.refresh);
    render::print_plan(&planned.plan, ctx.verbose > 0);
    if !planned.plan.has_changes() {
        return Ok(());
    }

    println!();
    if !ui::confirm(prompt, assume_yes)? {
        ui::warn("Aborted");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    interrupt::install(&cancel);

    let mut progress = RunProgress::new(ctx.quiet, ctx.verbose > 0);
    let report = engine.apply(planned, store, &mut progress, &cancel)?;
    render::print_report(&report, ctx.quiet);

    if cancel.is_cancelled() {
        ui::warn("Interrupted. Completed actions were saved; run again to finish.");
    }

    if report.is_success() {
        Ok(())
    } else {
        let s = &report.summary;
        bail!(
            "{} of {} resources did not converge",
            s.total() - s.total_changes() - s.no_change,
            s.total()
        )
    }
}
