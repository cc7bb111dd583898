use anyhow::Result;
use declarative::{PlanOptions, ResourceGraph};

use crate::Context;
use crate::cli::DestroyArgs;

/// Plan against an empty graph, so every recorded object is deleted
/// (dependents before the objects they reference)
pub fn run(ctx: &Context, args: DestroyArgs) -> Result<()> {
    let project = super::load_project(ctx)?;
    let engine = super::engine(&project, args.jobs, None);
    let mut store = super::open_store(&project);

    let empty = ResourceGraph::empty();
    let opts = PlanOptions {
        targets: args.targets,
        ..Default::default()
    };
    let mut planned = engine.plan(&empty, &mut store, &opts)?;

    super::execute(
        ctx,
        &engine,
        &mut planned,
        &mut store,
        "Destroy these resources? This cannot be undone.",
        args.yes,
    )
}
