use anyhow::Result;
use declarative::PlanOptions;

use crate::Context;
use crate::cli::ApplyArgs;

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let project = super::load_project(ctx)?;
    let engine = super::engine(&project, args.jobs, args.timeout);
    let mut store = super::open_store(&project);

    let opts = PlanOptions {
        targets: args.targets,
        refresh: args.refresh,
        ..Default::default()
    };
    let mut planned = engine.plan(&project.graph, &mut store, &opts)?;

    super::execute(
        ctx,
        &engine,
        &mut planned,
        &mut store,
        "Apply these changes?",
        args.yes,
    )
}
