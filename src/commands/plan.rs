use anyhow::Result;
use declarative::PlanOptions;

use crate::Context;
use crate::cli::PlanArgs;
use crate::render;

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let project = super::load_project(ctx)?;
    let engine = super::engine(&project, None, None);
    let mut store = super::open_store(&project);

    let opts = PlanOptions {
        targets: args.targets,
        refresh: args.refresh,
        ..Default::default()
    };
    let planned = engine.plan(&project.graph, &mut store, &opts)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&planned.plan)?);
        return Ok(());
    }

    render::print_refresh(&planned.refresh);
    render::print_plan(&planned.plan, ctx.verbose > 0);
    Ok(())
}
