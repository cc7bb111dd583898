use anyhow::Result;
use declarative::PlanOptions;

use crate::Context;
use crate::cli::RefreshArgs;
use crate::render;
use crate::ui;

/// Read every recorded object and reconcile state; never changes remote objects
pub fn run(ctx: &Context, args: RefreshArgs) -> Result<()> {
    let project = super::load_project(ctx)?;
    let engine = super::engine(&project, None, None);
    let mut store = super::open_store(&project);

    let opts = PlanOptions {
        refresh: true,
        accept_drift: args.accept,
        ..Default::default()
    };
    let planned = engine.plan(&project.graph, &mut store, &opts)?;
    let report = &planned.refresh;

    render::print_refresh(report);
    for action in &planned.plan.actions {
        if let Some(conflict) = &action.conflict {
            ui::warn(&conflict.to_string());
        }
    }

    println!();
    if report.is_clean() {
        ui::success("No unresolved drift");
    } else {
        ui::dim("Run `converge refresh --accept` to record the remote values as state");
    }

    if planned.plan.has_changes() {
        ui::info(&format!(
            "{}. Run `converge apply` to converge.",
            render::plan_summary_line(&planned.plan)
        ));
    }
    Ok(())
}
