use anyhow::Result;
use declarative::resolver;
use std::collections::BTreeSet;

use crate::Context;
use crate::ui;

/// Parse the project file and resolve the graph; contacts no provider
pub fn run(ctx: &Context) -> Result<()> {
    let project = super::load_project(ctx)?;
    let order = resolver::resolve(&project.graph)?;

    let kinds: BTreeSet<&str> = project
        .graph
        .nodes()
        .iter()
        .map(|n| n.id.kind.as_str())
        .collect();

    ui::success(&format!("{} is valid", project.path.display()));
    ui::kv("resources", &project.graph.len().to_string());
    ui::kv("edges", &project.graph.edges().len().to_string());
    ui::kv("kinds", &kinds.into_iter().collect::<Vec<_>>().join(", "));

    if ctx.verbose > 0 {
        let order: Vec<String> = order.iter().map(ToString::to_string).collect();
        ui::kv("order", &order.join(" → "));
    }
    Ok(())
}
