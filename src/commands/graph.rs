use anyhow::Result;
use declarative::resolver;

use crate::Context;
use crate::cli::GraphArgs;
use crate::render;
use crate::ui;

pub fn run(ctx: &Context, args: GraphArgs) -> Result<()> {
    let project = super::load_project(ctx)?;
    let graph = &project.graph;
    let order = resolver::resolve(graph)?;

    if args.dot {
        print!("{}", render::graph_dot(graph));
        return Ok(());
    }

    ui::header("Apply order");
    for (i, id) in order.iter().enumerate() {
        println!("  {:>3}. {id}", i + 1);
        let deps: Vec<String> = graph.dependencies(id).iter().map(ToString::to_string).collect();
        if !deps.is_empty() {
            ui::dim(&format!("       after {}", deps.join(", ")));
        }
    }
    Ok(())
}
