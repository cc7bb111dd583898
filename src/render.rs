//! Plan, refresh and run-report display

use colored::{ColoredString, Colorize};
use declarative::{
    Action, ActionKind, AttributeDiff, Change, NodeOutcome, Plan, RefreshReport, ResourceGraph,
    ResourceId, RunReport, StepOp, Value,
};
use similar::{ChangeTag, TextDiff};

const WIDTH: usize = 53;

fn symbol(kind: ActionKind) -> ColoredString {
    match kind {
        ActionKind::Create => kind.symbol().green(),
        ActionKind::Update => kind.symbol().yellow(),
        ActionKind::Replace => kind.symbol().magenta(),
        ActionKind::Delete => kind.symbol().red(),
        ActionKind::NoOp => kind.symbol().dimmed(),
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Lines describing the plan, one block per resource
pub fn plan_lines(plan: &Plan, show_unchanged: bool) -> Vec<String> {
    let mut lines = Vec::new();

    for action in &plan.actions {
        if let Some(conflict) = &action.conflict {
            lines.push(format!(
                "{} {} {}",
                "!".yellow().bold(),
                action.id.to_string().bold(),
                conflict.message.yellow()
            ));
            continue;
        }
        if action.kind == ActionKind::NoOp {
            if show_unchanged {
                lines.push(format!("  {}", action.id.to_string().dimmed()));
            }
        } else {
            lines.push(action_header(action));
            for diff in &action.changes {
                lines.extend(change_lines(diff).into_iter().map(|l| format!("    {l}")));
            }
        }
    }

    for step in &plan.steps {
        if let StepOp::DeleteDeposed { remote_id } = &step.op {
            let replacing = plan
                .action(&step.id)
                .is_some_and(|a| a.kind == ActionKind::Replace);
            if !replacing {
                lines.push(format!(
                    "{} {} {}",
                    "-".red(),
                    step.id.to_string().bold(),
                    format!("(leftover object {remote_id})").dimmed()
                ));
            }
        }
    }

    lines
}

fn action_header(action: &Action) -> String {
    let mut header = format!("{} {}", symbol(action.kind), action.id.to_string().bold());
    if action.kind == ActionKind::Replace {
        let reasons = action.replacement_reasons();
        if !reasons.is_empty() {
            header.push_str(
                &format!("  ({} forces replacement)", reasons.join(", "))
                    .dimmed()
                    .to_string(),
            );
        }
    }
    header
}

/// Lines for one attribute change
pub fn change_lines(diff: &AttributeDiff) -> Vec<String> {
    let name = &diff.attribute;
    let forces = if diff.forces_replacement {
        format!(" {}", "# forces replacement".red())
    } else {
        String::new()
    };

    match &diff.change {
        Change::Added(value) => vec![format!("{} {name} = {value}{forces}", "+".green())],
        Change::Removed(value) => vec![format!("{} {name} = {value}{forces}", "-".red())],
        Change::Pending { old } => {
            let old = old.as_ref().map(|v| format!("{v} → ")).unwrap_or_default();
            vec![format!(
                "{} {name}: {old}{}{forces}",
                "~".yellow(),
                "(known after apply)".dimmed()
            )]
        }
        Change::Modified { old, new } => match (old, new) {
            (Value::String(a), Value::String(b)) if old.is_multiline() || new.is_multiline() => {
                let mut lines = vec![format!("{} {name}:{forces}", "~".yellow())];
                lines.extend(text_diff(a, b));
                lines
            }
            _ => vec![format!("{} {name}: {old} → {new}{forces}", "~".yellow())],
        },
    }
}

fn text_diff(old: &str, new: &str) -> Vec<String> {
    TextDiff::from_lines(old, new)
        .iter_all_changes()
        .filter_map(|change| {
            let text = change.value().trim_end_matches('\n');
            match change.tag() {
                ChangeTag::Delete => Some(format!("    {}", format!("- {text}").red())),
                ChangeTag::Insert => Some(format!("    {}", format!("+ {text}").green())),
                ChangeTag::Equal => None,
            }
        })
        .collect()
}

/// One-line plan summary
pub fn plan_summary_line(plan: &Plan) -> String {
    let s = plan.summary();
    let mut line = format!(
        "Plan: {} to create, {} to update, {} to replace, {} to delete",
        s.create.to_string().green(),
        s.update.to_string().yellow(),
        s.replace.to_string().magenta(),
        s.delete.to_string().red()
    );
    if s.conflicts > 0 {
        line.push_str(&format!(", {} in conflict", s.conflicts.to_string().yellow()));
    }
    line
}

pub fn print_plan(plan: &Plan, show_unchanged: bool) {
    if !plan.has_changes() {
        println!();
        println!("  {} No changes. Remote objects match the configuration.", "✓".green());
        return;
    }

    println!();
    println!("┌─ {} {}", "Plan".bold(), "─".repeat(WIDTH - 7));
    println!("│");
    for line in plan_lines(plan, show_unchanged) {
        println!("│ {line}");
    }
    println!("│");
    println!("├{}", "─".repeat(WIDTH));
    println!("│ {}", plan_summary_line(plan));
    println!("└{}", "─".repeat(WIDTH));
}

// ============================================================================
// Refresh
// ============================================================================

pub fn print_refresh(report: &RefreshReport) {
    if report.read == 0 {
        return;
    }
    println!();
    println!(
        "  {} Refreshed {} object(s)",
        "ℹ".blue(),
        report.read
    );
    for id in &report.adopted {
        println!("    • {id} {}", "adopted".green());
    }
    for id in &report.removed {
        println!("    • {id} {}", "gone, removed from state".dimmed());
    }
    for id in &report.accepted {
        println!("    • {id} {}", "drift accepted".yellow());
    }
    for id in &report.conflicts {
        println!("    • {id} {}", "drifted".red());
    }
}

// ============================================================================
// Run report
// ============================================================================

/// Single line for a finished node
pub fn outcome(id: &ResourceId, outcome: &NodeOutcome) -> String {
    match outcome {
        NodeOutcome::NoChange => format!("○ {id}").dimmed().to_string(),
        NodeOutcome::Created => format!("{} {id} created", "✓".green()),
        NodeOutcome::Updated => format!("{} {id} updated", "✓".green()),
        NodeOutcome::Replaced => format!("{} {id} replaced", "✓".green()),
        NodeOutcome::Deleted => format!("{} {id} deleted", "✓".green()),
        NodeOutcome::Failed { error } => format!("{} {id} failed: {error}", "✗".red()),
        NodeOutcome::TimedOut => format!(
            "{} {id} timed out; remote state unknown until the next run",
            "⏱".yellow()
        ),
        NodeOutcome::Conflict { message } => format!("{} {id} conflict: {message}", "⚠".yellow()),
        NodeOutcome::Blocked { cause } => format!("{} {id} blocked by {cause}", "⊘".dimmed()),
        NodeOutcome::Cancelled => format!("{} {id} cancelled", "⊘".dimmed()),
    }
}

/// Final run summary; `list_problems` repeats failed nodes when no live progress was shown
pub fn print_report(report: &RunReport, list_problems: bool) {
    let summary = &report.summary;

    let problems: Vec<_> = report
        .outcomes
        .iter()
        .filter(|(_, o)| !o.is_success())
        .collect();
    if list_problems && !problems.is_empty() {
        println!();
        for (id, o) in problems {
            println!("  {}", outcome(id, o));
        }
    }

    println!();
    if summary.is_success() {
        println!("  {} Converged successfully!", "✓".green().bold());
    } else {
        println!("  {} Converged with errors", "⚠".yellow().bold());
    }

    let counts = [
        (summary.created, "created"),
        (summary.updated, "updated"),
        (summary.replaced, "replaced"),
        (summary.deleted, "deleted"),
        (summary.timed_out, "timed out"),
        (summary.conflicts, "in conflict"),
        (summary.blocked, "blocked"),
        (summary.cancelled, "cancelled"),
    ];
    for (n, label) in counts {
        if n > 0 {
            println!("    • {n} resources {label}");
        }
    }
    if summary.failed > 0 {
        println!("    • {} {} failed", summary.failed, "resources".red());
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Graphviz rendering; edges point from consumer to producer
pub fn graph_dot(graph: &ResourceGraph) -> String {
    let mut out = String::from("digraph converge {\n    rankdir = \"RL\";\n");
    for node in graph.nodes() {
        out.push_str(&format!("    \"{}\";\n", node.id));
    }
    for edge in graph.edges() {
        match &edge.attribute {
            Some(attr) => out.push_str(&format!(
                "    \"{}\" -> \"{}\" [label = \"{attr}\"];\n",
                edge.from, edge.to
            )),
            None => out.push_str(&format!(
                "    \"{}\" -> \"{}\" [style = dashed];\n",
                edge.from, edge.to
            )),
        }
    }
    out.push_str("}\n");
    out
}
