use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use declarative::{RecordStatus, ResourceId, StateStore};

use crate::Context;
use crate::cli::StateCommand;
use crate::ui;

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<()> {
    match cmd {
        StateCommand::List => list(ctx),
        StateCommand::Show { id } => show(ctx, &id),
        StateCommand::Rm { id, yes } => remove(ctx, &id, yes),
    }
}

fn parse_id(id: &str) -> Result<ResourceId> {
    id.parse()
        .with_context(|| format!("'{id}' is not a resource identifier (expected kind.name)"))
}

fn list(ctx: &Context) -> Result<()> {
    let project = super::load_project(ctx)?;
    let mut store = super::open_store(&project);
    let records = store.load()?;

    if records.is_empty() {
        ui::info("No resources recorded");
        return Ok(());
    }

    ui::header(&format!("State ({})", store.path().display()));
    for record in records.values() {
        let status = match record.status {
            RecordStatus::Applied => "●".green(),
            RecordStatus::Unknown => "?".yellow(),
        };
        let remote = record.remote_id.as_deref().unwrap_or("-");
        let mut line = format!("  {status} {:<32} {}", record.id.to_string(), remote.dimmed());
        if !record.deposed.is_empty() {
            line.push_str(
                &format!(" (+{} old object(s) pending deletion)", record.deposed.len())
                    .yellow()
                    .to_string(),
            );
        }
        println!("{line}");
    }

    let unknown = records.values().filter(|r| r.is_unknown()).count();
    if unknown > 0 {
        println!();
        ui::warn(&format!(
            "{unknown} record(s) in unknown state; the next plan will read them back"
        ));
    }
    Ok(())
}

fn show(ctx: &Context, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let project = super::load_project(ctx)?;
    let mut store = super::open_store(&project);
    let records = store.load()?;

    let Some(record) = records.get(&id) else {
        bail!("{id} is not in state");
    };
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

fn remove(ctx: &Context, id: &str, yes: bool) -> Result<()> {
    let id = parse_id(id)?;
    let project = super::load_project(ctx)?;
    let mut store = super::open_store(&project);
    let records = store.load()?;

    let Some(record) = records.get(&id) else {
        bail!("{id} is not in state");
    };
    if let Some(remote) = &record.remote_id {
        ui::warn(&format!(
            "The remote object {remote} will be left in place and no longer managed"
        ));
    }
    if !ui::confirm(&format!("Forget {id}?"), yes)? {
        ui::warn("Aborted");
        return Ok(());
    }

    store.remove(&id)?;
    ui::success(&format!("Removed {id} from state"));
    Ok(())
}
