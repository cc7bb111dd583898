//! Refresh - reconcile recorded state with what providers report
//!
//! Records left `Unknown` by a timed-out action are always reconciled before
//! planning. With [`PlanOptions::refresh`] every other record is read as
//! well and compared against its last-applied attributes.
//!
//! Refresh only touches the in-memory snapshot; [`persist`] writes the
//! result once the caller has validated a plan against it.

use rayon::prelude::*;
use std::sync::Arc;

use crate::context::GraphContext;
use crate::error::{ConflictError, ProviderError, Result, StateError};
use crate::provider::{Provider, ProviderRegistry, RemoteObject};
use crate::state::{RecordStatus, StateRecord, StateSnapshot, StateStore};
use crate::types::{Attributes, PlanOptions, ResourceId};

/// What a refresh changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Records read from providers
    pub read: usize,
    /// Unknown records whose remote object was found and adopted
    pub adopted: Vec<ResourceId>,
    /// Records dropped because their remote object is gone
    pub removed: Vec<ResourceId>,
    /// Records whose drifted remote values were accepted
    pub accepted: Vec<ResourceId>,
    /// Records with unresolved drift
    pub conflicts: Vec<ResourceId>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Result of reading one record
enum Observed {
    Found { remote_id: String, remote: RemoteObject },
    Gone,
    Failed(ProviderError),
}

/// Refresh `ctx.state` from providers.
///
/// Drift that is not accepted is recorded in `ctx.conflicts`; the affected
/// nodes are skipped by the scheduler.
pub fn refresh(
    ctx: &mut GraphContext<'_>,
    providers: &ProviderRegistry,
    opts: &PlanOptions,
) -> Result<RefreshReport> {
    let mut report = RefreshReport::default();

    let mut work: Vec<(StateRecord, Arc<dyn Provider>)> = Vec::new();
    for record in ctx.state.values() {
        let wanted = record.is_unknown() || (opts.refresh && record.exists());
        if wanted {
            work.push((record.clone(), providers.require(&record.id.kind)?));
        }
    }

    if work.is_empty() {
        return Ok(report);
    }
    log::debug!("Refreshing {} resources", work.len());

    let observed: Vec<(StateRecord, Observed)> = work
        .into_par_iter()
        .map(|(record, provider)| {
            let observed = observe(&record, provider.as_ref());
            (record, observed)
        })
        .collect();

    report.read = observed.len();

    for (record, observed) in observed {
        let id = record.id.clone();
        if record.is_unknown() {
            reconcile_unknown(ctx, record, observed, &mut report);
        } else {
            compare_applied(ctx, record, observed, opts, &mut report);
        }
        if ctx.conflicts.contains_key(&id) {
            report.conflicts.push(id);
        }
    }

    Ok(report)
}

fn observe(record: &StateRecord, provider: &dyn Provider) -> Observed {
    let remote_id = match &record.remote_id {
        Some(remote_id) => Some(remote_id.clone()),
        // A create that never reported back
        None if record.is_unknown() => match provider.lookup(&record.id) {
            Ok(found) => found.filter(|rid| !record.deposed.contains(rid)),
            Err(e) => return Observed::Failed(e),
        },
        None => None,
    };

    let Some(remote_id) = remote_id else {
        return Observed::Gone;
    };

    match provider.read(&remote_id) {
        Ok(Some(remote)) => Observed::Found { remote_id, remote },
        Ok(None) | Err(ProviderError::NotFound { .. }) => Observed::Gone,
        Err(e) => Observed::Failed(e),
    }
}

fn reconcile_unknown(
    ctx: &mut GraphContext<'_>,
    mut record: StateRecord,
    observed: Observed,
    report: &mut RefreshReport,
) {
    let id = record.id.clone();
    match observed {
        Observed::Found { remote_id, remote } => {
            log::info!("{id}: adopting remote object {remote_id} after interrupted action");
            record.remote_id = Some(remote_id);
            record.attributes = remote.attributes;
            record.outputs = remote.outputs;
            record.status = RecordStatus::Applied;
            record.touch();
            ctx.state.insert(id.clone(), record);
            report.adopted.push(id);
        }
        Observed::Gone => drop_record(ctx, record, report),
        Observed::Failed(e) => {
            log::warn!("{id}: state unknown and could not be read: {e}");
            ctx.conflicts.insert(
                id.clone(),
                ConflictError {
                    id,
                    message: format!("state unknown after interrupted action, read failed: {e}"),
                },
            );
        }
    }
}

fn compare_applied(
    ctx: &mut GraphContext<'_>,
    mut record: StateRecord,
    observed: Observed,
    opts: &PlanOptions,
    report: &mut RefreshReport,
) {
    let id = record.id.clone();
    let remote = match observed {
        Observed::Found { remote, .. } => remote,
        Observed::Gone if opts.accept_drift => {
            log::info!("{id}: remote object is gone, dropping record");
            drop_record(ctx, record, report);
            return;
        }
        Observed::Gone => {
            conflict(ctx, &id, "remote object was deleted outside converge".to_string());
            return;
        }
        Observed::Failed(e) => {
            conflict(ctx, &id, format!("could not read remote object: {e}"));
            return;
        }
    };

    let RemoteObject {
        attributes,
        outputs,
    } = remote;
    let drifted = drift_summary(&record.attributes, &attributes);

    if !drifted.is_empty() && !opts.accept_drift {
        conflict(ctx, &id, format!("changed outside converge: {}", drifted.join(", ")));
        return;
    }

    if drifted.is_empty() && outputs == record.outputs {
        return;
    }

    if !drifted.is_empty() {
        log::info!("{id}: accepting drift in {}", drifted.join(", "));
        report.accepted.push(id.clone());
    }
    record.attributes = attributes;
    record.outputs = outputs;
    record.touch();
    ctx.state.insert(id, record);
}

/// Describe every recorded attribute whose remote value differs
fn drift_summary(recorded: &Attributes, remote: &Attributes) -> Vec<String> {
    recorded
        .iter()
        .filter_map(|(name, old)| match remote.get(name) {
            Some(new) if new == old => None,
            Some(new) => Some(format!("{name} ({old} -> {new})")),
            None => Some(format!("{name} ({old} -> unset)")),
        })
        .collect()
}

fn conflict(ctx: &mut GraphContext<'_>, id: &ResourceId, message: String) {
    log::warn!("{id}: {message}");
    ctx.conflicts.insert(
        id.clone(),
        ConflictError {
            id: id.clone(),
            message,
        },
    );
}

/// Forget a vanished object; keep a placeholder while old objects await deletion
fn drop_record(ctx: &mut GraphContext<'_>, mut record: StateRecord, report: &mut RefreshReport) {
    let id = record.id.clone();
    if record.deposed.is_empty() {
        ctx.state.remove(&id);
    } else {
        record.remote_id = None;
        record.status = RecordStatus::Applied;
        record.touch();
        ctx.state.insert(id.clone(), record);
    }
    report.removed.push(id);
}

/// Write every record that differs between `before` and `after`, and
/// remove the ones that are gone
pub fn persist(
    before: &StateSnapshot,
    after: &StateSnapshot,
    store: &mut dyn StateStore,
) -> std::result::Result<(), StateError> {
    for id in before.keys().filter(|id| !after.contains_key(*id)) {
        store.remove(id)?;
    }
    for (id, record) in after {
        if before.get(id) != Some(record) {
            store.put(record)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceGraph;
    use crate::kinds::KindRegistry;
    use crate::provider::MemoryProvider;
    use crate::state::MemoryStateStore;
    use crate::types::Value;

    fn setup(provider: &Arc<MemoryProvider>, name: &str, size: i64) -> StateRecord {
        let id = ResourceId::new("bucket", name);
        let attrs = Attributes::from([("size".to_string(), Value::from(size))]);
        let created = provider.create(&id, &attrs).unwrap();
        StateRecord::new(id, Some(created.remote_id), attrs, created.outputs, vec![])
    }

    fn run(
        record: StateRecord,
        provider: &Arc<MemoryProvider>,
        opts: &PlanOptions,
    ) -> (RefreshReport, MemoryStateStore, Vec<ResourceId>) {
        let graph = ResourceGraph::empty();
        let kinds = KindRegistry::new();
        let mut store = MemoryStateStore::new();
        store.put(&record).unwrap();
        let before = store.load().unwrap();
        let mut ctx = GraphContext::new(&graph, &kinds, before.clone());
        let registry = ProviderRegistry::single(provider.clone());

        let report = refresh(&mut ctx, &registry, opts).unwrap();
        persist(&before, &ctx.state, &mut store).unwrap();
        let conflicts = ctx.conflicts.keys().cloned().collect();
        (report, store, conflicts)
    }

    #[test]
    fn test_applied_records_not_read_by_default() {
        let provider = Arc::new(MemoryProvider::new());
        let record = setup(&provider, "a", 1);
        provider.reset_counters();

        let (report, _, _) = run(record, &provider, &PlanOptions::default());
        assert_eq!(report.read, 0);
        assert_eq!(provider.total_calls(), 0);
    }

    #[test]
    fn test_unknown_create_is_adopted_via_lookup() {
        let provider = Arc::new(MemoryProvider::new());
        let mut record = setup(&provider, "a", 1);
        let remote_id = record.remote_id.take().unwrap();
        record.outputs.clear();
        record.status = RecordStatus::Unknown;

        let (report, store, _) = run(record.clone(), &provider, &PlanOptions::default());
        assert_eq!(report.adopted, vec![record.id.clone()]);
        let saved = store.get(&record.id).unwrap();
        assert_eq!(saved.remote_id.as_deref(), Some(remote_id.as_str()));
        assert_eq!(saved.status, RecordStatus::Applied);
        assert_eq!(saved.attributes["size"], Value::from(1));
        assert!(saved.outputs.contains_key("self_link"));
    }

    #[test]
    fn test_unknown_create_that_never_happened_is_dropped() {
        let provider = Arc::new(MemoryProvider::new());
        let mut record = StateRecord::new(
            ResourceId::new("bucket", "ghost"),
            None,
            Attributes::new(),
            Attributes::new(),
            vec![],
        );
        record.status = RecordStatus::Unknown;

        let (report, store, _) = run(record.clone(), &provider, &PlanOptions::default());
        assert_eq!(report.removed, vec![record.id.clone()]);
        assert!(store.get(&record.id).is_none());
    }

    #[test]
    fn test_drift_is_conflict_unless_accepted() {
        let provider = Arc::new(MemoryProvider::new());
        let record = setup(&provider, "a", 1);
        let remote_id = record.remote_id.clone().unwrap();
        provider.drift(&remote_id, "size", Value::from(5));

        let opts = PlanOptions {
            refresh: true,
            ..Default::default()
        };
        let (report, store, conflicts) = run(record.clone(), &provider, &opts);
        assert_eq!(conflicts, vec![record.id.clone()]);
        assert_eq!(report.conflicts, vec![record.id.clone()]);
        assert_eq!(store.get(&record.id).unwrap().attributes["size"], Value::from(1));

        let opts = PlanOptions {
            refresh: true,
            accept_drift: true,
            ..Default::default()
        };
        let (report, store, conflicts) = run(record.clone(), &provider, &opts);
        assert!(conflicts.is_empty());
        assert_eq!(report.accepted, vec![record.id.clone()]);
        assert_eq!(store.get(&record.id).unwrap().attributes["size"], Value::from(5));
    }

    #[test]
    fn test_vanished_object_is_conflict() {
        let provider = Arc::new(MemoryProvider::new());
        let record = setup(&provider, "a", 1);
        provider.forget(record.remote_id.as_deref().unwrap());

        let opts = PlanOptions {
            refresh: true,
            ..Default::default()
        };
        let (_, store, conflicts) = run(record.clone(), &provider, &opts);
        assert_eq!(conflicts, vec![record.id.clone()]);
        assert!(store.get(&record.id).is_some());
    }

    #[test]
    fn test_unchanged_remote_writes_nothing() {
        let provider = Arc::new(MemoryProvider::new());
        let record = setup(&provider, "a", 1);

        let opts = PlanOptions {
            refresh: true,
            ..Default::default()
        };
        let (report, store, conflicts) = run(record, &provider, &opts);
        assert_eq!(report.read, 1);
        assert!(conflicts.is_empty());
        // Only the initial put from the test setup
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_input_named_like_output_is_not_drift() {
        let provider = Arc::new(MemoryProvider::new());
        let id = ResourceId::new("bucket", "a");
        // The memory provider computes an `id` output too
        let attrs = Attributes::from([("id".to_string(), Value::from("chosen-by-user"))]);
        let created = provider.create(&id, &attrs).unwrap();
        assert_ne!(created.outputs["id"], Value::from("chosen-by-user"));
        let record = StateRecord::new(id.clone(), Some(created.remote_id), attrs, created.outputs, vec![]);

        let opts = PlanOptions {
            refresh: true,
            ..Default::default()
        };
        let (report, store, conflicts) = run(record, &provider, &opts);
        assert!(conflicts.is_empty());
        assert!(report.is_clean());
        assert_eq!(store.get(&id).unwrap().attributes["id"], Value::from("chosen-by-user"));
        assert_eq!(store.writes(), 1);
    }
}
