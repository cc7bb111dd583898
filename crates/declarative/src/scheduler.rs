//! Execution scheduler - runs plan steps on a bounded worker pool
//!
//! The calling thread coordinates: it owns the state store and the
//! [`GraphContext`], dispatches ready steps to a rayon pool and applies
//! results as they arrive over a channel. Workers only ever talk to
//! providers. A step becomes ready once every step it waits on succeeded;
//! when one fails, everything downstream of it is blocked instead.
//!
//! A step's timeout starts when a worker picks it up. A call that timed out
//! keeps its worker busy until it returns, so it still counts against the
//! job limit and nothing new is queued behind it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use crate::context::{CancellationToken, GraphContext, ProgressCallback};
use crate::diff::{ActionKind, AttributeDiff, Lookup, classify, known_attributes, resolve_attributes};
use crate::error::{Error, ProviderError, Result, StateError};
use crate::planner::{Plan, StepOp};
use crate::provider::{Created, Provider, ProviderRegistry, ProviderResult};
use crate::retry::with_retry;
use crate::state::{RecordStatus, StateRecord, StateSnapshot, StateStore};
use crate::types::{
    Attributes, ExecuteOptions, ExecuteSummary, NodeOutcome, Reference, ResourceId, RetryConfig,
};

/// Outcome of a run, one entry per planned node in plan order
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: Vec<(ResourceId, NodeOutcome)>,
    pub summary: ExecuteSummary,
}

impl RunReport {
    pub fn outcome(&self, id: &ResourceId) -> Option<&NodeOutcome> {
        self.outcomes
            .iter()
            .find(|(node, _)| node == id)
            .map(|(_, outcome)| outcome)
    }

    pub fn is_success(&self) -> bool {
        self.summary.is_success()
    }
}

/// Provider call handed to a worker
#[derive(Debug, Clone)]
enum Work {
    Create {
        attributes: Attributes,
    },
    /// Create the new object; the old one is deposed for later deletion
    Replace {
        attributes: Attributes,
        old: String,
    },
    Update {
        remote_id: String,
        changes: Vec<AttributeDiff>,
        attributes: Attributes,
    },
    Delete {
        remote_id: String,
    },
    DeleteDeposed {
        remote_id: String,
    },
}

/// Successful provider call, carrying what the state update needs
enum Done {
    Created {
        attributes: Attributes,
        created: Created,
    },
    Replaced {
        attributes: Attributes,
        old: String,
        created: Created,
    },
    Updated {
        remote_id: String,
        attributes: Attributes,
        outputs: Attributes,
    },
    Deleted,
    DeletedDeposed {
        remote_id: String,
    },
}

impl Work {
    fn run(
        self,
        id: &ResourceId,
        provider: &dyn Provider,
        retry: &RetryConfig,
        deadline: Instant,
    ) -> ProviderResult<Done> {
        let label = id.to_string();
        let deadline = Some(deadline);

        match self {
            Work::Create { attributes } => {
                let created = with_retry(retry, &label, deadline, || provider.create(id, &attributes))?;
                Ok(Done::Created {
                    attributes,
                    created,
                })
            }
            Work::Replace { attributes, old } => {
                let created = with_retry(retry, &label, deadline, || provider.create(id, &attributes))?;
                Ok(Done::Replaced {
                    attributes,
                    old,
                    created,
                })
            }
            Work::Update {
                remote_id,
                changes,
                attributes,
            } => {
                let outputs = with_retry(retry, &label, deadline, || {
                    provider.update(&remote_id, &changes, &attributes)
                })?;
                Ok(Done::Updated {
                    remote_id,
                    attributes,
                    outputs,
                })
            }
            Work::Delete { remote_id } => {
                delete(provider, &remote_id, retry, &label, deadline)?;
                Ok(Done::Deleted)
            }
            Work::DeleteDeposed { remote_id } => {
                delete(provider, &remote_id, retry, &label, deadline)?;
                Ok(Done::DeletedDeposed { remote_id })
            }
        }
    }
}

/// Delete, treating an already missing object as success
fn delete(
    provider: &dyn Provider,
    remote_id: &str,
    retry: &RetryConfig,
    label: &str,
    deadline: Option<Instant>,
) -> ProviderResult<()> {
    match with_retry(retry, label, deadline, || provider.delete(remote_id)) {
        Err(ProviderError::NotFound { .. }) => {
            log::debug!("{label}: {remote_id} already gone");
            Ok(())
        }
        other => other,
    }
}

enum Prepared {
    /// Finished without a provider call
    Done(NodeOutcome),
    Call(Work),
}

struct InFlight {
    /// Set once a worker has started the call
    deadline: Option<Instant>,
    timeout: Duration,
    work: Work,
}

/// Worker to coordinator messages
enum Message {
    Started { step: usize, deadline: Instant },
    Finished { step: usize, result: ProviderResult<Done> },
    /// Picked up after cancellation; no provider call was made
    Skipped { step: usize },
}

/// Execute a plan.
///
/// Node-level failures are reported in the returned [`RunReport`]. Only a
/// missing provider or a failing state store aborts the run with an error.
pub fn execute(
    plan: &Plan,
    ctx: &mut GraphContext<'_>,
    providers: &ProviderRegistry,
    store: &mut dyn StateStore,
    opts: &ExecuteOptions,
    progress: &mut dyn ProgressCallback,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    for step in &plan.steps {
        providers.require(&step.id.kind)?;
    }

    let jobs = opts.jobs.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .thread_name(|i| format!("converge-worker-{i}"))
        .build()
        .map_err(|e| Error::Pool(e.to_string()))?;

    let mut run = Run::new(plan, ctx, providers, store, progress, opts);
    run.progress.on_run_start(plan.steps.len());

    let (tx, rx) = mpsc::channel::<Message>();
    pool.in_place_scope(|scope| run.drive(scope, &tx, &rx, cancel, jobs));

    run.into_report()
}

struct Run<'a, 'g> {
    plan: &'a Plan,
    ctx: &'a mut GraphContext<'g>,
    providers: &'a ProviderRegistry,
    store: &'a mut dyn StateStore,
    progress: &'a mut dyn ProgressCallback,
    opts: &'a ExecuteOptions,
    /// Unfinished prerequisites per step
    remaining: Vec<usize>,
    /// Steps waiting on each step
    dependents: Vec<Vec<usize>>,
    outcomes: Vec<Option<NodeOutcome>>,
    ready: BTreeSet<usize>,
    fatal: Option<Error>,
}

impl<'a, 'g> Run<'a, 'g> {
    fn new(
        plan: &'a Plan,
        ctx: &'a mut GraphContext<'g>,
        providers: &'a ProviderRegistry,
        store: &'a mut dyn StateStore,
        progress: &'a mut dyn ProgressCallback,
        opts: &'a ExecuteOptions,
    ) -> Self {
        let n = plan.steps.len();
        let mut dependents = vec![Vec::new(); n];
        for (i, step) in plan.steps.iter().enumerate() {
            for &d in &step.after {
                dependents[d].push(i);
            }
        }
        let remaining: Vec<usize> = plan.steps.iter().map(|s| s.after.len()).collect();
        let ready = (0..n).filter(|&i| remaining[i] == 0).collect();

        Self {
            plan,
            ctx,
            providers,
            store,
            progress,
            opts,
            remaining,
            dependents,
            outcomes: vec![None; n],
            ready,
            fatal: None,
        }
    }

    fn drive<'s>(
        &mut self,
        scope: &rayon::Scope<'s>,
        tx: &Sender<Message>,
        rx: &Receiver<Message>,
        cancel: &CancellationToken,
        jobs: usize,
    ) {
        let plan = self.plan;
        let mut in_flight: HashMap<usize, InFlight> = HashMap::new();
        // Timed out but still occupying a worker
        let mut abandoned: HashSet<usize> = HashSet::new();

        loop {
            while in_flight.len() + abandoned.len() < jobs
                && self.fatal.is_none()
                && !cancel.is_cancelled()
            {
                let Some(i) = self.ready.pop_first() else {
                    break;
                };
                let work = match self.prepare(i) {
                    Prepared::Done(outcome) => {
                        self.complete(i, outcome);
                        continue;
                    }
                    Prepared::Call(work) => work,
                };

                let step = &plan.steps[i];
                let provider = match self.providers.require(&step.id.kind) {
                    Ok(provider) => provider,
                    Err(e) => {
                        self.complete(i, NodeOutcome::Failed { error: e.to_string() });
                        continue;
                    }
                };
                let timeout = self.ctx.kinds.timeout_for(&step.id.kind, self.opts.timeout);
                let task = Task {
                    step: i,
                    id: step.id.clone(),
                    work: work.clone(),
                    provider,
                    retry: self.ctx.kinds.retry_for(&step.id.kind),
                    timeout,
                };

                log::debug!("{}: dispatching {:?}", step.id, step.op);
                task.spawn(scope, tx.clone(), cancel.clone());
                in_flight.insert(
                    i,
                    InFlight {
                        deadline: None,
                        timeout,
                        work,
                    },
                );
            }

            let can_dispatch =
                !self.ready.is_empty() && self.fatal.is_none() && !cancel.is_cancelled();
            if in_flight.is_empty() && (abandoned.is_empty() || !can_dispatch) {
                break;
            }

            // Only started calls have a deadline; otherwise wait for the next message
            let next = in_flight.values().filter_map(|f| f.deadline).min();
            let message = match next {
                Some(deadline) => {
                    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match message {
                Ok(Message::Started { step, deadline }) => {
                    if let Some(flight) = in_flight.get_mut(&step) {
                        flight.deadline = Some(deadline);
                        self.progress.on_step_start(&plan.steps[step].id, &plan.steps[step].op);
                    }
                }
                Ok(Message::Finished { step, result }) => {
                    if in_flight.remove(&step).is_some() {
                        self.record_result(step, result);
                    } else if abandoned.remove(&step) {
                        log::warn!(
                            "{}: finished after timing out, result ignored",
                            plan.steps[step].id
                        );
                    }
                }
                Ok(Message::Skipped { step }) => {
                    in_flight.remove(&step);
                    log::debug!("{}: not started, run was cancelled", plan.steps[step].id);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let mut expired: Vec<usize> = in_flight
                        .iter()
                        .filter(|(_, f)| f.deadline.is_some_and(|d| d <= now))
                        .map(|(&i, _)| i)
                        .collect();
                    expired.sort_unstable();
                    for i in expired {
                        if let Some(flight) = in_flight.remove(&i) {
                            abandoned.insert(i);
                            self.record_timeout(i, flight);
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if cancel.is_cancelled() {
            log::warn!("Run cancelled, remaining steps were not started");
        }
        if !abandoned.is_empty() {
            log::debug!("Waiting for {} timed out call(s) to return", abandoned.len());
        }
    }

    fn prepare(&mut self, i: usize) -> Prepared {
        let plan = self.plan;
        let step = &plan.steps[i];
        let id = &step.id;

        if let Some(conflict) = self.ctx.conflicts.get(id) {
            return Prepared::Done(NodeOutcome::Conflict {
                message: conflict.message.clone(),
            });
        }

        match &step.op {
            StepOp::Apply => self.prepare_apply(id),
            StepOp::Delete => self.prepare_delete(id),
            StepOp::DeleteDeposed { remote_id } => {
                let pending = self
                    .ctx
                    .state
                    .get(id)
                    .is_some_and(|r| r.deposed.contains(remote_id));
                if pending {
                    Prepared::Call(Work::DeleteDeposed {
                        remote_id: remote_id.clone(),
                    })
                } else {
                    Prepared::Done(NodeOutcome::NoChange)
                }
            }
        }
    }

    /// Re-diff against live state; producers have finished by now
    fn prepare_apply(&mut self, id: &ResourceId) -> Prepared {
        let graph = self.ctx.graph;
        let Some(node) = graph.node(id) else {
            return Prepared::Done(NodeOutcome::Failed {
                error: format!("{id} is not part of the configuration"),
            });
        };

        let state = &self.ctx.state;
        let resolved = match resolve_attributes(&node.attributes, |r| live_lookup(state, r)) {
            Ok(resolved) => resolved,
            Err((attribute, reference)) => {
                return Prepared::Done(NodeOutcome::Failed {
                    error: format!("{attribute}: cannot resolve {reference}"),
                });
            }
        };
        let Some(attributes) = known_attributes(&resolved) else {
            return Prepared::Done(NodeOutcome::Failed {
                error: "attributes still unresolved".to_string(),
            });
        };

        let record = state.get(id);
        let remote_id = record.and_then(|r| r.remote_id.clone());
        let (kind, changes) = classify(Some(&resolved), record, self.ctx.kinds.get(&id.kind));

        match (kind, remote_id) {
            (ActionKind::Create, _) => Prepared::Call(Work::Create { attributes }),
            (ActionKind::Update, Some(remote_id)) => Prepared::Call(Work::Update {
                remote_id,
                changes,
                attributes,
            }),
            (ActionKind::Replace, Some(old)) => Prepared::Call(Work::Replace { attributes, old }),
            (ActionKind::NoOp, _) => {
                self.sync_dependencies(id);
                Prepared::Done(NodeOutcome::NoChange)
            }
            _ => Prepared::Done(NodeOutcome::Failed {
                error: format!("unexpected {kind} for a configured resource"),
            }),
        }
    }

    fn prepare_delete(&mut self, id: &ResourceId) -> Prepared {
        let Some(record) = self.ctx.state.get(id) else {
            return Prepared::Done(NodeOutcome::NoChange);
        };

        match &record.remote_id {
            Some(remote_id) => Prepared::Call(Work::Delete {
                remote_id: remote_id.clone(),
            }),
            None => {
                // Nothing remote; deposed objects keep the record alive
                if record.deposed.is_empty()
                    && let Err(e) = self.forget(id)
                {
                    self.fail_store(e);
                }
                Prepared::Done(NodeOutcome::Deleted)
            }
        }
    }

    /// Keep recorded dependencies current even when nothing else changes
    fn sync_dependencies(&mut self, id: &ResourceId) {
        let dependencies = self.current_dependencies(id);
        let Some(record) = self.ctx.state.get(id) else {
            return;
        };
        if record.dependencies == dependencies {
            return;
        }

        let mut record = record.clone();
        record.dependencies = dependencies;
        if let Err(e) = self.save(record) {
            self.fail_store(e);
        }
    }

    fn record_result(&mut self, i: usize, result: ProviderResult<Done>) {
        let id = self.plan.steps[i].id.clone();
        let outcome = match result {
            Ok(done) => match self.apply_done(&id, done) {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = e.to_string();
                    self.fail_store(e);
                    NodeOutcome::Failed { error }
                }
            },
            Err(e) => {
                log::error!("{id}: {}: {e}", e.category().description());
                NodeOutcome::Failed { error: e.to_string() }
            }
        };
        self.complete(i, outcome);
    }

    /// Persist the effect of a successful provider call
    fn apply_done(&mut self, id: &ResourceId, done: Done) -> std::result::Result<NodeOutcome, StateError> {
        let dependencies = self.current_dependencies(id);
        let deposed = self
            .ctx
            .state
            .get(id)
            .map(|r| r.deposed.clone())
            .unwrap_or_default();

        match done {
            Done::Created {
                attributes,
                created,
            } => {
                let mut record = StateRecord::new(
                    id.clone(),
                    Some(created.remote_id),
                    attributes,
                    created.outputs,
                    dependencies,
                );
                record.deposed = deposed;
                self.save(record)?;
                log::info!("{id}: created");
                Ok(NodeOutcome::Created)
            }
            Done::Replaced {
                attributes,
                old,
                created,
            } => {
                let mut record = StateRecord::new(
                    id.clone(),
                    Some(created.remote_id),
                    attributes,
                    created.outputs,
                    dependencies,
                );
                record.deposed = deposed;
                record.deposed.push(old);
                self.save(record)?;
                log::info!("{id}: replaced");
                Ok(NodeOutcome::Replaced)
            }
            Done::Updated {
                remote_id,
                attributes,
                outputs,
            } => {
                let mut record =
                    StateRecord::new(id.clone(), Some(remote_id), attributes, outputs, dependencies);
                record.deposed = deposed;
                self.save(record)?;
                log::info!("{id}: updated");
                Ok(NodeOutcome::Updated)
            }
            Done::Deleted => {
                match self.ctx.state.get(id).cloned() {
                    Some(mut record) if !record.deposed.is_empty() => {
                        record.remote_id = None;
                        record.status = RecordStatus::Applied;
                        record.touch();
                        self.save(record)?;
                    }
                    Some(_) => self.forget(id)?,
                    None => {}
                }
                log::info!("{id}: deleted");
                Ok(NodeOutcome::Deleted)
            }
            Done::DeletedDeposed { remote_id } => {
                if let Some(mut record) = self.ctx.state.get(id).cloned() {
                    record.deposed.retain(|d| d != &remote_id);
                    let orphan = record.remote_id.is_none()
                        && record.deposed.is_empty()
                        && !self.ctx.graph.contains(id);
                    if orphan {
                        self.forget(id)?;
                    } else {
                        record.touch();
                        self.save(record)?;
                    }
                }
                log::info!("{id}: deleted old object {remote_id}");
                Ok(NodeOutcome::Deleted)
            }
        }
    }

    /// The call didn't report back in time: mark what might have happened
    fn record_timeout(&mut self, i: usize, flight: InFlight) {
        let id = self.plan.steps[i].id.clone();
        log::warn!(
            "{id}: no response after {:.1}s, remote state is now unknown",
            flight.timeout.as_secs_f64()
        );

        let dependencies = self.current_dependencies(&id);
        let existing = self.ctx.state.get(&id).cloned();
        let deposed = existing
            .as_ref()
            .map(|r| r.deposed.clone())
            .unwrap_or_default();

        let record = match flight.work {
            Work::Create { attributes } => {
                let mut record =
                    StateRecord::new(id.clone(), None, attributes, Attributes::new(), dependencies);
                record.deposed = deposed;
                Some(record)
            }
            Work::Replace { attributes, old } => {
                let mut record =
                    StateRecord::new(id.clone(), None, attributes, Attributes::new(), dependencies);
                record.deposed = deposed;
                record.deposed.push(old);
                Some(record)
            }
            Work::Update {
                remote_id,
                attributes,
                ..
            } => {
                let outputs = existing.map(|r| r.outputs).unwrap_or_default();
                let mut record =
                    StateRecord::new(id.clone(), Some(remote_id), attributes, outputs, dependencies);
                record.deposed = deposed;
                Some(record)
            }
            Work::Delete { .. } => existing,
            // The old object stays deposed and is retried next run
            Work::DeleteDeposed { .. } => None,
        };

        if let Some(mut record) = record {
            record.status = RecordStatus::Unknown;
            record.touch();
            if let Err(e) = self.save(record) {
                self.fail_store(e);
            }
        }

        self.complete(i, NodeOutcome::TimedOut);
    }

    /// Record a step's outcome and release or block its dependents
    fn complete(&mut self, i: usize, outcome: NodeOutcome) {
        let plan = self.plan;
        self.progress.on_step_complete(&plan.steps[i].id, &outcome);

        let cause = match &outcome {
            NodeOutcome::Blocked { cause } => Some(cause.clone()),
            o if !o.is_success() => Some(plan.steps[i].id.clone()),
            _ => None,
        };
        self.outcomes[i] = Some(outcome);

        match cause {
            Some(cause) => self.block_dependents(i, cause),
            None => {
                for &d in &self.dependents[i] {
                    self.remaining[d] -= 1;
                    if self.remaining[d] == 0 && self.outcomes[d].is_none() {
                        self.ready.insert(d);
                    }
                }
            }
        }
    }

    fn block_dependents(&mut self, i: usize, cause: ResourceId) {
        let plan = self.plan;
        let mut stack = self.dependents[i].clone();

        while let Some(d) = stack.pop() {
            if self.outcomes[d].is_some() {
                continue;
            }
            log::warn!("{}: blocked by {cause}", plan.steps[d].id);
            let outcome = NodeOutcome::Blocked {
                cause: cause.clone(),
            };
            self.progress.on_step_complete(&plan.steps[d].id, &outcome);
            self.outcomes[d] = Some(outcome);
            self.ready.remove(&d);
            stack.extend(self.dependents[d].iter().copied());
        }
    }

    fn current_dependencies(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.ctx
            .graph
            .dependencies(id)
            .into_iter()
            .cloned()
            .collect()
    }

    fn save(&mut self, record: StateRecord) -> std::result::Result<(), StateError> {
        self.store.put(&record)?;
        self.ctx.state.insert(record.id.clone(), record);
        Ok(())
    }

    fn forget(&mut self, id: &ResourceId) -> std::result::Result<(), StateError> {
        self.store.remove(id)?;
        self.ctx.state.remove(id);
        Ok(())
    }

    /// State can no longer be trusted: stop dispatching
    fn fail_store(&mut self, e: StateError) {
        log::error!("State store write failed, stopping: {e}");
        if self.fatal.is_none() {
            self.fatal = Some(Error::State(e));
        }
    }

    fn into_report(mut self) -> Result<RunReport> {
        let plan = self.plan;
        for (i, step) in plan.steps.iter().enumerate() {
            if self.outcomes[i].is_none() {
                self.progress.on_step_complete(&step.id, &NodeOutcome::Cancelled);
                self.outcomes[i] = Some(NodeOutcome::Cancelled);
            }
        }

        if let Some(e) = self.fatal.take() {
            return Err(e);
        }

        let mut by_node: HashMap<&ResourceId, Vec<usize>> = HashMap::new();
        for (i, step) in plan.steps.iter().enumerate() {
            by_node.entry(&step.id).or_default().push(i);
        }

        let mut report = RunReport::default();
        for action in &plan.actions {
            let steps = by_node.get(&action.id).map(Vec::as_slice).unwrap_or_default();
            let mut outcomes = steps.iter().filter_map(|&i| self.outcomes[i].clone());
            let Some(primary) = outcomes.next() else {
                continue;
            };
            // A failed cleanup of an old object outranks the primary success
            let outcome = if primary.is_success() {
                outcomes.find(|o| !o.is_success()).unwrap_or(primary)
            } else {
                primary
            };
            report.summary.add_outcome(&outcome);
            report.outcomes.push((action.id.clone(), outcome));
        }

        self.progress.on_run_complete(&report.summary);
        Ok(report)
    }
}

/// One provider call, ready to hand to a worker
struct Task {
    step: usize,
    id: ResourceId,
    work: Work,
    provider: Arc<dyn Provider>,
    retry: RetryConfig,
    timeout: Duration,
}

impl Task {
    fn spawn<'s>(self, scope: &rayon::Scope<'s>, tx: Sender<Message>, cancel: CancellationToken) {
        scope.spawn(move |_| {
            let Task {
                step,
                id,
                work,
                provider,
                retry,
                timeout,
            } = self;

            if cancel.is_cancelled() {
                if tx.send(Message::Skipped { step }).is_err() {
                    log::debug!("{id}: run already finished");
                }
                return;
            }

            let deadline = Instant::now() + timeout;
            if tx.send(Message::Started { step, deadline }).is_err() {
                log::debug!("{id}: run already finished, not starting");
                return;
            }

            let result = work.run(&id, provider.as_ref(), &retry, deadline);
            if tx.send(Message::Finished { step, result }).is_err() {
                log::debug!("{id}: run already finished, dropping result");
            }
        });
    }
}

/// Resolve a reference against applied state
fn live_lookup(state: &StateSnapshot, reference: &Reference) -> Lookup {
    state
        .get(&reference.target)
        .filter(|r| r.exists())
        .and_then(|r| r.lookup(&reference.attribute))
        .cloned()
        .map_or(Lookup::Missing, Lookup::Value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::graph::{ResourceGraph, ResourceNode};
    use crate::kinds::{KindRegistry, KindSpec};
    use crate::planner::plan;
    use crate::provider::{MemoryProvider, Operation};
    use crate::state::MemoryStateStore;
    use crate::types::PlanOptions;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("test", name)
    }

    fn run_with(
        graph: &ResourceGraph,
        provider: &Arc<MemoryProvider>,
        store: &mut MemoryStateStore,
        jobs: usize,
        progress: &mut dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> RunReport {
        run_with_kinds(graph, &KindRegistry::new(), provider, store, jobs, progress, cancel)
    }

    fn run_with_kinds(
        graph: &ResourceGraph,
        kinds: &KindRegistry,
        provider: &Arc<MemoryProvider>,
        store: &mut MemoryStateStore,
        jobs: usize,
        progress: &mut dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> RunReport {
        let mut ctx = GraphContext::new(graph, kinds, store.load().unwrap());
        let registry = ProviderRegistry::single(provider.clone());
        let plan = plan(&ctx, &PlanOptions::default()).unwrap();
        let opts = ExecuteOptions {
            jobs,
            ..Default::default()
        };
        execute(&plan, &mut ctx, &registry, store, &opts, progress, cancel).unwrap()
    }

    fn run(graph: &ResourceGraph, provider: &Arc<MemoryProvider>, store: &mut MemoryStateStore) -> RunReport {
        run_with(graph, provider, store, 4, &mut NoProgress, &CancellationToken::new())
    }

    #[test]
    fn test_failure_blocks_only_dependents() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")),
            ResourceNode::new(id("b")).with("parent", Reference::new(id("a"), "id")),
            ResourceNode::new(id("c")),
        ])
        .unwrap();
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_on(id("a"), Operation::Create, ProviderError::Other("quota".into()));
        let mut store = MemoryStateStore::new();

        let report = run(&graph, &provider, &mut store);
        assert!(matches!(report.outcome(&id("a")), Some(NodeOutcome::Failed { .. })));
        assert_eq!(
            report.outcome(&id("b")),
            Some(&NodeOutcome::Blocked { cause: id("a") })
        );
        assert_eq!(report.outcome(&id("c")), Some(&NodeOutcome::Created));
        assert!(store.get(&id("a")).is_none());
        assert!(store.get(&id("b")).is_none());
        assert!(store.get(&id("c")).is_some());
        assert!(provider.remote_ids(&id("b")).is_empty());
    }

    #[test]
    fn test_blocked_cause_is_root_failure() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")),
            ResourceNode::new(id("b")).after(id("a")),
            ResourceNode::new(id("c")).after(id("b")),
        ])
        .unwrap();
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_on(id("a"), Operation::Create, ProviderError::Other("quota".into()));
        let mut store = MemoryStateStore::new();

        let report = run(&graph, &provider, &mut store);
        assert_eq!(
            report.outcome(&id("c")),
            Some(&NodeOutcome::Blocked { cause: id("a") })
        );
        assert_eq!(report.summary.blocked, 2);
    }

    #[test]
    fn test_worker_limit_respected() {
        let nodes = (0..8).map(|n| ResourceNode::new(id(&format!("n{n}")))).collect();
        let graph = ResourceGraph::new(nodes).unwrap();
        let provider = Arc::new(MemoryProvider::new());
        for n in 0..8 {
            provider.delay(id(&format!("n{n}")), Duration::from_millis(20));
        }
        let mut store = MemoryStateStore::new();

        let report = run_with(&graph, &provider, &mut store, 2, &mut NoProgress, &CancellationToken::new());
        assert_eq!(report.summary.created, 8);
        assert!(provider.peak_concurrency() <= 2);
    }

    #[test]
    fn test_cancelled_before_start_makes_no_calls() {
        let graph = ResourceGraph::new(vec![ResourceNode::new(id("a")), ResourceNode::new(id("b"))])
            .unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let mut store = MemoryStateStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = run_with(&graph, &provider, &mut store, 4, &mut NoProgress, &cancel);
        assert_eq!(report.summary.cancelled, 2);
        assert_eq!(provider.total_calls(), 0);
        assert_eq!(store.writes(), 0);
    }

    struct CancelAfterFirst(CancellationToken);

    impl ProgressCallback for CancelAfterFirst {
        fn on_run_start(&mut self, _steps: usize) {}
        fn on_step_start(&mut self, _id: &ResourceId, _op: &StepOp) {}
        fn on_step_complete(&mut self, _id: &ResourceId, _outcome: &NodeOutcome) {
            self.0.cancel();
        }
        fn on_run_complete(&mut self, _summary: &ExecuteSummary) {}
    }

    #[test]
    fn test_cancel_mid_run_keeps_completed_work() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")),
            ResourceNode::new(id("b")),
            ResourceNode::new(id("c")),
        ])
        .unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let mut store = MemoryStateStore::new();
        let cancel = CancellationToken::new();
        let mut progress = CancelAfterFirst(cancel.clone());

        let report = run_with(&graph, &provider, &mut store, 1, &mut progress, &cancel);
        assert_eq!(report.outcome(&id("a")), Some(&NodeOutcome::Created));
        assert_eq!(report.outcome(&id("b")), Some(&NodeOutcome::Cancelled));
        assert_eq!(report.outcome(&id("c")), Some(&NodeOutcome::Cancelled));
        assert!(store.get(&id("a")).is_some());
        assert_eq!(provider.calls(Operation::Create), 1);
    }

    #[test]
    fn test_missing_remote_on_delete_counts_as_deleted() {
        let graph = ResourceGraph::new(vec![ResourceNode::new(id("a"))]).unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let mut store = MemoryStateStore::new();
        run(&graph, &provider, &mut store);

        let remote_id = store.get(&id("a")).unwrap().remote_id.clone().unwrap();
        provider.forget(&remote_id);

        let report = run(&ResourceGraph::empty(), &provider, &mut store);
        assert_eq!(report.outcome(&id("a")), Some(&NodeOutcome::Deleted));
        assert!(store.records().is_empty());
    }

    /// `slow` kinds time out quickly, `fast` kinds have room to spare
    fn slow_and_fast() -> KindRegistry {
        let mut kinds = KindRegistry::new();
        kinds.register("slow", KindSpec::new().timeout(Duration::from_millis(50)));
        kinds.register("fast", KindSpec::new().timeout(Duration::from_millis(200)));
        kinds
    }

    #[test]
    fn test_timed_out_call_keeps_its_worker() {
        let slow = ResourceId::new("slow", "a");
        let fast = ResourceId::new("fast", "b");
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(slow.clone()),
            ResourceNode::new(fast.clone()),
        ])
        .unwrap();
        let provider = Arc::new(MemoryProvider::new());
        provider.delay(slow.clone(), Duration::from_millis(300));
        let mut store = MemoryStateStore::new();

        let report = run_with_kinds(
            &graph,
            &slow_and_fast(),
            &provider,
            &mut store,
            1,
            &mut NoProgress,
            &CancellationToken::new(),
        );
        assert_eq!(report.outcome(&slow), Some(&NodeOutcome::TimedOut));
        // Its clock only started once the slow call gave the worker back
        assert_eq!(report.outcome(&fast), Some(&NodeOutcome::Created));
        assert_eq!(store.get(&slow).unwrap().status, RecordStatus::Unknown);
        let record = store.get(&fast).unwrap();
        assert_eq!(record.status, RecordStatus::Applied);
        assert!(record.remote_id.is_some());
        assert_eq!(provider.peak_concurrency(), 1);
    }

    struct CancelOnTimeout(CancellationToken);

    impl ProgressCallback for CancelOnTimeout {
        fn on_run_start(&mut self, _steps: usize) {}
        fn on_step_start(&mut self, _id: &ResourceId, _op: &StepOp) {}
        fn on_step_complete(&mut self, _id: &ResourceId, outcome: &NodeOutcome) {
            if *outcome == NodeOutcome::TimedOut {
                self.0.cancel();
            }
        }
        fn on_run_complete(&mut self, _summary: &ExecuteSummary) {}
    }

    #[test]
    fn test_cancel_while_timed_out_call_runs_starts_nothing() {
        let slow = ResourceId::new("slow", "a");
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(slow.clone()),
            ResourceNode::new(ResourceId::new("fast", "b")),
            ResourceNode::new(ResourceId::new("fast", "c")),
        ])
        .unwrap();
        let provider = Arc::new(MemoryProvider::new());
        provider.delay(slow.clone(), Duration::from_millis(200));
        let mut store = MemoryStateStore::new();
        let cancel = CancellationToken::new();
        let mut progress = CancelOnTimeout(cancel.clone());

        let report = run_with_kinds(
            &graph,
            &slow_and_fast(),
            &provider,
            &mut store,
            1,
            &mut progress,
            &cancel,
        );
        assert_eq!(report.outcome(&slow), Some(&NodeOutcome::TimedOut));
        assert_eq!(report.summary.cancelled, 2);
        // The run waited for the slow call; nothing queued behind it ran
        assert_eq!(provider.calls(Operation::Create), 1);
        assert_eq!(provider.object_count(), 1);
        assert_eq!(store.writes(), 1);
    }
}
