//! Execution planner - turns diffs into an ordered, dependency-aware plan
//!
//! Each action expands into one or more steps. Steps get dependencies from
//! the desired graph (producers before consumers) and from recorded
//! dependencies (consumers before the producers they referenced get
//! deleted), then the resolver orders the steps.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::context::GraphContext;
use crate::diff::{Action, ActionKind, Lookup, ResolvedAttributes, Resolution, classify, resolve_attributes};
use crate::error::ValidationError;
use crate::resolver::{resolve, topological_order};
use crate::types::{PlanOptions, Reference, ResourceId};

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOp {
    /// Create, update, replace or confirm a desired node
    Apply,
    /// Delete a node that left the configuration
    Delete,
    /// Delete an old remote object left behind by a replace
    DeleteDeposed { remote_id: String },
}

/// One unit of scheduled work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub id: ResourceId,
    pub op: StepOp,
    /// Indices of steps that must complete first; always lower than this step's
    pub after: Vec<usize>,
}

/// Ordered actions (one per node) and the steps that carry them out
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub steps: Vec<Step>,
}

/// Plan summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub no_op: usize,
    pub conflicts: usize,
}

impl PlanSummary {
    pub fn total_changes(&self) -> usize {
        self.create + self.update + self.replace + self.delete
    }
}

impl Plan {
    pub fn action(&self, id: &ResourceId) -> Option<&Action> {
        self.actions.iter().find(|a| &a.id == id)
    }

    /// Whether applying the plan would touch anything
    pub fn has_changes(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.kind.is_change() || a.conflict.is_some())
            || self
                .steps
                .iter()
                .any(|s| matches!(s.op, StepOp::DeleteDeposed { .. }))
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            if action.conflict.is_some() {
                summary.conflicts += 1;
                continue;
            }
            match action.kind {
                ActionKind::Create => summary.create += 1,
                ActionKind::Update => summary.update += 1,
                ActionKind::Replace => summary.replace += 1,
                ActionKind::Delete => summary.delete += 1,
                ActionKind::NoOp => summary.no_op += 1,
            }
        }
        summary
    }
}

/// Compute the plan for a context.
///
/// Fails only with validation errors: cycles, references to attributes an
/// unchanged producer doesn't have, or cycles among steps introduced by
/// recorded dependencies.
pub fn plan(ctx: &GraphContext<'_>, opts: &PlanOptions) -> Result<Plan, ValidationError> {
    let order = resolve(ctx.graph)?;

    let mut planned: HashMap<ResourceId, (ActionKind, ResolvedAttributes)> = HashMap::new();
    let mut actions = Vec::with_capacity(order.len() + ctx.state.len());

    for id in order {
        let Some(node) = ctx.graph.node(&id) else {
            continue;
        };
        let spec = ctx.kinds.get(&id.kind);

        let resolved = resolve_attributes(&node.attributes, |r| plan_lookup(ctx, &planned, r))
            .map_err(|(attribute, reference)| ValidationError::UnknownAttribute {
                from: id.clone(),
                attribute,
                reference: reference.to_string(),
            })?;

        let (kind, changes) = classify(Some(&resolved), ctx.state.get(&id), spec);
        log::debug!("{id}: {kind} ({} attribute changes)", changes.len());

        actions.push(Action {
            conflict: ctx.conflicts.get(&id).cloned(),
            id: id.clone(),
            kind,
            changes,
        });
        planned.insert(id, (kind, resolved));
    }

    for (id, record) in &ctx.state {
        if ctx.graph.contains(id) {
            continue;
        }
        let (_, changes) = classify(None, Some(record), ctx.kinds.get(&id.kind));
        log::debug!("{id}: delete");
        actions.push(Action {
            id: id.clone(),
            kind: ActionKind::Delete,
            changes,
            conflict: ctx.conflicts.get(id).cloned(),
        });
    }

    let steps = build_steps(ctx, &actions)?;
    let mut plan = order_plan(actions, steps)?;

    if !opts.targets.is_empty() {
        plan = restrict_to_targets(plan, &opts.targets);
    }

    Ok(plan)
}

/// Current value of a reference as seen at plan time
fn plan_lookup(
    ctx: &GraphContext<'_>,
    planned: &HashMap<ResourceId, (ActionKind, ResolvedAttributes)>,
    reference: &Reference,
) -> Lookup {
    let Some((kind, resolved)) = planned.get(&reference.target) else {
        return Lookup::Missing;
    };

    if *kind == ActionKind::NoOp {
        return ctx
            .state
            .get(&reference.target)
            .and_then(|r| r.lookup(&reference.attribute))
            .cloned()
            .map_or(Lookup::Missing, Lookup::Value);
    }

    // Inputs of a changing producer are known, its outputs are not
    match resolved.get(&reference.attribute) {
        Some(Resolution::Known(v)) => Lookup::Value(v.clone()),
        _ => Lookup::Pending,
    }
}

/// Expand actions into steps with dependency indices (unordered)
fn build_steps(ctx: &GraphContext<'_>, actions: &[Action]) -> Result<Vec<Step>, ValidationError> {
    let mut steps = Vec::new();
    let mut by_node: HashMap<&ResourceId, Vec<usize>> = HashMap::new();

    for action in actions {
        let record = ctx.state.get(&action.id);
        let primary = if action.kind == ActionKind::Delete {
            StepOp::Delete
        } else {
            StepOp::Apply
        };

        let mut deposed: Vec<String> = record.map(|r| r.deposed.clone()).unwrap_or_default();
        if action.kind == ActionKind::Replace
            && let Some(remote_id) = record.and_then(|r| r.remote_id.clone())
        {
            deposed.push(remote_id);
        }

        let ops = std::iter::once(primary)
            .chain(deposed.into_iter().map(|remote_id| StepOp::DeleteDeposed { remote_id }));
        for op in ops {
            by_node.entry(&action.id).or_default().push(steps.len());
            steps.push(Step {
                id: action.id.clone(),
                op,
                after: Vec::new(),
            });
        }
    }

    // Who referenced each node when it was last applied
    let mut recorded_dependents: HashMap<&ResourceId, Vec<&ResourceId>> = HashMap::new();
    for record in ctx.state.values() {
        for dep in &record.dependencies {
            if dep != &record.id {
                recorded_dependents.entry(dep).or_default().push(&record.id);
            }
        }
    }

    let steps_of = |id: &ResourceId| by_node.get(id).cloned().unwrap_or_default();

    for i in 0..steps.len() {
        let id = steps[i].id.clone();
        let mut after = BTreeSet::new();

        match &steps[i].op {
            StepOp::Apply => {
                for producer in ctx.graph.dependencies(&id) {
                    after.extend(steps_of(producer).first().copied());
                }
            }
            StepOp::Delete => {
                for consumer in recorded_dependents.get(&id).into_iter().flatten().copied() {
                    after.extend(steps_of(consumer));
                }
            }
            StepOp::DeleteDeposed { .. } => {
                let own = steps_of(&id);
                if let Some(pos) = own.iter().position(|&s| s == i)
                    && pos > 0
                {
                    after.insert(own[pos - 1]);
                }
                let consumers = ctx
                    .graph
                    .dependents(&id)
                    .into_iter()
                    .chain(recorded_dependents.get(&id).into_iter().flatten().copied());
                // Consumers only need to have switched over to the new object
                for consumer in consumers {
                    after.extend(steps_of(consumer).first().copied());
                }
            }
        }

        after.remove(&i);
        steps[i].after = after.into_iter().collect();
    }

    Ok(steps)
}

/// Topologically order steps, remap indices, and sort actions by first step
fn order_plan(mut actions: Vec<Action>, steps: Vec<Step>) -> Result<Plan, ValidationError> {
    let deps: Vec<Vec<usize>> = steps.iter().map(|s| s.after.clone()).collect();
    let order = topological_order(&deps).map_err(|cycle| ValidationError::Cycle {
        path: cycle.into_iter().map(|i| steps[i].id.clone()).collect(),
    })?;

    let mut position = vec![0; steps.len()];
    for (new, &old) in order.iter().enumerate() {
        position[old] = new;
    }

    let mut ordered: Vec<Option<Step>> = vec![None; steps.len()];
    for (old, mut step) in steps.into_iter().enumerate() {
        step.after = step.after.iter().map(|&d| position[d]).collect();
        step.after.sort_unstable();
        ordered[position[old]] = Some(step);
    }
    let steps: Vec<Step> = ordered.into_iter().flatten().collect();

    let mut first: HashMap<&ResourceId, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        first.entry(&step.id).or_insert(i);
    }
    actions.sort_by_key(|a| first.get(&a.id).copied().unwrap_or(usize::MAX));

    Ok(Plan { actions, steps })
}

/// Keep only steps for matching nodes and the steps they wait on
fn restrict_to_targets(plan: Plan, targets: &[String]) -> Plan {
    let mut keep = vec![false; plan.steps.len()];
    let mut stack: Vec<usize> = plan
        .steps
        .iter()
        .enumerate()
        .filter(|(_, s)| targets.iter().any(|t| matches_target(&s.id, t)))
        .map(|(i, _)| i)
        .collect();

    while let Some(i) = stack.pop() {
        if !keep[i] {
            keep[i] = true;
            stack.extend(plan.steps[i].after.iter().copied());
        }
    }

    let mut position = vec![None; plan.steps.len()];
    let mut steps = Vec::new();
    for (i, step) in plan.steps.into_iter().enumerate() {
        if keep[i] {
            position[i] = Some(steps.len());
            steps.push(step);
        }
    }
    for step in &mut steps {
        step.after = step.after.iter().filter_map(|&d| position[d]).collect();
    }

    let kept: BTreeSet<&ResourceId> = steps.iter().map(|s| &s.id).collect();
    let actions = plan
        .actions
        .into_iter()
        .filter(|a| kept.contains(&a.id))
        .collect();

    Plan { actions, steps }
}

/// Parse a target string like "kind.name" into (kind, name)
fn parse_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('.') {
        Some((kind, name)) => (kind, Some(name)),
        None => (target, None),
    }
}

/// Check if a resource matches a `kind` or `kind.name` target
pub fn matches_target(id: &ResourceId, target: &str) -> bool {
    let (kind, name) = parse_target(target);
    id.kind == kind && name.is_none_or(|n| id.name == n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceGraph, ResourceNode};
    use crate::kinds::{KindRegistry, KindSpec};
    use crate::state::{StateRecord, StateSnapshot};
    use crate::types::{Attributes, Value};

    fn id(name: &str) -> ResourceId {
        ResourceId::new("test", name)
    }

    fn record(name: &str, attrs: &[(&str, Value)], deps: &[&str]) -> StateRecord {
        StateRecord::new(
            id(name),
            Some(format!("{name}-1")),
            attrs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            Attributes::from([("id".to_string(), Value::from(format!("{name}-1")))]),
            deps.iter().map(|d| id(d)).collect(),
        )
    }

    fn snapshot(records: Vec<StateRecord>) -> StateSnapshot {
        records.into_iter().map(|r| (r.id.clone(), r)).collect()
    }

    fn ops(plan: &Plan) -> Vec<(String, StepOp)> {
        plan.steps
            .iter()
            .map(|s| (s.id.name.clone(), s.op.clone()))
            .collect()
    }

    #[test]
    fn test_fresh_graph_creates_in_dependency_order() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("b")).with("parent", Reference::new(id("a"), "id")),
            ResourceNode::new(id("a")).with("size", 1),
        ])
        .unwrap();
        let kinds = KindRegistry::new();
        let ctx = GraphContext::new(&graph, &kinds, StateSnapshot::new());

        let plan = plan(&ctx, &PlanOptions::default()).unwrap();
        let kinds: Vec<_> = plan.actions.iter().map(|a| (a.id.name.as_str(), a.kind)).collect();
        assert_eq!(kinds, vec![("a", ActionKind::Create), ("b", ActionKind::Create)]);
        assert_eq!(plan.steps[1].after, vec![0]);
    }

    #[test]
    fn test_only_changed_literal_updates() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")).with("size", 1),
            ResourceNode::new(id("b"))
                .with("parent", Reference::new(id("a"), "id"))
                .with("label", "new"),
        ])
        .unwrap();
        let kinds = KindRegistry::new();
        let state = snapshot(vec![
            record("a", &[("size", Value::from(1))], &[]),
            record(
                "b",
                &[("parent", Value::from("a-1")), ("label", Value::from("old"))],
                &["a"],
            ),
        ]);
        let ctx = GraphContext::new(&graph, &kinds, state);

        let plan = plan(&ctx, &PlanOptions::default()).unwrap();
        assert_eq!(plan.action(&id("a")).unwrap().kind, ActionKind::NoOp);
        let b = plan.action(&id("b")).unwrap();
        assert_eq!(b.kind, ActionKind::Update);
        assert_eq!(b.changes.len(), 1);
        assert_eq!(b.changes[0].attribute, "label");
    }

    #[test]
    fn test_producer_output_change_is_pending_for_consumer() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")).with("size", 2),
            ResourceNode::new(id("b"))
                .with("parent", Reference::new(id("a"), "id"))
                .with("size_copy", Reference::new(id("a"), "size")),
        ])
        .unwrap();
        let kinds = KindRegistry::new();
        let state = snapshot(vec![
            record("a", &[("size", Value::from(1))], &[]),
            record(
                "b",
                &[("parent", Value::from("a-1")), ("size_copy", Value::from(1))],
                &["a"],
            ),
        ]);
        let ctx = GraphContext::new(&graph, &kinds, state);

        let plan = plan(&ctx, &PlanOptions::default()).unwrap();
        let b = plan.action(&id("b")).unwrap();
        assert_eq!(b.kind, ActionKind::Update);
        // Input of the producer is known, its output is not
        assert!(b.changes.iter().any(|c| c.attribute == "size_copy"
            && matches!(c.change, crate::diff::Change::Modified { .. })));
        assert!(b.changes.iter().any(|c| c.attribute == "parent"
            && matches!(c.change, crate::diff::Change::Pending { .. })));
    }

    #[test]
    fn test_deletes_run_consumers_first() {
        let graph = ResourceGraph::empty();
        let kinds = KindRegistry::new();
        let state = snapshot(vec![
            record("a", &[], &[]),
            record("b", &[("parent", Value::from("a-1"))], &["a"]),
            record("c", &[("parent", Value::from("b-1"))], &["b"]),
        ]);
        let ctx = GraphContext::new(&graph, &kinds, state);

        let plan = plan(&ctx, &PlanOptions::default()).unwrap();
        assert_eq!(
            ops(&plan),
            vec![
                ("c".into(), StepOp::Delete),
                ("b".into(), StepOp::Delete),
                ("a".into(), StepOp::Delete),
            ]
        );
    }

    #[test]
    fn test_delete_waits_for_consumer_update() {
        // b stops referencing a, then a is deleted
        let graph = ResourceGraph::new(vec![ResourceNode::new(id("b")).with("parent", "static")])
            .unwrap();
        let kinds = KindRegistry::new();
        let state = snapshot(vec![
            record("a", &[], &[]),
            record("b", &[("parent", Value::from("a-1"))], &["a"]),
        ]);
        let ctx = GraphContext::new(&graph, &kinds, state);

        let plan = plan(&ctx, &PlanOptions::default()).unwrap();
        assert_eq!(
            ops(&plan),
            vec![("b".into(), StepOp::Apply), ("a".into(), StepOp::Delete)]
        );
        assert_eq!(plan.steps[1].after, vec![0]);
    }

    #[test]
    fn test_replace_deletes_old_after_dependents() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")).with("location", "us"),
            ResourceNode::new(id("b")).with("parent", Reference::new(id("a"), "id")),
        ])
        .unwrap();
        let mut kinds = KindRegistry::new();
        kinds.register("test", KindSpec::new().immutable(["location"]));
        let state = snapshot(vec![
            record("a", &[("location", Value::from("eu"))], &[]),
            record("b", &[("parent", Value::from("a-1"))], &["a"]),
        ]);
        let ctx = GraphContext::new(&graph, &kinds, state);

        let plan = plan(&ctx, &PlanOptions::default()).unwrap();
        assert_eq!(plan.action(&id("a")).unwrap().kind, ActionKind::Replace);
        assert_eq!(
            ops(&plan),
            vec![
                ("a".into(), StepOp::Apply),
                ("b".into(), StepOp::Apply),
                (
                    "a".into(),
                    StepOp::DeleteDeposed {
                        remote_id: "a-1".into()
                    }
                ),
            ]
        );
        assert_eq!(plan.steps[2].after, vec![0, 1]);
    }

    #[test]
    fn test_unknown_attribute_of_unchanged_producer() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")),
            ResourceNode::new(id("b")).with("x", Reference::new(id("a"), "nope")),
        ])
        .unwrap();
        let kinds = KindRegistry::new();
        let state = snapshot(vec![record("a", &[], &[])]);
        let ctx = GraphContext::new(&graph, &kinds, state);

        let err = plan(&ctx, &PlanOptions::default()).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownAttribute { .. }));
    }

    #[test]
    fn test_targets_pull_in_dependencies() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")),
            ResourceNode::new(id("b")).with("parent", Reference::new(id("a"), "id")),
            ResourceNode::new(id("c")),
        ])
        .unwrap();
        let kinds = KindRegistry::new();
        let ctx = GraphContext::new(&graph, &kinds, StateSnapshot::new());

        let opts = PlanOptions {
            targets: vec!["test.b".into()],
            ..Default::default()
        };
        let plan = plan(&ctx, &opts).unwrap();
        let names: Vec<_> = plan.actions.iter().map(|a| a.id.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(plan.steps[1].after, vec![0]);
    }

    #[test]
    fn test_matches_target() {
        let id = ResourceId::new("bucket", "logs");
        assert!(matches_target(&id, "bucket"));
        assert!(matches_target(&id, "bucket.logs"));
        assert!(!matches_target(&id, "bucket.other"));
        assert!(!matches_target(&id, "queue"));
    }
}
