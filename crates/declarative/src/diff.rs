//! Diff engine - classify each node against its last-applied record
//!
//! Comparison always happens on resolved values. A reference to a producer
//! whose action is still pending resolves to [`Resolution::Pending`] and
//! shows up as "known after apply" instead of a spurious change.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::ConflictError;
use crate::kinds::KindSpec;
use crate::state::StateRecord;
use crate::types::{Attributes, Reference, ResourceId, Value};

/// Change to a single attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Added(Value),
    Removed(Value),
    Modified { old: Value, new: Value },
    /// New value is only known once a producer has been applied
    Pending { old: Option<Value> },
}

/// Per-attribute diff entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeDiff {
    pub attribute: String,
    pub change: Change,
    /// The attribute is immutable for this kind
    pub forces_replacement: bool,
}

/// Action required to reconcile one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    /// Delete + Create, because an immutable attribute changes
    Replace,
    Delete,
    NoOp,
}

impl ActionKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            ActionKind::Create => "+",
            ActionKind::Update => "~",
            ActionKind::Replace => "-/+",
            ActionKind::Delete => "-",
            ActionKind::NoOp => " ",
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, ActionKind::NoOp)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Replace => "replace",
            ActionKind::Delete => "delete",
            ActionKind::NoOp => "no-op",
        };
        f.write_str(name)
    }
}

/// Planned action for one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub id: ResourceId,
    pub kind: ActionKind,
    pub changes: Vec<AttributeDiff>,
    /// Drift found while refreshing; the action will be skipped
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "conflict_message")]
    pub conflict: Option<ConflictError>,
}

fn conflict_message<S: serde::Serializer>(
    conflict: &Option<ConflictError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match conflict {
        Some(c) => serializer.serialize_str(&c.message),
        None => serializer.serialize_none(),
    }
}

impl Action {
    /// Attributes whose change forces the replacement
    pub fn replacement_reasons(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|c| c.forces_replacement)
            .map(|c| c.attribute.as_str())
            .collect()
    }
}

/// Attribute value after reference resolution
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Known(Value),
    Pending,
}

pub type ResolvedAttributes = BTreeMap<String, Resolution>;

/// Answer to "what is the current value of this reference?"
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Value(Value),
    Pending,
    /// The producer has no such attribute
    Missing,
}

/// Resolve every reference inside `value`.
///
/// Returns the first reference that could not be found as the error.
pub fn resolve_value<F>(value: &Value, lookup: &mut F) -> Result<Resolution, Reference>
where
    F: FnMut(&Reference) -> Lookup,
{
    let resolved = match value {
        Value::Reference(r) => match lookup(r) {
            Lookup::Value(v) => Resolution::Known(v),
            Lookup::Pending => Resolution::Pending,
            Lookup::Missing => return Err(r.clone()),
        },
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut pending = false;
            for item in items {
                match resolve_value(item, lookup)? {
                    Resolution::Known(v) => out.push(v),
                    Resolution::Pending => pending = true,
                }
            }
            if pending {
                Resolution::Pending
            } else {
                Resolution::Known(Value::List(out))
            }
        }
        Value::Map(entries) => {
            let mut out = BTreeMap::new();
            let mut pending = false;
            for (key, item) in entries {
                match resolve_value(item, lookup)? {
                    Resolution::Known(v) => {
                        out.insert(key.clone(), v);
                    }
                    Resolution::Pending => pending = true,
                }
            }
            if pending {
                Resolution::Pending
            } else {
                Resolution::Known(Value::Map(out))
            }
        }
        literal => Resolution::Known(literal.clone()),
    };
    Ok(resolved)
}

/// Resolve a node's attribute map. The error names the attribute and the
/// unresolvable reference.
pub fn resolve_attributes<F>(
    attributes: &Attributes,
    mut lookup: F,
) -> Result<ResolvedAttributes, (String, Reference)>
where
    F: FnMut(&Reference) -> Lookup,
{
    attributes
        .iter()
        .map(|(name, value)| {
            resolve_value(value, &mut lookup)
                .map(|r| (name.clone(), r))
                .map_err(|r| (name.clone(), r))
        })
        .collect()
}

/// Fully known attributes, or `None` if anything is still pending
pub fn known_attributes(resolved: &ResolvedAttributes) -> Option<Attributes> {
    resolved
        .iter()
        .map(|(name, r)| match r {
            Resolution::Known(v) => Some((name.clone(), v.clone())),
            Resolution::Pending => None,
        })
        .collect()
}

/// Per-attribute diff of desired values against a recorded snapshot
pub fn diff_attributes(
    desired: &ResolvedAttributes,
    recorded: &Attributes,
    spec: &KindSpec,
) -> Vec<AttributeDiff> {
    let names: BTreeSet<&String> = desired.keys().chain(recorded.keys()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let change = match (desired.get(name), recorded.get(name)) {
                (Some(Resolution::Known(new)), Some(old)) if new == old => return None,
                (Some(Resolution::Known(new)), Some(old)) => Change::Modified {
                    old: old.clone(),
                    new: new.clone(),
                },
                (Some(Resolution::Known(new)), None) => Change::Added(new.clone()),
                (Some(Resolution::Pending), old) => Change::Pending { old: old.cloned() },
                (None, Some(old)) => Change::Removed(old.clone()),
                (None, None) => return None,
            };
            Some(AttributeDiff {
                attribute: name.clone(),
                forces_replacement: spec.is_immutable(name),
                change,
            })
        })
        .collect()
}

/// Decide the action for one node.
///
/// `desired` is `None` when the node left the configuration, `record` is
/// `None` (or has no remote object) when it was never applied.
pub fn classify(
    desired: Option<&ResolvedAttributes>,
    record: Option<&StateRecord>,
    spec: &KindSpec,
) -> (ActionKind, Vec<AttributeDiff>) {
    let record = record.filter(|r| r.exists());

    match (desired, record) {
        (Some(desired), None) => (
            ActionKind::Create,
            diff_attributes(desired, &Attributes::new(), &KindSpec::default()),
        ),
        (None, Some(record)) => (
            ActionKind::Delete,
            diff_attributes(&ResolvedAttributes::new(), &record.attributes, spec),
        ),
        (None, None) => (ActionKind::NoOp, Vec::new()),
        (Some(desired), Some(record)) => {
            let changes = diff_attributes(desired, &record.attributes, spec);
            let kind = if changes.is_empty() {
                ActionKind::NoOp
            } else if changes.iter().any(|c| c.forces_replacement) {
                ActionKind::Replace
            } else {
                ActionKind::Update
            };
            (kind, changes)
        }
    }
}
