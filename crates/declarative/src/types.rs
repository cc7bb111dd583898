//! Core types for declarative resource reconciliation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ValidationError;

/// Identifier of a resource node: its kind plus a name unique within that kind
///
/// Rendered and serialized as `kind.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Check that the id survives a round trip through `kind.name` and
    /// `kind.name.attribute` paths: both parts non-empty and dot-free
    pub fn validate(&self) -> Result<(), ValidationError> {
        let valid = |part: &str| !part.is_empty() && !part.contains('.');
        if valid(&self.kind) && valid(&self.name) {
            Ok(())
        } else {
            Err(ValidationError::InvalidId(self.to_string()))
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('.')
            .ok_or_else(|| ValidationError::InvalidId(s.to_string()))?;
        let id = Self::new(kind, name);
        id.validate()?;
        Ok(id)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// A reference to an attribute (input or output) of another node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ReferenceRepr", into = "ReferenceRepr")]
pub struct Reference {
    pub target: ResourceId,
    pub attribute: String,
}

impl Reference {
    pub fn new(target: ResourceId, attribute: impl Into<String>) -> Self {
        Self {
            target,
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// Wire form of a reference: `{ "$ref": "kind.name.attribute" }`
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReferenceRepr {
    #[serde(rename = "$ref")]
    path: String,
}

impl TryFrom<ReferenceRepr> for Reference {
    type Error = ValidationError;

    fn try_from(repr: ReferenceRepr) -> Result<Self, Self::Error> {
        let mut parts = repr.path.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(name), Some(attribute))
                if !kind.is_empty() && !name.is_empty() && !attribute.is_empty() =>
            {
                Ok(Self::new(ResourceId::new(kind, name), attribute))
            }
            _ => Err(ValidationError::InvalidId(repr.path)),
        }
    }
}

impl From<Reference> for ReferenceRepr {
    fn from(reference: Reference) -> Self {
        Self {
            path: reference.to_string(),
        }
    }
}

/// Attribute value: a literal or a reference to another node's attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Reference(Reference),
    Map(BTreeMap<String, Value>),
}

/// Attribute map of a node. Ordered so plans and state files are stable.
pub type Attributes = BTreeMap<String, Value>;

impl Value {
    /// Collect every reference contained in this value, depth first
    pub fn references(&self) -> Vec<&Reference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a Reference>) {
        match self {
            Value::Reference(r) => found.push(r),
            Value::List(items) => items.iter().for_each(|v| v.collect_references(found)),
            Value::Map(entries) => entries.values().for_each(|v| v.collect_references(found)),
            Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
        }
    }

    pub fn is_multiline(&self) -> bool {
        matches!(self, Value::String(s) if s.contains('\n'))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Reference(r) => write!(f, "${{{r}}}"),
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key} = {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Reference(r)
    }
}

/// Retry behavior for transient provider errors
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// A config that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Options for plan computation
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Restrict the plan to these `kind` or `kind.name` patterns (empty = all)
    pub targets: Vec<String>,
    /// Read every recorded resource from its provider before diffing
    pub refresh: bool,
    /// Adopt drifted remote values into state instead of reporting conflicts
    pub accept_drift: bool,
}

/// Options for plan execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Size of the worker pool
    pub jobs: usize,
    /// Per-action timeout for kinds that don't declare their own
    pub timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Final outcome for one node of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOutcome {
    /// Nothing to do
    NoChange,
    /// Resource was created
    Created,
    /// Resource was updated in place
    Updated,
    /// Resource was replaced by a new remote object
    Replaced,
    /// Resource was deleted
    Deleted,
    /// A provider call failed
    Failed { error: String },
    /// The provider call didn't return in time; remote state is unknown
    TimedOut,
    /// Remote state drifted from the record; needs manual resolution
    Conflict { message: String },
    /// Not attempted because a dependency failed
    Blocked { cause: ResourceId },
    /// Not attempted because the run was cancelled
    Cancelled,
}

impl NodeOutcome {
    /// Whether the outcome represents success (no failure)
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::NoChange | Self::Created | Self::Updated | Self::Replaced | Self::Deleted
        )
    }

    /// Whether the outcome represents a change
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Deleted
        )
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub no_change: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub conflicts: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    /// Check if execution was fully successful
    pub fn is_success(&self) -> bool {
        self.failed + self.timed_out + self.conflicts + self.blocked + self.cancelled == 0
    }

    /// Total number of nodes processed
    pub fn total(&self) -> usize {
        self.total_changes()
            + self.no_change
            + self.failed
            + self.timed_out
            + self.conflicts
            + self.blocked
            + self.cancelled
    }

    /// Add an outcome to the summary
    pub fn add_outcome(&mut self, outcome: &NodeOutcome) {
        match outcome {
            NodeOutcome::NoChange => self.no_change += 1,
            NodeOutcome::Created => self.created += 1,
            NodeOutcome::Updated => self.updated += 1,
            NodeOutcome::Replaced => self.replaced += 1,
            NodeOutcome::Deleted => self.deleted += 1,
            NodeOutcome::Failed { .. } => self.failed += 1,
            NodeOutcome::TimedOut => self.timed_out += 1,
            NodeOutcome::Conflict { .. } => self.conflicts += 1,
            NodeOutcome::Blocked { .. } => self.blocked += 1,
            NodeOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_parse() {
        let id: ResourceId = "run_service.api".parse().unwrap();
        assert_eq!(id, ResourceId::new("run_service", "api"));
        assert!("no_dot".parse::<ResourceId>().is_err());
        assert!(".name".parse::<ResourceId>().is_err());
        assert!("kind.with.dots".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_dotted_name_is_invalid() {
        assert!(ResourceId::new("bucket", "logs").validate().is_ok());
        assert_eq!(
            ResourceId::new("bucket", "logs.v2").validate(),
            Err(ValidationError::InvalidId("bucket.logs.v2".into()))
        );
        assert!(ResourceId::new("", "logs").validate().is_err());
    }

    #[test]
    fn test_value_serde_untagged() {
        let json = r#"{"a": true, "b": 3, "c": "x", "d": {"$ref": "k.n.id"}, "e": {"k": 1}}"#;
        let attrs: Attributes = serde_json::from_str(json).unwrap();
        assert_eq!(attrs["a"], Value::Bool(true));
        assert_eq!(attrs["b"], Value::Number(3.0));
        assert_eq!(
            attrs["d"],
            Value::Reference(Reference::new(ResourceId::new("k", "n"), "id"))
        );
        assert!(matches!(attrs["e"], Value::Map(_)));

        let back = serde_json::to_string(&attrs["d"]).unwrap();
        assert_eq!(back, r#"{"$ref":"k.n.id"}"#);
    }

    #[test]
    fn test_nested_references_collected() {
        let r = Reference::new(ResourceId::new("k", "n"), "id");
        let value = Value::List(vec![
            Value::from("x"),
            Value::Map(Attributes::from([("inner".to_string(), Value::from(r.clone()))])),
        ]);
        assert_eq!(value.references(), vec![&r]);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(1.5).to_string(), "1.5");
        assert_eq!(Value::from("a").to_string(), "\"a\"");
        assert_eq!(
            Value::List(vec![Value::Bool(true), Value::from(2)]).to_string(),
            "[true, 2]"
        );
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig::new(5, Duration::from_secs(1), 2.0);
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = ExecuteSummary::default();
        summary.add_outcome(&NodeOutcome::Created);
        summary.add_outcome(&NodeOutcome::Blocked {
            cause: ResourceId::new("k", "a"),
        });
        assert_eq!(summary.total(), 2);
        assert_eq!(summary.total_changes(), 1);
        assert!(!summary.is_success());
    }
}
