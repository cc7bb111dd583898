//! Error types for reconciliation.
//!
//! Errors are split by blast radius. [`ValidationError`] and [`StateError`]
//! are run-level and abort before (or instead of) side effects.
//! [`ProviderError`] and [`ConflictError`] are node-level: they block the
//! node and its dependents but never abort the run.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::ResourceId;

/// Problems with the desired graph. Fatal: planning never starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The graph contains a cycle. The path starts and ends on the same node.
    #[error("dependency cycle: {}", format_path(.path))]
    Cycle { path: Vec<ResourceId> },

    /// An attribute references a node that is not in the desired graph
    #[error("{from}.{attribute} references unknown resource {target}")]
    UnresolvedReference {
        from: ResourceId,
        attribute: String,
        target: ResourceId,
    },

    /// An attribute references an attribute its (unchanged) producer doesn't have
    #[error("{from}.{attribute} references {reference}, which does not exist")]
    UnknownAttribute {
        from: ResourceId,
        attribute: String,
        reference: String,
    },

    /// Two nodes share the same identifier
    #[error("duplicate resource: {0}")]
    DuplicateResource(ResourceId),

    /// No provider is registered for a kind in use
    #[error("no provider registered for kind '{kind}'")]
    NoProvider { kind: String },

    /// Malformed `kind.name` identifier or reference path
    #[error("invalid resource identifier: '{0}'")]
    InvalidId(String),
}

fn format_path(path: &[ResourceId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Categories of provider errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network or throttling errors (transient, retryable)
    Transient,
    /// Remote object does not exist
    NotFound,
    /// Remote object is in a conflicting state
    Conflict,
    /// Credentials lack a permission
    Permission,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "Transient provider error",
            Self::NotFound => "Remote object not found",
            Self::Conflict => "Remote conflict",
            Self::Permission => "Permission denied",
            Self::Other => "Unexpected provider error",
        }
    }
}

/// Errors returned by provider clients for a single action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("transient error: {message}")]
    Transient { message: String },

    #[error("remote object not found: {remote_id}")]
    NotFound { remote_id: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("permission denied: {message}")]
    Permission { message: String },

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::Transient { .. } => ErrorCategory::Transient,
            ProviderError::NotFound { .. } => ErrorCategory::NotFound,
            ProviderError::Conflict { .. } => ErrorCategory::Conflict,
            ProviderError::Permission { .. } => ErrorCategory::Permission,
            ProviderError::Other(_) => ErrorCategory::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Remote state drifted from the last-applied record.
///
/// Surfaced to the caller for manual resolution; the node's action is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{id} drifted from recorded state: {message}")]
pub struct ConflictError {
    pub id: ResourceId,
    pub message: String,
}

/// Failures of the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("unsupported state file version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

/// Run-level errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to create worker pool: {0}")]
    Pool(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = ValidationError::Cycle {
            path: vec![
                ResourceId::new("k", "a"),
                ResourceId::new("k", "b"),
                ResourceId::new("k", "a"),
            ],
        };
        assert_eq!(err.to_string(), "dependency cycle: k.a -> k.b -> k.a");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(
            ProviderError::Transient {
                message: "throttled".into()
            }
            .is_retryable()
        );
        assert!(!ProviderError::Other("boom".into()).is_retryable());
        assert!(
            !ProviderError::Permission {
                message: "denied".into()
            }
            .is_retryable()
        );
    }
}
