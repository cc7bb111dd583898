//! Per-kind metadata supplied by the caller
//!
//! Which attributes force replacement, how long an action may take and how
//! transient failures are retried are properties of a resource kind that the
//! engine cannot infer. They are registered here.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::types::RetryConfig;

/// Metadata for one resource kind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KindSpec {
    /// Attributes that cannot be changed in place
    pub immutable: BTreeSet<String>,
    /// Per-action timeout, overriding the execution default
    pub timeout: Option<Duration>,
    /// Retry behavior for transient provider errors
    pub retry: Option<RetryConfig>,
}

impl KindSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn immutable<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable.extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable.contains(attribute)
    }
}

/// Registry of kind metadata; unknown kinds get the default spec
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: HashMap<String, KindSpec>,
    fallback: KindSpec,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, spec: KindSpec) -> &mut Self {
        self.kinds.insert(kind.into(), spec);
        self
    }

    pub fn get(&self, kind: &str) -> &KindSpec {
        self.kinds.get(kind).unwrap_or(&self.fallback)
    }

    /// Timeout for an action on `kind`
    pub fn timeout_for(&self, kind: &str, default: Duration) -> Duration {
        self.get(kind).timeout.unwrap_or(default)
    }

    /// Retry config for `kind`; kinds without one are not retried
    pub fn retry_for(&self, kind: &str) -> RetryConfig {
        self.get(kind)
            .retry
            .clone()
            .unwrap_or_else(RetryConfig::no_retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_uses_defaults() {
        let mut registry = KindRegistry::new();
        registry.register(
            "bucket",
            KindSpec::new()
                .immutable(["location"])
                .timeout(Duration::from_secs(5)),
        );

        assert!(registry.get("bucket").is_immutable("location"));
        assert!(!registry.get("other").is_immutable("location"));
        assert_eq!(
            registry.timeout_for("bucket", Duration::from_secs(60)),
            Duration::from_secs(5)
        );
        assert_eq!(
            registry.timeout_for("other", Duration::from_secs(60)),
            Duration::from_secs(60)
        );
        assert_eq!(registry.retry_for("other").max_attempts, 1);
    }
}
