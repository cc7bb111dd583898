//! Provider abstraction for remote resource operations.
//!
//! The [`Provider`] trait is the only thing the engine knows about a cloud
//! API. Implementations exist per resource kind (or one per family of
//! kinds) and are looked up through a [`ProviderRegistry`].

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use crate::diff::AttributeDiff;
use crate::error::{ProviderError, ValidationError};
use crate::graph::ResourceGraph;
use crate::types::{Attributes, ResourceId};

pub use memory::{MemoryProvider, Operation};

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A freshly created remote object
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Provider-assigned identifier used for update, delete and read
    pub remote_id: String,
    /// Attributes computed by the provider
    pub outputs: Attributes,
}

/// Current state of a remote object as a provider reports it.
///
/// Inputs and outputs are kept apart so an input that happens to share a
/// name with a computed output is compared against the right value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteObject {
    /// Attributes the object was configured with
    pub attributes: Attributes,
    /// Attributes computed by the provider
    pub outputs: Attributes,
}

/// CRUD capability for one family of resource kinds.
///
/// Calls are blocking; the scheduler runs them on worker threads and
/// enforces timeouts from the outside.
pub trait Provider: Send + Sync {
    /// Create a remote object from fully resolved attributes
    fn create(&self, id: &ResourceId, attributes: &Attributes) -> ProviderResult<Created>;

    /// Apply attribute changes in place, returning the new outputs.
    ///
    /// `attributes` is the complete desired attribute set after the change.
    fn update(
        &self,
        remote_id: &str,
        changes: &[AttributeDiff],
        attributes: &Attributes,
    ) -> ProviderResult<Attributes>;

    /// Delete a remote object
    fn delete(&self, remote_id: &str) -> ProviderResult<()>;

    /// Read the remote object; `None` if it is gone
    fn read(&self, remote_id: &str) -> ProviderResult<Option<RemoteObject>>;

    /// Find the remote id of an object created for `id` when the create
    /// call never reported back (e.g. it timed out)
    fn lookup(&self, _id: &ResourceId) -> ProviderResult<Option<String>> {
        Ok(None)
    }
}

/// Maps resource kinds to providers
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that serves every kind from one provider
    pub fn single(provider: Arc<dyn Provider>) -> Self {
        Self {
            providers: HashMap::new(),
            fallback: Some(provider),
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, provider: Arc<dyn Provider>) -> &mut Self {
        self.providers.insert(kind.into(), provider);
        self
    }

    pub fn set_fallback(&mut self, provider: Arc<dyn Provider>) -> &mut Self {
        self.fallback = Some(provider);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .get(kind)
            .or(self.fallback.as_ref())
            .map(Arc::clone)
    }

    /// Like [`get`](Self::get) but reports a missing provider as a validation error
    pub fn require(&self, kind: &str) -> Result<Arc<dyn Provider>, ValidationError> {
        self.get(kind).ok_or_else(|| ValidationError::NoProvider {
            kind: kind.to_string(),
        })
    }

    /// Ensure every kind in the graph and in `extra` has a provider
    pub fn check<'a>(
        &self,
        graph: &'a ResourceGraph,
        extra: impl IntoIterator<Item = &'a ResourceId>,
    ) -> Result<(), ValidationError> {
        graph
            .nodes()
            .iter()
            .map(|n| &n.id)
            .chain(extra)
            .try_for_each(|id| self.require(&id.kind).map(|_| ()))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.providers.keys().collect();
        kinds.sort();
        f.debug_struct("ProviderRegistry")
            .field("kinds", &kinds)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceNode;

    #[test]
    fn test_registry_lookup_and_check() {
        let mut registry = ProviderRegistry::new();
        registry.register("bucket", Arc::new(MemoryProvider::new()));

        assert!(registry.get("bucket").is_some());
        assert!(registry.get("queue").is_none());

        let graph = ResourceGraph::new(vec![
            ResourceNode::new(ResourceId::new("bucket", "a")),
            ResourceNode::new(ResourceId::new("queue", "b")),
        ])
        .unwrap();
        assert_eq!(
            registry.check(&graph, []).unwrap_err(),
            ValidationError::NoProvider {
                kind: "queue".into()
            }
        );

        registry.set_fallback(Arc::new(MemoryProvider::new()));
        assert!(registry.check(&graph, []).is_ok());
    }
}
