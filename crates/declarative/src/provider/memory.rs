//! In-memory provider with call accounting and fault injection.
//!
//! Used by the engine's tests and by embedders that want to dry-run a
//! configuration without touching a real API.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::{Created, Provider, ProviderResult, RemoteObject};
use crate::diff::AttributeDiff;
use crate::error::ProviderError;
use crate::types::{Attributes, ResourceId, Value};

/// Provider operations, for counting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Read,
    Lookup,
}

#[derive(Debug, Clone)]
struct Object {
    id: ResourceId,
    serial: u64,
    attributes: Attributes,
    outputs: Attributes,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, Object>,
    serial: u64,
    calls: HashMap<Operation, usize>,
    failures: HashMap<(ResourceId, Operation), ProviderError>,
    transient: HashMap<ResourceId, u32>,
    delays: HashMap<ResourceId, Duration>,
    log: Vec<(Operation, ResourceId)>,
    active: usize,
    peak: usize,
}

/// Provider backed by a map in memory
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every `op` on `id` fail with `error`
    pub fn fail_on(&self, id: ResourceId, op: Operation, error: ProviderError) {
        self.lock().failures.insert((id, op), error);
    }

    /// Make the next `times` calls touching `id` fail with a transient error
    pub fn fail_transiently(&self, id: ResourceId, times: u32) {
        self.lock().transient.insert(id, times);
    }

    /// Sleep before every call touching `id`
    pub fn delay(&self, id: ResourceId, delay: Duration) {
        self.lock().delays.insert(id, delay);
    }

    /// Clear injected failures and delays
    pub fn heal(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.transient.clear();
        inner.delays.clear();
    }

    /// Number of calls for one operation
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of calls across all operations
    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Mutating calls in the order they started
    pub fn call_log(&self) -> Vec<(Operation, ResourceId)> {
        self.lock().log.clone()
    }

    pub fn reset_counters(&self) {
        let mut inner = self.lock();
        inner.calls.clear();
        inner.log.clear();
        inner.peak = 0;
    }

    /// Highest number of calls that were in progress at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.lock().peak
    }

    /// Remote ids of live objects created for `id`
    pub fn remote_ids(&self, id: &ResourceId) -> Vec<String> {
        self.lock()
            .objects
            .iter()
            .filter(|(_, o)| &o.id == id)
            .map(|(remote_id, _)| remote_id.clone())
            .collect()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Current attributes of a live object
    pub fn attributes(&self, remote_id: &str) -> Option<Attributes> {
        self.lock()
            .objects
            .get(remote_id)
            .map(|o| o.attributes.clone())
    }

    /// Change a remote attribute behind the engine's back
    pub fn drift(&self, remote_id: &str, attribute: &str, value: Value) {
        if let Some(object) = self.lock().objects.get_mut(remote_id) {
            object.attributes.insert(attribute.to_string(), value);
        }
    }

    /// Delete a remote object behind the engine's back
    pub fn forget(&self, remote_id: &str) {
        self.lock().objects.remove(remote_id);
    }

    /// Count the call, apply injected delay and failures
    fn enter(&self, op: Operation, id: Option<&ResourceId>) -> ProviderResult<()> {
        let delay = {
            let mut inner = self.lock();
            *inner.calls.entry(op).or_default() += 1;
            inner.active += 1;
            inner.peak = inner.peak.max(inner.active);
            match id {
                Some(id) => {
                    if !matches!(op, Operation::Read | Operation::Lookup) {
                        inner.log.push((op, id.clone()));
                    }
                    inner.delays.get(id).copied()
                }
                None => None,
            }
        };

        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut inner = self.lock();
        inner.active -= 1;
        let Some(id) = id else {
            return Ok(());
        };

        if let Some(remaining) = inner.transient.get_mut(id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ProviderError::Transient {
                message: format!("{id} throttled"),
            });
        }
        match inner.failures.get(&(id.clone(), op)) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn owner(&self, remote_id: &str) -> Option<ResourceId> {
        self.lock().objects.get(remote_id).map(|o| o.id.clone())
    }
}

impl Provider for MemoryProvider {
    fn create(&self, id: &ResourceId, attributes: &Attributes) -> ProviderResult<Created> {
        self.enter(Operation::Create, Some(id))?;

        let mut inner = self.lock();
        inner.serial += 1;
        let serial = inner.serial;
        let remote_id = format!("{}-{}", id.name, serial);
        let outputs = Attributes::from([
            ("id".to_string(), Value::from(remote_id.as_str())),
            (
                "self_link".to_string(),
                Value::from(format!("memory://{}/{}", id.kind, remote_id)),
            ),
        ]);
        inner.objects.insert(
            remote_id.clone(),
            Object {
                id: id.clone(),
                serial,
                attributes: attributes.clone(),
                outputs: outputs.clone(),
            },
        );

        Ok(Created { remote_id, outputs })
    }

    fn update(
        &self,
        remote_id: &str,
        _changes: &[AttributeDiff],
        attributes: &Attributes,
    ) -> ProviderResult<Attributes> {
        let owner = self.owner(remote_id);
        self.enter(Operation::Update, owner.as_ref())?;

        let mut inner = self.lock();
        let object = inner
            .objects
            .get_mut(remote_id)
            .ok_or_else(|| ProviderError::NotFound {
                remote_id: remote_id.to_string(),
            })?;
        object.attributes = attributes.clone();
        Ok(object.outputs.clone())
    }

    fn delete(&self, remote_id: &str) -> ProviderResult<()> {
        let owner = self.owner(remote_id);
        self.enter(Operation::Delete, owner.as_ref())?;

        match self.lock().objects.remove(remote_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound {
                remote_id: remote_id.to_string(),
            }),
        }
    }

    fn read(&self, remote_id: &str) -> ProviderResult<Option<RemoteObject>> {
        let owner = self.owner(remote_id);
        self.enter(Operation::Read, owner.as_ref())?;

        Ok(self.lock().objects.get(remote_id).map(|o| RemoteObject {
            attributes: o.attributes.clone(),
            outputs: o.outputs.clone(),
        }))
    }

    fn lookup(&self, id: &ResourceId) -> ProviderResult<Option<String>> {
        self.enter(Operation::Lookup, Some(id))?;

        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(_, o)| &o.id == id)
            .max_by_key(|(_, o)| o.serial)
            .map(|(remote_id, _)| remote_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crud_round() {
        let provider = MemoryProvider::new();
        let id = ResourceId::new("bucket", "logs");
        let attrs = Attributes::from([("size".to_string(), Value::from(1))]);

        let created = provider.create(&id, &attrs).unwrap();
        assert_eq!(created.outputs["id"], Value::from(created.remote_id.as_str()));

        let read = provider.read(&created.remote_id).unwrap().unwrap();
        assert_eq!(read.attributes["size"], Value::from(1));
        assert!(read.outputs.contains_key("self_link"));
        assert!(!read.attributes.contains_key("self_link"));

        provider.delete(&created.remote_id).unwrap();
        assert_eq!(provider.read(&created.remote_id).unwrap(), None);
        assert_eq!(provider.total_calls(), 4);
    }

    #[test]
    fn test_injected_failures() {
        let provider = MemoryProvider::new();
        let id = ResourceId::new("bucket", "logs");

        provider.fail_transiently(id.clone(), 1);
        assert!(provider.create(&id, &Attributes::new()).unwrap_err().is_retryable());
        assert!(provider.create(&id, &Attributes::new()).is_ok());

        provider.fail_on(id.clone(), Operation::Create, ProviderError::Other("quota".into()));
        assert_eq!(
            provider.create(&id, &Attributes::new()).unwrap_err(),
            ProviderError::Other("quota".into())
        );
    }
}
