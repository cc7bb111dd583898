//! Local provider: every remote object is a JSON file on disk
//!
//! Layout: `<root>/<kind>/<remote_id>.json`. Useful for trying out
//! configurations and for exercising the engine end to end without a
//! cloud account.

use chrono::{DateTime, Utc};
use declarative::{
    AttributeDiff, Attributes, Created, Provider, ProviderError, ProviderResult, RemoteObject,
    ResourceId, Value,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredObject {
    id: ResourceId,
    remote_id: String,
    created_at: DateTime<Utc>,
    attributes: Attributes,
}

/// Provider that keeps objects as files under a root directory
#[derive(Debug)]
pub struct LocalProvider {
    root: PathBuf,
    counter: AtomicU64,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counter: AtomicU64::new(0),
        }
    }

    fn new_remote_id(&self, id: &ResourceId) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seed = format!("{id}:{nanos}:{n}:{}", std::process::id());
        let hash = blake3::hash(seed.as_bytes()).to_hex();
        format!("{}-{}", id.name, &hash.as_str()[..12])
    }

    fn object_path(&self, kind: &str, remote_id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{remote_id}.json"))
    }

    /// Remote ids don't carry the kind, so search each kind directory
    fn find(&self, remote_id: &str) -> ProviderResult<Option<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&self.root, &e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.root, &e))?;
            let path = entry.path().join(format!("{remote_id}.json"));
            if path.is_file() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    fn load(path: &Path) -> ProviderResult<StoredObject> {
        let content = fs::read_to_string(path).map_err(|e| io_error(path, &e))?;
        serde_json::from_str(&content)
            .map_err(|e| ProviderError::Other(format!("corrupt object {}: {e}", path.display())))
    }

    fn save(path: &Path, object: &StoredObject) -> ProviderResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, &e))?;
        }
        let content = serde_json::to_string_pretty(object)
            .map_err(|e| ProviderError::Other(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| io_error(&tmp, &e))?;
        fs::rename(&tmp, path).map_err(|e| io_error(path, &e))
    }

    fn outputs(object: &StoredObject, path: &Path) -> Attributes {
        let fingerprint = serde_json::to_vec(&object.attributes)
            .map(|bytes| blake3::hash(&bytes).to_hex().to_string())
            .unwrap_or_default();
        Attributes::from([
            ("id".to_string(), Value::from(object.remote_id.as_str())),
            ("path".to_string(), Value::from(path.display().to_string())),
            (
                "created_at".to_string(),
                Value::from(object.created_at.to_rfc3339()),
            ),
            ("fingerprint".to_string(), Value::from(fingerprint)),
        ])
    }
}

fn io_error(path: &Path, error: &io::Error) -> ProviderError {
    let message = format!("{}: {error}", path.display());
    match error.kind() {
        io::ErrorKind::PermissionDenied => ProviderError::Permission { message },
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ProviderError::Transient { message }
        }
        _ => ProviderError::Other(message),
    }
}

impl Provider for LocalProvider {
    fn create(&self, id: &ResourceId, attributes: &Attributes) -> ProviderResult<Created> {
        let remote_id = self.new_remote_id(id);
        let path = self.object_path(&id.kind, &remote_id);
        let object = StoredObject {
            id: id.clone(),
            remote_id: remote_id.clone(),
            created_at: Utc::now(),
            attributes: attributes.clone(),
        };
        Self::save(&path, &object)?;
        log::debug!("Created {id} at {}", path.display());

        Ok(Created {
            remote_id,
            outputs: Self::outputs(&object, &path),
        })
    }

    fn update(
        &self,
        remote_id: &str,
        changes: &[AttributeDiff],
        attributes: &Attributes,
    ) -> ProviderResult<Attributes> {
        let path = self.find(remote_id)?.ok_or_else(|| ProviderError::NotFound {
            remote_id: remote_id.to_string(),
        })?;
        let mut object = Self::load(&path)?;
        object.attributes = attributes.clone();
        Self::save(&path, &object)?;
        log::debug!(
            "Updated {} ({} attribute(s) changed)",
            object.id,
            changes.len()
        );
        Ok(Self::outputs(&object, &path))
    }

    fn delete(&self, remote_id: &str) -> ProviderResult<()> {
        let path = self.find(remote_id)?.ok_or_else(|| ProviderError::NotFound {
            remote_id: remote_id.to_string(),
        })?;
        fs::remove_file(&path).map_err(|e| io_error(&path, &e))?;
        log::debug!("Deleted {}", path.display());
        Ok(())
    }

    fn read(&self, remote_id: &str) -> ProviderResult<Option<RemoteObject>> {
        let Some(path) = self.find(remote_id)? else {
            return Ok(None);
        };
        let object = Self::load(&path)?;
        let outputs = Self::outputs(&object, &path);
        Ok(Some(RemoteObject {
            attributes: object.attributes,
            outputs,
        }))
    }

    fn lookup(&self, id: &ResourceId) -> ProviderResult<Option<String>> {
        let dir = self.root.join(&id.kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&dir, &e)),
        };

        let mut newest: Option<StoredObject> = None;
        for entry in entries {
            let path = entry.map_err(|e| io_error(&dir, &e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let object = Self::load(&path)?;
            if object.id == *id
                && newest
                    .as_ref()
                    .is_none_or(|n| object.created_at > n.created_at)
            {
                newest = Some(object);
            }
        }
        Ok(newest.map(|o| o.remote_id))
    }
}
