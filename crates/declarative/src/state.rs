//! State store - last-applied attribute snapshots per resource
//!
//! Every `put`/`remove` is persisted before it returns, so a crash in the
//! middle of a run leaves exactly the actions that completed on record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StateError;
use crate::types::{Attributes, ResourceId, Value};

/// Current on-disk format version
pub const STATE_VERSION: u32 = 1;

/// Whether a record is trustworthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Matches the last successful action
    #[default]
    Applied,
    /// An action timed out; the remote side must be re-read before planning
    Unknown,
}

/// Last-applied snapshot of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: ResourceId,
    /// Provider-assigned identifier; `None` when no remote object is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Resolved attributes as sent to the provider
    #[serde(default)]
    pub attributes: Attributes,
    /// Attributes computed by the provider
    #[serde(default)]
    pub outputs: Attributes,
    /// Nodes this resource referenced when it was applied
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    #[serde(default)]
    pub status: RecordStatus,
    /// Old remote objects left behind by a replace, pending deletion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(
        id: ResourceId,
        remote_id: Option<String>,
        attributes: Attributes,
        outputs: Attributes,
        dependencies: Vec<ResourceId>,
    ) -> Self {
        Self {
            id,
            remote_id,
            attributes,
            outputs,
            dependencies,
            status: RecordStatus::Applied,
            deposed: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Look up an attribute for a reference.
    ///
    /// A declared input shadows an output of the same name, matching what
    /// plan-time resolution sees before the producer has been applied.
    pub fn lookup(&self, attribute: &str) -> Option<&Value> {
        self.attributes
            .get(attribute)
            .or_else(|| self.outputs.get(attribute))
    }

    /// Whether a remote object currently backs this record
    pub fn exists(&self) -> bool {
        self.remote_id.is_some()
    }

    pub fn is_unknown(&self) -> bool {
        self.status == RecordStatus::Unknown
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// All records, keyed by resource id
pub type StateSnapshot = BTreeMap<ResourceId, StateRecord>;

/// Key-value persistence for state records
pub trait StateStore: Send {
    /// Load every record
    fn load(&mut self) -> Result<StateSnapshot, StateError>;

    /// Insert or replace a record and flush it
    fn put(&mut self, record: &StateRecord) -> Result<(), StateError>;

    /// Remove a record and flush
    fn remove(&mut self, id: &ResourceId) -> Result<(), StateError>;
}

/// State kept in memory only
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    records: StateSnapshot,
    writes: usize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &StateSnapshot {
        &self.records
    }

    pub fn get(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.records.get(id)
    }

    /// Number of put/remove calls so far
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl StateStore for MemoryStateStore {
    fn load(&mut self) -> Result<StateSnapshot, StateError> {
        Ok(self.records.clone())
    }

    fn put(&mut self, record: &StateRecord) -> Result<(), StateError> {
        self.records.insert(record.id.clone(), record.clone());
        self.writes += 1;
        Ok(())
    }

    fn remove(&mut self, id: &ResourceId) -> Result<(), StateError> {
        self.records.remove(id);
        self.writes += 1;
        Ok(())
    }
}

/// On-disk representation
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    /// Incremented on every write
    serial: u64,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    resources: Vec<StateRecord>,
}

/// State persisted as a JSON file, rewritten atomically on every change
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    records: StateSnapshot,
    serial: u64,
    loaded: bool,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: StateSnapshot::new(),
            serial: 0,
            loaded: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write counter of the file as last loaded or written
    pub fn serial(&self) -> u64 {
        self.serial
    }

    fn ensure_loaded(&mut self) -> Result<(), StateError> {
        if !self.loaded {
            self.load()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StateError> {
        self.serial += 1;
        let file = StateFile {
            version: STATE_VERSION,
            serial: self.serial,
            updated_at: Utc::now(),
            resources: self.records.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(write_err)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;

        log::debug!(
            "Saved state to {} (serial {})",
            self.path.display(),
            self.serial
        );
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&mut self) -> Result<StateSnapshot, StateError> {
        if !self.path.exists() {
            log::debug!("State file does not exist, starting from empty state");
            self.records.clear();
            self.serial = 0;
            self.loaded = true;
            return Ok(StateSnapshot::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|source| StateError::Read {
            path: self.path.clone(),
            source,
        })?;
        let file: StateFile =
            serde_json::from_str(&content).map_err(|source| StateError::Parse {
                path: self.path.clone(),
                source,
            })?;

        if file.version != STATE_VERSION {
            return Err(StateError::Version {
                found: file.version,
                expected: STATE_VERSION,
            });
        }

        self.serial = file.serial;
        self.records = file
            .resources
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        self.loaded = true;

        log::debug!(
            "Loaded {} records from {}",
            self.records.len(),
            self.path.display()
        );
        Ok(self.records.clone())
    }

    fn put(&mut self, record: &StateRecord) -> Result<(), StateError> {
        self.ensure_loaded()?;
        self.records.insert(record.id.clone(), record.clone());
        self.flush()
    }

    fn remove(&mut self, id: &ResourceId) -> Result<(), StateError> {
        self.ensure_loaded()?;
        if self.records.remove(id).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}
