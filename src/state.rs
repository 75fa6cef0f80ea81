//! Per-resource state persistence.
//!
//! After every successful step the executor writes one [`StateRecord`]; the
//! next run reads a [`StateSnapshot`] of all records and diffs against it.
//!
//! [`FileStateStore`] keeps one JSON file per resource:
//!
//! ```text
//! <root>/
//!   state.lock              # run lock (see FileStateStore::acquire_lock)
//!   resources/
//!     SiteBucket.json       # {"version": 1, "id": "SiteBucket", "record": {...}}
//!     Cdn.json
//! ```
//!
//! A file is replaced by writing a temp file, syncing it and renaming it
//! over the old one, so a crash leaves either the old or the new record.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::driver::CurrentResource;
use crate::error::StateStoreError;
use crate::graph::is_valid_identifier;

const STATE_VERSION: u32 = 1;
const RESOURCES_DIR: &str = "resources";
const LOCK_FILE: &str = "state.lock";

/// Outcome of the last apply of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// The last apply succeeded.
    Succeeded,
    /// The last apply failed; the record holds the last known good values.
    Failed,
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyStatus::Succeeded => write!(f, "succeeded"),
            ApplyStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What the engine knows about one applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Type tag at the time of the apply.
    pub resource_type: String,
    /// Provider-assigned identifier.
    pub external_id: String,
    /// Resolved properties as last applied.
    #[serde(default)]
    pub properties: Value,
    /// Output attributes returned by the driver.
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Resource ids this resource depended on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When the record was written.
    pub applied_at: DateTime<Utc>,
    /// Outcome of the last apply.
    pub status: ApplyStatus,
}

impl StateRecord {
    /// A succeeded record stamped now.
    pub fn new(resource_type: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            external_id: external_id.into(),
            properties: Value::Object(Map::new()),
            attributes: Map::new(),
            dependencies: Vec::new(),
            applied_at: Utc::now(),
            status: ApplyStatus::Succeeded,
        }
    }

    /// Set the applied properties.
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    /// Set the output attributes.
    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Set the recorded dependency ids.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Set the apply status.
    pub fn with_status(mut self, status: ApplyStatus) -> Self {
        self.status = status;
        self
    }

    /// The driver's view of this record.
    pub fn current(&self) -> CurrentResource {
        CurrentResource {
            external_id: self.external_id.clone(),
            properties: self.properties.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// All records, keyed by resource id.
pub type StateSnapshot = BTreeMap<String, StateRecord>;

/// Storage for state records.
///
/// `put` must replace a record atomically. The executor may call `put` for
/// different ids concurrently.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read one record.
    async fn get(&self, id: &str) -> Result<Option<StateRecord>, StateStoreError>;

    /// Write one record, replacing any previous one.
    async fn put(&self, id: &str, record: &StateRecord) -> Result<(), StateStoreError>;

    /// Remove one record. Removing a missing record is not an error.
    async fn delete(&self, id: &str) -> Result<(), StateStoreError>;

    /// Read every record.
    async fn snapshot(&self) -> Result<StateSnapshot, StateStoreError>;
}

/// In-memory state, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<StateSnapshot>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            records: RwLock::new(snapshot),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &str) -> Result<Option<StateRecord>, StateStoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, record: &StateRecord) -> Result<(), StateStoreError> {
        self.records
            .write()
            .await
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StateStoreError> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn snapshot(&self) -> Result<StateSnapshot, StateStoreError> {
        Ok(self.records.read().await.clone())
    }
}

/// One async mutex per key, created on first use.
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

#[derive(Serialize, Deserialize)]
struct StateFile<R> {
    version: u32,
    id: String,
    record: R,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// File-backed state: one JSON file per resource under `<root>/resources`.
#[derive(Debug)]
pub struct FileStateStore {
    root: PathBuf,
    writes: KeyedLocks,
}

impl FileStateStore {
    /// Create a store rooted at `root`. Nothing is touched until first use.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            writes: KeyedLocks::default(),
        }
    }

    /// The state directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resources_dir(&self) -> PathBuf {
        self.root.join(RESOURCES_DIR)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    fn record_path(&self, id: &str) -> Result<PathBuf, StateStoreError> {
        if !is_valid_identifier(id) {
            return Err(StateStoreError::InvalidKey(id.to_string()));
        }
        Ok(self.resources_dir().join(format!("{}.json", id)))
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<(), StateStoreError> {
        if !fs::try_exists(dir).await.unwrap_or(false) {
            fs::create_dir_all(dir).await.map_err(|source| io_error(dir, source))?;
            tracing::debug!("Created state directory: {}", dir.display());
        }
        Ok(())
    }

    async fn load(&self, id: &str, path: &Path) -> Result<Option<StateRecord>, StateStoreError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(path, source)),
        };

        let probe: VersionProbe = serde_json::from_str(&content).map_err(|source| {
            StateStoreError::Serialization {
                id: id.to_string(),
                source,
            }
        })?;
        if probe.version > STATE_VERSION {
            return Err(StateStoreError::UnsupportedVersion {
                found: probe.version,
                supported: STATE_VERSION,
            });
        }

        let file: StateFile<StateRecord> =
            serde_json::from_str(&content).map_err(|source| StateStoreError::Serialization {
                id: id.to_string(),
                source,
            })?;
        Ok(Some(file.record))
    }

    /// Take the run lock.
    ///
    /// The lock file is created exclusively, so only one caller can win it.
    /// Fails with [`StateStoreError::Locked`] while another holder's lock is
    /// less than an hour old; an older lock is considered stale and replaced
    /// once.
    pub async fn acquire_lock(&self) -> Result<StateLock, StateStoreError> {
        self.ensure_dir(&self.root).await?;

        let lock_path = self.lock_path();
        let info = LockInfo {
            holder: format!(
                "{}:{}",
                std::env::var("HOSTNAME")
                    .or_else(|_| std::env::var("HOST"))
                    .unwrap_or_else(|_| "unknown".to_string()),
                std::process::id()
            ),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_vec_pretty(&info).map_err(|source| {
            StateStoreError::Serialization {
                id: LOCK_FILE.to_string(),
                source,
            }
        })?;

        match create_lock_file(&lock_path, &content).await {
            Ok(()) => return Ok(StateLock::acquired(lock_path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {},
            Err(source) => return Err(io_error(&lock_path, source)),
        }

        if let Some(held) = read_lock_info(&lock_path).await? {
            let age = Utc::now().signed_duration_since(held.acquired_at);
            if age.num_hours() < 1 {
                return Err(held.into_locked());
            }
            tracing::warn!(holder = %held.holder, "Removing stale state lock");
            match fs::remove_file(&lock_path).await {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(source) => return Err(io_error(&lock_path, source)),
            }
        }

        match create_lock_file(&lock_path, &content).await {
            Ok(()) => Ok(StateLock::acquired(lock_path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_lock_info(&lock_path).await?.unwrap_or(LockInfo {
                    holder: "unknown".to_string(),
                    acquired_at: Utc::now(),
                });
                Err(holder.into_locked())
            },
            Err(source) => Err(io_error(&lock_path, source)),
        }
    }
}

async fn create_lock_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(content).await?;
    file.sync_all().await
}

/// The current holder, or `None` if the lock vanished. A lock file that
/// cannot be parsed (a holder that died mid-write) is dated by its mtime.
async fn read_lock_info(path: &Path) -> Result<Option<LockInfo>, StateStoreError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(path, source)),
    };
    if let Ok(info) = serde_json::from_str(&content) {
        return Ok(Some(info));
    }
    let modified = fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .map_err(|source| io_error(path, source))?;
    Ok(Some(LockInfo {
        holder: "unknown".to_string(),
        acquired_at: DateTime::<Utc>::from(modified),
    }))
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, id: &str) -> Result<Option<StateRecord>, StateStoreError> {
        let path = self.record_path(id)?;
        self.load(id, &path).await
    }

    async fn put(&self, id: &str, record: &StateRecord) -> Result<(), StateStoreError> {
        let path = self.record_path(id)?;
        let _guard = self.writes.lock(id).await;
        self.ensure_dir(&self.resources_dir()).await?;

        let file = StateFile {
            version: STATE_VERSION,
            id: id.to_string(),
            record,
        };
        let content =
            serde_json::to_vec_pretty(&file).map_err(|source| StateStoreError::Serialization {
                id: id.to_string(),
                source,
            })?;

        let tmp = path.with_extension("json.tmp");
        let mut out = fs::File::create(&tmp)
            .await
            .map_err(|source| io_error(&tmp, source))?;
        out.write_all(&content)
            .await
            .map_err(|source| io_error(&tmp, source))?;
        out.sync_all().await.map_err(|source| io_error(&tmp, source))?;
        drop(out);
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| io_error(&path, source))?;

        tracing::debug!(id, status = %record.status, "Saved state record");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StateStoreError> {
        let path = self.record_path(id)?;
        let _guard = self.writes.lock(id).await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(id, "Removed state record");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error(&path, source)),
        }
    }

    async fn snapshot(&self) -> Result<StateSnapshot, StateStoreError> {
        let dir = self.resources_dir();
        let mut snapshot = StateSnapshot::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("State directory not found, returning empty state");
                return Ok(snapshot);
            },
            Err(source) => return Err(io_error(&dir, source)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error(&dir, source))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if let Some(record) = self.load(&id, &path).await? {
                snapshot.insert(id, record);
            }
        }

        tracing::debug!("Loaded state with {} resources", snapshot.len());
        Ok(snapshot)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StateStoreError {
    StateStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn into_locked(self) -> StateStoreError {
        StateStoreError::Locked {
            holder: self.holder,
            since: self.acquired_at.to_rfc3339(),
        }
    }
}

/// RAII guard for the run lock.
#[derive(Debug)]
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    fn acquired(lock_path: PathBuf) -> Self {
        tracing::debug!("Acquired state lock");
        Self {
            lock_path,
            released: false,
        }
    }

    /// Release the lock.
    pub async fn release(mut self) -> Result<(), StateStoreError> {
        if !self.released {
            match fs::remove_file(&self.lock_path).await {
                Ok(()) => tracing::debug!("Released state lock"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(source) => return Err(io_error(&self.lock_path, source)),
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}
