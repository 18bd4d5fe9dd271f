//! Durable storage of the watermark
//!
//! The state lives in a single named record of a key/value backend, under
//! the data key [`CONFIG_DATA_KEY`]. [`StateStore`] owns the record's
//! lifecycle (create-if-absent at startup, load per cycle, fetch-modify-write
//! on save); [`RecordBackend`] is the narrow interface to the backend itself.

use crate::logging::log;
use crate::state::StateRecord;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Data key holding the serialized `StateRecord`
pub const CONFIG_DATA_KEY: &str = "configdata";

/// A named record as held by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub name: String,
    pub namespace: String,
    /// Incremented by every successful update; used for optimistic concurrency
    pub resource_version: u64,
    pub data: BTreeMap<String, String>,
}

impl StoredRecord {
    pub fn new(namespace: &str, name: &str) -> Self {
        StoredRecord {
            name: name.to_string(),
            namespace: namespace.to_string(),
            resource_version: 0,
            data: BTreeMap::new(),
        }
    }
}

/// Errors reported by a record backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("record {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("record {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },
    #[error("record {namespace}/{name} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        namespace: String,
        name: String,
        expected: u64,
        found: u64,
    },
    #[error("invalid record name {0:?}")]
    InvalidName(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("record file {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

/// Key/value backend holding named records
///
/// Implementations are assumed to have a single writer per record;
/// `update` must reject writes based on a stale `resource_version`.
pub trait RecordBackend {
    /// Fetch a record, `BackendError::NotFound` if it does not exist
    fn get(&self, namespace: &str, name: &str) -> Result<StoredRecord, BackendError>;

    /// Create a record, `BackendError::AlreadyExists` if it exists
    fn create(&self, record: &StoredRecord) -> Result<StoredRecord, BackendError>;

    /// Replace a record previously obtained with `get`
    fn update(&self, record: &StoredRecord) -> Result<StoredRecord, BackendError>;
}

impl<B: RecordBackend + ?Sized> RecordBackend for Arc<B> {
    fn get(&self, namespace: &str, name: &str) -> Result<StoredRecord, BackendError> {
        (**self).get(namespace, name)
    }

    fn create(&self, record: &StoredRecord) -> Result<StoredRecord, BackendError> {
        (**self).create(record)
    }

    fn update(&self, record: &StoredRecord) -> Result<StoredRecord, BackendError> {
        (**self).update(record)
    }
}

/// Record backend keeping one JSON file per record
///
/// Layout: `<root>/<namespace>/<name>.json`. Writes go to a temporary file
/// in the same directory and are renamed into place while holding an
/// exclusive flock on `<root>/<namespace>/<name>.lock`.
#[derive(Debug, Clone)]
pub struct FileRecordBackend {
    root: PathBuf,
}

impl FileRecordBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FileRecordBackend {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn check_name(value: &str) -> Result<(), BackendError> {
        if value.is_empty()
            || value == "."
            || value == ".."
            || value.contains('/')
            || value.contains('\\')
        {
            return Err(BackendError::InvalidName(value.to_string()));
        }
        Ok(())
    }

    fn record_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn record_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.record_dir(namespace).join(format!("{}.json", name))
    }

    /// Takes the per-record write lock; released when the returned file is dropped
    fn lock(&self, namespace: &str, name: &str) -> Result<File, BackendError> {
        let dir = self.record_dir(namespace);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        let lock_path = dir.join(format!("{}.lock", name));
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| io_error(&lock_path, e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| io_error(&lock_path, e))?;
        Ok(lock_file)
    }

    fn read(&self, namespace: &str, name: &str) -> Result<StoredRecord, BackendError> {
        let path = self.record_path(namespace, name);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        serde_json::from_str(&contents).map_err(|e| BackendError::Corrupt {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn write(&self, record: &StoredRecord) -> Result<(), BackendError> {
        let dir = self.record_dir(&record.namespace);
        let path = self.record_path(&record.namespace, &record.name);

        let json = serde_json::to_vec_pretty(record).map_err(|e| BackendError::Corrupt {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| io_error(&dir, e))?;
        tmp.write_all(&json).map_err(|e| io_error(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| io_error(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| io_error(&path, e.error))?;
        Ok(())
    }
}

fn io_error(path: &Path, source: io::Error) -> BackendError {
    BackendError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl RecordBackend for FileRecordBackend {
    fn get(&self, namespace: &str, name: &str) -> Result<StoredRecord, BackendError> {
        Self::check_name(namespace)?;
        Self::check_name(name)?;
        self.read(namespace, name)
    }

    fn create(&self, record: &StoredRecord) -> Result<StoredRecord, BackendError> {
        Self::check_name(&record.namespace)?;
        Self::check_name(&record.name)?;
        let _lock = self.lock(&record.namespace, &record.name)?;

        match self.read(&record.namespace, &record.name) {
            Ok(_) => {
                return Err(BackendError::AlreadyExists {
                    namespace: record.namespace.clone(),
                    name: record.name.clone(),
                })
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut created = record.clone();
        created.resource_version = 1;
        self.write(&created)?;
        Ok(created)
    }

    fn update(&self, record: &StoredRecord) -> Result<StoredRecord, BackendError> {
        Self::check_name(&record.namespace)?;
        Self::check_name(&record.name)?;
        let _lock = self.lock(&record.namespace, &record.name)?;

        let current = self.read(&record.namespace, &record.name)?;
        if current.resource_version != record.resource_version {
            return Err(BackendError::Conflict {
                namespace: record.namespace.clone(),
                name: record.name.clone(),
                expected: record.resource_version,
                found: current.resource_version,
            });
        }

        let mut updated = record.clone();
        updated.resource_version = current.resource_version + 1;
        self.write(&updated)?;
        Ok(updated)
    }
}

/// State store failures, one variant per failure class of a poll cycle
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state record {record} not ready after {attempts} attempts: {source}")]
    Initialization {
        record: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },
    #[error("failed to load state record {record}: {source}")]
    Load {
        record: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to decode state record {record}: {source}")]
    Decode {
        record: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode state record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to save state record {record}: {source}")]
    Save {
        record: String,
        #[source]
        source: BackendError,
    },
}

/// Default retry interval while the backend is not ready
pub const DEFAULT_INIT_INTERVAL: Duration = Duration::from_secs(1);
/// Default deadline for `StateStore::initialize`
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Load/save access to the watermark record
#[derive(Debug)]
pub struct StateStore<B> {
    backend: B,
    namespace: String,
    name: String,
    init_interval: Duration,
    init_timeout: Duration,
}

impl<B: RecordBackend> StateStore<B> {
    pub fn new(backend: B, namespace: &str, name: &str) -> Self {
        StateStore {
            backend,
            namespace: namespace.to_string(),
            name: name.to_string(),
            init_interval: DEFAULT_INIT_INTERVAL,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }

    /// Overrides how long and how often `initialize` polls a backend that is not ready
    pub fn with_init_policy(mut self, interval: Duration, timeout: Duration) -> Self {
        self.init_interval = interval;
        self.init_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// `namespace/name` of the record, used in logs and errors
    pub fn record_id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Makes sure the record exists, creating an empty one if absent
    ///
    /// Any backend error other than "not found" is retried every
    /// `init_interval` until `init_timeout` has passed, because the backend
    /// may still be starting when this process starts. A record created by
    /// someone else between our get and create is fetched again on the next
    /// attempt. A timeout too large to represent as a deadline retries
    /// without limit.
    ///
    /// # Errors
    /// `StoreError::Initialization` with the last backend error once the
    /// deadline is exceeded.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let _ = log(&format!("Initializing state store {}", self.record_id()));
        let deadline = Instant::now().checked_add(self.init_timeout);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let failure = match self.backend.get(&self.namespace, &self.name) {
                Ok(stored) => {
                    self.log_existing(&stored);
                    return Ok(());
                }
                Err(e) if e.is_not_found() => match self.create_default() {
                    Ok(()) => {
                        let _ = log(&format!("Created empty state record {}", self.record_id()));
                        return Ok(());
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(StoreError::Initialization {
                        record: self.record_id(),
                        attempts,
                        source: failure,
                    });
                }
                Some(deadline) => self.init_interval.min(deadline - now),
                None => self.init_interval,
            };
            let _ = log(&format!(
                "State store {} not ready (attempt {}): {}, retrying",
                self.record_id(),
                attempts,
                failure
            ));
            thread::sleep(pause);
        }
    }

    fn log_existing(&self, stored: &StoredRecord) {
        let payload = stored.data.get(CONFIG_DATA_KEY).map(String::as_str).unwrap_or("");
        match StateRecord::decode(payload) {
            Ok(state) => {
                let _ = log(&format!(
                    "Loaded state record {}: last file '{}', last modification time {}",
                    self.record_id(),
                    state.last_file_processed,
                    state.last_mod_time.to_rfc3339()
                ));
            }
            Err(e) => {
                let _ = log(&format!(
                    "Warning: state record {} exists but cannot be decoded: {}",
                    self.record_id(),
                    e
                ));
            }
        }
    }

    fn create_default(&self) -> Result<(), BackendError> {
        let payload = StateRecord::default().encode().map_err(|e| BackendError::Corrupt {
            path: self.record_id(),
            source: e,
        })?;
        let mut record = StoredRecord::new(&self.namespace, &self.name);
        record.data.insert(CONFIG_DATA_KEY.to_string(), payload);
        self.backend.create(&record)?;
        Ok(())
    }

    /// Fetches and decodes the current watermark
    pub fn load(&self) -> Result<StateRecord, StoreError> {
        let stored = self
            .backend
            .get(&self.namespace, &self.name)
            .map_err(|e| StoreError::Load {
                record: self.record_id(),
                source: e,
            })?;
        let payload = stored.data.get(CONFIG_DATA_KEY).map(String::as_str).unwrap_or("");
        StateRecord::decode(payload).map_err(|e| StoreError::Decode {
            record: self.record_id(),
            source: e,
        })
    }

    /// Writes the watermark into the current version of the record
    ///
    /// Other data keys of the record are preserved. A concurrent write
    /// between the fetch and the update surfaces as `StoreError::Save`.
    pub fn save(&self, state: &StateRecord) -> Result<(), StoreError> {
        let payload = state.encode().map_err(StoreError::Encode)?;
        let save_error = |e: BackendError| StoreError::Save {
            record: self.record_id(),
            source: e,
        };

        let mut stored = self
            .backend
            .get(&self.namespace, &self.name)
            .map_err(save_error)?;
        stored.data.insert(CONFIG_DATA_KEY.to_string(), payload);
        self.backend.update(&stored).map_err(save_error)?;
        Ok(())
    }
}
