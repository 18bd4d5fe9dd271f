//! In-process fakes for the three external collaborators

use crate::protocols::{DirectoryLister, FileInfo, ListingError};
use crate::publisher::{DeliveryError, EventPublisher};
use crate::store::{BackendError, RecordBackend, StoredRecord, CONFIG_DATA_KEY};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub fn file(name: &str, size: u64, secs: i64) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        size,
        mod_time: Utc.timestamp_opt(secs, 0).unwrap(),
    }
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<(String, String), StoredRecord>,
    failing_gets: u32,
    fail_updates: bool,
    gets: u32,
    updates: u32,
}

/// Record backend kept in memory, with failure injection
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to `get` fail with `Unavailable`
    pub fn fail_next_gets(&self, n: u32) {
        self.state.lock().unwrap().failing_gets = n;
    }

    pub fn fail_updates(&self, fail: bool) {
        self.state.lock().unwrap().fail_updates = fail;
    }

    /// Stores `data` under the state key, creating the record if needed
    pub fn put_raw(&self, namespace: &str, name: &str, data: &str) {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .entry((namespace.to_string(), name.to_string()))
            .or_insert_with(|| {
                let mut r = StoredRecord::new(namespace, name);
                r.resource_version = 1;
                r
            });
        record
            .data
            .insert(CONFIG_DATA_KEY.to_string(), data.to_string());
    }

    pub fn data(&self, namespace: &str, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .records
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|r| r.data.get(CONFIG_DATA_KEY).cloned())
    }

    pub fn gets(&self) -> u32 {
        self.state.lock().unwrap().gets
    }

    pub fn updates(&self) -> u32 {
        self.state.lock().unwrap().updates
    }
}

impl RecordBackend for MemoryBackend {
    fn get(&self, namespace: &str, name: &str) -> Result<StoredRecord, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.gets += 1;
        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(BackendError::Unavailable("connection refused".to_string()));
        }
        state
            .records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn create(&self, record: &StoredRecord) -> Result<StoredRecord, BackendError> {
        let mut state = self.state.lock().unwrap();
        let key = (record.namespace.clone(), record.name.clone());
        if state.records.contains_key(&key) {
            return Err(BackendError::AlreadyExists {
                namespace: record.namespace.clone(),
                name: record.name.clone(),
            });
        }
        let mut created = record.clone();
        created.resource_version = 1;
        state.records.insert(key, created.clone());
        Ok(created)
    }

    fn update(&self, record: &StoredRecord) -> Result<StoredRecord, BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_updates {
            return Err(BackendError::Unavailable("update rejected".to_string()));
        }
        let key = (record.namespace.clone(), record.name.clone());
        let current = state
            .records
            .get(&key)
            .ok_or_else(|| BackendError::NotFound {
                namespace: record.namespace.clone(),
                name: record.name.clone(),
            })?;
        if current.resource_version != record.resource_version {
            return Err(BackendError::Conflict {
                namespace: record.namespace.clone(),
                name: record.name.clone(),
                expected: record.resource_version,
                found: current.resource_version,
            });
        }
        let mut updated = record.clone();
        updated.resource_version += 1;
        state.updates += 1;
        state.records.insert(key, updated.clone());
        Ok(updated)
    }
}

/// Lister returning queued results, then repeating `fallback`
#[derive(Clone, Default)]
pub struct ScriptedLister {
    script: Arc<Mutex<VecDeque<Result<Vec<FileInfo>, ListingError>>>>,
    fallback: Arc<Mutex<Vec<FileInfo>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLister {
    pub fn new(fallback: Vec<FileInfo>) -> Self {
        let lister = Self::default();
        *lister.fallback.lock().unwrap() = fallback;
        lister
    }

    pub fn push(&self, result: Result<Vec<FileInfo>, ListingError>) {
        self.script.lock().unwrap().push_back(result);
    }

    /// Directories passed to `list`, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl DirectoryLister for ScriptedLister {
    fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, ListingError> {
        self.calls.lock().unwrap().push(dir.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(self.fallback.lock().unwrap().clone()),
        }
    }
}

/// Publisher recording every attempted delivery
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    attempts: Arc<Mutex<Vec<String>>>,
    delivered: Arc<Mutex<Vec<String>>>,
    fail_on_attempt: Arc<Mutex<Option<usize>>>,
    fail_names: Arc<Mutex<Vec<String>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the attempt with this 1-based index (counted over the publisher's lifetime)
    pub fn fail_on_attempt(&self, attempt: usize) {
        *self.fail_on_attempt.lock().unwrap() = Some(attempt);
    }

    /// Fails every attempt to deliver `name`
    pub fn fail_on_name(&self, name: &str) {
        self.fail_names.lock().unwrap().push(name.to_string());
    }

    pub fn clear_failures(&self) {
        *self.fail_on_attempt.lock().unwrap() = None;
        self.fail_names.lock().unwrap().clear();
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

impl EventPublisher for RecordingPublisher {
    fn send(&mut self, file: &FileInfo) -> Result<(), DeliveryError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(file.name.clone());
            attempts.len()
        };
        let failing = *self.fail_on_attempt.lock().unwrap() == Some(attempt)
            || self.fail_names.lock().unwrap().contains(&file.name);
        if failing {
            return Err(DeliveryError::Rejected {
                name: file.name.clone(),
                status: 503,
            });
        }
        self.delivered.lock().unwrap().push(file.name.clone());
        Ok(())
    }
}
