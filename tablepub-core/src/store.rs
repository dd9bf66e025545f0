//! Persistence for datasets and Error Records.
//!
//! Every write replaces a whole dataset at once; concurrent edits to the same
//! dataset are last-write-wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::dataset::Dataset;
use crate::error::StoreError;
use crate::storage::write_atomically;

/// Failure messages kept for clients polling a background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub job_id: String,
    pub messages: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// A record stamped with the current time.
    pub fn new(job_id: impl Into<String>, messages: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            messages,
            created_at: Utc::now(),
        }
    }
}

/// Storage for persisted datasets and Error Records.
pub trait DatasetStore: Send + Sync {
    /// Insert or replace a dataset together with its files.
    fn save_dataset(&self, dataset: &Dataset) -> Result<(), StoreError>;

    fn find_dataset(&self, id: Uuid) -> Result<Option<Dataset>, StoreError>;

    /// Remove a dataset, returning it if it existed.
    fn delete_dataset(&self, id: Uuid) -> Result<Option<Dataset>, StoreError>;

    fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError>;

    /// Insert or replace the record for `record.job_id`.
    fn record_error(&self, record: ErrorRecord) -> Result<(), StoreError>;

    fn find_error(&self, job_id: &str) -> Result<Option<ErrorRecord>, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    datasets: HashMap<Uuid, Dataset>,
    #[serde(default)]
    errors: HashMap<String, ErrorRecord>,
}

impl StoreState {
    fn sorted_datasets(&self) -> Vec<Dataset> {
        let mut datasets: Vec<Dataset> = self.datasets.values().cloned().collect();
        datasets.sort_by_key(|d| d.created_at);
        datasets
    }
}

fn read(state: &RwLock<StoreState>) -> Result<RwLockReadGuard<'_, StoreState>, StoreError> {
    state.read().map_err(|_| StoreError::Poisoned)
}

fn write(state: &RwLock<StoreState>) -> Result<RwLockWriteGuard<'_, StoreState>, StoreError> {
    state.write().map_err(|_| StoreError::Poisoned)
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatasetStore for MemoryStore {
    fn save_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        write(&self.state)?
            .datasets
            .insert(dataset.id, dataset.clone());
        Ok(())
    }

    fn find_dataset(&self, id: Uuid) -> Result<Option<Dataset>, StoreError> {
        Ok(read(&self.state)?.datasets.get(&id).cloned())
    }

    fn delete_dataset(&self, id: Uuid) -> Result<Option<Dataset>, StoreError> {
        Ok(write(&self.state)?.datasets.remove(&id))
    }

    fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        Ok(read(&self.state)?.sorted_datasets())
    }

    fn record_error(&self, record: ErrorRecord) -> Result<(), StoreError> {
        write(&self.state)?
            .errors
            .insert(record.job_id.clone(), record);
        Ok(())
    }

    fn find_error(&self, job_id: &str) -> Result<Option<ErrorRecord>, StoreError> {
        Ok(read(&self.state)?.errors.get(job_id).cloned())
    }
}

/// Store backed by a single JSON document, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl JsonStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| persistence(&path, e))?;
            serde_json::from_str(&raw).map_err(|e| persistence(&path, e))?
        } else {
            StoreState::default()
        };
        debug!(
            path = %path.display(),
            datasets = state.datasets.len(),
            "Opened dataset store"
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn flush(&self, state: &StoreState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state).map_err(|e| persistence(&self.path, e))?;
        write_atomically(&self.path, &json).map_err(|e| persistence(&self.path, e))
    }

    /// Apply `f` to a copy of the state and swap it in once it is on disk.
    /// A failed write leaves memory matching the file.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T, StoreError> {
        let mut state = write(&self.state)?;
        let mut next = state.clone();
        let out = f(&mut next);
        self.flush(&next)?;
        *state = next;
        Ok(out)
    }
}

fn persistence(path: &Path, e: impl std::fmt::Display) -> StoreError {
    StoreError::Persistence {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

impl DatasetStore for JsonStore {
    fn save_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.datasets.insert(dataset.id, dataset.clone());
        })
    }

    fn find_dataset(&self, id: Uuid) -> Result<Option<Dataset>, StoreError> {
        Ok(read(&self.state)?.datasets.get(&id).cloned())
    }

    fn delete_dataset(&self, id: Uuid) -> Result<Option<Dataset>, StoreError> {
        self.mutate(|state| state.datasets.remove(&id))
    }

    fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        Ok(read(&self.state)?.sorted_datasets())
    }

    fn record_error(&self, record: ErrorRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.errors.insert(record.job_id.clone(), record);
        })
    }

    fn find_error(&self, job_id: &str) -> Result<Option<ErrorRecord>, StoreError> {
        Ok(read(&self.state)?.errors.get(job_id).cloned())
    }
}
