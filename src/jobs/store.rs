//! Durable job records.
//!
//! The orchestrator keeps its own in-memory index and writes records through
//! the store on every state transition. The file store is what makes crash
//! recovery work: one JSON file per job, written to a temp path and renamed
//! so a crash mid-write never leaves a torn record.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::Job;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown job store kind: {0} (expected 'file' or 'memory')")]
    UnknownKind(String),

    #[error("Job store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode job record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Which store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStoreKind {
    File,
    Memory,
}

impl JobStoreKind {
    pub fn from_str(value: &str) -> Result<Self, StoreError> {
        match value.to_lowercase().as_str() {
            "file" => Ok(JobStoreKind::File),
            "memory" => Ok(JobStoreKind::Memory),
            other => Err(StoreError::UnknownKind(other.to_string())),
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// True when records survive a process restart.
    fn is_persistent(&self) -> bool;

    /// Write one record, replacing any previous version.
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// Load every record. Unreadable records are skipped, not fatal.
    async fn load_all(&self) -> Result<Vec<Job>, StoreError>;

    /// Delete one record. Returns false if it was not present.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Build the configured store, creating its directory when needed.
pub async fn create_job_store(
    kind: JobStoreKind,
    dir: &Path,
) -> Result<Arc<dyn JobStore>, StoreError> {
    match kind {
        JobStoreKind::Memory => {
            info!("Using in-memory job store (records are lost on restart)");
            Ok(Arc::new(MemoryJobStore::new()))
        }
        JobStoreKind::File => {
            let store = FileJobStore::new(dir).await?;
            info!("Using file job store at {}", dir.display());
            Ok(Arc::new(store))
        }
    }
}

/// Volatile store for tests and ephemeral deployments.
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }
}

/// One JSON file per job under a spool directory.
pub struct FileJobStore {
    dir: PathBuf,
    /// Serializes writers so temp files never collide.
    persist_lock: Mutex<()>,
}

impl FileJobStore {
    pub async fn new(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).await.map_err(|e| StoreError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            persist_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().await;
        let path = self.record_path(job.id);
        let tmp_path = path.with_extension("json.tmp");

        let body = serde_json::to_string_pretty(job)?;
        fs::write(&tmp_path, body).await.map_err(|e| StoreError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;

        debug!("Persisted job {} ({})", job.id, job.status);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| StoreError::Io {
            path: self.dir.clone(),
            source: e,
        })?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::Io {
            path: self.dir.clone(),
            source: e,
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(body) => match serde_json::from_str::<Job>(&body) {
                    Ok(job) => jobs.push(job),
                    Err(e) => warn!("Skipping unreadable job record {}: {}", path.display(), e),
                },
                Err(e) => warn!("Skipping unreadable job record {}: {}", path.display(), e),
            }
        }

        Ok(jobs)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.persist_lock.lock().await;
        let path = self.record_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }
}
