//! Job executor trait and per-job context.
//!
//! An executor implements one job type end to end. The orchestrator hands it
//! a `JobContext` carrying the job's parameters, a progress handle for stage
//! reporting and a cancellation token it is expected to poll between units
//! of work. Executors return a short human-readable summary on success; the
//! orchestrator owns all status transitions.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::JobStore;
use super::types::{stage_progress, Job, JobStage, JobType};

/// Everything an executor needs to run one job.
pub struct JobContext {
    pub job_id: Uuid,
    pub params: Value,
    pub progress: ProgressHandle,
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Bail out if cancellation was requested. Executors call this between
    /// stages so a cancel lands at the next safe point instead of mid-write.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("job cancelled");
        }
        Ok(())
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Run the job to completion. The returned string is a one-line summary
    /// stored as the job result and relayed to the owning session.
    async fn run(&self, ctx: JobContext) -> Result<String>;
}

/// Executors keyed by the job type they handle.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) {
        let job_type = executor.job_type();
        if self.executors.insert(job_type, executor).is_some() {
            warn!("Replacing executor for job type {}", job_type.label());
        }
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(&job_type).cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.executors.contains_key(&job_type)
    }
}

/// Stage reporter shared between an executor and the orchestrator's job
/// index. Progress only ever moves forward: a stage that maps to a lower
/// percentage than the job already shows is logged and dropped.
#[derive(Clone)]
pub struct ProgressHandle {
    job_id: Uuid,
    job_type: JobType,
    index: Arc<Mutex<HashMap<Uuid, Job>>>,
    store: Arc<dyn JobStore>,
}

impl ProgressHandle {
    pub fn new(
        job_id: Uuid,
        job_type: JobType,
        index: Arc<Mutex<HashMap<Uuid, Job>>>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            job_id,
            job_type,
            index,
            store,
        }
    }

    /// Record that the job entered `stage`, updating the in-memory index and
    /// persisting the snapshot. Persistence failures are logged, not fatal:
    /// the in-memory view stays authoritative while the process lives.
    pub async fn stage(&self, stage: JobStage) {
        let snapshot = {
            let mut index = self.index.lock().await;
            let Some(job) = index.get_mut(&self.job_id) else {
                return;
            };
            let percent = stage_progress(self.job_type, stage);
            if percent < job.progress_percent {
                warn!(
                    "Job {}: ignoring out-of-order stage {:?} ({}% < {}%)",
                    self.job_id, stage, percent, job.progress_percent
                );
                return;
            }
            job.stage = stage;
            job.progress_percent = percent;
            job.touch();
            debug!("Job {}: stage {:?} ({}%)", self.job_id, stage, percent);
            job.clone()
        };

        if let Err(e) = self.store.save(&snapshot).await {
            warn!("Job {}: failed to persist progress: {:#}", self.job_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::MemoryJobStore;
    use serde_json::json;

    struct NoopExecutor(JobType);

    #[async_trait]
    impl JobExecutor for NoopExecutor {
        fn job_type(&self) -> JobType {
            self.0
        }

        async fn run(&self, _ctx: JobContext) -> Result<String> {
            Ok("done".to_string())
        }
    }

    fn seeded_index(job: &Job) -> Arc<Mutex<HashMap<Uuid, Job>>> {
        let mut map = HashMap::new();
        map.insert(job.id, job.clone());
        Arc::new(Mutex::new(map))
    }

    #[tokio::test]
    async fn stage_reports_advance_progress_and_persist() {
        let job = Job::new(JobType::Transcription, json!({}), None);
        let index = seeded_index(&job);
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let progress = ProgressHandle::new(
            job.id,
            JobType::Transcription,
            Arc::clone(&index),
            Arc::clone(&store),
        );

        progress.stage(JobStage::Downloading).await;
        progress.stage(JobStage::Transcribing).await;

        let current = index.lock().await.get(&job.id).cloned().unwrap();
        assert_eq!(current.stage, JobStage::Transcribing);
        assert_eq!(current.progress_percent, 60);

        let persisted = store.load_all().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].progress_percent, 60);
    }

    #[tokio::test]
    async fn out_of_order_stage_never_moves_progress_backwards() {
        let job = Job::new(JobType::Transcription, json!({}), None);
        let index = seeded_index(&job);
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let progress =
            ProgressHandle::new(job.id, JobType::Transcription, Arc::clone(&index), store);

        progress.stage(JobStage::Transcribing).await;
        progress.stage(JobStage::Downloading).await;

        let current = index.lock().await.get(&job.id).cloned().unwrap();
        assert_eq!(current.stage, JobStage::Transcribing);
        assert_eq!(current.progress_percent, 60);
    }

    #[tokio::test]
    async fn stage_report_for_unknown_job_is_ignored() {
        let index: Arc<Mutex<HashMap<Uuid, Job>>> = Arc::new(Mutex::new(HashMap::new()));
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let progress =
            ProgressHandle::new(Uuid::new_v4(), JobType::Bootstrap, index, Arc::clone(&store));

        progress.stage(JobStage::ScanningLibrary).await;

        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_cancelled_bails_once_token_fires() {
        let job = Job::new(JobType::Extraction, json!({}), None);
        let index = seeded_index(&job);
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let ctx = JobContext {
            job_id: job.id,
            params: json!({}),
            progress: ProgressHandle::new(job.id, JobType::Extraction, index, store),
            cancel: CancellationToken::new(),
        };

        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel.cancel();
        assert!(ctx.check_cancelled().is_err());
    }

    #[test]
    fn registry_resolves_by_job_type() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor(JobType::Transcription)));
        registry.register(Arc::new(NoopExecutor(JobType::Bootstrap)));

        assert!(registry.contains(JobType::Transcription));
        assert!(registry.contains(JobType::Bootstrap));
        assert!(!registry.contains(JobType::Extraction));
        assert_eq!(
            registry.get(JobType::Bootstrap).unwrap().job_type(),
            JobType::Bootstrap
        );
    }
}
