//! Background job orchestrator.
//!
//! Jobs are submitted to an unbounded intake queue and executed by a fixed
//! pool of workers, so at most `max_concurrent_jobs` run at once. Every
//! state transition is written through to the job store; on startup
//! `recover` reloads the store, re-queues jobs that were interrupted mid-run
//! and keeps terminal records visible for status queries. Cancellation is
//! cooperative: each running job gets a `CancellationToken` that executors
//! poll between stages.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{ExecutorRegistry, JobContext, ProgressHandle};
use super::store::{JobStore, StoreError};
use super::types::{
    stage_sequence, Job, JobFailure, JobStage, JobStatus, JobStatusFilter, JobType,
};
use crate::session::ContinuationBridge;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown job: {0}")]
    UnknownJob(Uuid),

    #[error("job {id} is already {status} and cannot be cancelled")]
    NotCancellable { id: Uuid, status: JobStatus },

    #[error("no executor registered for job type {}", .0.label())]
    NoExecutor(JobType),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    executors: ExecutorRegistry,
    /// In-memory view of every known job, terminal ones included.
    index: Arc<Mutex<HashMap<Uuid, Job>>>,
    /// Cancellation tokens for jobs currently executing.
    cancels: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Dropped on shutdown so further submits are rejected.
    intake_tx: StdMutex<Option<mpsc::UnboundedSender<Uuid>>>,
    intake_rx: Mutex<mpsc::UnboundedReceiver<Uuid>>,
    worker_count: usize,
    /// Gates execution separately from intake draining, so the running-job
    /// bound holds even if dequeueing ever outpaces execution.
    execution_gate: Arc<Semaphore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    continuation: Option<Arc<ContinuationBridge>>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        executors: ExecutorRegistry,
        max_concurrent: usize,
        continuation: Option<Arc<ContinuationBridge>>,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let worker_count = max_concurrent.max(1);
        Self {
            store,
            executors,
            index: Arc::new(Mutex::new(HashMap::new())),
            cancels: Mutex::new(HashMap::new()),
            intake_tx: StdMutex::new(Some(intake_tx)),
            intake_rx: Mutex::new(intake_rx),
            worker_count,
            execution_gate: Arc::new(Semaphore::new(worker_count)),
            workers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            continuation,
        }
    }

    /// Spawn the worker pool. Call once, after `recover`.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        for n in 0..self.worker_count {
            let this = Arc::clone(self);
            workers.push(tokio::spawn(async move { this.worker_loop(n).await }));
        }
        info!(
            "Job orchestrator started ({} concurrent jobs max)",
            self.worker_count
        );
    }

    /// Accept a new job and queue it for execution.
    pub async fn submit(
        &self,
        job_type: JobType,
        params: serde_json::Value,
        owner_session_id: Option<String>,
    ) -> Result<Job, OrchestratorError> {
        if !self.executors.contains(job_type) {
            return Err(OrchestratorError::NoExecutor(job_type));
        }

        let job = Job::new(job_type, params, owner_session_id);
        let id = job.id;
        self.index.lock().await.insert(id, job.clone());
        if let Err(e) = self.store.save(&job).await {
            warn!("Job {}: failed to persist new job: {:#}", id, e);
        }

        let sent = {
            let tx = self.intake_tx.lock().expect("intake lock poisoned");
            tx.as_ref().map(|tx| tx.send(id).is_ok()).unwrap_or(false)
        };
        if !sent {
            self.index.lock().await.remove(&id);
            if let Err(e) = self.store.delete(id).await {
                warn!("Job {}: failed to roll back persisted record: {:#}", id, e);
            }
            return Err(OrchestratorError::ShuttingDown);
        }

        info!("Job {}: queued {} job", id, job_type.label());
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.index.lock().await.get(&id).cloned()
    }

    /// List known jobs, newest first.
    pub async fn list(&self, status: JobStatusFilter, job_type: Option<JobType>) -> Vec<Job> {
        let mut jobs: Vec<Job> = {
            let index = self.index.lock().await;
            index
                .values()
                .filter(|j| status.matches(j.status))
                .filter(|j| job_type.map_or(true, |t| j.job_type == t))
                .cloned()
                .collect()
        };
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Request cancellation. A pending job is finalized immediately; a
    /// running one is signalled and transitions once its executor observes
    /// the token, so the returned snapshot may still say `Running`.
    pub async fn cancel(&self, id: Uuid) -> Result<Job, OrchestratorError> {
        let (snapshot, was_pending) = {
            let mut index = self.index.lock().await;
            let job = index.get_mut(&id).ok_or(OrchestratorError::UnknownJob(id))?;
            if job.status.is_terminal() {
                return Err(OrchestratorError::NotCancellable {
                    id,
                    status: job.status,
                });
            }
            let was_pending = job.status == JobStatus::Pending;
            if was_pending {
                job.status = JobStatus::Cancelled;
                job.touch();
            }
            (job.clone(), was_pending)
        };

        if was_pending {
            info!("Job {}: cancelled before execution", id);
            self.finalize(&snapshot).await;
        } else {
            if let Some(token) = self.cancels.lock().await.get(&id) {
                token.cancel();
            }
            info!("Job {}: cancellation requested", id);
        }
        Ok(snapshot)
    }

    /// Reload the store after a restart. Terminal records are indexed for
    /// status queries; pending and running ones are reset and re-queued.
    /// Returns the number of re-queued jobs.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let records = self.store.load_all().await?;
        let mut requeued = 0;
        {
            let mut index = self.index.lock().await;
            for mut job in records {
                if job.status.is_terminal() {
                    index.insert(job.id, job);
                    continue;
                }
                info!(
                    "Job {}: recovering interrupted {} job (was {} at {:?})",
                    job.id,
                    job.job_type.label(),
                    job.status,
                    job.stage
                );
                job.status = JobStatus::Pending;
                job.stage = JobStage::Queued;
                job.progress_percent = 0;
                job.result = None;
                job.error = None;
                job.touch();
                if let Err(e) = self.store.save(&job).await {
                    warn!("Job {}: failed to persist recovered job: {:#}", job.id, e);
                }
                let id = job.id;
                index.insert(id, job);

                let sent = {
                    let tx = self.intake_tx.lock().expect("intake lock poisoned");
                    tx.as_ref().map(|tx| tx.send(id).is_ok()).unwrap_or(false)
                };
                if sent {
                    requeued += 1;
                } else {
                    warn!("Job {}: intake closed during recovery", id);
                }
            }
        }
        if requeued > 0 {
            info!("Recovered {} interrupted jobs", requeued);
        }
        Ok(requeued)
    }

    /// Stop accepting work, cancel everything in flight and wait for the
    /// workers to drain. Jobs still not terminal after `grace` are marked
    /// cancelled so the store never claims they are running.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Job orchestrator shutting down");
        self.intake_tx.lock().expect("intake lock poisoned").take();
        self.shutdown.cancel();
        for (_, token) in self.cancels.lock().await.drain() {
            token.cancel();
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for mut handle in workers {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Job worker did not stop within {:?}, aborting", grace);
                handle.abort();
            }
        }

        let leftovers: Vec<Job> = {
            let mut index = self.index.lock().await;
            index
                .values_mut()
                .filter(|job| !job.status.is_terminal())
                .map(|job| {
                    job.status = JobStatus::Cancelled;
                    job.touch();
                    job.clone()
                })
                .collect()
        };
        for job in &leftovers {
            if let Err(e) = self.store.save(job).await {
                warn!("Job {}: failed to persist shutdown state: {:#}", job.id, e);
            }
        }
        if !leftovers.is_empty() {
            info!(
                "Cancelled {} unfinished jobs during shutdown",
                leftovers.len()
            );
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            let next = {
                let mut rx = self.intake_rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    id = rx.recv() => id,
                }
            };
            let Some(job_id) = next else { break };

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.execution_gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => break,
                },
            };
            self.run_one(job_id).await;
            drop(permit);
        }
        debug!("Job worker {} stopped", worker);
    }

    async fn run_one(&self, job_id: Uuid) {
        let token = CancellationToken::new();
        let snapshot = {
            let mut index = self.index.lock().await;
            let Some(job) = index.get_mut(&job_id) else {
                debug!("Job {}: vanished before execution", job_id);
                return;
            };
            if job.status.is_terminal() {
                debug!("Job {}: already {} when dequeued, skipping", job_id, job.status);
                return;
            }
            job.status = JobStatus::Running;
            job.touch();
            // Registered in the same critical section that sets Running, so
            // a cancel that sees Running always finds the token.
            self.cancels.lock().await.insert(job_id, token.clone());
            job.clone()
        };
        if let Err(e) = self.store.save(&snapshot).await {
            warn!("Job {}: failed to persist running state: {:#}", job_id, e);
        }

        // Executors are registered per configuration, so a job recovered
        // from a previous run may no longer have one.
        let Some(executor) = self.executors.get(snapshot.job_type) else {
            let failed = self
                .mark_terminal(job_id, |job| {
                    job.status = JobStatus::Failed;
                    job.error = Some(JobFailure {
                        message: format!(
                            "no executor registered for job type {}",
                            snapshot.job_type.label()
                        ),
                        stage: job.stage,
                    });
                })
                .await;
            if let Some(job) = failed {
                self.finalize(&job).await;
            }
            self.cancels.lock().await.remove(&job_id);
            return;
        };

        let ctx = JobContext {
            job_id,
            params: snapshot.params.clone(),
            progress: ProgressHandle::new(
                job_id,
                snapshot.job_type,
                Arc::clone(&self.index),
                Arc::clone(&self.store),
            ),
            cancel: token.clone(),
        };

        info!("Job {}: running {} job", job_id, snapshot.job_type.label());
        let outcome = executor.run(ctx).await;

        let terminal = self
            .mark_terminal(job_id, |job| match outcome {
                // Work that finished despite a late cancel request still counts.
                Ok(summary) => {
                    job.status = JobStatus::Completed;
                    job.progress_percent = 100;
                    if let Some(last) = stage_sequence(job.job_type).last() {
                        job.stage = *last;
                    }
                    job.result = Some(summary);
                    info!("Job {}: completed", job_id);
                }
                Err(_) if token.is_cancelled() => {
                    job.status = JobStatus::Cancelled;
                    info!("Job {}: cancelled at stage {:?}", job_id, job.stage);
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    warn!("Job {}: failed at stage {:?}: {:#}", job_id, job.stage, e);
                    job.error = Some(JobFailure {
                        message: format!("{:#}", e),
                        stage: job.stage,
                    });
                }
            })
            .await;

        self.cancels.lock().await.remove(&job_id);
        if let Some(job) = terminal {
            self.finalize(&job).await;
        }
    }

    /// Apply a terminal transition unless the job already reached one.
    async fn mark_terminal<F>(&self, job_id: Uuid, apply: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut index = self.index.lock().await;
        let job = index.get_mut(&job_id)?;
        if job.status.is_terminal() {
            return None;
        }
        apply(job);
        job.touch();
        Some(job.clone())
    }

    /// Persist a terminal snapshot and hand it to the continuation bridge.
    /// Delivery runs detached so a busy session never stalls a worker.
    async fn finalize(&self, job: &Job) {
        if let Err(e) = self.store.save(job).await {
            warn!("Job {}: failed to persist terminal state: {:#}", job.id, e);
        }
        if let Some(bridge) = &self.continuation {
            let bridge = Arc::clone(bridge);
            let job = job.clone();
            tokio::spawn(async move { bridge.on_job_terminal(&job).await });
        }
    }
}
