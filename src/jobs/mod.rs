//! Background jobs: durable records, executors and the orchestrator that
//! runs them with bounded concurrency.

pub mod executor;
pub mod orchestrator;
pub mod store;
pub mod types;

pub use executor::{ExecutorRegistry, JobContext, JobExecutor, ProgressHandle};
pub use orchestrator::{JobOrchestrator, OrchestratorError};
pub use store::{create_job_store, JobStore, JobStoreKind, StoreError};
pub use types::{
    stage_progress, stage_sequence, Job, JobFailure, JobStage, JobStatus, JobStatusFilter, JobType,
};
