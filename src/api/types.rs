//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::TurnUsage;
use crate::jobs::{JobStatus, JobType};
use crate::session::{ActivityEvent, SessionState};

/// Response after opening or resuming a session.
#[derive(Debug, Serialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
    pub state: SessionState,
    pub greeting: String,
}

/// One user turn for the session's agent.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

/// The agent's reply to a turn.
#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub text: String,
    pub usage: TurnUsage,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub state: SessionState,
    /// Absent for sessions that do not exist or have expired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Cursor query for the polling activity endpoint. `after` is the last
/// sequence number the client has seen; 0 returns the whole replay ring.
#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    #[serde(default)]
    pub after: u64,
}

#[derive(Debug, Serialize)]
pub struct ActivitySnapshotResponse {
    pub session_id: String,
    pub state: SessionState,
    pub events: Vec<ActivityEvent>,
    /// Pass back as `after` on the next poll.
    pub next_cursor: u64,
    /// How often the server suggests polling this endpoint.
    pub poll_interval_ms: u64,
}

/// Request to submit a background job.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Executor-specific parameters, passed through unparsed.
    #[serde(default)]
    pub params: Value,

    /// Session to notify when the job reaches a terminal state.
    #[serde(default)]
    pub owner_session_id: Option<String>,
}

/// Response after submitting a job.
#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub id: Uuid,
    pub status: JobStatus,
}

/// Filters for the job list endpoint, both optional.
#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub max_concurrent_jobs: usize,
}
