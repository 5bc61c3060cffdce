//! Background job model.
//!
//! A [`Job`] is both the in-memory record and the durable on-disk shape.
//! Stage sequences are fixed per job type; progress percent is derived from
//! the position of the current stage within its sequence and never moves
//! backwards within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Kind of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Download media, extract audio, transcribe it, store the transcript.
    Transcription,
    /// Import an existing transcript library and build one merged graph.
    Bootstrap,
    /// Extract entities and relations from one stored transcript.
    Extraction,
}

impl JobType {
    pub fn label(&self) -> &'static str {
        match self {
            JobType::Transcription => "transcription",
            JobType::Bootstrap => "bootstrap",
            JobType::Extraction => "extraction",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transcription" => Some(JobType::Transcription),
            "bootstrap" => Some(JobType::Bootstrap),
            "extraction" => Some(JobType::Extraction),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages across all job types. Each type runs the fixed
/// subsequence returned by [`stage_sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    // Transcription
    Downloading,
    ExtractingAudio,
    Transcribing,
    Processing,
    // Bootstrap
    ScanningLibrary,
    ImportingTranscripts,
    IndexingGraph,
    // Extraction
    LoadingTranscript,
    ExtractingEntities,
    ResolvingEntities,
    WritingGraph,
    // Shared tail
    Finalizing,
}

/// The fixed stage order for a job type.
pub fn stage_sequence(job_type: JobType) -> &'static [JobStage] {
    match job_type {
        JobType::Transcription => &[
            JobStage::Queued,
            JobStage::Downloading,
            JobStage::ExtractingAudio,
            JobStage::Transcribing,
            JobStage::Processing,
            JobStage::Finalizing,
        ],
        JobType::Bootstrap => &[
            JobStage::Queued,
            JobStage::ScanningLibrary,
            JobStage::ImportingTranscripts,
            JobStage::IndexingGraph,
            JobStage::Finalizing,
        ],
        JobType::Extraction => &[
            JobStage::Queued,
            JobStage::LoadingTranscript,
            JobStage::ExtractingEntities,
            JobStage::ResolvingEntities,
            JobStage::WritingGraph,
            JobStage::Finalizing,
        ],
    }
}

/// Percent complete implied by reaching `stage`, scaled over the type's
/// sequence. The last stage maps to 100; stages outside the sequence map
/// to 0.
pub fn stage_progress(job_type: JobType, stage: JobStage) -> u8 {
    let sequence = stage_sequence(job_type);
    match sequence.iter().position(|s| *s == stage) {
        Some(position) => ((position * 100) / (sequence.len() - 1)) as u8,
        None => 0,
    }
}

/// Why a job failed, and at which stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub stage: JobStage,
}

/// A background job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress_percent: u8,
    /// Session that submitted the job, for continuation delivery. Purely a
    /// lookup key; the session may be gone by the time the job finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_session_id: Option<String>,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_type: JobType, params: Value, owner_session_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            stage: JobStage::Queued,
            progress_percent: 0,
            owner_session_id,
            params,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Status filter for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusFilter {
    All,
    /// Completed, failed or cancelled.
    Terminal,
    /// Pending or running.
    Active,
    Only(JobStatus),
}

impl JobStatusFilter {
    /// Parse a query value. Absent or empty means `All`; unknown values are
    /// rejected.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("") | Some("all") => Some(JobStatusFilter::All),
            Some("terminal") => Some(JobStatusFilter::Terminal),
            Some("active") => Some(JobStatusFilter::Active),
            Some(other) => JobStatus::parse(other).map(JobStatusFilter::Only),
        }
    }

    pub fn matches(&self, status: JobStatus) -> bool {
        match self {
            JobStatusFilter::All => true,
            JobStatusFilter::Terminal => status.is_terminal(),
            JobStatusFilter::Active => !status.is_terminal(),
            JobStatusFilter::Only(only) => *only == status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL_TYPES: [JobType; 3] = [JobType::Transcription, JobType::Bootstrap, JobType::Extraction];

    #[test]
    fn every_sequence_starts_queued_and_ends_finalizing() {
        for job_type in ALL_TYPES {
            let sequence = stage_sequence(job_type);
            assert_eq!(sequence.first(), Some(&JobStage::Queued));
            assert_eq!(sequence.last(), Some(&JobStage::Finalizing));
        }
    }

    #[test]
    fn stage_progress_is_monotonic_over_each_sequence() {
        for job_type in ALL_TYPES {
            let sequence = stage_sequence(job_type);
            let mut last = 0;
            for stage in sequence {
                let pct = stage_progress(job_type, *stage);
                assert!(pct >= last, "{:?} went backwards at {:?}", job_type, stage);
                last = pct;
            }
            assert_eq!(stage_progress(job_type, sequence[0]), 0);
            assert_eq!(stage_progress(job_type, *sequence.last().unwrap()), 100);
        }
    }

    #[test]
    fn stage_outside_the_sequence_maps_to_zero() {
        assert_eq!(stage_progress(JobType::Bootstrap, JobStage::Transcribing), 0);
        assert_eq!(stage_progress(JobType::Transcription, JobStage::WritingGraph), 0);
    }

    #[test]
    fn status_parse_and_display_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("exploded"), None);
    }

    #[test]
    fn terminal_statuses_are_exactly_three() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_filter_parses_and_matches() {
        assert_eq!(JobStatusFilter::parse(None), Some(JobStatusFilter::All));
        assert_eq!(JobStatusFilter::parse(Some("all")), Some(JobStatusFilter::All));
        assert_eq!(
            JobStatusFilter::parse(Some("terminal")),
            Some(JobStatusFilter::Terminal)
        );
        assert_eq!(
            JobStatusFilter::parse(Some("running")),
            Some(JobStatusFilter::Only(JobStatus::Running))
        );
        assert_eq!(JobStatusFilter::parse(Some("bogus")), None);

        assert!(JobStatusFilter::Active.matches(JobStatus::Pending));
        assert!(!JobStatusFilter::Active.matches(JobStatus::Failed));
        assert!(JobStatusFilter::Terminal.matches(JobStatus::Cancelled));
        assert!(JobStatusFilter::Only(JobStatus::Running).matches(JobStatus::Running));
        assert!(!JobStatusFilter::Only(JobStatus::Running).matches(JobStatus::Pending));
    }

    #[test]
    fn new_job_starts_pending_at_queued() {
        let job = Job::new(
            JobType::Transcription,
            json!({"media_url": "https://example.com/a.mp3"}),
            Some("762d62a6-47f8-4e5b-9c2d-6a1f0c9b3e55".to_string()),
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.stage, JobStage::Queued);
        assert_eq!(job.progress_percent, 0);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(!job.is_terminal());
    }

    #[test]
    fn job_record_serializes_with_wire_field_names() {
        let job = Job::new(JobType::Extraction, json!({"transcript_id": "t1"}), None);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "extraction");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["stage"], "queued");
        assert!(value.get("owner_session_id").is_none());
        assert!(value.get("result").is_none());

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.job_type, JobType::Extraction);
    }
}
