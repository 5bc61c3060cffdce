//! Configuration management for graphscribe.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `DATA_DIR` - Optional. Root directory for durable state. Defaults to `./data`.
//! - `AGENT_CMD` - Optional. Agent CLI binary to spawn per session. Defaults to `claude`.
//! - `AGENT_MODEL` - Optional. Model override passed to the agent CLI.
//! - `MAX_CONCURRENT_JOBS` - Optional. Background job worker count. Defaults to `2`.
//! - `JOB_STORE` - Optional. Job store backend (`file` or `memory`). Defaults to `file`.
//! - `RESPONSE_TIMEOUT_SECS` - Optional. Per-turn response timeout. Defaults to `300`.
//! - `GREETING_TIMEOUT_SECS` - Optional. Greeting wait before falling back. Defaults to `30`.
//! - `SESSION_TTL_SECS` - Optional. Idle session lifetime. Defaults to `3600`.
//! - `SWEEP_INTERVAL_SECS` - Optional. Expired-session sweep cadence. Defaults to `300`.
//! - `ACTIVITY_POLL_INTERVAL_MS` - Optional. Suggested activity poll cadence. Defaults to `1000`.
//! - `CONTINUATION_RETRY_MS` - Optional. Continuation redelivery backoff. Defaults to `500`.
//! - `CONTINUATION_MAX_ATTEMPTS` - Optional. Continuation delivery attempts. Defaults to `20`.
//! - `SPEECH_API_URL` - Optional. Speech-to-text endpoint; required for transcription jobs.
//! - `EXTRACTOR_API_URL` - Optional. Entity extraction endpoint; required for extraction jobs.
//! - `FFMPEG_PATH` - Optional. ffmpeg binary for audio extraction. Defaults to `ffmpeg`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Pipeline executor configuration.
///
/// Each external endpoint is optional; the corresponding job type is only
/// registered when its endpoint is configured.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Speech-to-text HTTP endpoint (accepts audio, returns transcript JSON)
    pub speech_api_url: Option<String>,

    /// Entity extraction HTTP endpoint (accepts text, returns entities/relations)
    pub extractor_api_url: Option<String>,

    /// ffmpeg binary used to extract mono 16kHz audio from downloaded media
    pub ffmpeg_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            speech_api_url: None,
            extractor_api_url: None,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Root directory for durable state (job records, transcripts, graphs)
    pub data_dir: PathBuf,

    /// Agent CLI binary spawned once per session
    pub agent_cmd: String,

    /// Optional model override forwarded to the agent CLI
    pub agent_model: Option<String>,

    /// Background job worker count (also the concurrency cap)
    pub max_concurrent_jobs: usize,

    /// Job store backend name (`file` or `memory`)
    pub job_store: String,

    /// How long a caller waits for a turn response before giving up
    pub response_timeout: Duration,

    /// How long the open endpoint waits for a model greeting before the canned fallback
    pub greeting_timeout: Duration,

    /// Idle lifetime after which a session is swept
    pub session_ttl: Duration,

    /// Cadence of the expired-session sweep
    pub sweep_interval: Duration,

    /// Poll cadence suggested to activity-poll clients, in milliseconds
    pub activity_poll_interval_ms: u64,

    /// Backoff between continuation delivery attempts
    pub continuation_retry: Duration,

    /// Delivery attempts before a continuation is dropped
    pub continuation_max_attempts: u32,

    /// Pipeline executor configuration
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let agent_cmd = std::env::var("AGENT_CMD").unwrap_or_else(|_| "claude".to_string());
        let agent_model = std::env::var("AGENT_MODEL").ok();

        let max_concurrent_jobs = std::env::var("MAX_CONCURRENT_JOBS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("MAX_CONCURRENT_JOBS".to_string(), format!("{}", e))
            })?;

        let job_store = std::env::var("JOB_STORE").unwrap_or_else(|_| "file".to_string());

        let response_timeout_secs: u64 = std::env::var("RESPONSE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("RESPONSE_TIMEOUT_SECS".to_string(), format!("{}", e))
            })?;

        let greeting_timeout_secs: u64 = std::env::var("GREETING_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("GREETING_TIMEOUT_SECS".to_string(), format!("{}", e))
            })?;

        let session_ttl_secs: u64 = std::env::var("SESSION_TTL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("SESSION_TTL_SECS".to_string(), format!("{}", e))
            })?;

        let sweep_interval_secs: u64 = std::env::var("SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("SWEEP_INTERVAL_SECS".to_string(), format!("{}", e))
            })?;

        let activity_poll_interval_ms = std::env::var("ACTIVITY_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("ACTIVITY_POLL_INTERVAL_MS".to_string(), format!("{}", e))
            })?;

        let continuation_retry_ms: u64 = std::env::var("CONTINUATION_RETRY_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("CONTINUATION_RETRY_MS".to_string(), format!("{}", e))
            })?;

        let continuation_max_attempts = std::env::var("CONTINUATION_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("CONTINUATION_MAX_ATTEMPTS".to_string(), format!("{}", e))
            })?;

        // Pipeline endpoints (optional)
        let pipeline = PipelineConfig {
            speech_api_url: std::env::var("SPEECH_API_URL").ok(),
            extractor_api_url: std::env::var("EXTRACTOR_API_URL").ok(),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
        };

        Ok(Self {
            host,
            port,
            data_dir,
            agent_cmd,
            agent_model,
            max_concurrent_jobs,
            job_store,
            response_timeout: Duration::from_secs(response_timeout_secs),
            greeting_timeout: Duration::from_secs(greeting_timeout_secs),
            session_ttl: Duration::from_secs(session_ttl_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            activity_poll_interval_ms,
            continuation_retry: Duration::from_millis(continuation_retry_ms),
            continuation_max_attempts,
            pipeline,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            data_dir,
            agent_cmd: "claude".to_string(),
            agent_model: None,
            max_concurrent_jobs: 2,
            job_store: "memory".to_string(),
            response_timeout: Duration::from_secs(300),
            greeting_timeout: Duration::from_secs(30),
            session_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            activity_poll_interval_ms: 1000,
            continuation_retry: Duration::from_millis(500),
            continuation_max_attempts: 20,
            pipeline: PipelineConfig::default(),
        }
    }
}
