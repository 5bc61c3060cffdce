//! Continuation bridge.
//!
//! When a background job reaches a terminal state, its outcome is pushed
//! back into the owning session as a detached turn so the agent can tell the
//! user about it. The bridge never blocks a job worker for long: while the
//! session is mid-turn or its queue is full it backs off and retries, and
//! after a bounded number of attempts it drops the continuation with a
//! warning. A missing or dead owner session is a quiet no-op.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::actor::{SessionError, SessionState, TurnKind};
use super::registry::SessionRegistry;
use crate::jobs::types::{Job, JobStatus};

pub struct ContinuationBridge {
    registry: Arc<SessionRegistry>,
    retry: Duration,
    max_attempts: u32,
}

impl ContinuationBridge {
    pub fn new(registry: Arc<SessionRegistry>, retry: Duration, max_attempts: u32) -> Self {
        Self {
            registry,
            retry,
            max_attempts,
        }
    }

    /// Deliver a job's terminal outcome into its owning session, if any.
    ///
    /// Delivery is fire-and-forget: the turn is enqueued without a reply
    /// channel and the agent's eventual response reaches clients through the
    /// activity stream.
    pub async fn on_job_terminal(&self, job: &Job) {
        let Some(owner) = job.owner_session_id.as_deref() else {
            return;
        };
        if !job.status.is_terminal() {
            debug!(
                "Job {}: continuation requested in non-terminal status {}, ignoring",
                job.id, job.status
            );
            return;
        }

        let message = continuation_message(job);

        for attempt in 1..=self.max_attempts {
            let Some(actor) = self.registry.get(owner).await else {
                debug!(
                    "Job {}: owner session {} is gone, dropping continuation",
                    job.id, owner
                );
                return;
            };
            if !actor.is_alive() {
                debug!(
                    "Job {}: owner session {} is dead, dropping continuation",
                    job.id, owner
                );
                return;
            }

            if actor.state().await != SessionState::Processing {
                match actor.try_submit_detached(message.clone(), TurnKind::Continuation) {
                    Ok(()) => {
                        info!(
                            "Job {}: continuation delivered to session {} (attempt {})",
                            job.id, owner, attempt
                        );
                        return;
                    }
                    Err(SessionError::Busy) => {}
                    Err(_) => {
                        debug!(
                            "Job {}: session {} cannot accept turns, dropping continuation",
                            job.id, owner
                        );
                        return;
                    }
                }
            }

            tokio::time::sleep(self.retry).await;
        }

        warn!(
            "Job {}: continuation to session {} not delivered after {} attempts",
            job.id, owner, self.max_attempts
        );
    }
}

/// Compose the synthetic turn describing a job outcome. The agent relays it
/// to the user in its own words.
fn continuation_message(job: &Job) -> String {
    let label = job.job_type.label();
    match job.status {
        JobStatus::Completed => {
            let summary = job.result.as_deref().unwrap_or("It finished successfully.");
            format!(
                "[background job update] Your {} job {} completed. {} \
                 Let the user know in one or two sentences.",
                label, job.id, summary
            )
        }
        JobStatus::Failed => {
            let reason = job
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            format!(
                "[background job update] Your {} job {} failed: {}. \
                 Tell the user briefly and suggest what they could try next.",
                label, job.id, reason
            )
        }
        _ => format!(
            "[background job update] Your {} job {} was cancelled. \
             Acknowledge this to the user in one sentence.",
            label, job.id
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::types::{JobFailure, JobStage, JobType};
    use crate::session::activity::ActivityBus;
    use crate::session::testing::{ScriptedConnector, ScriptedTurn};
    use serde_json::json;
    use std::path::PathBuf;

    const OWNER: &str = "9d7a3f2e-6b1c-4a8d-b5e4-1c2d3e4f5a66";

    fn registry(connector: Arc<ScriptedConnector>) -> Arc<SessionRegistry> {
        let mut config = Config::new(PathBuf::from("/tmp"));
        config.response_timeout = Duration::from_secs(5);
        config.greeting_timeout = Duration::from_millis(500);
        Arc::new(SessionRegistry::new(
            &config,
            connector,
            Arc::new(ActivityBus::new()),
        ))
    }

    fn terminal_job(status: JobStatus, owner: Option<&str>) -> Job {
        let mut job = Job::new(
            JobType::Transcription,
            json!({"media_url": "https://example.com/a.mp3"}),
            owner.map(|s| s.to_string()),
        );
        job.status = status;
        match status {
            JobStatus::Completed => job.result = Some("Transcribed 12 segments.".to_string()),
            JobStatus::Failed => {
                job.error = Some(JobFailure {
                    message: "speech service returned 500".to_string(),
                    stage: JobStage::Transcribing,
                })
            }
            _ => {}
        }
        job
    }

    #[tokio::test]
    async fn delivery_waits_for_the_in_flight_turn() {
        let connector = ScriptedConnector::new(vec![
            ScriptedTurn::default(), // greeting
            ScriptedTurn { delay_ms: 200, ..Default::default() },
        ]);
        let registry = registry(Arc::clone(&connector));
        let actor = registry.get_or_create(OWNER).await.unwrap();
        actor.greeting().await;

        // Occupy the session with a slow user turn.
        let busy = {
            let actor = Arc::clone(&actor);
            tokio::spawn(async move { actor.submit("slow".to_string(), TurnKind::User).await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(actor.state().await, SessionState::Processing);

        let bridge = ContinuationBridge::new(Arc::clone(&registry), Duration::from_millis(30), 20);
        bridge
            .on_job_terminal(&terminal_job(JobStatus::Completed, Some(OWNER)))
            .await;

        busy.await.unwrap().unwrap();
        // Give the worker a moment to pick up the queued continuation.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queries = connector.queries();
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[1], "slow");
        assert!(queries[2].contains("[background job update]"));
        assert!(queries[2].contains("completed"));

        // The continuation query only started after the slow turn finished.
        let times = connector.query_times();
        assert!(times[2].duration_since(times[1]) >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn failed_job_message_carries_the_reason() {
        let connector = ScriptedConnector::new(vec![]);
        let registry = registry(Arc::clone(&connector));
        registry.get_or_create(OWNER).await.unwrap().greeting().await;

        let bridge = ContinuationBridge::new(Arc::clone(&registry), Duration::from_millis(20), 5);
        bridge
            .on_job_terminal(&terminal_job(JobStatus::Failed, Some(OWNER)))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queries = connector.queries();
        assert_eq!(queries.len(), 2);
        assert!(queries[1].contains("failed: speech service returned 500"));
    }

    #[tokio::test]
    async fn missing_owner_is_a_quiet_no_op() {
        let connector = ScriptedConnector::new(vec![]);
        let registry = registry(Arc::clone(&connector));
        let bridge = ContinuationBridge::new(Arc::clone(&registry), Duration::from_millis(10), 3);

        bridge
            .on_job_terminal(&terminal_job(JobStatus::Completed, None))
            .await;
        bridge
            .on_job_terminal(&terminal_job(
                JobStatus::Completed,
                Some("57b1f2c3-9d4e-4f6a-8b7c-0d1e2f3a4b5d"),
            ))
            .await;

        assert!(connector.queries().is_empty());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_while_session_stays_busy() {
        let connector = ScriptedConnector::new(vec![
            ScriptedTurn::default(), // greeting
            ScriptedTurn { delay_ms: 500, ..Default::default() },
        ]);
        let registry = registry(Arc::clone(&connector));
        let actor = registry.get_or_create(OWNER).await.unwrap();
        actor.greeting().await;

        let busy = {
            let actor = Arc::clone(&actor);
            tokio::spawn(async move { actor.submit("long".to_string(), TurnKind::User).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let bridge = ContinuationBridge::new(Arc::clone(&registry), Duration::from_millis(20), 3);
        bridge
            .on_job_terminal(&terminal_job(JobStatus::Completed, Some(OWNER)))
            .await;

        busy.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only the greeting and the long user turn ever reached the agent.
        let queries = connector.queries();
        assert_eq!(queries.len(), 2);
    }
}
