//! Conversational sessions.
//!
//! One actor per session serializes all turns onto a single agent
//! connection. The registry owns the actors and sweeps idle ones; the
//! activity bus fans out progress events to streaming and polling clients;
//! the continuation bridge re-enters sessions when background jobs reach a
//! terminal state.

pub mod activity;
pub mod actor;
pub mod continuation;
pub mod registry;

pub use activity::{ActivityBus, ActivityEvent, ActivityKind};
pub use actor::{SessionActor, SessionError, SessionState, TurnKind, TurnOutcome};
pub use continuation::ContinuationBridge;
pub use registry::SessionRegistry;

/// Scripted agent doubles shared by the session test modules.
#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    use crate::agent::{AgentConnection, AgentConnector, TurnCompletion, TurnEvent, TurnUsage};

    /// One scripted reply. `reply: None` echoes the prompt back as
    /// `echo:<prompt>`. Connections past the end of the script echo
    /// instantly.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedTurn {
        pub delay_ms: u64,
        pub reply: Option<String>,
        pub is_error: bool,
    }

    pub struct ScriptedConnector {
        turns: Arc<Mutex<VecDeque<ScriptedTurn>>>,
        log: Arc<Mutex<Vec<(String, Instant)>>>,
        fail_open: bool,
    }

    impl ScriptedConnector {
        pub fn new(turns: Vec<ScriptedTurn>) -> Arc<Self> {
            Arc::new(Self {
                turns: Arc::new(Mutex::new(turns.into())),
                log: Arc::new(Mutex::new(Vec::new())),
                fail_open: false,
            })
        }

        /// A connector whose `open` always fails.
        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                turns: Arc::new(Mutex::new(VecDeque::new())),
                log: Arc::new(Mutex::new(Vec::new())),
                fail_open: true,
            })
        }

        /// Prompts in the order the connection saw them.
        pub fn queries(&self) -> Vec<String> {
            self.log.lock().unwrap().iter().map(|(q, _)| q.clone()).collect()
        }

        /// When each prompt reached the connection.
        pub fn query_times(&self) -> Vec<Instant> {
            self.log.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    #[async_trait]
    impl AgentConnector for ScriptedConnector {
        async fn open(&self, _session_key: &str) -> anyhow::Result<Box<dyn AgentConnection>> {
            if self.fail_open {
                anyhow::bail!("scripted connect failure");
            }
            Ok(Box::new(ScriptedConnection {
                turns: Arc::clone(&self.turns),
                log: Arc::clone(&self.log),
            }))
        }
    }

    struct ScriptedConnection {
        turns: Arc<Mutex<VecDeque<ScriptedTurn>>>,
        log: Arc<Mutex<Vec<(String, Instant)>>>,
    }

    #[async_trait]
    impl AgentConnection for ScriptedConnection {
        async fn query(&mut self, text: &str) -> anyhow::Result<mpsc::Receiver<TurnEvent>> {
            self.log.lock().unwrap().push((text.to_string(), Instant::now()));
            let turn = self.turns.lock().unwrap().pop_front().unwrap_or_default();
            let reply = turn
                .reply
                .clone()
                .unwrap_or_else(|| format!("echo:{}", text));

            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(turn.delay_ms)).await;
                let _ = tx
                    .send(TurnEvent::Completed(TurnCompletion {
                        text: reply,
                        is_error: turn.is_error,
                        usage: TurnUsage {
                            input_tokens: 10,
                            output_tokens: 5,
                            cost_usd: 0.001,
                        },
                    }))
                    .await;
            });
            Ok(rx)
        }

        async fn close(&mut self) {}
    }
}
