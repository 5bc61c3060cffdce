//! Agent CLI subprocess connector.
//!
//! Spawns one CLI process per session with stream-json on both stdin and
//! stdout, keeps it alive across turns, and routes stdout events to the
//! receiver of whichever turn is currently in flight.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{convert_cli_event, user_message_line, CliEvent, SystemEvent};
use super::{AgentConnection, AgentConnector, TurnEvent};

/// How long to wait for the CLI's init event after spawning.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the per-turn event channel.
const TURN_CHANNEL_CAPACITY: usize = 256;

/// Sender for the turn currently in flight, if any. The reader task clears
/// the slot after forwarding the terminal event.
type TurnSlot = Arc<Mutex<Option<mpsc::Sender<TurnEvent>>>>;

/// Spawns agent CLI processes.
#[derive(Debug, Clone)]
pub struct CliConnector {
    cmd: String,
    model: Option<String>,
}

impl CliConnector {
    pub fn new(cmd: String, model: Option<String>) -> Self {
        Self { cmd, model }
    }
}

#[async_trait]
impl AgentConnector for CliConnector {
    async fn open(&self, session_key: &str) -> Result<Box<dyn AgentConnection>> {
        let mut cmd = Command::new(&self.cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--session-id")
            .arg(session_key)
            .kill_on_drop(true);

        if let Some(ref model) = self.model {
            cmd.arg("--model").arg(model);
        }

        info!(
            "Spawning agent CLI for session {}: cmd={}, model={:?}",
            session_key, self.cmd, self.model
        );

        let mut child = cmd.spawn().map_err(|e| {
            anyhow!(
                "Failed to spawn agent CLI: {}. Is '{}' installed?",
                e,
                self.cmd
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to capture agent stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture agent stdout"))?;

        let child = Arc::new(Mutex::new(Some(child)));
        let turn_slot: TurnSlot = Arc::new(Mutex::new(None));
        let (init_tx, init_rx) = oneshot::channel();

        let reader = tokio::spawn(read_events(
            stdout,
            Arc::clone(&turn_slot),
            init_tx,
            Arc::clone(&child),
        ));

        let connection = CliConnection {
            stdin,
            child,
            turn_slot,
            _reader: reader,
        };

        match tokio::time::timeout(INIT_TIMEOUT, init_rx).await {
            Ok(Ok(init)) => {
                info!(
                    "Agent CLI ready for session {}: agent_session={}, model={:?}",
                    session_key, init.session_id, init.model
                );
                Ok(Box::new(connection))
            }
            Ok(Err(_)) => {
                kill_child(&connection.child).await;
                bail!("Agent CLI exited before initializing");
            }
            Err(_) => {
                kill_child(&connection.child).await;
                bail!("Agent CLI did not initialize within {:?}", INIT_TIMEOUT);
            }
        }
    }
}

/// One live agent process bound to a session.
pub struct CliConnection {
    stdin: ChildStdin,
    child: Arc<Mutex<Option<Child>>>,
    turn_slot: TurnSlot,
    _reader: JoinHandle<()>,
}

#[async_trait]
impl AgentConnection for CliConnection {
    async fn query(&mut self, text: &str) -> Result<mpsc::Receiver<TurnEvent>> {
        let (tx, rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
        {
            let mut slot = self.turn_slot.lock().await;
            if slot.is_some() {
                bail!("A turn is already in flight on this connection");
            }
            *slot = Some(tx);
        }

        let line = user_message_line(text);
        if let Err(e) = self.write_line(&line).await {
            *self.turn_slot.lock().await = None;
            return Err(anyhow!("Failed to write to agent stdin: {}", e));
        }

        Ok(rx)
    }

    async fn close(&mut self) {
        kill_child(&self.child).await;
    }
}

impl CliConnection {
    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }
}

async fn kill_child(child: &Arc<Mutex<Option<Child>>>) {
    if let Some(mut child) = child.lock().await.take() {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill agent CLI: {}", e);
        } else {
            info!("Agent CLI stopped");
        }
    }
}

/// Reads stdout lines for the lifetime of the process.
///
/// The first `system/init` event resolves the startup oneshot; everything
/// else is converted and forwarded to the in-flight turn. When a terminal
/// event passes through, the slot is cleared so the next turn can claim it.
async fn read_events(
    stdout: ChildStdout,
    turn_slot: TurnSlot,
    init_tx: oneshot::Sender<SystemEvent>,
    child: Arc<Mutex<Option<Child>>>,
) {
    let reader = BufReader::new(stdout);
    let mut lines = reader.lines();
    let mut init_tx = Some(init_tx);
    let mut pending_tools = HashMap::new();
    let mut turn_text = String::new();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<CliEvent>(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Failed to parse agent event: {} - line: {}",
                    e,
                    if line.len() > 200 {
                        format!("{}...", log_snippet(&line, 200))
                    } else {
                        line.clone()
                    }
                );
                continue;
            }
        };

        if let CliEvent::System(ref sys) = event {
            if sys.subtype == "init" {
                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(sys.clone());
                }
                continue;
            }
        }

        for mut turn_event in convert_cli_event(event, &mut pending_tools) {
            match &mut turn_event {
                TurnEvent::TextDelta { content } => {
                    turn_text.push_str(content);
                }
                TurnEvent::Completed(completion) => {
                    // The result event omits text for some error shapes;
                    // fall back to the accumulated assistant output.
                    if completion.text.is_empty() {
                        completion.text = turn_text.clone();
                    }
                }
                _ => {}
            }
            let terminal = matches!(turn_event, TurnEvent::Completed(_));

            let sender = turn_slot.lock().await.clone();
            match sender {
                Some(tx) => {
                    if tx.send(turn_event).await.is_err() {
                        debug!("Turn receiver dropped, discarding agent event");
                    }
                }
                None => debug!("Agent event arrived with no turn in flight"),
            }

            if terminal {
                *turn_slot.lock().await = None;
                turn_text.clear();
                pending_tools.clear();
            }
        }
    }

    // EOF: the process exited. Dropping the slot sender closes any in-flight
    // turn channel, which the session actor observes as a dead connection.
    turn_slot.lock().await.take();

    if let Some(mut child) = child.lock().await.take() {
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!("Agent CLI exited with status: {}", status);
            }
            Ok(_) => debug!("Agent CLI exited cleanly"),
            Err(e) => warn!("Failed to reap agent CLI: {}", e),
        }
    }
}

/// First `max` bytes of a line for log output, cut back to a char boundary.
fn log_snippet(line: &str, max: usize) -> &str {
    if line.len() <= max {
        return line;
    }
    let mut cut = max;
    while cut > 0 && !line.is_char_boundary(cut) {
        cut -= 1;
    }
    &line[..cut]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_snippet_respects_char_boundaries() {
        // 1 + 2 * 300 = 601 bytes; byte 200 lands inside a two-byte char.
        let line = format!("x{}", "é".repeat(300));
        assert!(!line.is_char_boundary(200));

        let snippet = log_snippet(&line, 200);
        assert_eq!(snippet.len(), 199);
        assert!(line.starts_with(snippet));
    }

    #[test]
    fn log_snippet_passes_short_lines_through() {
        assert_eq!(log_snippet("not json", 200), "not json");
        assert_eq!(log_snippet("", 200), "");
    }
}
