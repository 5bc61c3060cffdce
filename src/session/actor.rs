//! Session actor: one worker task owning one agent connection.
//!
//! The agent connection cannot take concurrent turns, so every turn for a
//! session flows through a bounded command queue and is executed strictly in
//! arrival order by a single worker. Callers wait on a per-turn oneshot; a
//! caller that times out abandons its oneshot, the worker's late send fails
//! silently, and the loop moves on to the next queued turn. Results are never
//! delivered to the wrong caller.

use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::activity::{ActivityBus, ActivityKind};
use crate::agent::{AgentConnection, AgentConnector, TurnEvent, TurnUsage};

/// Queue depth for pending turns on one session.
const COMMAND_CAPACITY: usize = 8;

/// Grace given to the worker to wind down before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Prompt for the one greeting turn that runs right after the connection
/// opens.
const GREETING_PROMPT: &str = "Greet the user in one or two short sentences. \
Mention that you can transcribe media from a URL and answer questions about \
the knowledge graph built from past transcripts.";

/// Canned greeting used when the model takes too long to produce one.
pub const GREETING_FALLBACK: &str =
    "Session ready. Ask me to transcribe a media URL or explore your knowledge graph.";

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session key is not a valid UUID: {0}")]
    InvalidKey(String),

    #[error("Agent connection failed: {0}")]
    Connection(String),

    #[error("Turn failed: {0}")]
    Turn(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Session worker is gone")]
    WorkerGone,

    #[error("Session is busy")]
    Busy,
}

/// Lifecycle of a session.
///
/// `Expired` is never stored by the actor; the API layer reports it for
/// sessions that are absent or idle past their TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Ready,
    Processing,
    Error,
    Expired,
}

/// Origin of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    User,
    Greeting,
    Continuation,
}

impl TurnKind {
    pub fn label(&self) -> &'static str {
        match self {
            TurnKind::User => "user",
            TurnKind::Greeting => "greeting",
            TurnKind::Continuation => "continuation",
        }
    }
}

/// Successful result of one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub text: String,
    pub usage: TurnUsage,
}

struct TurnRequest {
    id: Uuid,
    text: String,
    kind: TurnKind,
    respond: oneshot::Sender<Result<TurnOutcome, SessionError>>,
}

enum ActorCommand {
    Turn(TurnRequest),
    Shutdown,
}

/// Handle to one session's worker task.
pub struct SessionActor {
    session_id: String,
    cmd_tx: mpsc::Sender<ActorCommand>,
    state: Arc<RwLock<SessionState>>,
    last_activity: StdMutex<Instant>,
    greeting_rx: watch::Receiver<Option<String>>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    response_timeout: Duration,
    greeting_timeout: Duration,
}

impl SessionActor {
    /// Spawn the worker for a session. The worker opens the agent connection,
    /// runs the greeting turn, then drains the command queue until told to
    /// stop.
    pub fn spawn(
        session_id: &str,
        connector: Arc<dyn AgentConnector>,
        activity: Arc<ActivityBus>,
        response_timeout: Duration,
        greeting_timeout: Duration,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (greeting_tx, greeting_rx) = watch::channel(None);
        let state = Arc::new(RwLock::new(SessionState::Initializing));

        let worker = tokio::spawn(worker_loop(
            session_id.to_string(),
            connector,
            activity,
            cmd_rx,
            Arc::clone(&state),
            greeting_tx,
        ));

        Arc::new(Self {
            session_id: session_id.to_string(),
            cmd_tx,
            state,
            last_activity: StdMutex::new(Instant::now()),
            greeting_rx,
            worker: StdMutex::new(Some(worker)),
            response_timeout,
            greeting_timeout,
        })
    }

    /// Enqueue a turn and wait for its response.
    ///
    /// The timeout covers both queueing and execution. On timeout the caller
    /// walks away; the worker finishes the turn anyway and discards the
    /// result.
    pub async fn submit(&self, text: String, kind: TurnKind) -> Result<TurnOutcome, SessionError> {
        self.touch();
        let (respond, response_rx) = oneshot::channel();
        let request = TurnRequest {
            id: Uuid::new_v4(),
            text,
            kind,
            respond,
        };

        let wait = async {
            if self.cmd_tx.send(ActorCommand::Turn(request)).await.is_err() {
                return Err(SessionError::WorkerGone);
            }
            match response_rx.await {
                Ok(result) => result,
                Err(_) => Err(SessionError::WorkerGone),
            }
        };

        match tokio::time::timeout(self.response_timeout, wait).await {
            Ok(result) => {
                self.touch();
                result
            }
            Err(_) => {
                debug!(
                    "Session {}: caller gave up on a turn after {:?}",
                    self.session_id, self.response_timeout
                );
                Err(SessionError::Timeout(self.response_timeout))
            }
        }
    }

    /// Non-blocking enqueue with no reply channel, used by the continuation
    /// bridge. Fails with `Busy` when the queue is full.
    pub fn try_submit_detached(&self, text: String, kind: TurnKind) -> Result<(), SessionError> {
        let (respond, _discarded) = oneshot::channel();
        let request = TurnRequest {
            id: Uuid::new_v4(),
            text,
            kind,
            respond,
        };
        self.cmd_tx
            .try_send(ActorCommand::Turn(request))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::Busy,
                mpsc::error::TrySendError::Closed(_) => SessionError::WorkerGone,
            })?;
        self.touch();
        Ok(())
    }

    /// Wait for the model greeting, falling back to a canned message so the
    /// open endpoint never fails on a slow greeting.
    pub async fn greeting(&self) -> String {
        let mut rx = self.greeting_rx.clone();
        // Bound first: the awaited value borrows `rx` and must drop before it.
        let waited = tokio::time::timeout(self.greeting_timeout, rx.wait_for(|g| g.is_some())).await;
        match waited {
            Ok(Ok(greeting)) => (*greeting)
                .clone()
                .unwrap_or_else(|| GREETING_FALLBACK.to_string()),
            Ok(Err(_)) => GREETING_FALLBACK.to_string(),
            Err(_) => {
                debug!(
                    "Session {}: greeting not ready within {:?}, using fallback",
                    self.session_id, self.greeting_timeout
                );
                GREETING_FALLBACK.to_string()
            }
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Mark the session as recently used.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("last_activity lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last_activity lock poisoned")
            .elapsed()
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.idle_for() > ttl
    }

    pub fn is_alive(&self) -> bool {
        self.worker
            .lock()
            .expect("worker lock poisoned")
            .as_ref()
            .map(|w| !w.is_finished())
            .unwrap_or(false)
    }

    /// Ask the worker to stop, wait briefly, then abort it.
    pub async fn stop(&self) {
        if self.cmd_tx.try_send(ActorCommand::Shutdown).is_err() {
            debug!(
                "Session {}: could not queue shutdown, worker will be aborted",
                self.session_id
            );
        }
        let worker = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(mut worker) = worker {
            match tokio::time::timeout(STOP_GRACE, &mut worker).await {
                Ok(_) => debug!("Session {}: worker stopped", self.session_id),
                Err(_) => {
                    warn!(
                        "Session {}: worker did not stop within {:?}, aborting",
                        self.session_id, STOP_GRACE
                    );
                    worker.abort();
                }
            }
        }
    }
}

enum TurnFailure {
    /// The agent reported an error for this turn; the connection still works.
    Turn(String),
    /// The connection itself is broken. The session cannot continue.
    Connection(String),
}

impl TurnFailure {
    fn is_fatal(&self) -> bool {
        matches!(self, TurnFailure::Connection(_))
    }

    fn message(&self) -> &str {
        match self {
            TurnFailure::Turn(m) | TurnFailure::Connection(m) => m,
        }
    }
}

async fn worker_loop(
    session_id: String,
    connector: Arc<dyn AgentConnector>,
    activity: Arc<ActivityBus>,
    mut cmd_rx: mpsc::Receiver<ActorCommand>,
    state: Arc<RwLock<SessionState>>,
    greeting_tx: watch::Sender<Option<String>>,
) {
    let mut connection = match connector.open(&session_id).await {
        Ok(connection) => connection,
        Err(e) => {
            error!(
                "Session {}: failed to open agent connection: {:#}",
                session_id, e
            );
            *state.write().await = SessionState::Error;
            fail_queued(&mut cmd_rx, &format!("{:#}", e)).await;
            return;
        }
    };

    info!("Session {}: agent connection open", session_id);

    // Greeting runs before any queued turn and resolves the watch channel
    // the open endpoint waits on.
    match run_turn(
        connection.as_mut(),
        &session_id,
        GREETING_PROMPT,
        TurnKind::Greeting,
        &activity,
    )
    .await
    {
        Ok(outcome) => {
            let _ = greeting_tx.send(Some(outcome.text));
        }
        Err(failure) => {
            warn!(
                "Session {}: greeting turn failed: {}",
                session_id,
                failure.message()
            );
            let _ = greeting_tx.send(Some(GREETING_FALLBACK.to_string()));
            if failure.is_fatal() {
                *state.write().await = SessionState::Error;
                fail_queued(&mut cmd_rx, failure.message()).await;
                connection.close().await;
                return;
            }
        }
    }

    *state.write().await = SessionState::Ready;

    while let Some(cmd) = cmd_rx.recv().await {
        let request = match cmd {
            ActorCommand::Shutdown => {
                debug!("Session {}: shutdown requested", session_id);
                break;
            }
            ActorCommand::Turn(request) => request,
        };

        *state.write().await = SessionState::Processing;
        debug!(
            "Session {}: starting {} turn {}",
            session_id,
            request.kind.label(),
            request.id
        );
        let started = Instant::now();

        let result = run_turn(
            connection.as_mut(),
            &session_id,
            &request.text,
            request.kind,
            &activity,
        )
        .await;

        let fatal = matches!(&result, Err(failure) if failure.is_fatal());
        let response = match result {
            Ok(outcome) => {
                info!(
                    "Session {}: {} turn {} done in {:?} (cost ${:.4})",
                    session_id,
                    request.kind.label(),
                    request.id,
                    started.elapsed(),
                    outcome.usage.cost_usd
                );
                Ok(outcome)
            }
            Err(TurnFailure::Turn(message)) => {
                warn!("Session {}: turn {} failed: {}", session_id, request.id, message);
                Err(SessionError::Turn(message))
            }
            Err(TurnFailure::Connection(message)) => {
                error!(
                    "Session {}: connection lost during turn {}: {}",
                    session_id, request.id, message
                );
                Err(SessionError::Connection(message))
            }
        };

        if request.respond.send(response).is_err() {
            debug!(
                "Session {}: turn {} finished with no waiting caller, result discarded",
                session_id, request.id
            );
        }

        if fatal {
            *state.write().await = SessionState::Error;
            break;
        }
        *state.write().await = SessionState::Ready;
    }

    connection.close().await;
    debug!("Session {}: worker finished", session_id);
}

/// Respond to everything already queued, then leave latecomers to observe the
/// closed channel.
async fn fail_queued(cmd_rx: &mut mpsc::Receiver<ActorCommand>, message: &str) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let ActorCommand::Turn(request) = cmd {
            let _ = request
                .respond
                .send(Err(SessionError::Connection(message.to_string())));
        }
    }
}

/// Drive one turn to completion, mirroring protocol events onto the activity
/// bus as they arrive.
async fn run_turn(
    connection: &mut dyn AgentConnection,
    session_id: &str,
    text: &str,
    kind: TurnKind,
    activity: &ActivityBus,
) -> Result<TurnOutcome, TurnFailure> {
    let mut events = connection
        .query(text)
        .await
        .map_err(|e| TurnFailure::Connection(format!("{:#}", e)))?;

    while let Some(event) = events.recv().await {
        match event {
            TurnEvent::Thinking { content } => {
                activity
                    .publish(session_id, ActivityKind::Thinking, json!({ "content": content }))
                    .await;
            }
            TurnEvent::ToolUse { id, name, input } => {
                activity
                    .publish(
                        session_id,
                        tool_activity_kind(&name),
                        json!({ "id": id, "name": name, "input": input }),
                    )
                    .await;
            }
            TurnEvent::ToolResult {
                id,
                name,
                output,
                is_error,
            } => {
                activity
                    .publish(
                        session_id,
                        ActivityKind::ToolResult,
                        json!({ "id": id, "name": name, "output": output, "is_error": is_error }),
                    )
                    .await;
            }
            TurnEvent::TextDelta { .. } => {}
            TurnEvent::Completed(completion) => {
                activity
                    .publish(
                        session_id,
                        ActivityKind::Completed,
                        json!({
                            "turn": kind.label(),
                            "is_error": completion.is_error,
                            "text": completion.text,
                        }),
                    )
                    .await;
                if completion.is_error {
                    return Err(TurnFailure::Turn(completion.text));
                }
                return Ok(TurnOutcome {
                    text: completion.text,
                    usage: completion.usage,
                });
            }
        }
    }

    Err(TurnFailure::Connection(
        "Agent stream ended before the turn completed".to_string(),
    ))
}

/// Subagent spawns and file writes get their own activity kinds so clients
/// can render them distinctly.
fn tool_activity_kind(name: &str) -> ActivityKind {
    match name {
        "Task" => ActivityKind::Subagent,
        "Write" | "Edit" => ActivityKind::FileSave,
        _ => ActivityKind::ToolUse,
    }
}
