//! Agent CLI integration.
//!
//! Each conversational session owns exactly one long-lived agent CLI process,
//! driven over an NDJSON stdin/stdout protocol. A connection is not safe for
//! concurrent use; the session actor is the sole caller and runs turns
//! strictly one at a time.

pub mod cli;
pub mod protocol;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub use cli::CliConnector;

/// Token and cost accounting for one completed turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Terminal payload of a turn.
#[derive(Debug, Clone)]
pub struct TurnCompletion {
    /// Final response text, or the error description when `is_error` is set.
    pub text: String,
    pub is_error: bool,
    pub usage: TurnUsage,
}

/// Events emitted by an agent connection while a turn is in flight.
///
/// Every turn ends with exactly one `Completed`, after which the event
/// channel closes.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Model reasoning content.
    Thinking { content: String },
    /// The agent started a tool invocation.
    ToolUse { id: String, name: String, input: Value },
    /// A tool invocation finished.
    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// A chunk of the assistant's answer text.
    TextDelta { content: String },
    /// The turn finished.
    Completed(TurnCompletion),
}

/// Factory for agent connections.
///
/// Implemented by the CLI subprocess connector in production and by scripted
/// doubles in tests.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Open a connection bound to the given session key.
    ///
    /// Expensive: spawns a process and waits for it to initialize.
    async fn open(&self, session_key: &str) -> anyhow::Result<Box<dyn AgentConnection>>;
}

/// A live conversation with one agent process.
#[async_trait]
pub trait AgentConnection: Send {
    /// Start a turn. The receiver yields protocol events and ends with
    /// [`TurnEvent::Completed`].
    async fn query(&mut self, text: &str) -> anyhow::Result<mpsc::Receiver<TurnEvent>>;

    /// Tear down the underlying process.
    async fn close(&mut self);
}
