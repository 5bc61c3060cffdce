//! NDJSON wire types for the agent CLI's stream-json mode.
//!
//! The CLI writes one JSON event per stdout line. We deserialize each line
//! into [`CliEvent`] and convert it to connection-level [`TurnEvent`]s, which
//! is the only shape the rest of the service sees.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::{TurnCompletion, TurnEvent, TurnUsage};

/// Events emitted by the agent CLI in stream-json mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CliEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "stream_event")]
    StreamEvent(StreamEventWrapper),
    #[serde(rename = "assistant")]
    Assistant(AssistantEvent),
    #[serde(rename = "user")]
    User(UserEvent),
    #[serde(rename = "result")]
    Result(ResultEvent),
}

/// Lifecycle events. The `init` subtype arrives once after spawn and carries
/// the negotiated session id and model.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub subtype: String,
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventWrapper {
    pub event: StreamEvent,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: Value },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockInfo,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: Delta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: Value, usage: Option<Value> },
    #[serde(rename = "message_stop")]
    MessageStop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlockInfo {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Delta {
    #[serde(rename = "type")]
    pub delta_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub partial_json: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageInfo>,
}

/// Token counts as reported by the CLI. All fields optional; older versions
/// omit some of them.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
}

/// Tool result content is either a plain string or an array of content
/// blocks (text and images).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Structured(Vec<Value>),
}

impl ToolResultContent {
    /// Flatten to a display string. Image blocks become a placeholder.
    pub fn to_string_lossy(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Structured(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|item| {
                        let obj = item.as_object()?;
                        match obj.get("type").and_then(|v| v.as_str()) {
                            Some("image") => Some("[image]".to_string()),
                            _ => obj
                                .get("text")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                        }
                    })
                    .collect();
                if parts.is_empty() {
                    serde_json::to_string(items).unwrap_or_else(|_| "[tool output]".to_string())
                } else {
                    parts.join("\n")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEvent {
    pub message: UserMessage,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// Terminal event of a turn.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    pub subtype: String,
    pub session_id: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub usage: Option<UsageInfo>,
    /// Session-level errors are reported in an array field.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultEvent {
    /// Extract the best available error message, checking `result` and then
    /// the `errors` array. Unwraps embedded JSON error bodies
    /// (e.g. `529 {"error":{"message":"overloaded"}}`) when present.
    pub fn error_message(&self) -> String {
        let raw = self
            .result
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.errors.first().filter(|s| !s.is_empty()).map(|s| s.as_str()))
            .unwrap_or("Unknown agent error");

        Self::embedded_json_message(raw).unwrap_or_else(|| raw.to_string())
    }

    fn embedded_json_message(raw: &str) -> Option<String> {
        let json_str = raw.find('{').map(|idx| &raw[idx..])?;
        let parsed: Value = serde_json::from_str(json_str).ok()?;
        parsed
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .or_else(|| parsed.get("message").and_then(|m| m.as_str()))
            .map(|s| s.to_string())
    }

    fn turn_usage(&self) -> TurnUsage {
        let (input, output) = match &self.usage {
            Some(u) => (
                u.input_tokens.unwrap_or_default(),
                u.output_tokens.unwrap_or_default(),
            ),
            None => (0, 0),
        };
        TurnUsage {
            input_tokens: input,
            output_tokens: output,
            cost_usd: self.total_cost_usd.unwrap_or_default(),
        }
    }
}

/// Serialize a user message into one NDJSON input line for the CLI.
pub fn user_message_line(text: &str) -> String {
    let msg = serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }]
        }
    });
    format!("{}\n", msg)
}

/// Convert a wire event into zero or more turn events.
///
/// `pending_tools` maps in-flight tool_use ids to tool names so results can
/// be labelled; callers keep it alive for the duration of a turn.
pub fn convert_cli_event(
    event: CliEvent,
    pending_tools: &mut HashMap<String, String>,
) -> Vec<TurnEvent> {
    let mut out = vec![];

    match event {
        CliEvent::System(sys) => {
            debug!("Agent system event: subtype={}", sys.subtype);
        }

        CliEvent::StreamEvent(wrapper) => match wrapper.event {
            StreamEvent::ContentBlockDelta { delta, .. } => {
                if let Some(text) = delta.text {
                    if !text.is_empty() {
                        out.push(TurnEvent::TextDelta { content: text });
                    }
                }
                if let Some(thinking) = delta.thinking {
                    if !thinking.is_empty() {
                        out.push(TurnEvent::Thinking { content: thinking });
                    }
                }
            }
            StreamEvent::ContentBlockStart { content_block, .. } => {
                if content_block.block_type == "tool_use" {
                    if let (Some(id), Some(name)) = (content_block.id, content_block.name) {
                        pending_tools.insert(id, name);
                    }
                }
            }
            _ => {}
        },

        CliEvent::Assistant(evt) => {
            for block in evt.message.content {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            out.push(TurnEvent::TextDelta { content: text });
                        }
                    }
                    ContentBlock::Thinking { thinking } => {
                        if !thinking.is_empty() {
                            out.push(TurnEvent::Thinking { content: thinking });
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        pending_tools.insert(id.clone(), name.clone());
                        out.push(TurnEvent::ToolUse { id, name, input });
                    }
                    ContentBlock::ToolResult { .. } => {}
                }
            }
        }

        CliEvent::User(evt) => {
            for block in evt.message.content {
                if let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } = block
                {
                    let name = pending_tools
                        .get(&tool_use_id)
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    out.push(TurnEvent::ToolResult {
                        id: tool_use_id,
                        name,
                        output: content.to_string_lossy(),
                        is_error,
                    });
                }
            }
        }

        CliEvent::Result(res) => {
            let failed = res.is_error || res.subtype == "error";
            let usage = res.turn_usage();
            let text = if failed {
                res.error_message()
            } else {
                res.result.clone().unwrap_or_default()
            };
            debug!(
                "Agent turn result: subtype={}, cost={:?}, duration={:?}ms",
                res.subtype, res.total_cost_usd, res.duration_ms
            );
            out.push(TurnEvent::Completed(TurnCompletion {
                text,
                is_error: failed,
                usage,
            }));
        }
    }

    out
}
