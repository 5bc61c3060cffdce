//! Per-session activity fan-out.
//!
//! Live consumers subscribe to a broadcast channel; polling consumers read a
//! bounded replay ring keyed by a monotonic sequence cursor. Publishing never
//! blocks and never fails: with no subscribers the broadcast send is a no-op,
//! and the ring overwrites its oldest entries when full. Slow subscribers are
//! allowed to lag and lose events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, Mutex};

/// Broadcast backlog per session before slow subscribers start lagging.
pub const BROADCAST_CAPACITY: usize = 256;

/// Replay ring size per session for the polling endpoint.
pub const RING_CAPACITY: usize = 256;

/// What kind of agent work an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Thinking,
    ToolUse,
    ToolResult,
    Subagent,
    FileSave,
    Completed,
}

impl ActivityKind {
    /// Wire name, also used as the SSE event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Thinking => "thinking",
            ActivityKind::ToolUse => "tool_use",
            ActivityKind::ToolResult => "tool_result",
            ActivityKind::Subagent => "subagent",
            ActivityKind::FileSave => "file_save",
            ActivityKind::Completed => "completed",
        }
    }
}

/// One observable step of agent work within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Monotonic per-session cursor. Starts at 1 and never repeats within a
    /// session's lifetime.
    pub seq: u64,
    pub session_id: String,
    pub kind: ActivityKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

struct SessionChannel {
    tx: broadcast::Sender<ActivityEvent>,
    ring: VecDeque<ActivityEvent>,
    next_seq: u64,
}

impl SessionChannel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            ring: VecDeque::new(),
            next_seq: 1,
        }
    }
}

/// Fan-out hub for all sessions.
pub struct ActivityBus {
    channels: Mutex<HashMap<String, SessionChannel>>,
}

impl ActivityBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Record an event and fan it out to any live subscribers.
    pub async fn publish(&self, session_id: &str, kind: ActivityKind, payload: Value) {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .entry(session_id.to_string())
            .or_insert_with(SessionChannel::new);

        let event = ActivityEvent {
            seq: channel.next_seq,
            session_id: session_id.to_string(),
            kind,
            payload,
            at: Utc::now(),
        };
        channel.next_seq += 1;

        if channel.ring.len() == RING_CAPACITY {
            channel.ring.pop_front();
        }
        channel.ring.push_back(event.clone());

        // No subscribers is fine.
        let _ = channel.tx.send(event);
    }

    /// Subscribe to live events for a session.
    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<ActivityEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(session_id.to_string())
            .or_insert_with(SessionChannel::new)
            .tx
            .subscribe()
    }

    /// Snapshot of ring events with `seq > after`, plus the cursor to pass on
    /// the next poll. Events older than the ring are gone; pollers that fall
    /// that far behind silently skip ahead.
    pub async fn events_after(&self, session_id: &str, after: u64) -> (Vec<ActivityEvent>, u64) {
        let channels = self.channels.lock().await;
        let Some(channel) = channels.get(session_id) else {
            return (Vec::new(), after);
        };
        let events: Vec<ActivityEvent> = channel
            .ring
            .iter()
            .filter(|event| event.seq > after)
            .cloned()
            .collect();
        let cursor = events.last().map(|event| event.seq).unwrap_or(after);
        (events, cursor)
    }

    /// Drop all state for a session. Live subscribers observe a closed
    /// channel.
    pub async fn remove(&self, session_id: &str) {
        self.channels.lock().await.remove(session_id);
    }
}

impl Default for ActivityBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = ActivityBus::new();
        let mut rx = bus.subscribe("s1").await;

        bus.publish("s1", ActivityKind::Thinking, json!({"content": "hmm"}))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.kind, ActivityKind::Thinking);
        assert_eq!(event.payload["content"], "hmm");
    }

    #[tokio::test]
    async fn poll_returns_only_events_after_cursor() {
        let bus = ActivityBus::new();
        for i in 0..5 {
            bus.publish("s1", ActivityKind::ToolUse, json!({"n": i}))
                .await;
        }

        let (all, cursor) = bus.events_after("s1", 0).await;
        assert_eq!(all.len(), 5);
        assert_eq!(cursor, 5);

        let (rest, cursor) = bus.events_after("s1", 3).await;
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].seq, 4);
        assert_eq!(cursor, 5);

        let (none, cursor) = bus.events_after("s1", 5).await;
        assert!(none.is_empty());
        assert_eq!(cursor, 5);
    }

    #[tokio::test]
    async fn poll_on_unknown_session_is_empty() {
        let bus = ActivityBus::new();
        let (events, cursor) = bus.events_after("nope", 7).await;
        assert!(events.is_empty());
        assert_eq!(cursor, 7);
    }

    #[tokio::test]
    async fn ring_drops_oldest_beyond_capacity() {
        let bus = ActivityBus::new();
        for i in 0..(RING_CAPACITY + 10) {
            bus.publish("s1", ActivityKind::Thinking, json!({"n": i}))
                .await;
        }

        let (events, cursor) = bus.events_after("s1", 0).await;
        assert_eq!(events.len(), RING_CAPACITY);
        assert_eq!(events[0].seq, 11);
        assert_eq!(cursor, (RING_CAPACITY + 10) as u64);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let bus = ActivityBus::new();
        let mut rx_a = bus.subscribe("a").await;

        bus.publish("b", ActivityKind::Completed, json!({})).await;
        bus.publish("a", ActivityKind::FileSave, json!({"name": "Write"}))
            .await;

        let event = rx_a.recv().await.unwrap();
        assert_eq!(event.kind, ActivityKind::FileSave);

        let (b_events, _) = bus.events_after("b", 0).await;
        assert_eq!(b_events.len(), 1);
        assert_eq!(b_events[0].kind, ActivityKind::Completed);
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = ActivityBus::new();
        let mut rx = bus.subscribe("s1").await;

        for i in 0..(BROADCAST_CAPACITY + 20) {
            bus.publish("s1", ActivityKind::Thinking, json!({"n": i}))
                .await;
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 20),
            other => panic!("Expected Lagged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn remove_clears_session_state() {
        let bus = ActivityBus::new();
        bus.publish("s1", ActivityKind::Thinking, json!({})).await;
        bus.remove("s1").await;

        let (events, cursor) = bus.events_after("s1", 0).await;
        assert!(events.is_empty());
        assert_eq!(cursor, 0);
    }
}
