//! Session endpoints: open, message, status, close and the two activity
//! feeds (SSE stream and polling snapshot).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::routes::AppState;
use super::types::{
    ActivityQuery, ActivitySnapshotResponse, OpenSessionResponse, SendMessageRequest,
    SendMessageResponse, SessionStatusResponse,
};
use crate::session::{SessionError, SessionState, TurnKind};

fn error_response(e: SessionError) -> (StatusCode, String) {
    let status = match &e {
        SessionError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        SessionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SessionError::Busy => StatusCode::TOO_MANY_REQUESTS,
        SessionError::Connection(_) | SessionError::Turn(_) | SessionError::WorkerGone => {
            StatusCode::BAD_GATEWAY
        }
    };
    (status, e.to_string())
}

/// Open a session, creating its actor on first contact. Blocks until the
/// greeting is ready or the greeting timeout falls back to the canned text.
pub async fn open_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<OpenSessionResponse>, (StatusCode, String)> {
    let actor = state
        .registry
        .get_or_create(&session_id)
        .await
        .map_err(error_response)?;
    let greeting = actor.greeting().await;
    let session_state = actor.state().await;
    Ok(Json(OpenSessionResponse {
        session_id,
        state: session_state,
        greeting,
    }))
}

/// Run one user turn and block for the reply.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, (StatusCode, String)> {
    if request.text.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "text must not be empty".to_string()));
    }
    let actor = state
        .registry
        .get_or_create(&session_id)
        .await
        .map_err(error_response)?;
    let outcome = actor
        .submit(request.text, TurnKind::User)
        .await
        .map_err(error_response)?;
    Ok(Json(SendMessageResponse {
        text: outcome.text,
        usage: outcome.usage,
    }))
}

/// Report a session's state without creating one. Unknown and timed-out
/// sessions both read as expired.
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<SessionStatusResponse> {
    let ttl = state.registry.session_ttl();
    match state.registry.get(&session_id).await {
        Some(actor) if actor.is_alive() && !actor.is_expired(ttl) => {
            let idle = chrono::Duration::from_std(actor.idle_for())
                .unwrap_or_else(|_| chrono::Duration::zero());
            Json(SessionStatusResponse {
                session_id,
                state: actor.state().await,
                last_activity: Some(chrono::Utc::now() - idle),
            })
        }
        _ => Json(SessionStatusResponse {
            session_id,
            state: SessionState::Expired,
            last_activity: None,
        }),
    }
}

pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if state.registry.remove(&session_id).await {
        Ok(Json(serde_json::json!({ "ok": true })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            format!("session {} not found", session_id),
        ))
    }
}

/// Stream a session's activity as SSE. Subscribing before the session is
/// opened is allowed; events start flowing once the actor publishes.
pub async fn activity_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.activity.subscribe(&session_id).await;

    let stream = async_stream::stream! {
        // Keepalive comments prevent idle proxies from dropping the
        // connection between agent events.
        let mut keepalive = tokio::time::interval(Duration::from_secs(15));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let sse = Event::default()
                                .event(event.kind.as_str())
                                .json_data(&event)
                                .unwrap();
                            yield Ok(sse);
                        }
                        Err(broadcast::error::RecvError::Lagged(dropped)) => {
                            let sse = Event::default()
                                .event("lagged")
                                .json_data(&serde_json::json!({ "dropped": dropped }))
                                .unwrap();
                            yield Ok(sse);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = keepalive.tick() => {
                    yield Ok(Event::default().comment("keepalive"));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// Polling fallback: everything after the client's cursor, plus the state
/// and the advertised poll interval.
pub async fn activity_snapshot(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ActivityQuery>,
) -> Json<ActivitySnapshotResponse> {
    let (events, next_cursor) = state.activity.events_after(&session_id, query.after).await;
    let ttl = state.registry.session_ttl();
    let session_state = match state.registry.get(&session_id).await {
        Some(actor) if actor.is_alive() && !actor.is_expired(ttl) => actor.state().await,
        _ => SessionState::Expired,
    };
    Json(ActivitySnapshotResponse {
        session_id,
        state: session_state,
        events,
        next_cursor,
        poll_interval_ms: state.config.activity_poll_interval_ms,
    })
}
