//! HTTP API for the transcription service.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/sessions/{id}/open` - Open (or reconnect to) a session
//! - `POST /api/sessions/{id}/messages` - Send a message, wait for the reply
//! - `GET /api/sessions/{id}` - Session state and last activity
//! - `DELETE /api/sessions/{id}` - Close a session
//! - `GET /api/sessions/{id}/activity/stream` - Stream session activity via SSE
//! - `GET /api/sessions/{id}/activity` - Poll session activity after a cursor
//! - `POST /api/jobs` - Submit a background job
//! - `GET /api/jobs` - List jobs, filterable by status and type
//! - `GET /api/jobs/{id}` - Get one job record
//! - `POST /api/jobs/{id}/cancel` - Request cancellation

mod jobs;
mod routes;
mod sessions;
pub mod types;

pub use routes::serve;
pub use types::*;
