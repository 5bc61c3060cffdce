//! # Graphscribe
//!
//! Conversational transcription and knowledge-graph service, driven by a CLI
//! coding agent.
//!
//! This library provides:
//! - HTTP APIs for conversational sessions and background jobs
//! - A session actor that serializes turns against one agent CLI process
//! - A job orchestrator with durable records, bounded concurrency and
//!   crash recovery
//! - Transcription, extraction and bootstrap pipelines behind a common
//!   executor trait
//!
//! ## Message Flow
//! 1. Receive a session message via API
//! 2. The session actor runs the turn on its agent process, one at a time
//! 3. Stream activity events (thinking, tool calls, results) over SSE
//! 4. Background jobs re-enter the owning session when they finish
//!
//! ## Modules
//! - `session`: Session actors, registry, activity bus, continuation bridge
//! - `jobs`: Durable job records, executors, the orchestrator
//! - `pipeline`: Transcription, graph extraction and library bootstrap
//! - `agent`: The agent CLI connector and its NDJSON protocol

pub mod agent;
pub mod api;
pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod session;

pub use config::Config;
