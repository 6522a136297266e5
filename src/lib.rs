//! Bosun - a file-based coordinator for fleets of AI coding agents.
//!
//! This library provides the core functionality for the `bosun` CLI tool:
//! a single-coordinator, many-agent task broker that runs over a shared
//! `.agent-coordinator/` directory with no database and no server socket.
//!
//! The moving parts:
//! - `coordinator` - the broker process: agent registry, task lifecycle,
//!   priority queue with dependency gating, heartbeat watchdog
//! - `agent` - the worker-process side: registration, heartbeats, inbox
//!   polling, task acceptance
//! - `queue` - durable per-agent inbox/outbox message directories
//! - `state` - the canonical `state.json` snapshot with advisory locking
//! - `locks` - lease-based file locks with a compatibility matrix

pub mod agent;
pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod locks;
pub mod messages;
pub mod models;
pub mod op_log;
pub mod queue;
pub mod state;


/// Library-level error type for bosun operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not initialized: run `bosun init` first")]
    NotInitialized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    #[error("State file is contended: {0}")]
    ContendedState(String),

    #[error("Agent limit reached ({0} agents registered)")]
    AgentLimitReached(usize),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for bosun operations.
pub type Result<T> = std::result::Result<T, Error>;
