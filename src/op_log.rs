//! Structured operation logging for coordinator commands.
//!
//! Every public mutating operation appends one JSONL record to
//! `<coordinator>/ops.log`. Logging never fails the caller: on any error it
//! prints a warning and moves on, so a full disk or bad permissions cannot
//! take the broker down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// One logged operation.
#[derive(Debug, Serialize, Deserialize)]
pub struct OpLogEntry {
    /// When the operation finished
    pub timestamp: DateTime<Utc>,

    /// Operation name (e.g., "create_task", "register_agent")
    pub op: String,

    /// Operation arguments as JSON
    pub args: serde_json::Value,

    /// Whether the operation succeeded
    pub success: bool,

    /// Error message on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Execution duration in milliseconds
    pub duration_ms: u64,

    /// Process that performed the operation
    pub pid: u32,
}

/// Append an operation record to the log at `path`.
pub fn log_op(
    path: &Path,
    op: &str,
    args: serde_json::Value,
    success: bool,
    error: Option<String>,
    duration_ms: u64,
) {
    let entry = OpLogEntry {
        timestamp: Utc::now(),
        op: op.to_string(),
        args,
        success,
        error,
        duration_ms,
        pid: std::process::id(),
    };

    if let Err(e) = append_entry(path, &entry) {
        eprintln!("Warning: could not write op log {}: {}", path.display(), e);
    }
}

fn append_entry(path: &Path, entry: &OpLogEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", json)?;
    Ok(())
}

/// Read back every parseable entry, oldest first. Malformed lines are
/// skipped.
pub fn read_entries(path: &Path) -> Vec<OpLogEntry> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
