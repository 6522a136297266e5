//! Typed events emitted by the coordinator for in-process observers.
//!
//! Observers are plain callbacks registered with
//! [`Coordinator::on_event`](super::Coordinator::on_event). Events are not
//! persisted and carry ids rather than owning copies of large records.

use serde::Serialize;

use crate::locks::LockConflict;
use crate::models::{AgentInfo, AgentStatus, Task};

/// Something the broker did or observed during an operation or a tick.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    AgentRegistered {
        agent: Box<AgentInfo>,
    },
    AgentDisconnected {
        agent_id: String,
    },
    AgentStatusChanged {
        agent_id: String,
        status: AgentStatus,
    },
    TaskCreated {
        task: Box<Task>,
    },
    TaskAssigned {
        task_id: String,
        agent_id: String,
    },
    TaskStarted {
        task_id: String,
        agent_id: String,
    },
    TaskProgress {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TaskCompleted {
        task_id: String,
        agent_id: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
        /// True when the retry budget is exhausted and the task is terminal
        terminal: bool,
    },
    TaskCancelled {
        task_id: String,
    },
    LockAcquired {
        agent_id: String,
        paths: Vec<String>,
    },
    LockReleased {
        agent_id: String,
        paths: Vec<String>,
    },
    LockConflictDetected {
        agent_id: String,
        conflicts: Vec<LockConflict>,
    },
    Error {
        context: String,
    },
}

/// Observer callback type.
pub type EventObserver = Box<dyn Fn(&CoordinatorEvent) + Send>;
