//! Message envelopes exchanged between the coordinator and agents.
//!
//! Messages are JSON-encoded and use a `type` field for discrimination.
//! Each envelope carries an id built from the current wall-clock millisecond
//! plus a hashed suffix; the id doubles as the file name stem so that a
//! lexicographic directory listing yields chronological order within one
//! producer. Ordering across producers is by `(timestamp, id)`.
//!
//! Delivery is at-least-once (read then unlink), so every handler must be
//! idempotent keyed by envelope id; [`RecentIds`] is the bounded
//! recently-seen window both sides use for that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};

use crate::locks::{LockRequest, LockResult};
use crate::models::{AgentInfo, AgentStatus, Task, TaskResult, TaskStatus};

/// Typed payloads, one per message kind.
///
/// # Examples
///
/// ```json
/// {"type": "AGENT_HEARTBEAT", "status": "working", "current_task": "task-9c41"}
/// {"type": "TASK_COMPLETE", "task_id": "task-9c41", "result": {"success": true}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    /// Agent announces itself with its full record.
    AgentRegister { agent: Box<AgentInfo> },

    /// Periodic liveness report.
    AgentHeartbeat {
        status: AgentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_task: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Agent is going away on purpose.
    AgentDisconnect { agent_id: String },

    /// Idle agent asks for work outside the auto-assign cycle.
    TaskRequest { agent_id: String },

    /// Coordinator hands a task to an agent.
    TaskAssign { task: Box<Task> },

    /// Agent reports task status or progress.
    TaskUpdate {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<TaskStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Agent finished its task.
    TaskComplete { task_id: String, result: TaskResult },

    /// Agent could not finish its task.
    TaskFailed { task_id: String, error: String },

    /// Agent asks for file locks.
    LockRequest(LockRequest),

    /// Coordinator answers a lock request; `correlation_id` ties it back.
    LockResponse(LockResult),

    /// Agent gives file locks back.
    LockRelease { paths: Vec<String> },

    /// State synchronization; the payload is deliberately loose.
    SyncState {
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Free-form broadcast relayed to every other agent.
    Broadcast {
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl MessagePayload {
    /// The wire name of this payload's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::AgentRegister { .. } => "AGENT_REGISTER",
            MessagePayload::AgentHeartbeat { .. } => "AGENT_HEARTBEAT",
            MessagePayload::AgentDisconnect { .. } => "AGENT_DISCONNECT",
            MessagePayload::TaskRequest { .. } => "TASK_REQUEST",
            MessagePayload::TaskAssign { .. } => "TASK_ASSIGN",
            MessagePayload::TaskUpdate { .. } => "TASK_UPDATE",
            MessagePayload::TaskComplete { .. } => "TASK_COMPLETE",
            MessagePayload::TaskFailed { .. } => "TASK_FAILED",
            MessagePayload::LockRequest(_) => "LOCK_REQUEST",
            MessagePayload::LockResponse(_) => "LOCK_RESPONSE",
            MessagePayload::LockRelease { .. } => "LOCK_RELEASE",
            MessagePayload::SyncState { .. } => "SYNC_STATE",
            MessagePayload::Broadcast { .. } => "BROADCAST",
        }
    }
}

/// One message between the coordinator and an agent (or the global board).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id, `<epoch-ms>-<hex suffix>`; also the file name stem
    pub id: String,

    /// When the message was built
    pub timestamp: DateTime<Utc>,

    /// Sender: an agent id, or "coordinator"
    pub source: String,

    /// Receiver, when addressed to one agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Id of the request this message answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// The typed payload; its `type` tag lands at the top level
    #[serde(flatten)]
    pub payload: MessagePayload,
}

/// Sender id the coordinator uses on its own messages.
pub const COORDINATOR_SOURCE: &str = "coordinator";

impl Message {
    /// Build a new envelope from the given source.
    pub fn new(source: impl Into<String>, payload: MessagePayload) -> Self {
        let now = Utc::now();
        Self {
            id: generate_message_id(now),
            timestamp: now,
            source: source.into(),
            target: None,
            correlation_id: None,
            payload,
        }
    }

    /// Address the message to one agent.
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Mark this message as the answer to `request_id`.
    pub fn in_reply_to(mut self, request_id: impl Into<String>) -> Self {
        self.correlation_id = Some(request_id.into());
        self
    }

    /// File name this message is persisted under.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }

    /// Sort key for cross-producer ordering: timestamp, tie broken by id.
    pub fn sort_key(&self) -> (i64, &str) {
        (self.timestamp.timestamp_millis(), self.id.as_str())
    }
}

/// Build a message id from the wall clock: `<epoch-ms>-<6 hex chars>`.
///
/// The suffix only has to make concurrent same-millisecond writers land on
/// different file names; it carries no ordering meaning.
pub fn generate_message_id(now: DateTime<Utc>) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let millis = now.timestamp_millis();
    let mut hasher = Sha256::new();
    hasher.update(millis.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.update(now.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    let hash = hasher.finalize();
    let hex = format!("{:x}", hash);
    format!("{:013}-{}", millis, &hex[..6])
}

/// Generate a unique entity id: `<prefix>-<4 hex chars>`.
///
/// Used for agent and task ids. Collisions against `existing` are retried
/// with a longer suffix.
pub fn generate_entity_id(prefix: &str, seed: &str, exists: impl Fn(&str) -> bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    hasher.update(std::process::id().to_le_bytes());
    let hash = hasher.finalize();
    let hex = format!("{:x}", hash);

    for len in [4usize, 6, 8, 12] {
        let candidate = format!("{}-{}", prefix, &hex[..len]);
        if !exists(&candidate) {
            return candidate;
        }
    }
    format!("{}-{}", prefix, &hex[..16])
}

/// Bounded window of recently seen message ids.
///
/// At-least-once delivery means duplicates happen; `insert` returns false
/// for an id seen within the window so the caller can drop it.
#[derive(Debug)]
pub struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    /// Window size shared by the coordinator and agents.
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id. Returns `true` if it was new, `false` if it is a
    /// duplicate within the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.seen.remove(&evicted);
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
