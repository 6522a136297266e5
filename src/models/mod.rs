//! Data models for bosun entities.
//!
//! This module defines the core data structures:
//! - `AgentInfo` - one registered worker process
//! - `Task` - a unit of work with priority, dependencies, and target files
//! - `TaskResult` - the outcome written when a task completes
//! - `FileLock` - a lease on a working-tree path
//! - `ServerState` - the canonical coordinator snapshot persisted to `state.json`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::CoordinatorConfig;

/// Version tag written into `state.json` so future layouts can migrate.
pub const STATE_VERSION: u32 = 1;

/// Status of a registered agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Blocked,
    Error,
    Offline,
}

/// A worker process registered with the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Stable identifier, unique for the coordinator's lifetime (e.g., "agent-3f2a")
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Current status
    #[serde(default)]
    pub status: AgentStatus,

    /// Task currently assigned to this agent, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,

    /// Git branch the agent is working on, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_branch: Option<String>,

    /// Directory the agent process runs in
    pub working_directory: String,

    /// Registration timestamp
    pub started_at: DateTime<Utc>,

    /// Last time the agent was heard from
    pub last_heartbeat: DateTime<Utc>,

    /// Number of tasks this agent has completed
    #[serde(default)]
    pub completed_tasks: u32,

    /// Number of task attempts this agent has failed
    #[serde(default)]
    pub failed_tasks: u32,

    /// Capability tags used for assignment matching (e.g., "rust", "frontend")
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Free-form metadata supplied at registration
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl AgentInfo {
    /// Create a new agent record in the `idle` state.
    pub fn new(id: String, name: String, working_directory: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            status: AgentStatus::Idle,
            current_task: None,
            working_branch: None,
            working_directory,
            started_at: now,
            last_heartbeat: now,
            completed_tasks: 0,
            failed_tasks: 0,
            capabilities: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Priority level for tasks. Lower rank is assigned first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Explicit assignment ordering: critical=0, high=1, normal=2, low=3.
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }

    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(TaskPriority::Critical),
            "high" => Some(TaskPriority::High),
            "normal" => Some(TaskPriority::Normal),
            "low" => Some(TaskPriority::Low),
            _ => None,
        }
    }
}

/// Task status in the assignment lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are immutable; no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(TaskStatus::Pending),
            "assigned" => Some(TaskStatus::Assigned),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// Default retry budget for new tasks.
fn default_max_attempts() -> u32 {
    3
}

/// A unit of work tracked by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (e.g., "task-9c41")
    pub id: String,

    /// Task title
    pub title: String,

    /// Detailed description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Priority level
    #[serde(default)]
    pub priority: TaskPriority,

    /// Current status
    #[serde(default)]
    pub status: TaskStatus,

    /// Agent the task is assigned to, when status is assigned/in_progress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,

    /// When the current assignment was made
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When the assigned agent reported it began work
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of assignment attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Retry budget; at this many failed attempts the task is terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Relative paths the task will modify; write-locked on assignment
    #[serde(default)]
    pub target_files: Vec<String>,

    /// Relative directories the task will work under
    #[serde(default)]
    pub target_directories: Vec<String>,

    /// Task ids that must be completed before this task may be assigned
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Subset of depends_on not yet completed
    #[serde(default)]
    pub blocked_by: Vec<String>,

    /// Working branch derived at assignment when git integration is on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Branch the working branch was derived from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,

    /// Result written on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,

    /// Last failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Tags for categorization and capability matching
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Task {
    /// Create a new pending task with the given ID and title.
    pub fn new(id: String, title: String) -> Self {
        Self {
            id,
            title,
            description: None,
            priority: TaskPriority::default(),
            status: TaskStatus::default(),
            assigned_agent: None,
            assigned_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts: default_max_attempts(),
            target_files: Vec::new(),
            target_directories: Vec::new(),
            depends_on: Vec::new(),
            blocked_by: Vec::new(),
            branch: None,
            base_branch: None,
            result: None,
            error: None,
            tags: Vec::new(),
        }
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub target_directories: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewTask {
    /// Create a request with the given title and defaults for everything else.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Outcome of a completed task, written once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether the task succeeded
    pub success: bool,

    /// Short summary of what was done
    #[serde(default)]
    pub summary: String,

    /// Files the task modified
    #[serde(default)]
    pub files_modified: Vec<String>,

    /// Files the task created
    #[serde(default)]
    pub files_created: Vec<String>,

    /// Files the task deleted
    #[serde(default)]
    pub files_deleted: Vec<String>,

    /// Tests passing after the change, if counted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<u32>,

    /// Tests failing after the change, if counted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_failed: Option<u32>,

    /// Non-fatal warnings worth surfacing
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Kind of lease held on a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Read,
    #[default]
    Write,
    Exclusive,
}

impl LockType {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "read" => Some(LockType::Read),
            "write" => Some(LockType::Write),
            "exclusive" => Some(LockType::Exclusive),
            _ => None,
        }
    }
}

/// A lease on a working-tree path.
///
/// The path is stored in canonical form: relative to the project root,
/// forward-slash separated, no trailing slash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLock {
    /// Canonical relative path
    pub path: String,

    /// Owning agent
    pub agent_id: String,

    /// Task the lock was taken for, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// When the lease was granted
    pub locked_at: DateTime<Utc>,

    /// Wall-clock deadline; at or past this instant the lock is gone
    pub expires_at: DateTime<Utc>,

    /// Kind of lease
    #[serde(default)]
    pub lock_type: LockType,
}

impl FileLock {
    /// A lock is expired once its deadline is reached (`expires_at <= now`).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The canonical coordinator snapshot persisted to `state.json`.
///
/// Agent and task maps are keyed by id; `task_queue` holds pending task ids
/// in consideration order. Maps are BTreeMaps so the pretty-printed file is
/// stable across rewrites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerState {
    /// Layout version tag
    pub version: u32,

    /// When this coordinator instance started
    pub started_at: DateTime<Utc>,

    /// Absolute path of the project the coordinator serves
    pub project_path: String,

    /// All registered agents by id
    #[serde(default)]
    pub agents: BTreeMap<String, AgentInfo>,

    /// All known tasks by id
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,

    /// Pending task ids in consideration order
    #[serde(default)]
    pub task_queue: Vec<String>,

    /// Ids of completed tasks, oldest first
    #[serde(default)]
    pub completed_history: Vec<String>,

    /// Effective configuration at startup
    #[serde(default)]
    pub config: CoordinatorConfig,

    /// Fields written by other tools or newer versions; preserved on rewrite
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ServerState {
    /// Create a fresh state snapshot for a project.
    pub fn new(project_path: String, config: CoordinatorConfig) -> Self {
        Self {
            version: STATE_VERSION,
            started_at: Utc::now(),
            project_path,
            agents: BTreeMap::new(),
            tasks: BTreeMap::new(),
            task_queue: Vec::new(),
            completed_history: Vec::new(),
            config,
            extra: BTreeMap::new(),
        }
    }
}
