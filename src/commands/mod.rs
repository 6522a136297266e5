//! Command implementations for the bosun CLI.
//!
//! This module contains the thin adapter between the CLI surface and the
//! library API. Mutating commands go through [`Coordinator`]; read-only
//! commands read `state.json` and the lock mirror directly so they never
//! rewrite coordinator state.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::CoordinatorPaths;
use crate::coordinator::Coordinator;
use crate::locks::LockManager;
use crate::models::{
    AgentInfo, FileLock, NewTask, ServerState, Task, TaskPriority, TaskStatus,
};
use crate::state::StateStore;
use crate::{Error, Result};

/// How a command result reaches the terminal: a JSON envelope on stdout
/// by default, prose when `--human` is set.
pub trait Render {
    /// The JSON document printed on stdout.
    fn to_json(&self) -> String;
    /// The human-readable rendering.
    fn to_human(&self) -> String;
}

/// The envelope every JSON command result is printed inside.
///
/// `data` is present exactly when `success` is true; failures carry the
/// message in `error` instead and are written to stderr by `main`.
#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    /// Envelope a successful result.
    pub fn wrap(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl Envelope<()> {
    /// Envelope a failure message.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Read the state snapshot for read-only commands.
fn read_state(project_root: &Path) -> Result<ServerState> {
    let paths = CoordinatorPaths::new(project_root);
    if !paths.exists() {
        return Err(Error::NotInitialized);
    }
    let store = StateStore::new(paths.state_file(), paths.state_lock(), paths.state_tmp());
    store.read().ok_or(Error::NotInitialized)
}

// === Init ===

#[derive(Serialize)]
pub struct InitResult {
    pub initialized: bool,
    pub coordinator_dir: String,
}

impl Render for InitResult {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        format!("Initialized coordinator at {}", self.coordinator_dir)
    }
}

/// Create the coordinator layout and an initial state file.
pub fn init(project_root: &Path) -> Result<InitResult> {
    let coordinator = Coordinator::initialize(project_root)?;
    Ok(InitResult {
        initialized: true,
        coordinator_dir: coordinator
            .paths()
            .coordinator_dir()
            .to_string_lossy()
            .to_string(),
    })
}

// === Status ===

#[derive(Serialize)]
pub struct StatusSummary {
    pub project_path: String,
    pub started_at: String,
    pub agents: BTreeMap<String, usize>,
    pub tasks: BTreeMap<String, usize>,
    pub queue_depth: usize,
    pub active_locks: usize,
    pub ops_log: String,
}

impl Render for StatusSummary {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        let mut out = format!(
            "Project: {}\nCoordinator started: {}\nQueue depth: {}\nActive locks: {}\n",
            self.project_path, self.started_at, self.queue_depth, self.active_locks
        );
        out.push_str("Agents:");
        if self.agents.is_empty() {
            out.push_str(" none\n");
        } else {
            out.push('\n');
            for (status, count) in &self.agents {
                out.push_str(&format!("  {}: {}\n", status, count));
            }
        }
        out.push_str("Tasks:");
        if self.tasks.is_empty() {
            out.push_str(" none\n");
        } else {
            out.push('\n');
            for (status, count) in &self.tasks {
                out.push_str(&format!("  {}: {}\n", status, count));
            }
        }
        out
    }
}

/// Summarize agents, tasks, queue depth, and locks.
pub fn status(project_root: &Path) -> Result<StatusSummary> {
    let state = read_state(project_root)?;
    let paths = CoordinatorPaths::new(project_root);

    let mut agents: BTreeMap<String, usize> = BTreeMap::new();
    for agent in state.agents.values() {
        let key = serde_json::to_value(agent.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        *agents.entry(key).or_default() += 1;
    }

    let mut tasks: BTreeMap<String, usize> = BTreeMap::new();
    for task in state.tasks.values() {
        let key = serde_json::to_value(task.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        *tasks.entry(key).or_default() += 1;
    }

    let mut locks = LockManager::open(
        paths.project_root(),
        paths.locks_file(),
        state.config.lock_timeout_ms,
    );

    Ok(StatusSummary {
        project_path: state.project_path,
        started_at: state.started_at.to_rfc3339(),
        agents,
        tasks,
        queue_depth: state.task_queue.len(),
        active_locks: locks.all().len(),
        ops_log: paths.ops_log().to_string_lossy().to_string(),
    })
}

// === Watch ===

/// Run the coordinator loop in the foreground, printing events.
///
/// With `ticks = Some(n)` the loop exits after n passes; otherwise it runs
/// until the process is killed.
pub fn watch(project_root: &Path, ticks: Option<u64>, human: bool) -> Result<()> {
    let coordinator = Coordinator::initialize(project_root)?;
    coordinator.on_event(move |event| {
        if human {
            println!("{:?}", event);
        } else {
            match serde_json::to_string(event) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Warning: could not serialize event: {}", e),
            }
        }
    });

    let interval = std::time::Duration::from_millis(coordinator.config().heartbeat_interval_ms);
    let mut completed = 0u64;
    loop {
        coordinator.tick()?;
        completed += 1;
        if let Some(limit) = ticks
            && completed >= limit
        {
            break;
        }
        std::thread::sleep(interval);
    }
    Ok(())
}

// === Tasks ===

#[derive(Serialize)]
pub struct TaskCreated {
    pub id: String,
    pub title: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub blocked_by: Vec<String>,
}

impl Render for TaskCreated {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        if self.blocked_by.is_empty() {
            format!("Created {} ({})", self.id, self.title)
        } else {
            format!(
                "Created {} ({}), blocked by {}",
                self.id,
                self.title,
                self.blocked_by.join(", ")
            )
        }
    }
}

/// Queue a new task.
#[allow(clippy::too_many_arguments)]
pub fn task_create(
    project_root: &Path,
    title: &str,
    description: Option<String>,
    priority: &str,
    files: Vec<String>,
    depends_on: Vec<String>,
    tags: Vec<String>,
    max_attempts: Option<u32>,
) -> Result<TaskCreated> {
    let priority = TaskPriority::parse(priority)
        .ok_or_else(|| Error::InvalidInput(format!("unknown priority: {}", priority)))?;

    let coordinator = Coordinator::initialize(project_root)?;
    let task = coordinator.create_task(NewTask {
        title: title.to_string(),
        description,
        priority,
        target_files: files,
        target_directories: Vec::new(),
        depends_on,
        max_attempts,
        tags,
    })?;

    Ok(TaskCreated {
        id: task.id,
        title: task.title,
        priority: task.priority,
        status: task.status,
        blocked_by: task.blocked_by,
    })
}

#[derive(Serialize)]
pub struct TaskList {
    pub tasks: Vec<Task>,
    pub count: usize,
}

impl Render for TaskList {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks".to_string();
        }
        let mut out = String::new();
        for task in &self.tasks {
            out.push_str(&format!(
                "{}  [{:?}/{:?}]  {}{}\n",
                task.id,
                task.priority,
                task.status,
                task.title,
                task.assigned_agent
                    .as_deref()
                    .map(|a| format!("  -> {}", a))
                    .unwrap_or_default()
            ));
        }
        out
    }
}

/// List tasks, optionally filtered by status.
pub fn task_list(project_root: &Path, status: Option<&str>) -> Result<TaskList> {
    let filter = match status {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| Error::InvalidInput(format!("unknown status: {}", raw)))?,
        ),
        None => None,
    };

    let state = read_state(project_root)?;
    let mut tasks: Vec<Task> = state
        .tasks
        .into_values()
        .filter(|task| filter.is_none_or(|wanted| task.status == wanted))
        .collect();
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    Ok(TaskList {
        count: tasks.len(),
        tasks,
    })
}

/// Show one task.
pub fn task_show(project_root: &Path, id: &str) -> Result<Task> {
    let state = read_state(project_root)?;
    state
        .tasks
        .get(id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("task {}", id)))
}

impl Render for Task {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        let mut out = format!(
            "{}  [{:?}/{:?}]  {}\n",
            self.id, self.priority, self.status, self.title
        );
        if let Some(description) = &self.description {
            out.push_str(&format!("  {}\n", description));
        }
        if let Some(agent) = &self.assigned_agent {
            out.push_str(&format!("  assigned to {}\n", agent));
        }
        if !self.blocked_by.is_empty() {
            out.push_str(&format!("  blocked by {}\n", self.blocked_by.join(", ")));
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("  last error: {}\n", error));
        }
        out.push_str(&format!(
            "  attempts {}/{}\n",
            self.attempts, self.max_attempts
        ));
        out
    }
}

#[derive(Serialize)]
pub struct TaskCancelled {
    pub id: String,
    pub status: TaskStatus,
}

impl Render for TaskCancelled {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        format!("Cancelled {}", self.id)
    }
}

/// Cancel a task.
pub fn task_cancel(project_root: &Path, id: &str) -> Result<TaskCancelled> {
    let coordinator = Coordinator::initialize(project_root)?;
    let task = coordinator.cancel_task(id)?;
    Ok(TaskCancelled {
        id: task.id,
        status: task.status,
    })
}

// === Agents ===

#[derive(Serialize)]
pub struct AgentList {
    pub agents: Vec<AgentInfo>,
    pub count: usize,
}

impl Render for AgentList {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        if self.agents.is_empty() {
            return "No agents registered".to_string();
        }
        let mut out = String::new();
        for agent in &self.agents {
            out.push_str(&format!(
                "{}  [{:?}]  {}  done={} failed={}{}\n",
                agent.id,
                agent.status,
                agent.name,
                agent.completed_tasks,
                agent.failed_tasks,
                agent
                    .current_task
                    .as_deref()
                    .map(|t| format!("  working on {}", t))
                    .unwrap_or_default()
            ));
        }
        out
    }
}

/// List registered agents.
pub fn agent_list(project_root: &Path) -> Result<AgentList> {
    let state = read_state(project_root)?;
    let agents: Vec<AgentInfo> = state.agents.into_values().collect();
    Ok(AgentList {
        count: agents.len(),
        agents,
    })
}

// === Locks ===

#[derive(Serialize)]
pub struct LockList {
    pub locks: Vec<FileLock>,
    pub count: usize,
}

impl Render for LockList {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        if self.locks.is_empty() {
            return "No active locks".to_string();
        }
        let mut out = String::new();
        for lock in &self.locks {
            out.push_str(&format!(
                "{}  [{:?}]  held by {}  until {}\n",
                lock.path,
                lock.lock_type,
                lock.agent_id,
                lock.expires_at.to_rfc3339()
            ));
        }
        out
    }
}

/// List active file locks.
pub fn lock_list(project_root: &Path) -> Result<LockList> {
    let paths = CoordinatorPaths::new(project_root);
    if !paths.exists() {
        return Err(Error::NotInitialized);
    }
    let state = read_state(project_root)?;
    let mut manager = LockManager::open(
        paths.project_root(),
        paths.locks_file(),
        state.config.lock_timeout_ms,
    );
    let locks = manager.all();
    Ok(LockList {
        count: locks.len(),
        locks,
    })
}

#[derive(Serialize)]
pub struct LockReleased {
    pub path: String,
    pub released: bool,
}

impl Render for LockReleased {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        if self.released {
            format!("Released lock on {}", self.path)
        } else {
            format!("No lock held on {}", self.path)
        }
    }
}

/// Force-release one lock.
pub fn lock_release(project_root: &Path, path: &str) -> Result<LockReleased> {
    let coordinator = Coordinator::initialize(project_root)?;
    let released = coordinator.force_release_lock(path)?;
    Ok(LockReleased {
        path: path.to_string(),
        released,
    })
}

// === Clean ===

#[derive(Serialize)]
pub struct CleanResult {
    pub removed: usize,
}

impl Render for CleanResult {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Envelope::wrap(self)).unwrap_or_default()
    }

    fn to_human(&self) -> String {
        format!("Removed {} old message files", self.removed)
    }
}

/// Delete queue and board messages older than the cutoff.
pub fn clean(project_root: &Path, max_age_ms: u64) -> Result<CleanResult> {
    let coordinator = Coordinator::initialize(project_root)?;
    let removed = coordinator.clean_old_messages(max_age_ms)?;
    Ok(CleanResult { removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestProject;

    #[test]
    fn test_init_then_status() {
        let project = TestProject::new();
        let result = init(project.path()).unwrap();
        assert!(result.initialized);

        let summary = status(project.path()).unwrap();
        assert_eq!(summary.queue_depth, 0);
        assert!(summary.agents.is_empty());
    }

    #[test]
    fn test_status_requires_init() {
        let project = TestProject::new();
        assert!(matches!(status(project.path()), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_task_create_and_list_filter() {
        let project = TestProject::new();
        init(project.path()).unwrap();

        let created = task_create(
            project.path(),
            "reef the sails",
            None,
            "high",
            vec![],
            vec![],
            vec![],
            None,
        )
        .unwrap();
        assert_eq!(created.priority, TaskPriority::High);

        let all = task_list(project.path(), None).unwrap();
        assert_eq!(all.count, 1);
        let pending = task_list(project.path(), Some("pending")).unwrap();
        assert_eq!(pending.count, 1);
        let done = task_list(project.path(), Some("completed")).unwrap();
        assert_eq!(done.count, 0);
        assert!(task_list(project.path(), Some("bogus")).is_err());
    }

    #[test]
    fn test_task_create_rejects_bad_priority() {
        let project = TestProject::new();
        init(project.path()).unwrap();
        let result = task_create(
            project.path(),
            "x",
            None,
            "urgent",
            vec![],
            vec![],
            vec![],
            None,
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_task_cancel_roundtrip() {
        let project = TestProject::new();
        init(project.path()).unwrap();
        let created = task_create(
            project.path(),
            "doomed",
            None,
            "normal",
            vec![],
            vec![],
            vec![],
            None,
        )
        .unwrap();

        let cancelled = task_cancel(project.path(), &created.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        let shown = task_show(project.path(), &created.id).unwrap();
        assert_eq!(shown.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_watch_bounded_ticks_returns() {
        let project = TestProject::new();
        init(project.path()).unwrap();
        watch(project.path(), Some(1), false).unwrap();
    }
}
