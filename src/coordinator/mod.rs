//! The task broker: agent registry, task lifecycle, and the periodic tick.
//!
//! Exactly one coordinator process runs per project. Each tick it
//!
//! 1. drains every agent outbox and dispatches the messages in
//!    `(timestamp, id)` order,
//! 2. runs the watchdog (heartbeat timeouts, agent eviction, task
//!    timeouts),
//! 3. auto-assigns pending tasks to idle agents when enabled,
//!
//! then persists the state snapshot. Handlers and the assignment pass never
//! interleave: everything runs on one thread under one mutex.
//!
//! [`Coordinator`] is the shareable front; the [`Core`] behind it owns the
//! in-memory `ServerState`, the lock table, and the message queues.

pub mod events;

pub use events::CoordinatorEvent;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{CoordinatorConfig, CoordinatorPaths};
use crate::locks::{LockManager, LockRequest, LockResult};
use crate::messages::{
    COORDINATOR_SOURCE, Message, MessagePayload, RecentIds, generate_entity_id,
};
use crate::models::{
    AgentInfo, AgentStatus, FileLock, LockType, NewTask, ServerState, Task, TaskResult, TaskStatus,
};
use crate::op_log;
use crate::queue::MessageQueue;
use crate::state::StateStore;
use crate::{Error, Result};

/// An agent silent this long past its last heartbeat is evicted entirely.
const AGENT_EVICT_MS: i64 = 300_000;

/// What one tick did; returned for observability and tests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub messages_processed: usize,
    pub agents_offlined: usize,
    pub agents_evicted: usize,
    pub tasks_assigned: usize,
    pub tasks_timed_out: usize,
}

/// Broker internals; one per coordinator, always behind the facade mutex.
struct Core {
    paths: CoordinatorPaths,
    config: CoordinatorConfig,
    store: StateStore,
    queue: MessageQueue,
    locks: LockManager,
    state: ServerState,
    observers: Vec<events::EventObserver>,
    recent: RecentIds,
}

impl Core {
    fn emit(&self, event: CoordinatorEvent) {
        for observer in &self.observers {
            observer(&event);
        }
    }

    fn persist(&self) -> Result<()> {
        self.store.write(&self.state)
    }

    /// Fold externally written state into the snapshot before a tick.
    ///
    /// Two other writers touch `state.json` under the advisory lock: agents
    /// refreshing their own `last_heartbeat`, and one-shot CLI invocations
    /// adding tasks. Take the newer heartbeat so a later full write does
    /// not roll an agent's liveness backwards, and adopt tasks this
    /// process has not seen.
    fn absorb_external_state(&mut self) {
        let Some(disk) = self.store.read() else {
            return;
        };
        for (id, disk_agent) in disk.agents {
            if let Some(agent) = self.state.agents.get_mut(&id)
                && disk_agent.last_heartbeat > agent.last_heartbeat
            {
                agent.last_heartbeat = disk_agent.last_heartbeat;
            }
        }
        for (id, task) in disk.tasks {
            self.state.tasks.entry(id).or_insert(task);
        }
        for id in disk.task_queue {
            if !self.state.task_queue.contains(&id)
                && self
                    .state
                    .tasks
                    .get(&id)
                    .is_some_and(|task| task.status == TaskStatus::Pending)
            {
                self.state.task_queue.push(id);
            }
        }
    }

    // === Agent registry ===

    fn register_agent(&mut self, mut agent: AgentInfo) -> Result<AgentInfo> {
        if agent.id.is_empty() {
            return Err(Error::InvalidInput("agent id must not be empty".into()));
        }

        let previous = self.state.agents.get(&agent.id).cloned();
        match previous {
            Some(existing) => {
                // Re-registration with a known id: keep the ledger, go idle.
                // A task still assigned from before the restart goes back to
                // the queue; the fresh registration owns nothing yet.
                agent.completed_tasks = existing.completed_tasks;
                agent.failed_tasks = existing.failed_tasks;
                agent.started_at = existing.started_at;
                if let Some(task_id) = existing.current_task {
                    self.unassign_task(&task_id)?;
                }
            }
            None => {
                if self.state.agents.len() >= self.config.max_agents {
                    return Err(Error::AgentLimitReached(self.state.agents.len()));
                }
            }
        }

        agent.status = AgentStatus::Idle;
        agent.current_task = None;
        agent.last_heartbeat = Utc::now();

        self.paths.ensure_agent_dirs(&agent.id)?;
        self.state.agents.insert(agent.id.clone(), agent.clone());
        self.persist()?;
        self.emit(CoordinatorEvent::AgentRegistered {
            agent: Box::new(agent.clone()),
        });
        Ok(agent)
    }

    fn unregister_agent(&mut self, agent_id: &str) -> Result<()> {
        if !self.state.agents.contains_key(agent_id) {
            return Err(Error::NotFound(format!("agent {}", agent_id)));
        }

        if let Some(task_id) = self
            .state
            .agents
            .get(agent_id)
            .and_then(|a| a.current_task.clone())
        {
            self.unassign_task(&task_id)?;
        }

        let released = self.locks.release_all(agent_id)?;
        if !released.is_empty() {
            self.emit(CoordinatorEvent::LockReleased {
                agent_id: agent_id.to_string(),
                paths: released,
            });
        }

        self.state.agents.remove(agent_id);
        self.persist()?;
        self.emit(CoordinatorEvent::AgentDisconnected {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    fn update_heartbeat(&mut self, agent_id: &str) -> Result<()> {
        let agent = self
            .state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        agent.last_heartbeat = Utc::now();
        self.persist()?;
        Ok(())
    }

    // === Task lifecycle ===

    fn create_task(&mut self, new_task: NewTask) -> Result<Task> {
        if new_task.title.trim().is_empty() {
            return Err(Error::InvalidInput("task title must not be empty".into()));
        }
        for dep in &new_task.depends_on {
            if !self.state.tasks.contains_key(dep) {
                return Err(Error::InvalidInput(format!(
                    "unknown dependency task {}",
                    dep
                )));
            }
        }

        let id = generate_entity_id("task", &new_task.title, |candidate| {
            self.state.tasks.contains_key(candidate)
        });

        let mut task = Task::new(id.clone(), new_task.title);
        task.description = new_task.description;
        task.priority = new_task.priority;
        task.target_files = new_task.target_files;
        task.target_directories = new_task.target_directories;
        task.max_attempts = new_task.max_attempts.unwrap_or(task.max_attempts).max(1);
        task.tags = new_task.tags;
        task.depends_on = new_task.depends_on;
        task.blocked_by = task
            .depends_on
            .iter()
            .filter(|dep| {
                self.state
                    .tasks
                    .get(dep.as_str())
                    .is_none_or(|t| t.status != TaskStatus::Completed)
            })
            .cloned()
            .collect();

        self.state.tasks.insert(id.clone(), task.clone());
        self.state.task_queue.push(id);
        self.persist()?;
        self.emit(CoordinatorEvent::TaskCreated {
            task: Box::new(task.clone()),
        });
        Ok(task)
    }

    /// Assign a specific pending task to a specific idle agent.
    ///
    /// Returns `Ok(false)` when the assignment was refused because the
    /// task's target files are locked by another agent; lock conflicts are
    /// data, not errors.
    fn assign_task(&mut self, task_id: &str, agent_id: &str) -> Result<bool> {
        let task = self
            .state
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if task.status != TaskStatus::Pending {
            return Err(Error::IllegalTransition(format!(
                "task {} is {:?}, not pending",
                task_id, task.status
            )));
        }
        if !task.blocked_by.is_empty() {
            return Err(Error::IllegalTransition(format!(
                "task {} is blocked by {:?}",
                task_id, task.blocked_by
            )));
        }

        let agent = self
            .state
            .agents
            .get(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        if agent.status != AgentStatus::Idle || agent.current_task.is_some() {
            return Err(Error::IllegalTransition(format!(
                "agent {} is not idle",
                agent_id
            )));
        }

        let assigned = self.try_assign(task_id, agent_id)?;
        self.persist()?;
        Ok(assigned)
    }

    /// Install an assignment, take write locks over the target files, and
    /// deliver `TASK_ASSIGN`. Rolls the task back to the front of the queue
    /// when the locks cannot all be taken.
    ///
    /// Caller has validated that the task is pending+unblocked and the
    /// agent idle.
    fn try_assign(&mut self, task_id: &str, agent_id: &str) -> Result<bool> {
        let now = Utc::now();

        // Stamp the assignment on the task first so the lock table can
        // reference it.
        let (target_files, branch) = {
            let task = self.state.tasks.get_mut(task_id).expect("validated");
            task.status = TaskStatus::Assigned;
            task.assigned_agent = Some(agent_id.to_string());
            task.assigned_at = Some(now);
            task.attempts += 1;
            if self.config.git_integration {
                let short_agent = agent_id.strip_prefix("agent-").unwrap_or(agent_id);
                let short_task = task_id.strip_prefix("task-").unwrap_or(task_id);
                task.branch = Some(format!(
                    "{}{}/{}",
                    self.config.branch_prefix, short_agent, short_task
                ));
                task.base_branch.get_or_insert_with(|| "main".to_string());
            }
            (task.target_files.clone(), task.branch.clone())
        };
        self.state.task_queue.retain(|id| id != task_id);

        if !target_files.is_empty() {
            let result = self.locks.acquire(&LockRequest {
                agent_id: agent_id.to_string(),
                task_id: Some(task_id.to_string()),
                paths: target_files,
                lock_type: LockType::Write,
                timeout_ms: None,
            })?;

            if !result.success {
                // Roll back: give back what we grabbed, return the task to
                // the front of the queue for the next pass.
                self.locks.release(agent_id, &result.acquired)?;
                let task = self.state.tasks.get_mut(task_id).expect("validated");
                task.status = TaskStatus::Pending;
                task.assigned_agent = None;
                task.assigned_at = None;
                task.attempts -= 1;
                task.branch = None;
                self.state.task_queue.insert(0, task_id.to_string());
                self.emit(CoordinatorEvent::LockConflictDetected {
                    agent_id: agent_id.to_string(),
                    conflicts: result.conflicts,
                });
                return Ok(false);
            }

            self.emit(CoordinatorEvent::LockAcquired {
                agent_id: agent_id.to_string(),
                paths: result.acquired,
            });
        }

        let task = self.state.tasks.get(task_id).expect("validated").clone();
        let assign = Message::new(
            COORDINATOR_SOURCE,
            MessagePayload::TaskAssign {
                task: Box::new(task),
            },
        )
        .to(agent_id);
        if let Err(e) = self.queue.send_to_agent(agent_id, &assign) {
            // Undelivered assignment: undo everything so the task is not
            // stranded on an agent that never heard about it.
            self.locks.release_task(task_id)?;
            let task = self.state.tasks.get_mut(task_id).expect("validated");
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
            task.assigned_at = None;
            task.attempts -= 1;
            task.branch = None;
            self.state.task_queue.insert(0, task_id.to_string());
            return Err(e);
        }

        let agent = self.state.agents.get_mut(agent_id).expect("validated");
        agent.status = AgentStatus::Working;
        agent.current_task = Some(task_id.to_string());
        agent.working_branch = branch;

        self.emit(CoordinatorEvent::TaskAssigned {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
        });
        Ok(true)
    }

    fn start_task(&mut self, task_id: &str, agent_id: &str) -> Result<()> {
        let task = self
            .state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if task.status != TaskStatus::Assigned {
            return Err(Error::IllegalTransition(format!(
                "task {} is {:?}, not assigned",
                task_id, task.status
            )));
        }
        if task.assigned_agent.as_deref() != Some(agent_id) {
            return Err(Error::IllegalTransition(format!(
                "task {} is not assigned to {}",
                task_id, agent_id
            )));
        }

        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        self.persist()?;
        self.emit(CoordinatorEvent::TaskStarted {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    fn complete_task(
        &mut self,
        task_id: &str,
        reporter: &str,
        result: TaskResult,
    ) -> Result<Task> {
        let task = self
            .state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            return Err(Error::IllegalTransition(format!(
                "task {} is {:?}, not assigned or in progress",
                task_id, task.status
            )));
        }
        if task.assigned_agent.as_deref() != Some(reporter) {
            return Err(Error::IllegalTransition(format!(
                "task {} completion reported by {}, but assigned to {}",
                task_id,
                reporter,
                task.assigned_agent.as_deref().unwrap_or("nobody")
            )));
        }

        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.result = Some(result);
        task.error = None;
        let agent_id = task.assigned_agent.clone().unwrap_or_default();
        let completed = task.clone();

        self.state.completed_history.push(task_id.to_string());

        // Unblock dependents.
        for task in self.state.tasks.values_mut() {
            task.blocked_by.retain(|dep| dep != task_id);
        }

        if let Some(agent) = self.state.agents.get_mut(&agent_id) {
            agent.status = AgentStatus::Idle;
            agent.current_task = None;
            agent.working_branch = None;
            agent.completed_tasks += 1;
        }

        let released = self.locks.release_task(task_id)?;
        if !released.is_empty() {
            self.emit(CoordinatorEvent::LockReleased {
                agent_id: agent_id.clone(),
                paths: released,
            });
        }

        self.persist()?;
        self.emit(CoordinatorEvent::TaskCompleted {
            task_id: task_id.to_string(),
            agent_id,
        });
        Ok(completed)
    }

    fn fail_task(&mut self, task_id: &str, error: &str) -> Result<Task> {
        let task = self
            .state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            return Err(Error::IllegalTransition(format!(
                "task {} is {:?}, not assigned or in progress",
                task_id, task.status
            )));
        }

        let agent_id = task.assigned_agent.clone();
        task.error = Some(error.to_string());
        task.assigned_agent = None;
        task.assigned_at = None;
        task.started_at = None;
        task.branch = None;

        let terminal = task.attempts >= task.max_attempts;
        if terminal {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
        } else {
            task.status = TaskStatus::Pending;
            self.state.task_queue.insert(0, task_id.to_string());
        }
        let failed = task.clone();

        if let Some(agent_id) = &agent_id
            && let Some(agent) = self.state.agents.get_mut(agent_id)
        {
            agent.failed_tasks += 1;
            agent.current_task = None;
            agent.working_branch = None;
            if agent.status == AgentStatus::Working {
                agent.status = AgentStatus::Idle;
            }
        }

        let released = self.locks.release_task(task_id)?;
        if !released.is_empty() {
            self.emit(CoordinatorEvent::LockReleased {
                agent_id: agent_id.clone().unwrap_or_default(),
                paths: released,
            });
        }

        self.persist()?;
        self.emit(CoordinatorEvent::TaskFailed {
            task_id: task_id.to_string(),
            error: error.to_string(),
            terminal,
        });
        Ok(failed)
    }

    /// Return an assigned or in-progress task to the front of the queue
    /// without charging a failure, e.g. when its agent died.
    fn unassign_task(&mut self, task_id: &str) -> Result<()> {
        let task = self
            .state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            return Err(Error::IllegalTransition(format!(
                "task {} is {:?}, not assigned or in progress",
                task_id, task.status
            )));
        }

        let agent_id = task.assigned_agent.clone();
        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        task.assigned_at = None;
        task.started_at = None;
        task.branch = None;
        self.state.task_queue.insert(0, task_id.to_string());

        if let Some(agent_id) = &agent_id
            && let Some(agent) = self.state.agents.get_mut(agent_id)
        {
            agent.current_task = None;
            agent.working_branch = None;
            if agent.status == AgentStatus::Working {
                agent.status = AgentStatus::Idle;
            }
        }

        let released = self.locks.release_task(task_id)?;
        if !released.is_empty() {
            self.emit(CoordinatorEvent::LockReleased {
                agent_id: agent_id.unwrap_or_default(),
                paths: released,
            });
        }

        self.persist()?;
        Ok(())
    }

    fn cancel_task(&mut self, task_id: &str) -> Result<Task> {
        let task = self
            .state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if task.status.is_terminal() {
            return Err(Error::IllegalTransition(format!(
                "task {} is already {:?}",
                task_id, task.status
            )));
        }

        let agent_id = task.assigned_agent.clone();
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        task.assigned_agent = None;
        let cancelled = task.clone();
        self.state.task_queue.retain(|id| id != task_id);

        if let Some(agent_id) = &agent_id
            && let Some(agent) = self.state.agents.get_mut(agent_id)
        {
            agent.current_task = None;
            agent.working_branch = None;
            if agent.status == AgentStatus::Working {
                agent.status = AgentStatus::Idle;
            }
        }

        self.locks.release_task(task_id)?;
        self.persist()?;
        self.emit(CoordinatorEvent::TaskCancelled {
            task_id: task_id.to_string(),
        });
        Ok(cancelled)
    }

    // === Tick phases ===

    fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();

        self.absorb_external_state();
        report.messages_processed = self.drain_outboxes()?;
        self.run_watchdog(&mut report)?;
        if self.config.auto_assign {
            report.tasks_assigned = self.auto_assign()?;
        }
        self.persist()?;
        Ok(report)
    }

    /// Phase 1: read every agent outbox and dispatch in (timestamp, id)
    /// order, dropping duplicates by envelope id.
    fn drain_outboxes(&mut self) -> Result<usize> {
        let mut messages = Vec::new();
        for agent_id in self.queue.list_agent_dirs()? {
            messages.extend(self.queue.read_outbox(&agent_id, true)?);
        }
        messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut processed = 0;
        for message in messages {
            if !self.recent.insert(&message.id) {
                continue; // redelivered duplicate
            }
            if let Err(e) = self.dispatch(&message) {
                eprintln!(
                    "Warning: failed to handle {} {} from {}: {}",
                    message.payload.kind(),
                    message.id,
                    message.source,
                    e
                );
                self.emit(CoordinatorEvent::Error {
                    context: format!("handling {} from {}: {}", message.payload.kind(), message.source, e),
                });
            }
            processed += 1;
        }
        Ok(processed)
    }

    fn dispatch(&mut self, message: &Message) -> Result<()> {
        match &message.payload {
            MessagePayload::AgentRegister { agent } => {
                self.register_agent((**agent).clone())?;
            }
            MessagePayload::AgentHeartbeat {
                status,
                current_task: _,
                progress: _,
                message: _,
            } => {
                let Some(agent) = self.state.agents.get_mut(&message.source) else {
                    eprintln!(
                        "Warning: heartbeat from unregistered agent {}",
                        message.source
                    );
                    return Ok(());
                };
                agent.last_heartbeat = Utc::now();
                // An offline agent that heartbeats again is back.
                if agent.status == AgentStatus::Offline || *status != AgentStatus::Offline {
                    let changed = agent.status != *status;
                    agent.status = *status;
                    if changed {
                        let event = CoordinatorEvent::AgentStatusChanged {
                            agent_id: message.source.clone(),
                            status: *status,
                        };
                        self.emit(event);
                    }
                }
            }
            MessagePayload::AgentDisconnect { agent_id } => {
                let id = if agent_id.is_empty() {
                    &message.source
                } else {
                    agent_id
                };
                if self.state.agents.contains_key(id) {
                    self.unregister_agent(id)?;
                }
            }
            MessagePayload::TaskRequest { agent_id } => {
                let id = if agent_id.is_empty() {
                    message.source.clone()
                } else {
                    agent_id.clone()
                };
                // Explicit pull: serve it even when auto-assign is off.
                self.assign_next_to(&id)?;
            }
            MessagePayload::TaskUpdate {
                task_id,
                status,
                progress,
                message: note,
            } => {
                if *status == Some(TaskStatus::InProgress) {
                    self.start_task(task_id, &message.source)?;
                }
                if progress.is_some() || note.is_some() {
                    self.emit(CoordinatorEvent::TaskProgress {
                        task_id: task_id.clone(),
                        progress: *progress,
                        message: note.clone(),
                    });
                }
            }
            MessagePayload::TaskComplete { task_id, result } => {
                self.complete_task(task_id, &message.source, result.clone())?;
            }
            MessagePayload::TaskFailed { task_id, error } => {
                let assigned = self
                    .state
                    .tasks
                    .get(task_id)
                    .and_then(|t| t.assigned_agent.clone());
                if assigned.as_deref() != Some(message.source.as_str()) {
                    return Err(Error::IllegalTransition(format!(
                        "task {} failure reported by {}, but assigned to {}",
                        task_id,
                        message.source,
                        assigned.as_deref().unwrap_or("nobody")
                    )));
                }
                self.fail_task(task_id, error)?;
            }
            MessagePayload::LockRequest(request) => {
                // The envelope source is authoritative for ownership.
                let mut request = request.clone();
                request.agent_id = message.source.clone();
                let result = self.handle_lock_request(&request)?;
                let response = Message::new(
                    COORDINATOR_SOURCE,
                    MessagePayload::LockResponse(result),
                )
                .to(&message.source)
                .in_reply_to(&message.id);
                self.queue.send_to_agent(&message.source, &response)?;
            }
            MessagePayload::LockRelease { paths } => {
                let released = self.locks.release(&message.source, paths)?;
                if !released.is_empty() {
                    self.emit(CoordinatorEvent::LockReleased {
                        agent_id: message.source.clone(),
                        paths: released,
                    });
                }
            }
            MessagePayload::SyncState { .. } => {
                let snapshot = serde_json::to_value(&self.state)?;
                let reply = Message::new(
                    COORDINATOR_SOURCE,
                    MessagePayload::SyncState { data: snapshot },
                )
                .to(&message.source)
                .in_reply_to(&message.id);
                self.queue.send_to_agent(&message.source, &reply)?;
            }
            MessagePayload::Broadcast { .. } => {
                self.queue.broadcast(message, Some(&message.source))?;
            }
            MessagePayload::TaskAssign { .. } | MessagePayload::LockResponse(_) => {
                eprintln!(
                    "Warning: ignoring coordinator-bound {} in outbox of {}",
                    message.payload.kind(),
                    message.source
                );
            }
        }
        Ok(())
    }

    fn handle_lock_request(&mut self, request: &LockRequest) -> Result<LockResult> {
        let result = self.locks.acquire(request)?;
        if !result.acquired.is_empty() {
            self.emit(CoordinatorEvent::LockAcquired {
                agent_id: request.agent_id.clone(),
                paths: result.acquired.clone(),
            });
        }
        if !result.conflicts.is_empty() {
            self.emit(CoordinatorEvent::LockConflictDetected {
                agent_id: request.agent_id.clone(),
                conflicts: result.conflicts.clone(),
            });
        }
        Ok(result)
    }

    /// Phase 2: offline silent agents, evict the long-gone, fail tasks
    /// that ran past the task timeout.
    fn run_watchdog(&mut self, report: &mut TickReport) -> Result<()> {
        let now = Utc::now();
        let timeout = ChronoDuration::milliseconds(self.config.heartbeat_timeout_ms as i64);
        let evict_after = ChronoDuration::milliseconds(AGENT_EVICT_MS);

        let agent_ids: Vec<String> = self.state.agents.keys().cloned().collect();
        for agent_id in agent_ids {
            let Some(agent) = self.state.agents.get(&agent_id) else {
                continue;
            };
            let silence = now - agent.last_heartbeat;

            if silence > evict_after {
                self.unregister_agent(&agent_id)?;
                report.agents_evicted += 1;
                continue;
            }

            if silence > timeout && agent.status != AgentStatus::Offline {
                let current_task = agent.current_task.clone();
                if let Some(task_id) = current_task {
                    self.unassign_task(&task_id)?;
                }
                let released = self.locks.release_all(&agent_id)?;
                if !released.is_empty() {
                    self.emit(CoordinatorEvent::LockReleased {
                        agent_id: agent_id.clone(),
                        paths: released,
                    });
                }
                if let Some(agent) = self.state.agents.get_mut(&agent_id) {
                    agent.status = AgentStatus::Offline;
                    agent.current_task = None;
                }
                report.agents_offlined += 1;
                self.emit(CoordinatorEvent::AgentStatusChanged {
                    agent_id,
                    status: AgentStatus::Offline,
                });
            }
        }

        // Task timeout sweep: anchored at started_at, falling back to
        // assigned_at for tasks that never reported progress.
        let task_timeout = ChronoDuration::milliseconds(self.config.task_timeout_ms as i64);
        let overdue: Vec<String> = self
            .state
            .tasks
            .values()
            .filter(|task| {
                matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress)
                    && task
                        .started_at
                        .or(task.assigned_at)
                        .is_some_and(|anchor| now - anchor > task_timeout)
            })
            .map(|task| task.id.clone())
            .collect();
        for task_id in overdue {
            self.fail_task(&task_id, "task timed out")?;
            report.tasks_timed_out += 1;
        }

        Ok(())
    }

    /// Phase 3: hand pending tasks to idle agents, oldest registration
    /// first, tasks in priority order with queue position as the tie-break.
    fn auto_assign(&mut self) -> Result<usize> {
        let mut idle: Vec<(DateTime<Utc>, String)> = self
            .state
            .agents
            .values()
            .filter(|agent| agent.status == AgentStatus::Idle && agent.current_task.is_none())
            .map(|agent| (agent.started_at, agent.id.clone()))
            .collect();
        idle.sort();

        let mut assigned = 0;
        for (_, agent_id) in idle {
            if self.assign_next_to(&agent_id)? {
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    /// Walk the queue for `agent_id` and assign the first eligible task.
    fn assign_next_to(&mut self, agent_id: &str) -> Result<bool> {
        let Some(agent) = self.state.agents.get(agent_id) else {
            return Err(Error::NotFound(format!("agent {}", agent_id)));
        };
        if agent.status != AgentStatus::Idle || agent.current_task.is_some() {
            return Ok(false);
        }
        let capabilities = agent.capabilities.clone();

        let mut candidates: Vec<(u8, usize, String)> = Vec::new();
        for (position, task_id) in self.state.task_queue.iter().enumerate() {
            let Some(task) = self.state.tasks.get(task_id) else {
                continue;
            };
            if task.status != TaskStatus::Pending || !task.blocked_by.is_empty() {
                continue;
            }
            candidates.push((task.priority.rank(), position, task_id.clone()));
        }
        candidates.sort();

        for (_, _, task_id) in candidates {
            let task = self.state.tasks.get(&task_id).expect("from queue");

            // Capability gate: a "requires:<cap>" tag restricts the task to
            // agents holding that capability.
            let meets_requirements = task
                .tags
                .iter()
                .filter_map(|tag| tag.strip_prefix("requires:"))
                .all(|cap| capabilities.iter().any(|have| have == cap));
            if !meets_requirements {
                continue;
            }

            // Skip tasks whose target files are held by someone else; a
            // rollback inside try_assign would reorder the queue.
            let contested = task.target_files.iter().any(|path| {
                self.locks
                    .conflicting_lock(agent_id, path, LockType::Write)
                    .is_some()
            });
            if contested {
                continue;
            }

            if self.try_assign(&task_id, agent_id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// The public coordinator handle.
///
/// Cheap to share across threads; all operations serialize on an internal
/// mutex, which is what keeps message handling and the auto-assign pass
/// from interleaving.
pub struct Coordinator {
    core: Arc<Mutex<Core>>,
    paths: CoordinatorPaths,
    stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Initialize the coordinator for a project root: scaffold the
    /// directory layout, resolve config, adopt any existing state file,
    /// and reload non-expired locks.
    pub fn initialize(project_root: &Path) -> Result<Self> {
        let paths = CoordinatorPaths::new(project_root);
        paths.ensure_layout()?;

        let config = CoordinatorConfig::resolve(&paths.config_file())?;
        let store = StateStore::new(paths.state_file(), paths.state_lock(), paths.state_tmp());
        let queue = MessageQueue::new(paths.clone());
        let locks = LockManager::open(
            paths.project_root(),
            paths.locks_file(),
            config.lock_timeout_ms,
        );

        // Adopt a previous run's agents and tasks; this coordinator's
        // start time and config win.
        let mut state = store.read().unwrap_or_else(|| {
            ServerState::new(
                paths.project_root().to_string_lossy().to_string(),
                config.clone(),
            )
        });
        state.started_at = Utc::now();
        state.config = config.clone();

        let core = Core {
            paths: paths.clone(),
            config,
            store,
            queue,
            locks,
            state,
            observers: Vec::new(),
            recent: RecentIds::default(),
        };
        core.persist()?;

        Ok(Self {
            core: Arc::new(Mutex::new(core)),
            paths,
            stop: Arc::new(AtomicBool::new(false)),
            watcher: None,
        })
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Log one operation outcome to `ops.log`, passing the result through.
    fn logged<T>(
        &self,
        op: &str,
        args: serde_json::Value,
        started: Instant,
        result: Result<T>,
    ) -> Result<T> {
        let duration_ms = started.elapsed().as_millis() as u64;
        let (success, error) = match &result {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        op_log::log_op(&self.paths.ops_log(), op, args, success, error, duration_ms);
        result
    }

    /// The resolved layout this coordinator serves.
    pub fn paths(&self) -> &CoordinatorPaths {
        &self.paths
    }

    /// The effective configuration.
    pub fn config(&self) -> CoordinatorConfig {
        self.lock_core().config.clone()
    }

    /// Register an observer for broker events.
    pub fn on_event<F>(&self, observer: F)
    where
        F: Fn(&CoordinatorEvent) + Send + 'static,
    {
        self.lock_core().observers.push(Box::new(observer));
    }

    /// Register (or re-register) an agent.
    pub fn register_agent(&self, agent: AgentInfo) -> Result<AgentInfo> {
        let started = Instant::now();
        let args = serde_json::json!({ "agent_id": agent.id, "name": agent.name });
        let result = self.lock_core().register_agent(agent);
        self.logged("register_agent", args, started, result)
    }

    /// Remove an agent, unassigning its task and releasing its locks.
    pub fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        let started = Instant::now();
        let args = serde_json::json!({ "agent_id": agent_id });
        let result = self.lock_core().unregister_agent(agent_id);
        self.logged("unregister_agent", args, started, result)
    }

    /// Refresh an agent's liveness stamp.
    pub fn update_heartbeat(&self, agent_id: &str) -> Result<()> {
        self.lock_core().update_heartbeat(agent_id)
    }

    /// Create a pending task and append it to the queue.
    pub fn create_task(&self, new_task: NewTask) -> Result<Task> {
        let started = Instant::now();
        let args = serde_json::json!({ "title": new_task.title });
        let result = self.lock_core().create_task(new_task);
        self.logged("create_task", args, started, result)
    }

    /// Assign a specific pending task to a specific idle agent. `Ok(false)`
    /// means the target files are locked by another agent.
    pub fn assign_task(&self, task_id: &str, agent_id: &str) -> Result<bool> {
        let started = Instant::now();
        let args = serde_json::json!({ "task_id": task_id, "agent_id": agent_id });
        let result = self.lock_core().assign_task(task_id, agent_id);
        self.logged("assign_task", args, started, result)
    }

    /// Move an assigned task to in-progress on behalf of its agent.
    pub fn start_task(&self, task_id: &str, agent_id: &str) -> Result<()> {
        self.lock_core().start_task(task_id, agent_id)
    }

    /// Complete a task. `reporter` must be the assigned agent.
    pub fn complete_task(&self, task_id: &str, reporter: &str, result: TaskResult) -> Result<Task> {
        let started = Instant::now();
        let args = serde_json::json!({ "task_id": task_id, "reporter": reporter });
        let outcome = self.lock_core().complete_task(task_id, reporter, result);
        self.logged("complete_task", args, started, outcome)
    }

    /// Record a failed attempt; requeues or goes terminal depending on the
    /// retry budget.
    pub fn fail_task(&self, task_id: &str, error: &str) -> Result<Task> {
        let started = Instant::now();
        let args = serde_json::json!({ "task_id": task_id, "error": error });
        let result = self.lock_core().fail_task(task_id, error);
        self.logged("fail_task", args, started, result)
    }

    /// Return a task to the front of the queue without charging a failure.
    pub fn unassign_task(&self, task_id: &str) -> Result<()> {
        let started = Instant::now();
        let args = serde_json::json!({ "task_id": task_id });
        let result = self.lock_core().unassign_task(task_id);
        self.logged("unassign_task", args, started, result)
    }

    /// Cancel a task that has not reached a terminal status.
    pub fn cancel_task(&self, task_id: &str) -> Result<Task> {
        let started = Instant::now();
        let args = serde_json::json!({ "task_id": task_id });
        let result = self.lock_core().cancel_task(task_id);
        self.logged("cancel_task", args, started, result)
    }

    /// Pending tasks in queue order.
    pub fn get_pending_tasks(&self) -> Vec<Task> {
        let core = self.lock_core();
        core.state
            .task_queue
            .iter()
            .filter_map(|id| core.state.tasks.get(id))
            .cloned()
            .collect()
    }

    /// All tasks, sorted by id.
    pub fn get_tasks(&self) -> Vec<Task> {
        self.lock_core().state.tasks.values().cloned().collect()
    }

    /// One task by id.
    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.lock_core()
            .state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
    }

    /// All registered agents, sorted by id.
    pub fn get_agents(&self) -> Vec<AgentInfo> {
        self.lock_core().state.agents.values().cloned().collect()
    }

    /// All live locks.
    pub fn get_locks(&self) -> Vec<FileLock> {
        self.lock_core().locks.all()
    }

    /// Force-release one lock. Administrative.
    pub fn force_release_lock(&self, path: &str) -> Result<bool> {
        let started = Instant::now();
        let args = serde_json::json!({ "path": path });
        let result = self.lock_core().locks.force_release(path);
        self.logged("force_release_lock", args, started, result)
    }

    /// A copy of the current state snapshot.
    pub fn get_state(&self) -> ServerState {
        self.lock_core().state.clone()
    }

    /// Delete queue and board messages older than `max_age_ms`.
    pub fn clean_old_messages(&self, max_age_ms: u64) -> Result<usize> {
        let started = Instant::now();
        let args = serde_json::json!({ "max_age_ms": max_age_ms });
        let result = self.lock_core().queue.clean_old_messages(max_age_ms);
        self.logged("clean_old_messages", args, started, result)
    }

    /// Run one broker pass: drain outboxes, watchdog, auto-assign.
    pub fn tick(&self) -> Result<TickReport> {
        self.lock_core().tick()
    }

    /// Start the periodic tick on a background thread.
    pub fn start_watching(&mut self) {
        if self.watcher.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);

        let core = Arc::clone(&self.core);
        let stop = Arc::clone(&self.stop);
        let interval_ms = self.lock_core().config.heartbeat_interval_ms;

        self.watcher = Some(std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                {
                    let mut core = core
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Err(e) = core.tick() {
                        eprintln!("Warning: coordinator tick failed: {}", e);
                    }
                }
                // Sleep in short steps so stop_watching stays responsive.
                let deadline = Instant::now() + Duration::from_millis(interval_ms);
                while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(25).min(deadline - Instant::now()));
                }
            }
        }));
    }

    /// Stop the background tick and wait for it to wind down.
    pub fn stop_watching(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watcher.take()
            && handle.join().is_err()
        {
            eprintln!("Warning: coordinator watcher thread panicked");
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskPriority;
    use crate::test_utils::TestProject;

    fn agent(id: &str, name: &str) -> AgentInfo {
        AgentInfo::new(id.to_string(), name.to_string(), "/work".to_string())
    }

    #[test]
    fn test_initialize_scaffolds_and_persists() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();

        assert!(project.paths().state_file().exists());
        assert!(project.paths().gitignore().exists());
        let state = coordinator.get_state();
        assert!(state.agents.is_empty());
        assert!(state.task_queue.is_empty());
    }

    #[test]
    fn test_register_agent_respects_limit() {
        let project = TestProject::new();
        std::fs::create_dir_all(project.path().join(".agent-coordinator")).unwrap();
        std::fs::write(
            project.paths().config_file(),
            r#"{"max_agents": 1}"#,
        )
        .unwrap();

        let coordinator = Coordinator::initialize(project.path()).unwrap();
        coordinator.register_agent(agent("agent-1", "first")).unwrap();
        let err = coordinator
            .register_agent(agent("agent-2", "second"))
            .unwrap_err();
        assert!(matches!(err, Error::AgentLimitReached(1)));
    }

    #[test]
    fn test_reregistration_keeps_counters() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();

        coordinator.register_agent(agent("agent-1", "hand")).unwrap();
        let task = coordinator.create_task(NewTask::titled("job")).unwrap();
        coordinator.tick().unwrap();
        coordinator
            .complete_task(&task.id, "agent-1", TaskResult::default())
            .unwrap();

        let again = coordinator.register_agent(agent("agent-1", "hand")).unwrap();
        assert_eq!(again.completed_tasks, 1);
    }

    #[test]
    fn test_create_task_rejects_unknown_dependency() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();

        let mut draft = NewTask::titled("child");
        draft.depends_on = vec!["task-none".to_string()];
        assert!(matches!(
            coordinator.create_task(draft),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_queue_membership_tracks_pending_status() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();
        coordinator.register_agent(agent("agent-1", "hand")).unwrap();

        let task = coordinator.create_task(NewTask::titled("job")).unwrap();
        assert_eq!(coordinator.get_pending_tasks().len(), 1);

        coordinator.tick().unwrap();
        assert!(coordinator.get_pending_tasks().is_empty());
        assert_eq!(
            coordinator.get_task(&task.id).unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[test]
    fn test_manual_assign_validations() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();
        coordinator.register_agent(agent("agent-1", "hand")).unwrap();

        assert!(matches!(
            coordinator.assign_task("task-none", "agent-1"),
            Err(Error::NotFound(_))
        ));

        let task = coordinator.create_task(NewTask::titled("job")).unwrap();
        assert!(matches!(
            coordinator.assign_task(&task.id, "agent-none"),
            Err(Error::NotFound(_))
        ));

        assert!(coordinator.assign_task(&task.id, "agent-1").unwrap());
        // Already assigned: both task and agent now refuse.
        assert!(matches!(
            coordinator.assign_task(&task.id, "agent-1"),
            Err(Error::IllegalTransition(_))
        ));
    }

    #[test]
    fn test_complete_requires_assigned_reporter() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();
        coordinator.register_agent(agent("agent-1", "hand")).unwrap();
        coordinator.register_agent(agent("agent-2", "mate")).unwrap();

        let task = coordinator.create_task(NewTask::titled("job")).unwrap();
        coordinator.assign_task(&task.id, "agent-1").unwrap();

        assert!(matches!(
            coordinator.complete_task(&task.id, "agent-2", TaskResult::default()),
            Err(Error::IllegalTransition(_))
        ));
        coordinator
            .complete_task(&task.id, "agent-1", TaskResult::default())
            .unwrap();

        // Terminal tasks are immutable.
        assert!(matches!(
            coordinator.complete_task(&task.id, "agent-1", TaskResult::default()),
            Err(Error::IllegalTransition(_))
        ));
    }

    #[test]
    fn test_cancel_pending_removes_from_queue() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();

        let task = coordinator.create_task(NewTask::titled("job")).unwrap();
        let cancelled = coordinator.cancel_task(&task.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(coordinator.get_pending_tasks().is_empty());
        assert!(matches!(
            coordinator.cancel_task(&task.id),
            Err(Error::IllegalTransition(_))
        ));
    }

    #[test]
    fn test_capability_gate() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();

        let mut plain = agent("agent-1", "plain");
        plain.capabilities = vec!["docs".to_string()];
        coordinator.register_agent(plain).unwrap();

        let mut draft = NewTask::titled("rust work");
        draft.tags = vec!["requires:rust".to_string()];
        let gated = coordinator.create_task(draft).unwrap();

        coordinator.tick().unwrap();
        assert_eq!(
            coordinator.get_task(&gated.id).unwrap().status,
            TaskStatus::Pending,
            "agent without the capability must not receive the task"
        );

        let mut rustacean = agent("agent-2", "rustacean");
        rustacean.capabilities = vec!["rust".to_string()];
        coordinator.register_agent(rustacean).unwrap();

        coordinator.tick().unwrap();
        let task = coordinator.get_task(&gated.id).unwrap();
        assert_eq!(task.assigned_agent.as_deref(), Some("agent-2"));
    }

    #[test]
    fn test_branch_derivation_on_assignment() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();
        coordinator.register_agent(agent("agent-1", "hand")).unwrap();

        let task = coordinator
            .create_task(NewTask::titled("branchable"))
            .unwrap();
        coordinator.tick().unwrap();

        let assigned = coordinator.get_task(&task.id).unwrap();
        let branch = assigned.branch.unwrap();
        assert!(branch.starts_with("agent/1/"), "got branch {}", branch);
        assert_eq!(assigned.base_branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_priority_beats_queue_position() {
        let project = TestProject::new();
        let coordinator = Coordinator::initialize(project.path()).unwrap();
        coordinator.register_agent(agent("agent-1", "hand")).unwrap();

        let mut low = NewTask::titled("low");
        low.priority = TaskPriority::Low;
        coordinator.create_task(low).unwrap();
        let mut critical = NewTask::titled("critical");
        critical.priority = TaskPriority::Critical;
        let critical = coordinator.create_task(critical).unwrap();

        coordinator.tick().unwrap();
        assert_eq!(
            coordinator.get_task(&critical.id).unwrap().status,
            TaskStatus::Assigned
        );
    }
}
