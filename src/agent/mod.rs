//! The worker-process side of the coordinator protocol.
//!
//! An [`AgentHandle`] owns its agent id and talks to the coordinator only
//! through the filesystem: it posts messages into its own outbox, drains
//! its inbox, and touches nothing in the state file except its own
//! `AgentInfo` (through the advisory-locked RMW path).
//!
//! The runtime is cooperative and single-threaded: [`AgentHandle::run`]
//! drives the two tickers (heartbeat every `heartbeat_interval_ms`, inbox
//! poll every second) until a stop flag flips. Tests and embedders that
//! want deterministic control call [`AgentHandle::send_heartbeat`] and
//! [`AgentHandle::poll_inbox`] directly.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::{CoordinatorConfig, CoordinatorPaths};
use crate::locks::{LockRequest, LockResult};
use crate::messages::{Message, MessagePayload, RecentIds, generate_entity_id};
use crate::models::{AgentInfo, AgentStatus, LockType, ServerState, Task, TaskResult};
use crate::queue::MessageQueue;
use crate::state::StateStore;
use crate::{Error, Result};

/// Inbox poll period while running.
const INBOX_POLL: Duration = Duration::from_millis(1_000);

/// How long `request_locks` waits for the coordinator's answer.
const LOCK_RESPONSE_WAIT: Duration = Duration::from_secs(5);

/// Poll step inside `request_locks` and `run`.
const POLL_STEP: Duration = Duration::from_millis(50);

/// Executes one assigned task; the error string becomes the task failure.
pub type TaskCallback = Box<dyn FnMut(&Task) -> std::result::Result<TaskResult, String> + Send>;

/// Observes every inbound message before the built-in handling.
pub type MessageCallback = Box<dyn FnMut(&Message) + Send>;

/// One worker's connection to a coordinator directory.
pub struct AgentHandle {
    id: String,
    name: String,
    config: CoordinatorConfig,
    queue: MessageQueue,
    store: StateStore,
    working_directory: String,
    capabilities: Vec<String>,
    /// Accept `TASK_ASSIGN` automatically when a task callback is set
    auto_accept: bool,
    current_task: Option<Task>,
    recent: RecentIds,
    task_callback: Option<TaskCallback>,
    message_callback: Option<MessageCallback>,
    last_heartbeat: Option<Instant>,
    last_poll: Option<Instant>,
}

impl AgentHandle {
    /// Create a handle for the coordinator under `project_root`.
    ///
    /// The agent id is derived from the name; pass the id back via
    /// [`AgentHandle::with_id`] to resume an identity after a restart.
    pub fn new(project_root: &Path, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let paths = CoordinatorPaths::new(project_root);
        if !paths.exists() {
            return Err(Error::NotInitialized);
        }
        let config = CoordinatorConfig::resolve(&paths.config_file())?;
        let store = StateStore::new(paths.state_file(), paths.state_lock(), paths.state_tmp());

        let taken: Vec<String> = store
            .read()
            .map(|state| state.agents.keys().cloned().collect())
            .unwrap_or_default();
        let id = generate_entity_id("agent", &name, |candidate| {
            taken.iter().any(|existing| existing == candidate)
        });

        Ok(Self {
            id,
            name,
            config,
            queue: MessageQueue::new(paths),
            store,
            working_directory: project_root.to_string_lossy().to_string(),
            capabilities: Vec::new(),
            auto_accept: true,
            current_task: None,
            recent: RecentIds::default(),
            task_callback: None,
            message_callback: None,
            last_heartbeat: None,
            last_poll: None,
        })
    }

    /// Resume a previously registered identity.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Disable automatic acceptance of `TASK_ASSIGN`; the embedder then
    /// calls [`AgentHandle::accept_task`] itself.
    pub fn manual_accept(mut self) -> Self {
        self.auto_accept = false;
        self
    }

    /// This agent's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The task currently held, if any.
    pub fn current_task(&self) -> Option<&Task> {
        self.current_task.as_ref()
    }

    /// Observe every inbound message before built-in handling.
    pub fn on_message<F>(&mut self, callback: F)
    where
        F: FnMut(&Message) + Send + 'static,
    {
        self.message_callback = Some(Box::new(callback));
    }

    /// Read the shared state snapshot, if one exists and parses.
    pub fn get_state(&self) -> Option<ServerState> {
        self.store.read()
    }

    /// Register with the coordinator: ensure the mailbox directories,
    /// write our `AgentInfo` into the shared state, post `AGENT_REGISTER`.
    pub fn register(&mut self, capabilities: Vec<String>) -> Result<AgentInfo> {
        self.capabilities = capabilities;

        let mut info = AgentInfo::new(
            self.id.clone(),
            self.name.clone(),
            self.working_directory.clone(),
        );
        info.capabilities = self.capabilities.clone();

        self.queue_paths().ensure_agent_dirs(&self.id)?;

        // Only our own subtree; the coordinator owns everything else.
        let written = info.clone();
        self.store.update(move |state| {
            state.agents.insert(written.id.clone(), written);
        })?;

        self.post(MessagePayload::AgentRegister {
            agent: Box::new(info.clone()),
        })?;
        Ok(info)
    }

    /// Install the task callback and send the first heartbeat. Drive the
    /// tickers with [`AgentHandle::run`] or by calling
    /// [`AgentHandle::send_heartbeat`] / [`AgentHandle::poll_inbox`].
    pub fn start(&mut self, callback: Option<TaskCallback>) -> Result<()> {
        self.task_callback = callback;
        self.send_heartbeat()
    }

    /// Run both tickers until `stop` flips, then post `AGENT_DISCONNECT`.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::SeqCst) {
            let heartbeat_due = self
                .last_heartbeat
                .is_none_or(|at| at.elapsed() >= Duration::from_millis(self.config.heartbeat_interval_ms));
            if heartbeat_due {
                self.send_heartbeat()?;
            }

            let poll_due = self.last_poll.is_none_or(|at| at.elapsed() >= INBOX_POLL);
            if poll_due {
                self.poll_inbox()?;
            }

            std::thread::sleep(POLL_STEP);
        }
        self.stop()
    }

    /// Post `AGENT_DISCONNECT` and drop the stored callback.
    pub fn stop(&mut self) -> Result<()> {
        self.task_callback = None;
        self.post(MessagePayload::AgentDisconnect {
            agent_id: self.id.clone(),
        })
    }

    /// Post a heartbeat to the outbox and refresh our own liveness stamp
    /// in the shared state.
    pub fn send_heartbeat(&mut self) -> Result<()> {
        let status = if self.current_task.is_some() {
            AgentStatus::Working
        } else {
            AgentStatus::Idle
        };
        self.post(MessagePayload::AgentHeartbeat {
            status,
            current_task: self.current_task.as_ref().map(|t| t.id.clone()),
            progress: None,
            message: None,
        })?;

        let id = self.id.clone();
        match self.store.update(move |state| {
            if let Some(me) = state.agents.get_mut(&id) {
                me.last_heartbeat = Utc::now();
            }
        }) {
            Ok(_) => {}
            Err(Error::ContendedState(_)) | Err(Error::NotInitialized) => {
                // The outbox message is the durable signal; the stamp is
                // best-effort.
            }
            Err(e) => return Err(e),
        }

        self.last_heartbeat = Some(Instant::now());
        Ok(())
    }

    /// Ask the coordinator for work outside the auto-assign cycle.
    pub fn request_task(&mut self) -> Result<()> {
        self.post(MessagePayload::TaskRequest {
            agent_id: self.id.clone(),
        })
    }

    /// Drain the inbox and handle each message.
    pub fn poll_inbox(&mut self) -> Result<()> {
        let messages = self.queue.read_inbox(&self.id, true)?;
        for message in messages {
            self.handle(&message)?;
        }
        self.last_poll = Some(Instant::now());
        Ok(())
    }

    fn handle(&mut self, message: &Message) -> Result<()> {
        if !self.recent.insert(&message.id) {
            return Ok(()); // redelivered duplicate
        }

        if let Some(mut callback) = self.message_callback.take() {
            callback(message);
            self.message_callback = Some(callback);
        }

        match &message.payload {
            MessagePayload::TaskAssign { task } => {
                if self.current_task.is_some() {
                    // Should not happen; the coordinator will notice the
                    // mismatch via heartbeats. Decline by failing fast.
                    eprintln!(
                        "Warning: received {} while already holding a task",
                        task.id
                    );
                    return Ok(());
                }
                if self.auto_accept && self.task_callback.is_some() {
                    self.accept_task((**task).clone())?;
                    self.execute_current_task()?;
                }
            }
            _ => {
                // Everything else is informational for the embedder's
                // message callback.
            }
        }
        Ok(())
    }

    /// Accept an offered task: hold it and report `in_progress`.
    pub fn accept_task(&mut self, task: Task) -> Result<()> {
        self.post(MessagePayload::TaskUpdate {
            task_id: task.id.clone(),
            status: Some(crate::models::TaskStatus::InProgress),
            progress: None,
            message: None,
        })?;
        self.current_task = Some(task);
        Ok(())
    }

    /// Run the stored callback over the held task and report the outcome.
    fn execute_current_task(&mut self) -> Result<()> {
        let Some(task) = self.current_task.clone() else {
            return Ok(());
        };
        let Some(mut callback) = self.task_callback.take() else {
            return Ok(());
        };

        let outcome = callback(&task);
        self.task_callback = Some(callback);

        match outcome {
            Ok(result) => self.complete_task(result),
            Err(error) => self.fail_task(&error),
        }
    }

    /// Report the held task as completed and go idle.
    pub fn complete_task(&mut self, result: TaskResult) -> Result<()> {
        let task = self
            .current_task
            .take()
            .ok_or_else(|| Error::IllegalTransition("no task held".to_string()))?;
        self.post(MessagePayload::TaskComplete {
            task_id: task.id,
            result,
        })?;
        self.send_heartbeat()
    }

    /// Report the held task as failed and go idle.
    pub fn fail_task(&mut self, error: &str) -> Result<()> {
        let task = self
            .current_task
            .take()
            .ok_or_else(|| Error::IllegalTransition("no task held".to_string()))?;
        self.post(MessagePayload::TaskFailed {
            task_id: task.id,
            error: error.to_string(),
        })?;
        self.send_heartbeat()
    }

    /// Report progress on the held task.
    pub fn report_progress(&mut self, progress: u8, message: Option<String>) -> Result<()> {
        let task = self
            .current_task
            .as_ref()
            .ok_or_else(|| Error::IllegalTransition("no task held".to_string()))?;
        self.post(MessagePayload::TaskUpdate {
            task_id: task.id.clone(),
            status: None,
            progress: Some(progress),
            message,
        })
    }

    /// Ask the coordinator for locks and wait up to five seconds for the
    /// correlated `LOCK_RESPONSE`. Unrelated messages arriving during the
    /// wait are dispatched normally, not dropped.
    pub fn request_locks(&mut self, paths: Vec<String>, lock_type: LockType) -> Result<LockResult> {
        let request = Message::new(
            self.id.clone(),
            MessagePayload::LockRequest(LockRequest {
                agent_id: self.id.clone(),
                task_id: self.current_task.as_ref().map(|t| t.id.clone()),
                paths,
                lock_type,
                timeout_ms: None,
            }),
        );
        let request_id = request.id.clone();
        self.queue.post_from_agent(&self.id, &request)?;

        let deadline = Instant::now() + LOCK_RESPONSE_WAIT;
        while Instant::now() < deadline {
            for message in self.queue.read_inbox(&self.id, true)? {
                if let MessagePayload::LockResponse(result) = &message.payload
                    && message.correlation_id.as_deref() == Some(request_id.as_str())
                {
                    self.recent.insert(&message.id);
                    return Ok(result.clone());
                }
                self.handle(&message)?;
            }
            std::thread::sleep(POLL_STEP);
        }

        Err(Error::Other(format!(
            "no lock response within {:?}",
            LOCK_RESPONSE_WAIT
        )))
    }

    /// Give locks back.
    pub fn release_locks(&mut self, paths: Vec<String>) -> Result<()> {
        self.post(MessagePayload::LockRelease { paths })
    }

    /// Post one message into our outbox.
    fn post(&self, payload: MessagePayload) -> Result<()> {
        let message = Message::new(self.id.clone(), payload);
        self.queue.post_from_agent(&self.id, &message)
    }

    fn queue_paths(&self) -> &CoordinatorPaths {
        self.queue.paths()
    }
}
