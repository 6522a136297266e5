//! Coordinator directory layout and project-root discovery.
//!
//! Everything bosun persists lives under `<project>/.agent-coordinator/`:
//!
//! ```text
//! <project>/.agent-coordinator/
//! ├── state.json              # canonical snapshot (ServerState)
//! ├── state.json.lock         # advisory write lock (PID as text)
//! ├── config.json             # optional user overrides
//! ├── .gitignore              # auto-written
//! ├── ops.log                 # append-only operation log (JSONL)
//! ├── tasks/                  # reserved
//! ├── locks/active.json       # mirror of current file locks
//! ├── agents/<id>/inbox/      # coordinator → agent messages
//! ├── agents/<id>/outbox/     # agent → coordinator messages
//! └── messages/               # global board
//! ```

pub mod schema;

pub use schema::CoordinatorConfig;

use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

/// Name of the coordinator directory under the project root.
pub const COORDINATOR_DIR: &str = ".agent-coordinator";

/// Markers that identify a project root, checked in order.
const ROOT_MARKERS: &[&str] = &[COORDINATOR_DIR, ".git", "Cargo.toml", "package.json"];

/// Environment variable overriding the project path.
pub const PROJECT_PATH_ENV: &str = "AGENT_PROJECT_PATH";

/// Resolved filesystem layout for one coordinator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorPaths {
    project_root: PathBuf,
    coordinator_dir: PathBuf,
}

impl CoordinatorPaths {
    /// Build the layout for the given project root.
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            coordinator_dir: project_root.join(COORDINATOR_DIR),
        }
    }

    /// Walk upward from `start` and build the layout at the first ancestor
    /// containing a root marker. Falls back to `start` itself when no marker
    /// is found.
    pub fn discover(start: &Path) -> Self {
        Self::new(&find_project_root(start))
    }

    /// The project root directory.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// The `.agent-coordinator` directory.
    pub fn coordinator_dir(&self) -> &Path {
        &self.coordinator_dir
    }

    /// Path of the canonical state file.
    pub fn state_file(&self) -> PathBuf {
        self.coordinator_dir.join("state.json")
    }

    /// Path of the advisory state lock file.
    pub fn state_lock(&self) -> PathBuf {
        self.coordinator_dir.join("state.json.lock")
    }

    /// Path of the transient sibling used for atomic state writes.
    pub fn state_tmp(&self) -> PathBuf {
        self.coordinator_dir.join("state.json.tmp")
    }

    /// Path of the optional config override file.
    pub fn config_file(&self) -> PathBuf {
        self.coordinator_dir.join("config.json")
    }

    /// Reserved tasks subtree; scaffolded but not populated by the core.
    pub fn tasks_dir(&self) -> PathBuf {
        self.coordinator_dir.join("tasks")
    }

    /// Directory holding the lock mirror.
    pub fn locks_dir(&self) -> PathBuf {
        self.coordinator_dir.join("locks")
    }

    /// Path of the persisted lock mirror.
    pub fn locks_file(&self) -> PathBuf {
        self.locks_dir().join("active.json")
    }

    /// Directory holding per-agent subtrees.
    pub fn agents_dir(&self) -> PathBuf {
        self.coordinator_dir.join("agents")
    }

    /// Subtree for one agent.
    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id)
    }

    /// Inbox directory for one agent (coordinator writes, agent reads).
    pub fn inbox_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("inbox")
    }

    /// Outbox directory for one agent (agent writes, coordinator reads).
    pub fn outbox_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("outbox")
    }

    /// The global message board directory.
    pub fn messages_dir(&self) -> PathBuf {
        self.coordinator_dir.join("messages")
    }

    /// Path of the append-only operation log.
    pub fn ops_log(&self) -> PathBuf {
        self.coordinator_dir.join("ops.log")
    }

    /// Path of the auto-written `.gitignore`.
    pub fn gitignore(&self) -> PathBuf {
        self.coordinator_dir.join(".gitignore")
    }

    /// Whether a coordinator layout exists for this project.
    pub fn exists(&self) -> bool {
        self.coordinator_dir.is_dir()
    }

    /// Create the directory scaffolding and the `.gitignore`.
    ///
    /// Idempotent; existing files and directories are left alone except the
    /// `.gitignore`, which is rewritten so new exclusions propagate.
    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.coordinator_dir)?;
        fs::create_dir_all(self.tasks_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.agents_dir())?;
        fs::create_dir_all(self.messages_dir())?;

        // Runtime state must not end up in version control.
        let gitignore = "\
state.json\n\
state.json.lock\n\
state.json.tmp\n\
ops.log\n\
agents/\n\
messages/\n\
locks/\n\
tasks/\n";
        fs::write(self.gitignore(), gitignore)?;

        Ok(())
    }

    /// Ensure the inbox/outbox pair for one agent exists.
    pub fn ensure_agent_dirs(&self, agent_id: &str) -> Result<()> {
        fs::create_dir_all(self.inbox_dir(agent_id))?;
        fs::create_dir_all(self.outbox_dir(agent_id))?;
        Ok(())
    }
}

/// Find the project root by walking up from `start`.
///
/// Returns the first ancestor (including `start`) containing any root
/// marker, or `start` itself when nothing matches.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut dir = Some(start);
    while let Some(current) = dir {
        for marker in ROOT_MARKERS {
            if current.join(marker).exists() {
                return current.to_path_buf();
            }
        }
        dir = current.parent();
    }
    start.to_path_buf()
}
