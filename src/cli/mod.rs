//! CLI argument definitions for bosun.

use clap::{Parser, Subcommand};

/// Version string with build metadata from build.rs.
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BOSUN_GIT_COMMIT"),
    " ",
    env!("BOSUN_BUILD_TIMESTAMP"),
    ")"
);

/// Bosun - coordinate a fleet of AI coding agents over one working tree.
///
/// Run `bosun init` in a project, `bosun watch` to start brokering, and
/// `bosun task create` to queue work.
#[derive(Parser, Debug)]
#[command(name = "bosun")]
#[command(author, version, long_version = LONG_VERSION)]
#[command(about = "File-based task broker for fleets of AI coding agents", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Run against <path> instead of discovering the project root from the
    /// current directory. Can also be set via AGENT_PROJECT_PATH.
    #[arg(short = 'C', long = "project", global = true, env = "AGENT_PROJECT_PATH")]
    pub project_path: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the .agent-coordinator layout for this project
    Init,

    /// Show agents, tasks, queue depth, and active locks
    Status,

    /// Run the coordinator loop in the foreground
    Watch {
        /// Stop after this many ticks (runs until interrupted by default)
        #[arg(long)]
        ticks: Option<u64>,
    },

    /// Task management commands
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Agent registry commands
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// File lock commands
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },

    /// Delete queue and board messages older than a cutoff
    Clean {
        /// Age cutoff in milliseconds
        #[arg(long, default_value_t = 86_400_000)]
        max_age_ms: u64,
    },
}

/// Task subcommands
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Queue a new task
    Create {
        /// Task title
        title: String,

        /// Detailed description
        #[arg(short, long)]
        description: Option<String>,

        /// Priority: critical, high, normal, low
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// File the task will modify (repeatable)
        #[arg(short = 'f', long = "file")]
        files: Vec<String>,

        /// Task id this task depends on (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Tag for categorization or capability gating (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Retry budget
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// List tasks, optionally filtered by status
    List {
        /// Filter: pending, assigned, in_progress, completed, failed, cancelled
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one task
    Show {
        /// Task id (e.g., task-9c41)
        id: String,
    },

    /// Cancel a task that has not finished
    Cancel {
        /// Task id
        id: String,
    },
}

/// Agent subcommands
#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// List registered agents
    List,
}

/// Lock subcommands
#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// List active file locks
    List,

    /// Force-release the lock on a path (administrative)
    Release {
        /// Locked path, relative to the project root
        path: String,
    },
}
