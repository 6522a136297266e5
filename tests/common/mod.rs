//! Common test utilities for bosun integration tests.
//!
//! Provides `TestEnv` for isolated project directories so tests never
//! touch a real working tree or inherit agent environment variables.

#![allow(dead_code)]

use assert_cmd::Command;
pub use tempfile::TempDir;

/// A test environment with an isolated project directory.
///
/// The `bosun()` method returns a `Command` that runs inside the project
/// and clears every `AGENT_*` override so parallel tests cannot leak
/// configuration into each other.
pub struct TestEnv {
    pub project_dir: TempDir,
}

impl TestEnv {
    /// Create a new empty project directory.
    pub fn new() -> Self {
        Self {
            project_dir: TempDir::new().unwrap(),
        }
    }

    /// Create a project directory and run `bosun init` in it.
    pub fn init() -> Self {
        let env = Self::new();
        env.bosun().arg("init").assert().success();
        env
    }

    /// Get a Command for the bosun binary rooted at this project.
    pub fn bosun(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_bosun"));
        cmd.current_dir(self.project_dir.path());
        // Pin the project explicitly; marker discovery walking out of the
        // temp dir would be a test-environment accident.
        cmd.env("AGENT_PROJECT_PATH", self.project_dir.path());
        cmd.env_remove("AGENT_MAX_AGENTS");
        cmd.env_remove("AGENT_HEARTBEAT_INTERVAL");
        cmd.env_remove("AGENT_HEARTBEAT_TIMEOUT");
        cmd.env_remove("AGENT_AUTO_ASSIGN");
        cmd.env_remove("AGENT_GIT_INTEGRATION");
        cmd.env_remove("AGENT_BRANCH_PREFIX");
        cmd
    }

    /// Get the path to the project directory.
    pub fn path(&self) -> &std::path::Path {
        self.project_dir.path()
    }

    /// Get the path to the coordinator directory.
    pub fn coordinator_dir(&self) -> std::path::PathBuf {
        self.project_dir.path().join(".agent-coordinator")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
