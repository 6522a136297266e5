//! Coordinator configuration: defaults, file overrides, environment overrides.
//!
//! Precedence (lowest to highest):
//!
//! 1. Built-in defaults
//! 2. `<coordinator>/config.json`
//! 3. `AGENT_*` environment variables
//!
//! The file layer is partial: only keys present in `config.json` override
//! the defaults. Unknown keys are kept in `extra` and survive a rewrite.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::Result;

/// Environment variable names for overrides.
pub const MAX_AGENTS_ENV: &str = "AGENT_MAX_AGENTS";
pub const HEARTBEAT_INTERVAL_ENV: &str = "AGENT_HEARTBEAT_INTERVAL";
pub const HEARTBEAT_TIMEOUT_ENV: &str = "AGENT_HEARTBEAT_TIMEOUT";
pub const AUTO_ASSIGN_ENV: &str = "AGENT_AUTO_ASSIGN";
pub const GIT_INTEGRATION_ENV: &str = "AGENT_GIT_INTEGRATION";
pub const BRANCH_PREFIX_ENV: &str = "AGENT_BRANCH_PREFIX";

fn default_max_agents() -> usize {
    10
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}
fn default_lock_timeout_ms() -> u64 {
    300_000
}
fn default_task_timeout_ms() -> u64 {
    3_600_000
}
fn default_true() -> bool {
    true
}
fn default_branch_prefix() -> String {
    "agent/".to_string()
}

/// Runtime tunables for the coordinator and agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Upper bound on registered agents
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,

    /// Period of the coordinator tick and agent heartbeats (ms)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which an agent is marked offline and its task unassigned (ms)
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Default lock lease length (ms)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Per-task execution upper bound (ms)
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Auto-assign pending tasks to idle agents each tick
    #[serde(default = "default_true")]
    pub auto_assign: bool,

    /// Derive a per-task working branch name at assignment
    #[serde(default = "default_true")]
    pub git_integration: bool,

    /// Prefix for derived branch names
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Keys written by other tools or newer versions; preserved on rewrite
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            auto_assign: true,
            git_integration: true,
            branch_prefix: default_branch_prefix(),
            extra: BTreeMap::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Resolve the effective configuration for a coordinator directory:
    /// defaults, then `config.json` if present, then environment overrides.
    pub fn resolve(config_file: &Path) -> Result<Self> {
        let mut config = match fs::read_to_string(config_file) {
            Ok(contents) => match serde_json::from_str::<CoordinatorConfig>(&contents) {
                Ok(parsed) => parsed,
                Err(e) => {
                    eprintln!(
                        "Warning: ignoring malformed config {}: {}",
                        config_file.display(),
                        e
                    );
                    CoordinatorConfig::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CoordinatorConfig::default(),
            Err(e) => return Err(e.into()),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `AGENT_*` environment overrides in place.
    ///
    /// Unparseable values are reported and skipped rather than failing the
    /// whole resolution.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_number(MAX_AGENTS_ENV) {
            self.max_agents = v as usize;
        }
        if let Some(v) = env_number(HEARTBEAT_INTERVAL_ENV) {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_number(HEARTBEAT_TIMEOUT_ENV) {
            self.heartbeat_timeout_ms = v;
        }
        if let Some(v) = env_flag(AUTO_ASSIGN_ENV) {
            self.auto_assign = v;
        }
        if let Some(v) = env_flag(GIT_INTEGRATION_ENV) {
            self.git_integration = v;
        }
        if let Ok(prefix) = std::env::var(BRANCH_PREFIX_ENV)
            && !prefix.is_empty()
        {
            self.branch_prefix = prefix;
        }
    }

    /// Validate resolved values.
    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(crate::Error::InvalidInput(
                "max_agents must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(crate::Error::InvalidInput(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(crate::Error::InvalidInput(format!(
                "heartbeat_timeout_ms ({}) must not be shorter than heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

/// Read a numeric environment override, warning on junk.
fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            eprintln!("Warning: ignoring non-numeric {}={}", name, raw);
            None
        }
    }
}

/// Read a boolean environment override. `"false"` and `"0"` disable;
/// any other non-empty value enables.
fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    if raw.is_empty() {
        return None;
    }
    Some(!(raw.eq_ignore_ascii_case("false") || raw == "0"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.max_agents, 10);
        assert_eq!(config.heartbeat_interval_ms, 5_000);
        assert_eq!(config.heartbeat_timeout_ms, 30_000);
        assert_eq!(config.lock_timeout_ms, 300_000);
        assert_eq!(config.task_timeout_ms, 3_600_000);
        assert!(config.auto_assign);
        assert!(config.git_integration);
        assert_eq!(config.branch_prefix, "agent/");
    }

    #[test]
    fn test_resolve_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = CoordinatorConfig::resolve(&temp.path().join("config.json")).unwrap();
        assert_eq!(config.max_agents, 10);
    }

    #[test]
    fn test_file_layer_is_partial() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"max_agents": 3, "auto_assign": false}"#).unwrap();

        let config = CoordinatorConfig::resolve(&path).unwrap();
        assert_eq!(config.max_agents, 3);
        assert!(!config.auto_assign);
        // Untouched keys keep their defaults
        assert_eq!(config.heartbeat_interval_ms, 5_000);
        assert!(config.git_integration);
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = CoordinatorConfig::resolve(&path).unwrap();
        assert_eq!(config.max_agents, 10);
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"max_agents": 4, "future_knob": "on"}"#).unwrap();

        let config = CoordinatorConfig::resolve(&path).unwrap();
        assert_eq!(
            config.extra.get("future_knob"),
            Some(&serde_json::Value::String("on".to_string()))
        );

        let rewritten = serde_json::to_string(&config).unwrap();
        assert!(rewritten.contains("future_knob"));
    }

    #[test]
    fn test_env_flag_semantics() {
        // Uses a var name no other test touches so parallel runs stay safe.
        const VAR: &str = "BOSUN_TEST_ENV_FLAG_SEMANTICS";
        for (raw, expected) in [
            ("false", Some(false)),
            ("FALSE", Some(false)),
            ("0", Some(false)),
            ("true", Some(true)),
            ("1", Some(true)),
            ("anything", Some(true)),
            ("", None),
        ] {
            unsafe { std::env::set_var(VAR, raw) };
            assert_eq!(env_flag(VAR), expected, "value {:?}", raw);
        }
        unsafe { std::env::remove_var(VAR) };
        assert_eq!(env_flag(VAR), None);
    }

    #[test]
    fn test_validate_rejects_zero_agents() {
        let config = CoordinatorConfig {
            max_agents: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_timeout_below_interval() {
        let config = CoordinatorConfig {
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 5_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
