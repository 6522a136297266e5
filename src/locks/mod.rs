//! Lease-based file locks guarding working-tree paths.
//!
//! The lock manager is the authoritative in-memory map, keyed by canonical
//! path and mirrored to `locks/active.json` after every mutation so other
//! tools can inspect the current holds. On startup the mirror is reloaded,
//! dropping anything already expired.
//!
//! Compatibility: two `read` holds coexist; everything else conflicts.
//! Locks held by the same agent on the same path never conflict with
//! themselves.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{FileLock, LockType};
use crate::{Error, Result};

/// A batch lock acquisition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRequest {
    /// Requesting agent
    pub agent_id: String,

    /// Task the locks are for, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Paths to lock, relative to the project root (absolute paths are
    /// re-expressed relative to it)
    pub paths: Vec<String>,

    /// Kind of lease requested
    #[serde(default)]
    pub lock_type: LockType,

    /// Lease length override (ms); the configured default applies otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// One path that could not be locked, and who holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConflict {
    pub path: String,
    pub held_by: String,
}

/// Outcome of a batch acquisition.
///
/// `success` is true only when every requested path was acquired. Paths in
/// `acquired` stay locked even when `success` is false; callers that want
/// all-or-nothing must release them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockResult {
    pub success: bool,
    #[serde(default)]
    pub acquired: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<LockConflict>,
}

/// Lease-based lock table for one project.
#[derive(Debug)]
pub struct LockManager {
    /// Active locks by canonical path
    locks: HashMap<String, FileLock>,
    /// Mirror written after every mutation
    mirror_path: PathBuf,
    /// Root used to relativize absolute paths
    project_root: PathBuf,
    /// Default lease length (ms)
    default_timeout_ms: u64,
}

impl LockManager {
    /// Create a manager and reload non-expired locks from the mirror.
    pub fn open(project_root: &Path, mirror_path: PathBuf, default_timeout_ms: u64) -> Self {
        let mut manager = Self {
            locks: HashMap::new(),
            mirror_path,
            project_root: project_root.to_path_buf(),
            default_timeout_ms,
        };
        manager.reload();
        manager
    }

    /// Reload the mirror, keeping only locks that have not expired.
    fn reload(&mut self) {
        let contents = match fs::read_to_string(&self.mirror_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                eprintln!(
                    "Warning: could not read lock mirror {}: {}",
                    self.mirror_path.display(),
                    e
                );
                return;
            }
        };

        let entries: Vec<FileLock> = match serde_json::from_str(&contents) {
            Ok(entries) => entries,
            Err(e) => {
                eprintln!(
                    "Warning: ignoring malformed lock mirror {}: {}",
                    self.mirror_path.display(),
                    e
                );
                return;
            }
        };

        let now = Utc::now();
        for lock in entries {
            if !lock.is_expired(now) {
                self.locks.insert(lock.path.clone(), lock);
            }
        }
    }

    /// Persist the current table to the mirror.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.mirror_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut entries: Vec<&FileLock> = self.locks.values().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let json = serde_json::to_string_pretty(&entries)?;
        fs::write(&self.mirror_path, json)?;
        Ok(())
    }

    /// Canonicalize a lock key: relative to the project root where possible,
    /// forward slashes, no trailing slash.
    pub fn canonical_path(&self, raw: &str) -> String {
        let normalized = raw.replace('\\', "/");
        let path = Path::new(&normalized);

        let relative = if path.is_absolute() {
            match path.strip_prefix(&self.project_root) {
                Ok(stripped) => stripped.to_string_lossy().replace('\\', "/"),
                Err(_) => normalized,
            }
        } else {
            normalized
        };

        relative.trim_end_matches('/').to_string()
    }

    /// Drop every expired lock. Called from all read-style operations.
    fn sweep(&mut self) {
        let now = Utc::now();
        self.locks.retain(|_, lock| !lock.is_expired(now));
    }

    /// The lock that would block `agent_id` from taking `lock_type` on
    /// `path`, if any. Expired holds are ignored.
    pub fn conflicting_lock(
        &self,
        agent_id: &str,
        path: &str,
        lock_type: LockType,
    ) -> Option<&FileLock> {
        let key = self.canonical_path(path);
        let held = self.locks.get(&key)?;
        if held.is_expired(Utc::now()) {
            return None;
        }
        if held.agent_id == agent_id {
            return None;
        }
        if held.lock_type == LockType::Read && lock_type == LockType::Read {
            return None;
        }
        Some(held)
    }

    /// Acquire locks for every path in the request.
    ///
    /// Paths without conflicts are installed and persisted even when other
    /// paths in the same request fail; the result reports both sides.
    pub fn acquire(&mut self, request: &LockRequest) -> Result<LockResult> {
        self.sweep();

        let now = Utc::now();
        let timeout_ms = request.timeout_ms.unwrap_or(self.default_timeout_ms);
        let expires_at = now + Duration::milliseconds(timeout_ms as i64);

        let mut acquired = Vec::new();
        let mut failed = Vec::new();
        let mut conflicts = Vec::new();

        for raw in &request.paths {
            let key = self.canonical_path(raw);
            if let Some(held) = self.conflicting_lock(&request.agent_id, &key, request.lock_type) {
                conflicts.push(LockConflict {
                    path: key.clone(),
                    held_by: held.agent_id.clone(),
                });
                failed.push(key);
                continue;
            }

            self.locks.insert(
                key.clone(),
                FileLock {
                    path: key.clone(),
                    agent_id: request.agent_id.clone(),
                    task_id: request.task_id.clone(),
                    locked_at: now,
                    expires_at,
                    lock_type: request.lock_type,
                },
            );
            acquired.push(key);
        }

        self.persist()?;

        Ok(LockResult {
            success: failed.is_empty(),
            acquired,
            failed,
            conflicts,
        })
    }

    /// Release the given paths if `agent_id` owns them. Returns the paths
    /// actually released.
    pub fn release(&mut self, agent_id: &str, paths: &[String]) -> Result<Vec<String>> {
        let mut released = Vec::new();
        for raw in paths {
            let key = self.canonical_path(raw);
            if self
                .locks
                .get(&key)
                .is_some_and(|lock| lock.agent_id == agent_id)
            {
                self.locks.remove(&key);
                released.push(key);
            }
        }
        if !released.is_empty() {
            self.persist()?;
        }
        Ok(released)
    }

    /// Release every lock held by `agent_id`.
    pub fn release_all(&mut self, agent_id: &str) -> Result<Vec<String>> {
        let paths: Vec<String> = self
            .locks
            .values()
            .filter(|lock| lock.agent_id == agent_id)
            .map(|lock| lock.path.clone())
            .collect();
        for path in &paths {
            self.locks.remove(path);
        }
        if !paths.is_empty() {
            self.persist()?;
        }
        Ok(paths)
    }

    /// Release every lock taken for `task_id`.
    pub fn release_task(&mut self, task_id: &str) -> Result<Vec<String>> {
        let paths: Vec<String> = self
            .locks
            .values()
            .filter(|lock| lock.task_id.as_deref() == Some(task_id))
            .map(|lock| lock.path.clone())
            .collect();
        for path in &paths {
            self.locks.remove(path);
        }
        if !paths.is_empty() {
            self.persist()?;
        }
        Ok(paths)
    }

    /// Unconditionally drop the lock on `path`. Administrative use only.
    pub fn force_release(&mut self, path: &str) -> Result<bool> {
        let key = self.canonical_path(path);
        let removed = self.locks.remove(&key).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Move a lease deadline forward by `additional_ms`. Only the owner may
    /// extend, and only while the lease is live.
    pub fn extend(
        &mut self,
        agent_id: &str,
        path: &str,
        additional_ms: u64,
    ) -> Result<DateTime<Utc>> {
        if additional_ms == 0 {
            return Err(Error::InvalidInput(
                "lock extension must be positive".to_string(),
            ));
        }
        self.sweep();

        let key = self.canonical_path(path);
        let lock = self
            .locks
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("no lock on {}", key)))?;

        if lock.agent_id != agent_id {
            return Err(Error::IllegalTransition(format!(
                "lock on {} is held by {}, not {}",
                key, lock.agent_id, agent_id
            )));
        }

        lock.expires_at += Duration::milliseconds(additional_ms as i64);
        let deadline = lock.expires_at;
        self.persist()?;
        Ok(deadline)
    }

    /// All live locks, expired entries swept.
    pub fn all(&mut self) -> Vec<FileLock> {
        self.sweep();
        let mut locks: Vec<FileLock> = self.locks.values().cloned().collect();
        locks.sort_by(|a, b| a.path.cmp(&b.path));
        locks
    }

    /// Number of live locks.
    pub fn len(&mut self) -> usize {
        self.sweep();
        self.locks.len()
    }

    /// Whether the table is empty after sweeping.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> LockManager {
        LockManager::open(
            temp.path(),
            temp.path().join("locks").join("active.json"),
            300_000,
        )
    }

    fn request(agent: &str, paths: &[&str], lock_type: LockType) -> LockRequest {
        LockRequest {
            agent_id: agent.to_string(),
            task_id: None,
            paths: paths.iter().map(|p| p.to_string()).collect(),
            lock_type,
            timeout_ms: None,
        }
    }

    #[test]
    fn test_acquire_and_release_restores_prior_state() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        let result = locks
            .acquire(&request("agent-1", &["src/a.rs", "src/b.rs"], LockType::Write))
            .unwrap();
        assert!(result.success);
        assert_eq!(result.acquired.len(), 2);
        assert_eq!(locks.len(), 2);

        locks.release("agent-1", &result.acquired).unwrap();
        assert!(locks.is_empty());
    }

    #[test]
    fn test_read_locks_are_shared() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        assert!(
            locks
                .acquire(&request("agent-1", &["doc.md"], LockType::Read))
                .unwrap()
                .success
        );
        assert!(
            locks
                .acquire(&request("agent-2", &["doc.md"], LockType::Read))
                .unwrap()
                .success
        );
    }

    #[test]
    fn test_write_conflicts_with_everything() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        locks
            .acquire(&request("agent-1", &["src/a.rs"], LockType::Write))
            .unwrap();

        for lock_type in [LockType::Read, LockType::Write, LockType::Exclusive] {
            let result = locks
                .acquire(&request("agent-2", &["src/a.rs"], lock_type))
                .unwrap();
            assert!(!result.success);
            assert_eq!(result.conflicts[0].held_by, "agent-1");
        }
    }

    #[test]
    fn test_same_agent_does_not_conflict_with_itself() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        locks
            .acquire(&request("agent-1", &["src/a.rs"], LockType::Write))
            .unwrap();
        let result = locks
            .acquire(&request("agent-1", &["src/a.rs"], LockType::Exclusive))
            .unwrap();
        assert!(result.success);
    }

    #[test]
    fn test_partial_acquisition_keeps_acquired_paths() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        locks
            .acquire(&request("agent-1", &["src/a.rs"], LockType::Write))
            .unwrap();

        let result = locks
            .acquire(&request("agent-2", &["src/a.rs", "src/b.rs"], LockType::Write))
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.acquired, vec!["src/b.rs".to_string()]);
        assert_eq!(result.failed, vec!["src/a.rs".to_string()]);

        // The free path stays locked for agent-2 even though the batch failed.
        assert!(
            locks
                .conflicting_lock("agent-3", "src/b.rs", LockType::Write)
                .is_some()
        );
    }

    #[test]
    fn test_release_ignores_other_owners() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        locks
            .acquire(&request("agent-1", &["src/a.rs"], LockType::Write))
            .unwrap();
        let released = locks
            .release("agent-2", &["src/a.rs".to_string()])
            .unwrap();
        assert!(released.is_empty());
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_release_task_bulk() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        let mut req = request("agent-1", &["a.rs", "b.rs"], LockType::Write);
        req.task_id = Some("task-0001".to_string());
        locks.acquire(&req).unwrap();
        locks
            .acquire(&request("agent-1", &["c.rs"], LockType::Write))
            .unwrap();

        let released = locks.release_task("task-0001").unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_extend_is_owner_only_and_additive() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        locks
            .acquire(&request("agent-1", &["src/a.rs"], LockType::Write))
            .unwrap();
        let before = locks.all()[0].expires_at;

        let after = locks.extend("agent-1", "src/a.rs", 60_000).unwrap();
        assert_eq!(after, before + Duration::milliseconds(60_000));

        assert!(matches!(
            locks.extend("agent-2", "src/a.rs", 60_000),
            Err(Error::IllegalTransition(_))
        ));
        assert!(matches!(
            locks.extend("agent-1", "nope.rs", 60_000),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_expired_locks_are_swept_on_read() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        let mut req = request("agent-1", &["src/a.rs"], LockType::Write);
        req.timeout_ms = Some(0); // expires immediately: expires_at == locked_at
        locks.acquire(&req).unwrap();

        assert!(locks.all().is_empty());
        let result = locks
            .acquire(&request("agent-2", &["src/a.rs"], LockType::Write))
            .unwrap();
        assert!(result.success, "expired lock must not block a new holder");
    }

    #[test]
    fn test_canonical_path_normalization() {
        let temp = TempDir::new().unwrap();
        let locks = manager(&temp);

        assert_eq!(locks.canonical_path("x\\a.ts"), "x/a.ts");
        assert_eq!(locks.canonical_path("src/dir/"), "src/dir");

        let absolute = temp.path().join("src").join("a.rs");
        assert_eq!(
            locks.canonical_path(&absolute.to_string_lossy()),
            "src/a.rs"
        );
    }

    #[test]
    fn test_backslash_and_slash_keys_collide() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        locks
            .acquire(&request("agent-1", &["x/a.ts"], LockType::Write))
            .unwrap();
        let result = locks
            .acquire(&request("agent-2", &["x\\a.ts"], LockType::Write))
            .unwrap();
        assert!(!result.success);
    }

    #[test]
    fn test_mirror_survives_restart_without_expired_entries() {
        let temp = TempDir::new().unwrap();
        {
            let mut locks = manager(&temp);
            locks
                .acquire(&request("agent-1", &["keep.rs"], LockType::Write))
                .unwrap();
            let mut short = request("agent-1", &["drop.rs"], LockType::Write);
            short.timeout_ms = Some(0);
            locks.acquire(&short).unwrap();
        }

        let mut reopened = manager(&temp);
        let paths: Vec<String> = reopened.all().iter().map(|l| l.path.clone()).collect();
        assert_eq!(paths, vec!["keep.rs".to_string()]);
    }

    #[test]
    fn test_force_release() {
        let temp = TempDir::new().unwrap();
        let mut locks = manager(&temp);

        locks
            .acquire(&request("agent-1", &["src/a.rs"], LockType::Exclusive))
            .unwrap();
        assert!(locks.force_release("src/a.rs").unwrap());
        assert!(!locks.force_release("src/a.rs").unwrap());
        assert!(locks.is_empty());
    }
}
