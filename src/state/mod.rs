//! Atomic persistence for the canonical coordinator state.
//!
//! Writes are serialized across processes by an advisory lock file
//! (`state.json.lock`) created with exclusive-create semantics and holding
//! the owner's PID as text. The state itself is written to a temporary
//! sibling and renamed over the target, so readers always see either the
//! old or the new file, never a torn one.
//!
//! Reads take no lock: a missing or unparseable file reads as `None` and
//! the caller continues with its in-memory snapshot.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::models::ServerState;
use crate::{Error, Result};

/// A lock file older than this is presumed abandoned and reclaimed.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// How long a writer waits for the advisory lock before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between acquisition attempts.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Handle to one `state.json`.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
}

/// RAII guard for the advisory lock; removes the lock file on drop.
struct AdvisoryLock<'a> {
    path: &'a Path,
}

impl Drop for AdvisoryLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            eprintln!(
                "Warning: could not remove state lock {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

impl StateStore {
    /// Create a store for the given state file path.
    pub fn new(path: PathBuf, lock_path: PathBuf, tmp_path: PathBuf) -> Self {
        Self {
            path,
            lock_path,
            tmp_path,
        }
    }

    /// The state file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a state file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the current state without locking.
    ///
    /// Returns `None` when the file is absent or does not parse; a torn
    /// read can only happen if the writer's rename is non-atomic, and the
    /// caller is expected to keep going on its in-memory snapshot.
    pub fn read(&self) -> Option<ServerState> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                eprintln!("Warning: could not read {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(state) => Some(state),
            Err(e) => {
                eprintln!(
                    "Warning: could not parse {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Write a full snapshot under the advisory lock.
    pub fn write(&self, state: &ServerState) -> Result<()> {
        let _guard = self.acquire_advisory()?;
        self.write_locked(state)
    }

    /// Read-modify-write under the advisory lock.
    ///
    /// This is how agents mutate their own `AgentInfo` without racing the
    /// coordinator: the updater runs while the lock is held. Fails with
    /// [`Error::NotInitialized`] when no state file exists yet.
    pub fn update<F>(&self, updater: F) -> Result<ServerState>
    where
        F: FnOnce(&mut ServerState),
    {
        let _guard = self.acquire_advisory()?;

        let mut state = self.read().ok_or(Error::NotInitialized)?;
        updater(&mut state);
        self.write_locked(&state)?;
        Ok(state)
    }

    /// Write tmp sibling then rename over the target. Caller holds the lock.
    fn write_locked(&self, state: &ServerState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;

        let mut file = fs::File::create(&self.tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }

    /// Take the advisory lock, reclaiming a stale one, waiting up to the
    /// acquisition timeout otherwise.
    fn acquire_advisory(&self) -> Result<AdvisoryLock<'_>> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    // Owner PID, for humans debugging a wedged coordinator dir.
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(AdvisoryLock {
                        path: &self.lock_path,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        match fs::remove_file(&self.lock_path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::ContendedState(format!(
                            "could not acquire {} within {:?}",
                            self.lock_path.display(),
                            ACQUIRE_TIMEOUT
                        )));
                    }
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Whether the current lock file is old enough to reclaim.
    fn lock_is_stale(&self) -> bool {
        let Ok(metadata) = fs::metadata(&self.lock_path) else {
            // Vanished between attempts; the retry loop handles it.
            return false;
        };
        match metadata.modified() {
            Ok(modified) => modified
                .elapsed()
                .map(|age| age > STALE_LOCK_AGE)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}
