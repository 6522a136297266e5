//! Durable file-backed message queues.
//!
//! One file per message. Per-agent traffic flows through
//! `agents/<id>/inbox/` (coordinator writes, agent reads-and-deletes) and
//! `agents/<id>/outbox/` (agent writes, coordinator reads-and-deletes);
//! `messages/` is the shared board, append-only and swept by age.
//!
//! File names start with the envelope timestamp, so a sorted directory
//! listing is chronological within one producer. Reads never fail on a
//! partial or corrupt file: such entries are reported and skipped, and
//! well-formed neighbors are still delivered.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::CoordinatorPaths;
use crate::messages::Message;
use crate::Result;

/// File-per-message queues under one coordinator directory.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    paths: CoordinatorPaths,
}

impl MessageQueue {
    /// Create a queue handle over the given layout.
    pub fn new(paths: CoordinatorPaths) -> Self {
        Self { paths }
    }

    /// The layout this queue writes under.
    pub fn paths(&self) -> &CoordinatorPaths {
        &self.paths
    }

    /// Write a message into an agent's inbox, creating the directory on
    /// demand. Coordinator side.
    pub fn send_to_agent(&self, agent_id: &str, message: &Message) -> Result<()> {
        let dir = self.paths.inbox_dir(agent_id);
        write_message(&dir, message)
    }

    /// Write a message into an agent's own outbox. Agent side.
    pub fn post_from_agent(&self, agent_id: &str, message: &Message) -> Result<()> {
        let dir = self.paths.outbox_dir(agent_id);
        write_message(&dir, message)
    }

    /// Fan a message out to every agent currently present, skipping
    /// `exclude`. Returns how many inboxes received it.
    pub fn broadcast(&self, message: &Message, exclude: Option<&str>) -> Result<usize> {
        let mut delivered = 0;
        for agent_id in self.list_agent_dirs()? {
            if Some(agent_id.as_str()) == exclude {
                continue;
            }
            self.send_to_agent(&agent_id, message)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Append a message to the global board.
    pub fn post_global(&self, message: &Message) -> Result<()> {
        write_message(&self.paths.messages_dir(), message)
    }

    /// Read an agent's inbox in chronological order. Agent side.
    pub fn read_inbox(&self, agent_id: &str, delete_after_read: bool) -> Result<Vec<Message>> {
        read_directory(&self.paths.inbox_dir(agent_id), delete_after_read)
    }

    /// Read an agent's outbox in chronological order. Coordinator side.
    pub fn read_outbox(&self, agent_id: &str, delete_after_read: bool) -> Result<Vec<Message>> {
        read_directory(&self.paths.outbox_dir(agent_id), delete_after_read)
    }

    /// Read board messages newer than `since_ms` (epoch milliseconds).
    pub fn read_global_messages(&self, since_ms: i64) -> Result<Vec<Message>> {
        let mut messages = read_directory(&self.paths.messages_dir(), false)?;
        messages.retain(|m| m.timestamp.timestamp_millis() > since_ms);
        Ok(messages)
    }

    /// Delete board and mailbox messages older than `max_age_ms`. Returns
    /// how many files were removed.
    pub fn clean_old_messages(&self, max_age_ms: u64) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - max_age_ms as i64;
        let mut removed = sweep_directory(&self.paths.messages_dir(), cutoff)?;
        for agent_id in self.list_agent_dirs()? {
            removed += sweep_directory(&self.paths.inbox_dir(&agent_id), cutoff)?;
            removed += sweep_directory(&self.paths.outbox_dir(&agent_id), cutoff)?;
        }
        Ok(removed)
    }

    /// Agent ids with a subtree under `agents/`.
    pub fn list_agent_dirs(&self) -> Result<Vec<String>> {
        let agents_dir = self.paths.agents_dir();
        let entries = match fs::read_dir(&agents_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Persist one message into `dir` under its timestamp-prefixed file name.
fn write_message(dir: &Path, message: &Message) -> Result<()> {
    fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(message)?;
    fs::write(dir.join(message.file_name()), json)?;
    Ok(())
}

/// Read every `.json` file in `dir`, sorted by file name (chronological
/// within one producer), skipping entries that do not parse. Parsed files
/// are unlinked afterwards when `delete_after_read` is set, which gives
/// at-least-once delivery: a crash between read and unlink redelivers.
fn read_directory(dir: &Path, delete_after_read: bool) -> Result<Vec<Message>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();

    let mut messages = Vec::new();
    let mut consumed = Vec::new();
    for path in files {
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Warning: could not read {}: {}", path.display(), e);
                continue;
            }
        };
        match serde_json::from_str::<Message>(&contents) {
            Ok(message) => {
                messages.push(message);
                consumed.push(path);
            }
            Err(e) => {
                // Possibly mid-write by the producer; leave it for later.
                eprintln!("Warning: skipping malformed {}: {}", path.display(), e);
            }
        }
    }

    if delete_after_read {
        for path in consumed {
            if let Err(e) = fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                eprintln!("Warning: could not remove {}: {}", path.display(), e);
            }
        }
    }

    Ok(messages)
}

/// Remove `.json` files in `dir` whose timestamp prefix is older than
/// `cutoff_ms`. Files without a parseable prefix are left alone.
fn sweep_directory(dir: &Path, cutoff_ms: i64) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(millis) = stem
            .split('-')
            .next()
            .and_then(|prefix| prefix.parse::<i64>().ok())
        else {
            continue;
        };
        if millis < cutoff_ms {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    eprintln!("Warning: could not remove {}: {}", path.display(), e);
                }
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessagePayload;
    use crate::test_utils::TestProject;

    fn text_message(source: &str, note: &str) -> Message {
        Message::new(
            source,
            MessagePayload::Broadcast {
                data: serde_json::json!({ "note": note }),
            },
        )
    }

    #[test]
    fn test_send_and_read_inbox() {
        let project = TestProject::init();
        let queue = MessageQueue::new(project.paths());

        queue
            .send_to_agent("agent-1", &text_message("coordinator", "hello"))
            .unwrap();
        let messages = queue.read_inbox("agent-1", true).unwrap();
        assert_eq!(messages.len(), 1);

        // Consumed on delete_after_read=true.
        assert!(queue.read_inbox("agent-1", true).unwrap().is_empty());
    }

    #[test]
    fn test_read_without_delete_redelivers() {
        let project = TestProject::init();
        let queue = MessageQueue::new(project.paths());

        queue
            .post_from_agent("agent-1", &text_message("agent-1", "ahoy"))
            .unwrap();
        assert_eq!(queue.read_outbox("agent-1", false).unwrap().len(), 1);
        assert_eq!(queue.read_outbox("agent-1", false).unwrap().len(), 1);
        assert_eq!(queue.read_outbox("agent-1", true).unwrap().len(), 1);
        assert!(queue.read_outbox("agent-1", true).unwrap().is_empty());
    }

    #[test]
    fn test_chronological_order() {
        let project = TestProject::init();
        let queue = MessageQueue::new(project.paths());

        let mut first = text_message("coordinator", "first");
        first.id = "0000000000100-aaaaaa".to_string();
        let mut second = text_message("coordinator", "second");
        second.id = "0000000000200-aaaaaa".to_string();

        // Written newest-first; read back oldest-first.
        queue.send_to_agent("agent-1", &second).unwrap();
        queue.send_to_agent("agent-1", &first).unwrap();

        let messages = queue.read_inbox("agent-1", true).unwrap();
        assert_eq!(messages[0].id, first.id);
        assert_eq!(messages[1].id, second.id);
    }

    #[test]
    fn test_malformed_file_is_skipped_not_fatal() {
        let project = TestProject::init();
        let queue = MessageQueue::new(project.paths());

        queue
            .send_to_agent("agent-1", &text_message("coordinator", "good"))
            .unwrap();
        let inbox = project.paths().inbox_dir("agent-1");
        std::fs::write(inbox.join("0000000000000-junk.json"), "{ torn writ").unwrap();

        let messages = queue.read_inbox("agent-1", true).unwrap();
        assert_eq!(messages.len(), 1, "well-formed neighbor still delivered");
        // The corrupt file is left in place, not deleted.
        assert!(inbox.join("0000000000000-junk.json").exists());
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let project = TestProject::init();
        let paths = project.paths();
        paths.ensure_agent_dirs("agent-1").unwrap();
        paths.ensure_agent_dirs("agent-2").unwrap();
        paths.ensure_agent_dirs("agent-3").unwrap();
        let queue = MessageQueue::new(paths);

        let delivered = queue
            .broadcast(&text_message("agent-2", "all hands"), Some("agent-2"))
            .unwrap();
        assert_eq!(delivered, 2);
        assert!(queue.read_inbox("agent-2", false).unwrap().is_empty());
        assert_eq!(queue.read_inbox("agent-1", false).unwrap().len(), 1);
    }

    #[test]
    fn test_global_board_since_filter() {
        let project = TestProject::init();
        let queue = MessageQueue::new(project.paths());

        let message = text_message("coordinator", "posted");
        queue.post_global(&message).unwrap();

        let all = queue.read_global_messages(0).unwrap();
        assert_eq!(all.len(), 1);

        let after = queue
            .read_global_messages(message.timestamp.timestamp_millis())
            .unwrap();
        assert!(after.is_empty(), "since filter is exclusive");
    }

    #[test]
    fn test_clean_old_messages() {
        let project = TestProject::init();
        let queue = MessageQueue::new(project.paths());

        let mut stale = text_message("coordinator", "stale");
        stale.id = "0000000000001-aaaaaa".to_string();
        queue.post_global(&stale).unwrap();
        queue.post_global(&text_message("coordinator", "fresh")).unwrap();

        let removed = queue.clean_old_messages(60_000).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.read_global_messages(0).unwrap().len(), 1);
    }
}
