//! File-backed inbox bus: one JSONL file per named entity under
//! `<workspace>/.anuris_team/inbox/<name>.jsonl`. Reads atomically drain the
//! backing file; this is not multi-process safe, only single-process safe
//! (see Design Notes).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const INBOX_DIR: &str = ".anuris_team/inbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxMessageType {
    Message,
    Broadcast,
    ShutdownRequest,
    ShutdownResponse,
    PlanApprovalRequest,
    PlanApprovalResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    #[serde(rename = "type")]
    pub kind: InboxMessageType,
    pub from: String,
    pub content: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Guards all inbox file I/O behind a single process-wide mutex; per spec
/// §5, send/read ordering is only guaranteed within one process.
pub struct FileBus {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileBus {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            dir: workspace_root.join(INBOX_DIR),
            lock: Mutex::new(()),
        }
    }

    fn inbox_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.jsonl"))
    }

    /// Append one message to `target`'s inbox.
    pub fn send(&self, target: &str, message: &InboxMessage) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        std::fs::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(message).unwrap_or_default();
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.inbox_path(target))?;
        writeln!(file, "{line}")
    }

    /// Drain `name`'s inbox: parse every well-formed line in append order,
    /// skip malformed ones, then atomically replace the file with empty.
    pub fn read(&self, name: &str) -> Vec<InboxMessage> {
        let _guard = self.lock.lock().unwrap();
        let path = self.inbox_path(name);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        let messages: Vec<InboxMessage> = contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let _ = std::fs::write(&path, "");
        messages
    }

    /// Peek without draining (used by monitoring surfaces).
    pub fn peek(&self, name: &str) -> Vec<InboxMessage> {
        let _guard = self.lock.lock().unwrap();
        let Ok(contents) = std::fs::read_to_string(self.inbox_path(name)) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn message(kind: InboxMessageType, from: &str, content: impl Into<String>) -> InboxMessage {
    InboxMessage {
        kind,
        from: from.to_string(),
        content: content.into(),
        timestamp: now_secs(),
        extra: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_drains_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::new(dir.path());
        bus.send("alice", &message(InboxMessageType::Message, "bob", "first"))
            .unwrap();
        bus.send("alice", &message(InboxMessageType::Message, "bob", "second"))
            .unwrap();

        let msgs = bus.read("alice");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "first");
        assert_eq!(msgs[1].content, "second");

        assert!(bus.read("alice").is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".anuris_team/inbox")).unwrap();
        std::fs::write(
            dir.path().join(".anuris_team/inbox/carol.jsonl"),
            "not json\n{\"type\":\"message\",\"from\":\"a\",\"content\":\"ok\",\"timestamp\":1}\n",
        )
        .unwrap();
        let msgs = bus.read("carol");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "ok");
    }

    #[test]
    fn unread_inbox_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::new(dir.path());
        assert!(bus.read("nobody").is_empty());
    }
}
