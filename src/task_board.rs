//! Persistent, file-per-task board stored under `<workspace>/.anuris_tasks/`.
//!
//! Each task is one `task_<id>.json` file so that crashes never corrupt more
//! than the task being written; ids are assigned `max(existing) + 1`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{AgentError, AgentResult};

const TASKS_DIR: &str = ".anuris_tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    fn marker(self) -> &'static str {
        match self {
            TaskStatus::Pending => "[ ]",
            TaskStatus::InProgress => "[>]",
            TaskStatus::Completed => "[x]",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub owner: String,
    #[serde(default, rename = "blockedBy")]
    pub blocked_by: BTreeSet<u64>,
    #[serde(default)]
    pub blocks: BTreeSet<u64>,
}

impl Task {
    fn render_line(&self) -> String {
        let mut line = format!("{} #{}: {}", self.status.marker(), self.id, self.subject);
        if !self.owner.is_empty() {
            line.push_str(" @");
            line.push_str(&self.owner);
        }
        if !self.blocked_by.is_empty() {
            let ids: Vec<String> = self.blocked_by.iter().map(|i| i.to_string()).collect();
            line.push_str(" (blocked by: ");
            line.push_str(&ids.join(", "));
            line.push(')');
        }
        line
    }
}

/// Fields a caller may update on an existing task.
#[derive(Debug, Default)]
pub struct TaskUpdate {
    pub status: Option<String>,
    pub owner: Option<String>,
    pub add_blocked_by: Vec<u64>,
    pub add_blocks: Vec<u64>,
}

pub struct TaskBoard {
    dir: PathBuf,
}

impl TaskBoard {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            dir: workspace_root.join(TASKS_DIR),
        }
    }

    fn task_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("task_{id}.json"))
    }

    fn ensure_dir(&self) -> AgentResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| AgentError::Unavailable(format!("task board directory: {e}")))
    }

    fn read_task(path: &Path) -> Option<Task> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn write_task(&self, task: &Task) -> AgentResult<()> {
        self.ensure_dir()?;
        let contents = serde_json::to_string_pretty(task)
            .map_err(|e| AgentError::Provider(format!("failed to serialize task: {e}")))?;
        std::fs::write(self.task_path(task.id), contents)
            .map_err(|e| AgentError::Unavailable(format!("failed to write task: {e}")))
    }

    /// Load every task, skipping corrupt or misnamed files.
    pub fn all(&self) -> Vec<Task> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut tasks: Vec<Task> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("task_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .filter_map(|e| Self::read_task(&e.path()))
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn get(&self, id: u64) -> AgentResult<Task> {
        Self::read_task(&self.task_path(id))
            .ok_or_else(|| AgentError::InvalidInput(format!("no such task #{id}")))
    }

    pub fn create(&self, subject: &str, description: &str) -> AgentResult<Task> {
        if subject.trim().is_empty() {
            return Err(AgentError::InvalidInput("subject is required".into()));
        }
        let next_id = self.all().iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let task = Task {
            id: next_id,
            subject: subject.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            owner: String::new(),
            blocked_by: BTreeSet::new(),
            blocks: BTreeSet::new(),
        };
        self.write_task(&task)?;
        Ok(task)
    }

    pub fn list_rendered(&self) -> String {
        let tasks = self.all();
        if tasks.is_empty() {
            return "(no tasks)".to_string();
        }
        tasks
            .iter()
            .map(Task::render_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Apply an update, returning either the updated task or a deletion
    /// message when `status == "deleted"`.
    pub fn update(&self, id: u64, update: TaskUpdate) -> AgentResult<String> {
        if let Some(status) = &update.status {
            if status == "deleted" {
                std::fs::remove_file(self.task_path(id))
                    .map_err(|e| AgentError::InvalidInput(format!("no such task #{id}: {e}")))?;
                return Ok(format!("Deleted task #{id}"));
            }
        }

        let mut task = self.get(id)?;

        if let Some(status) = &update.status {
            let parsed = TaskStatus::parse(status)
                .ok_or_else(|| AgentError::InvalidInput(format!("unknown status '{status}'")))?;
            task.status = parsed;
        }
        if let Some(owner) = update.owner {
            task.owner = owner;
        }
        task.blocked_by.extend(update.add_blocked_by.iter());
        task.blocks.extend(update.add_blocks.iter());
        self.write_task(&task)?;

        // Mirror `blocks` additions into the target's `blockedBy`.
        for blocked_id in &update.add_blocks {
            if *blocked_id == id {
                continue;
            }
            if let Ok(mut blocked) = self.get(*blocked_id) {
                if blocked.blocked_by.insert(id) {
                    self.write_task(&blocked)?;
                }
            }
        }

        // Completing a task clears it from every other task's blockedBy.
        if task.status == TaskStatus::Completed {
            for mut other in self.all() {
                if other.id != id && other.blocked_by.remove(&id) {
                    self.write_task(&other)?;
                }
            }
        }

        Ok(self.get(id)?.render_line())
    }

    pub fn claim(&self, id: u64, owner: &str) -> AgentResult<String> {
        self.update(
            id,
            TaskUpdate {
                status: Some("in_progress".to_string()),
                owner: Some(owner.to_string()),
                ..Default::default()
            },
        )
    }

    /// Pick the lowest-id pending, unblocked task and assign it to `owner`.
    pub fn claim_next_unblocked(&self, owner: &str) -> Option<Task> {
        let candidate = self
            .all()
            .into_iter()
            .find(|t| t.status == TaskStatus::Pending && t.blocked_by.is_empty())?;
        self.claim(candidate.id, owner).ok()?;
        self.get(candidate.id).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let board = TaskBoard::new(dir.path());
        let a = board.create("Ship feature", "").unwrap();
        let b = board.create("Write docs", "").unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[test]
    fn update_and_list_render_matches_spec_example() {
        let dir = tempfile::tempdir().unwrap();
        let board = TaskBoard::new(dir.path());
        board.create("Ship feature", "").unwrap();
        board
            .update(
                1,
                TaskUpdate {
                    status: Some("in_progress".into()),
                    owner: Some("lead".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(board.list_rendered(), "[>] #1: Ship feature @lead");
    }

    #[test]
    fn blocks_mirrors_into_blocked_by_and_clears_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let board = TaskBoard::new(dir.path());
        let a = board.create("A", "").unwrap();
        let b = board.create("B", "").unwrap();

        board
            .update(
                a.id,
                TaskUpdate {
                    add_blocks: vec![b.id],
                    ..Default::default()
                },
            )
            .unwrap();
        let a2 = board.get(a.id).unwrap();
        let b2 = board.get(b.id).unwrap();
        assert!(a2.blocks.contains(&b.id));
        assert!(b2.blocked_by.contains(&a.id));

        board
            .update(
                a.id,
                TaskUpdate {
                    status: Some("completed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let b3 = board.get(b.id).unwrap();
        assert!(b3.blocked_by.is_empty());
    }

    #[test]
    fn deleted_status_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let board = TaskBoard::new(dir.path());
        let a = board.create("A", "").unwrap();
        let msg = board
            .update(
                a.id,
                TaskUpdate {
                    status: Some("deleted".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(msg.contains("Deleted"));
        assert!(board.get(a.id).is_err());
    }

    #[test]
    fn claim_next_unblocked_skips_blocked_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let board = TaskBoard::new(dir.path());
        let a = board.create("A", "").unwrap();
        let b = board.create("B", "").unwrap();
        board
            .update(
                b.id,
                TaskUpdate {
                    add_blocked_by: vec![a.id],
                    ..Default::default()
                },
            )
            .unwrap();

        let claimed = board.claim_next_unblocked("worker1").unwrap();
        assert_eq!(claimed.id, a.id);
        assert_eq!(claimed.owner, "worker1");

        // B is still blocked, so the next call should find nothing.
        assert!(board.claim_next_unblocked("worker1").is_none());
    }

    #[test]
    fn corrupt_files_are_skipped_during_listing() {
        let dir = tempfile::tempdir().unwrap();
        let board = TaskBoard::new(dir.path());
        board.create("A", "").unwrap();
        std::fs::create_dir_all(dir.path().join(".anuris_tasks")).unwrap();
        std::fs::write(dir.path().join(".anuris_tasks/task_99.json"), "not json").unwrap();
        std::fs::write(dir.path().join(".anuris_tasks/not_a_task.json"), "{}").unwrap();
        assert_eq!(board.all().len(), 1);
    }
}
