//! Asynchronous background shell tasks with a drainable notification queue.
//!
//! Each `run()` spawns an OS thread that executes under the workspace root
//! with a timeout; completions are recorded and queued as notifications for
//! the agent loop to splice into the next round.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::tool_executor::{is_dangerous_command, run_shell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundStatus {
    Running,
    Completed,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: String,
    pub command: String,
    pub status: BackgroundStatus,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub task_id: String,
    pub status: BackgroundStatus,
    pub command: String,
    pub result: String,
}

#[derive(Default)]
struct State {
    tasks: Vec<BackgroundTask>,
    notifications: Vec<Notification>,
}

/// Shared handle; cloning gives another reference to the same state so
/// worker threads can report back into the same table.
#[derive(Clone)]
pub struct BackgroundManager {
    workspace_root: PathBuf,
    state: Arc<Mutex<State>>,
}

impl BackgroundManager {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn next_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
    }

    /// Launch `command` in a background thread. Returns its task id
    /// immediately; dangerous commands are rejected synchronously.
    pub fn run(&self, command: &str, timeout: Duration) -> Result<String, String> {
        if is_dangerous_command(command) {
            return Err("Error: Dangerous command blocked".to_string());
        }

        let id = Self::next_id();
        {
            let mut state = self.state.lock().unwrap();
            state.tasks.push(BackgroundTask {
                id: id.clone(),
                command: command.to_string(),
                status: BackgroundStatus::Running,
                result: None,
            });
        }

        let workspace_root = self.workspace_root.clone();
        let command_owned = command.to_string();
        let state = Arc::clone(&self.state);
        let task_id = id.clone();

        std::thread::spawn(move || {
            let started = Instant::now();
            let outcome = run_shell(&workspace_root, &command_owned, timeout);
            let elapsed = started.elapsed();

            let (status, result) = match outcome {
                Ok(output) => (BackgroundStatus::Completed, output),
                Err(e) if e.contains("Timeout") => (BackgroundStatus::Timeout, e),
                Err(e) => (BackgroundStatus::Error, e),
            };
            let _ = elapsed;

            let mut state = state.lock().unwrap();
            if let Some(task) = state.tasks.iter_mut().find(|t| t.id == task_id) {
                task.status = status;
                task.result = Some(result.clone());
            }
            state.notifications.push(Notification {
                task_id: task_id.clone(),
                status,
                command: truncate(&command_owned, 80),
                result: truncate(&result, 500),
            });
        });

        Ok(id)
    }

    /// Snapshot of a single task, or a multi-line listing of all tasks.
    pub fn check(&self, task_id: Option<&str>) -> String {
        let state = self.state.lock().unwrap();
        match task_id {
            Some(id) => match state.tasks.iter().find(|t| t.id == id) {
                Some(task) => render_task(task),
                None => format!("Error: unknown background task '{id}'"),
            },
            None => {
                if state.tasks.is_empty() {
                    "(no background tasks)".to_string()
                } else {
                    state.tasks.iter().map(render_task).collect::<Vec<_>>().join("\n")
                }
            }
        }
    }

    /// Atomically drain and return every pending notification.
    pub fn drain_notifications(&self) -> Vec<Notification> {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.notifications)
    }
}

fn render_task(task: &BackgroundTask) -> String {
    format!(
        "{} [{:?}] {}",
        task.id,
        task.status,
        task.result.as_deref().unwrap_or("(running)")
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn dangerous_commands_are_rejected_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackgroundManager::new(dir.path().to_path_buf());
        let err = mgr.run("sudo rm -rf /", Duration::from_secs(5)).unwrap_err();
        assert!(err.contains("Dangerous command blocked"));
    }

    #[test]
    fn run_completes_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackgroundManager::new(dir.path().to_path_buf());
        let id = mgr.run("echo hello", Duration::from_secs(5)).unwrap();

        let mut notifications = Vec::new();
        for _ in 0..50 {
            notifications = mgr.drain_notifications();
            if !notifications.is_empty() {
                break;
            }
            sleep(Duration::from_millis(50));
        }

        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].task_id, id);
        assert_eq!(notifications[0].status, BackgroundStatus::Completed);
        assert!(notifications[0].result.contains("hello"));

        // Notifications are drained, so a second call returns nothing new.
        assert!(mgr.drain_notifications().is_empty());
    }

    #[test]
    fn check_renders_single_task_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackgroundManager::new(dir.path().to_path_buf());
        let id = mgr.run("echo hi", Duration::from_secs(5)).unwrap();
        for _ in 0..50 {
            if mgr.check(Some(&id)).contains("Completed") {
                break;
            }
            sleep(Duration::from_millis(50));
        }
        assert!(mgr.check(Some(&id)).contains(&id));
        assert!(mgr.check(Some("nope")).starts_with("Error:"));
    }
}
