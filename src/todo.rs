//! In-memory todo board backing the `TodoWrite` tool.
//!
//! Each call overwrites the whole list; the board never merges diffs. State
//! lives in process memory only and is not shared across teammates.

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

const MAX_ITEMS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    fn marker(self) -> &'static str {
        match self {
            TodoStatus::Pending => "[ ]",
            TodoStatus::InProgress => "[>]",
            TodoStatus::Completed => "[x]",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
    #[serde(default)]
    pub active_form: String,
}

/// Raw wire shape accepted from the model: `content` with a `text` fallback,
/// and `activeForm` defaulting to `content` when omitted.
#[derive(Debug, Clone, Deserialize)]
struct RawTodoItem {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    text: Option<String>,
    status: TodoStatus,
    #[serde(default, rename = "activeForm")]
    active_form: Option<String>,
}

#[derive(Debug, Default)]
pub struct TodoManager {
    items: Vec<TodoItem>,
}

impl TodoManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    /// Validate and parse raw JSON `items`, then overwrite the board on
    /// success. Returns the rendered board text.
    pub fn write(&mut self, items_json: &serde_json::Value) -> AgentResult<String> {
        let raw: Vec<RawTodoItem> = serde_json::from_value(items_json.clone())
            .map_err(|e| AgentError::InvalidInput(format!("invalid todo items: {e}")))?;

        if raw.len() > MAX_ITEMS {
            return Err(AgentError::InvalidInput(format!(
                "todo list exceeds maximum of {MAX_ITEMS} items"
            )));
        }

        let mut in_progress_count = 0;
        let mut parsed = Vec::with_capacity(raw.len());
        for item in raw {
            let content = item
                .content
                .or(item.text)
                .ok_or_else(|| AgentError::InvalidInput("todo item requires 'content'".into()))?;
            if content.trim().is_empty() {
                return Err(AgentError::InvalidInput(
                    "todo item content must not be empty".into(),
                ));
            }

            if item.status == TodoStatus::InProgress {
                in_progress_count += 1;
            }

            let active_form = match item.active_form {
                Some(f) if !f.is_empty() => f,
                _ if item.status == TodoStatus::InProgress => {
                    return Err(AgentError::InvalidInput(
                        "in_progress todo item requires a non-empty activeForm".into(),
                    ))
                }
                _ => content.clone(),
            };

            parsed.push(TodoItem {
                content,
                status: item.status,
                active_form,
            });
        }

        if in_progress_count > 1 {
            return Err(AgentError::InvalidInput(
                "at most one todo item may be in_progress".into(),
            ));
        }

        self.items = parsed;
        Ok(self.render())
    }

    pub fn render(&self) -> String {
        let completed = self
            .items
            .iter()
            .filter(|i| i.status == TodoStatus::Completed)
            .count();

        let mut lines: Vec<String> = self
            .items
            .iter()
            .map(|item| {
                let mut line = format!("{} {}", item.status.marker(), item.content);
                if item.status == TodoStatus::InProgress {
                    line.push_str(" <- ");
                    line.push_str(&item.active_form);
                }
                line
            })
            .collect();
        lines.push(format!("({completed}/{} completed)", self.items.len()));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overwrite_replaces_entire_list() {
        let mut board = TodoManager::new();
        board
            .write(&json!([{"content": "a", "status": "pending"}]))
            .unwrap();
        assert_eq!(board.items().len(), 1);
        board
            .write(&json!([{"content": "b", "status": "pending"}, {"content": "c", "status": "pending"}]))
            .unwrap();
        assert_eq!(board.items().len(), 2);
    }

    #[test]
    fn rejects_more_than_twenty_items() {
        let mut board = TodoManager::new();
        let items: Vec<_> = (0..21)
            .map(|i| json!({"content": format!("t{i}"), "status": "pending"}))
            .collect();
        let err = board.write(&json!(items)).unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[test]
    fn rejects_more_than_one_in_progress() {
        let mut board = TodoManager::new();
        let err = board
            .write(&json!([
                {"content": "a", "status": "in_progress", "activeForm": "Doing a"},
                {"content": "b", "status": "in_progress", "activeForm": "Doing b"},
            ]))
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[test]
    fn in_progress_without_active_form_is_rejected() {
        let mut board = TodoManager::new();
        let err = board
            .write(&json!([{"content": "a", "status": "in_progress"}]))
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[test]
    fn text_key_falls_back_for_content_and_active_form_defaults() {
        let mut board = TodoManager::new();
        let rendered = board
            .write(&json!([{"text": "write tests", "status": "pending"}]))
            .unwrap();
        assert_eq!(board.items()[0].content, "write tests");
        assert_eq!(board.items()[0].active_form, "write tests");
        assert!(rendered.contains("write tests"));
    }

    #[test]
    fn render_format_matches_spec() {
        let mut board = TodoManager::new();
        let rendered = board
            .write(&json!([
                {"content": "done thing", "status": "completed"},
                {"content": "working thing", "status": "in_progress", "activeForm": "Working on thing"},
                {"content": "todo thing", "status": "pending"},
            ]))
            .unwrap();
        let expected = "[x] done thing\n[>] working thing <- Working on thing\n[ ] todo thing\n(1/3 completed)";
        assert_eq!(rendered, expected);
    }
}
