//! Two-level context compaction: an in-place micro-compact that runs every
//! round, and a transcript-backed auto-compact that replaces the whole
//! conversation with a summary once it grows past a size threshold.

use std::path::{Path, PathBuf};

use crate::completion::{CompletionClient, CompletionRequest};
use crate::error::AgentResult;
use crate::types::Message;

const TRANSCRIPTS_DIR: &str = ".anuris_transcripts";
const DEFAULT_KEEP_RECENT: usize = 3;
const DEFAULT_TOKEN_THRESHOLD: usize = 50_000;
const OMIT_CONTENT_LEN: usize = 120;
const TRANSCRIPT_PROMPT_CHARS: usize = 120_000;

const SUMMARY_SYSTEM_PROMPT: &str =
    "Summarize the following conversation transcript for an AI coding agent to resume work from. \
     Preserve goals, decisions, file paths and open threads. Be concise.";

pub struct ContextCompactor {
    transcripts_dir: PathBuf,
    keep_recent: usize,
    token_threshold: usize,
}

impl ContextCompactor {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            transcripts_dir: workspace_root.join(TRANSCRIPTS_DIR),
            keep_recent: DEFAULT_KEEP_RECENT,
            token_threshold: DEFAULT_TOKEN_THRESHOLD,
        }
    }

    /// Rough token estimate: JSON-serialized length over 4.
    pub fn estimated_size(&self, messages: &[Message]) -> usize {
        let serialized = serde_json::to_string(messages).unwrap_or_default();
        serialized.len() / 4
    }

    pub fn needs_auto_compact(&self, messages: &[Message]) -> bool {
        self.estimated_size(messages) > self.token_threshold
    }

    /// Rewrite every tool-role message beyond the most recent `keep_recent`
    /// whose content is longer than 120 chars into a placeholder. Runs on
    /// every round; cheap and reversible only in the sense that it discards
    /// detail, never messages.
    pub fn micro_compact(&self, messages: &[Message]) -> Vec<Message> {
        let tool_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == "tool")
            .map(|(i, _)| i)
            .collect();

        if tool_indices.len() <= self.keep_recent {
            return messages.to_vec();
        }

        let keep_from = tool_indices.len() - self.keep_recent;
        let omit_before = tool_indices[keep_from];

        messages
            .iter()
            .enumerate()
            .map(|(i, m)| {
                if m.role == "tool"
                    && i < omit_before
                    && m.content.as_deref().map(|c| c.len()).unwrap_or(0) > OMIT_CONTENT_LEN
                {
                    let mut omitted = m.clone();
                    let id = m.tool_call_id.as_deref().unwrap_or("unknown");
                    omitted.content = Some(format!("[Previous tool output omitted: {id}]"));
                    omitted
                } else {
                    m.clone()
                }
            })
            .collect()
    }

    /// Persist `messages` as a transcript, summarize them via `client`, and
    /// return the replacement three-message skeleton. The transcript is
    /// written before the summarization call so it survives a summarizer
    /// failure.
    pub fn auto_compact(
        &self,
        client: &CompletionClient,
        messages: &[Message],
        focus_hint: Option<&str>,
    ) -> AgentResult<Vec<Message>> {
        let transcript_path = self.write_transcript(messages)?;

        let mut prompt = serde_json::to_string(messages).unwrap_or_default();
        if prompt.len() > TRANSCRIPT_PROMPT_CHARS {
            prompt.truncate(TRANSCRIPT_PROMPT_CHARS);
        }
        if let Some(hint) = focus_hint {
            prompt.push_str("\n\nFocus: ");
            prompt.push_str(hint);
        }

        let request = CompletionRequest {
            messages: vec![Message::system(SUMMARY_SYSTEM_PROMPT), Message::user(prompt)],
            tools: None,
            temperature: None,
            thinking: false,
        };
        let response = client.complete(&request)?;
        let summary = response.content.unwrap_or_default();

        let system_message = messages
            .iter()
            .find(|m| m.role == "system")
            .cloned()
            .unwrap_or_else(|| Message::system("You are a helpful coding agent."));

        Ok(vec![
            system_message,
            Message::user(format!(
                "[Conversation compacted. Transcript: {}]\n{summary}",
                transcript_path.display()
            )),
            Message::assistant(
                Some("Understood. Continuing from compacted context.".to_string()),
                Vec::new(),
            ),
        ])
    }

    fn write_transcript(&self, messages: &[Message]) -> AgentResult<PathBuf> {
        std::fs::create_dir_all(&self.transcripts_dir)
            .map_err(|e| crate::error::AgentError::Unavailable(format!("transcripts dir: {e}")))?;
        let unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = self.transcripts_dir.join(format!("transcript_{unix}.jsonl"));

        let mut contents = String::new();
        for message in messages {
            if let Ok(line) = serde_json::to_string(message) {
                contents.push_str(&line);
                contents.push('\n');
            }
        }
        std::fs::write(&path, contents)
            .map_err(|e| crate::error::AgentError::Unavailable(format!("transcript write: {e}")))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;
    use serde_json::json;

    fn tool_message(id: &str, content: &str) -> Message {
        let mut m = Message::tool(id, content);
        m.content = Some(content.to_string());
        m
    }

    #[test]
    fn micro_compact_leaves_short_tool_messages_alone() {
        let compactor = ContextCompactor::new(Path::new("/tmp"));
        let messages = vec![Message::user("hi"), tool_message("t1", "short")];
        let compacted = compactor.micro_compact(&messages);
        assert_eq!(compacted[1].content.as_deref(), Some("short"));
    }

    #[test]
    fn micro_compact_omits_old_long_tool_messages_beyond_keep_recent() {
        let compactor = ContextCompactor::new(Path::new("/tmp"));
        let long_content = "x".repeat(200);
        let mut messages = vec![Message::user("start")];
        for i in 0..5 {
            messages.push(tool_message(&format!("t{i}"), &long_content));
        }
        let compacted = compactor.micro_compact(&messages);

        // Only the 2 oldest tool messages (5 total - 3 kept) are omitted.
        let tool_msgs: Vec<&Message> = compacted.iter().filter(|m| m.role == "tool").collect();
        assert!(tool_msgs[0].content.as_deref().unwrap().starts_with("[Previous tool output omitted: t0]"));
        assert!(tool_msgs[1].content.as_deref().unwrap().starts_with("[Previous tool output omitted: t1]"));
        assert_eq!(tool_msgs[2].content.as_deref(), Some(long_content.as_str()));
        assert_eq!(tool_msgs[3].content.as_deref(), Some(long_content.as_str()));
        assert_eq!(tool_msgs[4].content.as_deref(), Some(long_content.as_str()));
    }

    #[test]
    fn needs_auto_compact_reacts_to_estimated_size() {
        let compactor = ContextCompactor::new(Path::new("/tmp"));
        let small = vec![Message::user("hi")];
        assert!(!compactor.needs_auto_compact(&small));

        let mut big = Vec::new();
        for _ in 0..5000 {
            big.push(Message::user("x".repeat(50)));
        }
        assert!(compactor.needs_auto_compact(&big));
    }

    #[test]
    fn write_transcript_persists_one_line_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let compactor = ContextCompactor::new(dir.path());
        let messages = vec![
            Message::system("sys"),
            Message::user("hello"),
            Message::assistant(Some("hi".to_string()), vec![ToolCall {
                id: "t1".into(),
                name: "bash".into(),
                arguments: json!({}),
            }]),
        ];
        let path = compactor.write_transcript(&messages).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }
}
