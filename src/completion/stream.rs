//! Streaming response parser.
//!
//! Consumes provider chunks one at a time (OpenAI-style `choices[0].delta` or
//! Anthropic-style SSE events) and folds them into a single `(text,
//! reasoning)` pair, splitting out inline `<think>...</think>` tags as
//! reasoning regardless of which provider emitted them.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Accumulated output of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamResult {
    pub full_response: String,
    pub reasoning_content: String,
    pub interrupted: bool,
}

/// Length of the longest suffix of `haystack` that is also a proper prefix
/// of `tag` — i.e. how much of `haystack`'s tail could still grow into `tag`
/// if the next chunk supplies the rest. `tag` is ASCII, so a byte match can
/// only start at a character boundary of `haystack`.
fn partial_tag_tail_len(haystack: &str, tag: &str) -> usize {
    let max_k = tag.len().saturating_sub(1).min(haystack.len());
    (1..=max_k)
        .rev()
        .find(|&k| haystack.ends_with(&tag[..k]))
        .unwrap_or(0)
}

/// A cooperative cancellation flag a caller can flip from another thread to
/// stop mid-stream consumption, standing in for the reference
/// implementation's `KeyboardInterrupt` handling.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Folds a sequence of provider stream chunks into final answer text and
/// reasoning text, handling inline `<think>` tags transparently.
#[derive(Debug, Default)]
pub struct StreamParser {
    full_response: String,
    reasoning_content: String,
    in_think_tag: bool,
    buffered_content: String,
    reasoning_detail_prefixes: std::collections::HashMap<usize, String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded JSON chunk. Detects OpenAI-delta shape first, then
    /// falls back to Anthropic event shape.
    pub fn feed(&mut self, chunk: &Value) {
        if let Some(delta) = Self::extract_openai_delta(chunk) {
            if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                if !reasoning.is_empty() {
                    self.append_reasoning(reasoning);
                }
            }
            if let Some(details) = delta.get("reasoning_details").and_then(|v| v.as_array()) {
                self.process_reasoning_details(details);
            }
            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                if !content.is_empty() {
                    self.process_content_delta(content);
                }
            }
            return;
        }
        self.process_anthropic_chunk(chunk);
    }

    /// Feed a raw pre-decoded text chunk directly (bypassing any provider
    /// envelope) — used by callers that have already unwrapped the delta.
    pub fn feed_text(&mut self, content: &str) {
        if !content.is_empty() {
            self.process_content_delta(content);
        }
    }

    /// Flush whatever is left in the buffer (no more chunks are coming, so a
    /// partial tag prefix can no longer complete) and return the final result.
    pub fn finish(mut self, interrupted: bool) -> StreamResult {
        if !self.buffered_content.is_empty() {
            let buffered = std::mem::take(&mut self.buffered_content);
            if self.in_think_tag {
                self.append_reasoning(&buffered);
            } else {
                self.append_answer(&buffered);
            }
        }
        StreamResult {
            full_response: self.full_response,
            reasoning_content: self.reasoning_content,
            interrupted,
        }
    }

    /// Consume an iterator of raw SSE lines (`data: {...}` / `data: [DONE]`),
    /// stopping early if `cancel` is flipped.
    pub fn consume_sse<I: Iterator<Item = String>>(mut self, lines: I, cancel: &CancelToken) -> StreamResult {
        for line in lines {
            if cancel.is_cancelled() {
                return self.finish(true);
            }
            let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                continue;
            };
            if data == "[DONE]" {
                break;
            }
            let Ok(value) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            self.feed(&value);
        }
        self.finish(false)
    }

    /// Fold a content delta into the buffer and drain as many complete
    /// `<think>`/`</think>` transitions out of it as it can find. Whatever is
    /// left over is either flushed outright or, if it could still be the
    /// start of a tag split across the next chunk boundary, held back in
    /// `buffered_content` until more text arrives.
    fn process_content_delta(&mut self, content: &str) {
        self.buffered_content.push_str(content);

        loop {
            let tag = if self.in_think_tag { "</think>" } else { "<think>" };
            if let Some(pos) = self.buffered_content.find(tag) {
                let pre = self.buffered_content[..pos].to_string();
                if !pre.is_empty() {
                    if self.in_think_tag {
                        self.append_reasoning(&pre);
                    } else {
                        self.append_answer(&pre);
                    }
                }
                self.in_think_tag = !self.in_think_tag;
                self.buffered_content = self.buffered_content[pos + tag.len()..].to_string();
                continue;
            }

            // No complete tag in the running buffer: flush everything except
            // a trailing suffix that could still grow into `tag` once the
            // next chunk arrives.
            let tail_len = partial_tag_tail_len(&self.buffered_content, tag);
            let split_at = self.buffered_content.len() - tail_len;
            let flushed = self.buffered_content[..split_at].to_string();
            self.buffered_content = self.buffered_content[split_at..].to_string();
            if !flushed.is_empty() {
                if self.in_think_tag {
                    self.append_reasoning(&flushed);
                } else {
                    self.append_answer(&flushed);
                }
            }
            break;
        }
    }

    fn append_reasoning(&mut self, text: &str) {
        self.reasoning_content.push_str(text);
    }

    fn append_answer(&mut self, text: &str) {
        self.full_response.push_str(text);
    }

    fn extract_openai_delta(chunk: &Value) -> Option<Value> {
        chunk
            .get("choices")?
            .as_array()?
            .first()?
            .get("delta")
            .cloned()
    }

    fn process_anthropic_chunk(&mut self, chunk: &Value) {
        let event_type = chunk.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match event_type {
            "content_block_start" => {
                if let Some(block) = chunk.get("content_block") {
                    self.process_anthropic_block(block);
                }
            }
            "content_block_delta" => {
                if let Some(delta) = chunk.get("delta") {
                    self.process_anthropic_delta(delta);
                }
            }
            "message_start" => {
                if let Some(blocks) = chunk
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_array())
                {
                    for block in blocks {
                        self.process_anthropic_block(block);
                    }
                }
            }
            _ => {
                if let Some(delta) = chunk.get("delta") {
                    self.process_anthropic_delta(delta);
                }
            }
        }
    }

    fn process_anthropic_block(&mut self, block: &Value) {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        self.process_content_delta(text);
                    }
                }
            }
            Some("thinking") | Some("redacted_thinking") => {
                let thinking = block
                    .get("thinking")
                    .or_else(|| block.get("text"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if !thinking.is_empty() {
                    self.append_reasoning(thinking);
                }
            }
            _ => {}
        }
    }

    fn process_anthropic_delta(&mut self, delta: &Value) {
        match delta.get("type").and_then(|v| v.as_str()) {
            Some("text_delta") => {
                if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        self.process_content_delta(text);
                    }
                }
            }
            Some("thinking_delta") | Some("signature_delta") => {
                let thinking = delta
                    .get("thinking")
                    .or_else(|| delta.get("text"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if !thinking.is_empty() {
                    self.append_reasoning(thinking);
                }
            }
            _ => {}
        }
    }

    fn process_reasoning_details(&mut self, details: &[Value]) {
        for (index, detail) in details.iter().enumerate() {
            let text = detail.get("text").and_then(|v| v.as_str()).unwrap_or("");
            if text.is_empty() {
                continue;
            }
            let previous = self
                .reasoning_detail_prefixes
                .get(&index)
                .cloned()
                .unwrap_or_default();
            let delta_text = text.strip_prefix(previous.as_str()).unwrap_or(text);
            self.reasoning_detail_prefixes
                .insert(index, text.to_string());
            if !delta_text.is_empty() {
                self.append_reasoning(delta_text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed_chunks(chunks: &[&str]) -> StreamResult {
        let mut parser = StreamParser::new();
        for c in chunks {
            parser.feed_text(c);
        }
        parser.finish(false)
    }

    #[test]
    fn splits_think_tag_regardless_of_chunking() {
        let whole = feed_chunks(&["Hello <think>secret</think>World"]);
        assert_eq!(whole.full_response, "Hello World");
        assert_eq!(whole.reasoning_content, "secret");

        let chunked = feed_chunks(&["Hello ", "<think>", "secret", "</think>", "World"]);
        assert_eq!(chunked.full_response, "Hello World");
        assert_eq!(chunked.reasoning_content, "secret");

        let mid_split = feed_chunks(&["Hello <th", "ink>sec", "ret</th", "ink>World"]);
        assert_eq!(mid_split.full_response, "Hello World");
        assert_eq!(mid_split.reasoning_content, "secret");
    }

    #[test]
    fn plain_text_with_no_think_tag_passes_through() {
        let result = feed_chunks(&["just ", "an ", "answer"]);
        assert_eq!(result.full_response, "just an answer");
        assert!(result.reasoning_content.is_empty());
    }

    #[test]
    fn think_tag_split_one_character_at_a_time() {
        let text = "Hello <think>secret</think>World";
        let chunks: Vec<&str> = text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
        let result = feed_chunks(&chunks);
        assert_eq!(result.full_response, "Hello World");
        assert_eq!(result.reasoning_content, "secret");
    }

    #[test]
    fn unterminated_think_tag_is_flushed_as_reasoning_on_finish() {
        let result = feed_chunks(&["before ", "<think>", "trailing thought"]);
        assert_eq!(result.full_response, "before ");
        assert_eq!(result.reasoning_content, "trailing thought");
    }

    #[test]
    fn openai_delta_with_reasoning_content() {
        let mut parser = StreamParser::new();
        parser.feed(&json!({"choices":[{"delta":{"reasoning_content":"thinking..."}}]}));
        parser.feed(&json!({"choices":[{"delta":{"content":"hi"}}]}));
        let result = parser.finish(false);
        assert_eq!(result.reasoning_content, "thinking...");
        assert_eq!(result.full_response, "hi");
    }

    #[test]
    fn reasoning_details_emit_only_suffix_of_running_prefix() {
        let mut parser = StreamParser::new();
        parser.feed(&json!({"choices":[{"delta":{"reasoning_details":[{"text":"ab"}]}}]}));
        parser.feed(&json!({"choices":[{"delta":{"reasoning_details":[{"text":"abc"}]}}]}));
        parser.feed(&json!({"choices":[{"delta":{"reasoning_details":[{"text":"abcd"}]}}]}));
        let result = parser.finish(false);
        assert_eq!(result.reasoning_content, "abcd");
    }

    #[test]
    fn anthropic_content_block_and_delta_events() {
        let mut parser = StreamParser::new();
        parser.feed(&json!({"type":"content_block_start","content_block":{"type":"text","text":"Hel"}}));
        parser.feed(&json!({"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}));
        parser.feed(&json!({"type":"content_block_delta","delta":{"type":"thinking_delta","thinking":"hmm"}}));
        let result = parser.finish(false);
        assert_eq!(result.full_response, "Hello");
        assert_eq!(result.reasoning_content, "hmm");
    }

    #[test]
    fn message_start_event_seeds_existing_blocks() {
        let mut parser = StreamParser::new();
        parser.feed(&json!({
            "type": "message_start",
            "message": { "content": [{"type": "text", "text": "preamble"}] }
        }));
        let result = parser.finish(false);
        assert_eq!(result.full_response, "preamble");
    }

    #[test]
    fn cancellation_returns_partial_result() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let lines = vec!["data: {\"choices\":[{\"delta\":{\"content\":\"never seen\"}}]}".to_string()];
        let result = StreamParser::new().consume_sse(lines.into_iter(), &cancel);
        assert!(result.interrupted);
        assert!(result.full_response.is_empty());
    }

    #[test]
    fn sse_stream_parses_done_sentinel() {
        let cancel = CancelToken::new();
        let lines = vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}".to_string(),
            "data: [DONE]".to_string(),
        ];
        let result = StreamParser::new().consume_sse(lines.into_iter(), &cancel);
        assert_eq!(result.full_response, "hi");
        assert!(!result.interrupted);
    }
}
