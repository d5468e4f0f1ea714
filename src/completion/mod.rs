//! Provider-agnostic chat completion client.
//!
//! Wraps a blocking [`reqwest`] client with base-URL normalization, provider
//! family detection, proxy resolution from the environment and a
//! "shape-fallback" retry that drops increasingly provider-specific request
//! fields when a server rejects the request shape outright.

pub mod stream;

use crate::error::{AgentError, AgentResult};
use crate::types::{Message, ToolCall};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

/// Coarse classification of the upstream API family, used to decide which
/// optional request fields are safe to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    OpenAi,
    OpenRouter,
    DeepSeek,
    Anthropic,
    Generic,
}

impl ProviderFamily {
    pub fn detect(base_url: &str) -> Self {
        let lower = base_url.to_lowercase();
        if lower.contains("anthropic") {
            ProviderFamily::Anthropic
        } else if lower.contains("openrouter") {
            ProviderFamily::OpenRouter
        } else if lower.contains("deepseek") {
            ProviderFamily::DeepSeek
        } else if lower.contains("api.openai.com") {
            ProviderFamily::OpenAi
        } else {
            ProviderFamily::Generic
        }
    }
}

/// Strip a trailing slash so we can join paths predictably, and append
/// `/v1` when the configured base URL has an empty or root path (e.g.
/// `https://api.openai.com` -> `https://api.openai.com/v1`).
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    let host_and_path = trimmed.splitn(2, "://").nth(1).unwrap_or(trimmed);
    if host_and_path.contains('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

fn extract_host(url: &str) -> String {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    without_scheme
        .split('/')
        .next()
        .unwrap_or("")
        .split('@')
        .next_back()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_string()
}

fn host_matches_no_proxy(host: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }
    let pattern = pattern.trim_start_matches('.');
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

/// Normalize a `socks://` proxy URL to the `socks5://` scheme reqwest expects.
fn normalize_proxy_scheme(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix("socks://") {
        format!("socks5://{rest}")
    } else {
        raw.to_string()
    }
}

/// Resolve the proxy URL to use for `base_url`, honoring an explicit
/// override, then `HTTPS_PROXY`/`ALL_PROXY`, gated by `NO_PROXY`.
pub fn resolve_proxy(explicit: Option<&str>, base_url: &str) -> Option<String> {
    if let Some(p) = explicit {
        return Some(normalize_proxy_scheme(p));
    }

    let host = extract_host(base_url);
    let no_proxy = std::env::var("NO_PROXY")
        .or_else(|_| std::env::var("no_proxy"))
        .unwrap_or_default();
    if no_proxy
        .split(',')
        .any(|entry| host_matches_no_proxy(&host, entry.trim()))
    {
        return None;
    }

    for var in ["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"] {
        if let Ok(v) = std::env::var(var) {
            if !v.is_empty() {
                return Some(normalize_proxy_scheme(&v));
            }
        }
    }
    None
}

/// A single completion request, provider-agnostic.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<Value>>,
    pub temperature: Option<f64>,
    /// Enables DeepSeek's `extra_body.thinking` reasoning toggle. Ignored by
    /// every other provider family.
    pub thinking: bool,
}

/// Result of a single completion call, normalized across provider shapes.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub raw: Value,
}

/// The fields a shape-fallback retry may progressively drop, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FallbackStage {
    Full,
    DroppedExtraBody,
    DroppedTools,
    DroppedTemperature,
}

impl FallbackStage {
    fn next(self) -> Option<FallbackStage> {
        match self {
            FallbackStage::Full => Some(FallbackStage::DroppedExtraBody),
            FallbackStage::DroppedExtraBody => Some(FallbackStage::DroppedTools),
            FallbackStage::DroppedTools => Some(FallbackStage::DroppedTemperature),
            FallbackStage::DroppedTemperature => None,
        }
    }
}

pub struct CompletionClient {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    family: ProviderFamily,
}

impl CompletionClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        proxy: Option<&str>,
    ) -> AgentResult<Self> {
        let base_url = normalize_base_url(base_url);
        let family = ProviderFamily::detect(&base_url);
        debug!(?family, %base_url, "resolved provider family");
        let resolved_proxy = resolve_proxy(proxy, &base_url);

        let mut builder = reqwest::blocking::Client::builder().timeout(Duration::from_secs(120));
        if let Some(p) = resolved_proxy {
            let proxy = reqwest::Proxy::all(&p)
                .map_err(|e| AgentError::Provider(format!("invalid proxy '{p}': {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| AgentError::Provider(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            model: model.to_string(),
            family,
        })
    }

    pub fn family(&self) -> ProviderFamily {
        self.family
    }

    fn endpoint(&self) -> String {
        match self.family {
            ProviderFamily::Anthropic => format!("{}/messages", self.base_url),
            _ => format!("{}/chat/completions", self.base_url),
        }
    }

    fn build_body(&self, req: &CompletionRequest, stage: FallbackStage) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                let mut obj = json!({ "role": m.role });
                if let Some(content) = &m.content {
                    obj["content"] = json!(content);
                }
                if !m.tool_calls.is_empty() {
                    obj["tool_calls"] = json!(m
                        .tool_calls
                        .iter()
                        .map(|tc| json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.name, "arguments": tc.arguments.to_string() },
                        }))
                        .collect::<Vec<_>>());
                }
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(id);
                }
                obj
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });

        if stage != FallbackStage::DroppedTools && stage != FallbackStage::DroppedTemperature {
            if let Some(tools) = &req.tools {
                if !tools.is_empty() {
                    body["tools"] = json!(tools);
                    body["tool_choice"] = json!("auto");
                }
            }
        }

        if stage == FallbackStage::Full {
            if let Some(t) = req.temperature {
                body["temperature"] = json!(t);
            }
        }

        if self.family == ProviderFamily::DeepSeek && stage == FallbackStage::Full {
            let thinking_type = if req.thinking { "enabled" } else { "disabled" };
            body["extra_body"] = json!({ "thinking": { "type": thinking_type } });
        }

        body
    }

    /// Whether a failed request is worth retrying with a reduced body shape.
    /// Never retries auth-flavored failures (401/403) or anything outside
    /// the 400/415/422 class.
    fn is_retriable_shape_error(status: u16, body_text: &str) -> bool {
        if status == 401 || status == 403 {
            return false;
        }
        if !matches!(status, 400 | 415 | 422) {
            return false;
        }
        let lower = body_text.to_lowercase();
        !(lower.contains("api key")
            || lower.contains("unauthorized")
            || lower.contains("invalid_api_key")
            || lower.contains("forbidden")
            || lower.contains("quota")
            || lower.contains("rate limit"))
    }

    /// Execute the completion, retrying with a progressively reduced body
    /// shape if the server rejects the request outright.
    pub fn complete(&self, req: &CompletionRequest) -> AgentResult<CompletionResponse> {
        let mut stage = FallbackStage::Full;
        loop {
            let body = self.build_body(req, stage);
            let mut builder = self.client.post(self.endpoint()).json(&body);
            builder = match self.family {
                ProviderFamily::Anthropic => {
                    builder.header("x-api-key", self.api_key.clone().unwrap_or_default())
                }
                _ => builder.bearer_auth(self.api_key.clone().unwrap_or_default()),
            };

            let response = builder
                .send()
                .map_err(|e| AgentError::Provider(format!("request failed: {e}")))?;
            let status = response.status();

            if status.is_success() {
                let raw: Value = response
                    .json()
                    .map_err(|e| AgentError::Provider(format!("invalid json response: {e}")))?;
                return Ok(Self::parse_response(&raw));
            }

            let body_text = response.text().unwrap_or_default();
            if Self::is_retriable_shape_error(status.as_u16(), &body_text) {
                if let Some(next_stage) = stage.next() {
                    debug!(%status, ?stage, ?next_stage, "retrying with a reduced request shape");
                    stage = next_stage;
                    continue;
                }
            }
            error!(%status, body = %body_text, "provider rejected completion request");
            return Err(AgentError::Provider(format!(
                "provider returned {status}: {body_text}"
            )));
        }
    }

    fn parse_response(raw: &Value) -> CompletionResponse {
        // Anthropic shape: top-level `content` array of blocks.
        if let Some(blocks) = raw.get("content").and_then(|c| c.as_array()) {
            let mut text = String::new();
            let mut thinking = String::new();
            let mut tool_calls = Vec::new();
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            text.push_str(t);
                        }
                    }
                    Some("thinking") => {
                        if let Some(t) = block.get("thinking").and_then(|t| t.as_str()) {
                            thinking.push_str(t);
                        }
                    }
                    Some("tool_use") => {
                        tool_calls.push(ToolCall {
                            id: block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            arguments: block.get("input").cloned().unwrap_or(json!({})),
                        });
                    }
                    _ => {}
                }
            }
            return CompletionResponse {
                content: if text.is_empty() { None } else { Some(text) },
                reasoning_content: if thinking.is_empty() { None } else { Some(thinking) },
                tool_calls,
                raw: raw.clone(),
            };
        }

        // OpenAI-style shape: `choices[0].message`.
        let message = raw
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|c| c.get("message"))
            .cloned()
            .unwrap_or(json!({}));

        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let reasoning_content = message
            .get("reasoning_content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let function = tc.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let arguments_str = function.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                        let arguments =
                            serde_json::from_str(arguments_str).unwrap_or(json!({}));
                        Some(ToolCall {
                            id: tc.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                            name,
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        CompletionResponse {
            content,
            reasoning_content,
            tool_calls,
            raw: raw.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_provider_family_from_base_url() {
        assert_eq!(
            ProviderFamily::detect("https://api.deepseek.com/v1"),
            ProviderFamily::DeepSeek
        );
        assert_eq!(
            ProviderFamily::detect("https://api.anthropic.com/v1"),
            ProviderFamily::Anthropic
        );
        assert_eq!(
            ProviderFamily::detect("https://openrouter.ai/api/v1"),
            ProviderFamily::OpenRouter
        );
        assert_eq!(
            ProviderFamily::detect("https://api.openai.com/v1"),
            ProviderFamily::OpenAi
        );
        assert_eq!(
            ProviderFamily::detect("https://my-custom-gateway.internal/v1"),
            ProviderFamily::Generic
        );
    }

    #[test]
    fn normalize_strips_trailing_slash() {
        assert_eq!(normalize_base_url("https://example.com/v1/"), "https://example.com/v1");
    }

    #[test]
    fn normalize_appends_v1_for_empty_or_root_path() {
        assert_eq!(normalize_base_url("https://api.openai.com"), "https://api.openai.com/v1");
        assert_eq!(normalize_base_url("https://api.openai.com/"), "https://api.openai.com/v1");
        assert_eq!(normalize_base_url("https://openrouter.ai/api/v1"), "https://openrouter.ai/api/v1");
    }

    #[test]
    fn socks_scheme_is_normalized_to_socks5() {
        assert_eq!(
            resolve_proxy(Some("socks://localhost:1080"), "https://api.deepseek.com/v1"),
            Some("socks5://localhost:1080".to_string())
        );
    }

    #[test]
    fn explicit_proxy_wins_over_no_proxy() {
        assert_eq!(
            resolve_proxy(Some("http://proxy:8080"), "https://api.deepseek.com/v1"),
            Some("http://proxy:8080".to_string())
        );
    }

    #[test]
    fn fallback_stage_sequence_terminates() {
        let mut stage = FallbackStage::Full;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn shape_error_is_not_retried_for_auth_failures() {
        assert!(!CompletionClient::is_retriable_shape_error(401, "unauthorized"));
        assert!(!CompletionClient::is_retriable_shape_error(403, "invalid_api_key"));
        assert!(CompletionClient::is_retriable_shape_error(400, "unsupported field: extra_body"));
    }

    #[test]
    fn shape_error_is_not_retried_for_forbidden_quota_or_rate_limit() {
        assert!(!CompletionClient::is_retriable_shape_error(400, "forbidden"));
        assert!(!CompletionClient::is_retriable_shape_error(400, "quota exceeded"));
        assert!(!CompletionClient::is_retriable_shape_error(400, "rate limit exceeded"));
    }

    #[test]
    fn deepseek_request_always_carries_a_thinking_toggle() {
        let client = CompletionClient::new("https://api.deepseek.com/v1", None, "deepseek-chat", None).unwrap();
        let req = CompletionRequest { thinking: true, ..Default::default() };
        let body = client.build_body(&req, FallbackStage::Full);
        assert_eq!(body["extra_body"]["thinking"]["type"], "enabled");

        let req = CompletionRequest { thinking: false, ..Default::default() };
        let body = client.build_body(&req, FallbackStage::Full);
        assert_eq!(body["extra_body"]["thinking"]["type"], "disabled");
    }

    #[test]
    fn non_deepseek_request_never_carries_extra_body() {
        let client = CompletionClient::new("https://api.openai.com/v1", None, "gpt-4o-mini", None).unwrap();
        let req = CompletionRequest { thinking: true, ..Default::default() };
        let body = client.build_body(&req, FallbackStage::Full);
        assert!(body.get("extra_body").is_none());
    }

    #[test]
    fn parses_openai_style_response() {
        let raw = json!({
            "choices": [{
                "message": { "content": "hello", "tool_calls": [] }
            }]
        });
        let parsed = CompletionClient::parse_response(&raw);
        assert_eq!(parsed.content.as_deref(), Some("hello"));
        assert!(parsed.tool_calls.is_empty());
    }

    #[test]
    fn parses_anthropic_style_response_with_tool_use() {
        let raw = json!({
            "content": [
                { "type": "text", "text": "checking" },
                { "type": "tool_use", "id": "t1", "name": "bash", "input": { "command": "ls" } }
            ]
        });
        let parsed = CompletionClient::parse_response(&raw);
        assert_eq!(parsed.content.as_deref(), Some("checking"));
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "bash");
    }
}
