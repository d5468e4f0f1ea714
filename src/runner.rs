//! Agent Loop Runner: the outer composition that wires the completion
//! client, tool executor and context compactor into a bounded round loop.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;

use crate::attachments::AttachmentManager;
use crate::background::Notification;
use crate::compactor::ContextCompactor;
use crate::completion::{CompletionClient, CompletionRequest};
use crate::config::ResolvedConfig;
use crate::error::{AgentError, AgentResult};
use crate::skills::SkillLoader;
use crate::team::TeamManager;
use crate::tool_executor::{RoleRestriction, Subagent, ToolExecutor, ToolExecutorConfig};
use crate::types::{Message, RunOutcome, StopReason};

const DEFAULT_MAX_ROUNDS: usize = 30;
const MAX_TOOL_OUTPUT_IN_EVENT: usize = 200;

/// Everything needed to construct a [`Runner`].
#[derive(Clone)]
pub struct RunnerConfig {
    pub workspace_root: PathBuf,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub proxy: Option<String>,
    pub temperature: Option<f64>,
    pub reasoning: bool,
    pub system_prompt: Option<String>,
    pub max_rounds: usize,
    pub tools: ToolExecutorConfig,
    /// Role label applied as a [`RoleRestriction`], if any. Subagent children
    /// carry their `agent_type` here so e.g. `Explore` loses write access.
    pub role: Option<String>,
}

impl RunnerConfig {
    pub fn new(workspace_root: PathBuf, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            workspace_root,
            model: model.into(),
            api_key: None,
            base_url: base_url.into(),
            proxy: None,
            temperature: None,
            reasoning: false,
            system_prompt: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            tools: ToolExecutorConfig::full(),
            role: None,
        }
    }

    /// Build a runner config from a resolved, layered config (env > local
    /// config file > global config file > default). See [`ResolvedConfig::resolve`].
    pub fn from_resolved(workspace_root: PathBuf, resolved: &ResolvedConfig) -> Self {
        let mut config = Self::new(workspace_root, resolved.model.clone(), resolved.base_url.clone());
        config.api_key = resolved.api_key.clone();
        config.proxy = resolved.proxy.clone();
        config.temperature = resolved.temperature;
        config.reasoning = resolved.reasoning;
        config.system_prompt = resolved.system_prompt.clone();
        config
    }

    /// The config a `task` tool call builds its child runner from: same
    /// connection details, every higher-level capability disabled, and
    /// `agent_type` carried through as a role restriction (e.g. `Explore`
    /// loses `write_file`/`edit_file`; see [`RoleRestriction::is_read_only`]).
    fn subagent_child(&self, agent_type: &str) -> Self {
        Self {
            workspace_root: self.workspace_root.clone(),
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            proxy: self.proxy.clone(),
            temperature: self.temperature,
            reasoning: self.reasoning,
            system_prompt: self.system_prompt.clone(),
            max_rounds: self.max_rounds,
            tools: ToolExecutorConfig::subagent_child(),
            role: Some(agent_type.to_string()),
        }
    }
}

pub struct Runner {
    config: RunnerConfig,
    client: CompletionClient,
    executor: Arc<ToolExecutor>,
    compactor: ContextCompactor,
    team: Option<Arc<TeamManager>>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> AgentResult<Self> {
        let client = CompletionClient::new(
            &config.base_url,
            config.api_key.clone(),
            &config.model,
            config.proxy.as_deref(),
        )?;

        let mut executor = ToolExecutor::new(config.workspace_root.clone(), config.tools.clone());
        if let Some(role) = &config.role {
            executor = executor.with_role(RoleRestriction::new(role.clone()));
        }

        let team = if config.tools.team {
            let manager = Arc::new(TeamManager::new(&config.workspace_root));
            executor = executor.with_team(Arc::clone(&manager)).with_teammate_connection(
                config.model.clone(),
                config.base_url.clone(),
                config.api_key.clone(),
                config.proxy.clone(),
            );
            Some(manager)
        } else {
            None
        };

        if config.tools.subagent {
            let subagent = SubagentDispatcher {
                parent_config: config.clone(),
            };
            executor = executor.with_subagent(Arc::new(subagent));
        }

        Ok(Self {
            compactor: ContextCompactor::new(&config.workspace_root),
            executor: Arc::new(executor),
            client,
            team,
            config,
        })
    }

    pub fn team(&self) -> Option<&Arc<TeamManager>> {
        self.team.as_ref()
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    fn preamble(&self) -> String {
        let mut capabilities = vec!["file read/write", "shell commands"];
        if self.config.tools.todo {
            capabilities.push("a todo list (TodoWrite)");
        }
        if self.config.tools.subagent {
            capabilities.push("subtask delegation (task)");
        }
        if self.config.tools.task_board {
            capabilities.push("a persistent task board");
        }
        if self.config.tools.skills {
            capabilities.push("a skill catalog (load_skill)");
        }
        if self.config.tools.background {
            capabilities.push("background shell tasks");
        }
        if self.config.tools.team {
            capabilities.push("team operations (spawn/send/shutdown/plan)");
        }

        let mut preamble = format!(
            "You are an autonomous coding agent working in the workspace at {}. \
             Available capabilities: {}.",
            self.config.workspace_root.display(),
            capabilities.join(", "),
        );

        if self.config.tools.skills {
            let skills = SkillLoader::new(&self.config.workspace_root).descriptions();
            if !skills.is_empty() {
                preamble.push_str("\n\nAvailable skills:\n");
                preamble.push_str(&skills.join("\n"));
            }
        }

        if let Some(system_prompt) = &self.config.system_prompt {
            preamble.push_str("\n\n");
            preamble.push_str(system_prompt);
        }
        preamble
    }

    /// Run the round loop to completion (or raise a fatal `AgentError`).
    pub fn run(
        &self,
        mut messages: Vec<Message>,
        attachments: &AttachmentManager,
    ) -> AgentResult<RunOutcome> {
        if messages.is_empty() {
            return Err(AgentError::InvalidInput("invalid messages format".to_string()));
        }

        messages.insert(0, Message::system(self.preamble()));
        fold_attachments_into_last_user_message(&mut messages, attachments);

        let mut tool_events = Vec::new();

        for round in 1..=self.config.max_rounds {
            if let Some(background) = self.executor.background() {
                let notifications = background.drain_notifications();
                if !notifications.is_empty() {
                    splice_background_notifications(&mut messages, &notifications);
                }
            }

            messages = self.compactor.micro_compact(&messages);
            if self.compactor.needs_auto_compact(&messages) {
                messages = self.compactor.auto_compact(&self.client, &messages, None)?;
            }

            let request = CompletionRequest {
                messages: messages.clone(),
                tools: Some(self.executor.schemas()),
                temperature: self.config.temperature,
                thinking: self.config.reasoning,
            };
            let response = self.client.complete(&request)?;

            let mut assistant = Message::assistant(response.content.clone(), response.tool_calls.clone());
            assistant.reasoning_content = response.reasoning_content.clone();
            messages.push(assistant);

            if response.tool_calls.is_empty() {
                return Ok(RunOutcome {
                    stop_reason: StopReason::Done,
                    rounds: round,
                    messages,
                    final_text: response.content,
                    tool_events,
                });
            }

            for call in &response.tool_calls {
                let output = self.executor.execute(&call.name, &call.arguments);
                tool_events.push(format!(
                    "{} -> {}",
                    call.name,
                    truncate(&output, MAX_TOOL_OUTPUT_IN_EVENT)
                ));
                messages.push(Message::tool(call.id.clone(), output));
            }
        }

        error!(max_rounds = self.config.max_rounds, "round loop exhausted without reaching a stop condition");
        Err(AgentError::LoopExhausted(self.config.max_rounds))
    }
}

/// Bridges the `task` tool to a fresh, reduced-capability child runner.
/// `parent_config` is the *caller's* config, unmodified; each `run` builds
/// a child config from it so the resulting capabilities depend on the
/// `agent_type` given at call time, not at dispatcher-construction time.
struct SubagentDispatcher {
    parent_config: RunnerConfig,
}

impl Subagent for SubagentDispatcher {
    fn run(&self, prompt: &str, agent_type: &str) -> AgentResult<String> {
        let runner = Runner::new(self.parent_config.subagent_child(agent_type))?;
        let system = format!("You are a focused subagent of type '{agent_type}'.");
        let outcome = runner.run(
            vec![Message::system(system), Message::user(prompt)],
            &AttachmentManager::new(),
        )?;
        Ok(outcome.final_text.unwrap_or_default())
    }
}

fn fold_attachments_into_last_user_message(messages: &mut [Message], attachments: &AttachmentManager) {
    if attachments.is_empty() {
        return;
    }
    let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == "user") else {
        return;
    };
    let mut content = last_user.content.clone().unwrap_or_default();
    for block in attachments.prepare_for_api() {
        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
            content.push('\n');
            content.push_str(text);
        } else if block.get("type").and_then(|t| t.as_str()) == Some("image_url") {
            content.push_str("\n[image attachment omitted from text-only content]");
        }
    }
    last_user.content = Some(content);
}

fn splice_background_notifications(messages: &mut Vec<Message>, notifications: &[Notification]) {
    let body: String = notifications
        .iter()
        .map(|n| format!("{} [{:?}] {}", n.task_id, n.status, n.result))
        .collect::<Vec<_>>()
        .join("\n");
    messages.push(Message::user(format!("<background-results>\n{body}\n</background-results>")));
    messages.push(Message::assistant(Some("Noted.".to_string()), Vec::new()));
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

    #[test]
    fn preamble_lists_enabled_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig::new(dir.path().to_path_buf(), "gpt-4o-mini", "https://api.openai.com/v1");
        let runner = Runner::new(config).unwrap();
        let preamble = runner.preamble();
        assert!(preamble.contains("todo list"));
        assert!(preamble.contains("team operations"));
    }

    #[test]
    fn empty_messages_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig::new(dir.path().to_path_buf(), "gpt-4o-mini", "https://api.openai.com/v1");
        let runner = Runner::new(config).unwrap();
        let err = runner.run(vec![], &AttachmentManager::new()).unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[test]
    fn subagent_child_config_disables_higher_level_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig::new(dir.path().to_path_buf(), "gpt-4o-mini", "https://api.openai.com/v1");
        let child = config.subagent_child("general-purpose");
        assert!(!child.tools.team);
        assert!(!child.tools.task_board);
        assert!(!child.tools.subagent);
        assert_eq!(child.role.as_deref(), Some("general-purpose"));
    }

    #[test]
    fn explore_subagent_loses_write_and_edit_tools() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig::new(dir.path().to_path_buf(), "gpt-4o-mini", "https://api.openai.com/v1");
        let child = Runner::new(config.subagent_child("Explore")).unwrap();
        let schemas = child.executor.schemas();
        let names: Vec<&str> = schemas
            .iter()
            .filter_map(|s| s.get("function").and_then(|f| f.get("name")).and_then(|n| n.as_str()))
            .collect();
        assert!(!names.contains(&"write_file"));
        assert!(!names.contains(&"edit_file"));

        let general = Runner::new(config.subagent_child("general-purpose")).unwrap();
        let general_names: Vec<&str> = general
            .executor
            .schemas()
            .iter()
            .filter_map(|s| s.get("function").and_then(|f| f.get("name")).and_then(|n| n.as_str()))
            .collect();
        assert!(general_names.contains(&"write_file"));
    }
}
