//! Teammate worker loop: an independent round loop per spawned teammate,
//! running with a restricted tool set and four enforced budgets.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::completion::{CompletionClient, CompletionRequest};
use crate::team::{MemberStatus, TeamManager};
use crate::tool_executor::{RoleRestriction, ToolExecutor, ToolExecutorConfig};
use crate::types::Message;

const DEFAULT_MAX_WALL_CLOCK: Duration = Duration::from_secs(3600);
const DEFAULT_MAX_ROUNDS: usize = 100;
const DEFAULT_MAX_TOOL_CALLS: usize = 200;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct TeammateConfig {
    pub workspace_root: PathBuf,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub proxy: Option<String>,
    pub name: String,
    pub role: String,
    pub max_wall_clock: Duration,
    pub max_rounds: usize,
    pub max_tool_calls: usize,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
}

impl TeammateConfig {
    pub fn new(
        workspace_root: PathBuf,
        model: impl Into<String>,
        base_url: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            workspace_root,
            model: model.into(),
            api_key: None,
            base_url: base_url.into(),
            proxy: None,
            name: name.into(),
            role: role.into(),
            max_wall_clock: DEFAULT_MAX_WALL_CLOCK,
            max_rounds: DEFAULT_MAX_ROUNDS,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Tracks the four budgets checked before every round and every tool call.
struct BudgetTracker {
    started: Instant,
    max_wall_clock: Duration,
    rounds: usize,
    max_rounds: usize,
    tool_calls: usize,
    max_tool_calls: usize,
}

impl BudgetTracker {
    fn new(config: &TeammateConfig) -> Self {
        Self {
            started: Instant::now(),
            max_wall_clock: config.max_wall_clock,
            rounds: 0,
            max_rounds: config.max_rounds,
            tool_calls: 0,
            max_tool_calls: config.max_tool_calls,
        }
    }

    /// `Some(reason)` if any budget has been exceeded.
    fn exceeded(&self) -> Option<String> {
        if self.started.elapsed() >= self.max_wall_clock {
            return Some(format!("wall-clock budget exceeded ({}s)", self.max_wall_clock.as_secs()));
        }
        if self.rounds >= self.max_rounds {
            return Some(format!("round budget exceeded ({})", self.max_rounds));
        }
        if self.tool_calls >= self.max_tool_calls {
            return Some(format!("tool-call budget exceeded ({})", self.max_tool_calls));
        }
        None
    }

    fn record_round(&mut self) {
        self.rounds += 1;
    }

    fn record_tool_call(&mut self) {
        self.tool_calls += 1;
    }
}

/// Spawn a teammate as an independent OS thread. The thread runs until it
/// self-terminates on a budget violation or an idle-timeout with no work.
pub fn spawn(config: TeammateConfig, team: Arc<TeamManager>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || run(config, team))
}

fn auto_stop(team: &TeamManager, name: &str, reason: &str) {
    warn!(teammate = %name, %reason, "teammate auto-stopping on budget exhaustion");
    let _ = team.send_message(name, "lead", &format!("[auto-stop] {reason}"));
    team.set_status(name, MemberStatus::Shutdown);
}

fn run(config: TeammateConfig, team: Arc<TeamManager>) {
    let client = match CompletionClient::new(
        &config.base_url,
        config.api_key.clone(),
        &config.model,
        config.proxy.as_deref(),
    ) {
        Ok(c) => c,
        Err(_) => {
            team.set_status(&config.name, MemberStatus::Error);
            return;
        }
    };

    let executor = ToolExecutor::new(config.workspace_root.clone(), ToolExecutorConfig::teammate())
        .with_team(Arc::clone(&team))
        .with_identity(config.name.clone())
        .with_role(RoleRestriction::new(config.role.clone()));

    let mut budget = BudgetTracker::new(&config);
    let mut messages = vec![Message::system(format!(
        "You are teammate '{}' with role '{}'. Call `idle` when you have no more work, \
         `send_message`/`read_inbox` to talk to lead, and `claim_task` to pick up unblocked work.",
        config.name, config.role
    ))];
    let mut idle = false;

    loop {
        if let Some(reason) = budget.exceeded() {
            auto_stop(&team, &config.name, &reason);
            return;
        }

        if idle {
            match poll_while_idle(&team, &config, &executor) {
                PollOutcome::Resumed(message) => {
                    messages.push(message);
                    idle = false;
                }
                PollOutcome::TimedOut => {
                    team.set_status(&config.name, MemberStatus::Shutdown);
                    return;
                }
            }
            continue;
        }

        let request = CompletionRequest {
            messages: messages.clone(),
            tools: Some(executor.schemas()),
            temperature: None,
            thinking: false,
        };
        let response = match client.complete(&request) {
            Ok(r) => r,
            Err(_) => {
                team.set_status(&config.name, MemberStatus::Error);
                return;
            }
        };
        budget.record_round();

        messages.push(Message::assistant(response.content.clone(), response.tool_calls.clone()));

        if response.tool_calls.is_empty() {
            idle = true;
            team.set_status(&config.name, MemberStatus::Idle);
            continue;
        }

        for call in &response.tool_calls {
            if let Some(reason) = budget.exceeded() {
                auto_stop(&team, &config.name, &reason);
                return;
            }
            if call.name == "idle" {
                idle = true;
                messages.push(Message::tool(call.id.clone(), "(idle)".to_string()));
                continue;
            }
            let output = executor.execute(&call.name, &call.arguments);
            budget.record_tool_call();
            messages.push(Message::tool(call.id.clone(), output));
        }
    }
}

enum PollOutcome {
    Resumed(Message),
    TimedOut,
}

/// Poll the inbox every `poll_interval` up to `idle_timeout`. New inbox
/// messages resume the loop verbatim as a user message; failing that, try
/// claiming an unblocked task before giving up.
fn poll_while_idle(team: &TeamManager, config: &TeammateConfig, executor: &ToolExecutor) -> PollOutcome {
    let started = Instant::now();
    loop {
        let inbox = team.bus().read(&config.name);
        if !inbox.is_empty() {
            let body = serde_json::to_string(&inbox).unwrap_or_default();
            return PollOutcome::Resumed(Message::user(body));
        }

        if let Some(board) = executor.task_board() {
            if let Some(task) = board.claim_next_unblocked(&config.name) {
                return PollOutcome::Resumed(Message::user(format!(
                    "<auto-claimed>Task #{}: {}\n{}</auto-claimed>",
                    task.id, task.subject, task.description
                )));
            }
        }

        if started.elapsed() >= config.idle_timeout {
            return PollOutcome::TimedOut;
        }
        std::thread::sleep(config.poll_interval);
    }
}
