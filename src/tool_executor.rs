//! Tool catalog dispatch: turns a tool name + JSON arguments into a string
//! result, enforcing the workspace-root sandbox and shell safety rules that
//! every handler shares.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::background::BackgroundManager;
use crate::error::{AgentError, AgentResult};
use crate::skills::SkillLoader;
use crate::task_board::{TaskBoard, TaskUpdate};
use crate::team::TeamManager;
use crate::teammate::TeammateConfig;
use crate::todo::TodoManager;

const MAX_OUTPUT_BYTES: usize = 50_000;
const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(300);

const DANGEROUS_SUBSTRINGS: &[&str] = &["rm -rf /", "sudo", "shutdown", "reboot", "> /dev/"];

/// A read-only teammate may still run a narrow allowlist of shell commands.
const READONLY_BASH_ALLOWLIST: &[&str] = &[
    "pwd", "ls", "cat", "head", "tail", "wc", "rg", "find", "sed", "git",
];
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '>', '<', '`', '\n'];

pub fn is_dangerous_command(command: &str) -> bool {
    DANGEROUS_SUBSTRINGS.iter().any(|s| command.contains(s))
}

/// Resolve `rel` against `root`, refusing anything that escapes it. Handles
/// paths that don't exist yet (e.g. a new file to write) by canonicalizing
/// the nearest existing ancestor and rejoining the remaining components.
pub fn resolve_path(root: &Path, rel: &str) -> AgentResult<PathBuf> {
    let root_canon = root
        .canonicalize()
        .map_err(|e| AgentError::Unavailable(format!("workspace root: {e}")))?;

    let joined = root.join(rel);
    let mut existing = joined.clone();
    let mut suffix = PathBuf::new();
    while !existing.exists() {
        let Some(parent) = existing.parent().map(|p| p.to_path_buf()) else {
            break;
        };
        if let Some(name) = existing.file_name() {
            suffix = Path::new(name).join(&suffix);
        }
        existing = parent;
    }

    let existing_canon = existing
        .canonicalize()
        .map_err(|_| AgentError::WorkspaceViolation(rel.to_string()))?;
    let full = existing_canon.join(&suffix);

    if !full.starts_with(&root_canon) {
        return Err(AgentError::WorkspaceViolation(rel.to_string()));
    }
    Ok(full)
}

/// Run `command` under a shell rooted at `workspace_root`, killing it if it
/// runs past `timeout`. Output is stdout+stderr concatenated and trimmed.
pub fn run_shell(workspace_root: &Path, command: &str, timeout: Duration) -> Result<String, String> {
    if is_dangerous_command(command) {
        return Err("Error: Dangerous command blocked".to_string());
    }

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workspace_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Error: failed to spawn command: {e}"))?;

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_status)) => break,
            Ok(None) => {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("Error: Timeout ({}s)", timeout.as_secs()));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(format!("Error: wait failed: {e}")),
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("Error: failed to collect output: {e}"))?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let trimmed = combined.trim();

    if trimmed.is_empty() {
        Ok("(no output)".to_string())
    } else {
        Ok(truncate_bytes(trimmed, MAX_OUTPUT_BYTES))
    }
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Injected capability for the `task` tool: a fresh-context subagent run.
pub trait Subagent: Send + Sync {
    fn run(&self, prompt: &str, agent_type: &str) -> AgentResult<String>;
}

/// Read-only role restriction applied to a teammate's tool set.
pub struct RoleRestriction {
    pub role: String,
}

const READONLY_ROLE_KEYWORDS: &[&str] = &[
    "readonly", "read-only", "review", "reviewer", "qa", "research", "auditor", "observer",
    "explore",
];

impl RoleRestriction {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }

    pub fn is_read_only(&self) -> bool {
        let lower = self.role.to_lowercase();
        READONLY_ROLE_KEYWORDS.iter().any(|k| lower.contains(k))
    }

    fn deny(&self, tool: &str) -> String {
        format!("Error: Role '{}' is read-only; {tool} is blocked", self.role)
    }

    /// Whether a bash command passes the read-only allowlist: no shell
    /// metacharacters, and the leading word (or `git <subcommand>`) is
    /// on the safe list.
    fn bash_allowed(&self, command: &str) -> bool {
        if command.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
            return false;
        }
        let mut words = command.split_whitespace();
        let Some(first) = words.next() else {
            return false;
        };
        if first == "sed" {
            return !command.contains("-i");
        }
        if first == "git" {
            let allowed_sub = ["status", "diff", "log", "show", "branch", "rev-parse"];
            return words.next().map(|s| allowed_sub.contains(&s)).unwrap_or(false);
        }
        READONLY_BASH_ALLOWLIST.contains(&first)
    }
}

/// Feature flags selecting which tools a given executor instance exposes.
#[derive(Debug, Clone, Default)]
pub struct ToolExecutorConfig {
    pub todo: bool,
    pub subagent: bool,
    pub task_board: bool,
    pub skills: bool,
    pub background: bool,
    /// Generic bus access: `send_message` / `read_inbox`.
    pub team: bool,
    /// Lead-only team ops: `spawn_teammate`, `list_teammates`, `broadcast`,
    /// `shutdown_request`, `shutdown_status`, `shutdown_list`, `plan_review`, `plan_list`.
    pub team_lead: bool,
    /// Teammate-only team ops: `shutdown_response`, `plan_submit`.
    pub team_member: bool,
}

impl ToolExecutorConfig {
    pub fn full() -> Self {
        Self {
            todo: true,
            subagent: true,
            task_board: true,
            skills: true,
            background: true,
            team: true,
            team_lead: true,
            team_member: false,
        }
    }

    /// The capability set a subagent child runner is allowed: none of the
    /// higher-level orchestration tools, only file/shell.
    pub fn subagent_child() -> Self {
        Self::default()
    }

    /// The capability set a teammate worker is allowed: file/shell plus
    /// task-board claiming and the member-facing bus ops, but no nested
    /// spawning, skills, background tasks or delegation.
    pub fn teammate() -> Self {
        Self {
            todo: false,
            subagent: false,
            task_board: true,
            skills: false,
            background: false,
            team: true,
            team_lead: false,
            team_member: true,
        }
    }
}

/// The connection details a newly spawned teammate thread needs to build its
/// own [`CompletionClient`](crate::completion::CompletionClient). Stored on
/// the lead's executor so `spawn_teammate` can actually launch a worker
/// instead of only registering a config entry.
#[derive(Clone)]
struct TeammateConnection {
    model: String,
    base_url: String,
    api_key: Option<String>,
    proxy: Option<String>,
}

pub struct ToolExecutor {
    workspace_root: PathBuf,
    config: ToolExecutorConfig,
    todo: Mutex<TodoManager>,
    task_board: Option<TaskBoard>,
    skills: Option<SkillLoader>,
    background: Option<BackgroundManager>,
    subagent: Option<Arc<dyn Subagent>>,
    team: Option<Arc<TeamManager>>,
    teammate_conn: Option<TeammateConnection>,
    role: Option<RoleRestriction>,
    /// This executor's own entity name on the bus, e.g. a teammate's name.
    /// `None` means the executor speaks as "lead".
    self_name: Option<String>,
}

impl ToolExecutor {
    pub fn new(workspace_root: PathBuf, config: ToolExecutorConfig) -> Self {
        let task_board = config.task_board.then(|| TaskBoard::new(&workspace_root));
        let skills = config.skills.then(|| SkillLoader::new(&workspace_root));
        let background = config
            .background
            .then(|| BackgroundManager::new(workspace_root.clone()));
        Self {
            workspace_root,
            config,
            todo: Mutex::new(TodoManager::new()),
            task_board,
            skills,
            background,
            subagent: None,
            team: None,
            teammate_conn: None,
            role: None,
            self_name: None,
        }
    }

    pub fn with_subagent(mut self, subagent: Arc<dyn Subagent>) -> Self {
        self.subagent = Some(subagent);
        self
    }

    pub fn with_team(mut self, team: Arc<TeamManager>) -> Self {
        self.team = Some(team);
        self
    }

    /// Attach the connection details this executor will hand new teammates
    /// so `spawn_teammate` can start their worker thread, not just register
    /// them in the team config.
    pub fn with_teammate_connection(
        mut self,
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        proxy: Option<String>,
    ) -> Self {
        self.teammate_conn = Some(TeammateConnection {
            model: model.into(),
            base_url: base_url.into(),
            api_key,
            proxy,
        });
        self
    }

    pub fn with_role(mut self, role: RoleRestriction) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_identity(mut self, name: impl Into<String>) -> Self {
        self.self_name = Some(name.into());
        self
    }

    pub fn background(&self) -> Option<&BackgroundManager> {
        self.background.as_ref()
    }

    pub fn task_board(&self) -> Option<&TaskBoard> {
        self.task_board.as_ref()
    }

    pub fn todo_render(&self) -> String {
        self.todo.lock().unwrap().render()
    }

    /// JSON-Schema-ish function descriptions for every tool this instance
    /// exposes, honoring feature flags and role restrictions.
    pub fn schemas(&self) -> Vec<Value> {
        let mut tools = vec![
            function_schema("bash", "Run a shell command in the workspace.", json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"],
            })),
            function_schema("read_file", "Read a file from the workspace.", json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "max_lines": { "type": "integer" },
                },
                "required": ["path"],
            })),
        ];

        let read_only = self.role.as_ref().map(|r| r.is_read_only()).unwrap_or(false);
        if !read_only {
            tools.push(function_schema("write_file", "Write a file in the workspace.", json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                },
                "required": ["path", "content"],
            })));
            tools.push(function_schema("edit_file", "Replace the first occurrence of text in a file.", json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_text": { "type": "string" },
                    "new_text": { "type": "string" },
                },
                "required": ["path", "old_text", "new_text"],
            })));
        }

        if self.config.todo {
            tools.push(function_schema("TodoWrite", "Overwrite the current todo list.", json!({
                "type": "object",
                "properties": { "items": { "type": "array" } },
                "required": ["items"],
            })));
        }

        if self.config.subagent {
            tools.push(function_schema("task", "Delegate a subtask to a fresh-context subagent.", json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string" },
                    "agent_type": { "type": "string" },
                },
                "required": ["prompt"],
            })));
        }

        if self.config.task_board {
            tools.push(function_schema("task_create", "Create a persistent task.", json!({
                "type": "object",
                "properties": {
                    "subject": { "type": "string" },
                    "description": { "type": "string" },
                },
                "required": ["subject"],
            })));
            tools.push(function_schema("task_get", "Fetch a persistent task by id.", json!({
                "type": "object",
                "properties": { "task_id": { "type": "integer" } },
                "required": ["task_id"],
            })));
            tools.push(function_schema("task_update", "Update a persistent task.", json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "integer" },
                    "status": { "type": "string" },
                    "owner": { "type": "string" },
                    "add_blocked_by": { "type": "array" },
                    "add_blocks": { "type": "array" },
                },
                "required": ["task_id"],
            })));
            tools.push(function_schema("task_list", "List every persistent task.", json!({
                "type": "object",
                "properties": {},
            })));
            tools.push(function_schema("claim_task", "Claim a persistent task.", json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "integer" },
                    "owner": { "type": "string" },
                },
                "required": ["task_id"],
            })));
        }

        if self.config.skills {
            tools.push(function_schema("load_skill", "Load a skill by name.", json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"],
            })));
        }

        if self.config.background {
            tools.push(function_schema("background_run", "Run a shell command in the background.", json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "timeout": { "type": "integer" },
                },
                "required": ["command"],
            })));
            tools.push(function_schema("check_background", "Check background task status.", json!({
                "type": "object",
                "properties": { "task_id": { "type": "string" } },
            })));
        }

        if self.config.team {
            tools.push(function_schema("send_message", "Send a message to a teammate.", json!({
                "type": "object",
                "properties": {"to": {"type": "string"}, "content": {"type": "string"}},
                "required": ["to", "content"],
            })));
            tools.push(function_schema("read_inbox", "Read and drain an inbox.", json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
            })));
        }

        if self.config.team_lead {
            for (name, description, properties, required) in [
                ("spawn_teammate", "Spawn a new teammate worker.", json!({"name": {"type": "string"}, "role": {"type": "string"}}), vec!["name"]),
                ("list_teammates", "List current teammates.", json!({}), vec![]),
                ("broadcast", "Broadcast a message to every teammate.", json!({"content": {"type": "string"}}), vec!["content"]),
                ("shutdown_request", "Request a teammate shut down.", json!({"target": {"type": "string"}}), vec!["target"]),
                ("shutdown_status", "Check a shutdown request's status.", json!({"request_id": {"type": "string"}}), vec!["request_id"]),
                ("shutdown_list", "List all shutdown requests.", json!({}), vec![]),
                ("plan_review", "Approve or reject a submitted plan.", json!({"request_id": {"type": "string"}, "approve": {"type": "boolean"}, "feedback": {"type": "string"}}), vec!["request_id", "approve"]),
                ("plan_list", "List all plan requests.", json!({}), vec![]),
            ] {
                tools.push(function_schema(name, description, json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                })));
            }
        }

        if self.config.team_member {
            tools.push(function_schema("shutdown_response", "Respond to a pending shutdown request.", json!({
                "type": "object",
                "properties": {
                    "request_id": {"type": "string"},
                    "approve": {"type": "boolean"},
                    "reason": {"type": "string"},
                },
                "required": ["request_id", "approve"],
            })));
            tools.push(function_schema("plan_submit", "Submit a plan to lead for approval.", json!({
                "type": "object",
                "properties": {"plan": {"type": "string"}},
                "required": ["plan"],
            })));
            tools.push(function_schema("idle", "Signal end of active work and enter idle polling.", json!({
                "type": "object",
                "properties": {},
            })));
        }

        tools
    }

    /// Dispatch a single tool call. Never returns an `Err` path to the
    /// caller — every failure is folded into an `Error: ...` result string
    /// so the agent loop can keep going.
    pub fn execute(&self, name: &str, args: &Value) -> String {
        let result = match name {
            "bash" => self.tool_bash(args),
            "read_file" => self.tool_read_file(args),
            "write_file" => self.tool_write_file(args),
            "edit_file" => self.tool_edit_file(args),
            "TodoWrite" => self.tool_todo_write(args),
            "task" => self.tool_task(args),
            "task_create" => self.tool_task_create(args),
            "task_get" => self.tool_task_get(args),
            "task_update" => self.tool_task_update(args),
            "task_list" => self.tool_task_list(),
            "claim_task" => self.tool_claim_task(args),
            "load_skill" => self.tool_load_skill(args),
            "background_run" => self.tool_background_run(args),
            "check_background" => self.tool_check_background(args),
            "spawn_teammate" => self.tool_spawn_teammate(args),
            "list_teammates" => self.tool_list_teammates(),
            "send_message" => self.tool_send_message(args),
            "read_inbox" => self.tool_read_inbox(args),
            "broadcast" => self.tool_broadcast(args),
            "shutdown_request" => self.tool_shutdown_request(args),
            "shutdown_response" => self.tool_shutdown_response(args),
            "shutdown_status" => self.tool_shutdown_status(args),
            "shutdown_list" => self.tool_shutdown_list(),
            "plan_submit" => self.tool_plan_submit(args),
            "plan_review" => self.tool_plan_review(args),
            "plan_list" => self.tool_plan_list(),
            "idle" => Ok("(idle)".to_string()),
            other => Err(format!("Error: Unknown tool '{other}'")),
        };
        result.unwrap_or_else(|e| e)
    }

    fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
        args.get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Error: '{key}' is required"))
    }

    fn tool_bash(&self, args: &Value) -> Result<String, String> {
        let command = Self::arg_str(args, "command")?;
        if let Some(role) = &self.role {
            if role.is_read_only() && !role.bash_allowed(command) {
                return Err(role.deny("bash"));
            }
        }
        run_shell(&self.workspace_root, command, DEFAULT_SHELL_TIMEOUT)
    }

    fn tool_read_file(&self, args: &Value) -> Result<String, String> {
        let path = Self::arg_str(args, "path")?;
        let resolved = resolve_path(&self.workspace_root, path).map_err(|e| format!("Error: {e}"))?;
        let contents =
            std::fs::read_to_string(&resolved).map_err(|e| format!("Error: {e}"))?;

        let max_lines = args.get("max_lines").and_then(|v| v.as_u64()).map(|v| v as usize);
        let lines: Vec<&str> = contents.lines().collect();
        let rendered = if let Some(limit) = max_lines {
            if lines.len() > limit {
                let mut head: Vec<&str> = lines[..limit].to_vec();
                let remaining = lines.len() - limit;
                let mut text = head.join("\n");
                head.clear();
                text.push_str(&format!("\n... ({remaining} more lines)"));
                text
            } else {
                contents
            }
        } else {
            contents
        };
        Ok(truncate_bytes(&rendered, MAX_OUTPUT_BYTES))
    }

    fn tool_write_file(&self, args: &Value) -> Result<String, String> {
        if let Some(role) = &self.role {
            if role.is_read_only() {
                return Err(role.deny("write_file"));
            }
        }
        let path = Self::arg_str(args, "path")?;
        let content = Self::arg_str(args, "content")?;
        let resolved = resolve_path_for_write(&self.workspace_root, path).map_err(|e| format!("Error: {e}"))?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("Error: {e}"))?;
        }
        std::fs::write(&resolved, content).map_err(|e| format!("Error: {e}"))?;
        Ok(format!("Wrote {} bytes to {path}", content.len()))
    }

    fn tool_edit_file(&self, args: &Value) -> Result<String, String> {
        if let Some(role) = &self.role {
            if role.is_read_only() {
                return Err(role.deny("edit_file"));
            }
        }
        let path = Self::arg_str(args, "path")?;
        let old_text = Self::arg_str(args, "old_text")?;
        let new_text = Self::arg_str(args, "new_text")?;
        let resolved = resolve_path(&self.workspace_root, path).map_err(|e| format!("Error: {e}"))?;
        let contents = std::fs::read_to_string(&resolved).map_err(|e| format!("Error: {e}"))?;
        let Some(pos) = contents.find(old_text) else {
            return Err(format!("Error: old_text not found in {path}"));
        };
        let mut updated = String::with_capacity(contents.len());
        updated.push_str(&contents[..pos]);
        updated.push_str(new_text);
        updated.push_str(&contents[pos + old_text.len()..]);
        std::fs::write(&resolved, updated).map_err(|e| format!("Error: {e}"))?;
        Ok(format!("Edited {path}"))
    }

    fn tool_todo_write(&self, args: &Value) -> Result<String, String> {
        if !self.config.todo {
            return Err("Error: TodoWrite unavailable".to_string());
        }
        let items = args.get("items").cloned().unwrap_or(Value::Array(vec![]));
        self.todo
            .lock()
            .unwrap()
            .write(&items)
            .map_err(|e| format!("Error: {e}"))
    }

    fn tool_task(&self, args: &Value) -> Result<String, String> {
        let Some(subagent) = &self.subagent else {
            return Err("Error: subagent unavailable".to_string());
        };
        if !self.config.subagent {
            return Err("Error: subagent unavailable".to_string());
        }
        let prompt = Self::arg_str(args, "prompt")?;
        let agent_type = args
            .get("agent_type")
            .and_then(|v| v.as_str())
            .unwrap_or("general-purpose");
        subagent.run(prompt, agent_type).map_err(|e| format!("Error: {e}"))
    }

    fn require_task_board(&self) -> Result<&TaskBoard, String> {
        self.task_board.as_ref().ok_or_else(|| "Error: task board unavailable".to_string())
    }

    fn tool_task_create(&self, args: &Value) -> Result<String, String> {
        let board = self.require_task_board()?;
        let subject = Self::arg_str(args, "subject")?;
        let description = args.get("description").and_then(|v| v.as_str()).unwrap_or("");
        let task = board.create(subject, description).map_err(|e| format!("Error: {e}"))?;
        Ok(format!("Created task #{}", task.id))
    }

    fn tool_task_get(&self, args: &Value) -> Result<String, String> {
        let board = self.require_task_board()?;
        let id = args.get("task_id").and_then(|v| v.as_u64()).ok_or("Error: 'task_id' is required")?;
        let task = board.get(id).map_err(|e| format!("Error: {e}"))?;
        serde_json::to_string(&task).map_err(|e| format!("Error: {e}"))
    }

    fn tool_task_update(&self, args: &Value) -> Result<String, String> {
        let board = self.require_task_board()?;
        let id = args.get("task_id").and_then(|v| v.as_u64()).ok_or("Error: 'task_id' is required")?;
        let update = TaskUpdate {
            status: args.get("status").and_then(|v| v.as_str()).map(|s| s.to_string()),
            owner: args.get("owner").and_then(|v| v.as_str()).map(|s| s.to_string()),
            add_blocked_by: json_u64_array(args.get("add_blocked_by")),
            add_blocks: json_u64_array(args.get("add_blocks")),
        };
        board.update(id, update).map_err(|e| format!("Error: {e}"))
    }

    fn tool_task_list(&self) -> Result<String, String> {
        let board = self.require_task_board()?;
        Ok(board.list_rendered())
    }

    fn tool_claim_task(&self, args: &Value) -> Result<String, String> {
        let board = self.require_task_board()?;
        let id = args.get("task_id").and_then(|v| v.as_u64()).ok_or("Error: 'task_id' is required")?;
        let owner = args.get("owner").and_then(|v| v.as_str()).unwrap_or("");
        board.claim(id, owner).map_err(|e| format!("Error: {e}"))
    }

    fn tool_load_skill(&self, args: &Value) -> Result<String, String> {
        if !self.config.skills {
            return Err("Error: skills unavailable".to_string());
        }
        let Some(skills) = &self.skills else {
            return Err("Error: skills unavailable".to_string());
        };
        let name = Self::arg_str(args, "name")?;
        skills.load(name)
    }

    fn tool_background_run(&self, args: &Value) -> Result<String, String> {
        let Some(background) = &self.background else {
            return Err("Error: background tasks unavailable".to_string());
        };
        let command = Self::arg_str(args, "command")?;
        let timeout = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_BACKGROUND_TIMEOUT);
        background.run(command, timeout)
    }

    fn tool_check_background(&self, args: &Value) -> Result<String, String> {
        let Some(background) = &self.background else {
            return Err("Error: background tasks unavailable".to_string());
        };
        let task_id = args.get("task_id").and_then(|v| v.as_str());
        Ok(background.check(task_id))
    }

    fn require_team(&self) -> Result<&Arc<TeamManager>, String> {
        if !self.config.team {
            return Err("Error: team unavailable".to_string());
        }
        self.team.as_ref().ok_or_else(|| "Error: team unavailable".to_string())
    }

    fn require_team_lead(&self) -> Result<&Arc<TeamManager>, String> {
        if !self.config.team_lead {
            return Err("Error: team unavailable".to_string());
        }
        self.require_team()
    }

    fn require_team_member(&self) -> Result<&Arc<TeamManager>, String> {
        if !self.config.team_member {
            return Err("Error: team unavailable".to_string());
        }
        self.require_team()
    }

    fn whoami(&self) -> &str {
        self.self_name.as_deref().unwrap_or("lead")
    }

    fn tool_spawn_teammate(&self, args: &Value) -> Result<String, String> {
        let team = self.require_team_lead()?;
        let name = Self::arg_str(args, "name")?;
        let role = args.get("role").and_then(|v| v.as_str()).unwrap_or("worker");

        match &self.teammate_conn {
            Some(conn) => {
                let config = TeammateConfig {
                    api_key: conn.api_key.clone(),
                    proxy: conn.proxy.clone(),
                    ..TeammateConfig::new(self.workspace_root.clone(), conn.model.clone(), conn.base_url.clone(), name, role)
                };
                team.launch_worker(config).map_err(|e| format!("Error: {e}"))?;
            }
            None => {
                team.spawn(name, role).map_err(|e| format!("Error: {e}"))?;
            }
        }
        Ok(format!("Spawned teammate '{name}' ({role})"))
    }

    fn tool_list_teammates(&self) -> Result<String, String> {
        let team = self.require_team_lead()?;
        Ok(team.list_rendered())
    }

    fn tool_send_message(&self, args: &Value) -> Result<String, String> {
        let team = self.require_team()?;
        let to = Self::arg_str(args, "to")?;
        let content = Self::arg_str(args, "content")?;
        match self.self_name.as_deref() {
            Some(from) => team.send_message(from, to, content),
            None => team.send_from_lead(to, content),
        }
        .map_err(|e| format!("Error: {e}"))?;
        Ok(format!("Sent to {to}"))
    }

    fn tool_read_inbox(&self, args: &Value) -> Result<String, String> {
        let team = self.require_team()?;
        let name = args
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| self.whoami());
        let messages = team.bus().read(name);
        if messages.is_empty() {
            Ok("(no messages)".to_string())
        } else {
            serde_json::to_string(&messages).map_err(|e| format!("Error: {e}"))
        }
    }

    fn tool_broadcast(&self, args: &Value) -> Result<String, String> {
        let team = self.require_team_lead()?;
        let content = Self::arg_str(args, "content")?;
        team.broadcast_from_lead(content).map_err(|e| format!("Error: {e}"))?;
        Ok("Broadcast sent".to_string())
    }

    fn tool_shutdown_request(&self, args: &Value) -> Result<String, String> {
        let team = self.require_team_lead()?;
        let target = Self::arg_str(args, "target")?;
        let request_id = team.request_shutdown(target).map_err(|e| format!("Error: {e}"))?;
        Ok(format!("Shutdown requested: {request_id}"))
    }

    fn tool_shutdown_response(&self, args: &Value) -> Result<String, String> {
        let team = self.require_team_member()?;
        let request_id = Self::arg_str(args, "request_id")?;
        let approve = args.get("approve").and_then(|v| v.as_bool()).unwrap_or(false);
        let reason = args.get("reason").and_then(|v| v.as_str());
        team.record_shutdown_response(self.whoami(), request_id, approve, reason)
            .map_err(|e| format!("Error: {e}"))?;
        Ok("Responded".to_string())
    }

    fn tool_shutdown_status(&self, args: &Value) -> Result<String, String> {
        let team = self.require_team_lead()?;
        let request_id = Self::arg_str(args, "request_id")?;
        match team.check_shutdown(request_id) {
            Some(req) => serde_json::to_string(&req).map_err(|e| format!("Error: {e}")),
            None => Err(format!("Error: unknown shutdown request {request_id}")),
        }
    }

    fn tool_shutdown_list(&self) -> Result<String, String> {
        let team = self.require_team_lead()?;
        serde_json::to_string(&team.list_shutdown_requests()).map_err(|e| format!("Error: {e}"))
    }

    fn tool_plan_submit(&self, args: &Value) -> Result<String, String> {
        let team = self.require_team_member()?;
        let plan = Self::arg_str(args, "plan")?;
        let request_id = team.submit_plan(self.whoami(), plan);
        Ok(format!("Plan submitted: {request_id}"))
    }

    fn tool_plan_review(&self, args: &Value) -> Result<String, String> {
        let team = self.require_team_lead()?;
        let request_id = Self::arg_str(args, "request_id")?;
        let approve = args.get("approve").and_then(|v| v.as_bool()).unwrap_or(false);
        let feedback = args.get("feedback").and_then(|v| v.as_str());
        team.review_plan(request_id, approve, feedback).map_err(|e| format!("Error: {e}"))?;
        Ok("Reviewed".to_string())
    }

    fn tool_plan_list(&self) -> Result<String, String> {
        let team = self.require_team_lead()?;
        serde_json::to_string(&team.list_plan_requests()).map_err(|e| format!("Error: {e}"))
    }
}

/// Like [`resolve_path`] but the leaf component is allowed to not exist yet.
fn resolve_path_for_write(root: &Path, rel: &str) -> AgentResult<PathBuf> {
    resolve_path(root, rel)
}

fn function_schema(name: &str, description: &str, parameters: Value) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        },
    })
}

fn json_u64_array(value: Option<&Value>) -> Vec<u64> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_u64()).collect())
        .unwrap_or_default()
}
