//! Team configuration persistence and the shutdown/plan-approval trackers.
//!
//! `TeamManager` is the only writer of its own config file; teammate worker
//! threads interact with the rest of the world only through [`crate::inbox::FileBus`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};
use crate::inbox::{message, now_secs, FileBus, InboxMessageType};
use crate::teammate::{self, TeammateConfig};

const TEAM_DIR: &str = ".anuris_team";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Working,
    Idle,
    Shutdown,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub role: String,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    pub team_name: String,
    pub members: Vec<Member>,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            team_name: "default".to_string(),
            members: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub request_id: String,
    pub target: String,
    pub status: RequestStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub request_id: String,
    pub from: String,
    pub plan: String,
    pub status: RequestStatus,
    pub feedback: Option<String>,
}

struct Trackers {
    shutdowns: HashMap<String, ShutdownRequest>,
    plans: HashMap<String, PlanRequest>,
}

pub struct TeamManager {
    workspace_root: PathBuf,
    bus: FileBus,
    config: Mutex<TeamConfig>,
    trackers: Mutex<Trackers>,
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl TeamManager {
    pub fn new(workspace_root: &Path) -> Self {
        let config = load_config(workspace_root).unwrap_or_default();
        Self {
            workspace_root: workspace_root.to_path_buf(),
            bus: FileBus::new(workspace_root),
            config: Mutex::new(config),
            trackers: Mutex::new(Trackers {
                shutdowns: HashMap::new(),
                plans: HashMap::new(),
            }),
        }
    }

    pub fn bus(&self) -> &FileBus {
        &self.bus
    }

    fn config_path(&self) -> PathBuf {
        self.workspace_root.join(TEAM_DIR).join(CONFIG_FILE)
    }

    fn persist(&self, config: &TeamConfig) {
        if let Some(parent) = self.config_path().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(contents) = serde_json::to_string_pretty(config) {
            let _ = std::fs::write(self.config_path(), contents);
        }
    }

    /// Register a new member (or reject if it's already `working`). Returns
    /// the upserted member.
    pub fn spawn(&self, name: &str, role: &str) -> AgentResult<Member> {
        let mut config = self.config.lock().unwrap();
        if let Some(existing) = config.members.iter().find(|m| m.name == name) {
            if existing.status == MemberStatus::Working {
                return Err(AgentError::InvalidInput(format!(
                    "teammate '{name}' is already working"
                )));
            }
        }
        let member = Member {
            name: name.to_string(),
            role: role.to_string(),
            status: MemberStatus::Working,
        };
        config.members.retain(|m| m.name != name);
        config.members.push(member.clone());
        self.persist(&config);
        Ok(member)
    }

    /// Register the member, then start its worker thread running the
    /// teammate round loop. The thread outlives this call; it reports its
    /// own status transitions back via `set_status`.
    pub fn launch_worker(self: &Arc<Self>, config: TeammateConfig) -> AgentResult<Member> {
        let member = self.spawn(&config.name, &config.role)?;
        teammate::spawn(config, Arc::clone(self));
        Ok(member)
    }

    pub fn set_status(&self, name: &str, status: MemberStatus) {
        let mut config = self.config.lock().unwrap();
        if let Some(m) = config.members.iter_mut().find(|m| m.name == name) {
            m.status = status;
            self.persist(&config);
        }
    }

    pub fn list_members(&self) -> Vec<Member> {
        self.config.lock().unwrap().members.clone()
    }

    pub fn list_rendered(&self) -> String {
        let members = self.list_members();
        if members.is_empty() {
            return "(no teammates)".to_string();
        }
        members
            .iter()
            .map(|m| format!("{} ({}) - {:?}", m.name, m.role, m.status))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn send_from_lead(&self, to: &str, content: &str) -> std::io::Result<()> {
        self.bus
            .send(to, &message(InboxMessageType::Message, "lead", content))
    }

    pub fn send_message(&self, from: &str, to: &str, content: &str) -> std::io::Result<()> {
        self.bus
            .send(to, &message(InboxMessageType::Message, from, content))
    }

    pub fn broadcast_from_lead(&self, content: &str) -> std::io::Result<()> {
        for member in self.list_members() {
            if member.name == "lead" {
                continue;
            }
            self.bus
                .send(&member.name, &message(InboxMessageType::Broadcast, "lead", content))?;
        }
        Ok(())
    }

    pub fn request_shutdown(&self, teammate: &str) -> AgentResult<String> {
        let request_id = short_id();
        {
            let mut trackers = self.trackers.lock().unwrap();
            trackers.shutdowns.insert(
                request_id.clone(),
                ShutdownRequest {
                    request_id: request_id.clone(),
                    target: teammate.to_string(),
                    status: RequestStatus::Pending,
                },
            );
        }
        let mut msg = message(InboxMessageType::ShutdownRequest, "lead", "");
        msg.extra
            .insert("request_id".into(), request_id.clone().into());
        self.bus
            .send(teammate, &msg)
            .map_err(|e| AgentError::Unavailable(format!("inbox: {e}")))?;
        Ok(request_id)
    }

    pub fn record_shutdown_response(
        &self,
        sender: &str,
        request_id: &str,
        approve: bool,
        reason: Option<&str>,
    ) -> AgentResult<()> {
        let status = if approve {
            RequestStatus::Approved
        } else {
            RequestStatus::Rejected
        };
        {
            let mut trackers = self.trackers.lock().unwrap();
            let req = trackers
                .shutdowns
                .get_mut(request_id)
                .ok_or_else(|| AgentError::InvalidInput(format!("unknown shutdown request {request_id}")))?;
            req.status = status;
        }
        if approve {
            self.set_status(sender, MemberStatus::Shutdown);
        }
        let mut msg = message(
            InboxMessageType::ShutdownResponse,
            sender,
            reason.unwrap_or_default(),
        );
        msg.extra
            .insert("request_id".into(), request_id.to_string().into());
        msg.extra.insert("approve".into(), approve.into());
        let _ = self.bus.send("lead", &msg);
        Ok(())
    }

    pub fn submit_plan(&self, from: &str, plan: &str) -> String {
        let request_id = short_id();
        self.trackers.lock().unwrap().plans.insert(
            request_id.clone(),
            PlanRequest {
                request_id: request_id.clone(),
                from: from.to_string(),
                plan: plan.to_string(),
                status: RequestStatus::Pending,
                feedback: None,
            },
        );
        let mut msg = message(InboxMessageType::PlanApprovalRequest, from, plan);
        msg.extra
            .insert("request_id".into(), request_id.clone().into());
        let _ = self.bus.send("lead", &msg);
        request_id
    }

    pub fn review_plan(
        &self,
        request_id: &str,
        approve: bool,
        feedback: Option<&str>,
    ) -> AgentResult<()> {
        let (from, status) = {
            let mut trackers = self.trackers.lock().unwrap();
            let req = trackers
                .plans
                .get_mut(request_id)
                .ok_or_else(|| AgentError::InvalidInput(format!("unknown plan request {request_id}")))?;
            req.status = if approve {
                RequestStatus::Approved
            } else {
                RequestStatus::Rejected
            };
            req.feedback = feedback.map(|f| f.to_string());
            (req.from.clone(), req.status)
        };
        let _ = status;
        let mut msg = message(
            InboxMessageType::PlanApprovalResponse,
            "lead",
            feedback.unwrap_or_default(),
        );
        msg.extra
            .insert("request_id".into(), request_id.to_string().into());
        msg.extra.insert("approve".into(), approve.into());
        self.bus
            .send(&from, &msg)
            .map_err(|e| AgentError::Unavailable(format!("inbox: {e}")))?;
        Ok(())
    }

    pub fn list_shutdown_requests(&self) -> Vec<ShutdownRequest> {
        self.trackers.lock().unwrap().shutdowns.values().cloned().collect()
    }

    pub fn list_plan_requests(&self) -> Vec<PlanRequest> {
        self.trackers.lock().unwrap().plans.values().cloned().collect()
    }

    pub fn check_shutdown(&self, request_id: &str) -> Option<ShutdownRequest> {
        self.trackers.lock().unwrap().shutdowns.get(request_id).cloned()
    }
}

fn load_config(workspace_root: &Path) -> AgentResult<TeamConfig> {
    let path = workspace_root.join(TEAM_DIR).join(CONFIG_FILE);
    let contents = std::fs::read_to_string(path)
        .map_err(|e| AgentError::Unavailable(format!("team config: {e}")))?;
    serde_json::from_str(&contents)
        .map_err(|e| AgentError::Unavailable(format!("team config parse: {e}")))
}

pub fn timestamp() -> u64 {
    now_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_rejects_duplicate_working_member() {
        let dir = tempfile::tempdir().unwrap();
        let team = TeamManager::new(dir.path());
        team.spawn("alice", "reviewer").unwrap();
        let err = team.spawn("alice", "reviewer").unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[test]
    fn spawn_allows_respawn_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let team = TeamManager::new(dir.path());
        team.spawn("alice", "reviewer").unwrap();
        team.set_status("alice", MemberStatus::Shutdown);
        assert!(team.spawn("alice", "reviewer").is_ok());
    }

    #[test]
    fn shutdown_request_flow_flips_member_status() {
        let dir = tempfile::tempdir().unwrap();
        let team = TeamManager::new(dir.path());
        team.spawn("alice", "worker").unwrap();
        let request_id = team.request_shutdown("alice").unwrap();

        let inbox = team.bus().read("alice");
        assert_eq!(inbox.len(), 1);

        team.record_shutdown_response("alice", &request_id, true, None)
            .unwrap();
        let members = team.list_members();
        assert_eq!(members[0].status, MemberStatus::Shutdown);

        let lead_inbox = team.bus().read("lead");
        assert_eq!(lead_inbox.len(), 1);
    }

    #[test]
    fn plan_review_flow_sends_response_to_submitter() {
        let dir = tempfile::tempdir().unwrap();
        let team = TeamManager::new(dir.path());
        let request_id = team.submit_plan("alice", "do the thing");
        team.review_plan(&request_id, true, Some("looks good")).unwrap();

        let alice_inbox = team.bus().read("alice");
        assert_eq!(alice_inbox.len(), 1);
        assert_eq!(alice_inbox[0].content, "looks good");
    }
}
