//! Core entity types for the GM pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::state::{DecisionKind, DecisionStatus, MergeResult, ProjectPhase, SessionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionId(pub String);

impl DecisionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

static ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a sortable runtime id: UTC timestamp plus a process-local
/// counter so ids minted within the same second stay distinct.
pub fn generate_id() -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{counter:04x}", Utc::now().format("%Y%m%d-%H%M%S"))
}

/// One teammate running on one isolated branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: SessionId,
    pub project_id: Option<ProjectId>,
    pub team_name: String,
    pub task: String,
    pub branch: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub status: SessionStatus,
    /// Authoritative only once `status` is terminal; empty before that.
    pub files_changed: Vec<String>,
    pub merge_result: Option<MergeResult>,
    pub merge_order_index: Option<usize>,
    pub result_file: Option<String>,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    pub fn new(
        session_id: SessionId,
        team_name: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            project_id: None,
            team_name: team_name.into(),
            task: task.into(),
            branch: None,
            worktree_path: None,
            status: SessionStatus::Pending,
            files_changed: Vec::new(),
            merge_result: None,
            merge_order_index: None,
            result_file: None,
            exit_code: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn mark_running(&mut self, branch: String, worktree_path: PathBuf) {
        self.status = SessionStatus::Running;
        self.branch = Some(branch);
        self.worktree_path = Some(worktree_path);
        self.started_at = Utc::now();
    }

    pub fn mark_terminal(
        &mut self,
        status: SessionStatus,
        exit_code: Option<i32>,
        files_changed: Vec<String>,
    ) {
        self.status = status;
        self.exit_code = exit_code;
        self.files_changed = files_changed;
        self.completed_at = Some(Utc::now());
    }
}

/// One unit of work inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeammateTask {
    pub session_id: SessionId,
    pub teammate: String,
    pub role: Option<String>,
    pub status: SessionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GmProject {
    pub project_id: ProjectId,
    pub name: String,
    pub repo_path: PathBuf,
    pub build_command: Option<String>,
    pub test_command: Option<String>,
    pub phase: ProjectPhase,
    pub agent_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub merged_count: usize,
    pub build_attempts: u32,
    pub test_attempts: u32,
    pub merge_order: Vec<SessionId>,
    pub current_merge: Option<SessionId>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GmProject {
    pub fn new(project_id: ProjectId, name: impl Into<String>, repo_path: PathBuf) -> Self {
        Self {
            project_id,
            name: name.into(),
            repo_path,
            build_command: None,
            test_command: None,
            phase: ProjectPhase::Launching,
            agent_count: 0,
            completed_count: 0,
            failed_count: 0,
            merged_count: 0,
            build_attempts: 0,
            test_attempts: 0,
            merge_order: Vec::new(),
            current_merge: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_commands(
        mut self,
        build_command: Option<String>,
        test_command: Option<String>,
    ) -> Self {
        self.build_command = build_command;
        self.test_command = test_command;
        self
    }
}

/// A pending (or resolved) approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: DecisionId,
    pub project_id: ProjectId,
    pub kind: DecisionKind,
    pub description: String,
    pub proposed_action: String,
    pub context: String,
    pub status: DecisionStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Decision {
    pub fn pending(
        decision_id: DecisionId,
        project_id: ProjectId,
        kind: DecisionKind,
        description: impl Into<String>,
        proposed_action: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            decision_id,
            project_id,
            kind,
            description: description.into(),
            proposed_action: proposed_action.into(),
            context: context.into(),
            status: DecisionStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// A named team definition consumed by the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub teammates: Vec<TeammateSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeammateSpec {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_teammate_timeout")]
    pub timeout_seconds: u64,
}

fn default_teammate_timeout() -> u64 {
    300
}

impl TeamTemplate {
    /// Wall-clock budget for one session of this team: the longest teammate
    /// timeout, or the default when the template declares no teammates.
    pub fn session_timeout_seconds(&self) -> u64 {
        self.teammates
            .iter()
            .map(|teammate| teammate.timeout_seconds)
            .max()
            .unwrap_or_else(default_teammate_timeout)
    }
}

/// One agent slot in a project launch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub team: String,
    pub task: String,
}

/// External request to start a GM project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub project_name: String,
    pub repo_path: PathBuf,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    pub agents: Vec<AgentSpec>,
}
