//! Event payloads published on the hub channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{DecisionAction, DecisionKind, MergeResult, ProjectPhase, SessionStatus};
use crate::types::{DecisionId, ProjectId, SessionId};

/// Events on the `gm` channel, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GmEvent {
    ProjectStarted {
        project_id: ProjectId,
        project_name: String,
    },
    PhaseChange {
        project_id: ProjectId,
        phase: ProjectPhase,
    },
    AgentLaunched {
        project_id: ProjectId,
        session_id: SessionId,
        team_name: String,
    },
    AgentCompleted {
        project_id: ProjectId,
        session_id: SessionId,
        status: SessionStatus,
    },
    MergeOrderDetermined {
        project_id: ProjectId,
        merge_order: Vec<SessionId>,
    },
    MergeStarted {
        project_id: ProjectId,
        session_id: SessionId,
        index: usize,
    },
    MergeConflict {
        project_id: ProjectId,
        session_id: SessionId,
        conflicted_files: Vec<String>,
        error: String,
    },
    MergeCompleted {
        project_id: ProjectId,
        session_id: SessionId,
        skipped: bool,
        result: MergeResult,
    },
    ConflictResolved {
        project_id: ProjectId,
        session_id: SessionId,
    },
    BuildStarted {
        project_id: ProjectId,
    },
    BuildResult {
        project_id: ProjectId,
        success: bool,
        output_tail: String,
    },
    BuildFixAttempt {
        project_id: ProjectId,
        attempt: u32,
    },
    TestStarted {
        project_id: ProjectId,
    },
    TestResult {
        project_id: ProjectId,
        success: bool,
        output_tail: String,
    },
    TestFixAttempt {
        project_id: ProjectId,
        attempt: u32,
    },
    DecisionRequired {
        project_id: ProjectId,
        decision_id: DecisionId,
        decision_type: DecisionKind,
        description: String,
        proposed_action: String,
        context: String,
    },
    DecisionResolved {
        project_id: ProjectId,
        decision_id: DecisionId,
        action: DecisionAction,
    },
    ProjectCompleted {
        project_id: ProjectId,
    },
    ProjectFailed {
        project_id: ProjectId,
        reason: String,
    },
}

/// Per-stream events on the `teams` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamStream {
    Started,
    Stdout,
    Stderr,
    Completed,
    Cancelled,
    ResourceError,
}

/// Events on the `teams` channel: one record shape, the `event` field says
/// which of `data`/`status`/`exit_code` is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TeamEvent {
    TeamProgress {
        session_id: SessionId,
        event: TeamStream,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        team_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<SessionStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl TeamEvent {
    pub fn line(session_id: SessionId, stream: TeamStream, data: impl Into<String>) -> Self {
        TeamEvent::TeamProgress {
            session_id,
            event: stream,
            team_name: None,
            data: Some(data.into()),
            status: None,
            exit_code: None,
        }
    }

    pub fn started(session_id: SessionId, team_name: impl Into<String>) -> Self {
        TeamEvent::TeamProgress {
            session_id,
            event: TeamStream::Started,
            team_name: Some(team_name.into()),
            data: None,
            status: None,
            exit_code: None,
        }
    }

    pub fn terminal(session_id: SessionId, status: SessionStatus, exit_code: Option<i32>) -> Self {
        TeamEvent::TeamProgress {
            session_id,
            event: TeamStream::Completed,
            team_name: None,
            data: None,
            status: Some(status),
            exit_code,
        }
    }

    pub fn cancelled(session_id: SessionId) -> Self {
        TeamEvent::TeamProgress {
            session_id,
            event: TeamStream::Cancelled,
            team_name: None,
            data: None,
            status: Some(SessionStatus::Cancelled),
            exit_code: None,
        }
    }

    pub fn resource_error(session_id: SessionId, detail: impl Into<String>) -> Self {
        TeamEvent::TeamProgress {
            session_id,
            event: TeamStream::ResourceError,
            team_name: None,
            data: Some(detail.into()),
            status: None,
            exit_code: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            TeamEvent::TeamProgress { session_id, .. } => session_id,
        }
    }
}

/// Structured record for the `logs` channel and the `logs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub source: Option<String>,
}

impl LogRecord {
    pub fn new(level: impl Into<String>, message: impl Into<String>, source: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
            source: Some(source.to_string()),
        }
    }
}
