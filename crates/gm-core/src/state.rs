//! Phase and status enums for projects, sessions, and decisions.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Pipeline phase of a GM project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Launching,
    Waiting,
    Analyzing,
    Merging,
    Building,
    Testing,
    Completed,
    Failed,
}

impl ProjectPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectPhase::Completed | ProjectPhase::Failed)
    }

    /// True while the project holds the repo merge lock.
    pub fn mutates_repo(&self) -> bool {
        matches!(
            self,
            ProjectPhase::Merging | ProjectPhase::Building | ProjectPhase::Testing
        )
    }
}

/// Lifecycle status of one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// Outcome of the merge attempt for a session's branch.
///
/// Unset (no attempt yet) is modelled as `Option<MergeResult>::None` on the
/// session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeResult {
    Merged,
    MergedResolved,
    Skipped,
    Failed,
}

impl MergeResult {
    pub fn landed(&self) -> bool {
        matches!(self, MergeResult::Merged | MergeResult::MergedResolved)
    }
}

/// What kind of approval a pending decision asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    MergeConflict,
    BuildFailure,
    TestFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
}

impl DecisionStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, DecisionStatus::Pending)
    }
}

/// The action a human takes on a pending decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Reject,
}

impl DecisionAction {
    pub fn resolved_status(&self) -> DecisionStatus {
        match self {
            DecisionAction::Approve => DecisionStatus::Approved,
            DecisionAction::Reject => DecisionStatus::Rejected,
        }
    }
}

macro_rules! str_enum_impls {
    ($ty:ty { $($variant:path => $tag:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($variant => $tag),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($tag => Ok($variant)),+,
                    other => Err(format!(
                        "unknown {} tag: {other}",
                        stringify!($ty)
                    )),
                }
            }
        }
    };
}

str_enum_impls!(ProjectPhase {
    ProjectPhase::Launching => "launching",
    ProjectPhase::Waiting => "waiting",
    ProjectPhase::Analyzing => "analyzing",
    ProjectPhase::Merging => "merging",
    ProjectPhase::Building => "building",
    ProjectPhase::Testing => "testing",
    ProjectPhase::Completed => "completed",
    ProjectPhase::Failed => "failed",
});

str_enum_impls!(SessionStatus {
    SessionStatus::Pending => "pending",
    SessionStatus::Running => "running",
    SessionStatus::Completed => "completed",
    SessionStatus::Failed => "failed",
    SessionStatus::Cancelled => "cancelled",
});

str_enum_impls!(MergeResult {
    MergeResult::Merged => "merged",
    MergeResult::MergedResolved => "merged_resolved",
    MergeResult::Skipped => "skipped",
    MergeResult::Failed => "failed",
});

str_enum_impls!(DecisionKind {
    DecisionKind::MergeConflict => "merge_conflict",
    DecisionKind::BuildFailure => "build_failure",
    DecisionKind::TestFailure => "test_failure",
});

str_enum_impls!(DecisionStatus {
    DecisionStatus::Pending => "pending",
    DecisionStatus::Approved => "approved",
    DecisionStatus::Rejected => "rejected",
});

str_enum_impls!(DecisionAction {
    DecisionAction::Approve => "approve",
    DecisionAction::Reject => "reject",
});
