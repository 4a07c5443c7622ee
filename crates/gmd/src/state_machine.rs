//! Project phase transitions.

use chrono::{DateTime, Utc};

use gm_core::state::ProjectPhase;
use gm_core::types::GmProject;

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid project phase transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ProjectPhase,
        to: ProjectPhase,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: ProjectPhase,
    pub to: ProjectPhase,
    pub at: DateTime<Utc>,
}

pub fn transition_project(
    project: &mut GmProject,
    to: ProjectPhase,
    at: DateTime<Utc>,
) -> Result<PhaseTransition, StateMachineError> {
    let from = project.phase;
    if !is_phase_transition_allowed(from, to) {
        return Err(StateMachineError::InvalidTransition { from, to });
    }

    project.phase = to;
    if to.is_terminal() {
        project.completed_at = Some(at);
    }

    Ok(PhaseTransition { from, to, at })
}

/// The phase graph. `building` and `testing` may re-enter themselves for
/// repair cycles; no other phase repeats. Any non-terminal phase may fail.
/// `failed` has recovery edges back into the repo-mutating phases for
/// operator-driven retries.
pub fn is_phase_transition_allowed(from: ProjectPhase, to: ProjectPhase) -> bool {
    use ProjectPhase::*;

    if from == to {
        return matches!(from, Building | Testing);
    }

    match (from, to) {
        (Launching, Waiting) => true,
        (Waiting, Analyzing) => true,
        (Analyzing, Merging) => true,
        (Merging, Building | Testing | Completed) => true,
        (Building, Testing | Completed) => true,
        (Testing, Completed) => true,
        (Failed, Merging | Building | Testing) => true,
        (from, Failed) => !from.is_terminal(),
        _ => false,
    }
}
