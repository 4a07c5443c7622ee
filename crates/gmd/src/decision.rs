//! Human approval gates.
//!
//! A request durably inserts a pending decision, announces it on the `gm`
//! channel, and hands back a wait handle. Resolution is atomic in the store
//! and wakes the single waiter at most once.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use gm_core::events::GmEvent;
use gm_core::state::{DecisionAction, DecisionKind};
use gm_core::types::{generate_id, Decision, DecisionId, ProjectId};

use crate::hub::EventHub;
use crate::store::{ResolveOutcome, SqliteStore, StoreError};

/// Pending-decision context is truncated to this many bytes before it is
/// persisted or broadcast.
pub const MAX_CONTEXT_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Default)]
struct DecisionCell {
    state: Mutex<Option<DecisionAction>>,
    resolved: Condvar,
}

impl DecisionCell {
    fn wake(&self, action: DecisionAction) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_none() {
            *state = Some(action);
        }
        drop(state);
        self.resolved.notify_all();
    }
}

/// Wait handle for one pending decision.
pub struct DecisionWaiter {
    cell: Arc<DecisionCell>,
}

impl DecisionWaiter {
    /// Block until the decision resolves, or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DecisionAction> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .cell
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(action) = *state {
                return Some(action);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _timeout_result) = self
                .cell
                .resolved
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

pub struct DecisionGate {
    store: Arc<SqliteStore>,
    hub: EventHub,
    waiters: Mutex<HashMap<String, Arc<DecisionCell>>>,
}

impl DecisionGate {
    pub fn new(store: Arc<SqliteStore>, hub: EventHub) -> Self {
        Self {
            store,
            hub,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<DecisionCell>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending decision and return its id plus the wait handle.
    pub fn request(
        &self,
        project_id: &ProjectId,
        kind: DecisionKind,
        description: impl Into<String>,
        proposed_action: impl Into<String>,
        context: &str,
    ) -> Result<(DecisionId, DecisionWaiter), GateError> {
        let decision_id = DecisionId::new(format!("D-{}", generate_id()));
        let decision = Decision::pending(
            decision_id.clone(),
            project_id.clone(),
            kind,
            description,
            proposed_action,
            truncate_context(context, MAX_CONTEXT_BYTES),
        );

        self.store.insert_decision(&decision)?;

        let cell = Arc::new(DecisionCell::default());
        self.waiters()
            .insert(decision_id.0.clone(), Arc::clone(&cell));

        self.hub.publish_gm(&GmEvent::DecisionRequired {
            project_id: project_id.clone(),
            decision_id: decision_id.clone(),
            decision_type: decision.kind,
            description: decision.description.clone(),
            proposed_action: decision.proposed_action.clone(),
            context: decision.context.clone(),
        });

        Ok((decision_id, DecisionWaiter { cell }))
    }

    /// Resolve a pending decision. Idempotent: once resolved, later calls
    /// return the recorded outcome without waking anyone or re-publishing.
    pub fn resolve(
        &self,
        decision_id: &DecisionId,
        action: DecisionAction,
    ) -> Result<Decision, GateError> {
        let outcome = self
            .store
            .resolve_decision(decision_id, action, Utc::now())?;

        match outcome {
            ResolveOutcome::Resolved(decision) => {
                if let Some(cell) = self.waiters().remove(&decision_id.0) {
                    cell.wake(action);
                }
                self.hub.publish_gm(&GmEvent::DecisionResolved {
                    project_id: decision.project_id.clone(),
                    decision_id: decision_id.clone(),
                    action,
                });
                Ok(decision)
            }
            ResolveOutcome::AlreadyResolved(decision) => Ok(decision),
        }
    }

    pub fn pending_for(&self, project_id: &ProjectId) -> Result<Vec<Decision>, GateError> {
        Ok(self.store.pending_decisions_for(project_id)?)
    }

    /// Cancellation path: reject everything still pending for a project.
    pub fn reject_all_pending(&self, project_id: &ProjectId) -> Result<usize, GateError> {
        let pending = self.store.pending_decisions_for(project_id)?;
        let count = pending.len();
        for decision in pending {
            self.resolve(&decision.decision_id, DecisionAction::Reject)?;
        }
        Ok(count)
    }
}

fn truncate_context(context: &str, max_bytes: usize) -> String {
    if context.len() <= max_bytes {
        return context.to_string();
    }
    // Keep the tail: the end of a build log is where the error lives.
    let mut start = context.len() - max_bytes;
    while start < context.len() && !context.is_char_boundary(start) {
        start += 1;
    }
    context[start..].to_string()
}
