//! The General Manager pipeline.
//!
//! One supervisor thread per project drives launching → waiting → analyzing
//! → merging → building → testing → completed/failed, pausing on human
//! decisions and invoking the repair agent where approved. Every phase is
//! written to the store before its event is published.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;

use gm_agents::{
    build_fix_prompt, configure_process_group, conflict_prompt, kill_group, test_fix_prompt,
    AgentBackend, AgentInvocation,
};
use gm_core::config::GmConfig;
use gm_core::events::{GmEvent, LogRecord};
use gm_core::state::{DecisionAction, DecisionKind, MergeResult, ProjectPhase, SessionStatus};
use gm_core::types::{
    generate_id, AgentSession, GmProject, LaunchRequest, ProjectId, SessionId,
};
use gm_core::validation::{Validate, ValidationLevel};
use gm_git::{discover_repo, push, GitCli, GitError, RepoHandle, WorktreeManager};

use crate::decision::{DecisionGate, DecisionWaiter, GateError};
use crate::hub::EventHub;
use crate::launcher::TeamLauncher;
use crate::merge_lock::{acquire, MergeLocks};
use crate::state_machine::{transition_project, StateMachineError};
use crate::store::{SqliteStore, StoreError};

/// Bytes of build/test output retained for events and decision context.
pub const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("launch request invalid: {message}")]
    InvalidRequest { message: String },
    #[error("project is not active: {project_id}")]
    ProjectNotActive { project_id: String },
    #[error("project is not in a failed phase: {project_id}")]
    NotFailed { project_id: String },
    #[error("project was cancelled")]
    Cancelled,
    #[error("{message}")]
    Phase { message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    State(#[from] StateMachineError),
}

struct ProjectHandle {
    cancel: Arc<AtomicBool>,
}

struct GmInner {
    config: GmConfig,
    store: Arc<SqliteStore>,
    hub: EventHub,
    launcher: TeamLauncher,
    gate: DecisionGate,
    merge_locks: MergeLocks,
    backend: Arc<dyn AgentBackend>,
    git: GitCli,
    active: Mutex<HashMap<String, ProjectHandle>>,
}

impl GmInner {
    fn active(&self) -> MutexGuard<'_, HashMap<String, ProjectHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worktrees(&self) -> WorktreeManager {
        WorktreeManager::new(
            self.git.clone(),
            &self.config.worktree.subdir,
            &self.config.worktree.branch_prefix,
        )
    }

    fn log(&self, level: &str, message: impl Into<String>) {
        let record = LogRecord::new(level, message, "gm");
        if let Err(err) = self.store.insert_log(&record) {
            eprintln!("failed to persist log record: {err}");
        }
        self.hub.publish_log(&record);
    }

    /// Durably record the new phase, then announce it.
    fn set_phase(
        &self,
        project: &mut GmProject,
        phase: ProjectPhase,
    ) -> Result<(), PipelineError> {
        transition_project(project, phase, Utc::now())?;
        self.store.upsert_project(project)?;
        self.hub.publish_gm(&GmEvent::PhaseChange {
            project_id: project.project_id.clone(),
            phase,
        });
        Ok(())
    }

    fn check_cancel(&self, cancel: &AtomicBool) -> Result<(), PipelineError> {
        if cancel.load(Ordering::SeqCst) {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Block on a decision, staying responsive to project cancellation.
    fn await_decision(
        &self,
        waiter: &DecisionWaiter,
        cancel: &AtomicBool,
    ) -> Result<DecisionAction, PipelineError> {
        loop {
            self.check_cancel(cancel)?;
            if let Some(action) = waiter.wait_timeout(Duration::from_millis(250)) {
                self.check_cancel(cancel)?;
                return Ok(action);
            }
        }
    }

    fn sleep_poll(&self, cancel: &AtomicBool) -> Result<(), PipelineError> {
        let total = Duration::from_secs(self.config.pipeline.poll_interval_secs.max(1));
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            self.check_cancel(cancel)?;
            thread::sleep(Duration::from_millis(50).min(deadline - Instant::now()));
        }
        Ok(())
    }
}

/// Handle to the process-wide pipeline supervisor.
#[derive(Clone)]
pub struct GeneralManager {
    inner: Arc<GmInner>,
}

impl GeneralManager {
    pub fn new(
        config: GmConfig,
        store: Arc<SqliteStore>,
        hub: EventHub,
        backend: Arc<dyn AgentBackend>,
    ) -> Self {
        let launcher = TeamLauncher::new(
            config.clone(),
            Arc::clone(&store),
            hub.clone(),
            Arc::clone(&backend),
        );
        let gate = DecisionGate::new(Arc::clone(&store), hub.clone());
        Self {
            inner: Arc::new(GmInner {
                config,
                store,
                hub,
                launcher,
                gate,
                merge_locks: MergeLocks::new(),
                backend,
                git: GitCli::default(),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn launcher(&self) -> &TeamLauncher {
        &self.inner.launcher
    }

    /// Mark projects left non-terminal by a previous process as failed.
    pub fn sweep_interrupted(&self) -> Result<usize, PipelineError> {
        let inner = &self.inner;
        let unfinished = inner.store.list_unfinished_projects()?;
        let count = unfinished.len();
        for mut project in unfinished {
            project.error_message = Some("interrupted".to_string());
            inner.set_phase(&mut project, ProjectPhase::Failed)?;
            inner.hub.publish_gm(&GmEvent::ProjectFailed {
                project_id: project.project_id.clone(),
                reason: "interrupted".to_string(),
            });
            inner.log(
                "warn",
                format!("project {} marked interrupted", project.project_id.0),
            );
        }
        Ok(count)
    }

    /// Start a project: insert the row, launch every agent, then hand the
    /// rest of the pipeline to a supervisor thread.
    pub fn launch_project(&self, request: LaunchRequest) -> Result<ProjectId, PipelineError> {
        let issues = request.validate();
        if let Some(error) = issues
            .iter()
            .find(|issue| issue.level == ValidationLevel::Error)
        {
            return Err(PipelineError::InvalidRequest {
                message: error.message.clone(),
            });
        }

        let inner = &self.inner;
        let project_id = ProjectId::new(generate_id());
        let mut project = GmProject::new(
            project_id.clone(),
            request.project_name.clone(),
            request.repo_path.clone(),
        )
        .with_commands(
            request.build_command.clone().filter(|c| !c.trim().is_empty()),
            request.test_command.clone().filter(|c| !c.trim().is_empty()),
        );
        project.agent_count = request.agents.len();
        inner.store.upsert_project(&project)?;

        inner.hub.publish_gm(&GmEvent::ProjectStarted {
            project_id: project_id.clone(),
            project_name: request.project_name.clone(),
        });
        inner.log(
            "info",
            format!(
                "project '{}' ({}) started with {} agents",
                request.project_name,
                project_id.0,
                request.agents.len()
            ),
        );

        for (index, agent) in request.agents.iter().enumerate() {
            match inner.launcher.launch_for_project(
                &agent.team,
                &agent.task,
                &request.repo_path,
                Some(project_id.clone()),
            ) {
                Ok(session_id) => {
                    inner.hub.publish_gm(&GmEvent::AgentLaunched {
                        project_id: project_id.clone(),
                        session_id,
                        team_name: agent.team.clone(),
                    });
                }
                Err(err) => {
                    inner.log(
                        "error",
                        format!("failed to launch agent '{}': {err}", agent.team),
                    );
                    // A spawn failure already left a failed session row; any
                    // earlier failure gets a synthetic one so the project
                    // accounts for every requested agent.
                    if err.failed_session().is_none() {
                        let mut failed = AgentSession::new(
                            SessionId::new(format!("failed-{}-{index}", agent.team)),
                            agent.team.clone(),
                            agent.task.clone(),
                        )
                        .for_project(project_id.clone());
                        failed.mark_terminal(SessionStatus::Failed, None, Vec::new());
                        inner.store.upsert_session(&failed)?;
                    }
                }
            }
        }

        let cancel = Arc::new(AtomicBool::new(false));
        inner.active().insert(
            project_id.0.clone(),
            ProjectHandle {
                cancel: Arc::clone(&cancel),
            },
        );

        let supervisor = self.clone();
        let thread_project_id = project_id.clone();
        thread::spawn(move || {
            supervisor.run_pipeline(thread_project_id, cancel);
        });

        Ok(project_id)
    }

    fn run_pipeline(&self, project_id: ProjectId, cancel: Arc<AtomicBool>) {
        let result = self.drive(&project_id, &cancel);
        let inner = &self.inner;

        if let Err(err) = result {
            let reason = match err {
                PipelineError::Cancelled => "cancelled".to_string(),
                other => other.to_string(),
            };
            if let Err(fail_err) = self.finish_failed(&project_id, &reason) {
                eprintln!(
                    "project {} could not be marked failed: {fail_err}",
                    project_id.0
                );
            }
        }

        inner.active().remove(&project_id.0);
    }

    fn drive(&self, project_id: &ProjectId, cancel: &AtomicBool) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let mut project = inner.store.require_project(project_id)?;
        let repo = discover_repo(&project.repo_path, &inner.git)?;

        self.wait_for_agents(&mut project, cancel)?;
        self.analyze_merge_order(&mut project, cancel)?;

        // One project per repo may mutate the host checkout at a time; the
        // lock spans merging through testing.
        let lock = inner.merge_locks.lock_for(&project.repo_path);
        let _guard = acquire(&lock);

        self.merge_branches(&mut project, &repo, cancel)?;
        self.run_command_phase(&mut project, &repo, CommandPhase::Build, cancel)?;
        self.run_command_phase(&mut project, &repo, CommandPhase::Test, cancel)?;
        self.finish_completed(&mut project)
    }

    // --- Waiting ---

    fn wait_for_agents(
        &self,
        project: &mut GmProject,
        cancel: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        inner.set_phase(project, ProjectPhase::Waiting)?;

        let mut announced: HashSet<String> = HashSet::new();
        loop {
            inner.check_cancel(cancel)?;
            let sessions = inner.store.list_sessions_for_project(&project.project_id)?;

            for session in &sessions {
                if session.status.is_terminal() && announced.insert(session.session_id.0.clone())
                {
                    inner.hub.publish_gm(&GmEvent::AgentCompleted {
                        project_id: project.project_id.clone(),
                        session_id: session.session_id.clone(),
                        status: session.status,
                    });
                    inner.log(
                        "info",
                        format!(
                            "agent {} finished: {}",
                            session.session_id.0,
                            session.status.as_str()
                        ),
                    );
                }
            }

            project.completed_count = sessions
                .iter()
                .filter(|s| s.status == SessionStatus::Completed)
                .count();
            project.failed_count = sessions
                .iter()
                .filter(|s| {
                    matches!(s.status, SessionStatus::Failed | SessionStatus::Cancelled)
                })
                .count();
            inner.store.upsert_project(project)?;

            if sessions.iter().all(|s| s.status.is_terminal()) {
                return Ok(());
            }
            inner.sleep_poll(cancel)?;
        }
    }

    // --- Analyzing ---

    fn analyze_merge_order(
        &self,
        project: &mut GmProject,
        cancel: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        inner.check_cancel(cancel)?;
        inner.set_phase(project, ProjectPhase::Analyzing)?;

        let sessions = inner.store.list_sessions_for_project(&project.project_id)?;
        let successful: Vec<&AgentSession> = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Completed)
            .collect();

        project.merge_order = merge_order(&successful);
        inner.store.upsert_project(project)?;

        inner.hub.publish_gm(&GmEvent::MergeOrderDetermined {
            project_id: project.project_id.clone(),
            merge_order: project.merge_order.clone(),
        });
        inner.log(
            "info",
            format!(
                "merge order for {}: [{}]",
                project.project_id.0,
                project
                    .merge_order
                    .iter()
                    .map(|id| id.0.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );
        Ok(())
    }

    // --- Merging ---

    fn merge_branches(
        &self,
        project: &mut GmProject,
        repo: &RepoHandle,
        cancel: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        inner.check_cancel(cancel)?;
        inner.set_phase(project, ProjectPhase::Merging)?;

        let order = project.merge_order.clone();
        for (index, session_id) in order.iter().enumerate() {
            inner.check_cancel(cancel)?;
            project.current_merge = Some(session_id.clone());
            inner.store.upsert_project(project)?;
            self.merge_session(project, repo, session_id, index, cancel)?;
        }

        project.current_merge = None;
        inner.store.upsert_project(project)?;
        Ok(())
    }

    fn merge_session(
        &self,
        project: &mut GmProject,
        repo: &RepoHandle,
        session_id: &SessionId,
        index: usize,
        cancel: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let worktrees = inner.worktrees();
        let mut session = inner.store.require_session(session_id)?;
        let branch = session
            .branch
            .clone()
            .unwrap_or_else(|| worktrees.session_branch(session_id.as_str()));

        inner.hub.publish_gm(&GmEvent::MergeStarted {
            project_id: project.project_id.clone(),
            session_id: session_id.clone(),
            index,
        });

        let message = format!("Merge team session {}", session_id.0);
        let outcome = worktrees.merge(repo, &branch, &message)?;

        let record = |session: &mut AgentSession, result: MergeResult| {
            session.merge_result = Some(result);
            session.merge_order_index = Some(index);
        };

        if outcome.success {
            record(&mut session, MergeResult::Merged);
            inner.store.upsert_session(&session)?;
            project.merged_count += 1;
            inner.store.upsert_project(project)?;
            inner.hub.publish_gm(&GmEvent::MergeCompleted {
                project_id: project.project_id.clone(),
                session_id: session_id.clone(),
                skipped: false,
                result: MergeResult::Merged,
            });
            inner.log("info", format!("merged {} cleanly", session_id.0));
            return Ok(());
        }

        if outcome.conflicted_files.is_empty() {
            // Not a content conflict; nothing a resolver can do.
            worktrees.abort_merge(repo)?;
            record(&mut session, MergeResult::Failed);
            inner.store.upsert_session(&session)?;
            inner.hub.publish_gm(&GmEvent::MergeCompleted {
                project_id: project.project_id.clone(),
                session_id: session_id.clone(),
                skipped: true,
                result: MergeResult::Failed,
            });
            inner.log(
                "warn",
                format!("merge of {} failed outright: {}", session_id.0, outcome.stderr),
            );
            return Ok(());
        }

        inner.hub.publish_gm(&GmEvent::MergeConflict {
            project_id: project.project_id.clone(),
            session_id: session_id.clone(),
            conflicted_files: outcome.conflicted_files.clone(),
            error: outcome.stderr.clone(),
        });
        inner.log(
            "warn",
            format!(
                "merge conflict for {}: {} files",
                session_id.0,
                outcome.conflicted_files.len()
            ),
        );

        let context = format!(
            "conflicted files:\n{}\n\n{}",
            outcome.conflicted_files.join("\n"),
            outcome.stderr
        );
        let (_decision_id, waiter) = inner.gate.request(
            &project.project_id,
            DecisionKind::MergeConflict,
            format!("Merge of session {} hit conflicts", session_id.0),
            "Run the conflict resolution agent on the main checkout",
            &context,
        )?;
        let action = inner.await_decision(&waiter, cancel)?;

        if action == DecisionAction::Approve
            && self.resolve_conflicts(repo, session_id, &outcome.conflicted_files)?
        {
            record(&mut session, MergeResult::MergedResolved);
            inner.store.upsert_session(&session)?;
            project.merged_count += 1;
            inner.store.upsert_project(project)?;
            inner.hub.publish_gm(&GmEvent::ConflictResolved {
                project_id: project.project_id.clone(),
                session_id: session_id.clone(),
            });
            inner.hub.publish_gm(&GmEvent::MergeCompleted {
                project_id: project.project_id.clone(),
                session_id: session_id.clone(),
                skipped: false,
                result: MergeResult::MergedResolved,
            });
            return Ok(());
        }

        // Rejected, or the resolver could not produce a clean tree.
        worktrees.abort_merge(repo)?;
        record(&mut session, MergeResult::Skipped);
        inner.store.upsert_session(&session)?;
        inner.hub.publish_gm(&GmEvent::MergeCompleted {
            project_id: project.project_id.clone(),
            session_id: session_id.clone(),
            skipped: true,
            result: MergeResult::Skipped,
        });
        inner.log("warn", format!("skipped {}", session_id.0));
        Ok(())
    }

    /// Run the repair agent against the conflicted checkout and commit the
    /// resolution. Returns whether the tree ended up clean and committed.
    fn resolve_conflicts(
        &self,
        repo: &RepoHandle,
        session_id: &SessionId,
        conflicted_files: &[String],
    ) -> Result<bool, PipelineError> {
        let inner = &self.inner;
        let prompt = conflict_prompt(conflicted_files);
        if !self.run_repair_agent(&repo.root, &prompt, &format!("conflict-{}", session_id.0)) {
            return Ok(false);
        }

        let worktrees = inner.worktrees();
        if !worktrees.conflicted_files(repo)?.is_empty() {
            inner.log(
                "warn",
                format!("conflicts remain after resolution for {}", session_id.0),
            );
            return Ok(false);
        }

        // Conclude the merge: prefer the prepared merge message, fall back
        // to an explicit resolution commit.
        if inner
            .git
            .run_status(&repo.root, ["commit", "--no-edit"])?
            .success()
        {
            return Ok(true);
        }
        let resolution_message = format!("Resolve merge conflicts for {}", session_id.0);
        inner.git.run_status(&repo.root, ["add", "-A"])?;
        let committed = inner
            .git
            .run_status(&repo.root, ["commit", "-m", resolution_message.as_str()])?
            .success();
        Ok(committed)
    }

    // --- Building / Testing ---

    fn run_command_phase(
        &self,
        project: &mut GmProject,
        repo: &RepoHandle,
        kind: CommandPhase,
        cancel: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let Some(command) = kind.command(project) else {
            return Ok(());
        };
        let command = command.to_string();
        let max_repairs = inner.config.pipeline.max_fix_attempts;

        inner.check_cancel(cancel)?;
        inner.set_phase(project, kind.phase())?;

        loop {
            inner.check_cancel(cancel)?;
            kind.bump_attempts(project);
            inner.store.upsert_project(project)?;

            inner.hub.publish_gm(&kind.started_event(project));
            let capture = self.run_shell(&repo.root, &command);
            inner
                .hub
                .publish_gm(&kind.result_event(project, capture.success, &capture.tail));

            if capture.success {
                return Ok(());
            }

            // Exhausted repair cycles behave like a rejection.
            let repairs_so_far = kind.attempts(project).saturating_sub(1);
            if repairs_so_far >= max_repairs {
                return Err(phase_failure(&kind, "repair attempts exhausted"));
            }

            let (_decision_id, waiter) = inner.gate.request(
                &project.project_id,
                kind.decision_kind(),
                format!("{} command failed: `{}`", kind.noun(), command),
                "Run the repair agent with the failure log",
                &capture.tail,
            )?;
            let action = inner.await_decision(&waiter, cancel)?;
            if action == DecisionAction::Reject {
                return Err(phase_failure(&kind, "repair rejected"));
            }

            let attempt = kind.attempts(project);
            inner.hub.publish_gm(&kind.fix_attempt_event(project, attempt));
            inner.log(
                "info",
                format!("{} repair attempt {attempt} for {}", kind.noun(), project.project_id.0),
            );

            let prompt = kind.repair_prompt(&command, &capture.tail);
            if self.run_repair_agent(
                &repo.root,
                &prompt,
                &format!("{}-fix-{attempt}", kind.noun()),
            ) {
                let commit_message = format!("fix: {} repair attempt {attempt}", kind.noun());
                let _ = inner.git.run_status(&repo.root, ["add", "-A"])?;
                let _ = inner
                    .git
                    .run_status(&repo.root, ["commit", "-m", commit_message.as_str()])?;
            }

            // Re-enter the phase for the retry run.
            inner.set_phase(project, kind.phase())?;
        }
    }

    // --- Terminal phases ---

    fn finish_completed(&self, project: &mut GmProject) -> Result<(), PipelineError> {
        let inner = &self.inner;
        project.error_message = None;
        inner.set_phase(project, ProjectPhase::Completed)?;
        inner.hub.publish_gm(&GmEvent::ProjectCompleted {
            project_id: project.project_id.clone(),
        });
        inner.log(
            "info",
            format!("project {} completed", project.project_id.0),
        );
        Ok(())
    }

    fn finish_failed(&self, project_id: &ProjectId, reason: &str) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let mut project = inner.store.require_project(project_id)?;
        if project.phase.is_terminal() {
            return Ok(());
        }
        project.error_message = Some(reason.to_string());
        inner.set_phase(&mut project, ProjectPhase::Failed)?;
        inner.hub.publish_gm(&GmEvent::ProjectFailed {
            project_id: project_id.clone(),
            reason: reason.to_string(),
        });
        inner.log(
            "error",
            format!("project {} failed: {reason}", project_id.0),
        );
        Ok(())
    }

    // --- Cancellation ---

    /// Cancel a running project: stop its sessions, auto-reject pending
    /// decisions, and let the supervisor finish as failed/"cancelled".
    pub fn cancel_project(&self, project_id: &ProjectId) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let cancel = {
            let active = inner.active();
            active
                .get(&project_id.0)
                .map(|handle| Arc::clone(&handle.cancel))
        }
        .ok_or_else(|| PipelineError::ProjectNotActive {
            project_id: project_id.0.clone(),
        })?;

        cancel.store(true, Ordering::SeqCst);

        let sessions = inner.store.list_sessions_for_project(project_id)?;
        for session in sessions {
            if session.status == SessionStatus::Running {
                inner.launcher.cancel(&session.session_id);
            }
        }

        let rejected = inner.gate.reject_all_pending(project_id)?;
        if rejected > 0 {
            inner.log(
                "warn",
                format!("auto-rejected {rejected} pending decisions for cancelled project"),
            );
        }
        Ok(())
    }

    /// Shutdown: cancel every active project.
    pub fn cancel_all(&self) {
        let project_ids: Vec<String> = self.inner.active().keys().cloned().collect();
        for project_id in project_ids {
            let _ = self.cancel_project(&ProjectId::new(project_id));
        }
    }

    pub fn wait_for_terminal(
        &self,
        project_id: &ProjectId,
        budget: Duration,
    ) -> Option<ProjectPhase> {
        let deadline = Instant::now() + budget;
        loop {
            if let Ok(Some(project)) = self.inner.store.load_project(project_id) {
                if project.phase.is_terminal() {
                    return Some(project.phase);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    // --- Decisions (pass-through for external drivers) ---

    pub fn resolve_decision(
        &self,
        decision_id: &gm_core::types::DecisionId,
        action: DecisionAction,
    ) -> Result<gm_core::types::Decision, PipelineError> {
        Ok(self.inner.gate.resolve(decision_id, action)?)
    }

    pub fn pending_decisions(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<gm_core::types::Decision>, PipelineError> {
        Ok(self.inner.gate.pending_for(project_id)?)
    }

    // --- Operator extras ---

    /// Re-run the back half of a failed project: merge previously skipped
    /// sessions, then build and test again.
    pub fn retry_project(&self, project_id: &ProjectId) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let mut project = inner.store.require_project(project_id)?;
        if project.phase != ProjectPhase::Failed {
            return Err(PipelineError::NotFailed {
                project_id: project_id.0.clone(),
            });
        }

        let repo = discover_repo(&project.repo_path, &inner.git)?;
        let cancel = AtomicBool::new(false);

        let skipped: Vec<(usize, SessionId)> = inner
            .store
            .list_sessions_for_project(project_id)?
            .into_iter()
            .filter(|session| session.merge_result == Some(MergeResult::Skipped))
            .map(|session| {
                (
                    session.merge_order_index.unwrap_or(0),
                    session.session_id,
                )
            })
            .collect();

        let lock = inner.merge_locks.lock_for(&project.repo_path);
        let _guard = acquire(&lock);

        if !skipped.is_empty() {
            inner.set_phase(&mut project, ProjectPhase::Merging)?;
            for (index, session_id) in &skipped {
                self.merge_session(&mut project, &repo, session_id, *index, &cancel)?;
            }
        } else {
            // Enter a repo-mutating phase so the retry edges stay legal.
            let next_phase = if project.build_command.is_some() {
                ProjectPhase::Building
            } else {
                ProjectPhase::Testing
            };
            inner.set_phase(&mut project, next_phase)?;
        }

        let result: Result<(), PipelineError> = (|| {
            self.run_command_phase(&mut project, &repo, CommandPhase::Build, &cancel)?;
            self.run_command_phase(&mut project, &repo, CommandPhase::Test, &cancel)?;
            Ok(())
        })();

        match result {
            Ok(()) => self.finish_completed(&mut project),
            Err(err) => {
                let reason = err.to_string();
                self.finish_failed(project_id, &reason)?;
                Err(err)
            }
        }
    }

    /// Push the merged result to the repo's upstream.
    pub fn push_project(&self, project_id: &ProjectId) -> Result<String, PipelineError> {
        let inner = &self.inner;
        let project = inner.store.require_project(project_id)?;
        let repo = discover_repo(&project.repo_path, &inner.git)?;
        Ok(push(&repo, &inner.git)?)
    }

    /// Drop a session's worktree and branch without merging.
    pub fn discard_session(
        &self,
        repo_path: &Path,
        session_id: &SessionId,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let repo = discover_repo(repo_path, &inner.git)?;
        inner.worktrees().remove(&repo, session_id.as_str())?;
        inner.log("info", format!("discarded worktree for {}", session_id.0));
        Ok(())
    }

    // --- Subprocess helpers ---

    fn run_shell(&self, repo_root: &Path, command: &str) -> CommandCapture {
        let inner = &self.inner;
        let timeout = Duration::from_secs(inner.config.pipeline.command_timeout_secs.max(1));
        run_captured(
            Command::new(&inner.config.pipeline.shell)
                .arg("-lc")
                .arg(command)
                .current_dir(repo_root),
            timeout,
        )
    }

    /// Spawn the repair agent in the repo checkout and wait for it. The
    /// backend is the same one teammates run under; no new worktree.
    fn run_repair_agent(&self, repo_root: &Path, prompt: &str, label: &str) -> bool {
        let inner = &self.inner;
        let timeout_secs = inner.config.pipeline.repair_timeout_secs.max(1);
        let invocation = AgentInvocation::new(repo_root, prompt, timeout_secs);
        let command = inner.backend.build_command(&invocation);

        inner.log("info", format!("spawning repair agent for {label}"));
        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.args).current_dir(repo_root);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let capture = run_captured(&mut cmd, Duration::from_secs(timeout_secs));
        if !capture.success {
            inner.log(
                "warn",
                format!("repair agent {label} failed: {}", output_tail(&capture.tail, 500)),
            );
        }
        capture.success
    }
}

/// Build vs. test: same control flow, different commands, counters, and
/// event constructors.
enum CommandPhase {
    Build,
    Test,
}

impl CommandPhase {
    fn command<'a>(&self, project: &'a GmProject) -> Option<&'a str> {
        match self {
            CommandPhase::Build => project.build_command.as_deref(),
            CommandPhase::Test => project.test_command.as_deref(),
        }
    }

    fn phase(&self) -> ProjectPhase {
        match self {
            CommandPhase::Build => ProjectPhase::Building,
            CommandPhase::Test => ProjectPhase::Testing,
        }
    }

    fn noun(&self) -> &'static str {
        match self {
            CommandPhase::Build => "build",
            CommandPhase::Test => "test",
        }
    }

    fn decision_kind(&self) -> DecisionKind {
        match self {
            CommandPhase::Build => DecisionKind::BuildFailure,
            CommandPhase::Test => DecisionKind::TestFailure,
        }
    }

    fn attempts(&self, project: &GmProject) -> u32 {
        match self {
            CommandPhase::Build => project.build_attempts,
            CommandPhase::Test => project.test_attempts,
        }
    }

    fn bump_attempts(&self, project: &mut GmProject) {
        match self {
            CommandPhase::Build => project.build_attempts += 1,
            CommandPhase::Test => project.test_attempts += 1,
        }
    }

    fn repair_prompt(&self, command: &str, tail: &str) -> String {
        match self {
            CommandPhase::Build => build_fix_prompt(command, tail),
            CommandPhase::Test => test_fix_prompt(command, tail),
        }
    }

    fn started_event(&self, project: &GmProject) -> GmEvent {
        match self {
            CommandPhase::Build => GmEvent::BuildStarted {
                project_id: project.project_id.clone(),
            },
            CommandPhase::Test => GmEvent::TestStarted {
                project_id: project.project_id.clone(),
            },
        }
    }

    fn result_event(&self, project: &GmProject, success: bool, tail: &str) -> GmEvent {
        let output_tail = if success {
            String::new()
        } else {
            output_tail(tail, OUTPUT_TAIL_BYTES)
        };
        match self {
            CommandPhase::Build => GmEvent::BuildResult {
                project_id: project.project_id.clone(),
                success,
                output_tail,
            },
            CommandPhase::Test => GmEvent::TestResult {
                project_id: project.project_id.clone(),
                success,
                output_tail,
            },
        }
    }

    fn fix_attempt_event(&self, project: &GmProject, attempt: u32) -> GmEvent {
        match self {
            CommandPhase::Build => GmEvent::BuildFixAttempt {
                project_id: project.project_id.clone(),
                attempt,
            },
            CommandPhase::Test => GmEvent::TestFixAttempt {
                project_id: project.project_id.clone(),
                attempt,
            },
        }
    }
}

struct CommandCapture {
    success: bool,
    tail: String,
}

/// Run a command with combined, bounded output capture and a hard timeout.
fn run_captured(cmd: &mut Command, timeout: Duration) -> CommandCapture {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    configure_process_group(cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return CommandCapture {
                success: false,
                tail: format!("failed to spawn command: {err}"),
            }
        }
    };
    let pid = child.id();

    let collector = |stream: Option<Box<dyn Read + Send>>| -> JoinHandle<String> {
        thread::spawn(move || {
            let mut buffer = String::new();
            if let Some(mut stream) = stream {
                let mut bytes = Vec::new();
                let _ = stream.read_to_end(&mut bytes);
                buffer = String::from_utf8_lossy(&bytes).into_owned();
            }
            buffer
        })
    };
    let stdout_handle = collector(
        child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>),
    );
    let stderr_handle = collector(
        child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>),
    );

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(_) => break None,
        }
        if Instant::now() >= deadline {
            timed_out = true;
            let _ = kill_group(pid);
            break child.wait().ok();
        }
        thread::sleep(Duration::from_millis(25));
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    let mut combined = String::new();
    combined.push_str(&stdout);
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    if timed_out {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str("command timed out");
    }

    CommandCapture {
        success: !timed_out && status.map(|s| s.success()).unwrap_or(false),
        tail: output_tail(&combined, OUTPUT_TAIL_BYTES * 4),
    }
}

fn phase_failure(kind: &CommandPhase, detail: &str) -> PipelineError {
    PipelineError::Phase {
        message: format!("{} failed ({detail})", kind.noun()),
    }
}

/// The last `max_bytes` of `text`, cut at a char boundary.
fn output_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Ascending conflict-proxy order: for each file a session changed, count
/// the other successful sessions that changed it too; sum per session; ties
/// break by start time, then id.
pub(crate) fn merge_order(successful: &[&AgentSession]) -> Vec<SessionId> {
    let mut touched_by: HashMap<&str, usize> = HashMap::new();
    for session in successful {
        for file in &session.files_changed {
            *touched_by.entry(file.as_str()).or_insert(0) += 1;
        }
    }

    let mut scored: Vec<(usize, &&AgentSession)> = successful
        .iter()
        .map(|session| {
            let score = session
                .files_changed
                .iter()
                .map(|file| touched_by.get(file.as_str()).copied().unwrap_or(1) - 1)
                .sum();
            (score, session)
        })
        .collect();

    scored.sort_by(|(score_a, a), (score_b, b)| {
        score_a
            .cmp(score_b)
            .then(a.started_at.cmp(&b.started_at))
            .then(a.session_id.0.cmp(&b.session_id.0))
    });

    scored
        .into_iter()
        .map(|(_, session)| session.session_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{EventHub, CHANNEL_GM};
    use gm_agents::AgentCommand;
    use gm_core::config::parse_config;
    use gm_core::state::DecisionStatus;
    use gm_core::types::{AgentSpec, DecisionId};
    use serde_json::Value;
    use std::fs;
    use std::path::PathBuf;
    use std::process::Command as StdCommand;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Picks a script by the team named in the prompt's first line; prompts
    /// without a team header (conflict/build/test repair) run the repair
    /// script.
    struct TeamScriptBackend {
        scripts: HashMap<String, String>,
        repair_script: String,
    }

    impl AgentBackend for TeamScriptBackend {
        fn name(&self) -> &'static str {
            "script"
        }

        fn build_command(&self, invocation: &AgentInvocation) -> AgentCommand {
            let team = invocation
                .prompt
                .strip_prefix("Team: ")
                .and_then(|rest| rest.lines().next());
            let script = team
                .and_then(|team| self.scripts.get(team))
                .unwrap_or(&self.repair_script)
                .clone();
            AgentCommand {
                executable: "bash".to_string(),
                args: vec!["-c".to_string(), script],
                env: invocation.env.clone(),
            }
        }
    }

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("gm-pipeline-{prefix}-{now}"))
    }

    fn run_git(cwd: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_repo() -> PathBuf {
        let root = unique_temp_dir("repo");
        fs::create_dir_all(&root).expect("create temp repo");
        run_git(&root, &["init"]);
        fs::write(root.join("README.md"), "init\n").expect("write file");
        run_git(&root, &["add", "-A"]);
        run_git(
            &root,
            &[
                "-c",
                "user.name=Test User",
                "-c",
                "user.email=test@example.com",
                "commit",
                "-m",
                "init",
            ],
        );
        // Merge commits need an identity too.
        run_git(&root, &["config", "user.name", "Test User"]);
        run_git(&root, &["config", "user.email", "test@example.com"]);
        root
    }

    struct Harness {
        manager: GeneralManager,
        store: Arc<SqliteStore>,
        hub: EventHub,
        repo: PathBuf,
        outputs: PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.repo);
            let _ = fs::remove_dir_all(&self.outputs);
        }
    }

    fn mk_harness(team_scripts: &[(&str, &str)], repair_script: &str) -> Harness {
        let outputs = unique_temp_dir("outputs");
        let repo = init_repo();

        let mut config_text = format!(
            r#"
[launcher]
outputs_dir = "{outputs}"
stop_grace_secs = 1
poll_interval_ms = 20
resource_error_threshold = 2

[pipeline]
poll_interval_secs = 1
max_fix_attempts = 3
command_timeout_secs = 60
repair_timeout_secs = 60
shell = "bash"
"#,
            outputs = outputs.display(),
        );
        for (team, _) in team_scripts {
            config_text.push_str(&format!(
                "\n[teams.{team}]\nteammates = [{{ name = \"solo\", timeout_seconds = 60 }}]\n"
            ));
        }
        let mut config = parse_config(&config_text).expect("parse harness config");
        config.hub.heartbeat_interval_secs = 60;

        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        store.migrate().expect("migrate");
        let hub = EventHub::new(config.hub.clone());

        let backend = Arc::new(TeamScriptBackend {
            scripts: team_scripts
                .iter()
                .map(|(team, script)| (team.to_string(), script.to_string()))
                .collect(),
            repair_script: repair_script.to_string(),
        });

        let manager = GeneralManager::new(config, Arc::clone(&store), hub.clone(), backend);
        Harness {
            manager,
            store,
            hub,
            repo,
            outputs,
        }
    }

    fn request(harness: &Harness, teams: &[&str]) -> LaunchRequest {
        LaunchRequest {
            project_name: "scenario".to_string(),
            repo_path: harness.repo.clone(),
            build_command: None,
            test_command: None,
            agents: teams
                .iter()
                .map(|team| AgentSpec {
                    team: team.to_string(),
                    task: format!("work for {team}"),
                })
                .collect(),
        }
    }

    /// Resolve every decision_required event with a fixed action until
    /// stopped.
    fn auto_resolver(
        harness: &Harness,
        action: DecisionAction,
    ) -> (thread::JoinHandle<()>, Arc<AtomicBool>) {
        let sub = harness.hub.subscribe(CHANNEL_GM);
        let manager = harness.manager.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                if let Some(event) = sub.recv_timeout(Duration::from_millis(100)) {
                    if event["type"] == "decision_required" {
                        let decision_id = DecisionId::new(
                            event["decision_id"].as_str().expect("decision id").to_string(),
                        );
                        let _ = manager.resolve_decision(&decision_id, action);
                    }
                }
            }
        });
        (handle, stop)
    }

    fn phase_sequence(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .filter(|event| event["type"] == "phase_change")
            .map(|event| event["phase"].as_str().expect("phase tag").to_string())
            .collect()
    }

    fn drain(sub: &crate::hub::Subscription) -> Vec<Value> {
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn s1_two_non_overlapping_agents_complete_without_decisions() {
        let harness = mk_harness(
            &[
                ("alpha", "echo 'alpha work' > src_x.rs"),
                ("beta", "echo 'beta work' > src_y.rs"),
            ],
            "true",
        );
        let sub = harness.hub.subscribe(CHANNEL_GM);

        let project_id = harness
            .manager
            .launch_project(request(&harness, &["alpha", "beta"]))
            .expect("launch");
        let phase = harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");
        assert_eq!(phase, ProjectPhase::Completed);

        let project = harness
            .store
            .require_project(&project_id)
            .expect("project row");
        assert_eq!(project.merged_count, 2);
        assert_eq!(project.completed_count, 2);
        assert_eq!(project.failed_count, 0);
        assert!(project.error_message.is_none());
        assert_eq!(project.merge_order.len(), 2);

        // Both branches landed in the host checkout.
        assert!(harness.repo.join("src_x.rs").exists());
        assert!(harness.repo.join("src_y.rs").exists());

        // Zero decisions, and every session merged cleanly.
        assert!(harness
            .store
            .list_decisions_for(&project_id)
            .expect("decisions")
            .is_empty());
        let sessions = harness
            .store
            .list_sessions_for_project(&project_id)
            .expect("sessions");
        assert!(sessions
            .iter()
            .all(|s| s.merge_result == Some(MergeResult::Merged)));

        // Phase events follow the machine, each exactly once.
        let events = drain(&sub);
        assert_eq!(
            phase_sequence(&events),
            vec!["waiting", "analyzing", "merging", "completed"]
        );
        assert!(events.iter().any(|e| e["type"] == "project_completed"));
    }

    #[test]
    fn s2_overlapping_agents_resolve_conflict_when_approved() {
        let harness = mk_harness(
            &[
                ("alpha", "echo alpha > conflict.txt"),
                ("beta", "echo beta > conflict.txt && echo extra > src_y.rs"),
            ],
            "echo merged > conflict.txt && git add conflict.txt",
        );
        let (resolver, stop) = auto_resolver(&harness, DecisionAction::Approve);

        let project_id = harness
            .manager
            .launch_project(request(&harness, &["alpha", "beta"]))
            .expect("launch");
        let phase = harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");
        assert_eq!(phase, ProjectPhase::Completed);

        let project = harness
            .store
            .require_project(&project_id)
            .expect("project row");
        assert_eq!(project.merged_count, 2);

        // The earlier-started session merged clean; the later one needed the
        // resolver.
        let sessions = harness
            .store
            .list_sessions_for_project(&project_id)
            .expect("sessions");
        let results: Vec<Option<MergeResult>> =
            sessions.iter().map(|s| s.merge_result).collect();
        assert!(results.contains(&Some(MergeResult::Merged)));
        assert!(results.contains(&Some(MergeResult::MergedResolved)));
        assert_eq!(
            project.merge_order[0],
            sessions[0].session_id,
            "tie breaks by started_at"
        );

        let content = fs::read_to_string(harness.repo.join("conflict.txt")).expect("read");
        assert_eq!(content.trim(), "merged");

        // The decision survives, approved, for audit.
        let decisions = harness
            .store
            .list_decisions_for(&project_id)
            .expect("decisions");
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].status, DecisionStatus::Approved);
        assert_eq!(decisions[0].kind, DecisionKind::MergeConflict);

        stop.store(true, Ordering::SeqCst);
        resolver.join().expect("join resolver");
    }

    #[test]
    fn s3_rejected_conflict_skips_the_session() {
        let harness = mk_harness(
            &[
                ("alpha", "echo alpha > conflict.txt"),
                ("beta", "echo beta > conflict.txt && echo extra > src_y.rs"),
            ],
            "true",
        );
        let (resolver, stop) = auto_resolver(&harness, DecisionAction::Reject);

        let project_id = harness
            .manager
            .launch_project(request(&harness, &["alpha", "beta"]))
            .expect("launch");
        let phase = harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");
        assert_eq!(phase, ProjectPhase::Completed);

        let project = harness
            .store
            .require_project(&project_id)
            .expect("project row");
        assert_eq!(project.merged_count, 1);

        let sessions = harness
            .store
            .list_sessions_for_project(&project_id)
            .expect("sessions");
        let results: Vec<Option<MergeResult>> =
            sessions.iter().map(|s| s.merge_result).collect();
        assert!(results.contains(&Some(MergeResult::Merged)));
        assert!(results.contains(&Some(MergeResult::Skipped)));

        // The abort restored the first merge's version.
        let content = fs::read_to_string(harness.repo.join("conflict.txt")).expect("read");
        assert_eq!(content.trim(), "alpha");

        stop.store(true, Ordering::SeqCst);
        resolver.join().expect("join resolver");
    }

    #[test]
    fn s4_build_failure_is_repaired_after_approval() {
        let harness = mk_harness(
            &[("alpha", "echo work > feature.txt")],
            "touch fixed.txt",
        );
        let (resolver, stop) = auto_resolver(&harness, DecisionAction::Approve);
        let sub = harness.hub.subscribe(CHANNEL_GM);

        let mut launch = request(&harness, &["alpha"]);
        launch.build_command = Some("test -f fixed.txt".to_string());

        let project_id = harness.manager.launch_project(launch).expect("launch");
        let phase = harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");
        assert_eq!(phase, ProjectPhase::Completed);

        let project = harness
            .store
            .require_project(&project_id)
            .expect("project row");
        assert_eq!(project.build_attempts, 2);
        assert_eq!(project.test_attempts, 0);

        let events = drain(&sub);
        let build_results: Vec<bool> = events
            .iter()
            .filter(|e| e["type"] == "build_result")
            .map(|e| e["success"].as_bool().expect("success flag"))
            .collect();
        assert_eq!(build_results, vec![false, true]);
        assert!(events
            .iter()
            .any(|e| e["type"] == "build_fix_attempt" && e["attempt"] == 1));

        stop.store(true, Ordering::SeqCst);
        resolver.join().expect("join resolver");
    }

    #[test]
    fn s5_resource_killed_agent_still_lets_the_project_complete() {
        let script = "echo 'No space left on device' >&2; \
                      echo 'No space left on device' >&2; \
                      sleep 30";
        let harness = mk_harness(&[("alpha", script)], "true");

        let project_id = harness
            .manager
            .launch_project(request(&harness, &["alpha"]))
            .expect("launch");
        let phase = harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");
        assert_eq!(phase, ProjectPhase::Completed);

        let project = harness
            .store
            .require_project(&project_id)
            .expect("project row");
        assert_eq!(project.merged_count, 0);
        assert_eq!(project.failed_count, 1);
        assert!(project.merge_order.is_empty());

        let sessions = harness
            .store
            .list_sessions_for_project(&project_id)
            .expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Failed);
    }

    #[test]
    fn s6_cancel_mid_waiting_fails_the_project_and_sessions() {
        let harness = mk_harness(&[("alpha", "sleep 30")], "true");

        let project_id = harness
            .manager
            .launch_project(LaunchRequest {
                project_name: "cancelme".to_string(),
                repo_path: harness.repo.clone(),
                build_command: None,
                test_command: None,
                agents: (0..3)
                    .map(|index| AgentSpec {
                        team: "alpha".to_string(),
                        task: format!("slot {index}"),
                    })
                    .collect(),
            })
            .expect("launch");

        // Give the pipeline a moment to reach waiting.
        thread::sleep(Duration::from_millis(300));
        harness
            .manager
            .cancel_project(&project_id)
            .expect("cancel");

        let phase = harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");
        assert_eq!(phase, ProjectPhase::Failed);

        let project = harness
            .store
            .require_project(&project_id)
            .expect("project row");
        assert_eq!(project.error_message.as_deref(), Some("cancelled"));

        let sessions = harness
            .store
            .list_sessions_for_project(&project_id)
            .expect("sessions");
        assert_eq!(sessions.len(), 3);
        for session in &sessions {
            assert_eq!(session.status, SessionStatus::Cancelled);
        }

        // Cancelling again is an error: the project is no longer active.
        let err = harness
            .manager
            .cancel_project(&project_id)
            .expect_err("already gone");
        assert!(matches!(err, PipelineError::ProjectNotActive { .. }));
    }

    #[test]
    fn unknown_team_leaves_a_synthetic_failed_session() {
        let harness = mk_harness(&[("alpha", "echo ok > from_alpha.txt")], "true");

        let project_id = harness
            .manager
            .launch_project(request(&harness, &["alpha", "ghost"]))
            .expect("launch");
        let phase = harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");
        assert_eq!(phase, ProjectPhase::Completed);

        let sessions = harness
            .store
            .list_sessions_for_project(&project_id)
            .expect("sessions");
        assert_eq!(sessions.len(), 2);
        let ghost = sessions
            .iter()
            .find(|s| s.team_name == "ghost")
            .expect("synthetic session");
        assert_eq!(ghost.status, SessionStatus::Failed);
        assert!(ghost.branch.is_none());

        let project = harness
            .store
            .require_project(&project_id)
            .expect("project row");
        assert_eq!(project.merged_count, 1);
    }

    #[test]
    fn rejected_build_repair_fails_project_and_retry_recovers_it() {
        let harness = mk_harness(&[("alpha", "echo work > feature.txt")], "true");
        let (resolver, stop) = auto_resolver(&harness, DecisionAction::Reject);

        let mut launch = request(&harness, &["alpha"]);
        launch.build_command = Some("test -f fixed.txt".to_string());

        let project_id = harness.manager.launch_project(launch).expect("launch");
        let phase = harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");
        assert_eq!(phase, ProjectPhase::Failed);

        let project = harness
            .store
            .require_project(&project_id)
            .expect("project row");
        assert!(project
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("build failed")));

        stop.store(true, Ordering::SeqCst);
        resolver.join().expect("join resolver");

        // Operator fixes the tree by hand, then retries.
        fs::write(harness.repo.join("fixed.txt"), "ok\n").expect("write fix");
        harness
            .manager
            .retry_project(&project_id)
            .expect("retry should pass");

        let project = harness
            .store
            .require_project(&project_id)
            .expect("project row");
        assert_eq!(project.phase, ProjectPhase::Completed);
        assert!(project.error_message.is_none());
    }

    #[test]
    fn retry_rejects_projects_that_are_not_failed() {
        let harness = mk_harness(&[("alpha", "true")], "true");

        let project_id = harness
            .manager
            .launch_project(request(&harness, &["alpha"]))
            .expect("launch");
        harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");

        let err = harness
            .manager
            .retry_project(&project_id)
            .expect_err("completed projects cannot retry");
        assert!(matches!(err, PipelineError::NotFailed { .. }));
    }

    #[test]
    fn sweep_interrupted_fails_leftover_projects() {
        let harness = mk_harness(&[("alpha", "true")], "true");

        let mut leftover = GmProject::new(
            ProjectId::new("P-leftover"),
            "stale",
            harness.repo.clone(),
        );
        leftover.phase = ProjectPhase::Merging;
        harness.store.upsert_project(&leftover).expect("upsert");

        let swept = harness.manager.sweep_interrupted().expect("sweep");
        assert_eq!(swept, 1);

        let project = harness
            .store
            .require_project(&ProjectId::new("P-leftover"))
            .expect("project row");
        assert_eq!(project.phase, ProjectPhase::Failed);
        assert_eq!(project.error_message.as_deref(), Some("interrupted"));
    }

    #[test]
    fn discard_session_removes_worktree_and_branch() {
        let harness = mk_harness(&[("alpha", "echo ok > out.txt")], "true");

        let project_id = harness
            .manager
            .launch_project(request(&harness, &["alpha"]))
            .expect("launch");
        harness
            .manager
            .wait_for_terminal(&project_id, Duration::from_secs(60))
            .expect("project should finish");

        let sessions = harness
            .store
            .list_sessions_for_project(&project_id)
            .expect("sessions");
        let session_id = sessions[0].session_id.clone();

        harness
            .manager
            .discard_session(&harness.repo, &session_id)
            .expect("discard");

        let git = GitCli::default();
        let repo = discover_repo(&harness.repo, &git).expect("repo");
        let worktrees = WorktreeManager::default();
        let listed = worktrees.list(&repo).expect("list worktrees");
        assert!(listed
            .iter()
            .all(|entry| !entry.path.ends_with(session_id.as_str())));
    }

    // --- Pure helpers ---

    fn session_with_files(id: &str, files: &[&str], offset_secs: i64) -> AgentSession {
        let mut session = AgentSession::new(SessionId::new(id), "team", "task");
        session.status = SessionStatus::Completed;
        session.files_changed = files.iter().map(|f| f.to_string()).collect();
        session.started_at = Utc::now() + chrono::Duration::seconds(offset_secs);
        session
    }

    #[test]
    fn merge_order_sorts_least_overlapping_first() {
        let a = session_with_files("A", &["src/x.rs", "src/shared.rs"], 0);
        let b = session_with_files("B", &["src/y.rs"], 1);
        let c = session_with_files("C", &["src/shared.rs", "src/z.rs"], 2);

        // Scores: A=1 (shared), B=0, C=1.
        let order = merge_order(&[&a, &b, &c]);
        assert_eq!(order[0].0, "B");
        assert_eq!(order[1].0, "A");
        assert_eq!(order[2].0, "C");
    }

    #[test]
    fn merge_order_ties_break_by_start_time_then_id() {
        let mut a = session_with_files("B-later", &["src/x.rs"], 5);
        let b = session_with_files("A-earlier", &["src/x.rs"], 0);
        let order = merge_order(&[&a, &b]);
        assert_eq!(order[0].0, "A-earlier");

        // Identical timestamps fall back to the id.
        a.started_at = b.started_at;
        let order = merge_order(&[&a, &b]);
        assert_eq!(order[0].0, "A-earlier");
        assert_eq!(order[1].0, "B-later");
    }

    #[test]
    fn merge_order_of_disjoint_sessions_is_all_zero_scores() {
        let a = session_with_files("A", &["src/x.rs"], 1);
        let b = session_with_files("B", &["src/y.rs"], 0);
        let order = merge_order(&[&a, &b]);
        // All scores zero: started_at decides.
        assert_eq!(order[0].0, "B");
    }

    #[test]
    fn output_tail_respects_char_boundaries() {
        let text = "héllo wörld";
        let tail = output_tail(text, 4);
        assert!(tail.len() <= 4);
        assert!(text.ends_with(&tail));

        assert_eq!(output_tail("short", 100), "short");
    }
}
