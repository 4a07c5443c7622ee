//! Per-session subprocess supervision.
//!
//! One supervisor thread per session drives the agent subprocess: it drains
//! both output streams, feeds the resource watchdog, enforces the wall-clock
//! timeout, auto-commits the worktree on exit, and finalises the session row.

use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gm_agents::{
    configure_process_group, kill_group, team_prompt, terminate_group, validate_invocation,
    AgentBackend, AgentInvocation, ResourceWatchdog, AGENT_TEAMS_ENV,
};
use gm_core::config::GmConfig;
use gm_core::events::{TeamEvent, TeamStream};
use gm_core::state::SessionStatus;
use gm_core::types::{generate_id, AgentSession, ProjectId, SessionId, TeamTemplate, TeammateTask};
use gm_git::{discover_repo, GitCli, GitError, RepoHandle, WorktreeManager};

use crate::hub::EventHub;
use crate::ring::OutputRing;
use crate::store::{SqliteStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("unknown team template: {team}")]
    TemplateNotFound { team: String },
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to spawn agent for session {session_id}: {message}")]
    Spawn {
        session_id: SessionId,
        message: String,
    },
}

impl LaunchError {
    /// The session id of a launch that failed after its row was created.
    pub fn failed_session(&self) -> Option<&SessionId> {
        match self {
            LaunchError::Spawn { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct SessionHandle {
    pid: u32,
    cancel_requested: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
}

struct LauncherInner {
    config: GmConfig,
    store: Arc<SqliteStore>,
    hub: EventHub,
    backend: Arc<dyn AgentBackend>,
    git: GitCli,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl LauncherInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worktrees(&self) -> WorktreeManager {
        WorktreeManager::new(
            self.git.clone(),
            &self.config.worktree.subdir,
            &self.config.worktree.branch_prefix,
        )
    }
}

/// Cheaply cloneable supervisor for agent sessions.
#[derive(Clone)]
pub struct TeamLauncher {
    inner: Arc<LauncherInner>,
}

impl TeamLauncher {
    pub fn new(
        config: GmConfig,
        store: Arc<SqliteStore>,
        hub: EventHub,
        backend: Arc<dyn AgentBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(LauncherInner {
                config,
                store,
                hub,
                backend,
                git: GitCli::default(),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn launch(
        &self,
        team_name: &str,
        task: &str,
        repo_path: &Path,
    ) -> Result<SessionId, LaunchError> {
        self.launch_for_project(team_name, task, repo_path, None)
    }

    /// Launch a session bound to a GM project. The project id lands on the
    /// session row before the supervisor can observe termination.
    pub fn launch_for_project(
        &self,
        team_name: &str,
        task: &str,
        repo_path: &Path,
        project_id: Option<ProjectId>,
    ) -> Result<SessionId, LaunchError> {
        let inner = &self.inner;
        let template = inner
            .config
            .team(team_name)
            .ok_or_else(|| LaunchError::TemplateNotFound {
                team: team_name.to_string(),
            })?;

        let session_id = SessionId::new(generate_id());
        let repo = discover_repo(repo_path, &inner.git)?;
        let worktrees = inner.worktrees();
        let info = worktrees.create(&repo, session_id.as_str())?;

        let mut session = AgentSession::new(session_id.clone(), team_name, task);
        session.project_id = project_id;
        session.mark_running(info.branch.clone(), info.path.clone());
        inner.store.upsert_session(&session)?;
        inner
            .store
            .replace_teammate_tasks(&session_id, &pending_teammates(&session_id, &template))?;

        let timeout = Duration::from_secs(template.session_timeout_seconds());
        let invocation = AgentInvocation::new(
            &info.path,
            team_prompt(team_name, task),
            template.session_timeout_seconds(),
        )
        .with_env(AGENT_TEAMS_ENV.0, AGENT_TEAMS_ENV.1);

        if let Err(err) = validate_invocation(&invocation) {
            return self.fail_before_spawn(session, err.to_string());
        }

        let command = inner.backend.build_command(&invocation);
        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.args)
            .current_dir(&info.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        // One shared artifact directory across all worktrees of a Rust repo,
        // so every session does not rebuild the world from scratch.
        if repo.root.join("Cargo.toml").exists() {
            cmd.env("CARGO_TARGET_DIR", repo.root.join(".shared-target"));
        }
        configure_process_group(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return self.fail_before_spawn(session, err.to_string()),
        };

        let pid = child.id();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        inner.sessions().insert(
            session_id.0.clone(),
            SessionHandle {
                pid,
                cancel_requested: Arc::clone(&cancel_requested),
                exited: Arc::clone(&exited),
            },
        );

        let (line_tx, line_rx) = mpsc::channel::<(TeamStream, String)>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, TeamStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, TeamStream::Stderr, line_tx));
        } else {
            drop(line_tx);
        }

        inner
            .hub
            .publish_team(&TeamEvent::started(session_id.clone(), team_name));

        let supervisor_inner = Arc::clone(inner);
        thread::spawn(move || {
            supervise(
                supervisor_inner,
                session,
                repo,
                child,
                pid,
                line_rx,
                readers,
                cancel_requested,
                exited,
                timeout,
            );
        });

        Ok(session_id)
    }

    fn fail_before_spawn(
        &self,
        mut session: AgentSession,
        message: String,
    ) -> Result<SessionId, LaunchError> {
        let session_id = session.session_id.clone();
        session.mark_terminal(SessionStatus::Failed, None, Vec::new());
        self.inner.store.upsert_session(&session)?;
        self.inner.hub.publish_team(&TeamEvent::terminal(
            session_id.clone(),
            SessionStatus::Failed,
            None,
        ));
        Err(LaunchError::Spawn {
            session_id,
            message,
        })
    }

    /// Graceful-stop a running session, hard-killing after the grace period.
    /// A session that is not running is a no-op; returns whether anything
    /// was signalled.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let handle = self.inner.sessions().get(&session_id.0).cloned();
        let Some(handle) = handle else {
            return false;
        };
        if handle.exited.load(Ordering::SeqCst) {
            return false;
        }

        handle.cancel_requested.store(true, Ordering::SeqCst);
        let _ = terminate_group(handle.pid);

        let grace = Duration::from_secs(self.inner.config.launcher.stop_grace_secs);
        let deadline = Instant::now() + grace;
        while !handle.exited.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(25));
        }
        if !handle.exited.load(Ordering::SeqCst) {
            let _ = kill_group(handle.pid);
        }
        true
    }

    /// Shutdown path: cancel every running session.
    pub fn cancel_all(&self) {
        let running: Vec<String> = self.inner.sessions().keys().cloned().collect();
        for session_id in running {
            self.cancel(&SessionId::new(session_id));
        }
    }

    pub fn running_sessions(&self) -> Vec<SessionId> {
        self.inner
            .sessions()
            .iter()
            .filter(|(_, handle)| !handle.exited.load(Ordering::SeqCst))
            .map(|(id, _)| SessionId::new(id.clone()))
            .collect()
    }

    /// Poll the store until the session reaches a terminal status.
    pub fn wait_for_terminal(
        &self,
        session_id: &SessionId,
        budget: Duration,
    ) -> Option<SessionStatus> {
        let deadline = Instant::now() + budget;
        loop {
            if let Ok(Some(session)) = self.inner.store.load_session(session_id) {
                if session.status.is_terminal() {
                    return Some(session.status);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

fn pending_teammates(session_id: &SessionId, template: &TeamTemplate) -> Vec<TeammateTask> {
    template
        .teammates
        .iter()
        .map(|teammate| TeammateTask {
            session_id: session_id.clone(),
            teammate: teammate.name.clone(),
            role: teammate.role.clone(),
            status: SessionStatus::Pending,
            output: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        })
        .collect()
}

fn spawn_line_reader<R: std::io::Read + Send + 'static>(
    stream: R,
    kind: TeamStream,
    tx: Sender<(TeamStream, String)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send((kind, line)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

enum KillReason {
    Timeout,
    Resource(String),
}

#[allow(clippy::too_many_arguments)]
fn supervise(
    inner: Arc<LauncherInner>,
    mut session: AgentSession,
    repo: RepoHandle,
    mut child: Child,
    pid: u32,
    line_rx: Receiver<(TeamStream, String)>,
    readers: Vec<JoinHandle<()>>,
    cancel_requested: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    timeout: Duration,
) {
    let session_id = session.session_id.clone();
    let poll = Duration::from_millis(inner.config.launcher.poll_interval_ms.max(10));
    let grace = Duration::from_secs(inner.config.launcher.stop_grace_secs);
    let deadline = Instant::now() + timeout;

    let mut ring = OutputRing::default();
    let mut watchdog = ResourceWatchdog::new(inner.config.launcher.resource_error_threshold);
    let mut kill_reason: Option<KillReason> = None;
    let mut stop_sent_at: Option<Instant> = None;
    let mut hard_killed = false;
    let mut exit_status: Option<ExitStatus> = None;

    loop {
        drain_lines(
            &inner,
            &session_id,
            &line_rx,
            &mut ring,
            &mut watchdog,
            &mut kill_reason,
            pid,
        );

        match child.try_wait() {
            Ok(Some(status)) => {
                exit_status = Some(status);
                break;
            }
            Ok(None) => {}
            Err(_) => break,
        }

        if cancel_requested.load(Ordering::SeqCst) && stop_sent_at.is_none() {
            // cancel() already delivered SIGTERM; start the grace clock.
            stop_sent_at = Some(Instant::now());
        }

        if kill_reason.is_none() && Instant::now() >= deadline {
            kill_reason = Some(KillReason::Timeout);
            let _ = terminate_group(pid);
            stop_sent_at = Some(Instant::now());
        }

        if let Some(sent) = stop_sent_at {
            if !hard_killed && sent.elapsed() >= grace {
                let _ = kill_group(pid);
                hard_killed = true;
            }
        }

        thread::sleep(poll);
    }

    let exit_status = exit_status.or_else(|| child.wait().ok());
    exited.store(true, Ordering::SeqCst);

    for reader in readers {
        let _ = reader.join();
    }
    drain_lines(
        &inner,
        &session_id,
        &line_rx,
        &mut ring,
        &mut watchdog,
        &mut kill_reason,
        pid,
    );

    let exit_code = exit_status.and_then(|status| status.code());
    let status = if cancel_requested.load(Ordering::SeqCst) {
        SessionStatus::Cancelled
    } else if kill_reason.is_some() {
        SessionStatus::Failed
    } else if exit_status.map(|status| status.success()).unwrap_or(false) {
        SessionStatus::Completed
    } else {
        SessionStatus::Failed
    };

    if let Err(err) = finalize_session(&inner, &mut session, &repo, status, exit_code, &ring) {
        eprintln!("session {session_id} finalization failed: {err:#}", session_id = session_id.0);
    }

    inner.sessions().remove(&session_id.0);

    let terminal_event = if status == SessionStatus::Cancelled {
        TeamEvent::cancelled(session_id)
    } else {
        TeamEvent::terminal(session_id, status, exit_code)
    };
    inner.hub.publish_team(&terminal_event);
}

fn drain_lines(
    inner: &LauncherInner,
    session_id: &SessionId,
    line_rx: &Receiver<(TeamStream, String)>,
    ring: &mut OutputRing,
    watchdog: &mut ResourceWatchdog,
    kill_reason: &mut Option<KillReason>,
    pid: u32,
) {
    while let Ok((stream, line)) = line_rx.try_recv() {
        inner
            .hub
            .publish_team(&TeamEvent::line(session_id.clone(), stream, line.clone()));

        if let Some(strike) = watchdog.observe(&line) {
            if kill_reason.is_none() {
                let detail = format!("auto-killed: {}", strike.describe());
                inner
                    .hub
                    .publish_team(&TeamEvent::resource_error(session_id.clone(), detail));
                let _ = kill_group(pid);
                *kill_reason = Some(KillReason::Resource(strike.describe()));
            }
        }

        ring.push(stream, line);
    }
}

fn finalize_session(
    inner: &LauncherInner,
    session: &mut AgentSession,
    repo: &RepoHandle,
    status: SessionStatus,
    exit_code: Option<i32>,
    ring: &OutputRing,
) -> anyhow::Result<()> {
    let worktrees = inner.worktrees();
    let session_id = session.session_id.clone();

    // Commit whatever the agent left uncommitted so the branch carries the
    // work, then snapshot the changed paths.
    let commit_message = format!(
        "feat: {team} session {id}",
        team = session.team_name,
        id = session_id.0
    );
    if let Err(err) = worktrees.auto_commit(repo, session_id.as_str(), &commit_message) {
        eprintln!(
            "auto-commit failed for session {id}: {err}",
            id = session_id.0
        );
    }
    let files_changed = worktrees
        .changed_files(repo, session_id.as_str())
        .unwrap_or_default();

    // Reclaim per-worktree build output.
    if let Some(worktree_path) = &session.worktree_path {
        let target = worktree_path.join("target");
        if target.is_dir() {
            let _ = fs::remove_dir_all(&target);
        }
    }

    // Teammate rows follow the session outcome.
    let mut teammates = inner.store.list_teammate_tasks(&session_id)?;
    for task in &mut teammates {
        task.status = if status == SessionStatus::Completed {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        task.completed_at = Some(Utc::now());
    }
    inner.store.replace_teammate_tasks(&session_id, &teammates)?;

    let completed_at = Utc::now();
    let result_file = write_result_file(
        &inner.config.launcher.outputs_dir,
        session,
        status,
        exit_code,
        ring,
        &completed_at.to_rfc3339(),
    );
    session.result_file = result_file;

    session.mark_terminal(status, exit_code, files_changed);
    inner.store.upsert_session(session)?;
    Ok(())
}

fn write_result_file(
    outputs_dir: &Path,
    session: &AgentSession,
    status: SessionStatus,
    exit_code: Option<i32>,
    ring: &OutputRing,
    completed_at: &str,
) -> Option<String> {
    let filename = format!("teams-{}.json", session.session_id.0);
    let payload = serde_json::json!({
        "session_id": session.session_id.0,
        "team_name": session.team_name,
        "status": status.as_str(),
        "exit_code": exit_code,
        "output": ring.stdout_text(),
        "completed_at": completed_at,
    });

    if let Err(err) = fs::create_dir_all(outputs_dir) {
        eprintln!("failed to create outputs dir: {err}");
        return None;
    }
    let path = outputs_dir.join(&filename);
    match serde_json::to_string_pretty(&payload) {
        Ok(body) => {
            if let Err(err) = fs::write(&path, body) {
                eprintln!("failed to write result file {}: {err}", path.display());
                return None;
            }
            Some(filename)
        }
        Err(err) => {
            eprintln!("failed to encode result file {}: {err}", path.display());
            None
        }
    }
}
