//! SQLite-backed session, project, and decision store.
//!
//! Indexed scalar columns sit beside a `payload_json` column holding the full
//! record; decisions are all-columns so resolution is a single atomic UPDATE.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use gm_core::events::LogRecord;
use gm_core::state::{DecisionAction, DecisionStatus, ProjectPhase};
use gm_core::types::{AgentSession, Decision, DecisionId, GmProject, ProjectId, SessionId, TeammateTask};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid stored tag '{value}' in column {column}: {message}")]
    InvalidTag {
        column: &'static str,
        value: String,
        message: String,
    },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("project not found: {project_id}")]
    ProjectNotFound { project_id: String },
    #[error("decision not found: {decision_id}")]
    DecisionNotFound { decision_id: String },
}

/// Outcome of a decision resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// This call performed the pending -> terminal transition.
    Resolved(Decision),
    /// The decision was already terminal; nothing changed.
    AlreadyResolved(Decision),
}

impl ResolveOutcome {
    pub fn decision(&self) -> &Decision {
        match self {
            ResolveOutcome::Resolved(decision) | ResolveOutcome::AlreadyResolved(decision) => {
                decision
            }
        }
    }

    pub fn was_fresh(&self) -> bool {
        matches!(self, ResolveOutcome::Resolved(_))
    }
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS agent_sessions (
    session_id TEXT PRIMARY KEY,
    project_id TEXT,
    team_name TEXT NOT NULL,
    status TEXT NOT NULL,
    merge_result TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_sessions_project ON agent_sessions(project_id, started_at);
CREATE INDEX IF NOT EXISTS idx_agent_sessions_status ON agent_sessions(status);

CREATE TABLE IF NOT EXISTS teammate_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    teammate TEXT NOT NULL,
    status TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_teammate_tasks_session ON teammate_tasks(session_id);

CREATE TABLE IF NOT EXISTS gm_projects (
    project_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    repo_path TEXT NOT NULL,
    phase TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gm_projects_started ON gm_projects(started_at);
CREATE INDEX IF NOT EXISTS idx_gm_projects_phase ON gm_projects(phase);

CREATE TABLE IF NOT EXISTS gm_decisions (
    decision_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    description TEXT NOT NULL,
    proposed_action TEXT NOT NULL,
    context TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_gm_decisions_project ON gm_decisions(project_id, status);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL DEFAULT 'info',
    message TEXT NOT NULL,
    source TEXT
);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
"#,
        )?;

        // Additive migration: result_file landed after the first schema cut.
        if let Err(err) = conn.execute(
            "ALTER TABLE agent_sessions ADD COLUMN result_file TEXT",
            [],
        ) {
            if !matches!(
                &err,
                rusqlite::Error::SqliteFailure(_, Some(message))
                    if message.contains("duplicate column name: result_file")
            ) {
                return Err(err.into());
            }
        }

        Ok(())
    }

    // --- Agent sessions ---

    pub fn upsert_session(&self, session: &AgentSession) -> Result<(), StoreError> {
        let payload = serde_json::to_string(session)?;
        self.conn().execute(
            r#"
INSERT INTO agent_sessions
    (session_id, project_id, team_name, status, merge_result, started_at, completed_at, result_file, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT(session_id) DO UPDATE SET
  project_id = excluded.project_id,
  team_name = excluded.team_name,
  status = excluded.status,
  merge_result = excluded.merge_result,
  started_at = excluded.started_at,
  completed_at = excluded.completed_at,
  result_file = excluded.result_file,
  payload_json = excluded.payload_json
"#,
            params![
                session.session_id.0,
                session.project_id.as_ref().map(|id| id.0.clone()),
                session.team_name,
                session.status.as_str(),
                session.merge_result.map(|result| result.as_str()),
                session.started_at.to_rfc3339(),
                session.completed_at.map(|at| at.to_rfc3339()),
                session.result_file,
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn load_session(&self, session_id: &SessionId) -> Result<Option<AgentSession>, StoreError> {
        let payload: Option<String> = self
            .conn()
            .query_row(
                "SELECT payload_json FROM agent_sessions WHERE session_id = ?1",
                params![session_id.0],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|raw| serde_json::from_str::<AgentSession>(&raw))
            .transpose()
            .map_err(StoreError::from)
    }

    pub fn require_session(&self, session_id: &SessionId) -> Result<AgentSession, StoreError> {
        self.load_session(session_id)?
            .ok_or_else(|| StoreError::SessionNotFound {
                session_id: session_id.0.clone(),
            })
    }

    /// Sessions belonging to a project, ordered by start time.
    pub fn list_sessions_for_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<AgentSession>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM agent_sessions WHERE project_id = ?1 ORDER BY started_at ASC, session_id ASC",
        )?;
        let rows = stmt.query_map(params![project_id.0], |row| row.get::<_, String>(0))?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(serde_json::from_str::<AgentSession>(&row?)?);
        }
        Ok(sessions)
    }

    pub fn list_sessions(&self, limit: usize, offset: usize) -> Result<Vec<AgentSession>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM agent_sessions ORDER BY started_at DESC, session_id ASC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(serde_json::from_str::<AgentSession>(&row?)?);
        }
        Ok(sessions)
    }

    // --- Teammate tasks ---

    pub fn insert_teammate_task(&self, task: &TeammateTask) -> Result<(), StoreError> {
        let payload = serde_json::to_string(task)?;
        self.conn().execute(
            r#"
INSERT INTO teammate_tasks (session_id, teammate, status, payload_json)
VALUES (?1, ?2, ?3, ?4)
"#,
            params![task.session_id.0, task.teammate, task.status.as_str(), payload],
        )?;
        Ok(())
    }

    pub fn list_teammate_tasks(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<TeammateTask>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM teammate_tasks WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id.0], |row| row.get::<_, String>(0))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(serde_json::from_str::<TeammateTask>(&row?)?);
        }
        Ok(tasks)
    }

    /// Rewrite all teammate rows for a session (status updates on exit).
    pub fn replace_teammate_tasks(
        &self,
        session_id: &SessionId,
        tasks: &[TeammateTask],
    ) -> Result<(), StoreError> {
        {
            let conn = self.conn();
            conn.execute(
                "DELETE FROM teammate_tasks WHERE session_id = ?1",
                params![session_id.0],
            )?;
        }
        for task in tasks {
            self.insert_teammate_task(task)?;
        }
        Ok(())
    }

    // --- Projects ---

    pub fn upsert_project(&self, project: &GmProject) -> Result<(), StoreError> {
        let payload = serde_json::to_string(project)?;
        self.conn().execute(
            r#"
INSERT INTO gm_projects
    (project_id, name, repo_path, phase, started_at, completed_at, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(project_id) DO UPDATE SET
  name = excluded.name,
  repo_path = excluded.repo_path,
  phase = excluded.phase,
  started_at = excluded.started_at,
  completed_at = excluded.completed_at,
  payload_json = excluded.payload_json
"#,
            params![
                project.project_id.0,
                project.name,
                project.repo_path.to_string_lossy(),
                project.phase.as_str(),
                project.started_at.to_rfc3339(),
                project.completed_at.map(|at| at.to_rfc3339()),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn load_project(&self, project_id: &ProjectId) -> Result<Option<GmProject>, StoreError> {
        let payload: Option<String> = self
            .conn()
            .query_row(
                "SELECT payload_json FROM gm_projects WHERE project_id = ?1",
                params![project_id.0],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|raw| serde_json::from_str::<GmProject>(&raw))
            .transpose()
            .map_err(StoreError::from)
    }

    pub fn require_project(&self, project_id: &ProjectId) -> Result<GmProject, StoreError> {
        self.load_project(project_id)?
            .ok_or_else(|| StoreError::ProjectNotFound {
                project_id: project_id.0.clone(),
            })
    }

    /// Most recent projects first.
    pub fn list_projects(&self, limit: usize, offset: usize) -> Result<Vec<GmProject>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM gm_projects ORDER BY started_at DESC, project_id ASC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(serde_json::from_str::<GmProject>(&row?)?);
        }
        Ok(projects)
    }

    /// Projects still in a non-terminal phase (startup sweep).
    pub fn list_unfinished_projects(&self) -> Result<Vec<GmProject>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM gm_projects WHERE phase NOT IN (?1, ?2) ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map(
            params![
                ProjectPhase::Completed.as_str(),
                ProjectPhase::Failed.as_str()
            ],
            |row| row.get::<_, String>(0),
        )?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(serde_json::from_str::<GmProject>(&row?)?);
        }
        Ok(projects)
    }

    // --- Decisions ---

    pub fn insert_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
INSERT INTO gm_decisions
    (decision_id, project_id, kind, description, proposed_action, context, status, created_at, resolved_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#,
            params![
                decision.decision_id.0,
                decision.project_id.0,
                decision.kind.as_str(),
                decision.description,
                decision.proposed_action,
                decision.context,
                decision.status.as_str(),
                decision.created_at.to_rfc3339(),
                decision.resolved_at.map(|at| at.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn load_decision(&self, decision_id: &DecisionId) -> Result<Option<Decision>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                r#"
SELECT decision_id, project_id, kind, description, proposed_action, context, status, created_at, resolved_at
FROM gm_decisions WHERE decision_id = ?1
"#,
                params![decision_id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        row.map(decision_from_row).transpose()
    }

    /// Atomically transition a decision out of `pending`. A second call for
    /// the same id reports the existing outcome without side effects.
    pub fn resolve_decision(
        &self,
        decision_id: &DecisionId,
        action: DecisionAction,
        resolved_at: DateTime<Utc>,
    ) -> Result<ResolveOutcome, StoreError> {
        let updated = self.conn().execute(
            r#"
UPDATE gm_decisions
SET status = ?1, resolved_at = ?2
WHERE decision_id = ?3 AND status = ?4
"#,
            params![
                action.resolved_status().as_str(),
                resolved_at.to_rfc3339(),
                decision_id.0,
                DecisionStatus::Pending.as_str(),
            ],
        )?;

        let decision = self
            .load_decision(decision_id)?
            .ok_or_else(|| StoreError::DecisionNotFound {
                decision_id: decision_id.0.clone(),
            })?;

        if updated == 1 {
            Ok(ResolveOutcome::Resolved(decision))
        } else {
            Ok(ResolveOutcome::AlreadyResolved(decision))
        }
    }

    pub fn pending_decisions_for(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<Decision>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
SELECT decision_id, project_id, kind, description, proposed_action, context, status, created_at, resolved_at
FROM gm_decisions
WHERE project_id = ?1 AND status = ?2
ORDER BY created_at ASC, decision_id ASC
"#,
        )?;
        let rows = stmt.query_map(
            params![project_id.0, DecisionStatus::Pending.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            },
        )?;

        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(decision_from_row(row?)?);
        }
        Ok(decisions)
    }

    pub fn list_decisions_for(&self, project_id: &ProjectId) -> Result<Vec<Decision>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
SELECT decision_id, project_id, kind, description, proposed_action, context, status, created_at, resolved_at
FROM gm_decisions
WHERE project_id = ?1
ORDER BY created_at ASC, decision_id ASC
"#,
        )?;
        let rows = stmt.query_map(params![project_id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(decision_from_row(row?)?);
        }
        Ok(decisions)
    }

    // --- Logs ---

    pub fn insert_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO logs (timestamp, level, message, source) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.timestamp.to_rfc3339(),
                record.level,
                record.message,
                record.source,
            ],
        )?;
        Ok(())
    }

    pub fn list_logs(
        &self,
        limit: usize,
        offset: usize,
        level: Option<&str>,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let conn = self.conn();
        let mut records = Vec::new();

        let collect = |rows: &mut rusqlite::Rows<'_>| -> Result<Vec<(String, String, String, Option<String>)>, rusqlite::Error> {
            let mut raw = Vec::new();
            while let Some(row) = rows.next()? {
                raw.push((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ));
            }
            Ok(raw)
        };

        let raw = if let Some(level) = level {
            let mut stmt = conn.prepare(
                "SELECT timestamp, level, message, source FROM logs WHERE level = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(params![level, limit as i64, offset as i64])?;
            collect(&mut rows)?
        } else {
            let mut stmt = conn.prepare(
                "SELECT timestamp, level, message, source FROM logs ORDER BY timestamp DESC, id DESC LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt.query(params![limit as i64, offset as i64])?;
            collect(&mut rows)?
        };
        drop(conn);

        for (timestamp_raw, level, message, source) in raw {
            let timestamp = parse_rfc3339(&timestamp_raw)?;
            records.push(LogRecord {
                timestamp,
                level,
                message,
                source,
            });
        }
        Ok(records)
    }
}

type DecisionRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
);

fn decision_from_row(row: DecisionRow) -> Result<Decision, StoreError> {
    let (
        decision_id,
        project_id,
        kind_raw,
        description,
        proposed_action,
        context,
        status_raw,
        created_at_raw,
        resolved_at_raw,
    ) = row;

    let kind = kind_raw
        .parse()
        .map_err(|message| StoreError::InvalidTag {
            column: "gm_decisions.kind",
            value: kind_raw.clone(),
            message,
        })?;
    let status = status_raw
        .parse()
        .map_err(|message| StoreError::InvalidTag {
            column: "gm_decisions.status",
            value: status_raw.clone(),
            message,
        })?;
    let created_at = parse_rfc3339(&created_at_raw)?;
    let resolved_at = resolved_at_raw.as_deref().map(parse_rfc3339).transpose()?;

    Ok(Decision {
        decision_id: DecisionId::new(decision_id),
        project_id: ProjectId::new(project_id),
        kind,
        description,
        proposed_action,
        context,
        status,
        created_at,
        resolved_at,
    })
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| StoreError::TimestampParse {
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gm_core::state::{DecisionKind, MergeResult, SessionStatus};
    use std::path::PathBuf;

    fn mk_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("in-memory store");
        store.migrate().expect("migrate");
        store
    }

    fn mk_session(id: &str, project: Option<&str>) -> AgentSession {
        let mut session = AgentSession::new(SessionId::new(id), "backend", "task");
        session.project_id = project.map(ProjectId::new);
        session
    }

    fn mk_project(id: &str) -> GmProject {
        GmProject::new(ProjectId::new(id), "refactor", PathBuf::from("/tmp/repo"))
    }

    fn mk_decision(id: &str, project: &str) -> Decision {
        Decision::pending(
            DecisionId::new(id),
            ProjectId::new(project),
            DecisionKind::MergeConflict,
            "merge conflict",
            "run the resolver",
            "CONFLICT",
        )
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = mk_store();
        store.migrate().expect("second migrate");
    }

    #[test]
    fn session_round_trip_preserves_fields() {
        let store = mk_store();
        let mut session = mk_session("S1", Some("P1"));
        session.mark_running("team/S1".to_string(), PathBuf::from(".worktrees/S1"));
        store.upsert_session(&session).expect("upsert");

        let loaded = store
            .load_session(&session.session_id)
            .expect("load")
            .expect("exists");
        assert_eq!(loaded, session);
    }

    #[test]
    fn session_upsert_overwrites_prior_row() {
        let store = mk_store();
        let mut session = mk_session("S1", Some("P1"));
        store.upsert_session(&session).expect("insert");

        session.mark_terminal(SessionStatus::Completed, Some(0), vec!["a.rs".to_string()]);
        session.merge_result = Some(MergeResult::Merged);
        store.upsert_session(&session).expect("update");

        let loaded = store
            .load_session(&session.session_id)
            .expect("load")
            .expect("exists");
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.merge_result, Some(MergeResult::Merged));
        assert_eq!(loaded.files_changed, vec!["a.rs".to_string()]);
    }

    #[test]
    fn sessions_for_project_are_ordered_by_started_at() {
        let store = mk_store();
        let mut early = mk_session("S-early", Some("P1"));
        let mut late = mk_session("S-late", Some("P1"));
        early.started_at = Utc::now() - Duration::seconds(120);
        late.started_at = Utc::now();
        let other = mk_session("S-other", Some("P2"));

        store.upsert_session(&late).expect("upsert late");
        store.upsert_session(&early).expect("upsert early");
        store.upsert_session(&other).expect("upsert other");

        let sessions = store
            .list_sessions_for_project(&ProjectId::new("P1"))
            .expect("list");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id.0, "S-early");
        assert_eq!(sessions[1].session_id.0, "S-late");
    }

    #[test]
    fn require_session_errors_for_missing_row() {
        let store = mk_store();
        let err = store
            .require_session(&SessionId::new("S-missing"))
            .expect_err("missing session");
        assert!(matches!(err, StoreError::SessionNotFound { .. }));
    }

    #[test]
    fn teammate_tasks_round_trip_in_insertion_order() {
        let store = mk_store();
        let session_id = SessionId::new("S1");
        let tasks = vec![
            TeammateTask {
                session_id: session_id.clone(),
                teammate: "api".to_string(),
                role: Some("backend".to_string()),
                status: SessionStatus::Pending,
                output: None,
                error: None,
                started_at: None,
                completed_at: None,
            },
            TeammateTask {
                session_id: session_id.clone(),
                teammate: "docs".to_string(),
                role: None,
                status: SessionStatus::Pending,
                output: None,
                error: None,
                started_at: None,
                completed_at: None,
            },
        ];
        for task in &tasks {
            store.insert_teammate_task(task).expect("insert task");
        }

        let listed = store.list_teammate_tasks(&session_id).expect("list tasks");
        assert_eq!(listed, tasks);
    }

    #[test]
    fn replace_teammate_tasks_rewrites_rows() {
        let store = mk_store();
        let session_id = SessionId::new("S1");
        let mut task = TeammateTask {
            session_id: session_id.clone(),
            teammate: "api".to_string(),
            role: None,
            status: SessionStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        };
        store.insert_teammate_task(&task).expect("insert");

        task.status = SessionStatus::Completed;
        store
            .replace_teammate_tasks(&session_id, std::slice::from_ref(&task))
            .expect("replace");

        let listed = store.list_teammate_tasks(&session_id).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, SessionStatus::Completed);
    }

    #[test]
    fn project_round_trip_and_pagination() {
        let store = mk_store();
        let mut old = mk_project("P-old");
        let mut new = mk_project("P-new");
        old.started_at = Utc::now() - Duration::seconds(300);
        new.started_at = Utc::now();

        store.upsert_project(&old).expect("upsert old");
        store.upsert_project(&new).expect("upsert new");

        let page = store.list_projects(1, 0).expect("first page");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].project_id.0, "P-new");

        let page = store.list_projects(1, 1).expect("second page");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].project_id.0, "P-old");
    }

    #[test]
    fn unfinished_projects_excludes_terminal_phases() {
        let store = mk_store();
        let running = mk_project("P-running");
        let mut done = mk_project("P-done");
        done.phase = ProjectPhase::Completed;
        let mut failed = mk_project("P-failed");
        failed.phase = ProjectPhase::Failed;

        store.upsert_project(&running).expect("upsert");
        store.upsert_project(&done).expect("upsert");
        store.upsert_project(&failed).expect("upsert");

        let unfinished = store.list_unfinished_projects().expect("list");
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].project_id.0, "P-running");
    }

    #[test]
    fn decision_round_trip() {
        let store = mk_store();
        let decision = mk_decision("D1", "P1");
        store.insert_decision(&decision).expect("insert");

        let loaded = store
            .load_decision(&decision.decision_id)
            .expect("load")
            .expect("exists");
        assert_eq!(loaded.kind, DecisionKind::MergeConflict);
        assert_eq!(loaded.status, DecisionStatus::Pending);
        assert_eq!(loaded.context, "CONFLICT");
    }

    #[test]
    fn resolve_decision_is_atomic_and_idempotent() {
        let store = mk_store();
        let decision = mk_decision("D1", "P1");
        store.insert_decision(&decision).expect("insert");

        let first = store
            .resolve_decision(&decision.decision_id, DecisionAction::Approve, Utc::now())
            .expect("first resolve");
        assert!(first.was_fresh());
        assert_eq!(first.decision().status, DecisionStatus::Approved);
        assert!(first.decision().resolved_at.is_some());

        // A conflicting second resolution changes nothing.
        let second = store
            .resolve_decision(&decision.decision_id, DecisionAction::Reject, Utc::now())
            .expect("second resolve");
        assert!(!second.was_fresh());
        assert_eq!(second.decision().status, DecisionStatus::Approved);
    }

    #[test]
    fn resolve_missing_decision_errors() {
        let store = mk_store();
        let err = store
            .resolve_decision(&DecisionId::new("D-missing"), DecisionAction::Approve, Utc::now())
            .expect_err("missing decision");
        assert!(matches!(err, StoreError::DecisionNotFound { .. }));
    }

    #[test]
    fn pending_decisions_filter_by_project_and_status() {
        let store = mk_store();
        store.insert_decision(&mk_decision("D1", "P1")).expect("insert");
        store.insert_decision(&mk_decision("D2", "P1")).expect("insert");
        store.insert_decision(&mk_decision("D3", "P2")).expect("insert");

        store
            .resolve_decision(&DecisionId::new("D1"), DecisionAction::Reject, Utc::now())
            .expect("resolve");

        let pending = store
            .pending_decisions_for(&ProjectId::new("P1"))
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].decision_id.0, "D2");

        let all = store
            .list_decisions_for(&ProjectId::new("P1"))
            .expect("all");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn logs_filter_by_level_and_paginate() {
        let store = mk_store();
        for (level, message) in [
            ("info", "project started"),
            ("warn", "merge skipped"),
            ("info", "project completed"),
        ] {
            store
                .insert_log(&LogRecord::new(level, message, "gm"))
                .expect("insert log");
        }

        let infos = store.list_logs(10, 0, Some("info")).expect("info logs");
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().all(|record| record.level == "info"));

        let all = store.list_logs(2, 0, None).expect("all logs");
        assert_eq!(all.len(), 2);
    }
}
