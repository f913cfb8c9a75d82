//! Durable project store backed by SQLite.
//!
//! Holds two tables:
//! - `projects`: one row per run with its latest status and outputs
//! - `pipeline_events`: append-only log, ordered by an autoincrement `seq`
//!
//! Status updates are guarded so that a terminal row is never overwritten.
//! Terminal transitions write the status and their closing event in one
//! transaction, and no event is appended once a project is terminal.
//! All access from async code goes through [`ProjectStore`], which runs the
//! synchronous [`ProjectDb`] on tokio's blocking pool.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior,
};
use uuid::Uuid;

use crate::domain::{
    EventStatus, NewEvent, PipelineEvent, Project, ProjectStatus, ProjectUpdate, Stage,
};

/// Result of an atomic cancel attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// Row was already terminal; carries its status
    AlreadyTerminal(ProjectStatus),
}

/// Message written to `error` when a user cancels a run
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Async-safe handle to the project database.
#[derive(Clone)]
pub struct ProjectStore {
    inner: Arc<std::sync::Mutex<ProjectDb>>,
}

impl ProjectStore {
    pub fn new(db: ProjectDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self::new(ProjectDb::new(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(ProjectDb::new_in_memory()?))
    }

    /// Run a closure with the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ProjectDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    pub async fn create_project(&self, id: Uuid, name: String, request: String) -> Result<Project> {
        self.call(move |db| db.create_project(id, &name, &request)).await
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        self.call(move |db| db.get_project(id)).await
    }

    pub async fn list_projects(&self, limit: u32, offset: u32) -> Result<Vec<Project>> {
        self.call(move |db| db.list_projects(limit, offset)).await
    }

    pub async fn advance(&self, id: Uuid, update: ProjectUpdate) -> Result<bool> {
        self.call(move |db| db.advance(id, &update)).await
    }

    pub async fn transition(
        &self,
        id: Uuid,
        update: ProjectUpdate,
        event: NewEvent,
    ) -> Result<Option<PipelineEvent>> {
        self.call(move |db| db.transition(id, &update, &event)).await
    }

    pub async fn increment_retry(&self, id: Uuid) -> Result<Option<u32>> {
        self.call(move |db| db.increment_retry(id)).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome> {
        self.call(move |db| db.cancel(id)).await
    }

    pub async fn delete_project(&self, id: Uuid) -> Result<bool> {
        self.call(move |db| db.delete_project(id)).await
    }

    pub async fn append_event(&self, event: NewEvent) -> Result<Option<PipelineEvent>> {
        self.call(move |db| db.append_event(&event)).await
    }

    pub async fn events_since(&self, id: Uuid, cursor: i64) -> Result<Vec<PipelineEvent>> {
        self.call(move |db| db.events_since(id, cursor)).await
    }

    pub async fn latest_event(&self, id: Uuid) -> Result<Option<PipelineEvent>> {
        self.call(move |db| db.latest_event(id)).await
    }
}

/// Synchronous SQLite access
pub struct ProjectDb {
    conn: Connection,
}

const PROJECT_COLUMNS: &str = "id, name, request, status, current_step, spec, artifacts, \
     test_artifacts, test_result, publish_ref, deploy_ref, error, retry_count, created_at, updated_at";

const EVENT_COLUMNS: &str = "seq, project_id, stage, status, message, data, created_at";

impl ProjectDb {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to enable WAL")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    request TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_step TEXT NOT NULL DEFAULT 'queued',
                    spec TEXT,
                    artifacts TEXT,
                    test_artifacts TEXT,
                    test_result TEXT,
                    publish_ref TEXT,
                    deploy_ref TEXT,
                    error TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pipeline_events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    stage TEXT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT NOT NULL,
                    data TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_project_seq
                    ON pipeline_events(project_id, seq);
                CREATE INDEX IF NOT EXISTS idx_projects_created
                    ON projects(created_at);
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    /// Immediate: the write lock is held from the guard read onwards
    fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin transaction")
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, id: Uuid, name: &str, request: &str) -> Result<Project> {
        let now = now_str();
        self.conn
            .execute(
                "INSERT INTO projects (id, name, request, status, current_step, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 'queued', ?4, ?4)",
                params![id.to_string(), name, request, now],
            )
            .context("Failed to insert project")?;
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id.to_string()], ProjectRow::from_row)
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Newest first
    pub fn list_projects(&self, limit: u32, offset: u32) -> Result<Vec<Project>> {
        let sql = format!(
            "SELECT {} FROM projects ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2",
            PROJECT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![limit, offset], ProjectRow::from_row)
            .context("Failed to query projects")?;

        let mut projects = Vec::new();
        for row in rows {
            let r = row.context("Failed to read project row")?;
            projects.push(r.into_project()?);
        }
        Ok(projects)
    }

    /// Apply a partial update unless the project is already terminal.
    ///
    /// Returns false when nothing was written (missing or terminal row).
    pub fn advance(&self, id: Uuid, update: &ProjectUpdate) -> Result<bool> {
        update_project(&self.conn, id, update)
    }

    /// Guarded update and its event, committed together.
    ///
    /// The event is written only if the update was. Returns None when the
    /// project is missing or already terminal.
    pub fn transition(
        &self,
        id: Uuid,
        update: &ProjectUpdate,
        event: &NewEvent,
    ) -> Result<Option<PipelineEvent>> {
        let tx = self.begin()?;
        if !update_project(&tx, id, update)? {
            return Ok(None);
        }
        let written = insert_event(&tx, event)?;
        tx.commit().context("Failed to commit transition")?;
        Ok(Some(written))
    }

    /// Returns the new count, or None if the project is missing or terminal
    pub fn increment_retry(&self, id: Uuid) -> Result<Option<u32>> {
        let sql = format!(
            "UPDATE projects SET retry_count = retry_count + 1, updated_at = ?1
             WHERE id = ?2 AND status NOT IN ({}) RETURNING retry_count",
            terminal_list()
        );
        self.conn
            .query_row(
                &sql,
                params![now_str(), id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to increment retry count")
    }

    /// Move a non-terminal project to `cancelled` and log the
    /// cancellation event in the same transaction
    pub fn cancel(&self, id: Uuid) -> Result<CancelOutcome> {
        let tx = self.begin()?;
        let sql = format!(
            "UPDATE projects SET status = 'cancelled', error = ?1, updated_at = ?2
             WHERE id = ?3 AND status NOT IN ({})",
            terminal_list()
        );
        let changed = tx
            .execute(&sql, params![CANCELLED_BY_USER, now_str(), id.to_string()])
            .context("Failed to cancel project")?;
        if changed > 0 {
            insert_event(
                &tx,
                &NewEvent::new(id, Stage::Cancellation, EventStatus::Cancelled, CANCELLED_BY_USER),
            )?;
            tx.commit().context("Failed to commit cancel")?;
            return Ok(CancelOutcome::Cancelled);
        }

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM projects WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read project status")?;

        match status {
            None => Ok(CancelOutcome::NotFound),
            Some(s) => Ok(CancelOutcome::AlreadyTerminal(parse_status(&s)?)),
        }
    }

    /// Remove a project and its event log
    pub fn delete_project(&self, id: Uuid) -> Result<bool> {
        self.conn
            .execute(
                "DELETE FROM pipeline_events WHERE project_id = ?1",
                params![id.to_string()],
            )
            .context("Failed to delete events")?;
        let changed = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete project")?;
        Ok(changed > 0)
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Append an event while the project is still running.
    ///
    /// Returns None once the project is terminal (or gone); the closing
    /// event of a run is written by [`ProjectDb::transition`] or
    /// [`ProjectDb::cancel`].
    pub fn append_event(&self, event: &NewEvent) -> Result<Option<PipelineEvent>> {
        let tx = self.begin()?;
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1 AND status NOT IN ({}))",
            terminal_list()
        );
        let active: bool = tx
            .query_row(&sql, params![event.project_id.to_string()], |row| row.get(0))
            .context("Failed to read project status")?;
        if !active {
            return Ok(None);
        }
        let written = insert_event(&tx, event)?;
        tx.commit().context("Failed to commit event")?;
        Ok(Some(written))
    }

    /// Events with `seq > cursor`, ascending
    pub fn events_since(&self, id: Uuid, cursor: i64) -> Result<Vec<PipelineEvent>> {
        let sql = format!(
            "SELECT {} FROM pipeline_events WHERE project_id = ?1 AND seq > ?2 ORDER BY seq ASC",
            EVENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare events_since")?;
        let rows = stmt
            .query_map(params![id.to_string(), cursor], EventRow::from_row)
            .context("Failed to query events")?;

        let mut events = Vec::new();
        for row in rows {
            let r = row.context("Failed to read event row")?;
            events.push(r.into_event()?);
        }
        Ok(events)
    }

    pub fn latest_event(&self, id: Uuid) -> Result<Option<PipelineEvent>> {
        let sql = format!(
            "SELECT {} FROM pipeline_events WHERE project_id = ?1 ORDER BY seq DESC LIMIT 1",
            EVENT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id.to_string()], EventRow::from_row)
            .optional()
            .context("Failed to query latest event")?;
        row.map(EventRow::into_event).transpose()
    }
}

fn update_project(conn: &Connection, id: Uuid, update: &ProjectUpdate) -> Result<bool> {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(status) = update.status {
        sets.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(step) = &update.current_step {
        sets.push("current_step = ?");
        values.push(Value::Text(step.clone()));
    }
    if let Some(spec) = &update.spec {
        sets.push("spec = ?");
        values.push(Value::Text(serde_json::to_string(spec)?));
    }
    if let Some(files) = &update.artifacts {
        sets.push("artifacts = ?");
        values.push(Value::Text(serde_json::to_string(files)?));
    }
    if let Some(files) = &update.test_artifacts {
        sets.push("test_artifacts = ?");
        values.push(Value::Text(serde_json::to_string(files)?));
    }
    if let Some(result) = &update.test_result {
        sets.push("test_result = ?");
        values.push(Value::Text(serde_json::to_string(result)?));
    }
    if let Some(reference) = &update.publish_ref {
        sets.push("publish_ref = ?");
        values.push(Value::Text(reference.clone()));
    }
    if let Some(reference) = &update.deploy_ref {
        sets.push("deploy_ref = ?");
        values.push(Value::Text(reference.clone()));
    }
    if let Some(error) = &update.error {
        sets.push("error = ?");
        values.push(Value::Text(error.clone()));
    }

    sets.push("updated_at = ?");
    values.push(Value::Text(now_str()));
    values.push(Value::Text(id.to_string()));

    let sql = format!(
        "UPDATE projects SET {} WHERE id = ? AND status NOT IN ({})",
        sets.join(", "),
        terminal_list()
    );
    let changed = conn
        .execute(&sql, params_from_iter(values))
        .context("Failed to update project")?;
    Ok(changed > 0)
}

/// Insert one event row; the caller owns the transaction
fn insert_event(conn: &Connection, event: &NewEvent) -> Result<PipelineEvent> {
    let created_at = Utc::now();
    let data = event
        .data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO pipeline_events (project_id, stage, status, message, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.project_id.to_string(),
            event.stage.as_str(),
            event.status.as_str(),
            event.message,
            data,
            timestamp(&created_at),
        ],
    )
    .context("Failed to insert event")?;

    Ok(PipelineEvent {
        seq: conn.last_insert_rowid(),
        project_id: event.project_id,
        stage: event.stage,
        status: event.status,
        message: event.message.clone(),
        data: event.data.clone(),
        created_at,
    })
}

/// Fixed-width so that timestamps sort lexically
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_str() -> String {
    timestamp(&Utc::now())
}

fn terminal_list() -> String {
    ProjectStatus::TERMINAL
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_status(s: &str) -> Result<ProjectStatus> {
    s.parse::<ProjectStatus>().map_err(|e| anyhow::anyhow!(e))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid project id: {}", s))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: Option<String>, column: &str) -> Result<Option<T>> {
    raw.map(|s| {
        serde_json::from_str(&s).with_context(|| format!("Invalid JSON in column {}", column))
    })
    .transpose()
}

struct ProjectRow {
    id: String,
    name: String,
    request: String,
    status: String,
    current_step: String,
    spec: Option<String>,
    artifacts: Option<String>,
    test_artifacts: Option<String>,
    test_result: Option<String>,
    publish_ref: Option<String>,
    deploy_ref: Option<String>,
    error: Option<String>,
    retry_count: u32,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            request: row.get(2)?,
            status: row.get(3)?,
            current_step: row.get(4)?,
            spec: row.get(5)?,
            artifacts: row.get(6)?,
            test_artifacts: row.get(7)?,
            test_result: row.get(8)?,
            publish_ref: row.get(9)?,
            deploy_ref: row.get(10)?,
            error: row.get(11)?,
            retry_count: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        Ok(Project {
            id: parse_uuid(&self.id)?,
            name: self.name,
            request: self.request,
            status: parse_status(&self.status)?,
            current_step: self.current_step,
            spec: parse_json(self.spec, "spec")?,
            artifacts: parse_json(self.artifacts, "artifacts")?,
            test_artifacts: parse_json(self.test_artifacts, "test_artifacts")?,
            test_result: parse_json(self.test_result, "test_result")?,
            publish_ref: self.publish_ref,
            deploy_ref: self.deploy_ref,
            error: self.error,
            retry_count: self.retry_count,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

struct EventRow {
    seq: i64,
    project_id: String,
    stage: String,
    status: String,
    message: String,
    data: Option<String>,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            project_id: row.get(1)?,
            stage: row.get(2)?,
            status: row.get(3)?,
            message: row.get(4)?,
            data: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_event(self) -> Result<PipelineEvent> {
        Ok(PipelineEvent {
            seq: self.seq,
            project_id: parse_uuid(&self.project_id)?,
            stage: self.stage.parse::<Stage>().map_err(|e| anyhow::anyhow!(e))?,
            status: self
                .status
                .parse::<EventStatus>()
                .map_err(|e| anyhow::anyhow!(e))?,
            message: self.message,
            data: parse_json(self.data, "data")?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}
