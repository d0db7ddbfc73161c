//! SQLite-backed run catalog.
//!
//! One connection behind a mutex: SQLite does not allow concurrent writers
//! and every operation here is short, so a single serialized connection is
//! sufficient. Callers must not assume transactional bundling across
//! operations; only import runs in a transaction.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::model::{
    generate_run_token, AuthSpec, Endpoint, EndpointDraft, ExportedEndpoint, ExportedProject,
    ExportedRun, HttpMethod, MetricSample, Project, ProjectDraft, ProjectExport, Run,
    RunAggregate, RunDetails, RunFilter, RunStatistics, RunStatus, RunTimeline, Snapshot,
    EXPORT_VERSION,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Stored value could not be decoded: {0}")]
    Decode(String),

    #[error("Import payload invalid: {0}")]
    InvalidImport(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    description   TEXT,
    auth_spec     TEXT,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS endpoints (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id    INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name          TEXT NOT NULL,
    description   TEXT,
    url           TEXT NOT NULL,
    method        TEXT NOT NULL,
    users         INTEGER NOT NULL,
    requests      INTEGER,
    duration_secs INTEGER,
    content_type  TEXT,
    body          TEXT,
    insecure      INTEGER NOT NULL DEFAULT 0,
    requires_auth INTEGER NOT NULL DEFAULT 0,
    headers       TEXT,
    auth_spec     TEXT,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_endpoints_project ON endpoints(project_id);

CREATE TABLE IF NOT EXISTS runs (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    token                 TEXT NOT NULL UNIQUE,
    endpoint_id           INTEGER REFERENCES endpoints(id) ON DELETE SET NULL,
    url                   TEXT NOT NULL,
    method                TEXT NOT NULL,
    users                 INTEGER NOT NULL,
    target_requests       INTEGER,
    target_duration_secs  INTEGER,
    started_at            INTEGER NOT NULL,
    completed_at          INTEGER,
    status                TEXT NOT NULL,
    error_message         TEXT,
    total_requests        INTEGER NOT NULL DEFAULT 0,
    successful_requests   INTEGER NOT NULL DEFAULT 0,
    failed_requests       INTEGER NOT NULL DEFAULT 0,
    requests_per_second   REAL NOT NULL DEFAULT 0,
    average_response_time REAL NOT NULL DEFAULT 0,
    min_response_time     REAL NOT NULL DEFAULT 0,
    max_response_time     REAL NOT NULL DEFAULT 0,
    p50                   REAL NOT NULL DEFAULT 0,
    p75                   REAL NOT NULL DEFAULT 0,
    p90                   REAL NOT NULL DEFAULT 0,
    p95                   REAL NOT NULL DEFAULT 0,
    p99                   REAL NOT NULL DEFAULT 0,
    total_elapsed_time    INTEGER NOT NULL DEFAULT 0,
    status_codes          TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_endpoint ON runs(endpoint_id);
CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);

CREATE TABLE IF NOT EXISTS snapshots (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id                INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    timestamp             INTEGER NOT NULL,
    total_requests        INTEGER NOT NULL,
    successful_requests   INTEGER NOT NULL,
    failed_requests       INTEGER NOT NULL,
    response_time_ms      INTEGER NOT NULL,
    average_response_time REAL NOT NULL,
    current_rps           REAL NOT NULL,
    status_code           INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_run ON snapshots(run_id);
"#;

/// Captured configuration for a new run row. Both the endpoint-backed and
/// the ad-hoc creation paths resolve to this before insertion, so post-hoc
/// edits of the endpoint never alter history.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub endpoint_id: Option<i64>,
    pub url: &'a str,
    pub method: HttpMethod,
    pub users: u32,
    pub target_requests: Option<u64>,
    pub target_duration_secs: Option<u64>,
}

pub struct RunStore {
    conn: Mutex<Connection>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Wraps a decode failure so it can surface through a rusqlite row mapper.
fn corrupt<E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>>(e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
}

fn json_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, StoreError> {
    match value {
        Some(v) => Ok(Some(serde_json::to_string(v)?)),
        None => Ok(None),
    }
}

fn project_from_row(row: &Row) -> rusqlite::Result<Project> {
    let auth_json: Option<String> = row.get("auth_spec")?;
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        auth: auth_json
            .map(|j| serde_json::from_str::<AuthSpec>(&j).map_err(corrupt))
            .transpose()?,
        created_at: datetime(row.get("created_at")?),
        updated_at: datetime(row.get("updated_at")?),
    })
}

fn endpoint_from_row(row: &Row) -> rusqlite::Result<Endpoint> {
    let method: String = row.get("method")?;
    let headers_json: Option<String> = row.get("headers")?;
    let auth_json: Option<String> = row.get("auth_spec")?;
    Ok(Endpoint {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        url: row.get("url")?,
        method: method.parse().map_err(corrupt)?,
        users: row.get("users")?,
        requests: row.get::<_, Option<i64>>("requests")?.map(|v| v as u64),
        duration_secs: row
            .get::<_, Option<i64>>("duration_secs")?
            .map(|v| v as u64),
        content_type: row.get("content_type")?,
        body: row.get("body")?,
        insecure: row.get("insecure")?,
        requires_auth: row.get("requires_auth")?,
        headers: headers_json
            .map(|j| serde_json::from_str(&j).map_err(corrupt))
            .transpose()?,
        auth: auth_json
            .map(|j| serde_json::from_str(&j).map_err(corrupt))
            .transpose()?,
        created_at: datetime(row.get("created_at")?),
        updated_at: datetime(row.get("updated_at")?),
    })
}

fn run_from_row(row: &Row) -> rusqlite::Result<Run> {
    let method: String = row.get("method")?;
    let status: String = row.get("status")?;
    let status_codes_json: Option<String> = row.get("status_codes")?;
    let token: String = row.get("token")?;
    Ok(Run {
        id: row.get("id")?,
        endpoint_id: row.get("endpoint_id")?,
        url: row.get("url")?,
        method: method.parse().map_err(corrupt)?,
        users: row.get("users")?,
        target_requests: row
            .get::<_, Option<i64>>("target_requests")?
            .map(|v| v as u64),
        target_duration_secs: row
            .get::<_, Option<i64>>("target_duration_secs")?
            .map(|v| v as u64),
        started_at: datetime(row.get("started_at")?),
        completed_at: row.get::<_, Option<i64>>("completed_at")?.map(datetime),
        status: status.parse().map_err(corrupt)?,
        error_message: row.get("error_message")?,
        aggregate: RunAggregate {
            run_token: token.clone(),
            total_requests: row.get::<_, i64>("total_requests")? as u64,
            successful_requests: row.get::<_, i64>("successful_requests")? as u64,
            failed_requests: row.get::<_, i64>("failed_requests")? as u64,
            requests_per_second: row.get("requests_per_second")?,
            average_response_time: row.get("average_response_time")?,
            min_response_time: row.get("min_response_time")?,
            max_response_time: row.get("max_response_time")?,
            percentiles: crate::model::PercentileSet {
                p50: row.get("p50")?,
                p75: row.get("p75")?,
                p90: row.get("p90")?,
                p95: row.get("p95")?,
                p99: row.get("p99")?,
            },
            total_elapsed_time: row.get::<_, i64>("total_elapsed_time")? as u64,
            status_codes: status_codes_json
                .map(|j| serde_json::from_str(&j).map_err(corrupt))
                .transpose()?
                .unwrap_or_default(),
        },
        token,
    })
}

fn snapshot_from_row(row: &Row) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        timestamp: datetime(row.get("timestamp")?),
        total_requests: row.get::<_, i64>("total_requests")? as u64,
        successful_requests: row.get::<_, i64>("successful_requests")? as u64,
        failed_requests: row.get::<_, i64>("failed_requests")? as u64,
        response_time_ms: row.get::<_, i64>("response_time_ms")? as u64,
        average_response_time: row.get("average_response_time")?,
        current_rps: row.get("current_rps")?,
        status_code: row.get::<_, i64>("status_code")? as u16,
    })
}

impl RunStore {
    /// Opens (or creates) the catalog at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    /// An in-memory catalog, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        // Idempotent: every statement is IF NOT EXISTS.
        conn.execute_batch(SCHEMA)?;
        Ok(RunStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    // --- Projects ---

    pub fn create_project(&self, draft: &ProjectDraft) -> Result<Project, StoreError> {
        let conn = self.lock();
        let now = now_ms();
        conn.execute(
            "INSERT INTO projects (name, description, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![draft.name, draft.description, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row("SELECT * FROM projects WHERE id = ?1", params![id], project_from_row)?)
    }

    /// All projects, most recently updated first.
    pub fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM projects ORDER BY updated_at DESC, id DESC")?;
        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row("SELECT * FROM projects WHERE id = ?1", params![id], project_from_row)
            .optional()?)
    }

    pub fn update_project(
        &self,
        id: i64,
        draft: &ProjectDraft,
    ) -> Result<Option<Project>, StoreError> {
        {
            let conn = self.lock();
            let changed = conn.execute(
                "UPDATE projects SET name = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
                params![draft.name, draft.description, now_ms(), id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_project(id)
    }

    pub fn set_project_auth(
        &self,
        id: i64,
        spec: &AuthSpec,
    ) -> Result<Option<Project>, StoreError> {
        let auth_json = serde_json::to_string(spec)?;
        {
            let conn = self.lock();
            let changed = conn.execute(
                "UPDATE projects SET auth_spec = ?1, updated_at = ?2 WHERE id = ?3",
                params![auth_json, now_ms(), id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_project(id)
    }

    pub fn clear_project_auth(&self, id: i64) -> Result<Option<Project>, StoreError> {
        {
            let conn = self.lock();
            let changed = conn.execute(
                "UPDATE projects SET auth_spec = NULL, updated_at = ?1 WHERE id = ?2",
                params![now_ms(), id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_project(id)
    }

    /// Deletes a project and, through the cascade, its endpoints. Runs
    /// survive with their endpoint link cleared.
    pub fn delete_project(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.lock();
        Ok(conn.execute("DELETE FROM projects WHERE id = ?1", params![id])? > 0)
    }

    // --- Endpoints ---

    /// Endpoints of a project, ordered by name.
    pub fn list_endpoints(&self, project_id: i64) -> Result<Vec<Endpoint>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM endpoints WHERE project_id = ?1 ORDER BY name")?;
        let endpoints = stmt
            .query_map(params![project_id], endpoint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(endpoints)
    }

    pub fn get_endpoint(&self, id: i64) -> Result<Option<Endpoint>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row("SELECT * FROM endpoints WHERE id = ?1", params![id], endpoint_from_row)
            .optional()?)
    }

    /// Creates an endpoint under `project_id` and refreshes the owning
    /// project's `updated_at`. Returns `None` when the project is unknown.
    pub fn create_endpoint(
        &self,
        project_id: i64,
        draft: &EndpointDraft,
    ) -> Result<Option<Endpoint>, StoreError> {
        let headers_json = json_opt(&draft.headers)?;
        let auth_json = json_opt(&draft.auth)?;
        let id = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let now = now_ms();
            let touched = tx.execute(
                "UPDATE projects SET updated_at = ?1 WHERE id = ?2",
                params![now, project_id],
            )?;
            if touched == 0 {
                return Ok(None);
            }
            tx.execute(
                "INSERT INTO endpoints (project_id, name, description, url, method, users, requests,
                    duration_secs, content_type, body, insecure, requires_auth, headers, auth_spec,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
                params![
                    project_id,
                    draft.name,
                    draft.description,
                    draft.url,
                    draft.method.as_str(),
                    draft.users,
                    draft.requests.map(|v| v as i64),
                    draft.duration_secs.map(|v| v as i64),
                    draft.content_type,
                    draft.body,
                    draft.insecure,
                    draft.requires_auth,
                    headers_json,
                    auth_json,
                    now,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            id
        };
        self.get_endpoint(id)
    }

    pub fn update_endpoint(
        &self,
        id: i64,
        draft: &EndpointDraft,
    ) -> Result<Option<Endpoint>, StoreError> {
        let headers_json = json_opt(&draft.headers)?;
        let auth_json = json_opt(&draft.auth)?;
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let now = now_ms();
            let changed = tx.execute(
                "UPDATE endpoints SET name = ?1, description = ?2, url = ?3, method = ?4,
                    users = ?5, requests = ?6, duration_secs = ?7, content_type = ?8, body = ?9,
                    insecure = ?10, requires_auth = ?11, headers = ?12, auth_spec = ?13,
                    updated_at = ?14
                 WHERE id = ?15",
                params![
                    draft.name,
                    draft.description,
                    draft.url,
                    draft.method.as_str(),
                    draft.users,
                    draft.requests.map(|v| v as i64),
                    draft.duration_secs.map(|v| v as i64),
                    draft.content_type,
                    draft.body,
                    draft.insecure,
                    draft.requires_auth,
                    headers_json,
                    auth_json,
                    now,
                    id,
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            tx.execute(
                "UPDATE projects SET updated_at = ?1
                 WHERE id = (SELECT project_id FROM endpoints WHERE id = ?2)",
                params![now, id],
            )?;
            tx.commit()?;
        }
        self.get_endpoint(id)
    }

    pub fn delete_endpoint(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.lock();
        Ok(conn.execute("DELETE FROM endpoints WHERE id = ?1", params![id])? > 0)
    }

    // --- Runs ---

    /// Opens a run row in status Running with a fresh token.
    pub fn create_run(&self, new_run: &NewRun) -> Result<Run, StoreError> {
        let token = generate_run_token();
        self.insert_run_row(
            &token,
            new_run,
            now_ms(),
            None,
            RunStatus::Running,
            None,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_run_row(
        &self,
        token: &str,
        new_run: &NewRun,
        started_at: i64,
        completed_at: Option<i64>,
        status: RunStatus,
        error_message: Option<&str>,
        aggregate: Option<&RunAggregate>,
    ) -> Result<Run, StoreError> {
        let conn = self.lock();
        Self::insert_run_row_on(
            &conn,
            token,
            new_run,
            started_at,
            completed_at,
            status,
            error_message,
            aggregate,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_run_row_on(
        conn: &Connection,
        token: &str,
        new_run: &NewRun,
        started_at: i64,
        completed_at: Option<i64>,
        status: RunStatus,
        error_message: Option<&str>,
        aggregate: Option<&RunAggregate>,
    ) -> Result<Run, StoreError> {
        let empty = RunAggregate::empty(token);
        let agg = aggregate.unwrap_or(&empty);
        let status_codes_json = if agg.status_codes.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&agg.status_codes)?)
        };
        conn.execute(
            "INSERT INTO runs (token, endpoint_id, url, method, users, target_requests,
                target_duration_secs, started_at, completed_at, status, error_message,
                total_requests, successful_requests, failed_requests, requests_per_second,
                average_response_time, min_response_time, max_response_time,
                p50, p75, p90, p95, p99, total_elapsed_time, status_codes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            params![
                token,
                new_run.endpoint_id,
                new_run.url,
                new_run.method.as_str(),
                new_run.users,
                new_run.target_requests.map(|v| v as i64),
                new_run.target_duration_secs.map(|v| v as i64),
                started_at,
                completed_at,
                status.as_str(),
                error_message,
                agg.total_requests as i64,
                agg.successful_requests as i64,
                agg.failed_requests as i64,
                agg.requests_per_second,
                agg.average_response_time,
                agg.min_response_time,
                agg.max_response_time,
                agg.percentiles.p50,
                agg.percentiles.p75,
                agg.percentiles.p90,
                agg.percentiles.p95,
                agg.percentiles.p99,
                agg.total_elapsed_time as i64,
                status_codes_json,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row("SELECT * FROM runs WHERE id = ?1", params![id], run_from_row)?)
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row("SELECT * FROM runs WHERE id = ?1", params![id], run_from_row)
            .optional()?)
    }

    pub fn get_run_by_token(&self, token: &str) -> Result<Option<Run>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row("SELECT * FROM runs WHERE token = ?1", params![token], run_from_row)
            .optional()?)
    }

    /// A run joined with its endpoint and project, either of which may have
    /// been deleted since.
    pub fn get_run_details(&self, id: i64) -> Result<Option<RunDetails>, StoreError> {
        let run = match self.get_run(id)? {
            Some(run) => run,
            None => return Ok(None),
        };
        let endpoint = match run.endpoint_id {
            Some(endpoint_id) => self.get_endpoint(endpoint_id)?,
            None => None,
        };
        let project = match &endpoint {
            Some(endpoint) => self.get_project(endpoint.project_id)?,
            None => None,
        };
        Ok(Some(RunDetails {
            run,
            endpoint,
            project,
        }))
    }

    /// A run with its persisted timeline, time-ordered.
    pub fn get_run_with_snapshots(&self, id: i64) -> Result<Option<RunTimeline>, StoreError> {
        let run = match self.get_run(id)? {
            Some(run) => run,
            None => return Ok(None),
        };
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM snapshots WHERE run_id = ?1 ORDER BY timestamp, id")?;
        let snapshots = stmt
            .query_map(params![id], snapshot_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(RunTimeline { run, snapshots }))
    }

    /// Applies the final aggregate and moves the run to Completed.
    pub fn complete_run(&self, token: &str, aggregate: &RunAggregate) -> Result<bool, StoreError> {
        self.finish_run(token, RunStatus::Completed, Some(aggregate), None)
    }

    /// Moves the run to Cancelled, keeping the partial aggregate.
    pub fn cancel_run(&self, token: &str, aggregate: &RunAggregate) -> Result<bool, StoreError> {
        self.finish_run(token, RunStatus::Cancelled, Some(aggregate), None)
    }

    /// Moves the run to Failed with an error message.
    pub fn fail_run(&self, token: &str, error: &str) -> Result<bool, StoreError> {
        self.finish_run(token, RunStatus::Failed, None, Some(error))
    }

    fn finish_run(
        &self,
        token: &str,
        status: RunStatus,
        aggregate: Option<&RunAggregate>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let empty = RunAggregate::empty(token);
        let agg = aggregate.unwrap_or(&empty);
        let status_codes_json = if agg.status_codes.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&agg.status_codes)?)
        };
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2, error_message = ?3,
                total_requests = ?4, successful_requests = ?5, failed_requests = ?6,
                requests_per_second = ?7, average_response_time = ?8, min_response_time = ?9,
                max_response_time = ?10, p50 = ?11, p75 = ?12, p90 = ?13, p95 = ?14, p99 = ?15,
                total_elapsed_time = ?16, status_codes = ?17
             WHERE token = ?18",
            params![
                status.as_str(),
                now_ms(),
                error,
                agg.total_requests as i64,
                agg.successful_requests as i64,
                agg.failed_requests as i64,
                agg.requests_per_second,
                agg.average_response_time,
                agg.min_response_time,
                agg.max_response_time,
                agg.percentiles.p50,
                agg.percentiles.p75,
                agg.percentiles.p90,
                agg.percentiles.p95,
                agg.percentiles.p99,
                agg.total_elapsed_time as i64,
                status_codes_json,
                token,
            ],
        )?;
        debug!(token = token, status = %status, updated = changed > 0, "Run transitioned");
        Ok(changed > 0)
    }

    /// The most recent `limit` runs by start time.
    pub fn list_recent_runs(&self, limit: u32) -> Result<Vec<Run>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1")?;
        let runs = stmt
            .query_map(params![limit], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Filtered, paginated run search, newest first.
    pub fn search_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let mut sql = String::from("SELECT runs.* FROM runs");
        let mut clauses: Vec<&str> = Vec::new();
        let mut bind: Vec<Value> = Vec::new();

        if let Some(project_id) = filter.project_id {
            sql.push_str(" JOIN endpoints ON endpoints.id = runs.endpoint_id");
            clauses.push("endpoints.project_id = ?");
            bind.push(Value::Integer(project_id));
        }
        if let Some(endpoint_id) = filter.endpoint_id {
            clauses.push("runs.endpoint_id = ?");
            bind.push(Value::Integer(endpoint_id));
        }
        if let Some(status) = filter.status {
            clauses.push("runs.status = ?");
            bind.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(from) = filter.from {
            clauses.push("runs.started_at >= ?");
            bind.push(Value::Integer(from.timestamp_millis()));
        }
        if let Some(to) = filter.to {
            clauses.push("runs.started_at <= ?");
            bind.push(Value::Integer(to.timestamp_millis()));
        }
        for (i, clause) in clauses.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(clause);
        }
        sql.push_str(" ORDER BY runs.started_at DESC, runs.id DESC LIMIT ? OFFSET ?");
        bind.push(Value::Integer(filter.limit.unwrap_or(50) as i64));
        bind.push(Value::Integer(filter.offset.unwrap_or(0) as i64));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params_from_iter(bind), run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn delete_run(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.lock();
        Ok(conn.execute("DELETE FROM runs WHERE id = ?1", params![id])? > 0)
    }

    // --- Snapshots ---

    /// Appends a timeline point for the run identified by the sample's
    /// token. A no-op when the run row is not (yet) visible: the engine may
    /// outpace the initial INSERT and that must never fail the run.
    pub fn append_snapshot(&self, sample: &MetricSample) -> Result<(), StoreError> {
        let conn = self.lock();
        let run_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM runs WHERE token = ?1",
                params![sample.run_token],
                |row| row.get(0),
            )
            .optional()?;
        let run_id = match run_id {
            Some(id) => id,
            None => return Ok(()),
        };
        conn.execute(
            "INSERT INTO snapshots (run_id, timestamp, total_requests, successful_requests,
                failed_requests, response_time_ms, average_response_time, current_rps, status_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_id,
                sample.timestamp.timestamp_millis(),
                sample.total_requests as i64,
                sample.successful_requests as i64,
                sample.failed_requests as i64,
                sample.response_time_ms as i64,
                sample.average_response_time,
                sample.current_rps,
                sample.status_code as i64,
            ],
        )?;
        Ok(())
    }

    // --- Statistics ---

    /// Cross-run totals, optionally narrowed to one project or endpoint.
    pub fn run_statistics(
        &self,
        project_id: Option<i64>,
        endpoint_id: Option<i64>,
    ) -> Result<RunStatistics, StoreError> {
        let (join, clause, bind) = match (endpoint_id, project_id) {
            (Some(endpoint_id), _) => ("", " WHERE runs.endpoint_id = ?", vec![Value::Integer(endpoint_id)]),
            (None, Some(project_id)) => (
                " JOIN endpoints ON endpoints.id = runs.endpoint_id",
                " WHERE endpoints.project_id = ?",
                vec![Value::Integer(project_id)],
            ),
            (None, None) => ("", "", Vec::new()),
        };

        let conn = self.lock();
        let mut stats = RunStatistics::default();

        let sql = format!(
            "SELECT runs.status, COUNT(*), COALESCE(SUM(runs.total_requests), 0)
             FROM runs{}{} GROUP BY runs.status",
            join, clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bind.clone()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (status, count, requests) in rows {
            let count = count as u64;
            stats.total_runs += count;
            stats.total_requests += requests as u64;
            match status.parse::<RunStatus>().map_err(StoreError::Decode)? {
                RunStatus::Running => stats.running_runs += count,
                RunStatus::Completed => stats.completed_runs += count,
                RunStatus::Failed => stats.failed_runs += count,
                RunStatus::Cancelled => stats.cancelled_runs += count,
            }
        }

        let sql = format!(
            "SELECT COALESCE(AVG(runs.average_response_time), 0),
                    COALESCE(AVG(runs.requests_per_second), 0)
             FROM runs{}{}{} runs.status = 'Completed'",
            join,
            clause,
            if clause.is_empty() { " WHERE" } else { " AND" }
        );
        let (avg_latency, avg_rps) = conn.query_row(&sql, params_from_iter(bind), |row| {
            Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?))
        })?;
        stats.average_response_time = avg_latency;
        stats.average_rps = avg_rps;

        Ok(stats)
    }

    // --- Export / import ---

    /// Serializes a project, its endpoints and their full run history.
    /// Snapshots are ephemeral telemetry and are not exported.
    pub fn export_project(&self, id: i64) -> Result<Option<ProjectExport>, StoreError> {
        let project = match self.get_project(id)? {
            Some(project) => project,
            None => return Ok(None),
        };
        let mut endpoints = Vec::new();
        for endpoint in self.list_endpoints(id)? {
            let runs = {
                let conn = self.lock();
                let mut stmt = conn.prepare(
                    "SELECT * FROM runs WHERE endpoint_id = ?1 ORDER BY started_at, id",
                )?;
                let rows = stmt
                    .query_map(params![endpoint.id], run_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            endpoints.push(ExportedEndpoint {
                name: endpoint.name,
                description: endpoint.description,
                url: endpoint.url,
                method: endpoint.method,
                users: endpoint.users,
                requests: endpoint.requests,
                duration_secs: endpoint.duration_secs,
                content_type: endpoint.content_type,
                body: endpoint.body,
                insecure: endpoint.insecure,
                requires_auth: endpoint.requires_auth,
                headers: endpoint.headers,
                auth: endpoint.auth,
                executions: runs
                    .into_iter()
                    .map(|run| ExportedRun {
                        token: run.token,
                        url: run.url,
                        method: run.method,
                        users: run.users,
                        target_requests: run.target_requests,
                        target_duration_secs: run.target_duration_secs,
                        started_at: run.started_at,
                        completed_at: run.completed_at,
                        status: run.status,
                        error_message: run.error_message,
                        aggregate: run.aggregate,
                    })
                    .collect(),
            });
        }
        Ok(Some(ProjectExport {
            version: EXPORT_VERSION.to_string(),
            exported_at: Utc::now(),
            project: ExportedProject {
                name: project.name,
                description: project.description,
                auth: project.auth,
                endpoints,
            },
        }))
    }

    /// Imports a previously exported project in a single transaction. The
    /// project name gets an " (Imported)" suffix and every run receives a
    /// fresh `imported-`-prefixed token. Any failure rolls the whole import
    /// back.
    pub fn import_project(&self, export: &ProjectExport) -> Result<Project, StoreError> {
        if export.project.name.trim().is_empty() {
            return Err(StoreError::InvalidImport(
                "project name is missing".to_string(),
            ));
        }

        let project_id = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let now = now_ms();
            let name = format!("{} (Imported)", export.project.name);
            let auth_json = json_opt(&export.project.auth)?;
            tx.execute(
                "INSERT INTO projects (name, description, auth_spec, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name, export.project.description, auth_json, now],
            )?;
            let project_id = tx.last_insert_rowid();

            for endpoint in &export.project.endpoints {
                let headers_json = json_opt(&endpoint.headers)?;
                let endpoint_auth_json = json_opt(&endpoint.auth)?;
                tx.execute(
                    "INSERT INTO endpoints (project_id, name, description, url, method, users,
                        requests, duration_secs, content_type, body, insecure, requires_auth,
                        headers, auth_spec, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
                    params![
                        project_id,
                        endpoint.name,
                        endpoint.description,
                        endpoint.url,
                        endpoint.method.as_str(),
                        endpoint.users,
                        endpoint.requests.map(|v| v as i64),
                        endpoint.duration_secs.map(|v| v as i64),
                        endpoint.content_type,
                        endpoint.body,
                        endpoint.insecure,
                        endpoint.requires_auth,
                        headers_json,
                        endpoint_auth_json,
                        now,
                    ],
                )?;
                let endpoint_id = tx.last_insert_rowid();

                for run in &endpoint.executions {
                    // Provenance stays visible in the token.
                    let token = format!("imported-{}", generate_run_token());
                    Self::insert_run_row_on(
                        &tx,
                        &token,
                        &NewRun {
                            endpoint_id: Some(endpoint_id),
                            url: &run.url,
                            method: run.method,
                            users: run.users,
                            target_requests: run.target_requests,
                            target_duration_secs: run.target_duration_secs,
                        },
                        run.started_at.timestamp_millis(),
                        run.completed_at.map(|t| t.timestamp_millis()),
                        run.status,
                        run.error_message.as_deref(),
                        Some(&run.aggregate),
                    )?;
                }
            }

            tx.commit()?;
            project_id
        };

        self.get_project(project_id)?.ok_or_else(|| {
            StoreError::InvalidImport("imported project vanished before readback".to_string())
        })
    }
}
