use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use sleuth_core::error::{Result, SleuthError};
use sleuth_core::types::{RunId, RunRecord, RunStatus, SketchId};

/// SQLite-backed run records.
///
/// The state machine is guarded in SQL: every transition predicates on
/// the expected prior status, so a terminal record can never be
/// resurrected, even by racing workers.
pub struct RunStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        sketch_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        error TEXT,
        results TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_runs_sketch ON runs(sketch_id);";

impl RunStore {
    /// Open or create the run database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SleuthError::Database(format!("Failed to create run store directory: {}", e))
            })?;
        }

        let conn =
            Connection::open(path).map_err(|e| SleuthError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| SleuthError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| SleuthError::Database(e.to_string()))?;

        debug!(path = %path.display(), "Run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| SleuthError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| SleuthError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a new pending run.
    pub fn create(&self, sketch_id: &SketchId) -> Result<RunRecord> {
        let id = RunId::new();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (id, sketch_id, status) VALUES (?1, ?2, 'pending')",
            params![id.0, sketch_id.0],
        )
        .map_err(|e| SleuthError::Database(e.to_string()))?;

        Ok(RunRecord {
            id,
            sketch_id: sketch_id.clone(),
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            results: None,
        })
    }

    /// pending -> running.
    pub fn mark_running(&self, id: &RunId) -> Result<()> {
        self.transition(
            id,
            "UPDATE runs SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
        )
    }

    /// running -> completed, recording transport-safe results.
    pub fn mark_completed(&self, id: &RunId, results: &serde_json::Value) -> Result<()> {
        let serialized = serde_json::to_string(results)?;
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE runs SET status = 'completed', completed_at = ?2, results = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id.0, Utc::now().to_rfc3339(), serialized],
            )
            .map_err(|e| SleuthError::Database(e.to_string()))?;
        if affected == 0 {
            return Err(SleuthError::RunTransition(format!(
                "run {} is not running",
                id
            )));
        }
        Ok(())
    }

    /// running -> failed, recording the error text.
    pub fn mark_failed(&self, id: &RunId, error: &str) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE runs SET status = 'failed', completed_at = ?2, error = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id.0, Utc::now().to_rfc3339(), error],
            )
            .map_err(|e| SleuthError::Database(e.to_string()))?;
        if affected == 0 {
            return Err(SleuthError::RunTransition(format!(
                "run {} is not running",
                id
            )));
        }
        Ok(())
    }

    /// Fetch a run by id.
    pub fn get(&self, id: &RunId) -> Result<Option<RunRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, sketch_id, status, started_at, completed_at, error, results
             FROM runs WHERE id = ?1",
            params![id.0],
            row_to_record,
        )
        .optional()
        .map_err(|e| SleuthError::Database(e.to_string()))
    }

    fn transition(&self, id: &RunId, sql: &str) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn
            .execute(sql, params![id.0, Utc::now().to_rfc3339()])
            .map_err(|e| SleuthError::Database(e.to_string()))?;
        if affected == 0 {
            return Err(SleuthError::RunTransition(format!(
                "run {} refused the transition",
                id
            )));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SleuthError::Database(e.to_string()))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(2)?;
    let started: Option<String> = row.get(3)?;
    let completed: Option<String> = row.get(4)?;
    let results: Option<String> = row.get(6)?;

    Ok(RunRecord {
        id: RunId(row.get(0)?),
        sketch_id: SketchId(row.get(1)?),
        status: status.parse().unwrap_or(RunStatus::Failed),
        started_at: started.as_deref().and_then(parse_ts),
        completed_at: completed.as_deref().and_then(parse_ts),
        error: row.get(5)?,
        results: results.and_then(|r| serde_json::from_str(&r).ok()),
    })
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
