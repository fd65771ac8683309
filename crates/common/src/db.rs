//! SQLite store for run summaries and per-tuple result envelopes

use crate::types::{BatchSummary, RunState, TestOutcome};
use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Stored run row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub id: String,
    pub test_name: String,
    pub state: String,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Stored result row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub run_id: String,
    pub tuple_id: i64,
    pub outcome: String,
    pub time_taken_ms: i64,
    pub envelope: serde_json::Value,
    pub created_at: i64,
}

/// Results database shared between the reporters of one process
#[derive(Clone)]
pub struct ResultStore {
    conn: Arc<Mutex<Connection>>,
}

impl ResultStore {
    /// Open or create the store at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;

        // WAL lets the async reporters write while a CLI reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        info!("Opened result store at {:?}", path.as_ref());
        Ok(store)
    }

    /// Open in-memory store (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                test_name TEXT NOT NULL,
                state TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                passed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                summary TEXT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_runs_test ON runs(test_name);

            CREATE TABLE IF NOT EXISTS results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                tuple_id INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                time_taken_ms INTEGER NOT NULL,
                envelope TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(run_id, tuple_id)
            );
            CREATE INDEX IF NOT EXISTS idx_results_run ON results(run_id);
            "#,
        )?;

        Ok(())
    }

    /// Register a new run in the running state
    pub fn begin_run(&self, run_id: &str, test_name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO runs (id, test_name, state, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id,
                test_name,
                RunState::Running.to_string(),
                chrono::Utc::now().timestamp()
            ],
        )?;
        debug!("Began run {}", run_id);
        Ok(())
    }

    /// Store one tuple's envelope. A tuple is stored at most once per run.
    pub fn record_result(
        &self,
        run_id: &str,
        tuple_id: usize,
        outcome: &TestOutcome,
        time_taken_ms: u64,
        envelope: &serde_json::Value,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO results
             (run_id, tuple_id, outcome, time_taken_ms, envelope, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                tuple_id as i64,
                outcome.kind(),
                time_taken_ms as i64,
                serde_json::to_string(envelope)?,
                chrono::Utc::now().timestamp()
            ],
        )?;
        debug!("Recorded result for tuple {} of run {}", tuple_id, run_id);
        Ok(rows > 0)
    }

    /// Close a run with its summary
    pub fn finish_run(&self, summary: &BatchSummary) -> Result<()> {
        let conn = self.conn.lock();
        let failed = summary.total - summary.passed;
        conn.execute(
            "UPDATE runs SET state = ?1, total = ?2, passed = ?3, failed = ?4, summary = ?5,
             finished_at = ?6 WHERE id = ?7",
            params![
                summary.state.to_string(),
                summary.total as i64,
                summary.passed as i64,
                failed as i64,
                serde_json::to_string(summary)?,
                chrono::Utc::now().timestamp(),
                summary.run_id,
            ],
        )?;
        info!(
            "Run {} finished: {}/{} passed",
            summary.run_id, summary.passed, summary.total
        );
        Ok(())
    }

    /// Get a run by id
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, test_name, state, total, passed, failed, started_at, finished_at
                 FROM runs WHERE id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// List runs, newest first
    pub fn list_runs(&self) -> Result<Vec<RunRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, test_name, state, total, passed, failed, started_at, finished_at
             FROM runs ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map([], run_from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    /// List the results of a run in tuple order
    pub fn list_results(&self, run_id: &str) -> Result<Vec<ResultRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, tuple_id, outcome, time_taken_ms, envelope, created_at
             FROM results WHERE run_id = ?1 ORDER BY tuple_id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (run_id, tuple_id, outcome, time_taken_ms, envelope, created_at) = row?;
            results.push(ResultRow {
                run_id,
                tuple_id,
                outcome,
                time_taken_ms,
                envelope: serde_json::from_str(&envelope)?,
                created_at,
            });
        }
        Ok(results)
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        test_name: row.get(1)?,
        state: row.get(2)?,
        total: row.get(3)?,
        passed: row.get(4)?,
        failed: row.get(5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
    })
}
