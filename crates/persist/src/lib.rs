//! Konverge persistence: minimal SQLite store for the last successful
//! observed-state snapshot per target plus the append-only run audit trail.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use konverge_core::{ObservedState, ReconciliationRun, ResourceId};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRow {
    id: ResourceId,
    payload: Json,
}

pub trait Store: Send + Sync {
    /// Overwrite the snapshot for `target` atomically. Called only at the end
    /// of a successful pass.
    fn put_snapshot(&self, target: &str, state: &ObservedState) -> Result<()>;
    fn get_snapshot(&self, target: &str) -> Result<Option<ObservedState>>;
    /// Append a finished run to the audit trail. Runs are never mutated.
    fn put_run(&self, run: &ReconciliationRun) -> Result<()>;
    fn recent_runs(&self, target: &str, limit: usize) -> Result<Vec<ReconciliationRun>>;
}

/// SQLite-backed store. Simple, synchronous; reconciliation passes are not
/// latency sensitive here.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KONVERGE_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                target TEXT PRIMARY KEY,
                ts     INTEGER NOT NULL,
                state  TEXT NOT NULL
            )",
            [],
        )
        .context("creating snapshots table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                target   TEXT NOT NULL,
                started  INTEGER NOT NULL,
                finished INTEGER NOT NULL,
                status   TEXT NOT NULL,
                report   TEXT NOT NULL
            )",
            [],
        )
        .context("creating runs table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_target_started ON runs(target, started DESC)",
            [],
        )
        .ok();
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(%path, "sqlite store open");
        Ok(me)
    }
}

impl Store for SqliteStore {
    fn put_snapshot(&self, target: &str, state: &ObservedState) -> Result<()> {
        let started = std::time::Instant::now();
        let rows: Vec<SnapshotRow> = state
            .iter()
            .map(|(id, payload)| SnapshotRow { id: id.clone(), payload: payload.clone() })
            .collect();
        let blob = serde_json::to_string(&rows).context("serializing snapshot")?;
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO snapshots(target, ts, state) VALUES (?1, ?2, ?3)
             ON CONFLICT(target) DO UPDATE SET ts = excluded.ts, state = excluded.state",
            (target, now_ts(), &blob),
        )?;
        tx.commit()?;
        histogram!("persist_put_snapshot_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_snapshot_total", 1u64);
        Ok(())
    }

    fn get_snapshot(&self, target: &str) -> Result<Option<ObservedState>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT state FROM snapshots WHERE target = ?1")?;
        let mut rows = stmt.query([target])?;
        match rows.next()? {
            Some(row) => {
                let blob: String = row.get(0)?;
                let rows: Vec<SnapshotRow> =
                    serde_json::from_str(&blob).context("deserializing snapshot")?;
                Ok(Some(rows.into_iter().map(|r| (r.id, r.payload)).collect()))
            }
            None => Ok(None),
        }
    }

    fn put_run(&self, run: &ReconciliationRun) -> Result<()> {
        let report = serde_json::to_string(run).context("serializing run report")?;
        let status = match run.status {
            konverge_core::RunStatus::Converged => "converged",
            konverge_core::RunStatus::Failed => "failed",
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO runs(target, started, finished, status, report) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&run.target, run.started_ts, run.finished_ts, status, &report),
        )?;
        counter!("persist_put_run_total", 1u64);
        Ok(())
    }

    fn recent_runs(&self, target: &str, limit: usize) -> Result<Vec<ReconciliationRun>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT report FROM runs WHERE target = ?1 ORDER BY started DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((target, limit as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let report: String = row.get(0)?;
            out.push(serde_json::from_str(&report).context("deserializing run report")?);
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".konverge");
        let _ = std::fs::create_dir_all(&p);
        p.push("konverge.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "konverge.db".to_string()
}

/// Seconds since epoch.
pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs() as i64
}
