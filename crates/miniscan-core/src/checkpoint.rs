//! Durable per-commit scan state and per-upload bookkeeping.
//!
//! Backed by a single SQLite file in WAL mode. The claim protocol is the only
//! cross-worker synchronisation point: `try_claim_commit` performs an
//! insert-or-inspect inside one transaction, so at most one worker owns a
//! commit SHA at any instant.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::input::RepoCommitCount;

const STATUS_PENDING: &str = "PENDING";
const STATUS_PROCESSED: &str = "PROCESSED";
const STATUS_FAILED: &str = "FAILED";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint store: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("checkpoint store encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of a claim attempt for a commit SHA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No row existed; this worker now owns the SHA.
    ClaimedNew,
    /// A PENDING row survived an earlier run; this worker resumes it.
    ResumedPending,
    /// The SHA already reached PROCESSED or FAILED; nothing to do.
    AlreadyTerminal,
}

/// Optional metadata recorded alongside a commit row. `None` fields preserve
/// whatever was stored previously.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitMeta<'a> {
    pub repo_name: Option<&'a str>,
    pub project_key: Option<&'a str>,
    pub repo_url: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoSummary {
    pub repo_name: String,
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub pending: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploaded,
    Queued,
    Running,
    Completed,
    Error,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Queued => "queued",
            UploadStatus::Running => "running",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "queued" => UploadStatus::Queued,
            "running" => UploadStatus::Running,
            "completed" => UploadStatus::Completed,
            "error" => UploadStatus::Error,
            _ => UploadStatus::Uploaded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadRecord {
    pub id: String,
    pub filename: String,
    pub saved_path: String,
    pub status: UploadStatus,
    pub total_commits: i64,
    pub repo_summary: Vec<RepoCommitCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub uploaded_at: i64,
}

/// Handle to the checkpoint database. Cheap to clone; all clones share one
/// connection behind a mutex.
#[derive(Clone)]
pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_schema(&conn)?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attempt to take ownership of a commit SHA.
    ///
    /// Inserts a PENDING row when none exists. An existing PENDING row is
    /// refreshed and resumed; terminal rows are left untouched.
    pub fn try_claim_commit(
        &self,
        commit_sha: &str,
        meta: CommitMeta<'_>,
    ) -> Result<ClaimOutcome, CheckpointError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO scans (commit_sha, status, repo_name, project_key, repo_url, updated_at)
             VALUES (?1, 'PENDING', ?2, ?3, ?4, ?5)
             ON CONFLICT(commit_sha) DO NOTHING",
            params![commit_sha, meta.repo_name, meta.project_key, meta.repo_url, now],
        )?;
        if inserted == 1 {
            tx.commit()?;
            return Ok(ClaimOutcome::ClaimedNew);
        }

        let status: String = tx.query_row(
            "SELECT status FROM scans WHERE commit_sha = ?1",
            [commit_sha],
            |row| row.get(0),
        )?;
        let outcome = if status == STATUS_PENDING {
            tx.execute(
                "UPDATE scans
                 SET updated_at = ?1,
                     repo_name = COALESCE(?2, repo_name),
                     project_key = COALESCE(?3, project_key),
                     repo_url = COALESCE(?4, repo_url)
                 WHERE commit_sha = ?5",
                params![now, meta.repo_name, meta.project_key, meta.repo_url, commit_sha],
            )?;
            ClaimOutcome::ResumedPending
        } else {
            ClaimOutcome::AlreadyTerminal
        };
        tx.commit()?;
        Ok(outcome)
    }

    pub fn mark_processed(
        &self,
        commit_sha: &str,
        meta: CommitMeta<'_>,
    ) -> Result<(), CheckpointError> {
        self.update_status(commit_sha, STATUS_PROCESSED, None, meta)
    }

    pub fn mark_failed(
        &self,
        commit_sha: &str,
        error: &str,
        meta: CommitMeta<'_>,
    ) -> Result<(), CheckpointError> {
        self.update_status(commit_sha, STATUS_FAILED, Some(error), meta)
    }

    fn update_status(
        &self,
        commit_sha: &str,
        status: &str,
        error: Option<&str>,
        meta: CommitMeta<'_>,
    ) -> Result<(), CheckpointError> {
        self.conn().execute(
            "UPDATE scans
             SET status = ?1, error_msg = ?2, updated_at = ?3,
                 repo_name = COALESCE(?4, repo_name),
                 project_key = COALESCE(?5, project_key),
                 repo_url = COALESCE(?6, repo_url)
             WHERE commit_sha = ?7",
            params![
                status,
                error,
                Utc::now().timestamp(),
                meta.repo_name,
                meta.project_key,
                meta.repo_url,
                commit_sha
            ],
        )?;
        Ok(())
    }

    pub fn is_processed(&self, commit_sha: &str) -> bool {
        let result: Result<Option<i64>, rusqlite::Error> = self
            .conn()
            .query_row(
                "SELECT 1 FROM scans WHERE commit_sha = ?1 AND status = 'PROCESSED'",
                [commit_sha],
                |row| row.get(0),
            )
            .optional();
        match result {
            Ok(found) => found.is_some(),
            Err(err) => {
                error!("checkpoint read failed for {commit_sha}: {err}");
                false
            }
        }
    }

    pub fn get_stats(&self) -> BTreeMap<String, i64> {
        let conn = self.conn();
        let mut out = BTreeMap::new();
        let mut run = || -> Result<(), rusqlite::Error> {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM scans GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                out.insert(status, count);
            }
            Ok(())
        };
        if let Err(err) = run() {
            error!("failed to read scan stats: {err}");
        }
        out
    }

    pub fn get_repo_summary(&self) -> Vec<RepoSummary> {
        let conn = self.conn();
        let run = || -> Result<Vec<RepoSummary>, rusqlite::Error> {
            let mut stmt = conn.prepare(
                "SELECT
                     COALESCE(repo_name, 'unknown') AS repo_name,
                     COUNT(*) AS total,
                     SUM(CASE WHEN status = 'PROCESSED' THEN 1 ELSE 0 END) AS processed,
                     SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END) AS failed,
                     SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END) AS pending
                 FROM scans
                 GROUP BY COALESCE(repo_name, 'unknown')
                 ORDER BY repo_name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RepoSummary {
                    repo_name: row.get(0)?,
                    total: row.get(1)?,
                    processed: row.get(2)?,
                    failed: row.get(3)?,
                    pending: row.get(4)?,
                })
            })?;
            rows.collect()
        };
        match run() {
            Ok(rows) => rows,
            Err(err) => {
                error!("failed to read repo summary: {err}");
                Vec::new()
            }
        }
    }

    /// Clear leftover PENDING rows so they can be claimed afresh. Operator
    /// action only; never invoked automatically at startup.
    pub fn reset_pending_jobs(&self) -> Result<usize, CheckpointError> {
        let cleared = self
            .conn()
            .execute("DELETE FROM scans WHERE status = 'PENDING'", [])?;
        info!("reset {cleared} pending scan rows");
        Ok(cleared)
    }

    pub fn upsert_upload(&self, record: &UploadRecord) -> Result<(), CheckpointError> {
        let summary = serde_json::to_string(&record.repo_summary)?;
        self.conn().execute(
            "INSERT INTO uploads
                 (id, filename, saved_path, status, total_commits, repo_summary, job_id, error, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 filename = excluded.filename,
                 saved_path = excluded.saved_path,
                 status = excluded.status,
                 total_commits = excluded.total_commits,
                 repo_summary = excluded.repo_summary,
                 job_id = excluded.job_id,
                 error = excluded.error,
                 uploaded_at = excluded.uploaded_at",
            params![
                record.id,
                record.filename,
                record.saved_path,
                record.status.as_str(),
                record.total_commits,
                summary,
                record.job_id,
                record.error,
                record.uploaded_at
            ],
        )?;
        Ok(())
    }

    /// Update an upload's status. `job_id = None` keeps the stored value;
    /// `error` is written as given so a re-queue clears stale messages.
    pub fn update_upload_status(
        &self,
        id: &str,
        status: UploadStatus,
        job_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), CheckpointError> {
        self.conn().execute(
            "UPDATE uploads
             SET status = ?1, job_id = COALESCE(?2, job_id), error = ?3
             WHERE id = ?4",
            params![status.as_str(), job_id, error, id],
        )?;
        Ok(())
    }

    pub fn get_upload(&self, id: &str) -> Option<UploadRecord> {
        let conn = self.conn();
        let result = conn
            .query_row(
                &format!("{UPLOAD_SELECT} WHERE id = ?1"),
                [id],
                upload_from_row,
            )
            .optional();
        match result {
            Ok(row) => row,
            Err(err) => {
                error!("failed to read upload {id}: {err}");
                None
            }
        }
    }

    pub fn get_uploads(&self) -> Vec<UploadRecord> {
        self.query_uploads(&format!("{UPLOAD_SELECT} ORDER BY uploaded_at DESC"))
    }

    /// Demote `queued`/`running` uploads back to `uploaded` after a restart.
    pub fn reset_upload_states(&self) -> Result<usize, CheckpointError> {
        let demoted = self.conn().execute(
            "UPDATE uploads SET status = 'uploaded' WHERE status IN ('queued', 'running')",
            [],
        )?;
        Ok(demoted)
    }

    /// Uploads interrupted mid-flight (`queued`/`running`), plus `error`
    /// uploads when requested.
    pub fn get_resumable_uploads(&self, include_error: bool) -> Vec<UploadRecord> {
        if include_error {
            self.query_uploads(&format!(
                "{UPLOAD_SELECT} WHERE status IN ('queued', 'running', 'error') \
                 ORDER BY uploaded_at"
            ))
        } else {
            self.query_uploads(&format!(
                "{UPLOAD_SELECT} WHERE status IN ('queued', 'running') ORDER BY uploaded_at"
            ))
        }
    }

    fn query_uploads(&self, sql: &str) -> Vec<UploadRecord> {
        let conn = self.conn();
        let run = || -> Result<Vec<UploadRecord>, rusqlite::Error> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], upload_from_row)?;
            rows.collect()
        };
        match run() {
            Ok(rows) => rows,
            Err(err) => {
                error!("failed to read uploads: {err}");
                Vec::new()
            }
        }
    }
}

const UPLOAD_SELECT: &str = "SELECT id, filename, saved_path, status, total_commits, \
                             repo_summary, job_id, error, uploaded_at FROM uploads";

fn upload_from_row(row: &rusqlite::Row<'_>) -> Result<UploadRecord, rusqlite::Error> {
    let status: String = row.get(3)?;
    let summary_raw: Option<String> = row.get(5)?;
    let repo_summary = summary_raw
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    Ok(UploadRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        saved_path: row.get(2)?,
        status: UploadStatus::parse(&status),
        total_commits: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        repo_summary,
        job_id: row.get(6)?,
        error: row.get(7)?,
        uploaded_at: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
    })
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scans (
             commit_sha TEXT PRIMARY KEY,
             status TEXT NOT NULL,
             error_msg TEXT,
             repo_name TEXT,
             project_key TEXT,
             repo_url TEXT,
             updated_at INTEGER
         )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS uploads (
             id TEXT PRIMARY KEY,
             filename TEXT,
             saved_path TEXT,
             status TEXT NOT NULL,
             total_commits INTEGER,
             repo_summary TEXT,
             job_id TEXT,
             error TEXT,
             uploaded_at INTEGER
         )",
        [],
    )?;
    ensure_columns(conn, "scans", &[
        ("repo_name", "ALTER TABLE scans ADD COLUMN repo_name TEXT"),
        ("project_key", "ALTER TABLE scans ADD COLUMN project_key TEXT"),
        ("repo_url", "ALTER TABLE scans ADD COLUMN repo_url TEXT"),
    ])?;
    ensure_columns(conn, "uploads", &[
        ("job_id", "ALTER TABLE uploads ADD COLUMN job_id TEXT"),
        ("error", "ALTER TABLE uploads ADD COLUMN error TEXT"),
    ])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_scans_repo ON scans(repo_name)", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_scans_status ON scans(status)", [])?;
    Ok(())
}

/// Add columns introduced after a store was created, so older databases keep
/// opening.
fn ensure_columns(
    conn: &Connection,
    table: &str,
    extras: &[(&str, &str)],
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;
    for (column, ddl) in extras {
        if !existing.iter().any(|c| c == column) {
            conn.execute(ddl, [])?;
        }
    }
    Ok(())
}
