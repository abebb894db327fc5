//! Shared server state: the engine, the in-memory job map, and the scan
//! queue feeding the single worker task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use miniscan_engine::ScanEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Error,
}

/// In-memory record of one scan job. Jobs live for the process lifetime;
/// durable state is the upload record in the checkpoint store.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub status: JobStatus,
    pub csv_path: PathBuf,
    pub upload_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A scan request travelling from the HTTP surface to the queue worker.
#[derive(Debug)]
pub struct QueuedScan {
    pub job_id: Uuid,
    pub csv_path: PathBuf,
    pub upload_id: String,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ScanEngine>,
    pub jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
    pub queue_tx: mpsc::UnboundedSender<QueuedScan>,
    pub uploads_dir: PathBuf,
}
