//! Upload-to-queue transitions enforced by the submission surface.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, mpsc};

use miniscan_core::checkpoint::{UploadRecord, UploadStatus};
use miniscan_core::config::Config;
use miniscan_engine::ScanEngine;
use miniscan_server::jobs::{self, EnqueueError};
use miniscan_server::state::{AppState, JobStatus};

fn test_config(work_dir: &Path) -> Config {
    Config {
        sonar_host_url: "http://127.0.0.1:9".to_string(),
        sonar_token: "stub-token".to_string(),
        work_dir: work_dir.to_path_buf(),
        scanner_bin: "sonar-scanner".to_string(),
        sonar_exclusions: String::new(),
        github_tokens: Vec::new(),
        concurrent_scans: 1,
        batch_size: 10,
        checkpoint_file: work_dir.join("checkpoint.db"),
        input_csv: work_dir.join("unused.csv"),
        wait_for_ce: false,
        wait_for_ce_timeout: Duration::from_secs(1),
        wait_for_ce_poll: Duration::from_secs(1),
        auto_resume: false,
        auto_resume_error: false,
    }
}

fn app_state(work_dir: &Path) -> (AppState, mpsc::UnboundedReceiver<miniscan_server::state::QueuedScan>) {
    let engine = Arc::new(ScanEngine::new(test_config(work_dir)).unwrap());
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let state = AppState {
        engine,
        jobs: Arc::new(RwLock::new(HashMap::new())),
        queue_tx,
        uploads_dir: work_dir.join("uploads"),
    };
    (state, queue_rx)
}

fn upload(id: &str, status: UploadStatus) -> UploadRecord {
    UploadRecord {
        id: id.to_string(),
        filename: "batch.csv".to_string(),
        saved_path: format!("/tmp/{id}.csv"),
        status,
        total_commits: 1,
        repo_summary: Vec::new(),
        job_id: None,
        error: None,
        uploaded_at: Utc::now().timestamp(),
    }
}

#[tokio::test]
async fn enqueue_moves_upload_to_queued() {
    let dir = tempfile::tempdir().unwrap();
    let (state, mut queue_rx) = app_state(dir.path());

    let record = upload("u1", UploadStatus::Uploaded);
    state.engine.checkpoint().upsert_upload(&record).unwrap();

    let job_id = jobs::enqueue_scan(&state, &record).await.unwrap();

    let stored = state.engine.checkpoint().get_upload("u1").unwrap();
    assert_eq!(stored.status, UploadStatus::Queued);
    assert_eq!(stored.job_id.as_deref(), Some(job_id.to_string().as_str()));

    let job = state.jobs.read().await.get(&job_id).cloned().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.upload_id, "u1");

    let queued = queue_rx.recv().await.unwrap();
    assert_eq!(queued.job_id, job_id);
    assert_eq!(queued.upload_id, "u1");
}

#[tokio::test]
async fn active_uploads_are_not_reenqueued() {
    let dir = tempfile::tempdir().unwrap();
    let (state, mut queue_rx) = app_state(dir.path());

    for (id, status) in [
        ("q", UploadStatus::Queued),
        ("r", UploadStatus::Running),
        ("c", UploadStatus::Completed),
    ] {
        let record = upload(id, status);
        state.engine.checkpoint().upsert_upload(&record).unwrap();
        let err = jobs::enqueue_scan(&state, &record).await.unwrap_err();
        assert!(matches!(err, EnqueueError::NotEligible(_)), "{id} must not re-enqueue");
    }
    assert!(queue_rx.try_recv().is_err(), "nothing may reach the queue");
}

#[tokio::test]
async fn errored_uploads_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (state, mut queue_rx) = app_state(dir.path());

    let mut record = upload("e1", UploadStatus::Error);
    record.error = Some("previous failure".to_string());
    state.engine.checkpoint().upsert_upload(&record).unwrap();

    jobs::enqueue_scan(&state, &record).await.unwrap();
    let stored = state.engine.checkpoint().get_upload("e1").unwrap();
    assert_eq!(stored.status, UploadStatus::Queued);
    assert_eq!(stored.error, None, "a retry clears the stale error");
    assert!(queue_rx.recv().await.is_some());
}
