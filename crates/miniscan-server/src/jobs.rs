//! Scan queue: enqueueing with upload-state transitions, and the single
//! worker task that drains the queue one CSV at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{error, info};
use uuid::Uuid;

use miniscan_core::checkpoint::{UploadRecord, UploadStatus};
use miniscan_engine::ScanEngine;

use crate::state::{AppState, Job, JobStatus, QueuedScan};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("upload is {0}, not eligible for scanning")]
    NotEligible(&'static str),
    #[error("failed to queue scan: {0}")]
    Internal(String),
}

/// Move an upload to `queued` and hand it to the worker. Only `uploaded`
/// uploads (and `error` ones, for operator retries) are eligible.
pub async fn enqueue_scan(state: &AppState, upload: &UploadRecord) -> Result<Uuid, EnqueueError> {
    match upload.status {
        UploadStatus::Uploaded | UploadStatus::Error => {}
        other => return Err(EnqueueError::NotEligible(other.as_str())),
    }

    let job_id = Uuid::new_v4();
    let csv_path = PathBuf::from(&upload.saved_path);

    state
        .engine
        .checkpoint()
        .update_upload_status(&upload.id, UploadStatus::Queued, Some(&job_id.to_string()), None)
        .map_err(|err| EnqueueError::Internal(err.to_string()))?;

    state.jobs.write().await.insert(
        job_id,
        Job {
            status: JobStatus::Queued,
            csv_path: csv_path.clone(),
            upload_id: upload.id.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        },
    );

    state
        .queue_tx
        .send(QueuedScan { job_id, csv_path, upload_id: upload.id.clone() })
        .map_err(|err| EnqueueError::Internal(err.to_string()))?;

    info!("queued scan job {job_id} for upload {}", upload.id);
    Ok(job_id)
}

/// Dedicated queue consumer. A global scan mutex keeps CSV processing
/// strictly sequential even if the queue ever grows another producer.
pub async fn run_queue_worker(
    engine: Arc<ScanEngine>,
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
    mut queue_rx: mpsc::UnboundedReceiver<QueuedScan>,
) {
    let scan_mutex = Mutex::new(());

    while let Some(scan) = queue_rx.recv().await {
        let QueuedScan { job_id, csv_path, upload_id } = scan;
        info!("starting scan job {job_id} ({})", csv_path.display());

        set_job(&jobs, job_id, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        })
        .await;
        update_upload(&engine, &upload_id, UploadStatus::Running, &job_id, None);

        let result = {
            let _guard = scan_mutex.lock().await;
            match engine.check_dependencies().await {
                Ok(()) => engine.process_csv(&csv_path).await,
                Err(err) => Err(err),
            }
        };

        match result {
            Ok(()) => {
                set_job(&jobs, job_id, |job| {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(Utc::now());
                })
                .await;
                update_upload(&engine, &upload_id, UploadStatus::Completed, &job_id, None);
                info!("scan job {job_id} completed");
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!("scan job {job_id} failed: {message}");
                set_job(&jobs, job_id, |job| {
                    job.status = JobStatus::Error;
                    job.completed_at = Some(Utc::now());
                    job.error = Some(message.clone());
                })
                .await;
                update_upload(&engine, &upload_id, UploadStatus::Error, &job_id, Some(&message));
            }
        }
    }
}

async fn set_job(
    jobs: &RwLock<HashMap<Uuid, Job>>,
    job_id: Uuid,
    update: impl FnOnce(&mut Job),
) {
    if let Some(job) = jobs.write().await.get_mut(&job_id) {
        update(job);
    }
}

fn update_upload(
    engine: &ScanEngine,
    upload_id: &str,
    status: UploadStatus,
    job_id: &Uuid,
    error: Option<&str>,
) {
    if let Err(err) = engine.checkpoint().update_upload_status(
        upload_id,
        status,
        Some(&job_id.to_string()),
        error,
    ) {
        error!("failed to update upload {upload_id}: {err}");
    }
}
