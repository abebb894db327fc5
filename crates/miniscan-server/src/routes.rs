//! HTTP surface: batch upload, scan enqueueing, and status endpoints.

use std::collections::BTreeMap;
use std::path::Path;

use axum::extract::multipart::Multipart;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use miniscan_core::checkpoint::{RepoSummary, UploadRecord, UploadStatus};
use miniscan_core::input::{self, RepoCommitCount};

use crate::jobs::{self, EnqueueError};
use crate::state::{AppState, Job};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/upload", post(upload_csv))
        .route("/api/uploads", get(list_uploads))
        .route("/api/uploads/{id}/scan", post(scan_upload))
        .route("/api/uploads/scan_all_pending", post(scan_all_pending))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/repos", get(repo_overview))
        .with_state(state)
}

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError::Internal(err.into())
    }
}

#[derive(Debug, Serialize)]
struct UploadedFile {
    upload_id: String,
    filename: String,
    saved_path: String,
    total_commits: u64,
    repos: Vec<RepoCommitCount>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    uploads: Vec<UploadedFile>,
}

/// Accept one or more CSV files, persist each under the uploads directory,
/// and record a summary row per file.
async fn upload_csv(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let mut uploads = Vec::new();
    let mut index = 0usize;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let filename = sanitize_filename(field.file_name());
        if !filename.to_ascii_lowercase().ends_with(".csv") {
            return Err(ApiError::BadRequest("please upload CSV files".to_string()));
        }

        index += 1;
        let destination = state.uploads_dir.join(format!("{stamp}-{index}-{filename}"));
        let mut file = tokio::fs::File::create(&destination).await?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| ApiError::BadRequest(err.to_string()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let summary_path = destination.clone();
        let summary = tokio::task::spawn_blocking(move || input::summarize_csv(&summary_path))
            .await
            .map_err(anyhow::Error::from)??;

        let upload_id = Uuid::new_v4().to_string();
        let record = UploadRecord {
            id: upload_id.clone(),
            filename: filename.clone(),
            saved_path: destination.to_string_lossy().into_owned(),
            status: UploadStatus::Uploaded,
            total_commits: summary.total_commits as i64,
            repo_summary: summary.repos.clone(),
            job_id: None,
            error: None,
            uploaded_at: Utc::now().timestamp(),
        };
        state.engine.checkpoint().upsert_upload(&record)?;
        info!("stored upload {upload_id} ({filename}, {} commits)", summary.total_commits);

        uploads.push(UploadedFile {
            upload_id,
            filename,
            saved_path: record.saved_path,
            total_commits: summary.total_commits,
            repos: summary.repos,
        });
    }

    if uploads.is_empty() {
        return Err(ApiError::BadRequest("no files in upload".to_string()));
    }
    Ok(Json(UploadResponse { uploads }))
}

async fn list_uploads(State(state): State<AppState>) -> Json<Vec<UploadRecord>> {
    Json(state.engine.checkpoint().get_uploads())
}

#[derive(Debug, Serialize)]
struct ScanStarted {
    upload_id: String,
    job_id: Uuid,
}

async fn scan_upload(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<ScanStarted>, ApiError> {
    let upload = state
        .engine
        .checkpoint()
        .get_upload(&id)
        .ok_or_else(|| ApiError::NotFound(format!("upload {id} not found")))?;

    let job_id = jobs::enqueue_scan(&state, &upload).await.map_err(|err| match err {
        EnqueueError::NotEligible(_) => ApiError::Conflict(err.to_string()),
        EnqueueError::Internal(_) => ApiError::Internal(anyhow::anyhow!(err)),
    })?;
    Ok(Json(ScanStarted { upload_id: upload.id, job_id }))
}

/// Queue every upload still sitting in `uploaded`.
async fn scan_all_pending(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScanStarted>>, ApiError> {
    let mut started = Vec::new();
    for upload in state.engine.checkpoint().get_uploads() {
        if upload.status != UploadStatus::Uploaded {
            continue;
        }
        match jobs::enqueue_scan(&state, &upload).await {
            Ok(job_id) => started.push(ScanStarted { upload_id: upload.id, job_id }),
            Err(EnqueueError::NotEligible(_)) => {}
            Err(err @ EnqueueError::Internal(_)) => {
                return Err(ApiError::Internal(anyhow::anyhow!(err)));
            }
        }
    }
    Ok(Json(started))
}

async fn list_jobs(State(state): State<AppState>) -> Json<BTreeMap<Uuid, Job>> {
    let jobs = state.jobs.read().await;
    Json(jobs.iter().map(|(id, job)| (*id, job.clone())).collect())
}

async fn get_job(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let jobs = state.jobs.read().await;
    jobs.get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))
}

#[derive(Debug, Serialize)]
struct RepoOverview {
    stats: BTreeMap<String, i64>,
    repos: Vec<RepoSummary>,
}

async fn repo_overview(State(state): State<AppState>) -> Json<RepoOverview> {
    let checkpoint = state.engine.checkpoint();
    Json(RepoOverview { stats: checkpoint.get_stats(), repos: checkpoint.get_repo_summary() })
}

fn sanitize_filename(raw: Option<&str>) -> String {
    raw.and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "upload.csv".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_stripped_to_their_basename() {
        assert_eq!(sanitize_filename(Some("batch.csv")), "batch.csv");
        assert_eq!(sanitize_filename(Some("../../etc/passwd.csv")), "passwd.csv");
        assert_eq!(sanitize_filename(Some("dir/inner.csv")), "inner.csv");
        assert_eq!(sanitize_filename(None), "upload.csv");
        assert_eq!(sanitize_filename(Some("")), "upload.csv");
    }
}
