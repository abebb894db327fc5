//! Submission surface for the scan pipeline: accepts CSV batches over HTTP,
//! queues them for the single scan worker, and reports progress.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{RwLock, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use miniscan_core::config::Config;
use miniscan_engine::ScanEngine;
use miniscan_server::state::AppState;
use miniscan_server::{jobs, routes};

#[derive(Debug, Parser)]
#[command(name = "miniscan-server", version, about = "Scan pipeline submission surface")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "MINISCAN_BIND", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let uploads_dir = config.uploads_dir();
    std::fs::create_dir_all(&uploads_dir)?;

    let auto_resume = config.auto_resume;
    let auto_resume_error = config.auto_resume_error;

    let engine = Arc::new(ScanEngine::new(config)?);
    engine.startup().await?;
    if let Err(err) = engine.check_dependencies().await {
        warn!("dependency check failed: {err:#}");
    }

    // Snapshot interrupted uploads before demoting them, so auto-resume can
    // re-queue exactly what was in flight when the process died.
    let resumable = engine.checkpoint().get_resumable_uploads(auto_resume_error);
    let demoted = engine.checkpoint().reset_upload_states()?;
    if demoted > 0 {
        info!("demoted {demoted} interrupted uploads back to 'uploaded'");
    }

    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let job_store = Arc::new(RwLock::new(HashMap::new()));
    let state = AppState {
        engine: Arc::clone(&engine),
        jobs: Arc::clone(&job_store),
        queue_tx,
        uploads_dir,
    };

    tokio::spawn(jobs::run_queue_worker(Arc::clone(&engine), job_store, queue_rx));

    if auto_resume && !resumable.is_empty() {
        info!("auto-resuming {} interrupted uploads", resumable.len());
        for upload in resumable {
            // Re-read after the demotion so the eligibility check sees the
            // current status.
            let Some(upload) = state.engine.checkpoint().get_upload(&upload.id) else {
                continue;
            };
            if let Err(err) = jobs::enqueue_scan(&state, &upload).await {
                error!("failed to auto-resume upload {}: {err}", upload.id);
            }
        }
    }

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    info!("listening on {}", cli.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
