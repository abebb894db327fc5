//! Invocation of the external analysis scanner, plus the optional wait for
//! the server's background ingestion of the uploaded report.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::sonar::SonarClient;

const TERMINAL_CE_STATES: [&str; 3] = ["SUCCESS", "FAILED", "CANCELED"];

pub struct ScannerDriver {
    bin: String,
    host_url: String,
    token: String,
    exclusions: String,
    wait_for_ce: bool,
    ce_timeout: Duration,
    ce_poll: Duration,
    sonar: SonarClient,
}

impl ScannerDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bin: String,
        host_url: String,
        token: String,
        exclusions: String,
        wait_for_ce: bool,
        ce_timeout: Duration,
        ce_poll: Duration,
        sonar: SonarClient,
    ) -> Self {
        Self { bin, host_url, token, exclusions, wait_for_ce, ce_timeout, ce_poll, sonar }
    }

    /// Run the scanner against a prepared workspace. Returns true iff the
    /// subprocess exits 0; the ingestion wait never changes the outcome.
    pub async fn run_scan(&self, workspace: &Path, project_key: &str, commit_sha: &str) -> bool {
        info!("starting scan for {project_key} at {commit_sha}");

        let mut args = vec![
            format!("-Dsonar.projectKey={project_key}"),
            format!("-Dsonar.projectName={project_key}"),
            format!("-Dsonar.projectVersion={commit_sha}"),
            "-Dsonar.sources=.".to_string(),
            format!("-Dsonar.host.url={}", self.host_url),
            format!("-Dsonar.token={}", self.token),
            "-Dsonar.scm.disabled=true".to_string(),
        ];
        if !self.exclusions.trim().is_empty() {
            args.push(format!("-Dsonar.exclusions={}", self.exclusions));
        }

        let output = match Command::new(&self.bin).args(&args).current_dir(workspace).output().await
        {
            Ok(output) => output,
            Err(err) => {
                error!("failed to launch scanner {:?}: {err}", self.bin);
                return false;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "scan failed for {project_key} (exit {:?}): {}",
                output.status.code(),
                stderr.trim_end()
            );
            return false;
        }

        info!("scan completed successfully for {project_key}");
        if self.wait_for_ce {
            self.wait_for_compute_engine(project_key).await;
        }
        true
    }

    /// Poll the compute engine until ingestion of this project finishes, so
    /// later exports see complete measures. Timeouts and auth problems only
    /// warn.
    pub async fn wait_for_compute_engine(&self, project_key: &str) {
        let deadline = Instant::now() + self.ce_timeout;

        while Instant::now() < deadline {
            match self.sonar.ce_activity(project_key).await {
                Ok(activity) => {
                    let queue_len = activity.queue.len();
                    match activity.current {
                        None if queue_len == 0 => {
                            info!("compute engine done for {project_key}");
                            return;
                        }
                        Some(task)
                            if task
                                .status
                                .as_deref()
                                .is_some_and(|s| TERMINAL_CE_STATES.contains(&s)) =>
                        {
                            info!(
                                "compute engine task {} for {project_key} finished with {}",
                                task.id.as_deref().unwrap_or("?"),
                                task.status.as_deref().unwrap_or("?")
                            );
                            return;
                        }
                        current => {
                            info!(
                                "waiting for compute engine tasks of {project_key} \
                                 (in queue: {queue_len}, status: {})",
                                current
                                    .as_ref()
                                    .and_then(|t| t.status.as_deref())
                                    .unwrap_or("none")
                            );
                        }
                    }
                }
                Err(err) if err.status() == Some(401) => {
                    warn!("unauthorized to query compute engine status, skipping wait");
                    return;
                }
                Err(err) => warn!("error polling compute engine for {project_key}: {err}"),
            }
            tokio::time::sleep(self.ce_poll).await;
        }

        warn!("timed out waiting for compute engine tasks of {project_key}");
    }

    /// Verify the tools this driver shells out to. A missing git is fatal;
    /// a missing scanner only warns so the server can still accept uploads.
    pub async fn check_dependencies(&self) -> anyhow::Result<()> {
        if Command::new("git").arg("--version").output().await.is_err() {
            anyhow::bail!("git is not installed or not on PATH");
        }
        if Command::new(&self.bin).arg("--version").output().await.is_err() {
            warn!(
                "scanner binary {:?} not found on PATH; scans will fail until it is installed",
                self.bin
            );
        }
        Ok(())
    }
}
