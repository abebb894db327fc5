//! The batch scan engine: streams an input CSV in bounded batches, pre-warms
//! repository mirrors, and drains jobs through a bounded worker pool while
//! recording terminal state in the checkpoint store.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use csv::StringRecord;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use miniscan_core::checkpoint::{CheckpointStore, ClaimOutcome, CommitMeta};
use miniscan_core::config::Config;
use miniscan_core::input::{CsvColumns, JobSpec};

use crate::forge::ForgeClient;
use crate::gitspace::Gitspace;
use crate::scanner::ScannerDriver;
use crate::sonar::{SonarAuth, SonarClient};

/// Process-wide orchestration context. Built once at startup and shared by
/// reference; nothing in here is a global.
pub struct ScanEngine {
    cfg: Config,
    checkpoint: CheckpointStore,
    gitspace: Gitspace,
    forge: Option<ForgeClient>,
    scanner: ScannerDriver,
    stop_requested: AtomicBool,
    /// SHAs owned by a worker of this process right now. The durable claim
    /// protocol serialises across runs; this index serialises duplicates
    /// racing inside one run.
    active_shas: Mutex<HashSet<String>>,
}

impl ScanEngine {
    pub fn new(cfg: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&cfg.work_dir)?;
        let checkpoint = CheckpointStore::open(&cfg.checkpoint_file)?;
        let gitspace = Gitspace::new(&cfg.work_dir)?;

        let forge = if cfg.github_tokens.is_empty() {
            info!("no forge tokens configured; missing commits will not be replayed");
            None
        } else {
            Some(ForgeClient::new(cfg.github_tokens.clone())?)
        };

        let sonar =
            SonarClient::new(&cfg.sonar_host_url, SonarAuth::token(cfg.sonar_token.clone()))?;
        let scanner = ScannerDriver::new(
            cfg.scanner_bin.clone(),
            cfg.sonar_host_url.clone(),
            cfg.sonar_token.clone(),
            cfg.sonar_exclusions.clone(),
            cfg.wait_for_ce,
            cfg.wait_for_ce_timeout,
            cfg.wait_for_ce_poll,
            sonar,
        );

        Ok(Self {
            cfg,
            checkpoint,
            gitspace,
            forge,
            scanner,
            stop_requested: AtomicBool::new(false),
            active_shas: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Ask in-flight work to wind down: running jobs finish, queued rows are
    /// left PENDING and resumable.
    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("stop requested; finishing in-flight scans");
        }
    }

    pub fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// One-time startup pass: clear stale worktrees from previous runs.
    pub async fn startup(&self) -> anyhow::Result<()> {
        self.gitspace.cleanup_stale_worktrees().await?;
        Ok(())
    }

    pub async fn check_dependencies(&self) -> anyhow::Result<()> {
        self.scanner.check_dependencies().await
    }

    /// Drain a CSV of scan jobs. Rows are read in batches of `batch_size`;
    /// each batch's repositories are cloned or fetched sequentially before
    /// its jobs enter the shared worker pool.
    pub async fn process_csv(self: &Arc<Self>, csv_path: &Path) -> anyhow::Result<()> {
        info!(
            "processing {} in batches of {}",
            csv_path.display(),
            self.cfg.batch_size
        );

        let file = std::fs::File::open(csv_path)?;
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
        let cols = CsvColumns::from_headers(&reader.headers()?.clone());

        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrent_scans.max(1)));
        let mut workers = JoinSet::new();
        let batch_size = self.cfg.batch_size.max(1);

        let mut batch: Vec<StringRecord> = Vec::with_capacity(batch_size);
        let mut batch_idx = 0usize;
        for record in reader.records() {
            if self.stopping() {
                break;
            }
            match record {
                Ok(record) => batch.push(record),
                Err(err) => {
                    warn!("skipping malformed CSV record: {err}");
                    continue;
                }
            }
            if batch.len() == batch_size {
                batch_idx += 1;
                self.dispatch_batch(batch_idx, &cols, std::mem::take(&mut batch), &semaphore, &mut workers)
                    .await;
            }
        }
        if !batch.is_empty() && !self.stopping() {
            batch_idx += 1;
            self.dispatch_batch(batch_idx, &cols, batch, &semaphore, &mut workers).await;
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!("scan worker panicked: {err}");
            }
        }

        let stats = self.checkpoint.get_stats();
        info!("all batches completed; checkpoint stats: {stats:?}");
        Ok(())
    }

    async fn dispatch_batch(
        self: &Arc<Self>,
        batch_idx: usize,
        cols: &CsvColumns,
        records: Vec<StringRecord>,
        semaphore: &Arc<Semaphore>,
        workers: &mut JoinSet<()>,
    ) {
        info!("--- starting batch {batch_idx} ({} rows) ---", records.len());

        let specs: Vec<JobSpec> =
            records.iter().filter_map(|record| cols.job_spec(record)).collect();

        // One clone/fetch at a time per batch; concurrent clones of the same
        // repo would race on the mirror directory.
        let mut repos: BTreeMap<&str, &str> = BTreeMap::new();
        for spec in &specs {
            repos.insert(spec.repo_url.as_str(), spec.repo_name.as_str());
        }
        for (repo_url, repo_name) in repos {
            if self.stopping() {
                return;
            }
            if let Err(err) = self.gitspace.ensure_repo(repo_url, repo_name).await {
                error!("failed to prepare repo {repo_name} ({repo_url}): {err}");
            }
        }

        let scheduled = specs.len();
        for spec in specs {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(semaphore);
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                engine.process_single_job(spec).await;
            });
        }
        info!("--- scheduled batch {batch_idx} ({scheduled} jobs) ---");
    }

    async fn process_single_job(&self, spec: JobSpec) {
        if self.stopping() {
            return;
        }

        {
            let mut active = self.active_shas.lock().unwrap_or_else(|p| p.into_inner());
            if !active.insert(spec.commit_sha.clone()) {
                debug!("skipping {}: commit already in flight", spec.project_key);
                return;
            }
        }
        self.run_job(&spec).await;
        self.active_shas
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&spec.commit_sha);
    }

    /// Run one claimed job to a terminal state. Every failure path records
    /// FAILED against the SHA; nothing escapes to the scheduler.
    async fn run_job(&self, spec: &JobSpec) {
        let meta = CommitMeta {
            repo_name: Some(&spec.repo_name),
            project_key: Some(&spec.project_key),
            repo_url: Some(&spec.repo_url),
        };

        match self.checkpoint.try_claim_commit(&spec.commit_sha, meta) {
            Ok(ClaimOutcome::ClaimedNew) => {}
            Ok(ClaimOutcome::ResumedPending) => {
                info!("resuming pending commit {}", spec.commit_sha);
            }
            Ok(ClaimOutcome::AlreadyTerminal) => {
                debug!("skipping {} (already processed or failed)", spec.project_key);
                return;
            }
            Err(err) => {
                error!("failed to claim {}: {err}", spec.commit_sha);
                return;
            }
        }

        let workspace = match self
            .gitspace
            .prepare_workspace(&spec.repo_name, &spec.project_key)
            .await
        {
            Ok(path) => path,
            Err(err) => {
                error!("failed to prepare workspace for {}: {err}", spec.project_key);
                self.record_failure(spec, meta, &err.to_string());
                return;
            }
        };

        let outcome: anyhow::Result<bool> = async {
            self.gitspace
                .checkout_commit(
                    &workspace,
                    &spec.commit_sha,
                    spec.repo_slug.as_deref(),
                    self.forge.as_ref(),
                )
                .await?;
            Ok(self.scanner.run_scan(&workspace, &spec.project_key, &spec.commit_sha).await)
        }
        .await;

        match outcome {
            Ok(true) => {
                if let Err(err) = self.checkpoint.mark_processed(&spec.commit_sha, meta) {
                    error!("failed to record success for {}: {err}", spec.commit_sha);
                }
            }
            Ok(false) => self.record_failure(spec, meta, "Scanner command failed"),
            Err(err) => {
                error!("failed to process {}: {err:#}", spec.project_key);
                self.record_failure(spec, meta, &format!("{err:#}"));
            }
        }

        self.gitspace.cleanup_workspace(&spec.repo_name, &workspace).await;
    }

    fn record_failure(&self, spec: &JobSpec, meta: CommitMeta<'_>, message: &str) {
        if let Err(err) = self.checkpoint.mark_failed(&spec.commit_sha, message, meta) {
            error!("failed to record failure for {}: {err}", spec.commit_sha);
        }
    }
}
