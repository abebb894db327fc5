//! On-disk repository mirrors and disposable per-job worktrees.
//!
//! Layout under the work directory: `repos/<repo>` holds the canonical clone
//! shared across jobs, `temp/<project_key>` holds one detached worktree per
//! job, `locks/<repo>.lock` serialises every git-writing operation for that
//! repo both across threads (async mutex map) and across processes (advisory
//! file lock).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::forge::ForgeClient;
use crate::replay::{self, ReplayError};

#[derive(Debug, thiserror::Error)]
pub enum GitspaceError {
    #[error("git {command} failed ({code}): {output}")]
    Git { command: String, code: i32, output: String },
    #[error("repository mirror {0} has not been prepared")]
    MirrorMissing(String),
    #[error("commit {0} not found and cannot be reconstructed")]
    CommitNotReconstructable(String),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("workspace i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Gitspace {
    repos_dir: PathBuf,
    temp_dir: PathBuf,
    locks_dir: PathBuf,
    repo_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of a git-writing critical section. Dropping releases
/// the in-process mutex and the advisory file lock.
struct RepoLockGuard {
    _task: tokio::sync::OwnedMutexGuard<()>,
    file: std::fs::File,
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl Gitspace {
    pub fn new(work_dir: &Path) -> std::io::Result<Self> {
        let repos_dir = work_dir.join("repos");
        let temp_dir = work_dir.join("temp");
        let locks_dir = work_dir.join("locks");
        for dir in [&repos_dir, &temp_dir, &locks_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { repos_dir, temp_dir, locks_dir, repo_locks: Mutex::new(HashMap::new()) })
    }

    pub fn repo_path(&self, repo_name: &str) -> PathBuf {
        self.repos_dir.join(repo_name)
    }

    pub fn workspace_path(&self, project_key: &str) -> PathBuf {
        self.temp_dir.join(project_key)
    }

    async fn lock_repo(&self, repo_name: &str) -> Result<RepoLockGuard, GitspaceError> {
        let task_mutex = {
            let mut map = self.repo_locks.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(repo_name.to_string()).or_default().clone()
        };
        let task = task_mutex.lock_owned().await;
        let file = lock_file(self.locks_dir.join(format!("{repo_name}.lock"))).await?;
        Ok(RepoLockGuard { _task: task, file })
    }

    /// Ensure the canonical clone of a repository exists, cloning on first
    /// sight and otherwise refreshing it best-effort.
    pub async fn ensure_repo(&self, repo_url: &str, repo_name: &str) -> Result<PathBuf, GitspaceError> {
        let repo_path = self.repo_path(repo_name);
        let _lock = self.lock_repo(repo_name).await?;

        if !repo_path.exists() {
            info!("cloning {repo_url} to {}", repo_path.display());
            run_git(
                &["clone", repo_url, &repo_path.to_string_lossy()],
                &self.repos_dir,
                false,
            )
            .await?;
        } else if let Err(err) = run_git(&["fetch", "--all"], &repo_path, true).await {
            warn!("fetch of {repo_name} failed (continuing with stale mirror): {err}");
        }
        Ok(repo_path)
    }

    /// Create a detached worktree of the mirror for one job. Any stale tree
    /// left behind under the same project key is removed first.
    pub async fn prepare_workspace(
        &self,
        repo_name: &str,
        project_key: &str,
    ) -> Result<PathBuf, GitspaceError> {
        let mirror = self.repo_path(repo_name);
        if !mirror.exists() {
            return Err(GitspaceError::MirrorMissing(repo_name.to_string()));
        }
        let workspace = self.workspace_path(project_key);

        let _lock = self.lock_repo(repo_name).await?;
        if workspace.exists() {
            let _ = run_git(
                &["worktree", "remove", &workspace.to_string_lossy(), "--force"],
                &mirror,
                true,
            )
            .await;
            let _ = std::fs::remove_dir_all(&workspace);
        }
        run_git(
            &["worktree", "add", "--detach", &workspace.to_string_lossy(), "HEAD"],
            &mirror,
            false,
        )
        .await?;
        Ok(workspace)
    }

    pub async fn commit_exists(repo_path: &Path, sha: &str) -> bool {
        run_git(&["cat-file", "-e", &format!("{sha}^{{commit}}")], repo_path, false)
            .await
            .is_ok()
    }

    /// Put the workspace at the requested commit, falling back to a forge
    /// replay when the commit is absent from the mirror.
    pub async fn checkout_commit(
        &self,
        workspace: &Path,
        commit_sha: &str,
        repo_slug: Option<&str>,
        forge: Option<&ForgeClient>,
    ) -> Result<(), GitspaceError> {
        info!("checking out commit {commit_sha} in {}", workspace.display());

        if Self::commit_exists(workspace, commit_sha).await {
            match checkout_and_clean(workspace, commit_sha).await {
                Ok(()) => return Ok(()),
                Err(err) => warn!("standard checkout failed for {commit_sha}: {err}"),
            }
        }

        if let (Some(forge), Some(slug)) = (forge, repo_slug) {
            info!("commit {commit_sha} missing locally, attempting replay from the forge");
            let plan = replay::build_replay_plan(forge, slug, commit_sha, |sha| async move {
                Self::commit_exists(workspace, &sha).await
            })
            .await?;

            checkout_and_clean(workspace, &plan.base_sha).await?;
            replay::apply_replay_plan(workspace, &plan).await?;
            info!("successfully replayed commit {commit_sha}");
            return Ok(());
        }

        Err(GitspaceError::CommitNotReconstructable(commit_sha.to_string()))
    }

    /// Remove a job's worktree and its registration in the mirror.
    /// Idempotent; failures are logged.
    pub async fn cleanup_workspace(&self, repo_name: &str, workspace: &Path) {
        let mirror = self.repo_path(repo_name);
        match self.lock_repo(repo_name).await {
            Ok(_lock) => {
                if let Err(err) = run_git(
                    &["worktree", "remove", &workspace.to_string_lossy(), "--force"],
                    &mirror,
                    true,
                )
                .await
                {
                    warn!("failed to unregister worktree {}: {err}", workspace.display());
                }
            }
            Err(err) => warn!("failed to lock {repo_name} for cleanup: {err}"),
        }
        if workspace.exists() {
            if let Err(err) = std::fs::remove_dir_all(workspace) {
                warn!("failed to delete workspace {}: {err}", workspace.display());
            }
        }
    }

    /// Remove leftover worktrees and prune git bookkeeping from previous
    /// runs. A startup file lock keeps concurrent processes from racing here.
    pub async fn cleanup_stale_worktrees(&self) -> Result<(), GitspaceError> {
        let _startup = lock_file(self.locks_dir.join("startup.lock")).await?;

        if let Ok(entries) = std::fs::read_dir(&self.temp_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let removed = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                if let Err(err) = removed {
                    warn!("failed to clean temp entry {}: {err}", path.display());
                }
            }
        }

        let Ok(entries) = std::fs::read_dir(&self.repos_dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let repo_dir = entry.path();
            if !repo_dir.is_dir() || !repo_dir.join(".git").exists() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.lock_repo(&name).await {
                Ok(_lock) => {
                    let _ = run_git(&["worktree", "prune"], &repo_dir, true).await;
                }
                Err(err) => warn!("failed to prune worktrees for {name}: {err}"),
            }
        }
        Ok(())
    }
}

async fn checkout_and_clean(workspace: &Path, sha: &str) -> Result<(), GitspaceError> {
    run_git(&["checkout", "-f", sha], workspace, false).await?;
    run_git(&["clean", "-fdx"], workspace, false).await?;
    Ok(())
}

/// Single choke point for git subprocesses. With `allow_fail` the combined
/// output is returned even on a non-zero exit.
pub(crate) async fn run_git(
    args: &[&str],
    cwd: &Path,
    allow_fail: bool,
) -> Result<String, GitspaceError> {
    debug!("git {}", args.join(" "));
    let output = Command::new("git").args(args).current_dir(cwd).output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if allow_fail {
        return Ok(stdout + &stderr);
    }
    error!("git {} failed: {stderr}", args.join(" "));
    Err(GitspaceError::Git {
        command: args.join(" "),
        code: output.status.code().unwrap_or(-1),
        output: stdout + &stderr,
    })
}

/// Take an exclusive advisory lock, blocking off the async runtime.
async fn lock_file(path: PathBuf) -> Result<std::fs::File, GitspaceError> {
    let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
        let file = std::fs::OpenOptions::new().create(true).write(true).open(&path)?;
        fs2::FileExt::lock_exclusive(&file)?;
        Ok(file)
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(file)
}
