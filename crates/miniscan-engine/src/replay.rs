//! Reconstruction of commits that are absent from the local mirror.
//!
//! Typical cause: the commit lived on a pull-request branch that was deleted
//! or force-pushed. We walk single-parent ancestors through the forge API
//! until one is present locally, collect each commit's patch on the way, and
//! replay the patches onto that ancestor.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::forge::{CommitInfo, ForgeClient, ForgeError};

pub const MAX_REPLAY_DEPTH: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("cannot reconstruct commit {sha}: {reason}")]
    MissingForkCommit { sha: String, reason: String },
    #[error("commit {0} already exists locally, replay is unnecessary")]
    AlreadyPresent(String),
    /// Rate-limit exhaustion passes through untranslated so the caller can
    /// surface the retry time.
    #[error(transparent)]
    Forge(ForgeError),
    #[error("replay i/o: {0}")]
    Io(#[from] std::io::Error),
}

fn missing(sha: &str, reason: impl Into<String>) -> ReplayError {
    ReplayError::MissingForkCommit { sha: sha.to_string(), reason: reason.into() }
}

#[derive(Debug, Clone)]
pub struct ReplayCommit {
    pub sha: String,
    pub patch: String,
    pub message: String,
}

/// Ordered patches plus a base commit that already exists locally. Consumed
/// exactly once to rebuild the target tree.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    pub base_sha: String,
    pub commits: Vec<ReplayCommit>,
}

/// Commit metadata and patch lookups needed by the planner. Implemented by
/// `ForgeClient`; tests substitute an in-memory history.
pub trait CommitSource {
    fn commit(
        &self,
        repo_slug: &str,
        sha: &str,
    ) -> impl Future<Output = Result<CommitInfo, ForgeError>> + Send;
    fn commit_patch(
        &self,
        repo_slug: &str,
        sha: &str,
    ) -> impl Future<Output = Result<String, ForgeError>> + Send;
}

impl CommitSource for ForgeClient {
    async fn commit(&self, repo_slug: &str, sha: &str) -> Result<CommitInfo, ForgeError> {
        self.get_commit(repo_slug, sha).await
    }

    async fn commit_patch(&self, repo_slug: &str, sha: &str) -> Result<String, ForgeError> {
        self.get_commit_patch(repo_slug, sha).await
    }
}

/// Walk ancestors of `target_sha` until `commit_exists` reports one locally,
/// accumulating patches. Merges and roots cannot be replayed through a linear
/// patch chain, and the walk gives up past `MAX_REPLAY_DEPTH` ancestors.
pub async fn build_replay_plan<S, F, Fut>(
    source: &S,
    repo_slug: &str,
    target_sha: &str,
    commit_exists: F,
) -> Result<ReplayPlan, ReplayError>
where
    S: CommitSource,
    F: Fn(String) -> Fut,
    Fut: Future<Output = bool>,
{
    if commit_exists(target_sha.to_string()).await {
        return Err(ReplayError::AlreadyPresent(target_sha.to_string()));
    }

    let mut collected: Vec<ReplayCommit> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut current = target_sha.to_string();
    let mut depth = 0usize;

    loop {
        depth += 1;
        if depth > MAX_REPLAY_DEPTH {
            return Err(missing(
                target_sha,
                format!(
                    "Exceeded parent traversal limit ({MAX_REPLAY_DEPTH}) before finding a \
                     reachable ancestor"
                ),
            ));
        }

        let payload = source
            .commit(repo_slug, &current)
            .await
            .map_err(|err| forge_failure(&current, "load commit", err))?;
        if payload.parents.len() != 1 {
            return Err(missing(&current, "Cannot replay commit with zero or multiple parents"));
        }

        let patch = source
            .commit_patch(repo_slug, &current)
            .await
            .map_err(|err| forge_failure(&current, "download patch", err))?;
        collected.push(ReplayCommit {
            sha: current.clone(),
            patch,
            message: payload.commit.message.clone(),
        });

        let parent_sha = payload.parents[0].sha.clone();
        if parent_sha.is_empty() {
            return Err(missing(&current, "Commit metadata missing parent SHA"));
        }
        if commit_exists(parent_sha.clone()).await {
            collected.reverse();
            info!(
                "replaying {} fork commits onto ancestor {} to reconstruct {}",
                collected.len(),
                parent_sha,
                target_sha
            );
            return Ok(ReplayPlan { base_sha: parent_sha, commits: collected });
        }
        if visited.contains(&parent_sha) {
            return Err(missing(
                &current,
                "Detected a parent traversal loop while searching for a reachable ancestor",
            ));
        }
        visited.insert(current);
        current = parent_sha;
    }
}

fn forge_failure(sha: &str, action: &str, err: ForgeError) -> ReplayError {
    match err {
        ForgeError::AllTokensRateLimited { .. } => ReplayError::Forge(err),
        other => missing(sha, format!("Failed to {action} for commit {sha}: {other}")),
    }
}

/// Apply the plan's patches in order inside a workspace already checked out
/// at the plan base. Empty patches are skipped.
pub async fn apply_replay_plan(workspace: &Path, plan: &ReplayPlan) -> Result<(), ReplayError> {
    for commit in &plan.commits {
        if commit.patch.trim().is_empty() {
            debug!("commit {} patch is empty, skipping", commit.sha);
            continue;
        }
        info!("applying fork-only patch {}", commit.sha);
        apply_patch(workspace, &commit.sha, &commit.patch).await?;
    }
    Ok(())
}

async fn apply_patch(workspace: &Path, sha: &str, patch: &str) -> Result<(), ReplayError> {
    let mut child = Command::new("git")
        .args(["apply", "--allow-empty", "--whitespace=nowarn"])
        .current_dir(workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(patch.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(missing(
            sha,
            format!("Failed to apply patch for commit {sha}: {combined}"),
        ));
    }
    Ok(())
}
