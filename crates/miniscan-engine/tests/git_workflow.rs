//! Workspace-manager behaviour against real git repositories.

use std::path::{Path, PathBuf};
use std::process::Command;

use miniscan_engine::gitspace::Gitspace;
use miniscan_engine::replay::{ReplayCommit, ReplayPlan, apply_replay_plan};

fn git(repo: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .env("GIT_AUTHOR_NAME", "tester")
        .env("GIT_AUTHOR_EMAIL", "tester@example.com")
        .env("GIT_COMMITTER_NAME", "tester")
        .env("GIT_COMMITTER_EMAIL", "tester@example.com")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A throwaway origin repository with a couple of commits.
fn seed_origin(dir: &Path) -> (PathBuf, String, String) {
    let origin = dir.join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    git(&origin, &["init", "--initial-branch=main"]);

    std::fs::write(origin.join("lib.rs"), "pub fn one() -> u32 { 1 }\n").unwrap();
    git(&origin, &["add", "."]);
    git(&origin, &["commit", "-m", "first"]);
    let first = git(&origin, &["rev-parse", "HEAD"]);

    std::fs::write(origin.join("lib.rs"), "pub fn one() -> u32 { 2 }\n").unwrap();
    git(&origin, &["add", "."]);
    git(&origin, &["commit", "-m", "second"]);
    let second = git(&origin, &["rev-parse", "HEAD"]);

    (origin, first, second)
}

#[tokio::test]
async fn mirror_workspace_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, first, second) = seed_origin(dir.path());

    let gitspace = Gitspace::new(&dir.path().join("work")).unwrap();
    let mirror = gitspace
        .ensure_repo(&origin.to_string_lossy(), "origin")
        .await
        .unwrap();
    assert!(mirror.join(".git").exists());

    // Re-ensuring is a fetch, not a re-clone.
    gitspace
        .ensure_repo(&origin.to_string_lossy(), "origin")
        .await
        .unwrap();

    let workspace = gitspace.prepare_workspace("origin", "proj_key").await.unwrap();
    assert!(workspace.join("lib.rs").exists());

    gitspace.checkout_commit(&workspace, &first, None, None).await.unwrap();
    let content = std::fs::read_to_string(workspace.join("lib.rs")).unwrap();
    assert!(content.contains("{ 1 }"));

    gitspace.checkout_commit(&workspace, &second, None, None).await.unwrap();
    let content = std::fs::read_to_string(workspace.join("lib.rs")).unwrap();
    assert!(content.contains("{ 2 }"));

    // Untracked files are cleaned by the checkout.
    std::fs::write(workspace.join("scratch.tmp"), "junk").unwrap();
    gitspace.checkout_commit(&workspace, &first, None, None).await.unwrap();
    assert!(!workspace.join("scratch.tmp").exists());

    gitspace.cleanup_workspace("origin", &workspace).await;
    assert!(!workspace.exists());
    let worktrees = git(&mirror, &["worktree", "list"]);
    assert!(!worktrees.contains("proj_key"), "stale worktree entry: {worktrees}");
}

#[tokio::test]
async fn unknown_commit_without_forge_is_not_reconstructable() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, _, _) = seed_origin(dir.path());

    let gitspace = Gitspace::new(&dir.path().join("work")).unwrap();
    gitspace.ensure_repo(&origin.to_string_lossy(), "origin").await.unwrap();
    let workspace = gitspace.prepare_workspace("origin", "proj_key").await.unwrap();

    let missing = "0123456789abcdef0123456789abcdef01234567";
    let err = gitspace
        .checkout_commit(&workspace, missing, None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot be reconstructed"));
}

#[tokio::test]
async fn stale_worktrees_are_cleared_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, _, _) = seed_origin(dir.path());

    let gitspace = Gitspace::new(&dir.path().join("work")).unwrap();
    gitspace.ensure_repo(&origin.to_string_lossy(), "origin").await.unwrap();
    let workspace = gitspace.prepare_workspace("origin", "leftover").await.unwrap();
    assert!(workspace.exists());

    // Simulate a crashed process: the worktree is still on disk and still
    // registered when the next run starts.
    gitspace.cleanup_stale_worktrees().await.unwrap();
    assert!(!workspace.exists());

    let mirror = gitspace.repo_path("origin");
    let worktrees = git(&mirror, &["worktree", "list"]);
    assert!(!worktrees.contains("leftover"), "stale worktree entry: {worktrees}");
}

#[tokio::test]
async fn replay_plan_reproduces_the_target_tree() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, first, second) = seed_origin(dir.path());

    // The patch that turns `first` into `second`, as the forge would
    // render it.
    let patch = git(&origin, &[
        "format-patch",
        "--stdout",
        &format!("{first}..{second}"),
    ]);

    let gitspace = Gitspace::new(&dir.path().join("work")).unwrap();
    gitspace.ensure_repo(&origin.to_string_lossy(), "origin").await.unwrap();
    let workspace = gitspace.prepare_workspace("origin", "replayed").await.unwrap();

    gitspace.checkout_commit(&workspace, &first, None, None).await.unwrap();
    let plan = ReplayPlan {
        base_sha: first,
        commits: vec![
            ReplayCommit { sha: second.clone(), patch, message: "second".into() },
            // Empty patches are skipped silently.
            ReplayCommit { sha: "empty".into(), patch: String::new(), message: String::new() },
        ],
    };
    apply_replay_plan(&workspace, &plan).await.unwrap();

    let content = std::fs::read_to_string(workspace.join("lib.rs")).unwrap();
    assert!(content.contains("{ 2 }"), "replayed tree should match the target commit");

    // The working tree now diffs clean against the real target.
    let diff = git(&workspace, &["diff", &second, "--", "lib.rs"]);
    assert!(diff.is_empty(), "unexpected diff after replay: {diff}");
}

#[tokio::test]
async fn broken_patches_fail_with_apply_output() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, first, _) = seed_origin(dir.path());

    let gitspace = Gitspace::new(&dir.path().join("work")).unwrap();
    gitspace.ensure_repo(&origin.to_string_lossy(), "origin").await.unwrap();
    let workspace = gitspace.prepare_workspace("origin", "broken").await.unwrap();
    gitspace.checkout_commit(&workspace, &first, None, None).await.unwrap();

    let plan = ReplayPlan {
        base_sha: first,
        commits: vec![ReplayCommit {
            sha: "deadbeef".into(),
            patch: "--- a/missing.rs\n+++ b/missing.rs\n@@ -1 +1 @@\n-x\n+y\n".into(),
            message: String::new(),
        }],
    };
    let err = apply_replay_plan(&workspace, &plan).await.unwrap_err();
    assert!(err.to_string().contains("deadbeef"));
}
