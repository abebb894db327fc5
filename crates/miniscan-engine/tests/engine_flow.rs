//! End-to-end batch flow against a local git origin and a stub scanner
//! binary that records its invocations.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use miniscan_core::checkpoint::{CheckpointStore, ClaimOutcome, CommitMeta};
use miniscan_core::config::Config;
use miniscan_engine::ScanEngine;

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

fn seed_origin(dir: &Path) -> (PathBuf, String) {
    let origin = dir.join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    git(&origin, &["init", "--initial-branch=main"]);
    std::fs::write(origin.join("app.py"), "print('hello')\n").unwrap();
    git(&origin, &["add", "."]);
    git(&origin, &["commit", "-m", "initial"]);
    let sha = git(&origin, &["rev-parse", "HEAD"]);
    (origin, sha)
}

/// A scanner stand-in that logs one line per invocation and exits with the
/// given code.
fn stub_scanner(dir: &Path, log: &Path, exit_code: i32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("stub-scanner");
    std::fs::write(
        &path,
        format!("#!/bin/sh\necho \"$@\" >> {}\nexit {exit_code}\n", log.display()),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(work_dir: &Path, scanner_bin: &Path) -> Config {
    Config {
        sonar_host_url: "http://127.0.0.1:9".to_string(),
        sonar_token: "stub-token".to_string(),
        work_dir: work_dir.to_path_buf(),
        scanner_bin: scanner_bin.to_string_lossy().into_owned(),
        sonar_exclusions: String::new(),
        github_tokens: Vec::new(),
        concurrent_scans: 2,
        batch_size: 2,
        checkpoint_file: work_dir.join("checkpoint.db"),
        input_csv: work_dir.join("unused.csv"),
        wait_for_ce: false,
        wait_for_ce_timeout: Duration::from_secs(1),
        wait_for_ce_poll: Duration::from_secs(1),
        auto_resume: false,
        auto_resume_error: false,
    }
}

fn scan_log_lines(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn happy_path_records_processed() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, sha) = seed_origin(dir.path());
    let log = dir.path().join("scans.log");
    let scanner = stub_scanner(dir.path(), &log, 0);

    let work = dir.path().join("work");
    let engine = Arc::new(ScanEngine::new(test_config(&work, &scanner)).unwrap());
    engine.startup().await.unwrap();

    let csv = dir.path().join("batch.csv");
    std::fs::write(
        &csv,
        format!("repo_url,commit_sha\n{},{sha}\n", origin.display()),
    )
    .unwrap();
    engine.process_csv(&csv).await.unwrap();

    let lines = scan_log_lines(&log);
    assert_eq!(lines.len(), 1, "expected exactly one scanner invocation");
    assert!(lines[0].contains(&format!("-Dsonar.projectKey=origin_{sha}")));
    assert!(lines[0].contains(&format!("-Dsonar.projectVersion={sha}")));
    assert!(lines[0].contains("-Dsonar.scm.disabled=true"));

    assert!(engine.checkpoint().is_processed(&sha));
    let stats = engine.checkpoint().get_stats();
    assert_eq!(stats.get("PROCESSED"), Some(&1));

    // The workspace is destroyed regardless of outcome.
    let leftovers: Vec<_> = std::fs::read_dir(work.join("temp")).unwrap().collect();
    assert!(leftovers.is_empty(), "temp workspaces must be cleaned up");
}

#[tokio::test]
async fn duplicate_shas_scan_once() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, sha) = seed_origin(dir.path());
    let log = dir.path().join("scans.log");
    let scanner = stub_scanner(dir.path(), &log, 0);

    let engine =
        Arc::new(ScanEngine::new(test_config(&dir.path().join("work"), &scanner)).unwrap());
    engine.startup().await.unwrap();

    let csv = dir.path().join("batch.csv");
    std::fs::write(
        &csv,
        format!(
            "repo_url,commit_sha\n{origin},{sha}\n{origin},{sha}\n,missing-url\n",
            origin = origin.display()
        ),
    )
    .unwrap();
    engine.process_csv(&csv).await.unwrap();

    assert_eq!(scan_log_lines(&log).len(), 1, "duplicate rows must not rescan");
    assert!(engine.checkpoint().is_processed(&sha));
    // The malformed row never reached the store.
    let stats = engine.checkpoint().get_stats();
    assert_eq!(stats.values().sum::<i64>(), 1);
}

#[tokio::test]
async fn second_run_skips_terminal_commits() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, sha) = seed_origin(dir.path());
    let log = dir.path().join("scans.log");
    let scanner = stub_scanner(dir.path(), &log, 0);

    let engine =
        Arc::new(ScanEngine::new(test_config(&dir.path().join("work"), &scanner)).unwrap());
    engine.startup().await.unwrap();

    let csv = dir.path().join("batch.csv");
    std::fs::write(&csv, format!("repo_url,commit_sha\n{},{sha}\n", origin.display())).unwrap();

    engine.process_csv(&csv).await.unwrap();
    engine.process_csv(&csv).await.unwrap();

    assert_eq!(
        scan_log_lines(&log).len(),
        1,
        "two runs over the same CSV must scan each SHA at most once"
    );
}

#[tokio::test]
async fn pending_rows_from_a_previous_run_are_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, sha) = seed_origin(dir.path());
    let log = dir.path().join("scans.log");
    let scanner = stub_scanner(dir.path(), &log, 0);
    let work = dir.path().join("work");

    // Simulate a crash: the previous process claimed the commit and died.
    {
        let store = CheckpointStore::open(&work.join("checkpoint.db")).unwrap();
        assert_eq!(
            store.try_claim_commit(&sha, CommitMeta::default()).unwrap(),
            ClaimOutcome::ClaimedNew
        );
    }

    let engine = Arc::new(ScanEngine::new(test_config(&work, &scanner)).unwrap());
    engine.startup().await.unwrap();

    let csv = dir.path().join("batch.csv");
    std::fs::write(&csv, format!("repo_url,commit_sha\n{},{sha}\n", origin.display())).unwrap();
    engine.process_csv(&csv).await.unwrap();

    assert_eq!(scan_log_lines(&log).len(), 1, "the survivor must be scanned");
    assert!(engine.checkpoint().is_processed(&sha));
}

#[tokio::test]
async fn scanner_failure_is_recorded_and_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, sha) = seed_origin(dir.path());
    let log = dir.path().join("scans.log");
    let scanner = stub_scanner(dir.path(), &log, 1);

    let engine =
        Arc::new(ScanEngine::new(test_config(&dir.path().join("work"), &scanner)).unwrap());
    engine.startup().await.unwrap();

    let csv = dir.path().join("batch.csv");
    std::fs::write(&csv, format!("repo_url,commit_sha\n{},{sha}\n", origin.display())).unwrap();
    engine.process_csv(&csv).await.unwrap();

    let stats = engine.checkpoint().get_stats();
    assert_eq!(stats.get("FAILED"), Some(&1));
    assert!(!engine.checkpoint().is_processed(&sha));

    // A rerun sees the terminal FAILED row and leaves it alone.
    engine.process_csv(&csv).await.unwrap();
    assert_eq!(scan_log_lines(&log).len(), 1);
}
