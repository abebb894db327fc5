//! Offline metrics exporter: pulls per-project measure values from the
//! analysis server with a bounded worker pool and streams them to CSV (and
//! optionally JSONL), flushing after every project so interrupted runs can
//! resume from the progress file.

use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::sonar::{Measure, SonarAuth, SonarClient, SonarError, value_text};

/// The metric keys exported by default; `--all-metrics` swaps in whatever the
/// server reports instead.
pub const ALL_METRIC_KEYS: &[&str] = &[
    "bugs",
    "reliability_issues",
    "reliability_rating",
    "software_quality_reliability_remediation_effort",
    "software_quality_reliability_issues",
    "reliability_remediation_effort",
    "software_quality_reliability_rating",
    "vulnerabilities",
    "security_issues",
    "security_rating",
    "security_hotspots",
    "software_quality_security_rating",
    "software_quality_security_issues",
    "software_quality_security_remediation_effort",
    "security_remediation_effort",
    "security_review_rating",
    "security_hotspots_to_review_status",
    "code_smells",
    "sqale_index",
    "sqale_debt_ratio",
    "sqale_rating",
    "maintainability_issues",
    "development_cost",
    "effort_to_reach_maintainability_rating_a",
    "software_quality_maintainability_debt_ratio",
    "software_quality_maintainability_remediation_effort",
    "software_quality_maintainability_rating",
    "effort_to_reach_software_quality_maintainability_rating_a",
    "coverage",
    "line_coverage",
    "lines_to_cover",
    "uncovered_lines",
    "duplicated_lines_density",
    "duplicated_lines",
    "duplicated_blocks",
    "duplicated_files",
    "cognitive_complexity",
    "complexity",
    "ncloc",
    "lines",
    "files",
    "classes",
    "functions",
    "statements",
    "ncloc_language_distribution",
    "comment_lines_density",
    "comment_lines",
    "alert_status",
    "quality_gate_details",
    "software_quality_blocker_issues",
    "critical_violations",
    "violations",
    "software_quality_high_issues",
    "info_violations",
    "software_quality_low_issues",
    "software_quality_maintainability_issues",
    "software_quality_info_issues",
    "minor_violations",
    "major_violations",
    "software_quality_medium_issues",
    "open_issues",
    "last_commit_date",
];

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub sonar_host: String,
    pub auth: SonarAuth,
    pub project_keys: Vec<String>,
    pub project_keys_file: Option<PathBuf>,
    pub all_projects: bool,
    pub qualifier: String,
    pub output_dir: PathBuf,
    pub chunk_size: usize,
    pub max_workers: usize,
    pub per_chunk_delay: Duration,
    pub resume: bool,
    pub jsonl: bool,
    pub retries: u32,
    pub backoff: f64,
    pub all_metrics: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub success: usize,
    pub failed: usize,
    pub skipped_pending: usize,
}

enum ProjectOutcome {
    Written,
    Pending,
    Failed,
}

struct Sinks {
    csv: Mutex<csv::Writer<std::fs::File>>,
    jsonl: Option<Mutex<std::fs::File>>,
    progress: Mutex<std::fs::File>,
}

pub async fn run_export(opts: ExportOptions) -> anyhow::Result<ExportSummary> {
    let client = Arc::new(SonarClient::new(&opts.sonar_host, opts.auth.clone())?);

    let mut project_keys = Vec::new();
    if opts.all_projects {
        info!("discovering projects via the analysis server");
        project_keys = client.search_projects(&opts.qualifier).await?;
        info!("found {} projects", project_keys.len());
    }
    project_keys.extend(opts.project_keys.iter().cloned());
    if let Some(path) = &opts.project_keys_file {
        let file = std::fs::File::open(path)?;
        project_keys.extend(read_key_file(std::io::BufReader::new(file))?);
    }
    dedup_preserving_order(&mut project_keys);

    if project_keys.is_empty() {
        anyhow::bail!("no project keys provided; pass keys, a key file, or --all-projects");
    }

    let metrics: Vec<String> = if opts.all_metrics {
        let discovered = client.search_metrics().await?;
        info!("using {} server-reported metrics", discovered.len());
        discovered
    } else {
        ALL_METRIC_KEYS.iter().map(|k| k.to_string()).collect()
    };

    std::fs::create_dir_all(&opts.output_dir)?;
    let csv_path = opts.output_dir.join("all_projects_measures.csv");
    let jsonl_path = opts.output_dir.join("all_projects_measures.jsonl");
    let progress_dir = opts.output_dir.join("progress");
    std::fs::create_dir_all(&progress_dir)?;
    let done_path = progress_dir.join("processed.txt");

    if opts.resume && done_path.exists() {
        let processed: HashSet<String> = std::fs::read_to_string(&done_path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let before = project_keys.len();
        project_keys.retain(|k| !processed.contains(k));
        info!("resume enabled: skipping {} already processed projects", before - project_keys.len());
    }

    let sinks = Arc::new(open_sinks(&csv_path, &jsonl_path, &done_path, &metrics, opts.jsonl)?);
    let metrics = Arc::new(metrics);

    let total = project_keys.len();
    info!("exporting {total} projects with up to {} workers", opts.max_workers);

    let semaphore = Arc::new(Semaphore::new(opts.max_workers.max(1)));
    let mut workers = JoinSet::new();
    for key in project_keys {
        let client = Arc::clone(&client);
        let metrics = Arc::clone(&metrics);
        let sinks = Arc::clone(&sinks);
        let semaphore = Arc::clone(&semaphore);
        let opts = opts.clone();
        workers.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return ProjectOutcome::Failed;
            };
            export_project(&client, &key, &metrics, &sinks, &opts).await
        });
    }

    let mut summary = ExportSummary::default();
    let mut done = 0usize;
    while let Some(joined) = workers.join_next().await {
        done += 1;
        match joined {
            Ok(ProjectOutcome::Written) => {
                summary.success += 1;
                if done % 25 == 0 || summary.success <= 5 {
                    info!("{}/{total} projects exported", summary.success);
                }
            }
            Ok(ProjectOutcome::Pending) => summary.skipped_pending += 1,
            Ok(ProjectOutcome::Failed) => summary.failed += 1,
            Err(err) => {
                error!("export worker panicked: {err}");
                summary.failed += 1;
            }
        }
    }

    info!(
        "export complete: success={}, failed={}, pending(skipped)={}",
        summary.success, summary.failed, summary.skipped_pending
    );
    info!("csv: {}", csv_path.display());
    if opts.jsonl {
        info!("jsonl: {}", jsonl_path.display());
    }
    Ok(summary)
}

async fn export_project(
    client: &SonarClient,
    key: &str,
    metrics: &[String],
    sinks: &Sinks,
    opts: &ExportOptions,
) -> ProjectOutcome {
    let measures =
        match fetch_all_measures(client, key, metrics, opts).await {
            Ok(measures) => measures,
            Err(err) => {
                error!("failed to export {key}: {err}");
                return ProjectOutcome::Failed;
            }
        };

    if is_project_pending(&measures) {
        return ProjectOutcome::Pending;
    }

    let row = measures_to_row(key, metrics, &measures);
    {
        let mut csv = sinks.csv.lock().await;
        if let Err(err) = csv.write_record(&row).and_then(|()| Ok(csv.flush()?)) {
            error!("failed to write CSV row for {key}: {err}");
            return ProjectOutcome::Failed;
        }
    }

    if let Some(jsonl) = &sinks.jsonl {
        let line = serde_json::json!({ "component": key, "measures": measures });
        let mut file = jsonl.lock().await;
        if let Err(err) = writeln!(file, "{line}") {
            error!("failed to write JSONL line for {key}: {err}");
            return ProjectOutcome::Failed;
        }
    }

    {
        let mut progress = sinks.progress.lock().await;
        if let Err(err) = writeln!(progress, "{key}") {
            warn!("failed to record progress for {key}: {err}");
        }
    }

    ProjectOutcome::Written
}

/// Fetch a project's measures in metric chunks, pausing politely between
/// chunk calls.
async fn fetch_all_measures(
    client: &SonarClient,
    key: &str,
    metrics: &[String],
    opts: &ExportOptions,
) -> Result<Vec<Measure>, SonarError> {
    let mut all = Vec::new();
    for chunk in metrics.chunks(opts.chunk_size.max(1)) {
        let measures = client
            .component_measures(key, chunk, opts.retries, opts.backoff)
            .await?;
        all.extend(measures);
        if !opts.per_chunk_delay.is_zero() {
            tokio::time::sleep(opts.per_chunk_delay).await;
        }
    }
    Ok(all)
}

fn open_sinks(
    csv_path: &Path,
    jsonl_path: &Path,
    done_path: &Path,
    metrics: &[String],
    jsonl: bool,
) -> anyhow::Result<Sinks> {
    let new_csv = !csv_path.exists();
    let csv_file = std::fs::OpenOptions::new().create(true).append(true).open(csv_path)?;
    let mut writer = csv::WriterBuilder::new().from_writer(csv_file);
    if new_csv {
        let mut header = vec!["repo".to_string(), "commit".to_string()];
        header.extend(metrics.iter().cloned());
        writer.write_record(&header)?;
        writer.flush()?;
    }

    let jsonl = if jsonl {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(jsonl_path)?;
        Some(Mutex::new(file))
    } else {
        None
    };
    let progress = std::fs::OpenOptions::new().create(true).append(true).open(done_path)?;

    Ok(Sinks { csv: Mutex::new(writer), jsonl, progress: Mutex::new(progress) })
}

/// A project with no non-empty measure value has not been ingested yet; it is
/// skipped rather than exported as an all-blank row.
pub fn is_project_pending(measures: &[Measure]) -> bool {
    !measures.iter().any(|measure| {
        measure
            .scalar()
            .map(value_text)
            .is_some_and(|text| !text.trim().is_empty())
    })
}

/// `repo, commit, metric…` fields in header order for one project.
pub fn measures_to_row(component_key: &str, metrics: &[String], measures: &[Measure]) -> Vec<String> {
    let (repo, commit) = parse_component_key(component_key);
    let mut row = Vec::with_capacity(metrics.len() + 2);
    row.push(repo);
    row.push(commit);
    for metric in metrics {
        let value = measures
            .iter()
            .find(|m| &m.metric == metric)
            .and_then(|m| m.scalar())
            .map(value_text)
            .unwrap_or_default();
        row.push(value);
    }
    row
}

/// Split `<repo>_<40-hex-sha>` into its parts; component keys may themselves
/// contain underscores, so scan for the SHA from the right.
pub fn parse_component_key(component_key: &str) -> (String, String) {
    let parts: Vec<&str> = component_key.split('_').collect();
    if parts.len() >= 2 {
        for idx in (0..parts.len()).rev() {
            let candidate = parts[idx];
            if candidate.len() == 40
                && candidate.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
            {
                return (parts[..idx].join("_"), candidate.to_string());
            }
        }
        return (parts[..parts.len() - 1].join("_"), parts[parts.len() - 1].to_string());
    }
    (component_key.to_string(), String::new())
}

/// One key per line; `#` comments skipped; CSV-ish lines take the first
/// field.
pub fn read_key_file(reader: impl BufRead) -> std::io::Result<Vec<String>> {
    let mut keys = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let key = trimmed.split(',').next().unwrap_or(trimmed).trim();
        if !key.is_empty() {
            keys.push(key.to_string());
        }
    }
    Ok(keys)
}

fn dedup_preserving_order(keys: &mut Vec<String>) {
    let mut seen = HashSet::new();
    keys.retain(|k| seen.insert(k.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measure(metric: &str, value: Option<&str>) -> Measure {
        serde_json::from_value(match value {
            Some(v) => serde_json::json!({"metric": metric, "value": v}),
            None => serde_json::json!({"metric": metric}),
        })
        .unwrap()
    }

    #[test]
    fn component_key_parsing_finds_the_sha() {
        let sha = "011983fcf1ed6a9b6890a8e646b36704c28ad391";
        assert_eq!(
            parse_component_key(&format!("19wu_19wu_{sha}")),
            ("19wu_19wu".to_string(), sha.to_string())
        );
        assert_eq!(
            parse_component_key("plain_key"),
            ("plain".to_string(), "key".to_string())
        );
        assert_eq!(parse_component_key("solo"), ("solo".to_string(), String::new()));
        // Uppercase hex is not a commit SHA.
        let upper = "011983FCF1ED6A9B6890A8E646B36704C28AD391";
        assert_eq!(parse_component_key(&format!("repo_{upper}")).1, upper);
    }

    #[test]
    fn pending_projects_have_no_usable_values() {
        assert!(is_project_pending(&[]));
        assert!(is_project_pending(&[measure("bugs", None)]));
        assert!(is_project_pending(&[measure("bugs", Some(" "))]));
        assert!(!is_project_pending(&[measure("bugs", Some("0"))]));

        let period_only: Measure = serde_json::from_value(serde_json::json!({
            "metric": "new_bugs", "periods": [{"value": "2"}]
        }))
        .unwrap();
        assert!(!is_project_pending(&[period_only]));
    }

    #[test]
    fn rows_follow_header_order_and_fill_gaps() {
        let metrics = vec!["bugs".to_string(), "coverage".to_string(), "ncloc".to_string()];
        let sha = "a".repeat(40);
        let row = measures_to_row(
            &format!("acme_widget_{sha}"),
            &metrics,
            &[measure("ncloc", Some("120")), measure("bugs", Some("3"))],
        );
        assert_eq!(row, vec!["acme_widget".to_string(), sha, "3".into(), "".into(), "120".into()]);
    }

    #[test]
    fn empty_metric_set_yields_repo_and_commit_only() {
        let sha = "b".repeat(40);
        let row = measures_to_row(&format!("x_{sha}"), &[], &[]);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn key_file_parsing() {
        let input = "# comment\n\nacme_widget_a\nrepo_b,extra,cols\n  spaced_c  \n";
        let keys = read_key_file(std::io::Cursor::new(input)).unwrap();
        assert_eq!(keys, vec!["acme_widget_a", "repo_b", "spaced_c"]);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut keys = vec!["a".to_string(), "b".to_string(), "a".to_string(), "c".to_string()];
        dedup_preserving_order(&mut keys);
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
