//! Normalisation of input CSV rows into scan jobs.
//!
//! Rows come in two shapes: an explicit `repo_url` or a `gh_project_name`
//! that we turn into a forge URL, and the commit under either `commit_sha`
//! or `git_trigger_commit`. Unknown columns are ignored.

use std::collections::BTreeMap;
use std::path::Path;

use csv::StringRecord;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A fully-normalised scan job parsed from one CSV row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub repo_url: String,
    pub repo_name: String,
    /// `owner/repo` when the URL points at a known forge host.
    pub repo_slug: Option<String>,
    pub commit_sha: String,
    pub project_key: String,
}

/// Column positions resolved once per file from the header row.
#[derive(Debug, Clone, Default)]
pub struct CsvColumns {
    repo_url: Option<usize>,
    gh_project_name: Option<usize>,
    commit_sha: Option<usize>,
    git_trigger_commit: Option<usize>,
    project_key: Option<usize>,
}

impl CsvColumns {
    pub fn from_headers(headers: &StringRecord) -> Self {
        let mut cols = Self::default();
        for (idx, name) in headers.iter().enumerate() {
            match name.trim() {
                "repo_url" => cols.repo_url = Some(idx),
                "gh_project_name" => cols.gh_project_name = Some(idx),
                "commit_sha" => cols.commit_sha = Some(idx),
                "git_trigger_commit" => cols.git_trigger_commit = Some(idx),
                "project_key" => cols.project_key = Some(idx),
                _ => {}
            }
        }
        cols
    }

    fn field<'a>(&self, record: &'a StringRecord, idx: Option<usize>) -> Option<&'a str> {
        idx.and_then(|i| record.get(i)).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Resolve the repository URL of a row, synthesising one from
    /// `gh_project_name` when needed.
    pub fn repo_url(&self, record: &StringRecord) -> Option<String> {
        if let Some(url) = self.field(record, self.repo_url) {
            return Some(url.to_string());
        }
        self.field(record, self.gh_project_name)
            .map(|name| format!("https://github.com/{name}.git"))
    }

    /// Normalise one record into a `JobSpec`, or `None` (with a warning) when
    /// the repository or commit is missing. Skipped rows mutate no state.
    pub fn job_spec(&self, record: &StringRecord) -> Option<JobSpec> {
        let repo_url = self.repo_url(record);
        let commit_sha = self
            .field(record, self.git_trigger_commit)
            .or_else(|| self.field(record, self.commit_sha))
            .map(str::to_string);

        let (Some(repo_url), Some(commit_sha)) = (repo_url, commit_sha) else {
            warn!("skipping row, missing repo_url or commit_sha: {record:?}");
            return None;
        };

        let repo_slug = github_slug(&repo_url);
        let mut repo_name = repo_name_from_url(&repo_url);
        let mut owner = None;
        if let Some(slug) = &repo_slug {
            if let Some((o, r)) = slug.split_once('/') {
                owner = Some(o.to_string());
                repo_name = r.to_string();
            }
        }

        let project_key = match self.field(record, self.project_key) {
            Some(key) => key.to_string(),
            None => match &owner {
                Some(owner) => format!("{owner}_{repo_name}_{commit_sha}"),
                None => format!("{repo_name}_{commit_sha}"),
            },
        };

        Some(JobSpec { repo_url, repo_name, repo_slug, commit_sha, project_key })
    }
}

/// Last URL path component with a trailing `.git` stripped.
pub fn repo_name_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".git")
        .to_string()
}

/// `owner/repo` for github.com URLs; `None` for other hosts.
pub fn github_slug(url: &str) -> Option<String> {
    let rest = url.split("github.com/").nth(1)?;
    let rest = rest.trim_end_matches('/').trim_end_matches(".git");
    let mut parts = rest.split('/');
    let owner = parts.next().filter(|p| !p.is_empty())?;
    let repo = parts.next().filter(|p| !p.is_empty())?;
    Some(format!("{owner}/{repo}"))
}

/// One repository's commit count inside an uploaded batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoCommitCount {
    pub repo: String,
    pub commit_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CsvSummary {
    pub total_commits: u64,
    pub repos: Vec<RepoCommitCount>,
}

/// Stream an uploaded CSV and count commits per repository.
pub fn summarize_csv(path: &Path) -> Result<CsvSummary, csv::Error> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let cols = CsvColumns::from_headers(&reader.headers()?.clone());

    let mut total = 0u64;
    let mut per_repo: BTreeMap<String, u64> = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let Some(url) = cols.repo_url(&record) else { continue };
        total += 1;
        *per_repo.entry(repo_name_from_url(&url)).or_default() += 1;
    }

    Ok(CsvSummary {
        total_commits: total,
        repos: per_repo
            .into_iter()
            .map(|(repo, commit_count)| RepoCommitCount { repo, commit_count })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[&str]) -> StringRecord {
        StringRecord::from(fields.to_vec())
    }

    #[test]
    fn explicit_url_and_sha() {
        let cols = CsvColumns::from_headers(&record(&["repo_url", "commit_sha"]));
        let spec = cols
            .job_spec(&record(&["https://github.com/acme/widget.git", "abc123"]))
            .unwrap();
        assert_eq!(spec.repo_name, "widget");
        assert_eq!(spec.repo_slug.as_deref(), Some("acme/widget"));
        assert_eq!(spec.project_key, "acme_widget_abc123");
    }

    #[test]
    fn gh_project_name_synthesises_url() {
        let cols = CsvColumns::from_headers(&record(&["gh_project_name", "git_trigger_commit"]));
        let spec = cols.job_spec(&record(&["acme/widget", "fffe"])).unwrap();
        assert_eq!(spec.repo_url, "https://github.com/acme/widget.git");
        assert_eq!(spec.commit_sha, "fffe");
    }

    #[test]
    fn git_trigger_commit_wins_over_commit_sha() {
        let cols = CsvColumns::from_headers(&record(&[
            "repo_url",
            "commit_sha",
            "git_trigger_commit",
        ]));
        let spec = cols
            .job_spec(&record(&["https://x/y.git", "aaa", "bbb"]))
            .unwrap();
        assert_eq!(spec.commit_sha, "bbb");
    }

    #[test]
    fn missing_fields_skip_the_row() {
        let cols = CsvColumns::from_headers(&record(&["repo_url", "commit_sha", "noise"]));
        assert!(cols.job_spec(&record(&["", "abc", "x"])).is_none());
        assert!(cols.job_spec(&record(&["https://x/y.git", "", "x"])).is_none());
    }

    #[test]
    fn non_forge_urls_get_plain_project_keys() {
        let cols = CsvColumns::from_headers(&record(&["repo_url", "commit_sha"]));
        let spec = cols
            .job_spec(&record(&["https://git.example.org/widget.git", "abc"]))
            .unwrap();
        assert_eq!(spec.repo_slug, None);
        assert_eq!(spec.project_key, "widget_abc");
    }

    #[test]
    fn explicit_project_key_is_kept() {
        let cols = CsvColumns::from_headers(&record(&["repo_url", "commit_sha", "project_key"]));
        let spec = cols
            .job_spec(&record(&["https://github.com/a/b.git", "abc", "custom-key"]))
            .unwrap();
        assert_eq!(spec.project_key, "custom-key");
    }

    #[test]
    fn unknown_columns_are_ignored() {
        let cols = CsvColumns::from_headers(&record(&["id", "repo_url", "branch", "commit_sha"]));
        let spec = cols
            .job_spec(&record(&["1", "https://github.com/a/b.git", "main", "abc"]))
            .unwrap();
        assert_eq!(spec.commit_sha, "abc");
    }

    #[test]
    fn summarize_counts_per_repo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(
            &path,
            "repo_url,commit_sha\n\
             https://github.com/a/one.git,s1\n\
             https://github.com/a/one.git,s2\n\
             https://github.com/b/two.git,s3\n\
             ,missing\n",
        )
        .unwrap();

        let summary = summarize_csv(&path).unwrap();
        assert_eq!(summary.total_commits, 3);
        assert_eq!(summary.repos.len(), 2);
        assert_eq!(summary.repos[0], RepoCommitCount { repo: "one".into(), commit_count: 2 });
        assert_eq!(summary.repos[1], RepoCommitCount { repo: "two".into(), commit_count: 1 });
    }
}
