use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Pipeline settings, resolved from the environment with working defaults.
///
/// Every knob can also be set per-invocation through the CLI; the server
/// binary reads the environment directly.
#[derive(Debug, Clone)]
pub struct Config {
    pub sonar_host_url: String,
    pub sonar_token: String,
    pub work_dir: PathBuf,
    pub scanner_bin: String,
    pub sonar_exclusions: String,
    pub github_tokens: Vec<String>,
    pub concurrent_scans: usize,
    pub batch_size: usize,
    pub checkpoint_file: PathBuf,
    pub input_csv: PathBuf,
    pub wait_for_ce: bool,
    pub wait_for_ce_timeout: Duration,
    pub wait_for_ce_poll: Duration,
    pub auto_resume: bool,
    pub auto_resume_error: bool,
}

pub const DEFAULT_EXCLUSIONS: &str =
    ".git/**,**/node_modules/**,**/build/**,**/dist/**,**/target/**,**/.gradle/**,**/.idea/**";

impl Config {
    pub fn from_env() -> Self {
        let work_dir = PathBuf::from(env_or("WORK_DIR", "work_dir"));
        let checkpoint_file = checkpoint_path(&work_dir);

        Self {
            sonar_host_url: env_or("SONAR_HOST_URL", "http://localhost:9000"),
            sonar_token: env_or("SONAR_TOKEN", "admin"),
            scanner_bin: env_or("SONAR_SCANNER_BIN", "sonar-scanner"),
            sonar_exclusions: env_or("SONAR_EXCLUSIONS", DEFAULT_EXCLUSIONS),
            github_tokens: split_tokens(&env_or("GITHUB_TOKENS", "")),
            concurrent_scans: env_parse("CONCURRENT_SCANS", 4),
            batch_size: env_parse("BATCH_SIZE", 50),
            input_csv: PathBuf::from(env_or("INPUT_CSV", "commits_to_scan.csv")),
            wait_for_ce: env_bool("WAIT_FOR_CE", true),
            wait_for_ce_timeout: Duration::from_secs(env_parse("WAIT_FOR_CE_TIMEOUT", 600)),
            wait_for_ce_poll: Duration::from_secs(env_parse("WAIT_FOR_CE_POLL", 5)),
            auto_resume: env_bool("AUTO_RESUME", true),
            auto_resume_error: env_bool("AUTO_RESUME_ERROR", false),
            work_dir,
            checkpoint_file,
        }
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.work_dir.join("repos")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.work_dir.join("uploads")
    }
}

fn checkpoint_path(work_dir: &Path) -> PathBuf {
    let raw = std::env::var("CHECKPOINT_FILE").ok();
    resolve_checkpoint(work_dir, raw.as_deref())
}

/// `CHECKPOINT_FILE` may be absolute; relative values resolve under the work
/// directory.
fn resolve_checkpoint(work_dir: &Path, raw: Option<&str>) -> PathBuf {
    match raw {
        Some(raw) if !raw.trim().is_empty() => {
            let p = PathBuf::from(raw);
            if p.is_absolute() { p } else { work_dir.join(p) }
        }
        _ => work_dir.join("scan_checkpoint.db"),
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

pub fn split_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
