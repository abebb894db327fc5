use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "miniscan", version, about = "Batch static-analysis scan pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan every commit listed in a CSV batch.
    Scan(ScanArgs),
    /// Export per-project metric values from the analysis server.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Input CSV; defaults to INPUT_CSV from the environment.
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Clear leftover PENDING rows before scanning, for a fresh start.
    /// Without this flag interrupted commits resume where they left off.
    #[arg(long, default_value_t = false)]
    pub reset_pending: bool,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Analysis server URL, e.g. http://localhost:9000.
    #[arg(long, env = "SONAR_HOST_URL", default_value = "http://localhost:9000")]
    pub sonar_host: String,

    /// User token (preferred); sent as a bearer credential.
    #[arg(long, env = "SONAR_TOKEN")]
    pub token: Option<String>,

    /// Alternative credential as 'user:pass' or 'token:'.
    #[arg(long)]
    pub auth: Option<String>,

    /// Explicit project keys.
    #[arg(long = "project-keys", value_name = "KEY", num_args = 0..)]
    pub project_keys: Vec<String>,

    /// File of project keys, one per line or CSV (first column).
    #[arg(long)]
    pub project_keys_file: Option<PathBuf>,

    /// Crawl every project from the server instead of passing keys.
    #[arg(long, default_value_t = false)]
    pub all_projects: bool,

    /// Component qualifier when crawling.
    #[arg(long, default_value = "TRK")]
    pub qualifier: String,

    /// Directory for the CSV/JSONL/progress outputs.
    #[arg(long, default_value = "results")]
    pub output_dir: PathBuf,

    /// Number of metrics per API call.
    #[arg(long, default_value_t = 50)]
    pub chunk_size: usize,

    /// Max concurrently exported projects.
    #[arg(long, default_value_t = 8)]
    pub max_workers: usize,

    /// Delay between metric chunk calls, in seconds.
    #[arg(long, default_value_t = 0.05)]
    pub per_chunk_delay: f64,

    /// Skip projects already listed in the progress file.
    #[arg(long, default_value_t = false)]
    pub resume: bool,

    /// Also append one JSON object per project for auditing.
    #[arg(long, default_value_t = false)]
    pub jsonl: bool,

    /// HTTP retries for transient failures.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Retry backoff factor in seconds.
    #[arg(long, default_value_t = 0.5)]
    pub backoff: f64,

    /// Export every metric the server reports instead of the built-in list.
    #[arg(long, default_value_t = false)]
    pub all_metrics: bool,
}
