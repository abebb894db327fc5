mod cli;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use miniscan_core::config::Config;
use miniscan_engine::export::{ExportOptions, run_export};
use miniscan_engine::sonar::SonarAuth;
use miniscan_engine::ScanEngine;

use crate::cli::{Cli, Command, ExportArgs, ScanArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Scan(args) => scan(args).await,
        Command::Export(args) => export(args).await,
    }
}

async fn scan(args: ScanArgs) -> anyhow::Result<()> {
    let config = Config::from_env();
    let input = args.input.unwrap_or_else(|| config.input_csv.clone());

    let engine = Arc::new(ScanEngine::new(config)?);
    engine.startup().await?;
    engine.check_dependencies().await?;
    if args.reset_pending {
        engine.checkpoint().reset_pending_jobs()?;
    }

    shutdown::spawn_ctrl_c_handler(Arc::clone(&engine));
    engine.process_csv(&input).await
}

async fn export(args: ExportArgs) -> anyhow::Result<()> {
    let auth = match (&args.token, &args.auth) {
        (Some(token), _) if !token.is_empty() => SonarAuth::token(token.as_str()),
        (_, Some(auth)) => SonarAuth::parse_basic(auth).ok_or_else(|| {
            anyhow::anyhow!("--auth must be formatted as 'user:pass' or 'token:'")
        })?,
        _ => anyhow::bail!("provide --token or --auth formatted as 'user:pass' or 'token:'"),
    };

    run_export(ExportOptions {
        sonar_host: args.sonar_host,
        auth,
        project_keys: args.project_keys,
        project_keys_file: args.project_keys_file,
        all_projects: args.all_projects,
        qualifier: args.qualifier,
        output_dir: args.output_dir,
        chunk_size: args.chunk_size,
        max_workers: args.max_workers,
        per_chunk_delay: Duration::from_secs_f64(args.per_chunk_delay.max(0.0)),
        resume: args.resume,
        jsonl: args.jsonl,
        retries: args.retries,
        backoff: args.backoff,
        all_metrics: args.all_metrics,
    })
    .await?;
    Ok(())
}
