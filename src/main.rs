// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vodm::config::DEFAULT_WORKERS;
use vodm::downloader::RETRY_COUNT;
use vodm::input::parse_task_list;
use vodm::prelude::*;

/// Download VOD segments concurrently, resuming where a previous run stopped.
#[derive(Debug, Parser)]
#[command(name = "vodm", version)]
struct Args {
    /// Task list with one `<url> [target]` per line. Reads stdin when omitted or `-`.
    input: Option<PathBuf>,

    /// Directory targets are relative to.
    #[arg(short, long, default_value = ".", env = "VODM_OUTPUT_DIR")]
    output_dir: PathBuf,

    /// Number of workers for downloading concurrently.
    #[arg(short = 'w', long, default_value_t = DEFAULT_WORKERS, env = "VODM_MAX_WORKERS", value_parser = parse_workers)]
    max_workers: usize,

    /// Limit the aggregate download speed in bytes per second. Use 'k' and 'm' suffixes for KiB/s and MiB/s.
    #[arg(short, long, env = "VODM_RATE_LIMIT", value_parser = parse_rate_limit)]
    rate_limit: Option<u64>,

    /// Download targets again even if they already exist.
    #[arg(long)]
    overwrite: bool,

    /// Stop everything on the first failed download.
    #[arg(long)]
    fail_fast: bool,

    /// Attempts per file before giving up.
    #[arg(long, default_value_t = RETRY_COUNT)]
    retries: usize,

    /// Seconds without network activity before an attempt is abandoned.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Authorization token sent with every request.
    #[arg(long, env = "VODM_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Print the batch result as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Don't report progress.
    #[arg(long)]
    no_progress: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging to stderr.
    #[arg(long)]
    debug: bool,
}

fn parse_workers(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err("must be greater than 0".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn init_logging(args: &Args) {
    let default_filter = if args.debug {
        "vodm=debug"
    } else if args.verbose {
        "vodm=info"
    } else {
        "vodm=warn"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

async fn read_input(input: Option<&Path>) -> Result<String> {
    match input {
        Some(path) if path != Path::new("-") => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read task list {}", path.display())),
        _ => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("failed to read task list from stdin")?;
            Ok(text)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let text = read_input(args.input.as_deref()).await?;
    let pairs = parse_task_list(&text, &args.output_dir)?;
    if pairs.is_empty() {
        warn!("nothing to download");
        return Ok(());
    }

    // Targets' parent directories must exist before the batch starts.
    for (_, target) in &pairs {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let options = BatchOptions {
        workers: args.max_workers,
        allow_failures: !args.fail_fast,
        skip_existing: !args.overwrite,
        rate_limit: args.rate_limit,
        download: DownloadOptions {
            retries: args.retries,
            timeout: Duration::from_secs(args.timeout),
            auth_token: args.auth_token.clone(),
            ..Default::default()
        },
    };

    let tracker = Arc::new(DownloadProgress::new(Some(pairs.len())));
    let console = (!args.no_progress && std::io::stderr().is_terminal())
        .then(|| Arc::new(ConsoleProgress::new(tracker.clone())));
    let progress: Arc<dyn Progress> = match &console {
        Some(console) => console.clone(),
        None if args.no_progress => Arc::new(NullProgress),
        None => Arc::new(LogProgress),
    };

    info!(files = pairs.len(), workers = options.workers, "downloading");
    let manager = DownloadManager::new(options)?.with_progress(progress);
    let result = manager.download_all(pairs).await;

    if let Some(console) = &console {
        console.finish();
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    let skipped = result
        .results
        .iter()
        .filter(|r| matches!(r, TaskResult::Success { existing: true, .. }))
        .count();
    eprintln!(
        "Downloaded {} of {} files ({} already present, {} failed, {} canceled)",
        result.succeeded() - skipped,
        result.results.len(),
        skipped,
        result.failed(),
        result.canceled(),
    );

    if !result.ok {
        bail!("download aborted after a failed file");
    }
    if result.failed() > 0 {
        warn!(failed = result.failed(), "some files could not be downloaded, run again to retry them");
    }
    Ok(())
}
