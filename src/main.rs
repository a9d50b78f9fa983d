//! CLI entry point for kdownload.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use futures_util::future::join_all;
use kdownload_core::download::default_download_root;
use kdownload_core::download::filename::filename_from_url;
use kdownload_core::{
    DEFAULT_MAX_RETRIES, DownloadRequest, EngineConfig, FsStorage, HttpClient, ProgressEvent,
    RetryPolicy, SessionRegistry,
};
use tracing::{debug, error, info, warn};
use url::Url;

mod app_config;
mod cli;
mod progress_manager;

use app_config::FileConfig;
use cli::Args;
use progress_manager::ProgressBars;

/// Spreads retries of concurrent downloads that failed together.
const RETRY_JITTER: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    init_tracing(&args);
    debug!(?args, "CLI arguments parsed");

    let loaded = app_config::load_config(args.config.as_deref())?;
    if let Some(path) = &loaded.path {
        debug!(path = %path.display(), "config path resolved");
    }
    let settings = Settings::resolve(&args, &loaded.config);
    debug!(?settings, "effective settings");

    let urls = read_urls(&args)?;
    if urls.is_empty() {
        info!("No input provided. Pass URLs as arguments or pipe them via stdin.");
        info!("Example: echo 'https://example.com/file.pdf' | kdownload");
        return Ok(());
    }
    if args.name.is_some() && urls.len() > 1 {
        bail!("--name can only be used with a single URL ({} given)", urls.len());
    }

    let transport =
        HttpClient::try_new(settings.engine.connect_timeout, settings.engine.read_timeout)?;
    let registry = SessionRegistry::with_config(
        Arc::new(transport),
        Arc::new(FsStorage::new(&settings.download_dir)),
        settings.engine.clone(),
    );

    let show_progress = !args.no_progress && !args.quiet && io::stderr().is_terminal();
    let bars = Arc::new(ProgressBars::new(show_progress));
    let observer = Arc::clone(&bars);
    let _subscription = registry
        .publisher()
        .subscribe_all(move |event: &ProgressEvent| observer.update(event));

    spawn_interrupt_handler(registry.clone());

    let mut pending = Vec::new();
    let mut failed = 0usize;
    for url in &urls {
        let request = build_request(url, &args, settings.allow_duplicate);
        let key = request.key();
        bars.register(&key, &request.destination_file_name);
        match registry.submit(request) {
            Ok(handle) => pending.push((url.as_str(), handle)),
            Err(e) => {
                bars.remove(&key);
                error!(url = %url, error = %e, "Download rejected");
                failed += 1;
            }
        }
    }

    let outcomes = join_all(pending.iter().map(|(_, handle)| handle.wait())).await;
    bars.clear();

    let mut completed = 0usize;
    let mut cancelled = 0usize;
    for ((url, _), outcome) in pending.iter().zip(outcomes) {
        match outcome {
            Ok(path) => {
                completed += 1;
                info!(url = %url, path = %path.display(), "Downloaded");
            }
            Err(e) if e.is_cancelled() => {
                cancelled += 1;
                warn!(url = %url, "Cancelled; partial file kept for resume");
            }
            Err(e) => {
                failed += 1;
                error!(url = %url, error = %e, "Download failed");
            }
        }
    }

    info!(
        completed,
        failed,
        cancelled,
        total = urls.len(),
        "Download run finished"
    );

    if failed > 0 {
        bail!("{failed} of {} downloads failed", urls.len());
    }
    if cancelled > 0 {
        bail!("{cancelled} of {} downloads cancelled", urls.len());
    }
    Ok(())
}

/// Priority: `RUST_LOG` env var > quiet flag > verbose flag > default (info).
fn init_tracing(args: &Args) {
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// CLI flags layered over the config file over built-in defaults.
#[derive(Debug, Clone)]
struct Settings {
    download_dir: PathBuf,
    allow_duplicate: bool,
    engine: EngineConfig,
}

impl Settings {
    fn resolve(args: &Args, file: &FileConfig) -> Self {
        let defaults = EngineConfig::default();
        let max_retries = args
            .max_retries
            .or(file.max_retries)
            .map_or(DEFAULT_MAX_RETRIES, u32::from);

        let engine = EngineConfig::default()
            .with_retry_policy(
                RetryPolicy::with_max_retries(max_retries).with_jitter(RETRY_JITTER),
            )
            .with_timeouts(
                file.connect_timeout_secs
                    .map_or(defaults.connect_timeout, Duration::from_secs),
                file.read_timeout_secs
                    .map_or(defaults.read_timeout, Duration::from_secs),
            )
            .with_progress_interval(
                file.progress_interval_ms
                    .map_or(defaults.progress_interval, Duration::from_millis),
            );

        Self {
            download_dir: file
                .download_dir
                .clone()
                .unwrap_or_else(default_download_root),
            allow_duplicate: args.allow_duplicate || file.allow_duplicate.unwrap_or(false),
            engine,
        }
    }
}

/// URLs from the arguments, else one per line from piped stdin.
fn read_urls(args: &Args) -> Result<Vec<String>> {
    let raw = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        String::new()
    };

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn build_request(url: &str, args: &Args, allow_duplicate: bool) -> DownloadRequest {
    let name = args.name.clone().unwrap_or_else(|| {
        Url::parse(url)
            .map(|parsed| filename_from_url(&parsed))
            .unwrap_or_default()
    });
    DownloadRequest::new(url, args.folder.as_str(), name)
        .with_headers(args.headers.iter().cloned())
        .allow_duplicate(allow_duplicate)
}

fn spawn_interrupt_handler(registry: SessionRegistry) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling downloads (partial files are kept)");
            registry.cancel_all();
        }
    });
}
