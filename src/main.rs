//! CLI entry point for the download manager.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use download_manager::{
    DownloadManager, ManagerConfig, RetryPolicy, TransferOptions, TransferRecord, TransferStatus,
};
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
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
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    if (args.checksum.is_some() || args.output_name.is_some()) && args.urls.len() != 1 {
        bail!("--checksum and --output-name require exactly one URL");
    }

    let config = build_config(&args);
    let manager = Arc::new(
        DownloadManager::new(config)
            .await
            .context("failed to start download manager")?,
    );

    if args.list {
        print_records(&manager.list().await);
        manager.shutdown().await;
        return Ok(());
    }

    if args.resume {
        for record in manager.list().await {
            if matches!(
                record.status,
                TransferStatus::Paused | TransferStatus::Failed
            ) {
                match manager.resume(&record.id).await {
                    Ok(()) => info!(id = %record.id, url = %record.url, "resuming transfer"),
                    Err(error) => warn!(id = %record.id, %error, "could not resume transfer"),
                }
            }
        }
    }

    let options = build_options(&args);
    for url in &args.urls {
        let destination = args
            .output_name
            .as_ref()
            .map(|name| manager.config().download_dir.join(name));
        let id = manager
            .add(url, destination, options.clone())
            .await
            .with_context(|| format!("failed to add {url}"))?;
        debug!(id = %id, url = %url, "transfer queued");
    }

    if manager.list().await.is_empty() {
        info!("Nothing to download. Pass URLs as arguments or use --resume.");
        manager.shutdown().await;
        return Ok(());
    }

    let (progress_handle, progress_stop) =
        progress::spawn_progress_ui(!args.quiet && !args.no_progress, Arc::clone(&manager));

    let interrupted = tokio::select! {
        () = manager.wait_until_settled() => false,
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                warn!(%error, "failed to listen for Ctrl-C");
            }
            true
        }
    };

    progress_stop.cancel();
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    if interrupted {
        info!("Interrupted, pausing active transfers");
    }
    manager.shutdown().await;

    let stats = manager.statistics().await;
    info!(
        completed = stats.completed,
        failed = stats.failed,
        paused = stats.paused,
        cancelled = stats.cancelled,
        downloaded_bytes = stats.downloaded_bytes,
        "Download run finished"
    );
    if !args.quiet {
        eprintln!("{stats}");
    }

    for record in manager.list().await {
        if record.status == TransferStatus::Failed {
            warn!(
                id = %record.id,
                url = %record.url,
                error = record.last_error.as_deref().unwrap_or("unknown error"),
                "transfer failed"
            );
        }
    }

    if stats.failed > 0 {
        bail!("{} transfer(s) failed", stats.failed);
    }
    Ok(())
}

fn build_config(args: &Args) -> ManagerConfig {
    let mut config = ManagerConfig::new(&args.dir)
        .with_max_concurrent_downloads(usize::from(args.concurrency))
        .with_max_retries(u32::from(args.max_retries))
        .with_retry_sweep_interval(Duration::from_secs(args.sweep_interval))
        .with_chunk_size(usize::try_from(args.chunk_size).unwrap_or(usize::MAX))
        .with_timeout_secs(args.timeout);
    if args.exponential_backoff {
        config = config.with_retry_policy(RetryPolicy::default_exponential());
    }
    if let Some(state) = &args.state {
        config = config.with_state_path(state);
    }
    config
}

fn build_options(args: &Args) -> TransferOptions {
    let mut options = TransferOptions::default();
    for (name, value) in &args.headers {
        options = options.with_header(name, value);
    }
    if let Some(checksum) = &args.checksum {
        options = options.with_checksum(checksum.clone());
    }
    options
}

fn print_records(records: &[TransferRecord]) {
    if records.is_empty() {
        println!("No transfers recorded.");
        return;
    }
    for record in records {
        let progress = record
            .progress()
            .map_or_else(|| "?".to_string(), |p| format!("{:.0}%", p * 100.0));
        println!(
            "{}  {:<11}  {:>5}  {}  -> {}",
            record.id,
            record.status.as_str(),
            progress,
            record.url,
            record.destination_path.display()
        );
        if let Some(error) = &record.last_error {
            println!("    last error: {error}");
        }
    }
}
