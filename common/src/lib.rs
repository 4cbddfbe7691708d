//! Shared building blocks of the `rpull` batch transfer tool.
//!
//! - [`run_config`]: the per-run JSON configuration
//! - [`error`]: the error taxonomy of a transfer run
//! - [`progress`]: run-wide counters and the final [`Summary`]
//! - [`validate`]: size check of a downloaded file
//! - [`commit`]: replication of a downloaded file into the destination and backup directories
//!
//! [`run`] wraps an async entry point with a tokio runtime and the tracing setup shared by all
//! binaries.

use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub mod commit;
pub mod config;
pub mod error;
pub mod progress;
pub mod run_config;
pub mod validate;

pub use config::{OutputConfig, RuntimeConfig, TracingConfig};
pub use error::{CommitTarget, TransferError};
pub use progress::{Progress, Summary};
pub use run_config::{Backoff, ProtocolMode, RunConfig};

/// Name of the run log for `date`: `<prefix>_<YYYYMMDD>.txt`.
pub fn log_file_name(prefix: &std::path::Path, date: chrono::NaiveDate) -> std::path::PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("_{}.txt", date.format("%Y%m%d")));
    std::path::PathBuf::from(name)
}

fn open_log_file(prefix: &std::path::Path) -> anyhow::Result<(std::path::PathBuf, std::fs::File)> {
    use anyhow::Context;
    let path = log_file_name(prefix, chrono::Local::now().date_naive());
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("could not create log directory {parent:?}"))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("could not open log file {path:?}"))?;
    Ok((path, file))
}

fn stdout_filter(output: &OutputConfig) -> EnvFilter {
    if output.quiet {
        return EnvFilter::new("off");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    })
}

fn setup_tracing(output: &OutputConfig, tracing: &TracingConfig) -> anyhow::Result<()> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(output.verbose >= 2)
        .with_file(output.verbose >= 3)
        .with_line_number(output.verbose >= 3)
        .with_filter(stdout_filter(output));
    let file_layer = match &tracing.log_file {
        Some(prefix) => {
            let (path, file) = open_log_file(prefix)?;
            let level = if output.verbose >= 2 {
                tracing::level_filters::LevelFilter::DEBUG
            } else {
                tracing::level_filters::LevelFilter::INFO
            };
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_filter(level);
            Some((path, layer))
        }
        None => None,
    };
    let (log_path, file_layer) = match file_layer {
        Some((path, layer)) => (Some(path), Some(layer)),
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|error| anyhow::anyhow!("could not install tracing subscriber: {error}"))?;
    if let Some(path) = log_path {
        tracing::info!("logging to {:?}", path);
    }
    Ok(())
}

/// Runs `func` on a fresh multi-threaded tokio runtime with logging configured.
///
/// Returns `None` when setup fails or `func` returns an error; the error is printed unless
/// `output.quiet` is set. The summary of a successful run is printed when `print_summary` is
/// set or any verbosity was requested.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    if let Err(error) = setup_tracing(&output, &tracing) {
        if !output.quiet {
            eprintln!("{error:#}");
        }
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("could not start tokio runtime: {error}");
            }
            return None;
        }
    };
    let res = tokio_runtime.block_on(func());
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
