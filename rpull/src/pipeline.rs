use std::sync::Arc;

use anyhow::Context as _;
use common::{Progress, RunConfig, Summary, TransferError};
use remote::{Connector, FtpConnector, RetryPolicy, SessionPool};

use crate::worker;

/// Runs one batch against the FTP server described by `config`.
pub async fn run(config: RunConfig) -> anyhow::Result<Summary> {
    let connector = FtpConnector::from_config(&config)?;
    run_with(connector, config).await
}

async fn create_directories(config: &RunConfig) -> anyhow::Result<()> {
    for dir in [
        &config.staging_path,
        &config.destination_path,
        &config.backup_path,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create directory {dir:?}"))?;
    }
    Ok(())
}

/// Runs one batch: list, download with `max_parallel_downloads` workers, commit.
///
/// Per-file failures are counted into the returned summary. Only a failure to connect or to
/// list the remote directory is returned as an error, after every started task has finished.
#[tracing::instrument(skip_all, fields(server = %connector.describe()))]
pub async fn run_with<C: Connector>(connector: C, config: RunConfig) -> anyhow::Result<Summary> {
    let start = std::time::Instant::now();
    create_directories(&config).await?;
    let config = Arc::new(config);
    let server = connector.describe();
    let pool = SessionPool::connect(
        connector,
        RetryPolicy::from_config(&config),
        config.max_parallel_downloads,
    )
    .await
    .map_err(|source| TransferError::Connection { server, source })?;
    let progress = Arc::new(Progress::new());
    let commits = tokio_util::task::TaskTracker::new();
    let (queue_tx, queue_rx) = async_channel::bounded(config.max_batch_size.max(1));
    let ctx = worker::Context {
        pool: pool.clone(),
        config: config.clone(),
        progress: progress.clone(),
        commits: commits.clone(),
        commit_settings: common::commit::Settings {
            delay: config.commit_delay,
        },
    };
    let mut workers = tokio::task::JoinSet::new();
    for id in 1..=config.max_parallel_downloads {
        workers.spawn(worker::drain(id, queue_rx.clone(), ctx.clone()));
    }
    drop(queue_rx);
    drop(ctx);
    let listed = crate::lister::list(&pool, &config, &progress, queue_tx).await;
    while let Some(res) = workers.join_next().await {
        if let Err(error) = res {
            tracing::error!("download worker failed: {}", error);
        }
    }
    commits.close();
    commits.wait().await;
    pool.close().await;
    let summary = progress.summary();
    tracing::info!("run finished in {:.2?}", start.elapsed());
    listed?;
    Ok(summary)
}
