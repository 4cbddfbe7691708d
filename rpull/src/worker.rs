use std::sync::Arc;

use anyhow::Context as _;
use common::{Progress, RunConfig, TransferError};
use remote::{Connector, RemoteEntry, Session, SessionPool};

/// Handles shared by every download worker of a run.
pub struct Context<C: Connector> {
    pub pool: Arc<SessionPool<C>>,
    pub config: Arc<RunConfig>,
    pub progress: Arc<Progress>,
    pub commits: tokio_util::task::TaskTracker,
    pub commit_settings: common::commit::Settings,
}

impl<C: Connector> Clone for Context<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            config: self.config.clone(),
            progress: self.progress.clone(),
            commits: self.commits.clone(),
            commit_settings: self.commit_settings,
        }
    }
}

/// A remote name is used as a local file name, so it must be a single path component.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0')
}

/// Processes entries from `queue` until it is closed and drained, returning the number of files
/// this worker downloaded.
pub async fn drain<C: Connector>(
    id: usize,
    queue: async_channel::Receiver<RemoteEntry>,
    ctx: Context<C>,
) -> usize {
    let mut downloaded = 0;
    while let Ok(entry) = queue.recv().await {
        match process(&ctx, &entry).await {
            Ok(()) => downloaded += 1,
            Err(error) => {
                ctx.progress.record_failure(&error);
                tracing::error!("{}", &error);
            }
        }
    }
    tracing::info!("worker {} finished, {} file(s) downloaded", id, downloaded);
    downloaded
}

async fn fetch<C: Connector>(
    ctx: &Context<C>,
    entry: &RemoteEntry,
    file: &mut tokio::fs::File,
) -> anyhow::Result<u64> {
    let remote_path = ctx.config.remote_file(&entry.name);
    let mut session = ctx.pool.checkout().await?;
    let bytes = session
        .session()?
        .retrieve(&remote_path, file)
        .await
        .with_context(|| format!("RETR {remote_path}"))?;
    file.sync_all()
        .await
        .context("error syncing downloaded data")?;
    Ok(bytes)
}

async fn delete_remote<C: Connector>(ctx: &Context<C>, entry: &RemoteEntry) -> anyhow::Result<()> {
    let remote_path = ctx.config.remote_file(&entry.name);
    let mut session = ctx.pool.checkout().await?;
    session.session()?.delete(&remote_path).await
}

/// Downloads, validates and removes one remote file, then dispatches its commit.
///
/// An error means the file was dropped from this run; a failed remote delete is not an error.
#[tracing::instrument(skip(ctx, entry), fields(name = %entry.name, size = entry.size))]
async fn process<C: Connector>(ctx: &Context<C>, entry: &RemoteEntry) -> Result<(), TransferError> {
    if !is_safe_name(&entry.name) {
        return Err(TransferError::UnsafeName {
            name: entry.name.clone(),
        });
    }
    let staging = ctx.config.staging_path.join(&entry.name);
    let start = std::time::Instant::now();
    tracing::info!("Downloading {:?} ({} bytes)", entry.name, entry.size);
    let mut file = tokio::fs::File::create(&staging)
        .await
        .map_err(|source| TransferError::CreateLocalFile {
            path: staging.clone(),
            source,
        })?;
    let fetched = fetch(ctx, entry, &mut file).await;
    drop(file);
    let bytes = match fetched {
        Ok(bytes) => bytes,
        Err(source) => {
            if let Err(error) = tokio::fs::remove_file(&staging).await {
                tracing::debug!("could not remove partial download {:?}: {}", &staging, error);
            }
            return Err(TransferError::Download {
                name: entry.name.clone(),
                source,
            });
        }
    };
    ctx.progress.files_downloaded.inc();
    ctx.progress.bytes_downloaded.add(bytes);
    tracing::info!(
        "Downloaded {:?} ({}) in {:.2?}",
        entry.name,
        bytesize::ByteSize(bytes),
        start.elapsed()
    );
    // a file failing validation stays in staging for inspection
    common::validate::validate(&staging, entry.size).await?;
    match delete_remote(ctx, entry).await {
        Ok(()) => {
            ctx.progress.remote_deletes.inc();
            tracing::info!("Deleted remote file {:?}", entry.name);
        }
        Err(source) => {
            let error = TransferError::RemoteDelete {
                name: entry.name.clone(),
                source,
            };
            ctx.progress.record_failure(&error);
            tracing::error!("{}", &error);
        }
    }
    common::commit::commit(
        &ctx.commits,
        &ctx.progress,
        ctx.commit_settings,
        common::commit::Paths {
            staging,
            destination: ctx.config.destination_path.join(&entry.name),
            backup: ctx.config.backup_path.join(&entry.name),
        },
    );
    Ok(())
}
