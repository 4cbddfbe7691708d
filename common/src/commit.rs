//! Commit stage: replicate a downloaded file into the destination and backup directories.
//!
//! Both copies are independent tasks reading the staging file through their own handle. The
//! destination copy is best-effort. The backup copy is the durable one: the staging file is
//! removed only once the backup copy has been written and synced.

use anyhow::Context;
use tracing::instrument;

use crate::error::{CommitTarget, TransferError};
use crate::progress::Progress;

#[derive(Debug, Copy, Clone, Default)]
pub struct Settings {
    /// Pause before and after each copy, eases filesystem pressure under large batches.
    pub delay: std::time::Duration,
}

/// Source and target paths of one file's commit.
#[derive(Debug, Clone)]
pub struct Paths {
    pub staging: std::path::PathBuf,
    pub destination: std::path::PathBuf,
    pub backup: std::path::PathBuf,
}

fn partial_path(dst: &std::path::Path) -> std::path::PathBuf {
    let name = dst
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{name}.partial"))
}

async fn pause(settings: &Settings) {
    if !settings.delay.is_zero() {
        tokio::time::sleep(settings.delay).await;
    }
}

async fn open_staging(src: &std::path::Path) -> anyhow::Result<tokio::fs::File> {
    tokio::fs::File::open(src)
        .await
        .with_context(|| format!("could not read file {src:?}"))
}

/// Stream-copies `src` into `dst`, returning the number of bytes copied.
///
/// Data is written to a hidden sibling of `dst` and renamed into place after it is synced, so
/// `dst` either does not exist or holds the complete file.
#[instrument]
pub async fn copy_file(src: &std::path::Path, dst: &std::path::Path) -> anyhow::Result<u64> {
    let reader = open_staging(src).await?;
    copy_from(reader, src, dst).await
}

async fn copy_from(
    mut reader: tokio::fs::File,
    src: &std::path::Path,
    dst: &std::path::Path,
) -> anyhow::Result<u64> {
    let partial = partial_path(dst);
    let copied = async {
        let mut writer = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("could not create file {partial:?}"))?;
        let copied = tokio::io::copy(&mut reader, &mut writer)
            .await
            .with_context(|| format!("error copying {src:?} to {partial:?}"))?;
        writer
            .sync_all()
            .await
            .with_context(|| format!("error syncing {partial:?}"))?;
        tokio::fs::rename(&partial, dst)
            .await
            .with_context(|| format!("error renaming {partial:?} to {dst:?}"))?;
        anyhow::Ok(copied)
    }
    .await;
    if copied.is_err() {
        if let Err(error) = tokio::fs::remove_file(&partial).await {
            tracing::debug!("could not remove partial file {:?}: {}", &partial, error);
        }
    }
    copied
}

async fn copy_to_destination(
    progress: &Progress,
    settings: &Settings,
    reader: anyhow::Result<tokio::fs::File>,
    src: &std::path::Path,
    dst: &std::path::Path,
) {
    pause(settings).await;
    let copied = match reader {
        Ok(reader) => copy_from(reader, src, dst).await,
        Err(error) => Err(error),
    };
    pause(settings).await;
    match copied {
        Ok(bytes) => {
            progress.dest_copies.inc();
            tracing::info!("File {:?} copied to {:?} ({} bytes)", src, dst, bytes);
        }
        Err(source) => {
            let error = TransferError::Commit {
                target: CommitTarget::Destination,
                src: src.to_path_buf(),
                dst: dst.to_path_buf(),
                source,
            };
            progress.record_failure(&error);
            tracing::error!("{}", &error);
        }
    }
}

async fn remove_staging(progress: &Progress, src: &std::path::Path) {
    tracing::info!("Deleting staging file {:?}", src);
    match tokio::fs::remove_file(src).await {
        Ok(()) => progress.staging_removed.inc(),
        Err(error) => {
            progress.staging_remove_failures.inc();
            tracing::error!("could not delete staging file {src:?}: {error}");
        }
    }
}

async fn move_to_backup(
    progress: &Progress,
    settings: &Settings,
    reader: anyhow::Result<tokio::fs::File>,
    src: &std::path::Path,
    dst: &std::path::Path,
) {
    pause(settings).await;
    let copied = match reader {
        Ok(reader) => copy_from(reader, src, dst).await,
        Err(error) => Err(error),
    };
    pause(settings).await;
    match copied {
        Ok(bytes) => {
            progress.backup_copies.inc();
            tracing::info!("File {:?} backed up to {:?} ({} bytes)", src, dst, bytes);
            remove_staging(progress, src).await;
        }
        Err(source) => {
            let error = TransferError::Commit {
                target: CommitTarget::Backup,
                src: src.to_path_buf(),
                dst: dst.to_path_buf(),
                source,
            };
            progress.record_failure(&error);
            tracing::error!("{}, staging file retained", &error);
        }
    }
}

/// Dispatches the destination copy and the backup move of one file onto `tracker`.
///
/// Returns immediately; outcomes are logged and counted into `progress`. The caller awaits
/// completion through the tracker. Both copies read through handles opened before either copy
/// starts, so removing the staging file after the backup never cuts off the destination copy.
pub fn commit(
    tracker: &tokio_util::task::TaskTracker,
    progress: &std::sync::Arc<Progress>,
    settings: Settings,
    paths: Paths,
) {
    let tasks = tracker.clone();
    let progress = progress.clone();
    tracker.spawn(async move {
        let Paths {
            staging,
            destination,
            backup,
        } = paths;
        let destination_reader = open_staging(&staging).await;
        let backup_reader = open_staging(&staging).await;
        {
            let progress = progress.clone();
            let staging = staging.clone();
            tasks.spawn(async move {
                copy_to_destination(
                    &progress,
                    &settings,
                    destination_reader,
                    &staging,
                    &destination,
                )
                .await
            });
        }
        tasks.spawn(async move {
            move_to_backup(&progress, &settings, backup_reader, &staging, &backup).await
        });
    });
}
