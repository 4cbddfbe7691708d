use std::sync::Arc;

use common::{Progress, RunConfig, TransferError};
use remote::{Connector, RemoteEntry, Session, SessionPool};

/// A listed entry is a download candidate when it is a plain file matching the name filter.
pub fn is_eligible(entry: &RemoteEntry, filter: Option<&str>) -> bool {
    if entry.is_dir {
        return false;
    }
    match filter {
        Some(suffix) => entry.name.ends_with(suffix),
        None => true,
    }
}

fn audit_line(index: usize, entry: &RemoteEntry) -> String {
    let modified = entry
        .modified
        .map(|modified| modified.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:>4} {:?} modified {} size {} mode {}",
        index,
        entry.name,
        modified,
        entry.size,
        if entry.mode.is_empty() {
            "-"
        } else {
            &entry.mode
        }
    )
}

/// Lists the remote directory and feeds up to `max_batch_size` eligible files into `queue`.
///
/// The queue is closed on every exit path. Returns the number of enqueued entries.
#[tracing::instrument(skip_all, fields(path = %config.listing_path()))]
pub async fn list<C: Connector>(
    pool: &Arc<SessionPool<C>>,
    config: &RunConfig,
    progress: &Progress,
    queue: async_channel::Sender<RemoteEntry>,
) -> Result<usize, TransferError> {
    let result = list_into(pool, config, progress, &queue).await;
    queue.close();
    result
}

async fn list_into<C: Connector>(
    pool: &Arc<SessionPool<C>>,
    config: &RunConfig,
    progress: &Progress,
    queue: &async_channel::Sender<RemoteEntry>,
) -> Result<usize, TransferError> {
    let path = config.listing_path();
    let listing_error = |source: anyhow::Error| TransferError::Listing {
        path: path.to_string(),
        source,
    };
    let entries = {
        let mut session = pool.checkout().await.map_err(listing_error)?;
        session
            .session()
            .map_err(listing_error)?
            .list(path)
            .await
            .map_err(listing_error)?
    };
    let filter = config.name_filter();
    let eligible: Vec<RemoteEntry> = entries
        .into_iter()
        .filter(|entry| is_eligible(entry, filter))
        .collect();
    progress.entries_eligible.add(eligible.len() as u64);
    tracing::info!(
        "{} eligible file(s) in {:?}{}",
        eligible.len(),
        path,
        filter
            .map(|suffix| format!(" matching {suffix:?}"))
            .unwrap_or_default()
    );
    for (index, entry) in eligible.iter().enumerate() {
        tracing::info!("{}", audit_line(index + 1, entry));
    }
    let total = eligible.len();
    let mut enqueued = 0;
    for entry in eligible.into_iter().take(config.max_batch_size) {
        if queue.send(entry).await.is_err() {
            tracing::warn!("work queue closed, stopping after {} file(s)", enqueued);
            break;
        }
        progress.entries_enqueued.inc();
        enqueued += 1;
    }
    if total > enqueued {
        tracing::info!(
            "batch limit of {} reached, {} file(s) left for a later run",
            config.max_batch_size,
            total - enqueued
        );
    }
    Ok(enqueued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{MemoryConnector, MemoryServer, TestDirs};
    use remote::RetryPolicy;
    use tracing_test::traced_test;

    async fn pool(
        server: &Arc<MemoryServer>,
    ) -> anyhow::Result<Arc<SessionPool<MemoryConnector>>> {
        SessionPool::connect(MemoryConnector::new(server), RetryPolicy::once(), 1).await
    }

    async fn drain(rx: async_channel::Receiver<RemoteEntry>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(entry) = rx.recv().await {
            names.push(entry.name);
        }
        names
    }

    #[test]
    fn eligibility() {
        let csv = RemoteEntry::file("a.csv", 1);
        let txt = RemoteEntry::file("a.txt", 1);
        let dir = RemoteEntry {
            is_dir: true,
            ..RemoteEntry::file("archive.csv", 0)
        };
        assert!(is_eligible(&csv, Some(".csv")));
        assert!(!is_eligible(&txt, Some(".csv")));
        assert!(is_eligible(&txt, None));
        assert!(!is_eligible(&dir, None));
        assert!(!is_eligible(&dir, Some(".csv")));
    }

    #[tokio::test]
    #[traced_test]
    async fn filters_and_enqueues() -> anyhow::Result<()> {
        let server = MemoryServer::new();
        for name in ["a.csv", "b.csv", "c.txt"] {
            server.add_file(name, b"data");
        }
        server.add_dir("old.csv");
        let dirs = TestDirs::new()?;
        let mut config = dirs.config();
        config.name_filter = ".csv".to_string();
        let progress = Progress::new();
        let (tx, rx) = async_channel::bounded(config.max_batch_size);
        let enqueued = list(&pool(&server).await?, &config, &progress, tx).await?;
        assert_eq!(enqueued, 2);
        assert_eq!(drain(rx).await, vec!["a.csv", "b.csv"]);
        assert_eq!(progress.entries_eligible.get(), 2);
        assert!(logs_contain("2 eligible file(s)"));
        assert!(logs_contain("\"a.csv\" modified - size 4"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn batch_cap_defers_the_rest() -> anyhow::Result<()> {
        let server = MemoryServer::new();
        for index in 0..7 {
            server.add_file(&format!("f{index}.csv"), b"x");
        }
        let dirs = TestDirs::new()?;
        let mut config = dirs.config();
        config.max_batch_size = 5;
        let progress = Progress::new();
        // larger than the cap so the lister never blocks in this test
        let (tx, rx) = async_channel::bounded(10);
        let enqueued = list(&pool(&server).await?, &config, &progress, tx).await?;
        assert_eq!(enqueued, 5);
        assert_eq!(drain(rx).await.len(), 5);
        let summary = progress.summary();
        assert_eq!(summary.entries_eligible, 7);
        assert_eq!(summary.entries_enqueued, 5);
        assert_eq!(summary.entries_deferred(), 2);
        assert!(logs_contain("2 file(s) left for a later run"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn listing_failure_closes_queue() -> anyhow::Result<()> {
        let server = MemoryServer::new();
        server.add_file("a.csv", b"x");
        server.fail_list();
        let dirs = TestDirs::new()?;
        let config = dirs.config();
        let progress = Progress::new();
        let (tx, rx) = async_channel::bounded(config.max_batch_size);
        let result = list(&pool(&server).await?, &config, &progress, tx).await;
        match result {
            Err(TransferError::Listing { path, .. }) => assert_eq!(path, "/out"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(rx.is_closed());
        assert!(drain(rx).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_directory_enqueues_nothing() -> anyhow::Result<()> {
        let server = MemoryServer::new();
        let dirs = TestDirs::new()?;
        let config = dirs.config();
        let progress = Progress::new();
        let (tx, rx) = async_channel::bounded(config.max_batch_size);
        assert_eq!(list(&pool(&server).await?, &config, &progress, tx).await?, 0);
        assert!(drain(rx).await.is_empty());
        Ok(())
    }
}
