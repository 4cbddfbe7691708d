use crate::error::{CommitTarget, TransferError};

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| {
            x + *y.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        })
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-run counters shared by the lister, the download workers and the commit tasks.
#[derive(Debug)]
pub struct Progress {
    pub entries_eligible: TlsCounter,
    pub entries_enqueued: TlsCounter,
    pub files_downloaded: TlsCounter,
    pub bytes_downloaded: TlsCounter,
    pub download_failures: TlsCounter,
    pub corrupt_files: TlsCounter,
    pub remote_deletes: TlsCounter,
    pub remote_delete_failures: TlsCounter,
    pub dest_copies: TlsCounter,
    pub dest_failures: TlsCounter,
    pub backup_copies: TlsCounter,
    pub backup_failures: TlsCounter,
    pub staging_removed: TlsCounter,
    pub staging_remove_failures: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            entries_eligible: Default::default(),
            entries_enqueued: Default::default(),
            files_downloaded: Default::default(),
            bytes_downloaded: Default::default(),
            download_failures: Default::default(),
            corrupt_files: Default::default(),
            remote_deletes: Default::default(),
            remote_delete_failures: Default::default(),
            dest_copies: Default::default(),
            dest_failures: Default::default(),
            backup_copies: Default::default(),
            backup_failures: Default::default(),
            staging_removed: Default::default(),
            staging_remove_failures: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Counts a per-file failure under the stage it happened in.
    pub fn record_failure(&self, error: &TransferError) {
        match error {
            TransferError::Connection { .. } | TransferError::Listing { .. } => {}
            TransferError::UnsafeName { .. }
            | TransferError::CreateLocalFile { .. }
            | TransferError::Download { .. } => self.download_failures.inc(),
            TransferError::Validation { .. } | TransferError::CorruptFile { .. } => {
                self.corrupt_files.inc()
            }
            TransferError::RemoteDelete { .. } => self.remote_delete_failures.inc(),
            TransferError::Commit {
                target: CommitTarget::Destination,
                ..
            } => self.dest_failures.inc(),
            TransferError::Commit {
                target: CommitTarget::Backup,
                ..
            } => self.backup_failures.inc(),
        }
    }

    pub fn summary(&self) -> Summary {
        Summary {
            entries_eligible: self.entries_eligible.get(),
            entries_enqueued: self.entries_enqueued.get(),
            files_downloaded: self.files_downloaded.get(),
            bytes_downloaded: self.bytes_downloaded.get(),
            download_failures: self.download_failures.get(),
            corrupt_files: self.corrupt_files.get(),
            remote_deletes: self.remote_deletes.get(),
            remote_delete_failures: self.remote_delete_failures.get(),
            dest_copies: self.dest_copies.get(),
            dest_failures: self.dest_failures.get(),
            backup_copies: self.backup_copies.get(),
            backup_failures: self.backup_failures.get(),
            staging_removed: self.staging_removed.get(),
            staging_remove_failures: self.staging_remove_failures.get(),
            elapsed: self.get_duration(),
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a finished run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub entries_eligible: u64,
    pub entries_enqueued: u64,
    pub files_downloaded: u64,
    pub bytes_downloaded: u64,
    pub download_failures: u64,
    pub corrupt_files: u64,
    pub remote_deletes: u64,
    pub remote_delete_failures: u64,
    pub dest_copies: u64,
    pub dest_failures: u64,
    pub backup_copies: u64,
    pub backup_failures: u64,
    pub staging_removed: u64,
    pub staging_remove_failures: u64,
    pub elapsed: std::time::Duration,
}

impl Summary {
    /// Eligible entries left on the server because of the batch cap.
    pub fn entries_deferred(&self) -> u64 {
        self.entries_eligible.saturating_sub(self.entries_enqueued)
    }

    /// Number of per-file failures of any kind.
    pub fn failures(&self) -> u64 {
        self.download_failures
            + self.corrupt_files
            + self.remote_delete_failures
            + self.dest_failures
            + self.backup_failures
            + self.staging_remove_failures
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files eligible: {}\n\
            files enqueued: {}\n\
            files deferred: {}\n\
            files downloaded: {}\n\
            bytes downloaded: {}\n\
            download failures: {}\n\
            corrupt files: {}\n\
            remote files deleted: {}\n\
            remote delete failures: {}\n\
            destination copies: {}\n\
            destination failures: {}\n\
            backup copies: {}\n\
            backup failures: {}\n\
            staging files removed: {}\n\
            staging removal failures: {}\n\
            elapsed: {}",
            self.entries_eligible,
            self.entries_enqueued,
            self.entries_deferred(),
            self.files_downloaded,
            bytesize::ByteSize(self.bytes_downloaded),
            self.download_failures,
            self.corrupt_files,
            self.remote_deletes,
            self.remote_delete_failures,
            self.dest_copies,
            self.dest_failures,
            self.backup_copies,
            self.backup_failures,
            self.staging_removed,
            self.staging_remove_failures,
            humantime::format_duration(std::time::Duration::from_millis(
                u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
            )),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn failures_are_counted_by_stage() -> Result<()> {
        let progress = Progress::new();
        progress.record_failure(&TransferError::CorruptFile {
            path: "/tmp/a.csv".into(),
            expected: 1000,
            actual: 990,
        });
        progress.record_failure(&TransferError::Download {
            name: "b.csv".to_string(),
            source: anyhow::anyhow!("reset"),
        });
        progress.record_failure(&TransferError::RemoteDelete {
            name: "c.csv".to_string(),
            source: anyhow::anyhow!("denied"),
        });
        let summary = progress.summary();
        assert_eq!(summary.corrupt_files, 1);
        assert_eq!(summary.download_failures, 1);
        assert_eq!(summary.remote_delete_failures, 1);
        assert_eq!(summary.failures(), 3);
        progress.staging_remove_failures.inc();
        assert_eq!(progress.summary().failures(), 4);
        Ok(())
    }

    #[test]
    fn deferred_entries_follow_batch_cap() -> Result<()> {
        let summary = Summary {
            entries_eligible: 120,
            entries_enqueued: 50,
            ..Default::default()
        };
        assert_eq!(summary.entries_deferred(), 70);
        assert!(summary.to_string().contains("files deferred: 70"));
        Ok(())
    }
}
