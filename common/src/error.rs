//! Error taxonomy of a transfer run.
//!
//! Only [`TransferError::Connection`] and [`TransferError::Listing`] abort a run, every other
//! variant is scoped to a single file: it is logged, counted and the run moves on.
//!
//! # Logging Convention
//! The Display implementation includes the full cause chain, so it can be logged with `{}`:
//! ```ignore
//! tracing::error!("{}", &error);
//! ```

/// Which replica a commit copy was producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTarget {
    Destination,
    Backup,
}

impl std::fmt::Display for CommitTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CommitTarget::Destination => write!(f, "destination"),
            CommitTarget::Backup => write!(f, "backup"),
        }
    }
}

/// Failure of one stage of the transfer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("failed connecting to {server}: {source:#}")]
    Connection {
        server: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not read remote directory {path:?}: {source:#}")]
    Listing {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("refusing to download {name:?}: not a plain file name")]
    UnsafeName { name: String },
    #[error("could not create local file {path:?}, skipping file: {source}")]
    CreateLocalFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not download file {name:?}: {source:#}")]
    Download {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not read file info of {path:?}: {source}")]
    Validation {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "{path:?}: file size mismatch (expected {expected} bytes, found {actual}), downloaded file may be corrupted"
    )]
    CorruptFile {
        path: std::path::PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("could not delete remote file {name:?}: {source:#}")]
    RemoteDelete {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed committing {src:?} to {target} {dst:?}: {source:#}")]
    Commit {
        target: CommitTarget,
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl TransferError {
    /// Returns true for errors that end the whole run rather than a single file.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::Connection { .. } | TransferError::Listing { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_and_listing_are_fatal() {
        let connection = TransferError::Connection {
            server: "ftp.example.com:21".to_string(),
            source: anyhow::anyhow!("connection refused"),
        };
        let listing = TransferError::Listing {
            path: "/out".to_string(),
            source: anyhow::anyhow!("550 no such directory"),
        };
        let corrupt = TransferError::CorruptFile {
            path: "/tmp/a.csv".into(),
            expected: 1000,
            actual: 990,
        };
        let delete = TransferError::RemoteDelete {
            name: "a.csv".to_string(),
            source: anyhow::anyhow!("550 permission denied"),
        };
        assert!(connection.is_fatal());
        assert!(listing.is_fatal());
        assert!(!corrupt.is_fatal());
        assert!(!delete.is_fatal());
    }

    #[test]
    fn display_includes_cause_chain() {
        let error = TransferError::Download {
            name: "a.csv".to_string(),
            source: anyhow::anyhow!("connection reset").context("RETR /out/a.csv"),
        };
        let message = error.to_string();
        assert!(message.contains("a.csv"));
        assert!(message.contains("RETR /out/a.csv"));
        assert!(message.contains("connection reset"));
    }
}
