//! Batch pull of files from an FTP or FTPS server - `rpull`
//!
//! One run lists a remote directory, downloads up to `max_batch_size` matching files with a fixed
//! number of parallel workers, checks each download against the size the server reported,
//! removes the remote original and replicates the file into a destination and a backup
//! directory.
//!
//! ```text
//! lister --(bounded queue)--> download workers --(task tracker)--> commit tasks
//!    |                              |
//!    +------- session pool ---------+
//! ```
//!
//! # Per-file lifecycle
//!
//! 1. the staging file `<staging_path>/<name>` is created
//! 2. the remote file is streamed into it through a pooled session and synced
//! 3. its size is compared with the listing; a mismatch keeps the file in staging and stops
//! 4. the remote original is deleted; a failure here is logged and the file still moves on
//! 5. two commit tasks copy the file to the destination and to the backup directory; the
//!    staging file is removed once the backup copy is complete
//!
//! The remote file is gone before the backup copy is durable. A crash between those two points
//! leaves the staging file as the only copy.
//!
//! # Configuration
//!
//! Runs are described by a JSON file, see [`common::RunConfig`]:
//!
//! ```json
//! {
//!     "server": "ftp.example.com",
//!     "user": "batch",
//!     "password": "secret",
//!     "protocol": "ftps",
//!     "remote_path": "/outgoing",
//!     "staging_path": "/data/staging",
//!     "destination_path": "/data/live",
//!     "backup_path": "/data/archive",
//!     "name_filter": ".csv",
//!     "log_file": "/var/log/rpull/pull"
//! }
//! ```
//!
//! ```bash
//! rpull --config pull.json --summary
//! ```

pub mod lister;
pub mod pipeline;
pub mod worker;

#[cfg(test)]
mod testutils;

pub use pipeline::{run, run_with};
