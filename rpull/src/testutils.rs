//! In-memory stand-in for an FTP server, with call recording and failure injection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use remote::{Connector, RemoteEntry, Session};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Retrieve(String),
    Delete(String),
}

struct MemoryFile {
    data: Vec<u8>,
    reported_size: u64,
}

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, MemoryFile>,
    dirs: BTreeSet<String>,
    calls: Vec<Call>,
    fail_list: bool,
    fail_retrieve: BTreeSet<String>,
    fail_delete: BTreeSet<String>,
}

#[derive(Default)]
pub struct MemoryServer {
    inner: Mutex<Inner>,
    active_retrievals: AtomicUsize,
    max_active_retrievals: AtomicUsize,
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn add_file(&self, name: &str, data: &[u8]) {
        self.add_file_reporting(name, data, data.len() as u64);
    }

    /// Adds a file whose listing size differs from the bytes actually served.
    pub fn add_file_reporting(&self, name: &str, data: &[u8], reported_size: u64) {
        self.inner().files.insert(
            name.to_string(),
            MemoryFile {
                data: data.to_vec(),
                reported_size,
            },
        );
    }

    pub fn add_dir(&self, name: &str) {
        self.inner().dirs.insert(name.to_string());
    }

    pub fn fail_list(&self) {
        self.inner().fail_list = true;
    }

    pub fn fail_retrieve(&self, name: &str) {
        self.inner().fail_retrieve.insert(name.to_string());
    }

    pub fn fail_delete(&self, name: &str) {
        self.inner().fail_delete.insert(name.to_string());
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.inner().files.contains_key(name)
    }

    pub fn file_names(&self) -> Vec<String> {
        self.inner().files.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner().calls.clone()
    }

    pub fn retrievals(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Retrieve(path) => Some(name_of(&path).to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn max_concurrent_retrievals(&self) -> usize {
        self.max_active_retrievals.load(Ordering::SeqCst)
    }
}

pub struct MemorySession {
    server: Arc<MemoryServer>,
    healthy: bool,
}

impl Session for MemorySession {
    async fn list(&mut self, path: &str) -> anyhow::Result<Vec<RemoteEntry>> {
        let mut inner = self.server.inner();
        inner.calls.push(Call::List(path.to_string()));
        if inner.fail_list {
            return Err(anyhow::anyhow!("550 {path}: no such directory"));
        }
        let mut entries: Vec<RemoteEntry> = inner
            .files
            .iter()
            .map(|(name, file)| RemoteEntry::file(name, file.reported_size))
            .collect();
        entries.extend(inner.dirs.iter().map(|name| RemoteEntry {
            is_dir: true,
            ..RemoteEntry::file(name, 4096)
        }));
        Ok(entries)
    }

    async fn retrieve<W>(&mut self, path: &str, writer: &mut W) -> anyhow::Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin + Send,
    {
        let data = {
            let mut inner = self.server.inner();
            inner.calls.push(Call::Retrieve(path.to_string()));
            let name = name_of(path);
            if inner.fail_retrieve.contains(name) {
                self.healthy = false;
                return Err(anyhow::anyhow!("connection reset while reading {path}"));
            }
            inner
                .files
                .get(name)
                .map(|file| file.data.clone())
                .ok_or_else(|| anyhow::anyhow!("550 {path}: no such file"))?
        };
        let active = self.server.active_retrievals.fetch_add(1, Ordering::SeqCst) + 1;
        self.server
            .max_active_retrievals
            .fetch_max(active, Ordering::SeqCst);
        // let other workers overlap with this transfer
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let written = writer.write_all(&data).await;
        self.server.active_retrievals.fetch_sub(1, Ordering::SeqCst);
        written?;
        writer.flush().await?;
        Ok(data.len() as u64)
    }

    async fn delete(&mut self, path: &str) -> anyhow::Result<()> {
        let mut inner = self.server.inner();
        inner.calls.push(Call::Delete(path.to_string()));
        let name = name_of(path).to_string();
        if inner.fail_delete.contains(&name) {
            return Err(anyhow::anyhow!("550 {path}: permission denied"));
        }
        inner
            .files
            .remove(&name)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("550 {path}: no such file"))
    }

    async fn quit(self) {}

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

pub struct MemoryConnector {
    server: Arc<MemoryServer>,
    connects: AtomicU32,
    // connect attempts numbered from 1 that fail
    failing_connects: BTreeSet<u32>,
}

impl MemoryConnector {
    pub fn new(server: &Arc<MemoryServer>) -> Self {
        Self {
            server: server.clone(),
            connects: AtomicU32::new(0),
            failing_connects: BTreeSet::new(),
        }
    }

    pub fn failing_connects(mut self, attempts: impl IntoIterator<Item = u32>) -> Self {
        self.failing_connects.extend(attempts);
        self
    }
}

impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self) -> anyhow::Result<MemorySession> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_connects.contains(&attempt) {
            return Err(anyhow::anyhow!("connection refused"));
        }
        Ok(MemorySession {
            server: self.server.clone(),
            healthy: true,
        })
    }

    fn describe(&self) -> String {
        "memory://test".to_string()
    }
}

/// Staging, destination and backup directories under one temporary root.
pub struct TestDirs {
    pub root: tempfile::TempDir,
    pub staging: std::path::PathBuf,
    pub destination: std::path::PathBuf,
    pub backup: std::path::PathBuf,
}

impl TestDirs {
    pub fn new() -> anyhow::Result<Self> {
        let root = tempfile::tempdir()?;
        let staging = root.path().join("staging");
        let destination = root.path().join("destination");
        let backup = root.path().join("backup");
        Ok(Self {
            root,
            staging,
            destination,
            backup,
        })
    }

    pub fn config(&self) -> common::RunConfig {
        common::RunConfig {
            title: None,
            server: "memory".to_string(),
            user: "batch".to_string(),
            password: String::new(),
            protocol: common::ProtocolMode::Plain,
            tls_mode: None,
            tls_skip_verify: false,
            passive_host_override: true,
            remote_path: "/out".to_string(),
            staging_path: self.staging.clone(),
            destination_path: self.destination.clone(),
            backup_path: self.backup.clone(),
            name_filter: String::new(),
            max_parallel_downloads: 3,
            max_batch_size: 50,
            connect_retry: 1,
            retry_interval: std::time::Duration::ZERO,
            retry_backoff: common::Backoff::Fixed,
            commit_delay: std::time::Duration::ZERO,
            connect_timeout: std::time::Duration::from_secs(5),
            log_file: None,
        }
    }
}

pub async fn file_names(dir: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
