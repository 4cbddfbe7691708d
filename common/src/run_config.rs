//! Per-run configuration loaded from a JSON file.
//!
//! Keys are snake_case. The PascalCase keys written by older deployments (`Server`, `FtpPath`,
//! `LocalTempPath`, ...) are accepted as aliases so existing configuration files keep working.

use anyhow::{Context, anyhow};

/// Transport security of the control and data connections.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Deserialize)]
pub enum ProtocolMode {
    /// Plain FTP, nothing is encrypted.
    #[default]
    #[serde(rename = "ftp", alias = "FTP")]
    Plain,
    /// Plain TCP upgraded with `AUTH TLS` before login.
    #[serde(rename = "ftps", alias = "FTPS", alias = "ftpes", alias = "FTPES")]
    Explicit,
    /// TLS from the first byte, conventionally on port 990.
    #[serde(rename = "ftps-implicit", alias = "FTPS-IMPLICIT")]
    Implicit,
}

impl ProtocolMode {
    pub fn uses_tls(&self) -> bool {
        !matches!(self, ProtocolMode::Plain)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProtocolMode::Implicit => 990,
            ProtocolMode::Plain | ProtocolMode::Explicit => 21,
        }
    }
}

impl std::fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolMode::Plain => write!(f, "ftp"),
            ProtocolMode::Explicit => write!(f, "ftps"),
            ProtocolMode::Implicit => write!(f, "ftps-implicit"),
        }
    }
}

/// Legacy `TLSMode` key, only consulted when `protocol` asks for TLS.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[serde(alias = "Explicit", alias = "EXPLICIT")]
    Explicit,
    #[serde(alias = "Implicit", alias = "IMPLICIT")]
    Implicit,
}

/// How the wait between connect attempts grows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Count(u64),
    Text(String),
}

impl DurationValue {
    fn into_duration<E: serde::de::Error>(self, unit: u64) -> Result<std::time::Duration, E> {
        match self {
            DurationValue::Count(count) => Ok(std::time::Duration::from_secs(
                count.saturating_mul(unit),
            )),
            DurationValue::Text(text) => humantime::parse_duration(text.trim())
                .map_err(|error| E::custom(format!("invalid duration {text:?}: {error}"))),
        }
    }
}

fn duration_seconds<'de, D>(deserializer: D) -> Result<std::time::Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <DurationValue as serde::Deserialize>::deserialize(deserializer)?.into_duration(1)
}

// bare integers are minutes here, the unit older configuration files were written in
fn duration_minutes<'de, D>(deserializer: D) -> Result<std::time::Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <DurationValue as serde::Deserialize>::deserialize(deserializer)?.into_duration(60)
}

fn default_max_parallel_downloads() -> usize {
    3
}

fn default_max_batch_size() -> usize {
    50
}

fn default_connect_retry() -> u32 {
    3
}

fn default_retry_interval() -> std::time::Duration {
    std::time::Duration::from_secs(60)
}

fn default_commit_delay() -> std::time::Duration {
    std::time::Duration::from_secs(5)
}

fn default_connect_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

/// Everything one run needs to know. Immutable once loaded and validated.
#[derive(Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Free-form label printed at startup.
    #[serde(default, alias = "Title")]
    pub title: Option<String>,
    /// `host` or `host:port`; the port defaults from the protocol mode.
    #[serde(alias = "Server")]
    pub server: String,
    #[serde(alias = "User")]
    pub user: String,
    #[serde(default, alias = "Password")]
    pub password: String,
    #[serde(default, alias = "Protocol")]
    pub protocol: ProtocolMode,
    #[serde(default, alias = "TLSMode")]
    pub tls_mode: Option<TlsMode>,
    /// Accept any server certificate. Only for legacy servers with self-signed certificates.
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// Use the control connection's host for passive data connections instead of the address
    /// the server advertises, which is frequently a private address behind NAT.
    #[serde(default = "default_true")]
    pub passive_host_override: bool,
    #[serde(alias = "FtpPath")]
    pub remote_path: String,
    #[serde(alias = "LocalTempPath", alias = "local_temp_path")]
    pub staging_path: std::path::PathBuf,
    #[serde(alias = "LocalPath", alias = "local_path")]
    pub destination_path: std::path::PathBuf,
    #[serde(alias = "BackupPath")]
    pub backup_path: std::path::PathBuf,
    /// Only names ending with this suffix are pulled; empty means no filter.
    #[serde(default, alias = "FileNameFilter", alias = "file_name_filter")]
    pub name_filter: String,
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_connect_retry", alias = "ConnectRetry")]
    pub connect_retry: u32,
    #[serde(
        default = "default_retry_interval",
        alias = "RetryInterval",
        deserialize_with = "duration_minutes"
    )]
    pub retry_interval: std::time::Duration,
    #[serde(default)]
    pub retry_backoff: Backoff,
    #[serde(default = "default_commit_delay", deserialize_with = "duration_seconds")]
    pub commit_delay: std::time::Duration,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "duration_seconds"
    )]
    pub connect_timeout: std::time::Duration,
    /// Log file prefix, `_<YYYYMMDD>.txt` is appended.
    #[serde(default, alias = "LogFile")]
    pub log_file: Option<std::path::PathBuf>,
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("title", &self.title)
            .field("server", &self.server)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("protocol", &self.protocol())
            .field("tls_skip_verify", &self.tls_skip_verify)
            .field("passive_host_override", &self.passive_host_override)
            .field("remote_path", &self.remote_path)
            .field("staging_path", &self.staging_path)
            .field("destination_path", &self.destination_path)
            .field("backup_path", &self.backup_path)
            .field("name_filter", &self.name_filter)
            .field("max_parallel_downloads", &self.max_parallel_downloads)
            .field("max_batch_size", &self.max_batch_size)
            .field("connect_retry", &self.connect_retry)
            .field("retry_interval", &self.retry_interval)
            .field("retry_backoff", &self.retry_backoff)
            .field("commit_delay", &self.commit_delay)
            .field("connect_timeout", &self.connect_timeout)
            .field("log_file", &self.log_file)
            .finish()
    }
}

impl RunConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not open config file {path:?}"))?;
        Self::from_json(&text).with_context(|| format!("could not parse config file {path:?}"))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Effective protocol mode, folding in the legacy `TLSMode` key.
    pub fn protocol(&self) -> ProtocolMode {
        match (self.protocol, self.tls_mode) {
            (ProtocolMode::Explicit, Some(TlsMode::Implicit)) => ProtocolMode::Implicit,
            (protocol, _) => protocol,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.trim().is_empty() {
            return Err(anyhow!("server must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(anyhow!("user must not be empty"));
        }
        if self.max_parallel_downloads == 0 {
            return Err(anyhow!("max_parallel_downloads must be at least 1"));
        }
        if self.max_batch_size == 0 {
            return Err(anyhow!("max_batch_size must be at least 1"));
        }
        let dirs = [
            ("staging_path", &self.staging_path),
            ("destination_path", &self.destination_path),
            ("backup_path", &self.backup_path),
        ];
        for (i, (name, dir)) in dirs.iter().enumerate() {
            if dir.as_os_str().is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
            for (other_name, other) in &dirs[i + 1..] {
                if dir == other {
                    return Err(anyhow!(
                        "{name} and {other_name} must be different directories, both are {dir:?}"
                    ));
                }
            }
        }
        self.host_and_port()?;
        Ok(())
    }

    pub fn name_filter(&self) -> Option<&str> {
        if self.name_filter.is_empty() {
            None
        } else {
            Some(&self.name_filter)
        }
    }

    /// Splits `server` into host and port, defaulting the port from the protocol mode.
    pub fn host_and_port(&self) -> anyhow::Result<(String, u16)> {
        let server = self.server.trim();
        let default_port = self.protocol().default_port();
        if let Some(rest) = server.strip_prefix('[') {
            // [v6-address] or [v6-address]:port
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("invalid server address {server:?}"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(server, port)?,
                None if tail.is_empty() => default_port,
                None => return Err(anyhow!("invalid server address {server:?}")),
            };
            return Ok((host.to_string(), port));
        }
        match server.split_once(':') {
            Some((host, port)) if !port.contains(':') => {
                Ok((host.to_string(), parse_port(server, port)?))
            }
            Some(_) => Ok((server.to_string(), default_port)),
            None => Ok((server.to_string(), default_port)),
        }
    }

    /// Remote directory to list, the login directory standing in for an empty path.
    pub fn listing_path(&self) -> &str {
        if self.remote_path.is_empty() {
            "."
        } else {
            &self.remote_path
        }
    }

    /// Remote path of a file named `name` inside the remote directory.
    pub fn remote_file(&self, name: &str) -> String {
        let dir = self.remote_path.trim_end_matches('/');
        if dir.is_empty() && !self.remote_path.starts_with('/') {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        }
    }

    pub fn log_target(&self) -> Option<&std::path::Path> {
        self.log_file
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

fn parse_port(server: &str, port: &str) -> anyhow::Result<u16> {
    port.parse::<u16>()
        .with_context(|| format!("invalid port in server address {server:?}"))
}
