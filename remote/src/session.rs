//! The seam between the transfer pipeline and the wire protocol.
//!
//! The pipeline only ever talks to a [`Connector`] and the [`Session`]s it opens, so tests can
//! substitute an in-memory server.

use std::future::Future;

use tokio::io::AsyncWrite;

use crate::ftp::{ConnectParams, FtpSession};
use crate::listing::RemoteEntry;

/// One authenticated connection to the remote server, used by one task at a time.
pub trait Session: Send + 'static {
    fn list(&mut self, path: &str) -> impl Future<Output = anyhow::Result<Vec<RemoteEntry>>> + Send;

    /// Streams the remote file `path` into `writer`, returning the number of bytes written.
    fn retrieve<W>(
        &mut self,
        path: &str,
        writer: &mut W,
    ) -> impl Future<Output = anyhow::Result<u64>> + Send
    where
        W: AsyncWrite + Unpin + Send;

    fn delete(&mut self, path: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn quit(self) -> impl Future<Output = ()> + Send;

    /// False once the connection must not be reused.
    fn is_healthy(&self) -> bool;
}

/// Opens sessions to one server.
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    fn connect(&self) -> impl Future<Output = anyhow::Result<Self::Session>> + Send;

    /// Server description for log lines, never includes credentials.
    fn describe(&self) -> String;
}

impl Session for FtpSession {
    async fn list(&mut self, path: &str) -> anyhow::Result<Vec<RemoteEntry>> {
        Ok(FtpSession::list(self, path).await?)
    }

    async fn retrieve<W>(&mut self, path: &str, writer: &mut W) -> anyhow::Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        Ok(FtpSession::retrieve(self, path, writer).await?)
    }

    async fn delete(&mut self, path: &str) -> anyhow::Result<()> {
        Ok(FtpSession::delete(self, path).await?)
    }

    async fn quit(self) {
        FtpSession::quit(self).await
    }

    fn is_healthy(&self) -> bool {
        FtpSession::is_healthy(self)
    }
}

/// Opens [`FtpSession`]s with fixed parameters.
#[derive(Debug, Clone)]
pub struct FtpConnector {
    params: ConnectParams,
    skip_verify: bool,
}

impl FtpConnector {
    pub fn new(params: ConnectParams) -> Self {
        Self {
            params,
            skip_verify: false,
        }
    }

    pub fn from_config(config: &common::RunConfig) -> anyhow::Result<Self> {
        let (host, port) = config.host_and_port()?;
        let mode = config.protocol();
        let tls = if mode.uses_tls() {
            Some(crate::tls::client_config(config.tls_skip_verify)?)
        } else {
            None
        };
        Ok(Self {
            params: ConnectParams {
                host,
                port,
                user: config.user.clone(),
                password: config.password.clone(),
                mode,
                tls,
                timeout: config.connect_timeout,
                passive_host_override: config.passive_host_override,
            },
            skip_verify: mode.uses_tls() && config.tls_skip_verify,
        })
    }
}

impl Connector for FtpConnector {
    type Session = FtpSession;

    async fn connect(&self) -> anyhow::Result<FtpSession> {
        if self.skip_verify {
            tracing::warn!(
                "connecting to {} without verifying its TLS certificate",
                self.params.address()
            );
        }
        Ok(FtpSession::connect(&self.params).await?)
    }

    fn describe(&self) -> String {
        format!(
            "{}://{}@{}",
            self.params.mode,
            self.params.user,
            self.params.address()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> anyhow::Result<common::RunConfig> {
        common::RunConfig::from_json(json)
    }

    #[test]
    fn connector_from_config() -> anyhow::Result<()> {
        let config = config(
            r#"{"server": "ftp.example.com:2121", "user": "batch", "password": "s3cret",
                "protocol": "ftps", "tls_skip_verify": true, "remote_path": "/out",
                "staging_path": "a", "destination_path": "b", "backup_path": "c"}"#,
        )?;
        let connector = FtpConnector::from_config(&config)?;
        assert_eq!(connector.describe(), "ftps://batch@ftp.example.com:2121");
        assert!(connector.params.tls.is_some());
        assert!(connector.skip_verify);
        assert!(!format!("{connector:?}").contains("s3cret"));
        Ok(())
    }

    #[test]
    fn plain_connector_has_no_tls() -> anyhow::Result<()> {
        let config = config(
            r#"{"server": "::1", "user": "batch", "remote_path": "/out",
                "staging_path": "a", "destination_path": "b", "backup_path": "c"}"#,
        )?;
        let connector = FtpConnector::from_config(&config)?;
        assert!(connector.params.tls.is_none());
        assert_eq!(connector.describe(), "ftp://batch@[::1]:21");
        Ok(())
    }
}
