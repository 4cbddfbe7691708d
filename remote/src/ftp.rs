//! Minimal FTP/FTPS client: just enough of RFC 959 (plus RFC 2228 `AUTH TLS`, RFC 2428 `EPSV`
//! and RFC 3659 `MLSD`) to list a directory, download files and delete them.
//!
//! One [`FtpSession`] owns one control connection and is driven by one task at a time. Data
//! connections are always passive and opened per transfer.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use common::ProtocolMode;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::instrument;

use crate::listing::RemoteEntry;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FtpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error("{command}: unexpected reply {code} {message}")]
    UnexpectedReply {
        command: String,
        code: u16,
        message: String,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out {0}")]
    Timeout(String),
}

impl FtpError {
    /// True if the control connection can no longer be trusted after this error.
    pub fn breaks_session(&self) -> bool {
        match self {
            FtpError::Io(_) | FtpError::Tls(_) | FtpError::Protocol(_) | FtpError::Timeout(_) => {
                true
            }
            // 421: service not available, closing control connection
            FtpError::UnexpectedReply { code, .. } => *code == 421,
        }
    }
}

/// A complete, possibly multi-line, server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Reply text without the status codes.
    pub fn message(&self) -> String {
        let code = self.code.to_string();
        self.lines
            .iter()
            .map(|line| {
                line.strip_prefix(code.as_str())
                    .map(|rest| rest.get(1..).unwrap_or_default())
                    .unwrap_or(line)
                    .trim()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_positive_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_positive_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

fn parse_code(line: &str) -> Result<(u16, bool), FtpError> {
    let code = line
        .get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| FtpError::Protocol(format!("malformed reply line {line:?}")))?;
    let continued = line.as_bytes().get(3) == Some(&b'-');
    Ok((code, continued))
}

/// Control or data connection, optionally wrapped in TLS.
enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Everything needed to open an authenticated session.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub mode: ProtocolMode,
    /// Required when `mode` uses TLS.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Bounds connecting, TLS handshakes and waiting for any single reply or data read.
    pub timeout: std::time::Duration,
    /// Connect passive data connections to the control connection's peer address instead of
    /// the address in the `PASV` reply.
    pub passive_host_override: bool,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .field("passive_host_override", &self.passive_host_override)
            .finish()
    }
}

impl ConnectParams {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

struct TlsSetup {
    connector: tokio_rustls::TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
}

/// An authenticated FTP control connection in binary mode.
pub struct FtpSession {
    control: tokio::io::BufReader<Stream>,
    peer: std::net::IpAddr,
    tls: Option<TlsSetup>,
    protect_data: bool,
    mlsd: bool,
    epsv: bool,
    passive_host_override: bool,
    timeout: std::time::Duration,
    broken: bool,
}

impl std::fmt::Debug for FtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FtpSession")
            .field("peer", &self.peer)
            .field("protect_data", &self.protect_data)
            .field("mlsd", &self.mlsd)
            .field("broken", &self.broken)
            .finish()
    }
}

async fn with_timeout<T, F>(
    timeout: std::time::Duration,
    what: impl FnOnce() -> String,
    future: F,
) -> Result<T, FtpError>
where
    F: std::future::Future<Output = Result<T, FtpError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(FtpError::Timeout(what())),
    }
}

async fn tls_handshake(
    tls: &TlsSetup,
    tcp: TcpStream,
    timeout: std::time::Duration,
) -> Result<Stream, FtpError> {
    with_timeout(
        timeout,
        || "waiting for TLS handshake".to_string(),
        async {
            let stream = tls
                .connector
                .connect(tls.server_name.clone(), tcp)
                .await
                .map_err(FtpError::Tls)?;
            Ok(Stream::Tls(Box::new(stream)))
        },
    )
    .await
}

fn parse_epsv_port(message: &str) -> Option<u16> {
    let start = message.find('(')?;
    let end = message[start..].find(')')? + start;
    let inner = &message[start + 1..end];
    let delimiter = inner.chars().next()?;
    inner.split(delimiter).nth(3)?.parse().ok()
}

fn parse_pasv_address(message: &str) -> Option<std::net::SocketAddrV4> {
    let start = message.find(|c: char| c.is_ascii_digit())?;
    let numbers: Vec<u8> = message[start..]
        .split(|c: char| !c.is_ascii_digit() && c != ',')
        .next()?
        .split(',')
        .map(|part| part.parse::<u8>().ok())
        .collect::<Option<_>>()?;
    if numbers.len() != 6 {
        return None;
    }
    let ip = std::net::Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = (u16::from(numbers[4]) << 8) | u16::from(numbers[5]);
    Some(std::net::SocketAddrV4::new(ip, port))
}

/// Copies `reader` into `writer` until EOF, failing when no data arrives for `idle`.
///
/// With `truncation_is_eof` a stream cut off without a TLS close_notify ends the copy like a
/// regular EOF. Many FTPS servers close protected data connections that way; the completion
/// reply still decides whether the transfer succeeded.
async fn copy_with_idle_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: std::time::Duration,
    truncation_is_eof: bool,
) -> Result<u64, FtpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = with_timeout(idle, || "waiting for data".to_string(), async {
            match reader.read(&mut buffer).await {
                Ok(read) => Ok(read),
                Err(error)
                    if truncation_is_eof
                        && error.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    tracing::debug!("data connection closed without close_notify");
                    Ok(0)
                }
                Err(error) => Err(error.into()),
            }
        })
        .await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        total += read as u64;
    }
    writer.flush().await?;
    Ok(total)
}

async fn send_line(
    control: &mut tokio::io::BufReader<Stream>,
    line: &str,
) -> Result<(), FtpError> {
    let stream = control.get_mut();
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    Ok(())
}

async fn read_line(
    control: &mut tokio::io::BufReader<Stream>,
    timeout: std::time::Duration,
) -> Result<String, FtpError> {
    let mut buffer = Vec::new();
    let read = with_timeout(timeout, || "waiting for server reply".to_string(), async {
        Ok(control.read_until(b'\n', &mut buffer).await?)
    })
    .await?;
    if read == 0 {
        return Err(FtpError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "control connection closed by server",
        )));
    }
    let line = String::from_utf8_lossy(&buffer);
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_reply(
    control: &mut tokio::io::BufReader<Stream>,
    timeout: std::time::Duration,
) -> Result<Reply, FtpError> {
    let first = read_line(control, timeout).await?;
    let (code, mut continued) = parse_code(&first)?;
    let mut lines = vec![first];
    // a multi-line reply ends with a line starting with the same code followed by a space
    while continued {
        let line = read_line(control, timeout).await?;
        if let Ok((line_code, line_continued)) = parse_code(&line) {
            if line_code == code && !line_continued {
                continued = false;
            }
        }
        lines.push(line);
    }
    Ok(Reply { code, lines })
}

fn expect_reply(command: &str, reply: Reply, expected: &[u16]) -> Result<Reply, FtpError> {
    if expected.contains(&reply.code) {
        Ok(reply)
    } else {
        Err(FtpError::UnexpectedReply {
            command: command.to_string(),
            code: reply.code,
            message: reply.message(),
        })
    }
}

/// What a log line shows for a command; the password never appears.
fn loggable(command: &str) -> &str {
    if command.starts_with("PASS ") {
        "PASS ****"
    } else {
        command
    }
}

impl FtpSession {
    /// Connects, upgrades to TLS as `params.mode` requires, logs in and switches to binary mode.
    #[instrument(skip_all, fields(server = %params.address(), mode = %params.mode))]
    pub async fn connect(params: &ConnectParams) -> Result<Self, FtpError> {
        let tls = match (&params.tls, params.mode.uses_tls()) {
            (Some(config), true) => Some(TlsSetup {
                connector: tokio_rustls::TlsConnector::from(config.clone()),
                server_name: crate::tls::server_name(&params.host)
                    .map_err(|error| FtpError::Protocol(format!("{error:#}")))?,
            }),
            (None, true) => {
                return Err(FtpError::Protocol(format!(
                    "{} requires a TLS configuration",
                    params.mode
                )));
            }
            (_, false) => None,
        };
        let address = params.address();
        let tcp = with_timeout(
            params.timeout,
            || format!("connecting to {address}"),
            async { Ok(TcpStream::connect(address.as_str()).await?) },
        )
        .await?;
        let peer = tcp.peer_addr()?.ip();
        let stream = match &tls {
            Some(tls) if params.mode == ProtocolMode::Implicit => {
                tls_handshake(tls, tcp, params.timeout).await?
            }
            _ => Stream::Plain(tcp),
        };
        let mut control = tokio::io::BufReader::new(stream);
        // 120: service ready in a few minutes, a final greeting follows
        let mut greeting = read_reply(&mut control, params.timeout).await?;
        while greeting.is_positive_preliminary() {
            greeting = read_reply(&mut control, params.timeout).await?;
        }
        tracing::debug!("<- {} {}", greeting.code, greeting.message());
        expect_reply("connect", greeting, &[220])?;
        if let Some(tls) = tls.as_ref().filter(|_| params.mode == ProtocolMode::Explicit) {
            tracing::debug!("-> AUTH TLS");
            send_line(&mut control, "AUTH TLS").await?;
            let reply = read_reply(&mut control, params.timeout).await?;
            expect_reply("AUTH TLS", reply, &[234])?;
            if !control.buffer().is_empty() {
                return Err(FtpError::Protocol(
                    "unexpected data after AUTH TLS reply".to_string(),
                ));
            }
            let tcp = match control.into_inner() {
                Stream::Plain(tcp) => tcp,
                Stream::Tls(_) => {
                    return Err(FtpError::Protocol(
                        "control connection is already encrypted".to_string(),
                    ));
                }
            };
            control = tokio::io::BufReader::new(tls_handshake(tls, tcp, params.timeout).await?);
        }
        let mut session = FtpSession {
            control,
            peer,
            tls,
            protect_data: false,
            mlsd: false,
            epsv: true,
            passive_host_override: params.passive_host_override,
            timeout: params.timeout,
            broken: false,
        };
        session.login(&params.user, &params.password).await?;
        if session.tls.is_some() {
            session.command("PBSZ 0", &[200]).await?;
            session.command("PROT P", &[200]).await?;
            session.protect_data = true;
        }
        session.command("TYPE I", &[200]).await?;
        session.mlsd = session.supports_mlsd().await?;
        tracing::info!(
            "logged in to {} as {:?} ({}, listing with {})",
            address,
            params.user,
            params.mode,
            if session.mlsd { "MLSD" } else { "LIST" }
        );
        Ok(session)
    }

    /// False once a transport or protocol error left the control connection in an unknown state.
    pub fn is_healthy(&self) -> bool {
        !self.broken
    }

    fn track<T>(&mut self, result: Result<T, FtpError>) -> Result<T, FtpError> {
        if let Err(error) = &result {
            if error.breaks_session() {
                self.broken = true;
            }
        }
        result
    }

    async fn send(&mut self, command: &str) -> Result<(), FtpError> {
        tracing::debug!("-> {}", loggable(command));
        send_line(&mut self.control, command).await
    }

    async fn reply(&mut self) -> Result<Reply, FtpError> {
        let reply = read_reply(&mut self.control, self.timeout).await?;
        tracing::debug!("<- {} {}", reply.code, reply.message());
        Ok(reply)
    }

    async fn command(&mut self, command: &str, expected: &[u16]) -> Result<Reply, FtpError> {
        self.send(command).await?;
        let reply = self.reply().await?;
        expect_reply(loggable(command), reply, expected)
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<(), FtpError> {
        // some servers log in on USER alone
        let reply = self.command(&format!("USER {user}"), &[230, 331]).await?;
        if reply.code == 331 {
            self.command(&format!("PASS {password}"), &[230, 202])
                .await?;
        }
        Ok(())
    }

    async fn supports_mlsd(&mut self) -> Result<bool, FtpError> {
        self.send("FEAT").await?;
        let reply = self.reply().await?;
        if reply.code != 211 {
            // FEAT itself is an extension, treat a refusal as "no features"
            return Ok(false);
        }
        Ok(reply
            .lines
            .iter()
            .skip(1)
            .any(|line| line.trim().to_ascii_uppercase().starts_with("MLST")))
    }

    async fn passive_address(&mut self) -> Result<std::net::SocketAddr, FtpError> {
        if self.epsv {
            self.send("EPSV").await?;
            let reply = self.reply().await?;
            if reply.code == 229 {
                let port = parse_epsv_port(&reply.message()).ok_or_else(|| {
                    FtpError::Protocol(format!("malformed EPSV reply {:?}", reply.message()))
                })?;
                return Ok(std::net::SocketAddr::new(self.peer, port));
            }
            tracing::debug!("EPSV refused with {}, falling back to PASV", reply.code);
            self.epsv = false;
        }
        let reply = self.command("PASV", &[227]).await?;
        let advertised = parse_pasv_address(&reply.message()).ok_or_else(|| {
            FtpError::Protocol(format!("malformed PASV reply {:?}", reply.message()))
        })?;
        if self.passive_host_override {
            Ok(std::net::SocketAddr::new(self.peer, advertised.port()))
        } else {
            Ok(std::net::SocketAddr::V4(advertised))
        }
    }

    /// Opens a data connection and issues `command` on it, returning the ready data stream.
    async fn open_transfer(&mut self, command: &str) -> Result<Stream, FtpError> {
        let address = self.passive_address().await?;
        let tcp = with_timeout(
            self.timeout,
            || format!("connecting data connection to {address}"),
            async { Ok(TcpStream::connect(address).await?) },
        )
        .await?;
        self.send(command).await?;
        let reply = self.reply().await?;
        if !reply.is_positive_preliminary() {
            return Err(FtpError::UnexpectedReply {
                command: command.to_string(),
                code: reply.code,
                message: reply.message(),
            });
        }
        match &self.tls {
            Some(tls) if self.protect_data => tls_handshake(tls, tcp, self.timeout).await,
            _ => Ok(Stream::Plain(tcp)),
        }
    }

    /// Drains the data stream into `writer`, closes it and waits for the completion reply.
    async fn finish_transfer<W>(
        &mut self,
        command: &str,
        mut data: Stream,
        writer: &mut W,
    ) -> Result<u64, FtpError>
    where
        W: AsyncWrite + Unpin,
    {
        let protected = matches!(data, Stream::Tls(_));
        let bytes = copy_with_idle_timeout(&mut data, writer, self.timeout, protected).await?;
        if let Err(error) = data.shutdown().await {
            tracing::debug!("closing data connection: {}", error);
        }
        drop(data);
        let reply = self.reply().await?;
        expect_reply(command, reply, &[226, 250])?;
        Ok(bytes)
    }

    async fn list_inner(&mut self, path: &str) -> Result<Vec<RemoteEntry>, FtpError> {
        let command = if self.mlsd {
            format!("MLSD {path}")
        } else {
            format!("LIST {path}")
        };
        let data = self.open_transfer(&command).await?;
        let mut listing = Vec::new();
        self.finish_transfer(&command, data, &mut listing).await?;
        let text = String::from_utf8_lossy(&listing);
        Ok(crate::listing::parse_listing(
            &text,
            self.mlsd,
            chrono::Local::now().date_naive(),
        ))
    }

    /// Lists the entries of the remote directory `path`.
    #[instrument(skip(self))]
    pub async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, FtpError> {
        let result = self.list_inner(path).await;
        self.track(result)
    }

    async fn retrieve_inner<W>(&mut self, path: &str, writer: &mut W) -> Result<u64, FtpError>
    where
        W: AsyncWrite + Unpin,
    {
        let command = format!("RETR {path}");
        let data = self.open_transfer(&command).await?;
        self.finish_transfer(&command, data, writer).await
    }

    /// Downloads the remote file `path` into `writer`, returning the number of bytes received.
    ///
    /// Succeeds only if the data connection reached end of stream and the server confirmed the
    /// transfer.
    #[instrument(skip(self, writer))]
    pub async fn retrieve<W>(&mut self, path: &str, writer: &mut W) -> Result<u64, FtpError>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.retrieve_inner(path, writer).await;
        self.track(result)
    }

    #[instrument(skip(self))]
    pub async fn delete(&mut self, path: &str) -> Result<(), FtpError> {
        let result = self.command(&format!("DELE {path}"), &[250]).await;
        self.track(result).map(|_| ())
    }

    /// Ends the session politely; errors are irrelevant at this point and only logged.
    pub async fn quit(mut self) {
        if self.broken {
            return;
        }
        if let Err(error) = self.command("QUIT", &[221]).await {
            tracing::debug!("QUIT: {}", error);
        }
        if let Err(error) = self.control.get_mut().shutdown().await {
            tracing::debug!("closing control connection: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes() -> anyhow::Result<()> {
        assert_eq!(parse_code("220 Service ready")?, (220, false));
        assert_eq!(parse_code("211-Features:")?, (211, true));
        assert!(parse_code("hello").is_err());
        assert!(parse_code("2x0 nope").is_err());
        Ok(())
    }

    #[test]
    fn reply_message_strips_codes() {
        let reply = Reply {
            code: 211,
            lines: vec![
                "211-Features:".to_string(),
                " MLST type*;size*;modify*;".to_string(),
                "211 End".to_string(),
            ],
        };
        assert_eq!(reply.message(), "Features:\nMLST type*;size*;modify*;\nEnd");
    }

    #[test]
    fn passive_replies() {
        assert_eq!(
            parse_epsv_port("Entering Extended Passive Mode (|||6446|)"),
            Some(6446)
        );
        assert_eq!(parse_epsv_port("Entering Extended Passive Mode"), None);
        assert_eq!(
            parse_pasv_address("Entering Passive Mode (192,168,1,2,19,137)."),
            Some(std::net::SocketAddrV4::new(
                std::net::Ipv4Addr::new(192, 168, 1, 2),
                19 * 256 + 137
            ))
        );
        assert_eq!(
            parse_pasv_address("Entering Passive Mode 10,0,0,1,4,1"),
            Some(std::net::SocketAddrV4::new(
                std::net::Ipv4Addr::new(10, 0, 0, 1),
                1025
            ))
        );
        assert_eq!(parse_pasv_address("Entering Passive Mode (1,2,3)"), None);
    }

    #[test]
    fn transport_errors_break_the_session() {
        let reset = FtpError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.breaks_session());
        assert!(FtpError::Timeout("waiting for data".to_string()).breaks_session());
        let missing = FtpError::UnexpectedReply {
            command: "RETR /out/a.csv".to_string(),
            code: 550,
            message: "No such file".to_string(),
        };
        assert!(!missing.breaks_session());
        let closing = FtpError::UnexpectedReply {
            command: "RETR /out/a.csv".to_string(),
            code: 421,
            message: "Timeout".to_string(),
        };
        assert!(closing.breaks_session());
    }

    #[test]
    fn password_is_never_logged() {
        assert_eq!(loggable("PASS s3cret"), "PASS ****");
        assert_eq!(loggable("USER batch"), "USER batch");
    }
}
