//! Remote side of `rpull`: an FTP/FTPS client, listing parsers and a pool of sessions.
//!
//! The pipeline depends only on the [`session::Connector`] and [`session::Session`] traits;
//! [`session::FtpConnector`] is the production implementation.

pub mod ftp;
pub mod listing;
pub mod pool;
pub mod retry;
pub mod session;
pub mod tls;

pub use listing::RemoteEntry;
pub use pool::{PooledSession, SessionPool};
pub use retry::RetryPolicy;
pub use session::{Connector, FtpConnector, Session};
