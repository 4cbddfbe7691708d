//! A bounded pool of sessions shared by the lister and the download workers.
//!
//! An FTP control connection carries one command at a time, so concurrent transfers need one
//! session each. Sessions are opened lazily up to the pool's capacity and handed back on drop of
//! the [`PooledSession`] guard. A session that reports itself unhealthy is discarded instead,
//! freeing its slot for a replacement.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::retry::RetryPolicy;
use crate::session::{Connector, Session};

pub struct SessionPool<C: Connector> {
    connector: C,
    retry: RetryPolicy,
    capacity: usize,
    idle_tx: async_channel::Sender<C::Session>,
    idle_rx: async_channel::Receiver<C::Session>,
    // sessions in existence, idle or checked out, plus slots reserved by a connect in progress
    open: AtomicUsize,
    discarded: tokio::sync::Notify,
    closed: AtomicBool,
}

impl<C: Connector> std::fmt::Debug for SessionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("server", &self.connector.describe())
            .field("capacity", &self.capacity)
            .field("open", &self.open.load(Ordering::SeqCst))
            .field("idle", &self.idle_rx.len())
            .finish()
    }
}

impl<C: Connector> SessionPool<C> {
    /// Opens the first session (with retry) and returns a pool of up to `capacity` sessions.
    pub async fn connect(
        connector: C,
        retry: RetryPolicy,
        capacity: usize,
    ) -> anyhow::Result<Arc<Self>> {
        let capacity = capacity.max(1);
        let (idle_tx, idle_rx) = async_channel::bounded(capacity);
        let pool = Arc::new(Self {
            connector,
            retry,
            capacity,
            idle_tx,
            idle_rx,
            open: AtomicUsize::new(1),
            discarded: tokio::sync::Notify::new(),
            closed: AtomicBool::new(false),
        });
        let session = pool.open_session().await?;
        if pool.idle_tx.try_send(session).is_err() {
            return Err(anyhow::anyhow!("session pool closed while connecting"));
        }
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    async fn open_session(&self) -> anyhow::Result<C::Session> {
        let what = format!("connect to {}", self.connector.describe());
        self.retry
            .run(&what, |attempt| {
                tracing::info!(
                    "connecting to {} (attempt {})",
                    self.connector.describe(),
                    attempt
                );
                self.connector.connect()
            })
            .await
    }

    fn try_reserve_slot(&self) -> bool {
        self.open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < self.capacity).then_some(open + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.discarded.notify_one();
    }

    /// Returns an idle session, opens a new one while below capacity, or waits for one to be
    /// returned.
    ///
    /// Fails when the pool is closed, or when a replacement session cannot be opened and no
    /// other session exists to wait for.
    pub async fn checkout(self: &Arc<Self>) -> anyhow::Result<PooledSession<C>> {
        let mut may_open = true;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("session pool is closed"));
            }
            if let Ok(session) = self.idle_rx.try_recv() {
                return Ok(PooledSession::new(self, session));
            }
            if may_open && self.try_reserve_slot() {
                match self.open_session().await {
                    Ok(session) => return Ok(PooledSession::new(self, session)),
                    Err(error) => {
                        self.release_slot();
                        if self.open_sessions() == 0 {
                            return Err(error);
                        }
                        tracing::warn!(
                            "could not open an additional session, waiting for an existing one: {:#}",
                            error
                        );
                        may_open = false;
                        continue;
                    }
                }
            }
            if !may_open && self.open_sessions() == 0 {
                // every other session has been discarded meanwhile
                may_open = true;
                continue;
            }
            tokio::select! {
                session = self.idle_rx.recv() => match session {
                    Ok(session) => return Ok(PooledSession::new(self, session)),
                    Err(_) => return Err(anyhow::anyhow!("session pool is closed")),
                },
                _ = self.discarded.notified() => {}
            }
        }
    }

    fn give_back(&self, session: C::Session) {
        if !session.is_healthy() {
            tracing::warn!("discarding broken session to {}", self.connector.describe());
            self.release_slot();
            return;
        }
        if self.closed.load(Ordering::SeqCst) {
            self.release_slot();
            return;
        }
        if let Err(error) = self.idle_tx.try_send(session) {
            tracing::debug!("could not return session to the pool: {}", error);
            self.release_slot();
        }
    }

    /// Ends every idle session with `QUIT`. Sessions still checked out are dropped on return.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut closed = 0;
        while let Ok(session) = self.idle_rx.try_recv() {
            session.quit().await;
            self.open.fetch_sub(1, Ordering::SeqCst);
            closed += 1;
        }
        self.idle_rx.close();
        tracing::debug!(
            "closed {} session(s) to {}",
            closed,
            self.connector.describe()
        );
    }
}

/// A checked out session, returned to its pool on drop.
pub struct PooledSession<C: Connector> {
    session: Option<C::Session>,
    pool: Arc<SessionPool<C>>,
}

impl<C: Connector> PooledSession<C> {
    fn new(pool: &Arc<SessionPool<C>>, session: C::Session) -> Self {
        Self {
            session: Some(session),
            pool: pool.clone(),
        }
    }

    pub fn session(&mut self) -> anyhow::Result<&mut C::Session> {
        self.session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("session already returned to the pool"))
    }
}

impl<C: Connector> Drop for PooledSession<C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session);
        }
    }
}
