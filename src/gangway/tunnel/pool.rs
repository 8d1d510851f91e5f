use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};

use crate::gangway::tunnel::{protocol::Message, transport::BoxedStream};

/// Extra slots beyond the requested pool size; replenishment may overshoot.
pub const POOL_HEADROOM: usize = 10;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("work connection pool: timed out waiting for a connection")]
    Timeout,
    #[error("work connection pool: full")]
    Saturated,
    #[error("work connection pool: closed")]
    Closed,
}

/// Spare work connections for one client session.
///
/// Connections are requested from the client by pushing `ReqWorkConn` onto
/// the session's outbound queue.
pub struct WorkConnPool {
    size: usize,
    tx: mpsc::Sender<BoxedStream>,
    rx: Mutex<mpsc::Receiver<BoxedStream>>,
    control: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for WorkConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkConnPool")
            .field("size", &self.size)
            .field("idle", &self.idle())
            .finish_non_exhaustive()
    }
}

impl WorkConnPool {
    pub fn new(size: usize, control: mpsc::Sender<Message>) -> Self {
        let (tx, rx) = mpsc::channel(size + POOL_HEADROOM);
        let (closed, _) = watch::channel(false);
        Self {
            size,
            tx,
            rx: Mutex::new(rx),
            control,
            closed,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Non-blocking insert. A full pool means the client is sending more than
    /// it was asked for; the caller tears the session down.
    pub fn offer(&self, conn: BoxedStream) -> Result<(), PoolError> {
        if *self.closed.borrow() {
            return Err(PoolError::Closed);
        }
        self.tx.try_send(conn).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PoolError::Saturated,
            mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
        })
    }

    /// Best-effort top-up after a take. A full control queue skips it; the
    /// next acquire that finds the pool empty asks again.
    pub fn replenish(&self) -> Result<(), PoolError> {
        match self.control.try_send(Message::ReqWorkConn) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("tunnel: control queue full; skipping replenish request");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PoolError::Closed),
        }
    }

    /// Takes an idle connection, or requests one and waits up to `wait`.
    /// The request itself counts against `wait`. Every successful acquire
    /// requests a replacement.
    pub async fn acquire(&self, wait: Duration) -> Result<BoxedStream, PoolError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(PoolError::Closed);
        }

        let take = async {
            let mut rx = self.rx.lock().await;
            match rx.try_recv() {
                Ok(conn) => return Ok(conn),
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(PoolError::Closed),
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            self.control
                .send(Message::ReqWorkConn)
                .await
                .map_err(|_| PoolError::Closed)?;
            rx.recv().await.ok_or(PoolError::Closed)
        };

        let conn = tokio::select! {
            res = tokio::time::timeout(wait, take) => match res {
                Ok(res) => res?,
                Err(_) => {
                    metrics::counter!("gangway_work_conn_timeouts_total").increment(1);
                    return Err(PoolError::Timeout);
                }
            },
            _ = wait_closed(&mut closed) => return Err(PoolError::Closed),
        };

        metrics::counter!("gangway_work_conn_acquired_total").increment(1);
        if let Err(err) = self.replenish() {
            tracing::debug!(err=%err, "tunnel: replenish request failed");
        }
        Ok(conn)
    }

    /// Fails pending and future acquires and drops idle connections.
    pub fn close(&self) {
        self.closed.send_replace(true);
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }
}

/// Resolves once the flag behind `rx` turns true or its sender is gone.
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}
