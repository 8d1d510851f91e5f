//! Server side of one authenticated client session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, watch},
};

use crate::gangway::{
    telemetry,
    tunnel::{
        crypto::{self, CipherKey, CipherStream},
        dispatch::{self, Proxy, ProxyBase, ProxyContext, ProxyError, ProxyInfo, ProxyKind},
        manager::{ChangeFeed, ClientManager},
        pool::{self, PoolError, WorkConnPool},
        protocol::{
            self, LOGIN_STATUS_OK, Login, LoginResp, MAX_CONTROL_FRAME_BYTES, Message, NewProxy,
            NewProxyResp, ProtocolError,
        },
        transport::BoxedStream,
    },
};

pub const SEND_QUEUE_CAPACITY: usize = 10;
pub const RECV_QUEUE_CAPACITY: usize = 10;
pub const PING_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("session closed")]
    Closed,
    #[error("login rejected: {0}")]
    Login(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server-wide settings every session shares.
#[derive(Clone)]
pub struct SessionShared {
    pub ctx: ProxyContext,
    pub ping_timeout: Duration,
    pub acquire_timeout: Duration,
    pub encrypt_control: bool,
    pub changes: Arc<ChangeFeed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub id: String,
    pub user: String,
    pub hostname: String,
    pub remote: String,
    pub started_at_unix_ms: u64,
    pub pool_size: usize,
    pub idle_work_conns: usize,
    pub proxies: Vec<ProxyInfo>,
}

pub struct ClientCtrl {
    id: String,
    user: String,
    hostname: String,
    remote: String,
    started_at_unix_ms: u64,
    key: CipherKey,
    pool: Arc<WorkConnPool>,
    send_tx: mpsc::Sender<Message>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    proxies: RwLock<HashMap<String, Arc<dyn Proxy>>>,
    closed: watch::Sender<bool>,
    shared: SessionShared,
}

impl std::fmt::Debug for ClientCtrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCtrl")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl ClientCtrl {
    pub fn new(
        id: String,
        login: &Login,
        token: &str,
        remote: String,
        pool_count: usize,
        shared: SessionShared,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            user: login.user.clone(),
            hostname: login.hostname.clone(),
            remote,
            started_at_unix_ms: telemetry::now_unix_ms(),
            key: crypto::derive_key(token),
            pool: Arc::new(WorkConnPool::new(pool_count, send_tx.clone())),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            proxies: RwLock::new(HashMap::new()),
            closed,
            shared,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn pool(&self) -> &Arc<WorkConnPool> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Asks the session loop to stop; teardown happens there.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Hands a freshly announced work connection to this session's pool.
    pub fn offer_work_conn(&self, conn: BoxedStream) {
        match self.pool.offer(conn) {
            Ok(()) => {
                tracing::debug!(cid=%self.id, idle=self.pool.idle(), "tunnel: work connection pooled");
            }
            Err(PoolError::Saturated) => {
                tracing::warn!(cid=%self.id, "tunnel: work connection pool overflow; closing session");
                self.close();
            }
            Err(err) => {
                tracing::debug!(cid=%self.id, err=%err, "tunnel: dropping work connection");
            }
        }
    }

    pub fn proxy_infos(&self) -> Vec<ProxyInfo> {
        let proxies = self.proxies.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<ProxyInfo> = proxies.values().map(|p| p.describe()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            id: self.id.clone(),
            user: self.user.clone(),
            hostname: self.hostname.clone(),
            remote: self.remote.clone(),
            started_at_unix_ms: self.started_at_unix_ms,
            pool_size: self.pool.size(),
            idle_work_conns: self.pool.idle(),
            proxies: self.proxy_infos(),
        }
    }

    /// Drives the session on `conn` until it ends, then releases everything
    /// it owns. Returns why the session ended.
    pub async fn run(self: &Arc<Self>, conn: TcpStream, manager: &ClientManager) -> SessionError {
        let reason = self.serve(conn).await;
        self.teardown(manager);
        reason
    }

    async fn serve(self: &Arc<Self>, mut conn: TcpStream) -> SessionError {
        let resp = Message::LoginResp(LoginResp {
            client_id: self.id.clone(),
            status: LOGIN_STATUS_OK,
            error: String::new(),
        });
        if let Err(err) = protocol::write_msg(&mut conn, &resp).await {
            return err.into();
        }

        let send_rx = self
            .send_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(send_rx) = send_rx else {
            return SessionError::Closed;
        };

        let stream: BoxedStream = if self.shared.encrypt_control {
            Box::new(CipherStream::new(conn, &self.key))
        } else {
            Box::new(conn)
        };
        let (rd, wr) = tokio::io::split(stream);

        let (recv_tx, mut recv_rx) = mpsc::channel(RECV_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_loop(rd, recv_tx));
        let mut writer = tokio::spawn(write_loop(wr, send_rx));

        let fill = {
            let tx = self.send_tx.clone();
            let n = self.pool.size();
            tokio::spawn(async move {
                for _ in 0..n {
                    if tx.send(Message::ReqWorkConn).await.is_err() {
                        return;
                    }
                }
            })
        };

        let mut closed = self.closed.subscribe();
        let mut check = tokio::time::interval(PING_CHECK_INTERVAL);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_ping = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = pool::wait_closed(&mut closed) => break SessionError::Closed,
                _ = check.tick() => {
                    let idle = last_ping.elapsed();
                    if idle > self.shared.ping_timeout {
                        break SessionError::HeartbeatTimeout(idle);
                    }
                }
                res = &mut writer => break match res {
                    Ok(Err(err)) => err.into(),
                    _ => SessionError::Closed,
                },
                msg = recv_rx.recv() => match msg {
                    None => break SessionError::Closed,
                    Some(Err(err)) => break err.into(),
                    Some(Ok(msg)) => {
                        if let Err(err) = self.handle(msg, &mut last_ping).await {
                            break err;
                        }
                    }
                },
            }
        };

        fill.abort();
        reader.abort();
        writer.abort();
        reason
    }

    async fn handle(&self, msg: Message, last_ping: &mut Instant) -> Result<(), SessionError> {
        match msg {
            Message::NewProxy(def) => {
                let resp = self.register_proxy(def).await;
                self.enqueue(Message::NewProxyResp(resp)).await
            }
            Message::Ping => {
                *last_ping = Instant::now();
                self.enqueue(Message::Pong).await
            }
            other => {
                tracing::debug!(cid=%self.id, msg_type=?other.msg_type(), "tunnel: ignoring unexpected control message");
                Ok(())
            }
        }
    }

    async fn enqueue(&self, msg: Message) -> Result<(), SessionError> {
        self.send_tx
            .send_timeout(msg, self.shared.ping_timeout)
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn register_proxy(&self, def: NewProxy) -> NewProxyResp {
        let name = def.proxy_name.trim().to_string();
        match self.try_register_proxy(&def).await {
            Ok(port) => NewProxyResp {
                proxy_name: name,
                remote_port: port,
                error: String::new(),
            },
            Err(err) => {
                tracing::warn!(cid=%self.id, proxy=%name, err=%err, "tunnel: proxy registration failed");
                NewProxyResp {
                    proxy_name: name,
                    remote_port: 0,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn try_register_proxy(&self, def: &NewProxy) -> Result<u16, ProxyError> {
        let name = def.proxy_name.trim();
        if name.is_empty() {
            return Err(ProxyError::EmptyName);
        }
        if self
            .proxies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
        {
            return Err(ProxyError::Duplicate(name.to_string()));
        }

        let kind = ProxyKind::parse(&def.proxy_type)
            .ok_or_else(|| ProxyError::UnsupportedType(def.proxy_type.clone()))?;
        let base = Arc::new(ProxyBase::new(
            def,
            kind,
            &self.id,
            self.pool.clone(),
            self.key,
            self.shared.acquire_timeout,
        ));
        let proxy = dispatch::build_proxy(def, base, &self.shared.ctx)?;
        let port = proxy.run().await?;

        // The session may have ended while the listener was binding.
        if self.is_closed() {
            proxy.close();
            return Err(ProxyError::Pool(PoolError::Closed));
        }

        self.proxies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), proxy);
        metrics::gauge!("gangway_active_proxies", "type" => kind.as_str()).increment(1.0);
        tracing::info!(cid=%self.id, proxy=%name, kind=%kind, port, "tunnel: proxy activated");
        self.shared.changes.bump();
        Ok(port)
    }

    fn teardown(self: &Arc<Self>, manager: &ClientManager) {
        self.closed.send_replace(true);
        self.pool.close();

        let proxies: Vec<Arc<dyn Proxy>> = self
            .proxies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, p)| p)
            .collect();
        for p in proxies {
            p.close();
            metrics::gauge!("gangway_active_proxies", "type" => p.base().kind.as_str())
                .decrement(1.0);
        }

        manager.remove(&self.id, self);
        self.shared.changes.bump();
    }
}

/// Forwards decoded frames until the first error, which is forwarded too.
pub(crate) async fn read_loop<R>(mut rd: R, tx: mpsc::Sender<Result<Message, ProtocolError>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let res = protocol::read_msg_bounded(&mut rd, MAX_CONTROL_FRAME_BYTES).await;
        let stop = res.is_err();
        if tx.send(res).await.is_err() || stop {
            return;
        }
    }
}

pub(crate) async fn write_loop<W>(mut wr: W, mut rx: mpsc::Receiver<Message>) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        protocol::write_msg(&mut wr, &msg).await?;
    }
    let _ = wr.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    use crate::gangway::tunnel::{pool::POOL_HEADROOM, ports::PortAllocator};

    fn shared(ports: Arc<PortAllocator>, changes: Arc<ChangeFeed>) -> SessionShared {
        SessionShared {
            ctx: ProxyContext {
                ports,
                bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                http_router: None,
                https_router: None,
            },
            ping_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(1),
            encrypt_control: false,
            changes,
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(ln.local_addr().unwrap()).await.unwrap();
        let (server, _) = ln.accept().await.unwrap();
        (server, client)
    }

    fn idle_conn() -> BoxedStream {
        Box::new(tokio::io::duplex(64).0)
    }

    #[tokio::test]
    async fn pool_overflow_tears_the_session_down() {
        let ports = Arc::new(PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 32800, 32900));
        let manager = Arc::new(ClientManager::new());
        let login = Login {
            user: "alice".into(),
            ..Default::default()
        };
        let ctrl = manager.register("", |id| {
            ClientCtrl::new(id, &login, "s3cret", "test".into(), 1, shared(ports.clone(), manager.changes()))
        });

        let (server_side, mut client_side) = tcp_pair().await;
        let session = {
            let ctrl = ctrl.clone();
            let manager = manager.clone();
            tokio::spawn(async move { ctrl.run(server_side, &manager).await })
        };

        match protocol::read_msg(&mut client_side).await.unwrap() {
            Message::LoginResp(r) => assert_eq!(r.client_id, ctrl.id()),
            other => panic!("unexpected: {other:?}"),
        }
        let def = NewProxy {
            proxy_name: "ssh".into(),
            proxy_type: "tcp".into(),
            ..Default::default()
        };
        protocol::write_msg(&mut client_side, &Message::NewProxy(def))
            .await
            .unwrap();
        let port = loop {
            match protocol::read_msg(&mut client_side).await.unwrap() {
                Message::NewProxyResp(r) => {
                    assert!(r.error.is_empty(), "{}", r.error);
                    break r.remote_port;
                }
                Message::ReqWorkConn => continue,
                other => panic!("unexpected: {other:?}"),
            }
        };
        assert_eq!(ports.owner(port).as_deref(), Some("ssh"));
        assert_eq!(manager.len(), 1);

        for _ in 0..1 + POOL_HEADROOM {
            ctrl.offer_work_conn(idle_conn());
        }
        assert!(!ctrl.is_closed());
        ctrl.offer_work_conn(idle_conn());

        let reason = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, SessionError::Closed));
        assert!(manager.is_empty());
        assert!(ctrl.proxy_infos().is_empty());
        assert!(ports.owner(port).is_none());
        assert!(ports.leases().is_empty());
    }
}
