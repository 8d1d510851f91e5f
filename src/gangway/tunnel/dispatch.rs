//! Registered proxies: the shared state every proxy carries plus the three
//! ways traffic reaches one (dedicated TCP listener, or an entry in the shared
//! HTTP / HTTPS front-end routers).

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use crate::gangway::{
    router::{HostRouter, RouterError},
    telemetry,
    tunnel::{
        bridge,
        crypto::{CipherKey, CipherStream},
        pool::{PoolError, WorkConnPool},
        ports::{PortAllocator, PortError},
        protocol::{self, Message, NewProxy, StartWork},
        transport::BoxedStream,
    },
};

pub type ProxyRouter = HostRouter<Arc<ProxyBase>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Tcp,
    Http,
    Https,
}

impl ProxyKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Some(ProxyKind::Tcp),
            "http" => Some(ProxyKind::Http),
            "https" => Some(ProxyKind::Https),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyKind::Tcp => "tcp",
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported proxy type {0:?}")]
    UnsupportedType(String),
    #[error("proxy name is empty")]
    EmptyName,
    #[error("proxy {0} is already registered")]
    Duplicate(String),
    #[error("{0} proxies are not enabled on this server")]
    FrontendDisabled(ProxyKind),
    #[error("{0} proxy requires a domain")]
    MissingDomain(ProxyKind),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("no usable work connection after {0} attempts")]
    NoWorkConn(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Fields every proxy variant shares.
pub struct ProxyBase {
    pub name: String,
    pub kind: ProxyKind,
    pub encrypt: bool,
    pub client_id: String,
    /// Host header presented to the client-side service; empty keeps the original.
    pub host_rewrite: String,
    pool: Arc<WorkConnPool>,
    key: CipherKey,
    acquire_timeout: Duration,
}

impl std::fmt::Debug for ProxyBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyBase")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ProxyBase {
    pub fn new(
        def: &NewProxy,
        kind: ProxyKind,
        client_id: &str,
        pool: Arc<WorkConnPool>,
        key: CipherKey,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            name: def.proxy_name.trim().to_string(),
            kind,
            encrypt: def.encrypt,
            client_id: client_id.to_string(),
            host_rewrite: def.host.trim().to_string(),
            pool,
            key,
            acquire_timeout,
        }
    }

    /// Takes a pooled work connection and announces this proxy on it.
    ///
    /// Pooled connections may have died while idle, so a failed StartWork
    /// write is retried with another one, up to `pool size + 1` times.
    pub async fn get_work_conn(&self) -> Result<BoxedStream, ProxyError> {
        let attempts = self.pool.size() + 1;
        for attempt in 1..=attempts {
            let mut conn = self.pool.acquire(self.acquire_timeout).await?;

            let start = Message::StartWork(StartWork {
                proxy_name: self.name.clone(),
            });
            if let Err(err) = protocol::write_msg(&mut conn, &start).await {
                tracing::debug!(proxy=%self.name, attempt, err=%err, "tunnel: stale work connection; retrying");
                continue;
            }

            if self.encrypt {
                return Ok(Box::new(CipherStream::new(conn, &self.key)));
            }
            return Ok(conn);
        }
        Err(ProxyError::NoWorkConn(attempts))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub client_id: String,
    pub encrypt: bool,
    pub remote_port: u16,
    pub domain: String,
    pub url_prefix: String,
}

#[async_trait]
pub trait Proxy: Send + Sync {
    fn base(&self) -> &Arc<ProxyBase>;

    /// Activates the proxy and returns the bound remote port (0 when routed
    /// through a shared front end).
    async fn run(&self) -> Result<u16, ProxyError>;

    /// Reverses exactly what a successful `run` did. Safe to call repeatedly.
    fn close(&self);

    async fn get_work_conn(&self) -> Result<BoxedStream, ProxyError> {
        self.base().get_work_conn().await
    }

    fn describe(&self) -> ProxyInfo;
}

/// Server-wide resources proxies activate against.
#[derive(Clone)]
pub struct ProxyContext {
    pub ports: Arc<PortAllocator>,
    pub bind_ip: IpAddr,
    /// `None` when the corresponding front end is disabled.
    pub http_router: Option<Arc<ProxyRouter>>,
    pub https_router: Option<Arc<ProxyRouter>>,
}

pub fn build_proxy(
    def: &NewProxy,
    base: Arc<ProxyBase>,
    ctx: &ProxyContext,
) -> Result<Arc<dyn Proxy>, ProxyError> {
    match base.kind {
        ProxyKind::Tcp => Ok(Arc::new(TcpProxy {
            base,
            requested_port: def.remote_port,
            ports: ctx.ports.clone(),
            bind_ip: ctx.bind_ip,
            listening: Mutex::new(None),
        })),
        ProxyKind::Http => {
            let router = ctx
                .http_router
                .clone()
                .ok_or(ProxyError::FrontendDisabled(ProxyKind::Http))?;
            Ok(Arc::new(HttpProxy {
                slot: RouteSlot::new(router, &def.domain, &def.url),
                base,
            }))
        }
        ProxyKind::Https => {
            let router = ctx
                .https_router
                .clone()
                .ok_or(ProxyError::FrontendDisabled(ProxyKind::Https))?;
            Ok(Arc::new(HttpsProxy {
                slot: RouteSlot::new(router, &def.domain, "/"),
                base,
            }))
        }
    }
}

struct Listening {
    port: u16,
    task: JoinHandle<()>,
}

pub struct TcpProxy {
    base: Arc<ProxyBase>,
    requested_port: u16,
    ports: Arc<PortAllocator>,
    bind_ip: IpAddr,
    listening: Mutex<Option<Listening>>,
}

impl TcpProxy {
    fn release(&self, listening: Listening) {
        listening.task.abort();
        self.ports.release(listening.port);
    }
}

#[async_trait]
impl Proxy for TcpProxy {
    fn base(&self) -> &Arc<ProxyBase> {
        &self.base
    }

    async fn run(&self) -> Result<u16, ProxyError> {
        let port = self.ports.acquire(&self.base.name, self.requested_port)?;
        let ln = match TcpListener::bind(SocketAddr::new(self.bind_ip, port)).await {
            Ok(ln) => ln,
            Err(err) => {
                self.ports.release(port);
                return Err(err.into());
            }
        };

        tracing::info!(proxy=%self.base.name, cid=%self.base.client_id, port, "tunnel: tcp proxy listening");

        let task = tokio::spawn(accept_loop(ln, self.base.clone()));
        let prev = self
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Listening { port, task });
        if let Some(prev) = prev {
            self.release(prev);
        }
        Ok(port)
    }

    fn close(&self) {
        let listening = self
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(l) = listening {
            self.release(l);
        }
    }

    fn describe(&self) -> ProxyInfo {
        let port = self
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|l| l.port)
            .unwrap_or(0);
        ProxyInfo {
            name: self.base.name.clone(),
            kind: self.base.kind,
            client_id: self.base.client_id.clone(),
            encrypt: self.base.encrypt,
            remote_port: port,
            domain: String::new(),
            url_prefix: String::new(),
        }
    }
}

async fn accept_loop(ln: TcpListener, base: Arc<ProxyBase>) {
    loop {
        let (conn, peer) = match ln.accept().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(proxy=%base.name, err=%err, "tunnel: accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let base = base.clone();
        tokio::spawn(async move {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(proxy=%base.name, client=%peer, "tcp: accepted");
            }
            serve_tcp_conn(base, conn).await;
        });
    }
}

async fn serve_tcp_conn(base: Arc<ProxyBase>, user: TcpStream) {
    let _active = telemetry::ActiveConnGuard::new("tcp");
    let _ = user.set_nodelay(true);

    let work = match base.get_work_conn().await {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(proxy=%base.name, cid=%base.client_id, err=%err, "tunnel: no work connection");
            return;
        }
    };

    let (ingress, egress) = bridge::bridge(user, work).await;
    telemetry::record_bridged(ingress, egress);
}

/// A router entry owned by one proxy.
struct RouteSlot {
    router: Arc<ProxyRouter>,
    domain: String,
    prefix: String,
    registered: AtomicBool,
}

impl RouteSlot {
    fn new(router: Arc<ProxyRouter>, domain: &str, prefix: &str) -> Self {
        let prefix = prefix.trim();
        Self {
            router,
            domain: crate::gangway::router::normalize_domain(domain),
            prefix: if prefix.is_empty() { "/".into() } else { prefix.into() },
            registered: AtomicBool::new(false),
        }
    }

    fn register(&self, base: &Arc<ProxyBase>) -> Result<(), ProxyError> {
        if self.domain.is_empty() {
            return Err(ProxyError::MissingDomain(base.kind));
        }
        self.router.register(&self.domain, &self.prefix, base.clone())?;
        self.registered.store(true, Ordering::SeqCst);
        tracing::info!(proxy=%base.name, cid=%base.client_id, domain=%self.domain, prefix=%self.prefix, kind=%base.kind, "tunnel: route registered");
        Ok(())
    }

    fn unregister(&self, base: &Arc<ProxyBase>) {
        if self.registered.swap(false, Ordering::SeqCst) {
            self.router
                .remove_if(&self.domain, &self.prefix, |v| Arc::ptr_eq(v, base));
        }
    }

    fn describe(&self, base: &ProxyBase) -> ProxyInfo {
        ProxyInfo {
            name: base.name.clone(),
            kind: base.kind,
            client_id: base.client_id.clone(),
            encrypt: base.encrypt,
            remote_port: 0,
            domain: self.domain.clone(),
            url_prefix: self.prefix.clone(),
        }
    }
}

/// Served by the shared HTTP front end, keyed by domain and URL prefix.
pub struct HttpProxy {
    base: Arc<ProxyBase>,
    slot: RouteSlot,
}

#[async_trait]
impl Proxy for HttpProxy {
    fn base(&self) -> &Arc<ProxyBase> {
        &self.base
    }

    async fn run(&self) -> Result<u16, ProxyError> {
        self.slot.register(&self.base)?;
        Ok(0)
    }

    fn close(&self) {
        self.slot.unregister(&self.base);
    }

    fn describe(&self) -> ProxyInfo {
        self.slot.describe(&self.base)
    }
}

/// Served by the shared HTTPS front end, keyed by SNI domain only.
pub struct HttpsProxy {
    base: Arc<ProxyBase>,
    slot: RouteSlot,
}

#[async_trait]
impl Proxy for HttpsProxy {
    fn base(&self) -> &Arc<ProxyBase> {
        &self.base
    }

    async fn run(&self) -> Result<u16, ProxyError> {
        self.slot.register(&self.base)?;
        Ok(0)
    }

    fn close(&self) {
        self.slot.unregister(&self.base);
    }

    fn describe(&self) -> ProxyInfo {
        self.slot.describe(&self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::mpsc,
    };

    use crate::gangway::tunnel::crypto::derive_key;

    fn context(http: bool) -> ProxyContext {
        ProxyContext {
            ports: Arc::new(PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 20000, 20100)),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            http_router: http.then(|| Arc::new(ProxyRouter::new())),
            https_router: None,
        }
    }

    fn base(def: &NewProxy, pool: Arc<WorkConnPool>) -> Arc<ProxyBase> {
        let kind = ProxyKind::parse(&def.proxy_type).unwrap();
        Arc::new(ProxyBase::new(
            def,
            kind,
            "cid",
            pool,
            derive_key("token"),
            Duration::from_millis(300),
        ))
    }

    #[test]
    fn parses_kinds() {
        assert_eq!(ProxyKind::parse(" HTTP "), Some(ProxyKind::Http));
        assert_eq!(ProxyKind::parse(""), Some(ProxyKind::Tcp));
        assert_eq!(ProxyKind::parse("udp"), None);
    }

    #[tokio::test]
    async fn work_conn_skips_dead_pooled_connections() {
        let (ctl_tx, _ctl_rx) = mpsc::channel(16);
        let pool = Arc::new(WorkConnPool::new(2, ctl_tx));

        let (dead, peer) = tokio::io::duplex(1024);
        drop(peer);
        pool.offer(Box::new(dead)).unwrap();
        let (live, mut client_side) = tokio::io::duplex(1024);
        pool.offer(Box::new(live)).unwrap();

        let def = NewProxy {
            proxy_name: "ssh".into(),
            proxy_type: "tcp".into(),
            ..Default::default()
        };
        let b = base(&def, pool);
        let mut conn = b.get_work_conn().await.unwrap();

        let msg = protocol::read_msg(&mut client_side).await.unwrap();
        assert_eq!(
            msg,
            Message::StartWork(StartWork {
                proxy_name: "ssh".into()
            })
        );
        conn.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn http_conflict_and_close_reverses_only_own_entry() {
        let ctx = context(true);
        let (ctl_tx, _ctl_rx) = mpsc::channel(16);
        let pool = Arc::new(WorkConnPool::new(1, ctl_tx));

        let def = NewProxy {
            proxy_name: "web".into(),
            proxy_type: "http".into(),
            domain: "example.com".into(),
            url: "/api".into(),
            ..Default::default()
        };
        let first = build_proxy(&def, base(&def, pool.clone()), &ctx).unwrap();
        assert_eq!(first.run().await.unwrap(), 0);

        let dup = NewProxy {
            proxy_name: "web2".into(),
            ..def.clone()
        };
        let second = build_proxy(&dup, base(&dup, pool), &ctx).unwrap();
        assert!(matches!(
            second.run().await,
            Err(ProxyError::Router(RouterError::Conflict { .. }))
        ));

        second.close();
        let router = ctx.http_router.as_ref().unwrap();
        assert_eq!(router.get("example.com", "/api/v1").unwrap().name, "web");

        first.close();
        first.close();
        assert!(router.get("example.com", "/api/v1").is_none());
    }

    #[tokio::test]
    async fn disabled_front_end_is_reported() {
        let ctx = context(false);
        let (ctl_tx, _ctl_rx) = mpsc::channel(16);
        let pool = Arc::new(WorkConnPool::new(1, ctl_tx));
        let def = NewProxy {
            proxy_name: "web".into(),
            proxy_type: "http".into(),
            domain: "example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            build_proxy(&def, base(&def, pool), &ctx),
            Err(ProxyError::FrontendDisabled(ProxyKind::Http))
        ));
    }

    #[tokio::test]
    async fn tcp_close_releases_port() {
        let ctx = context(false);
        let (ctl_tx, _ctl_rx) = mpsc::channel(16);
        let pool = Arc::new(WorkConnPool::new(1, ctl_tx));
        let def = NewProxy {
            proxy_name: "ssh".into(),
            proxy_type: "tcp".into(),
            ..Default::default()
        };
        let proxy = build_proxy(&def, base(&def, pool), &ctx).unwrap();
        let port = proxy.run().await.unwrap();
        assert_eq!(ctx.ports.owner(port).as_deref(), Some("ssh"));
        assert_eq!(proxy.describe().remote_port, port);

        proxy.close();
        assert_eq!(ctx.ports.owner(port), None);
        assert_eq!(proxy.describe().remote_port, 0);
    }
}
