use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};

use crate::gangway::{
    proxy,
    telemetry,
    tunnel::{
        control::{ClientCtrl, SessionError, SessionShared},
        crypto,
        dispatch::{ProxyContext, ProxyRouter},
        manager::ClientManager,
        ports::PortAllocator,
        protocol::{self, Login, LoginResp, MAX_CONTROL_FRAME_BYTES, Message},
    },
};

/// Largest work-connection pool a client may ask for.
pub const MAX_POOL_COUNT: usize = 64;

/// Deadline for the first frame on a fresh connection.
pub const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization timeout")]
    Expired,
    #[error("user {0:?} not found")]
    UnknownUser(String),
    #[error("authorization failed")]
    BadSignature,
}

/// Resolves a user name to its shared token.
pub trait TokenLookup: Send + Sync {
    fn token(&self, user: &str) -> Option<String>;
}

impl TokenLookup for HashMap<String, String> {
    fn token(&self, user: &str) -> Option<String> {
        self.get(user).cloned()
    }
}

/// Checks a Login frame. A zero `window` disables the timestamp check.
/// Timestamps in the future are accepted.
pub fn authenticate(
    login: &Login,
    tokens: &dyn TokenLookup,
    window: Duration,
    now_secs: i64,
) -> Result<String, AuthError> {
    if !window.is_zero() {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let age_ms = now_secs
            .checked_sub(login.timestamp)
            .ok_or(AuthError::Expired)?
            .saturating_mul(1000);
        if age_ms > window_ms {
            return Err(AuthError::Expired);
        }
    }

    let token = tokens
        .token(&login.user)
        .ok_or_else(|| AuthError::UnknownUser(login.user.clone()))?;
    if !crypto::verify(&token, login.timestamp, &login.sign) {
        return Err(AuthError::BadSignature);
    }
    Ok(token)
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_addr: String,
    pub proxy_bind_ip: IpAddr,
    pub min_port: u16,
    pub max_port: u16,
    /// Empty disables the HTTP front end.
    pub http_addr: String,
    /// Empty disables the HTTPS front end.
    pub https_addr: String,
    pub auth_timeout: Duration,
    pub ping_timeout: Duration,
    pub work_conn_timeout: Duration,
    pub hello_timeout: Duration,
    pub encrypt_control: bool,
}

/// Tunnel server: control listener plus the shared HTTP / HTTPS front ends.
pub struct Service {
    control: TcpListener,
    http: Option<TcpListener>,
    https: Option<TcpListener>,
    http_router: Option<Arc<ProxyRouter>>,
    https_router: Option<Arc<ProxyRouter>>,
    manager: Arc<ClientManager>,
    ports: Arc<PortAllocator>,
    tokens: Arc<dyn TokenLookup>,
    shared: SessionShared,
    auth_timeout: Duration,
    hello_timeout: Duration,
}

impl Service {
    pub async fn bind(opts: ServerOptions, tokens: Arc<dyn TokenLookup>) -> anyhow::Result<Self> {
        let control = TcpListener::bind(&opts.bind_addr)
            .await
            .with_context(|| format!("tunnel: bind control listener {}", opts.bind_addr))?;

        let http = bind_optional(&opts.http_addr, "http").await?;
        let https = bind_optional(&opts.https_addr, "https").await?;
        let http_router = http.as_ref().map(|_| Arc::new(ProxyRouter::new()));
        let https_router = https.as_ref().map(|_| Arc::new(ProxyRouter::new()));

        let ports = Arc::new(PortAllocator::new(
            opts.proxy_bind_ip,
            opts.min_port,
            opts.max_port,
        ));
        let manager = Arc::new(ClientManager::new());

        let shared = SessionShared {
            ctx: ProxyContext {
                ports: ports.clone(),
                bind_ip: opts.proxy_bind_ip,
                http_router: http_router.clone(),
                https_router: https_router.clone(),
            },
            ping_timeout: opts.ping_timeout,
            acquire_timeout: opts.work_conn_timeout,
            encrypt_control: opts.encrypt_control,
            changes: manager.changes(),
        };

        Ok(Self {
            control,
            http,
            https,
            http_router,
            https_router,
            manager,
            ports,
            tokens,
            shared,
            auth_timeout: opts.auth_timeout,
            hello_timeout: opts.hello_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn manager(&self) -> Arc<ClientManager> {
        self.manager.clone()
    }

    pub fn ports(&self) -> Arc<PortAllocator> {
        self.ports.clone()
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Self {
            control,
            http,
            https,
            http_router,
            https_router,
            manager,
            tokens,
            shared,
            auth_timeout,
            hello_timeout,
            ..
        } = self;

        let mut front_ends = JoinSet::new();
        if let (Some(ln), Some(router)) = (http, http_router) {
            front_ends.spawn(proxy::serve_http(ln, router, shutdown.clone()));
        }
        if let (Some(ln), Some(router)) = (https, https_router) {
            front_ends.spawn(proxy::serve_https(ln, router, hello_timeout, shutdown.clone()));
        }

        tracing::info!(addr=%control.local_addr()?, "tunnel: listening");

        let handler = Arc::new(ConnHandler {
            manager: manager.clone(),
            tokens,
            shared,
            auth_timeout,
        });

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = control.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err=%err, "tunnel: accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let handler = handler.clone();
                    tokio::spawn(async move { handler.handle(conn, peer).await });
                }
            }
        }

        manager.close_all();
        while let Some(res) = front_ends.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::warn!(err=%err, "tunnel: front end stopped with error");
            }
        }
        Ok(())
    }
}

async fn bind_optional(addr: &str, what: &str) -> anyhow::Result<Option<TcpListener>> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Ok(None);
    }
    let ln = TcpListener::bind(addr)
        .await
        .with_context(|| format!("tunnel: bind {what} front end {addr}"))?;
    tracing::info!(addr=%addr, "tunnel: {what} front end listening");
    Ok(Some(ln))
}

struct ConnHandler {
    manager: Arc<ClientManager>,
    tokens: Arc<dyn TokenLookup>,
    shared: SessionShared,
    auth_timeout: Duration,
}

impl ConnHandler {
    async fn handle(&self, mut conn: TcpStream, peer: SocketAddr) {
        let _ = conn.set_nodelay(true);

        let first = tokio::time::timeout(
            FIRST_MESSAGE_TIMEOUT,
            protocol::read_msg_bounded(&mut conn, MAX_CONTROL_FRAME_BYTES),
        )
        .await;
        let msg = match first {
            Ok(Ok(msg)) => msg,
            Ok(Err(err)) => {
                tracing::debug!(client=%peer, err=%err, "tunnel: bad first frame");
                return;
            }
            Err(_) => {
                tracing::debug!(client=%peer, "tunnel: no first frame before deadline");
                return;
            }
        };

        match msg {
            Message::Login(login) => self.handle_login(conn, peer, login).await,
            Message::NewWorkConn(w) => match self.manager.get(&w.client_id) {
                Some(ctrl) => ctrl.offer_work_conn(Box::new(conn)),
                None => {
                    tracing::warn!(client=%peer, cid=%w.client_id, "tunnel: work connection for unknown client");
                }
            },
            other => {
                tracing::warn!(client=%peer, msg_type=?other.msg_type(), "tunnel: unexpected first frame");
            }
        }
    }

    async fn handle_login(&self, mut conn: TcpStream, peer: SocketAddr, login: Login) {
        let token = match authenticate(
            &login,
            self.tokens.as_ref(),
            self.auth_timeout,
            telemetry::now_unix_secs(),
        ) {
            Ok(token) => token,
            Err(err) => {
                metrics::counter!("gangway_login_failures_total").increment(1);
                tracing::warn!(client=%peer, user=%login.user, err=%err, "tunnel: login rejected");
                let resp = Message::LoginResp(LoginResp {
                    client_id: String::new(),
                    status: 0,
                    error: err.to_string(),
                });
                let _ = protocol::write_msg(&mut conn, &resp).await;
                return;
            }
        };

        let pool_count = (login.conn_pool_count as usize).min(MAX_POOL_COUNT);
        let ctrl = self.manager.register(&login.client_id, |id| {
            ClientCtrl::new(
                id,
                &login,
                &token,
                peer.to_string(),
                pool_count,
                self.shared.clone(),
            )
        });

        metrics::counter!("gangway_sessions_total").increment(1);
        metrics::gauge!("gangway_active_clients").increment(1.0);
        tracing::info!(cid=%ctrl.id(), user=%login.user, client=%peer, pool=pool_count, "tunnel: client connected");

        let reason = ctrl.run(conn, &self.manager).await;

        metrics::gauge!("gangway_active_clients").decrement(1.0);
        match reason {
            SessionError::Closed => {
                tracing::info!(cid=%ctrl.id(), client=%peer, "tunnel: client disconnected");
            }
            other => {
                tracing::warn!(cid=%ctrl.id(), client=%peer, err=%other, "tunnel: client session ended");
            }
        }
    }
}
