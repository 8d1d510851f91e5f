use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};

use crate::gangway::tunnel::{
    bridge,
    control::{self, PING_CHECK_INTERVAL, RECV_QUEUE_CAPACITY, SEND_QUEUE_CAPACITY, SessionError},
    crypto::{self, CipherKey, CipherStream},
    dispatch::ProxyKind,
    manager::ChangeFeed,
    pool,
    protocol::{self, Login, MAX_CONTROL_FRAME_BYTES, Message, NewProxy, NewProxyResp, NewWorkConn},
    server::MAX_POOL_COUNT,
    transport::{BoxedStream, dial_tcp},
};

pub const LOGIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A service on the client's network exposed through the server.
#[derive(Debug, Clone)]
pub struct LocalProxy {
    pub name: String,
    pub kind: ProxyKind,
    pub local_addr: String,
    pub remote_port: u16,
    pub encrypt: bool,
    pub domain: String,
    pub url_prefix: String,
    pub host_rewrite: String,
}

impl LocalProxy {
    fn to_message(&self) -> NewProxy {
        NewProxy {
            proxy_name: self.name.clone(),
            proxy_type: self.kind.as_str().to_string(),
            remote_port: self.remote_port,
            encrypt: self.encrypt,
            host: self.host_rewrite.clone(),
            domain: self.domain.clone(),
            url: self.url_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub user: String,
    pub token: String,
    pub hostname: String,
    pub pool_count: u32,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub retry_delay: Duration,
    pub dial_timeout: Duration,
    pub encrypt_control: bool,
    pub proxies: Vec<LocalProxy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    LoginSent,
    Active,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub local_addr: String,
    pub running: bool,
    pub remote_port: u16,
    pub error: String,
}

pub struct Client {
    opts: ClientOptions,
    key: CipherKey,
    proxies: HashMap<String, LocalProxy>,
    status: DashMap<String, ProxyStatus>,
    client_id: ArcSwap<String>,
    state: watch::Sender<SessionState>,
    changes: ChangeFeed,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.opts.server_addr)
            .field("user", &self.opts.user)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if opts.pool_count as usize > MAX_POOL_COUNT {
            tracing::warn!(
                pool_count = opts.pool_count,
                max = MAX_POOL_COUNT,
                "tunnel: pool_count above the server limit; capping"
            );
            opts.pool_count = MAX_POOL_COUNT as u32;
        }

        let mut proxies = HashMap::new();
        for p in &opts.proxies {
            let name = p.name.trim();
            if name.is_empty() {
                anyhow::bail!("tunnel: proxy name is required");
            }
            if p.local_addr.trim().is_empty() {
                anyhow::bail!("tunnel: proxy {name} has no local_addr");
            }
            let mut p = p.clone();
            p.name = name.to_string();
            if proxies.insert(p.name.clone(), p).is_some() {
                anyhow::bail!("tunnel: duplicate proxy name {name}");
            }
        }

        let status = proxies
            .values()
            .map(|p| {
                (
                    p.name.clone(),
                    ProxyStatus {
                        name: p.name.clone(),
                        kind: p.kind,
                        local_addr: p.local_addr.clone(),
                        running: false,
                        remote_port: 0,
                        error: String::new(),
                    },
                )
            })
            .collect();

        let (state, _) = watch::channel(SessionState::Connecting);
        Ok(Self {
            key: crypto::derive_key(&opts.token),
            opts,
            proxies,
            status,
            client_id: ArcSwap::from_pointee(String::new()),
            state,
            changes: ChangeFeed::new(),
        })
    }

    /// Id assigned by the server on the last successful login.
    pub fn client_id(&self) -> String {
        self.client_id.load().as_ref().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Bumped whenever a proxy's status changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn proxy_status(&self) -> Vec<ProxyStatus> {
        let mut out: Vec<ProxyStatus> = self.status.iter().map(|s| s.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Remote port of a running proxy.
    pub fn remote_port(&self, name: &str) -> Option<u16> {
        self.status
            .get(name)
            .filter(|s| s.running)
            .map(|s| s.remote_port)
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|s| {
            if *s == state {
                return false;
            }
            tracing::debug!(from=?*s, to=?state, "tunnel: client state");
            *s = state;
            true
        });
    }

    fn reset_proxies(&self) {
        for mut s in self.status.iter_mut() {
            s.running = false;
            s.remote_port = 0;
        }
        self.changes.bump();
    }

    /// Logs in and serves sessions until `shutdown` flips, reconnecting
    /// after a fixed delay whenever a session ends.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(SessionState::Connecting);
            let login = tokio::select! {
                res = self.login() => res,
                _ = pool::wait_closed(&mut shutdown) => break,
            };

            match login {
                Ok(conn) => {
                    self.set_state(SessionState::Active);
                    tracing::info!(
                        server=%self.opts.server_addr,
                        cid=%self.client_id(),
                        proxies=self.proxies.len(),
                        "tunnel: logged in"
                    );
                    match self.run_session(conn, &mut shutdown).await {
                        Ok(()) => break,
                        Err(err) => {
                            tracing::warn!(
                                server=%self.opts.server_addr,
                                err=%err,
                                retry=%humantime::format_duration(self.opts.retry_delay),
                                "tunnel: session lost; reconnecting"
                            );
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        server=%self.opts.server_addr,
                        err=%err,
                        retry=%humantime::format_duration(self.opts.retry_delay),
                        "tunnel: login failed; retrying"
                    );
                }
            }

            self.reset_proxies();
            self.set_state(SessionState::Reconnecting);
            tokio::select! {
                _ = pool::wait_closed(&mut shutdown) => break,
                _ = tokio::time::sleep(self.opts.retry_delay) => {}
            }
        }

        self.reset_proxies();
        self.set_state(SessionState::Closed);
        Ok(())
    }

    async fn login(&self) -> anyhow::Result<TcpStream> {
        let mut conn = dial_tcp(&self.opts.server_addr, self.opts.dial_timeout).await?;

        let ts = crate::gangway::telemetry::now_unix_secs();
        let login = Message::Login(Login {
            hostname: self.opts.hostname.clone(),
            user: self.opts.user.clone(),
            sign: crypto::sign(&self.opts.token, ts),
            client_id: self.client_id(),
            conn_pool_count: self.opts.pool_count,
            timestamp: ts,
        });
        protocol::write_msg(&mut conn, &login).await?;
        self.set_state(SessionState::LoginSent);

        let reply = tokio::time::timeout(
            LOGIN_RESPONSE_TIMEOUT,
            protocol::read_msg_bounded(&mut conn, MAX_CONTROL_FRAME_BYTES),
        )
        .await
        .map_err(|_| anyhow::anyhow!("tunnel: no login response within {LOGIN_RESPONSE_TIMEOUT:?}"))??;

        match reply {
            Message::LoginResp(resp) if resp.error.is_empty() => {
                self.client_id.store(Arc::new(resp.client_id));
                Ok(conn)
            }
            Message::LoginResp(resp) => Err(SessionError::Login(resp.error).into()),
            other => anyhow::bail!("tunnel: expected LoginResp, got {:?}", other.msg_type()),
        }
    }

    /// Returns `Ok` only when stopped by `shutdown`.
    async fn run_session(
        self: &Arc<Self>,
        conn: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let stream: BoxedStream = if self.opts.encrypt_control {
            Box::new(CipherStream::new(conn, &self.key))
        } else {
            Box::new(conn)
        };
        let (rd, wr) = tokio::io::split(stream);

        let (recv_tx, mut recv_rx) = mpsc::channel(RECV_QUEUE_CAPACITY);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let reader = tokio::spawn(control::read_loop(rd, recv_tx));
        let mut writer = tokio::spawn(control::write_loop(wr, send_rx));

        let register = {
            let tx = send_tx.clone();
            let msgs: Vec<Message> = self
                .proxies
                .values()
                .map(|p| Message::NewProxy(p.to_message()))
                .collect();
            tokio::spawn(async move {
                for m in msgs {
                    if tx.send(m).await.is_err() {
                        return;
                    }
                }
            })
        };

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.opts.ping_interval,
            self.opts.ping_interval,
        );
        let mut pong_check = tokio::time::interval(PING_CHECK_INTERVAL);
        let mut last_pong = Instant::now();

        let result = loop {
            tokio::select! {
                _ = pool::wait_closed(shutdown) => break Ok(()),
                _ = ping.tick() => {
                    if let Err(mpsc::error::TrySendError::Closed(_)) = send_tx.try_send(Message::Ping) {
                        break Err(SessionError::Closed);
                    }
                }
                _ = pong_check.tick() => {
                    let idle = last_pong.elapsed();
                    if idle > self.opts.pong_timeout {
                        break Err(SessionError::HeartbeatTimeout(idle));
                    }
                }
                res = &mut writer => break match res {
                    Ok(Err(err)) => Err(err.into()),
                    _ => Err(SessionError::Closed),
                },
                msg = recv_rx.recv() => match msg {
                    None => break Err(SessionError::Closed),
                    Some(Err(err)) => break Err(err.into()),
                    Some(Ok(msg)) => self.handle(msg, &mut last_pong),
                },
            }
        };

        register.abort();
        reader.abort();
        writer.abort();
        result
    }

    fn handle(self: &Arc<Self>, msg: Message, last_pong: &mut Instant) {
        match msg {
            Message::Pong => *last_pong = Instant::now(),
            Message::NewProxyResp(resp) => self.on_proxy_resp(resp),
            Message::ReqWorkConn => {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.serve_work_conn().await {
                        tracing::debug!(err=%err, "tunnel: work connection ended");
                    }
                });
            }
            other => {
                tracing::debug!(msg_type=?other.msg_type(), "tunnel: ignoring unexpected control message");
            }
        }
    }

    fn on_proxy_resp(&self, resp: NewProxyResp) {
        let Some(mut st) = self.status.get_mut(&resp.proxy_name) else {
            tracing::debug!(proxy=%resp.proxy_name, "tunnel: response for unknown proxy");
            return;
        };
        if resp.error.is_empty() {
            st.running = true;
            st.remote_port = resp.remote_port;
            st.error.clear();
            tracing::info!(proxy=%resp.proxy_name, port=resp.remote_port, "tunnel: proxy running");
        } else {
            st.running = false;
            st.error = resp.error;
            tracing::warn!(proxy=%resp.proxy_name, err=%st.error, "tunnel: proxy rejected");
        }
        drop(st);
        self.changes.bump();
    }

    async fn serve_work_conn(&self) -> anyhow::Result<()> {
        let mut conn = dial_tcp(&self.opts.server_addr, self.opts.dial_timeout).await?;
        let hello = Message::NewWorkConn(NewWorkConn {
            client_id: self.client_id(),
        });
        protocol::write_msg(&mut conn, &hello).await?;

        // Idle in the server's pool until a user connection needs us.
        let start = match protocol::read_msg_bounded(&mut conn, MAX_CONTROL_FRAME_BYTES).await? {
            Message::StartWork(s) => s,
            other => anyhow::bail!("tunnel: expected StartWork, got {:?}", other.msg_type()),
        };

        let Some(def) = self.proxies.get(&start.proxy_name) else {
            tracing::warn!(proxy=%start.proxy_name, "tunnel: work connection for unknown proxy");
            return Ok(());
        };

        let local = match dial_tcp(&def.local_addr, self.opts.dial_timeout).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(proxy=%def.name, local=%def.local_addr, err=%err, "tunnel: local service unreachable");
                return Ok(());
            }
        };

        let work: BoxedStream = if def.encrypt {
            Box::new(CipherStream::new(conn, &self.key))
        } else {
            Box::new(conn)
        };
        let (from_server, to_server) = bridge::bridge(work, local).await;
        tracing::debug!(proxy=%def.name, from_server, to_server, "tunnel: work connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use crate::gangway::{
        protocol::test_support::client_hello,
        tunnel::{
            manager::ClientManager,
            protocol::LoginResp,
            server::{ServerOptions, Service},
        },
    };

    struct TestServer {
        addr: SocketAddr,
        http: Option<SocketAddr>,
        https: Option<SocketAddr>,
        manager: Arc<ClientManager>,
        _stop: watch::Sender<bool>,
    }

    fn server_options(min_port: u16) -> ServerOptions {
        ServerOptions {
            bind_addr: "127.0.0.1:0".into(),
            proxy_bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            min_port,
            max_port: min_port + 200,
            http_addr: String::new(),
            https_addr: String::new(),
            auth_timeout: Duration::from_secs(900),
            ping_timeout: Duration::from_secs(30),
            work_conn_timeout: Duration::from_secs(3),
            hello_timeout: Duration::from_secs(2),
            encrypt_control: true,
        }
    }

    async fn start_server(opts: ServerOptions) -> TestServer {
        let users = HashMap::from([("alice".to_string(), "s3cret".to_string())]);
        let svc = Service::bind(opts, Arc::new(users)).await.unwrap();
        let (stop, stop_rx) = watch::channel(false);
        let server = TestServer {
            addr: svc.local_addr().unwrap(),
            http: svc.http_addr(),
            https: svc.https_addr(),
            manager: svc.manager(),
            _stop: stop,
        };
        tokio::spawn(svc.serve(stop_rx));
        server
    }

    fn client_options(server: SocketAddr, proxies: Vec<LocalProxy>) -> ClientOptions {
        ClientOptions {
            server_addr: server.to_string(),
            user: "alice".into(),
            token: "s3cret".into(),
            hostname: "test-host".into(),
            pool_count: 2,
            ping_interval: Duration::from_millis(200),
            pong_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(200),
            dial_timeout: Duration::from_secs(2),
            encrypt_control: true,
            proxies,
        }
    }

    fn start_client(opts: ClientOptions) -> (Arc<Client>, watch::Sender<bool>) {
        let client = Arc::new(Client::new(opts).unwrap());
        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(client.clone().run(stop_rx));
        (client, stop)
    }

    fn proxy(name: &str, kind: ProxyKind, local: SocketAddr) -> LocalProxy {
        LocalProxy {
            name: name.into(),
            kind,
            local_addr: local.to_string(),
            remote_port: 0,
            encrypt: false,
            domain: String::new(),
            url_prefix: String::new(),
            host_rewrite: String::new(),
        }
    }

    async fn wait_until(rx: &mut watch::Receiver<u64>, mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn echo_server() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = ln.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// Answers every request with `<tag> <path> host=<host>` and closes.
    async fn http_backend(tag: &'static str) -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = ln.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = conn.read(&mut buf).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        head.extend_from_slice(&buf[..n]);
                    }
                    let head = String::from_utf8_lossy(&head).to_string();
                    let path = head.split(' ').nth(1).unwrap_or_default().to_string();
                    let host = head
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("host").then(|| v.trim().to_string())
                        })
                        .unwrap_or_default();
                    let body = format!("{tag} {path} host={host}");
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    conn.write_all(resp.as_bytes()).await.unwrap();
                    let _ = conn.shutdown().await;
                });
            }
        });
        addr
    }

    async fn http_get(front: SocketAddr, host: &str, path: &str) -> String {
        let mut conn = TcpStream::connect(front).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        conn.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        conn.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn tcp_proxy_plain_and_encrypted() {
        let echo = echo_server().await;
        let server = start_server(server_options(31000)).await;

        let mut sealed = proxy("sealed", ProxyKind::Tcp, echo);
        sealed.encrypt = true;
        let (client, _stop) = start_client(client_options(
            server.addr,
            vec![proxy("plain", ProxyKind::Tcp, echo), sealed],
        ));

        let mut changes = client.subscribe_changes();
        wait_until(&mut changes, || {
            client.remote_port("plain").is_some() && client.remote_port("sealed").is_some()
        })
        .await;

        for name in ["plain", "sealed"] {
            let port = client.remote_port(name).unwrap();
            let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let payload = format!("hello via {name}");
            conn.write_all(payload.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; payload.len()];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, payload.as_bytes());
        }

        let infos = server.manager.proxies();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().all(|p| p.client_id == client.client_id()));
    }

    #[tokio::test]
    async fn http_requests_route_by_host_and_longest_prefix() {
        let root = http_backend("root").await;
        let api = http_backend("api").await;

        let mut opts = server_options(31300);
        opts.http_addr = "127.0.0.1:0".into();
        let server = start_server(opts).await;
        let front = server.http.unwrap();

        let mut root_proxy = proxy("site", ProxyKind::Http, root);
        root_proxy.domain = "Example.Test".into();
        let mut api_proxy = proxy("api", ProxyKind::Http, api);
        api_proxy.domain = "example.test".into();
        api_proxy.url_prefix = "/api".into();
        api_proxy.host_rewrite = "internal.local".into();
        let (client, _stop) = start_client(client_options(server.addr, vec![root_proxy, api_proxy]));

        let mut changes = client.subscribe_changes();
        wait_until(&mut changes, || {
            client.proxy_status().iter().all(|s| s.running)
        })
        .await;

        let resp = http_get(front, "example.test:8080", "/api/users").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.ends_with("api /api/users host=internal.local"), "{resp}");

        let resp = http_get(front, "example.test", "/index.html").await;
        assert!(resp.ends_with("root /index.html host=example.test"), "{resp}");

        let resp = http_get(front, "other.test", "/").await;
        assert!(resp.starts_with("HTTP/1.1 404"), "{resp}");
    }

    #[tokio::test]
    async fn https_routes_by_sni_and_replays_client_hello() {
        let echo = echo_server().await;

        let mut opts = server_options(31600);
        opts.https_addr = "127.0.0.1:0".into();
        let server = start_server(opts).await;
        let front = server.https.unwrap();

        let mut tls = proxy("tls", ProxyKind::Https, echo);
        tls.domain = "secure.test".into();
        tls.encrypt = true;
        let (client, _stop) = start_client(client_options(server.addr, vec![tls]));

        let mut changes = client.subscribe_changes();
        wait_until(&mut changes, || client.proxy_status()[0].running).await;

        let hello = client_hello(Some("secure.test"));
        let mut conn = TcpStream::connect(front).await.unwrap();
        conn.write_all(&hello).await.unwrap();
        conn.write_all(b"after-hello").await.unwrap();

        let mut buf = vec![0u8; hello.len() + b"after-hello".len()];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..hello.len()], &hello[..]);
        assert_eq!(&buf[hello.len()..], b"after-hello");

        let mut stray = TcpStream::connect(front).await.unwrap();
        stray.write_all(&client_hello(Some("unknown.test"))).await.unwrap();
        let mut rest = Vec::new();
        stray.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn server_drops_silent_client_after_ping_timeout() {
        let mut opts = server_options(31900);
        opts.ping_timeout = Duration::from_millis(300);
        let server = start_server(opts).await;

        let mut copts = client_options(server.addr, Vec::new());
        copts.ping_interval = Duration::from_secs(60);
        copts.retry_delay = Duration::from_millis(500);
        let (_client, _stop) = start_client(copts);

        let mut changes = server.manager.subscribe();
        wait_until(&mut changes, || server.manager.len() == 1).await;
        wait_until(&mut changes, || server.manager.is_empty()).await;
        // The client notices and logs back in.
        wait_until(&mut changes, || server.manager.len() == 1).await;
    }

    /// Accepts logins and then never answers anything.
    async fn mute_server() -> (SocketAddr, mpsc::UnboundedReceiver<Login>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = ln.accept().await.unwrap();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(Message::Login(login)) = protocol::read_msg(&mut conn).await else {
                        return;
                    };
                    let resp = Message::LoginResp(LoginResp {
                        client_id: "mute".into(),
                        status: 1,
                        ..Default::default()
                    });
                    protocol::write_msg(&mut conn, &resp).await.unwrap();
                    let _ = tx.send(login);
                    let mut sink = Vec::new();
                    let _ = conn.read_to_end(&mut sink).await;
                });
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn client_relogs_in_when_pongs_stop() {
        let (addr, mut logins) = mute_server().await;

        let mut copts = client_options(addr, Vec::new());
        copts.encrypt_control = false;
        copts.ping_interval = Duration::from_millis(100);
        copts.pong_timeout = Duration::from_millis(300);
        let (client, _stop) = start_client(copts);
        let mut state = client.subscribe_state();

        let first = tokio::time::timeout(Duration::from_secs(5), logins.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.client_id.is_empty());

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == SessionState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();

        let second = tokio::time::timeout(Duration::from_secs(5), logins.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.client_id, "mute");
    }

    #[tokio::test]
    async fn client_reconnects_with_same_id_after_server_teardown() {
        let echo = echo_server().await;
        let server = start_server(server_options(32200)).await;
        let (client, _stop) = start_client(client_options(
            server.addr,
            vec![proxy("svc", ProxyKind::Tcp, echo)],
        ));

        let mut changes = server.manager.subscribe();
        wait_until(&mut changes, || server.manager.proxies().len() == 1).await;
        let id = server.manager.snapshot()[0].id.clone();
        assert_eq!(client.client_id(), id);

        server.manager.get(&id).unwrap().close();
        wait_until(&mut changes, || server.manager.is_empty()).await;
        wait_until(&mut changes, || {
            server
                .manager
                .get(&id)
                .is_some_and(|c| c.proxy_infos().len() == 1)
        })
        .await;

        let mut state = client.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == SessionState::Active),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(client.client_id(), id);
    }

    #[tokio::test]
    async fn bad_token_keeps_client_retrying() {
        let server = start_server(server_options(32500)).await;
        let mut opts = client_options(server.addr, Vec::new());
        opts.token = "wrong".into();
        let (client, stop) = start_client(opts);

        let mut state = client.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == SessionState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(server.manager.is_empty());
        assert!(client.client_id().is_empty());

        stop.send_replace(true);
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == SessionState::Closed),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[test]
    fn oversized_pool_count_is_capped() {
        let mut opts = client_options("127.0.0.1:7000".parse().unwrap(), Vec::new());
        opts.pool_count = 500;
        let client = Client::new(opts).unwrap();
        assert_eq!(client.opts.pool_count as usize, MAX_POOL_COUNT);
    }

    #[test]
    fn duplicate_proxy_names_are_rejected() {
        let local: SocketAddr = "127.0.0.1:22".parse().unwrap();
        let opts = client_options(
            local,
            vec![proxy("ssh", ProxyKind::Tcp, local), proxy(" ssh ", ProxyKind::Tcp, local)],
        );
        assert!(Client::new(opts).is_err());
    }
}
