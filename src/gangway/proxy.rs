//! Shared front ends: an HTTP reverse proxy routed by Host and path, and a
//! raw TLS passthrough routed by SNI.

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{
    Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderMap, HeaderName, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::gangway::{
    protocol, telemetry,
    tunnel::{bridge, dispatch::ProxyRouter},
};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Connection-scoped headers that never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

pub async fn serve_http(
    ln: TcpListener,
    router: Arc<ProxyRouter>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err=%err, "http: accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let router = router.clone();
                tokio::spawn(serve_http_conn(conn, peer, router));
            }
        }
    }
    Ok(())
}

async fn serve_http_conn(conn: TcpStream, peer: SocketAddr, router: Arc<ProxyRouter>) {
    let io = TokioIo::new(conn);
    let service = service_fn(move |req| forward(req, peer, router.clone()));
    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        tracing::debug!(client=%peer, err=%err, "http: connection ended");
    }
}

async fn forward(
    req: Request<Incoming>,
    peer: SocketAddr,
    router: Arc<ProxyRouter>,
) -> Result<Response<ProxyBody>, Infallible> {
    let host = request_host(&req);
    let Some(base) = router.get(&host, req.uri().path()) else {
        tracing::debug!(client=%peer, host=%host, path=%req.uri().path(), "http: no route");
        return Ok(status(StatusCode::NOT_FOUND));
    };

    let _active = telemetry::ActiveConnGuard::new("http");
    let work = match base.get_work_conn().await {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(proxy=%base.name, cid=%base.client_id, err=%err, "http: no work connection");
            return Ok(status(StatusCode::BAD_GATEWAY));
        }
    };

    let (mut parts, body) = req.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    if !base.host_rewrite.is_empty() {
        match HeaderValue::from_str(&base.host_rewrite) {
            Ok(v) => {
                parts.headers.insert(header::HOST, v);
            }
            Err(err) => {
                tracing::warn!(proxy=%base.name, err=%err, "http: invalid host rewrite");
            }
        }
    }
    // One work connection per request.
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    if let Some(pq) = parts.uri.path_and_query() {
        parts.uri = Uri::from(pq.clone());
    }
    let req = Request::from_parts(parts, body);

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(work)).await {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(proxy=%base.name, err=%err, "http: upstream handshake failed");
            return Ok(status(StatusCode::BAD_GATEWAY));
        }
    };
    let proxy_name = base.name.clone();
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(proxy=%proxy_name, err=%err, "http: upstream connection ended");
        }
    });

    let resp = match sender.send_request(req).await {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!(proxy=%base.name, err=%err, "http: upstream request failed");
            return Ok(status(StatusCode::BAD_GATEWAY));
        }
    };

    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Host from the Host header (or the absolute URI), without the port.
fn request_host<B>(req: &Request<B>) -> String {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    strip_port(raw.trim()).to_string()
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !h.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let keep_trailers = headers
        .get_all(header::TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")));

    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }

    if keep_trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
}

fn status(code: StatusCode) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(code.canonical_reason().unwrap_or_default()))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = code;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

pub async fn serve_https(
    ln: TcpListener,
    router: Arc<ProxyRouter>,
    hello_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err=%err, "https: accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let router = router.clone();
                tokio::spawn(serve_https_conn(conn, peer, router, hello_timeout));
            }
        }
    }
    Ok(())
}

async fn serve_https_conn(
    mut conn: TcpStream,
    peer: SocketAddr,
    router: Arc<ProxyRouter>,
    hello_timeout: Duration,
) {
    let captured = match protocol::read_client_hello(&mut conn, hello_timeout).await {
        Ok(b) => b,
        Err(err) => {
            tracing::debug!(client=%peer, err=%err, "https: client hello read failed");
            return;
        }
    };

    let host = match protocol::extract_server_name(&captured) {
        Ok(h) => h,
        Err(err) => {
            tracing::debug!(client=%peer, err=%err, "https: no usable server name");
            return;
        }
    };

    let Some(base) = router.find(&host, "/") else {
        tracing::debug!(client=%peer, host=%host, "https: no route");
        return;
    };

    let _active = telemetry::ActiveConnGuard::new("https");
    let mut work = match base.get_work_conn().await {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(proxy=%base.name, cid=%base.client_id, err=%err, "https: no work connection");
            return;
        }
    };

    if let Err(err) = work.write_all(&captured).await {
        tracing::debug!(proxy=%base.name, err=%err, "https: replaying client hello failed");
        return;
    }

    let (ingress, egress) = bridge::bridge(conn, work).await;
    telemetry::record_bridged(ingress + captured.len() as u64, egress);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ports_from_hosts() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn host_falls_back_to_absolute_uri() {
        let req = Request::builder()
            .uri("http://Example.com:81/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), "Example.com");

        let req = Request::builder()
            .uri("/x")
            .header(header::HOST, "site.test:9000")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), "site.test");
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut h = HeaderMap::new();
        h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, X-Session"));
        h.insert("x-session", HeaderValue::from_static("abc"));
        h.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        h.insert(header::TE, HeaderValue::from_static("trailers, deflate"));
        h.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut h);

        assert!(h.get(header::CONNECTION).is_none());
        assert!(h.get("x-session").is_none());
        assert!(h.get("keep-alive").is_none());
        assert!(h.get(header::UPGRADE).is_none());
        assert_eq!(h.get(header::TE).unwrap(), "trailers");
        assert_eq!(h.get(header::CONTENT_TYPE).unwrap(), "text/html");
    }

    #[test]
    fn error_statuses_carry_reason() {
        let resp = status(StatusCode::BAD_GATEWAY);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
