use std::time::Duration;

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

/// Read + write in one object-safe trait, so control and work connections
/// can be boxed whether or not a cipher wraps them.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub async fn dial_tcp(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let connect = TcpStream::connect(addr);
    let conn = if timeout.is_zero() {
        connect.await
    } else {
        tokio::time::timeout(timeout, connect)
            .await
            .with_context(|| format!("dial {addr}: timed out after {timeout:?}"))?
    }
    .with_context(|| format!("dial {addr}"))?;
    let _ = conn.set_nodelay(true);
    Ok(conn)
}

/// Listen address as written in config. `":7000"` binds every interface.
pub fn listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_only_listen_addr_binds_all_interfaces() {
        assert_eq!(listen_addr(":7000"), "0.0.0.0:7000");
        assert_eq!(listen_addr(" :8080 "), "0.0.0.0:8080");
        assert_eq!(listen_addr("127.0.0.1:7000"), "127.0.0.1:7000");
        assert_eq!(listen_addr("[::]:443"), "[::]:443");
        assert_eq!(listen_addr(""), "");
    }

    #[tokio::test]
    async fn dial_reports_refused_connections() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = dial_tcp(&format!("127.0.0.1:{port}"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dial 127.0.0.1:"));
    }
}
