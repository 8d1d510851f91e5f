//! TLS ClientHello sniffing for the HTTPS front end.
//!
//! Only the server_name extension is extracted; the handshake is never
//! completed and the captured bytes are replayed to the tunnel untouched.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;
const MAX_SESSION_ID_LEN: usize = 32;

/// Shortest buffer the parser will look at: headers, version, random and
/// the session id, cipher suite and compression length fields.
pub const MIN_CLIENT_HELLO_BYTES: usize = 47;

/// Largest TLS plaintext record body.
pub const MAX_TLS_RECORD_BYTES: usize = 1 << 14;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("malformed client hello")]
    Malformed,
    #[error("client hello carries no server name")]
    NoServerName,
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        if self.buf.len() < n {
            return Err(SniError::Malformed);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Returns the first host_name entry of the server_name extension.
pub fn extract_server_name(record: &[u8]) -> Result<String, SniError> {
    if record.len() < MIN_CLIENT_HELLO_BYTES {
        return Err(SniError::Malformed);
    }
    if record[0] != RECORD_TYPE_HANDSHAKE || record[5] != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::Malformed);
    }

    let hs_len = u32::from_be_bytes([0, record[6], record[7], record[8]]) as usize;
    let end = 9 + hs_len;
    if record.len() < end {
        return Err(SniError::Malformed);
    }

    // Skip the header, client version and random.
    let mut c = Cursor {
        buf: &record[43..end],
    };

    let session_id_len = c.u8()? as usize;
    if session_id_len > MAX_SESSION_ID_LEN {
        return Err(SniError::Malformed);
    }
    c.take(session_id_len)?;

    let suites_len = c.u16()? as usize;
    if suites_len % 2 != 0 {
        return Err(SniError::Malformed);
    }
    c.take(suites_len)?;

    let compression_len = c.u8()? as usize;
    c.take(compression_len)?;

    if c.is_empty() {
        return Err(SniError::NoServerName);
    }

    let ext_total = c.u16()? as usize;
    if ext_total != c.buf.len() {
        return Err(SniError::Malformed);
    }

    while !c.is_empty() {
        let ext_type = c.u16()?;
        let ext_len = c.u16()? as usize;
        let body = c.take(ext_len)?;
        if ext_type != EXT_SERVER_NAME {
            continue;
        }
        return server_name_from_extension(body);
    }

    Err(SniError::NoServerName)
}

fn server_name_from_extension(body: &[u8]) -> Result<String, SniError> {
    let mut c = Cursor { buf: body };
    let list_len = c.u16()? as usize;
    if list_len != c.buf.len() {
        return Err(SniError::Malformed);
    }

    while !c.is_empty() {
        let name_type = c.u8()?;
        let name_len = c.u16()? as usize;
        let name = c.take(name_len)?;
        if name_type != NAME_TYPE_HOST {
            continue;
        }
        let name = std::str::from_utf8(name).map_err(|_| SniError::Malformed)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(SniError::NoServerName);
        }
        return Ok(name.to_string());
    }

    Err(SniError::NoServerName)
}

/// Reads the first TLS record (header and body) and returns every byte read.
pub async fn read_client_hello<R: AsyncRead + Unpin>(
    conn: &mut R,
    timeout: Duration,
) -> std::io::Result<Vec<u8>> {
    let read = async {
        let mut captured = vec![0u8; 5];
        conn.read_exact(&mut captured).await?;

        let body_len = u16::from_be_bytes([captured[3], captured[4]]) as usize;
        if body_len > MAX_TLS_RECORD_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("tls record too large: {body_len}"),
            ));
        }

        captured.resize(5 + body_len, 0);
        conn.read_exact(&mut captured[5..]).await?;
        Ok::<_, std::io::Error>(captured)
    };

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "client hello timeout"))?
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Minimal TLS 1.2-style ClientHello record, optionally carrying SNI.
    pub(crate) fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[7u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
        body.extend_from_slice(&[0x01, 0x00]);

        let mut exts = Vec::new();
        // supported_versions
        exts.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
        if let Some(name) = server_name {
            let n = name.as_bytes();
            let mut list = vec![0x00];
            list.extend_from_slice(&(n.len() as u16).to_be_bytes());
            list.extend_from_slice(n);

            exts.extend_from_slice(&[0x00, 0x00]);
            exts.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
            exts.extend_from_slice(&(list.len() as u16).to_be_bytes());
            exts.extend_from_slice(&list);
        }
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hs = vec![0x01];
        hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&body);

        let mut rec = vec![0x16, 0x03, 0x01];
        rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        rec.extend_from_slice(&hs);
        rec
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::client_hello;
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn extracts_server_name() {
        let hello = client_hello(Some("example.com"));
        assert_eq!(extract_server_name(&hello).unwrap(), "example.com");

        let hello = client_hello(Some("  padded.example.com "));
        assert_eq!(extract_server_name(&hello).unwrap(), "padded.example.com");
    }

    #[test]
    fn missing_extension_is_no_server_name() {
        let hello = client_hello(None);
        assert_eq!(extract_server_name(&hello), Err(SniError::NoServerName));
    }

    #[test]
    fn truncation_is_malformed() {
        let hello = client_hello(Some("example.com"));
        assert_eq!(extract_server_name(&hello[..40]), Err(SniError::Malformed));
        assert_eq!(
            extract_server_name(&hello[..hello.len() - 3]),
            Err(SniError::Malformed)
        );
    }

    #[test]
    fn rejects_non_client_hello_and_long_session_id() {
        let mut hello = client_hello(Some("example.com"));
        hello[5] = 0x02;
        assert_eq!(extract_server_name(&hello), Err(SniError::Malformed));

        let mut hello = client_hello(Some("example.com"));
        hello[43] = 33;
        assert_eq!(extract_server_name(&hello), Err(SniError::Malformed));
    }

    #[tokio::test]
    async fn capture_returns_exact_record_bytes() {
        let hello = client_hello(Some("example.com"));
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&hello).await.unwrap();
        a.write_all(b"trailing application data").await.unwrap();

        let captured = read_client_hello(&mut b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(captured, hello);
    }

    #[tokio::test]
    async fn capture_times_out_on_silent_peer() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_client_hello(&mut b, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
