//! Shared-secret helpers: the login signature and the optional stream cipher.
//!
//! The cipher is AES-128 in full-block CFB mode keyed by `md5(secret)`. Each
//! direction starts with a fresh random 16-byte IV sent in the clear. There is
//! no integrity tag; tampering is only noticed if it breaks the framing above.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use aes::Aes128;
use bytes::{Buf, BytesMut};
use cfb_mode::{BufDecryptor, BufEncryptor, cipher::KeyIvInit};
use md5::{Digest, Md5};
use pin_project_lite::pin_project;
use rand::{RngExt, rng};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub const IV_LEN: usize = 16;

pub type CipherKey = [u8; 16];

pub fn derive_key(secret: &str) -> CipherKey {
    Md5::digest(secret.as_bytes()).into()
}

/// Login signature: lowercase hex of `md5(token ++ timestamp)`.
pub fn sign(token: &str, timestamp: i64) -> String {
    hex::encode(Md5::digest(format!("{token}{timestamp}").as_bytes()))
}

pub fn verify(token: &str, timestamp: i64, signature: &str) -> bool {
    sign(token, timestamp).eq_ignore_ascii_case(signature.trim())
}

enum Decoder {
    Iv {
        key: CipherKey,
        iv: [u8; IV_LEN],
        filled: usize,
    },
    Ready(Box<BufDecryptor<Aes128>>),
}

pin_project! {
    /// Encrypting wrapper over a byte stream.
    ///
    /// Written bytes are encrypted into `pending` (which starts out holding the
    /// IV) and drained to the inner stream; a write is only accepted once the
    /// previous one has been fully drained.
    pub struct CipherStream<S> {
        #[pin]
        inner: S,
        enc: Box<BufEncryptor<Aes128>>,
        pending: BytesMut,
        dec: Decoder,
    }
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, key: &CipherKey) -> Self {
        let iv: [u8; IV_LEN] = rng().random();
        let enc = BufEncryptor::<Aes128>::new(&(*key).into(), &iv.into());

        Self {
            inner,
            enc: Box::new(enc),
            pending: BytesMut::from(&iv[..]),
            dec: Decoder::Iv {
                key: *key,
                iv: [0u8; IV_LEN],
                filled: 0,
            },
        }
    }
}

fn poll_drain<S: AsyncWrite>(
    mut inner: Pin<&mut S>,
    pending: &mut BytesMut,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while !pending.is_empty() {
        let n = ready!(inner.as_mut().poll_write(cx, &pending[..]))?;
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        pending.advance(n);
    }
    Poll::Ready(Ok(()))
}

impl<S: AsyncWrite> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), this.pending, cx))?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.pending.extend_from_slice(buf);
        this.enc.encrypt(&mut this.pending[..]);

        // Best effort; anything left is pushed out by the next write or flush.
        if let Poll::Ready(Err(err)) = poll_drain(this.inner, this.pending, cx) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), this.pending, cx))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), this.pending, cx))?;
        this.inner.poll_shutdown(cx)
    }
}

impl<S: AsyncRead> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            let next = match this.dec {
                Decoder::Ready(_) => break,
                Decoder::Iv { key, iv, filled } => {
                    let mut rb = ReadBuf::new(&mut iv[*filled..]);
                    ready!(this.inner.as_mut().poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        if *filled == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "cipher: truncated iv",
                        )));
                    }
                    *filled += n;
                    if *filled < IV_LEN {
                        continue;
                    }
                    let dec = BufDecryptor::<Aes128>::new(&(*key).into(), &(*iv).into());
                    Decoder::Ready(Box::new(dec))
                }
            };
            *this.dec = next;
        }

        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        if let Decoder::Ready(dec) = this.dec {
            dec.decrypt(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn signature_is_hex_md5_of_token_and_timestamp() {
        assert_eq!(sign("secret", 1_700_000_000), "e37729af62f40f134311cffbc230178e");
        assert!(verify("secret", 1_700_000_000, "E37729AF62F40F134311CFFBC230178E"));
        assert!(!verify("secret", 1_700_000_001, "e37729af62f40f134311cffbc230178e"));
    }

    #[test]
    fn key_is_raw_md5_of_secret() {
        assert_eq!(hex::encode(derive_key("secret")), "5ebe2294ecd0e0f08eab7690d2a6ee69");
    }

    #[tokio::test]
    async fn encrypted_stream_decrypts_on_the_other_side() {
        let key = derive_key("token");
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut tx = CipherStream::new(a, &key);
        let mut rx = CipherStream::new(b, &key);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            for chunk in sent.chunks(777) {
                tx.write_all(chunk).await.unwrap();
            }
            tx.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        rx.read_to_end(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn same_plaintext_encrypts_differently_each_time() {
        let key = derive_key("token");
        let mut captured = Vec::new();

        for _ in 0..2 {
            let (a, mut raw) = tokio::io::duplex(1024);
            let mut tx = CipherStream::new(a, &key);
            tx.write_all(b"hello tunnel").await.unwrap();
            tx.flush().await.unwrap();
            drop(tx);

            let mut wire = Vec::new();
            raw.read_to_end(&mut wire).await.unwrap();
            assert_eq!(wire.len(), IV_LEN + b"hello tunnel".len());
            assert_ne!(&wire[IV_LEN..], b"hello tunnel");
            captured.push(wire);
        }

        assert_ne!(captured[0], captured[1]);
    }

    #[tokio::test]
    async fn truncated_iv_is_an_error() {
        let key = derive_key("token");
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);

        let mut rx = CipherStream::new(b, &key);
        let mut buf = [0u8; 8];
        let err = rx.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
