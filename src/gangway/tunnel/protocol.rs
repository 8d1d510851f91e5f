//! Control-plane wire messages.
//!
//! Every frame is an 8-byte big-endian length followed by a JSON envelope
//! `{"type": <tag byte>, "mes_data": "<payload json>"}`. The tag space is
//! defined once in [`MsgType`] and shared by both ends.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound applied by the control and work-connection listeners.
pub const MAX_CONTROL_FRAME_BYTES: u64 = 1 << 20; // 1 MiB

pub const LOGIN_STATUS_OK: i64 = 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed")]
    Closed,
    #[error("short frame: {0}")]
    Framing(std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("frame too large: {0}")]
    FrameTooLarge(u64),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Login = b'1',
    LoginResp = b'a',
    NewProxy = b'2',
    NewProxyResp = b'b',
    NewWorkConn = b'3',
    ReqWorkConn = b'c',
    Ping = b'4',
    Pong = b'd',
    StartWork = b'e',
}

impl TryFrom<u8> for MsgType {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Ok(match b {
            b'1' => MsgType::Login,
            b'a' => MsgType::LoginResp,
            b'2' => MsgType::NewProxy,
            b'b' => MsgType::NewProxyResp,
            b'3' => MsgType::NewWorkConn,
            b'c' => MsgType::ReqWorkConn,
            b'4' => MsgType::Ping,
            b'd' => MsgType::Pong,
            b'e' => MsgType::StartWork,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub sign: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub conn_pool_count: u32,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResp {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProxy {
    pub proxy_name: String,
    #[serde(default)]
    pub proxy_type: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub encrypt: bool,
    /// Host header presented to the client-side service (http only).
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProxyResp {
    pub proxy_name: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkConn {
    #[serde(default)]
    pub client_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartWork {
    pub proxy_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    NewWorkConn(NewWorkConn),
    ReqWorkConn,
    Ping,
    Pong,
    StartWork(StartWork),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    mes_data: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Empty {}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Login(_) => MsgType::Login,
            Message::LoginResp(_) => MsgType::LoginResp,
            Message::NewProxy(_) => MsgType::NewProxy,
            Message::NewProxyResp(_) => MsgType::NewProxyResp,
            Message::NewWorkConn(_) => MsgType::NewWorkConn,
            Message::ReqWorkConn => MsgType::ReqWorkConn,
            Message::Ping => MsgType::Ping,
            Message::Pong => MsgType::Pong,
            Message::StartWork(_) => MsgType::StartWork,
        }
    }

    fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Message::Login(m) => serde_json::to_string(m),
            Message::LoginResp(m) => serde_json::to_string(m),
            Message::NewProxy(m) => serde_json::to_string(m),
            Message::NewProxyResp(m) => serde_json::to_string(m),
            Message::NewWorkConn(m) => serde_json::to_string(m),
            Message::StartWork(m) => serde_json::to_string(m),
            Message::ReqWorkConn | Message::Ping | Message::Pong => serde_json::to_string(&Empty {}),
        }
    }
}

fn payload<T: DeserializeOwned>(s: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(s)?)
}

/// Serializes a message into a complete length-prefixed frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let env = Envelope {
        kind: msg.msg_type() as u8,
        mes_data: msg.payload_json()?,
    };
    let body = serde_json::to_vec(&env)?;

    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes one frame body (the bytes after the length prefix).
pub fn decode(body: &[u8]) -> Result<Message, ProtocolError> {
    let env: Envelope = serde_json::from_slice(body)?;
    let kind = MsgType::try_from(env.kind)?;
    let data = env.mes_data.as_str();

    Ok(match kind {
        MsgType::Login => Message::Login(payload(data)?),
        MsgType::LoginResp => Message::LoginResp(payload(data)?),
        MsgType::NewProxy => Message::NewProxy(payload(data)?),
        MsgType::NewProxyResp => Message::NewProxyResp(payload(data)?),
        MsgType::NewWorkConn => Message::NewWorkConn(payload(data)?),
        MsgType::StartWork => Message::StartWork(payload(data)?),
        MsgType::ReqWorkConn => Message::ReqWorkConn,
        MsgType::Ping => Message::Ping,
        MsgType::Pong => Message::Pong,
    })
}

pub async fn write_msg<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    let frame = encode(msg)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one message without any size limit.
pub async fn read_msg<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Message, ProtocolError> {
    read_msg_bounded(r, u64::MAX).await
}

pub async fn read_msg_bounded<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
    max_frame: u64,
) -> Result<Message, ProtocolError> {
    let mut len = [0u8; 8];
    let mut filled = 0;
    while filled < len.len() {
        let n = r.read(&mut len[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(ProtocolError::Closed);
            }
            return Err(ProtocolError::Framing(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }

    let n = u64::from_be_bytes(len);
    if n > max_frame {
        return Err(ProtocolError::FrameTooLarge(n));
    }

    let mut body = vec![0u8; n as usize];
    r.read_exact(&mut body).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Framing(err)
        } else {
            ProtocolError::Io(err)
        }
    })?;

    decode(&body)
}
