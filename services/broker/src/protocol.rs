//! Line-delimited client protocol.
//!
//! Every message is one line terminated by `\n` (a preceding `\r` is
//! ignored). Operations are case-insensitive; payloads are JSON.
//!
//! ```text
//! S: INFO {"server_id":"O...","auth_required":true,"nonce":"..."}
//! C: CONNECT {"nkey":"U...","sig":"..."}
//! S: +OK                              | -ERR 'Authorization Violation'
//! C: PING
//! S: PONG
//! ```
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use warden_auth::{ConnectRequest, ServerHello};

pub const OK: &str = "+OK";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const ERR_AUTHORIZATION: &str = "Authorization Violation";
pub const ERR_AUTH_TIMEOUT: &str = "Authentication Timeout";
pub const ERR_UNKNOWN_OP: &str = "Unknown Protocol Operation";
pub const ERR_STALE: &str = "Stale Connection";
pub const ERR_UNAVAILABLE: &str = "Service Unavailable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Connect(ConnectRequest),
    Ping,
    Pong,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown operation: {0}")]
    UnknownOp(String),
    #[error("malformed CONNECT payload")]
    MalformedConnect(#[source] serde_json::Error),
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientOp {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let (op, rest) = match line.split_once(char::is_whitespace) {
            Some((op, rest)) => (op, rest.trim()),
            None => (line, ""),
        };
        match op.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                let payload = if rest.is_empty() { "{}" } else { rest };
                serde_json::from_str(payload)
                    .map(Self::Connect)
                    .map_err(ProtocolError::MalformedConnect)
            }
            "PING" if rest.is_empty() => Ok(Self::Ping),
            "PONG" if rest.is_empty() => Ok(Self::Pong),
            _ => Err(ProtocolError::UnknownOp(op.to_string())),
        }
    }
}

pub fn info_line(hello: &ServerHello) -> String {
    op_with_json("INFO", hello)
}

pub fn connect_line(request: &ConnectRequest) -> String {
    op_with_json("CONNECT", request)
}

pub fn err_line(message: &str) -> String {
    format!("-ERR '{message}'")
}

fn op_with_json<T: Serialize>(op: &str, payload: &T) -> String {
    // Plain structs with string fields always serialize.
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    format!("{op} {json}")
}

/// Read one line of at most `max_bytes`, without the terminator.
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_line<R>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = String::new();
    let limit = max_bytes as u64 + 1;
    let read = AsyncReadExt::take(&mut *reader, limit)
        .read_line(&mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if !buf.ends_with('\n') && read > max_bytes {
        return Err(ProtocolError::LineTooLong(max_bytes));
    }
    let trimmed = buf.trim_end_matches(['\r', '\n']);
    Ok(Some(trimmed.to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(line.len() + 2);
    framed.extend_from_slice(line.as_bytes());
    framed.extend_from_slice(b"\r\n");
    writer.write_all(&framed).await?;
    writer.flush().await
}
