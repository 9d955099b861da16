//! HTTP/1.1 WebSocket upgrade handshake (RFC 6455 section 4.2).
//!
//! Only the server side: parse the client's request head, compute the accept
//! key and render the `101 Switching Protocols` response or a rejection.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_HEADERS: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed HTTP request: {0}")]
    Malformed(String),
    #[error("method must be GET, got {0}")]
    Method(String),
    #[error("missing or invalid {0} header")]
    MissingHeader(&'static str),
    #[error("unsupported WebSocket version {0}")]
    Version(String),
}

impl HandshakeError {
    /// HTTP status sent back to the client.
    pub fn status(&self) -> u16 {
        match self {
            HandshakeError::TooLarge(_) => 431,
            HandshakeError::Method(_) => 405,
            HandshakeError::Version(_) => 426,
            HandshakeError::Malformed(_) | HandshakeError::MissingHeader(_) => 400,
        }
    }
}

/// The parts of an upgrade request the server acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub host: Option<String>,
    pub origin: Option<String>,
    pub protocols: Vec<String>,
}

/// Parse an upgrade request head.
///
/// Returns `Ok(None)` while the head is incomplete, otherwise the request
/// and the length of the head. Bytes past the head are not part of the
/// handshake.
pub fn parse_request(
    buf: &[u8],
    max_len: usize,
) -> Result<Option<(UpgradeRequest, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_len {
                return Err(HandshakeError::TooLarge(max_len));
            }
            return Ok(None);
        }
        Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
    };
    if len > max_len {
        return Err(HandshakeError::TooLarge(max_len));
    }

    let method = req.method.unwrap_or_default();
    if method != "GET" {
        return Err(HandshakeError::Method(method.to_string()));
    }

    let mut upgrade = false;
    let mut connection = false;
    let mut key = None;
    let mut version = None;
    let mut host = None;
    let mut origin = None;
    let mut protocols = Vec::new();

    for header in req.headers.iter() {
        let Ok(value) = std::str::from_utf8(header.value) else {
            continue;
        };
        let value = value.trim();
        let name = header.name;
        if name.eq_ignore_ascii_case("upgrade") {
            upgrade |= has_token(value, "websocket");
        } else if name.eq_ignore_ascii_case("connection") {
            connection |= has_token(value, "upgrade");
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value);
        } else if name.eq_ignore_ascii_case("sec-websocket-version") {
            version = Some(value);
        } else if name.eq_ignore_ascii_case("host") {
            host = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("origin") {
            origin = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("sec-websocket-protocol") {
            protocols.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from),
            );
        }
    }

    if !upgrade {
        return Err(HandshakeError::MissingHeader("Upgrade"));
    }
    if !connection {
        return Err(HandshakeError::MissingHeader("Connection"));
    }
    let key = key
        .filter(|k| is_valid_key(k))
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    match version {
        Some("13") => {}
        Some(other) => return Err(HandshakeError::Version(other.to_string())),
        None => return Err(HandshakeError::MissingHeader("Sec-WebSocket-Version")),
    }

    Ok(Some((
        UpgradeRequest {
            path: req.path.unwrap_or("/").to_string(),
            key: key.to_string(),
            host,
            origin,
            protocols,
        },
        len,
    )))
}

fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// A client key is 16 random bytes in base64.
fn is_valid_key(key: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(key)
        .map(|raw| raw.len() == 16)
        .unwrap_or(false)
}

/// `Sec-WebSocket-Accept` for `key`: base64(SHA-1(key + GUID)).
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The `101 Switching Protocols` response.
pub fn build_response(request: &UpgradeRequest) -> Bytes {
    let accept = accept_key(&request.key);
    let mut buf = BytesMut::with_capacity(160);
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.freeze()
}

/// An error response for a failed handshake.
pub fn build_rejection(err: &HandshakeError) -> Bytes {
    let reason = match err.status() {
        405 => "Method Not Allowed",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        _ => "Bad Request",
    };
    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(format!("HTTP/1.1 {} {}\r\n", err.status(), reason).as_bytes());
    if matches!(err, HandshakeError::Version(_)) {
        buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    }
    buf.put_slice(b"Connection: close\r\nContent-Length: 0\r\n\r\n");
    buf.freeze()
}
