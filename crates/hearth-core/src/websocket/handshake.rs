//! WebSocket opening handshake
//!
//! Validates an upgrade request head, derives the accept key, negotiates a
//! subprotocol, and serializes the 101 response that switches the
//! connection over to frames.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::errors::HandshakeError;
use crate::request::{Method, Request};

/// Fixed GUID appended to the client key (RFC 6455 section 4.2.2)
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this engine speaks
const SUPPORTED_VERSION: &str = "13";

/// Derive the Sec-WebSocket-Accept value for a client key
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Validate an upgrade request head and return the client key
pub fn validate_upgrade(request: &Request) -> Result<String, HandshakeError> {
    if request.method != Method::Get {
        return Err(HandshakeError::MethodNotGet);
    }
    let upgrade_ok = request.headers.contains_token("upgrade", "websocket");
    if !upgrade_ok {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !request.headers.contains_token("connection", "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }
    let key = request
        .headers
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;
    // The key must be 16 bytes of base64
    match BASE64.decode(key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }
    let version = request
        .headers
        .get("sec-websocket-version")
        .map(str::trim)
        .unwrap_or("");
    if version != SUPPORTED_VERSION {
        return Err(HandshakeError::UnsupportedVersion {
            version: version.to_owned(),
        });
    }
    Ok(key.to_owned())
}

/// Pick the first client-offered subprotocol the server supports.
/// Subprotocol names are matched exactly.
pub fn negotiate_subprotocol(client_offer: &str, supported: &[String]) -> Option<String> {
    client_offer
        .split(',')
        .map(str::trim)
        .find(|offered| supported.iter().any(|s| s == offered))
        .map(str::to_owned)
}

/// Serialize the 101 Switching Protocols response
pub fn build_accept_response(accept: &str, subprotocol: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.extend_from_slice(b"Upgrade: websocket\r\n");
    out.extend_from_slice(b"Connection: Upgrade\r\n");
    out.extend_from_slice(format!("Sec-WebSocket-Accept: {accept}\r\n").as_bytes());
    if let Some(proto) = subprotocol {
        out.extend_from_slice(format!("Sec-WebSocket-Protocol: {proto}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}
