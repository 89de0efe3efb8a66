//! HTTP response model and serializer
//!
//! Responses carry either a fixed byte body or a streaming body fed through
//! a bounded channel. The encoder owns all framing decisions: Content-Length
//! versus chunked transfer encoding, Connection negotiation, and the
//! entity-header stripping that cache-validation statuses require.

use core::fmt;
use core::time::Duration;

use tokio::sync::mpsc;

use crate::request::Version;

// ----------------------------------------------------------------------------
// Status Codes
// ----------------------------------------------------------------------------

/// HTTP status code with its canonical reason phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const OK: StatusCode = StatusCode(200);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const PRECONDITION_FAILED: StatusCode = StatusCode(412);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    pub fn reason(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            409 => "Conflict",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            426 => "Upgrade Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

// ----------------------------------------------------------------------------
// Response Body
// ----------------------------------------------------------------------------

/// Response payload variants
#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    /// Chunks arrive over a bounded channel; the engine frames them with
    /// chunked transfer encoding as they come.
    Stream(mpsc::Receiver<Vec<u8>>),
}

// ----------------------------------------------------------------------------
// Response
// ----------------------------------------------------------------------------

/// A response produced by the application or by the engine itself
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// Add a header
    pub fn header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a fixed byte body
    pub fn body<B: Into<Vec<u8>>>(mut self, body: B) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    /// Set a streaming body
    pub fn stream(mut self, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        self.body = Body::Stream(rx);
        self
    }

    /// Plain-text response with the given status
    pub fn text(status: StatusCode, body: &str) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.as_bytes().to_vec())
    }

    /// Canned 400 for malformed input
    pub fn bad_request(message: &str) -> Self {
        Self::text(StatusCode::BAD_REQUEST, message)
    }

    /// Canned 503 issued when the admission ceiling is reached
    pub fn service_unavailable() -> Self {
        Self::text(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    }

    /// Canned 413 for oversized request bodies
    pub fn payload_too_large() -> Self {
        Self::text(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large")
    }

    /// Canned 500 for handler faults
    pub fn internal_error() -> Self {
        Self::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    /// Whether the application asked to close the connection
    pub fn wants_close(&self) -> bool {
        self.headers.iter().any(|(n, v)| {
            n.eq_ignore_ascii_case("connection")
                && v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close"))
        })
    }
}

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------

/// Statuses that must not carry a body
pub fn body_suppressed(status: StatusCode) -> bool {
    let code = status.0;
    (100..200).contains(&code) || code == 204 || code == 304 || code == 412
}

/// Statuses whose entity headers are stripped (cache-validation semantics)
fn strips_entity_headers(status: StatusCode) -> bool {
    status.0 == 304 || status.0 == 412
}

fn is_entity_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-type")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("content-encoding")
        || name.eq_ignore_ascii_case("transfer-encoding")
}

/// Headers the encoder owns; application copies are dropped
fn is_reserved_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
}

pub struct ResponseEncoder;

impl ResponseEncoder {
    /// Serialize the status line and header block. The status line echoes
    /// the request version; the body is written separately so streams can
    /// be driven incrementally.
    pub fn encode_head(
        response: &Response,
        version: Version,
        keep_alive: bool,
        keep_alive_timeout: Duration,
        default_headers: &[(String, String)],
    ) -> Vec<u8> {
        let status = response.status;
        let stripped = strips_entity_headers(status);
        let suppressed = body_suppressed(status);

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {status}\r\n", version.as_str()).as_bytes());

        for (name, value) in default_headers.iter().chain(response.headers.iter()) {
            if is_reserved_header(name) {
                continue;
            }
            if stripped && is_entity_header(name) {
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }

        if !suppressed {
            match &response.body {
                Body::Empty => out.extend_from_slice(b"Content-Length: 0\r\n"),
                Body::Bytes(bytes) => {
                    out.extend_from_slice(format!("Content-Length: {}\r\n", bytes.len()).as_bytes())
                }
                Body::Stream(_) => out.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
            }
        }

        if keep_alive {
            out.extend_from_slice(b"Connection: keep-alive\r\n");
            out.extend_from_slice(
                format!("Keep-Alive: timeout={}\r\n", keep_alive_timeout.as_secs()).as_bytes(),
            );
        } else {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Chunked transfer encoding framing
pub struct ChunkedEncoder;

impl ChunkedEncoder {
    /// Frame one chunk. Empty chunks must be skipped by the caller; a
    /// zero-length frame is the terminator.
    pub fn encode(chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len() + 16);
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
        out
    }

    /// The stream terminator
    pub fn finish() -> &'static [u8] {
        b"0\r\n\r\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_string(
        response: &Response,
        keep_alive: bool,
        defaults: &[(String, String)],
    ) -> String {
        let bytes = ResponseEncoder::encode_head(
            response,
            Version::Http11,
            keep_alive,
            Duration::from_secs(5),
            defaults,
        );
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_basic_head() {
        let resp = Response::text(StatusCode::OK, "hello");
        let head = head_string(&resp, true, &[]);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Keep-Alive: timeout=5\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_status_line_echoes_request_version() {
        let resp = Response::new(StatusCode::OK);
        let head = ResponseEncoder::encode_head(
            &resp,
            Version::Http10,
            false,
            Duration::from_secs(5),
            &[],
        );
        assert!(head.starts_with(b"HTTP/1.0 200 OK\r\n"));
    }

    #[test]
    fn test_connection_close() {
        let resp = Response::new(StatusCode::OK);
        let head = head_string(&resp, false, &[]);

        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("Keep-Alive:"));
        assert!(head.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn test_default_headers_precede_response_headers() {
        let resp = Response::new(StatusCode::OK).header("X-App", "1");
        let defaults = vec![("Server".to_owned(), "hearth".to_owned())];
        let head = head_string(&resp, true, &defaults);

        let server = head.find("Server: hearth").unwrap();
        let app = head.find("X-App: 1").unwrap();
        assert!(server < app);
    }

    #[test]
    fn test_not_modified_strips_entity_headers() {
        let resp = Response::new(StatusCode::NOT_MODIFIED)
            .header("Content-Type", "text/html")
            .header("ETag", "\"abc\"")
            .body("stale body");
        let head = head_string(&resp, true, &[]);

        assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!head.contains("Content-Type"));
        assert!(!head.contains("Content-Length"));
        assert!(head.contains("ETag: \"abc\"\r\n"));
    }

    #[test]
    fn test_precondition_failed_strips_entity_headers() {
        let resp = Response::new(StatusCode::PRECONDITION_FAILED).header("Content-Type", "a/b");
        let head = head_string(&resp, true, &[]);

        assert!(!head.contains("Content-Type"));
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn test_reserved_headers_dropped() {
        let resp = Response::new(StatusCode::OK)
            .header("Content-Length", "9999")
            .header("Transfer-Encoding", "chunked")
            .body("ok");
        let head = head_string(&resp, true, &[]);

        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(!head.contains("9999"));
        assert!(!head.contains("Transfer-Encoding"));
    }

    #[test]
    fn test_stream_body_uses_chunked() {
        let (_tx, rx) = mpsc::channel(4);
        let resp = Response::new(StatusCode::OK).stream(rx);
        let head = head_string(&resp, true, &[]);

        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn test_chunked_encoder_framing() {
        let mut wire = Vec::new();
        for chunk in [b"b1".as_slice(), b"b2", b"b3"] {
            wire.extend_from_slice(&ChunkedEncoder::encode(chunk));
        }
        wire.extend_from_slice(ChunkedEncoder::finish());

        assert_eq!(wire, b"2\r\nb1\r\n2\r\nb2\r\n2\r\nb3\r\n0\r\n\r\n");
    }

    #[test]
    fn test_body_suppression() {
        assert!(body_suppressed(StatusCode(100)));
        assert!(body_suppressed(StatusCode::NO_CONTENT));
        assert!(body_suppressed(StatusCode::NOT_MODIFIED));
        assert!(body_suppressed(StatusCode::PRECONDITION_FAILED));
        assert!(!body_suppressed(StatusCode::OK));
        assert!(!body_suppressed(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_wants_close() {
        let resp = Response::new(StatusCode::OK).header("Connection", "close");
        assert!(resp.wants_close());
        assert!(!Response::new(StatusCode::OK).wants_close());
    }
}
