//! HTTP request model
//!
//! Requests are assembled from parser events by the connection driver. The
//! types here carry no I/O; they are plain data plus the header lookups the
//! engine needs for persistence and upgrade decisions.

use core::fmt;
use std::net::SocketAddr;

use crate::errors::ParseError;

// ----------------------------------------------------------------------------
// Method and Version
// ----------------------------------------------------------------------------

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    /// Parse a method token. Methods are case-sensitive.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"OPTIONS" => Some(Method::Options),
            b"PATCH" => Some(Method::Patch),
            b"TRACE" => Some(Method::Trace),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Whether connections persist by default for this version
    pub fn persistent_by_default(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Headers
// ----------------------------------------------------------------------------

/// Ordered header collection with case-insensitive lookup
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for the header, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for the header in order of appearance
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether any value of a comma-separated header contains the token
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Request
// ----------------------------------------------------------------------------

/// A complete, parsed HTTP request
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub version: Version,
    /// Percent-decoded path component of the request target
    pub path: String,
    /// Raw query string without the leading '?'
    pub query: Option<String>,
    /// Request target exactly as received
    pub raw_target: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// The client sent `Expect: 100-continue`. The engine only flags this;
    /// answering with an interim 100 is left to the application layer.
    pub expect_continue: bool,
    /// The head requested a WebSocket upgrade
    pub upgrade_websocket: bool,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// "http" or "https" depending on deployment configuration
    pub scheme: &'static str,
}

impl Request {
    /// Assemble a request from its parsed pieces, splitting and decoding
    /// the target.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        method: Method,
        raw_target: String,
        version: Version,
        headers: Headers,
        body: Vec<u8>,
        expect_continue: bool,
        upgrade_websocket: bool,
        peer: SocketAddr,
        local: SocketAddr,
        scheme: &'static str,
    ) -> Result<Self, ParseError> {
        let (raw_path, query) = match raw_target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_owned())),
            None => (raw_target.as_str(), None),
        };
        let path = percent_decode(raw_path)?;
        Ok(Self {
            method,
            version,
            path,
            query,
            raw_target,
            headers,
            body,
            expect_continue,
            upgrade_websocket,
            peer,
            local,
            scheme,
        })
    }

    /// Whether the connection should persist after this request, following
    /// the version default unless a Connection token overrides it.
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.contains_token("connection", "close") {
            return false;
        }
        if self.headers.contains_token("connection", "keep-alive") {
            return true;
        }
        self.version.persistent_by_default()
    }
}

/// Decode %XX escapes. The result must be valid UTF-8.
fn percent_decode(input: &str) -> Result<String, ParseError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return Err(ParseError::InvalidTarget);
            }
            let hi = hex_val(bytes[i + 1]).ok_or(ParseError::InvalidTarget)?;
            let lo = hex_val(bytes[i + 2]).ok_or(ParseError::InvalidTarget)?;
            out.push((hi << 4) | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ParseError::InvalidTarget)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
