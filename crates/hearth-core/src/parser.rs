//! Incremental HTTP/1.1 request parser
//!
//! The parser is an explicit state machine over an internal buffer: callers
//! feed it raw bytes as they arrive and receive a sequence of events per
//! feed. It holds no sockets and spawns nothing, so every transition is
//! unit-testable with byte slices.
//!
//! Bytes past the end of a message (a pipelined next request, or WebSocket
//! frames following an upgrade head) stay buffered; `reset` re-arms the
//! machine over them and `take_remaining` hands them off wholesale.

use crate::config::ParseLimits;
use crate::errors::ParseError;
use crate::request::{Method, Version};

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Body framing declared by the request head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body
    None,
    /// Fixed-length body
    ContentLength(u64),
    /// Chunked transfer encoding
    Chunked,
}

/// Facts about a request head, available once all headers have arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadSummary {
    pub framing: BodyFraming,
    /// The client sent `Expect: 100-continue`
    pub expect_continue: bool,
    /// The head carries `Connection: upgrade` plus `Upgrade: websocket`
    pub upgrade_websocket: bool,
    /// Persistence hint from version and Connection tokens
    pub keep_alive: bool,
}

/// Parse progress surfaced to the connection driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    RequestLine {
        method: Method,
        target: String,
        version: Version,
    },
    Header {
        name: String,
        value: String,
    },
    HeadersComplete(HeadSummary),
    BodyChunk(Vec<u8>),
    MessageComplete,
}

// ----------------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------------

/// Longest accepted chunk-size line: 16 hex digits plus a chunk extension
const MAX_CHUNK_SIZE_LINE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailer,
    Complete,
}

/// Sniffed header fields, accumulated while the head is parsed
#[derive(Debug, Default)]
struct HeadFields {
    version: Option<Version>,
    content_length: Option<u64>,
    chunked: bool,
    expect_continue: bool,
    upgrade_websocket_header: bool,
    connection_upgrade: bool,
    connection_close: bool,
    connection_keep_alive: bool,
}

/// Incremental request parser
#[derive(Debug)]
pub struct RequestParser {
    limits: ParseLimits,
    buf: Vec<u8>,
    state: State,
    fields: HeadFields,
    header_count: usize,
    head_bytes: usize,
    body_bytes: u64,
}

impl RequestParser {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            limits,
            buf: Vec::new(),
            state: State::RequestLine,
            fields: HeadFields::default(),
            header_count: 0,
            head_bytes: 0,
            body_bytes: 0,
        }
    }

    /// Whether the current message has been fully parsed
    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Whether unconsumed bytes are buffered
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Re-arm for the next message. Buffered bytes are retained; call
    /// `feed(&[])` afterwards to process them.
    pub fn reset(&mut self) {
        self.state = State::RequestLine;
        self.fields = HeadFields::default();
        self.header_count = 0;
        self.head_bytes = 0;
        self.body_bytes = 0;
    }

    /// Surrender all buffered bytes, e.g. to a WebSocket frame decoder
    /// after an upgrade.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Feed bytes and collect the parse events they unlock. Feeding an
    /// empty slice drives the machine over already-buffered bytes.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ParseEvent>, ParseError> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            match self.state {
                State::RequestLine => {
                    // Tolerate blank lines between pipelined requests
                    while self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                    }
                    match split_line(&self.buf).map_err(|_| ParseError::InvalidRequestLine)? {
                        None => {
                            if self.buf.len() > self.limits.max_request_line {
                                return Err(ParseError::RequestLineTooLong {
                                    max: self.limits.max_request_line,
                                });
                            }
                            break;
                        }
                        Some((len, consumed)) => {
                            if len > self.limits.max_request_line {
                                return Err(ParseError::RequestLineTooLong {
                                    max: self.limits.max_request_line,
                                });
                            }
                            let line: Vec<u8> = self.buf.drain(..consumed).take(len).collect();
                            self.head_bytes += consumed;
                            let (method, target, version) = parse_request_line(&line)?;
                            self.fields.version = Some(version);
                            events.push(ParseEvent::RequestLine {
                                method,
                                target,
                                version,
                            });
                            self.state = State::Headers;
                        }
                    }
                }
                State::Headers => {
                    match split_line(&self.buf).map_err(|_| ParseError::InvalidHeader)? {
                        None => {
                            if self.buf.len() + self.head_bytes > self.limits.max_head_size {
                                return Err(ParseError::HeadersTooLarge {
                                    max: self.limits.max_head_size,
                                });
                            }
                            break;
                        }
                        Some((0, consumed)) => {
                            self.buf.drain(..consumed);
                            let summary = self.finish_head()?;
                            let framing = summary.framing;
                            events.push(ParseEvent::HeadersComplete(summary));
                            match framing {
                                BodyFraming::None | BodyFraming::ContentLength(0) => {
                                    events.push(ParseEvent::MessageComplete);
                                    self.state = State::Complete;
                                }
                                BodyFraming::ContentLength(n) => {
                                    self.state = State::FixedBody { remaining: n };
                                }
                                BodyFraming::Chunked => {
                                    self.state = State::ChunkSize;
                                }
                            }
                        }
                        Some((len, consumed)) => {
                            self.head_bytes += consumed;
                            if self.head_bytes > self.limits.max_head_size {
                                return Err(ParseError::HeadersTooLarge {
                                    max: self.limits.max_head_size,
                                });
                            }
                            self.header_count += 1;
                            if self.header_count > self.limits.max_header_count {
                                return Err(ParseError::TooManyHeaders {
                                    max: self.limits.max_header_count,
                                });
                            }
                            let line: Vec<u8> = self.buf.drain(..consumed).take(len).collect();
                            let (name, value) = parse_header_line(&line)?;
                            self.sniff_header(&name, &value)?;
                            events.push(ParseEvent::Header { name, value });
                        }
                    }
                }
                State::FixedBody { remaining } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    self.account_body(take)?;
                    events.push(ParseEvent::BodyChunk(chunk));
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        events.push(ParseEvent::MessageComplete);
                        self.state = State::Complete;
                    } else {
                        self.state = State::FixedBody { remaining };
                    }
                }
                State::ChunkSize => {
                    match split_line(&self.buf).map_err(|_| ParseError::InvalidChunk)? {
                        None => {
                            if self.buf.len() > MAX_CHUNK_SIZE_LINE {
                                return Err(ParseError::InvalidChunk);
                            }
                            break;
                        }
                        Some((len, consumed)) => {
                            if len > MAX_CHUNK_SIZE_LINE {
                                return Err(ParseError::InvalidChunk);
                            }
                            let size = parse_chunk_size(&self.buf[..len])?;
                            self.buf.drain(..consumed);
                            if size == 0 {
                                self.state = State::Trailer;
                            } else {
                                if self.body_bytes.saturating_add(size)
                                    > self.limits.max_body_size as u64
                                {
                                    return Err(ParseError::BodyTooLarge {
                                        max: self.limits.max_body_size,
                                    });
                                }
                                self.state = State::ChunkData { remaining: size };
                            }
                        }
                    }
                }
                State::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    self.account_body(take)?;
                    events.push(ParseEvent::BodyChunk(chunk));
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.state = State::ChunkDataEnd;
                    } else {
                        self.state = State::ChunkData { remaining };
                    }
                }
                State::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunk);
                    }
                    self.buf.drain(..2);
                    self.state = State::ChunkSize;
                }
                State::Trailer => {
                    // Trailer fields are framed but discarded
                    match split_line(&self.buf).map_err(|_| ParseError::InvalidChunk)? {
                        None => {
                            if self.buf.len() > self.limits.max_head_size {
                                return Err(ParseError::HeadersTooLarge {
                                    max: self.limits.max_head_size,
                                });
                            }
                            break;
                        }
                        Some((0, consumed)) => {
                            self.buf.drain(..consumed);
                            events.push(ParseEvent::MessageComplete);
                            self.state = State::Complete;
                        }
                        Some((_, consumed)) => {
                            self.buf.drain(..consumed);
                        }
                    }
                }
                State::Complete => break,
            }
        }

        Ok(events)
    }

    fn account_body(&mut self, n: usize) -> Result<(), ParseError> {
        self.body_bytes += n as u64;
        if self.body_bytes > self.limits.max_body_size as u64 {
            return Err(ParseError::BodyTooLarge {
                max: self.limits.max_body_size,
            });
        }
        Ok(())
    }

    fn sniff_header(&mut self, name: &str, value: &str) -> Result<(), ParseError> {
        if name.eq_ignore_ascii_case("content-length") {
            let parsed: u64 = value
                .trim()
                .parse()
                .map_err(|_| ParseError::InvalidContentLength)?;
            match self.fields.content_length {
                Some(existing) if existing != parsed => {
                    return Err(ParseError::InvalidContentLength);
                }
                _ => self.fields.content_length = Some(parsed),
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("chunked") {
                    self.fields.chunked = true;
                } else if !token.is_empty() {
                    return Err(ParseError::UnsupportedTransferEncoding {
                        encoding: token.to_owned(),
                    });
                }
            }
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    self.fields.connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    self.fields.connection_keep_alive = true;
                } else if token.eq_ignore_ascii_case("upgrade") {
                    self.fields.connection_upgrade = true;
                }
            }
        } else if name.eq_ignore_ascii_case("expect") {
            if value.trim().eq_ignore_ascii_case("100-continue") {
                self.fields.expect_continue = true;
            }
        } else if name.eq_ignore_ascii_case("upgrade") {
            if value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("websocket"))
            {
                self.fields.upgrade_websocket_header = true;
            }
        }
        Ok(())
    }

    fn finish_head(&mut self) -> Result<HeadSummary, ParseError> {
        let f = &self.fields;
        if f.chunked && f.content_length.is_some() {
            return Err(ParseError::AmbiguousFraming);
        }
        let framing = if f.chunked {
            BodyFraming::Chunked
        } else {
            match f.content_length {
                Some(n) => {
                    if n > self.limits.max_body_size as u64 {
                        return Err(ParseError::BodyTooLarge {
                            max: self.limits.max_body_size,
                        });
                    }
                    BodyFraming::ContentLength(n)
                }
                None => BodyFraming::None,
            }
        };
        let keep_alive = if f.connection_close {
            false
        } else if f.connection_keep_alive {
            true
        } else {
            f.version
                .map(|v| v.persistent_by_default())
                .unwrap_or(false)
        };
        Ok(HeadSummary {
            framing,
            expect_continue: f.expect_continue,
            upgrade_websocket: f.upgrade_websocket_header && f.connection_upgrade,
            keep_alive,
        })
    }
}

// ----------------------------------------------------------------------------
// Line and Token Helpers
// ----------------------------------------------------------------------------

/// Find the next CRLF-terminated line. Returns (line length, bytes
/// consumed including CRLF), None when incomplete, Err on a bare LF.
fn split_line(buf: &[u8]) -> Result<Option<(usize, usize)>, ()> {
    match buf.iter().position(|&b| b == b'\n') {
        None => Ok(None),
        Some(0) => Err(()),
        Some(p) if buf[p - 1] == b'\r' => Ok(Some((p - 1, p + 1))),
        Some(_) => Err(()),
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::InvalidRequestLine)?;
    let mut parts = text.splitn(3, ' ');
    let method = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let target = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ParseError::InvalidRequestLine)?;

    let method = Method::from_bytes(method.as_bytes()).ok_or(ParseError::InvalidMethod)?;
    if target.is_empty() || !target.bytes().all(|b| (0x21..0x7f).contains(&b)) {
        return Err(ParseError::InvalidTarget);
    }
    let version =
        Version::from_bytes(version.as_bytes()).ok_or_else(|| ParseError::UnsupportedVersion {
            version: version.to_owned(),
        })?;
    Ok((method, target.to_owned(), version))
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    // Obsolete line folding is rejected outright
    if line.first().is_some_and(|&b| b == b' ' || b == b'\t') {
        return Err(ParseError::InvalidHeader);
    }
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_tchar(b)) {
        return Err(ParseError::InvalidHeaderName);
    }
    let value = &line[colon + 1..];
    let value = trim_ows(value);
    if !value
        .iter()
        .all(|&b| b == b'\t' || (0x20..0x7f).contains(&b) || b >= 0x80)
    {
        return Err(ParseError::InvalidHeaderValue);
    }
    let name = String::from_utf8(name.to_vec()).map_err(|_| ParseError::InvalidHeaderName)?;
    let value = String::from_utf8(value.to_vec()).map_err(|_| ParseError::InvalidHeaderValue)?;
    Ok((name, value))
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while value.first().is_some_and(|&b| b == b' ' || b == b'\t') {
        value = &value[1..];
    }
    while value.last().is_some_and(|&b| b == b' ' || b == b'\t') {
        value = &value[..value.len() - 1];
    }
    value
}

/// Parse a hex chunk size, ignoring any chunk extension after ';'
fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::InvalidChunk)?;
    let size_part = text.split(';').next().unwrap_or("").trim();
    if size_part.is_empty() || size_part.len() > 16 {
        return Err(ParseError::InvalidChunk);
    }
    u64::from_str_radix(size_part, 16).map_err(|_| ParseError::InvalidChunk)
}
