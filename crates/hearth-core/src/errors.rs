//! Error types for the Hearth protocol engine
//!
//! This module contains all error types used throughout the engine, including
//! HTTP parse errors, WebSocket handshake and framing errors, and the main
//! HearthError type that unifies them all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// HTTP request parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid request line")]
    InvalidRequestLine,
    #[error("Invalid request method")]
    InvalidMethod,
    #[error("Unsupported HTTP version: {version}")]
    UnsupportedVersion { version: String },
    #[error("Invalid request target")]
    InvalidTarget,
    #[error("Invalid header line")]
    InvalidHeader,
    #[error("Invalid header name")]
    InvalidHeaderName,
    #[error("Invalid byte in header value")]
    InvalidHeaderValue,
    #[error("Request line too long (max {max} bytes)")]
    RequestLineTooLong { max: usize },
    #[error("Too many headers (max {max})")]
    TooManyHeaders { max: usize },
    #[error("Header block too large (max {max} bytes)")]
    HeadersTooLarge { max: usize },
    #[error("Invalid Content-Length header")]
    InvalidContentLength,
    #[error("Ambiguous body framing: Content-Length with Transfer-Encoding")]
    AmbiguousFraming,
    #[error("Unsupported transfer encoding: {encoding}")]
    UnsupportedTransferEncoding { encoding: String },
    #[error("Invalid chunked framing")]
    InvalidChunk,
    #[error("Request body too large (max {max} bytes)")]
    BodyTooLarge { max: usize },
}

/// WebSocket opening handshake errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("WebSocket upgrade requires a GET request")]
    MethodNotGet,
    #[error("Missing or invalid Upgrade header")]
    MissingUpgrade,
    #[error("Connection header does not request an upgrade")]
    MissingConnectionUpgrade,
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("Sec-WebSocket-Key must be 16 base64-encoded bytes")]
    InvalidKey,
    #[error("Unsupported Sec-WebSocket-Version: {version}")]
    UnsupportedVersion { version: String },
}

/// WebSocket framing and session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WsError {
    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,
    #[error("Invalid close code: {code}")]
    InvalidCloseCode { code: u16 },
    /// The peer closed the connection. Handlers treat this as a normal end
    /// of session rather than a failure.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl WsError {
    /// Create a protocol violation error with a reason
    pub fn protocol<T: Into<String>>(reason: T) -> Self {
        WsError::Protocol {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Top-Level Error Type
// ----------------------------------------------------------------------------

/// Core error type for the Hearth engine
#[derive(Debug, thiserror::Error)]
pub enum HearthError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    /// Application-defined failure surfaced by a handler
    #[error("Application error: {message}")]
    Application { message: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl HearthError {
    /// Create an application error with a message
    pub fn application<T: Into<String>>(message: T) -> Self {
        HearthError::Application {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        HearthError::Configuration {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, HearthError>;
