//! Hearth Core Protocol Implementation
//!
//! Sans-I/O building blocks for the Hearth HTTP/1.1 connection engine:
//! incremental request parsing, response serialization, admission policy,
//! and the WebSocket handshake and frame codec. Nothing in this crate
//! touches a socket, so every state machine is unit-testable with byte
//! slices. The `hearth-server` crate drives these types over TCP.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod admission;
pub mod config;
pub mod errors;
pub mod parser;
pub mod request;
pub mod response;
pub mod websocket;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use admission::AdmissionDecision;
pub use config::{ParseLimits, ServerConfig, WsConfig};
pub use errors::{HandshakeError, HearthError, ParseError, Result, WsError};
pub use parser::{BodyFraming, HeadSummary, ParseEvent, RequestParser};
pub use request::{Headers, Method, Request, Version};
pub use response::{Body, Response, StatusCode};
pub use websocket::WsMessage;
