//! WebSocket protocol support (RFC 6455)
//!
//! Split into the opening handshake (key derivation, upgrade validation,
//! subprotocol negotiation) and the sans-I/O frame codec (incremental
//! decoder, encoder, message assembly, close payload handling).

pub mod frame;
pub mod handshake;

pub use frame::{
    Frame, FrameDecoder, MessageAssembler, Opcode, WsMessage, build_close_payload,
    encode_frame, is_valid_close_code, parse_close_payload,
};
pub use handshake::{
    accept_key, build_accept_response, negotiate_subprotocol, validate_upgrade,
};
