//! Tokio driver for the hearth connection engine
//!
//! This crate wires the sans-I/O protocol logic from `hearth-core` onto
//! real sockets: a current-thread runtime with a `LocalSet`, one task per
//! connection, shared state behind `Rc<RefCell<...>>`, and a phase
//! broadcast for graceful shutdown. Applications implement [`App`] and
//! hand it to [`Server`].

pub mod app;
pub mod conn;
pub mod server;
pub mod state;
pub mod ws;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use app::App;
pub use server::{Phase, Server, ServerHandle};
pub use state::{ConnId, ConnPhase, ServerState, SharedState};
pub use ws::WsSession;

// Core types applications touch directly
pub use hearth_core::{
    HearthError, Method, Request, Response, Result, ServerConfig, StatusCode, Version, WsMessage,
};
