//! Application contract
//!
//! The engine drives everything up to and including framing; what a request
//! *means* is the application's business. Applications implement [`App`]
//! and are shared across connection tasks as `Rc<dyn App>` on the
//! single-threaded runtime, so handlers need not be `Send`.

use async_trait::async_trait;

use hearth_core::{HearthError, Request, Response, Result};

use crate::ws::WsSession;

/// The single seam between the engine and the application layer.
///
/// `call` receives one complete request and returns the response future;
/// resolving it is the delivery continuation. An `Err` is an
/// application-defined failure: the engine answers 500 and logs the error
/// with full diagnostics.
#[async_trait(?Send)]
pub trait App {
    /// Handle one HTTP request
    async fn call(&self, request: Request) -> Result<Response>;

    /// Handle a WebSocket session after a successful upgrade. Only called
    /// when `websocket_enabled` returns true.
    async fn call_ws(&self, session: WsSession) -> Result<()> {
        let _ = session;
        Err(HearthError::application("websocket handler not implemented"))
    }

    /// Whether upgrade requests should be accepted at all. Upgrades are
    /// answered 400 when this is false.
    fn websocket_enabled(&self) -> bool {
        false
    }

    /// Subprotocols the application speaks, in no particular order; the
    /// handshake picks the first client-offered match.
    fn subprotocols(&self) -> Option<Vec<String>> {
        None
    }
}
