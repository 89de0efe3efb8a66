//! Minimal server: echoes request bodies over HTTP and messages over
//! WebSocket.
//!
//! Run with `cargo run --example echo`, then:
//!   curl -d 'hello' http://127.0.0.1:8000/
//!   websocat ws://127.0.0.1:8000/ws

use std::rc::Rc;

use async_trait::async_trait;
use tokio::task::LocalSet;

use hearth_server::{
    App, Request, Response, Result, Server, ServerConfig, StatusCode, WsMessage, WsSession,
};

struct Echo;

#[async_trait(?Send)]
impl App for Echo {
    async fn call(&self, request: Request) -> Result<Response> {
        if request.body.is_empty() {
            Ok(Response::text(
                StatusCode::OK,
                &format!("{} {}\n", request.method, request.path),
            ))
        } else {
            Ok(Response::new(StatusCode::OK).body(request.body))
        }
    }

    async fn call_ws(&self, mut session: WsSession) -> Result<()> {
        while let Some(message) = session.recv().await {
            match message {
                WsMessage::Text(_) | WsMessage::Binary(_) => session.send(message).await?,
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    fn websocket_enabled(&self) -> bool {
        true
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    local.block_on(&runtime, async {
        let server = Server::new(ServerConfig::default(), Rc::new(Echo))?;
        server.run().await
    })
}
