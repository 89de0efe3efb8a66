//! Shared fixtures for the integration tests: a server launcher, test
//! applications, and a raw TCP client so responses are checked on the wire.

// each test binary uses a different subset of these helpers
#![allow(dead_code)]

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;

use core::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use hearth_server::{
    App, Request, Response, Result, Server, ServerConfig, ServerHandle, StatusCode, WsMessage,
    WsSession,
};

// ----------------------------------------------------------------------------
// Server launcher
// ----------------------------------------------------------------------------

/// Bind on an ephemeral port and serve on the current `LocalSet`
pub async fn start(
    config: ServerConfig,
    app: Rc<dyn App>,
) -> (SocketAddr, ServerHandle, JoinHandle<Result<()>>) {
    let mut server = Server::new(config, app).unwrap();
    server.bind().unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let join = tokio::task::spawn_local(server.serve());
    (addr, handle, join)
}

// ----------------------------------------------------------------------------
// Test applications
// ----------------------------------------------------------------------------

/// Answers 200 with the method and path in the body; counts invocations
pub struct EchoApp {
    pub calls: Rc<Cell<usize>>,
}

impl EchoApp {
    pub fn new() -> (Rc<Self>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        (
            Rc::new(Self {
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

#[async_trait(?Send)]
impl App for EchoApp {
    async fn call(&self, request: Request) -> Result<Response> {
        self.calls.set(self.calls.get() + 1);
        let body = format!("{} {}", request.method, request.path);
        Ok(Response::text(StatusCode::OK, &body))
    }
}

/// Sleeps before answering, to hold a request in flight
pub struct SlowApp {
    pub delay: Duration,
    pub calls: Rc<Cell<usize>>,
}

impl SlowApp {
    pub fn new(delay: Duration) -> (Rc<Self>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        (
            Rc::new(Self {
                delay,
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

#[async_trait(?Send)]
impl App for SlowApp {
    async fn call(&self, _request: Request) -> Result<Response> {
        self.calls.set(self.calls.get() + 1);
        tokio::time::sleep(self.delay).await;
        Ok(Response::text(StatusCode::OK, "slow"))
    }
}

/// Echoes every WebSocket message back until the peer closes
pub struct WsEchoApp;

#[async_trait(?Send)]
impl App for WsEchoApp {
    async fn call(&self, _request: Request) -> Result<Response> {
        Ok(Response::text(StatusCode::OK, "http"))
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

    fn subprotocols(&self) -> Option<Vec<String>> {
        Some(vec!["chat".to_owned()])
    }
}

// ----------------------------------------------------------------------------
// Raw HTTP client
// ----------------------------------------------------------------------------

/// Read one response head plus a Content-Length body. Returns the head as a
/// string and the body bytes.
pub async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response head completed");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let mut body = buf[head_end + 4..].to_vec();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    (head, body)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub fn status_of(head: &str) -> u16 {
    head.split_whitespace().nth(1).unwrap().parse().unwrap()
}

/// True once the peer half has closed (read returns 0)
pub async fn reads_eof(stream: &mut TcpStream) -> bool {
    let mut chunk = [0u8; 256];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(_) => return true,
        }
    }
}

pub async fn send(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
    stream.flush().await.unwrap();
}

// ----------------------------------------------------------------------------
// Raw WebSocket client
// ----------------------------------------------------------------------------

/// Client frames must be masked; fixed key keeps the bytes deterministic
pub fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let key = [0x12u8, 0x34, 0x56, 0x78];
    let mut frame = vec![0x80 | opcode];
    match payload.len() {
        len if len <= 125 => frame.push(0x80 | len as u8),
        len if len <= 65535 => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(&key);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ key[i % 4]),
    );
    frame
}

/// Read one server frame (servers never mask). Returns (opcode, payload).
pub async fn read_frame(stream: &mut TcpStream, leftover: &mut Vec<u8>) -> (u8, Vec<u8>) {
    let mut chunk = [0u8; 4096];
    loop {
        if leftover.len() >= 2 {
            let opcode = leftover[0] & 0x0f;
            assert_eq!(leftover[1] & 0x80, 0, "server frame must be unmasked");
            let (len, offset) = match leftover[1] & 0x7f {
                126 if leftover.len() >= 4 => {
                    (u16::from_be_bytes([leftover[2], leftover[3]]) as usize, 4)
                }
                127 if leftover.len() >= 10 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&leftover[2..10]);
                    (u64::from_be_bytes(raw) as usize, 10)
                }
                len @ 0..=125 => (len as usize, 2),
                _ => {
                    // extended length bytes not in yet
                    let n = stream.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "connection closed mid-frame");
                    leftover.extend_from_slice(&chunk[..n]);
                    continue;
                }
            };
            if leftover.len() >= offset + len {
                let payload = leftover[offset..offset + len].to_vec();
                leftover.drain(..offset + len);
                return (opcode, payload);
            }
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-frame");
        leftover.extend_from_slice(&chunk[..n]);
    }
}
