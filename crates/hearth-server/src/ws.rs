//! WebSocket session driver
//!
//! After a 101 the connection task hands its transport here. The driver
//! decodes frames (starting with any bytes buffered past the upgrade
//! head), answers pings, assembles messages into the handler's inbound
//! queue, writes outbound messages, and runs the closing handshake. The
//! handler runs as its own task and talks to the driver only through the
//! [`WsSession`] channels, so a slow handler backpressures the socket
//! instead of wedging the driver.

use std::collections::VecDeque;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use hearth_core::websocket::{
    build_close_payload, encode_frame, parse_close_payload, Frame, FrameDecoder,
    MessageAssembler, Opcode, WsMessage,
};
use hearth_core::{HearthError, Result, WsError};

use crate::conn::{maybe_sleep, Connection};
use crate::server::Phase;
use crate::state::TaskSlot;

// ----------------------------------------------------------------------------
// Session Handle
// ----------------------------------------------------------------------------

/// The application's side of a WebSocket session
pub struct WsSession {
    incoming: mpsc::Receiver<WsMessage>,
    outgoing: mpsc::Sender<WsMessage>,
    subprotocol: Option<String>,
}

impl WsSession {
    /// Receive the next message. `None` means the peer or the engine
    /// ended the session.
    pub async fn recv(&mut self) -> Option<WsMessage> {
        self.incoming.recv().await
    }

    /// Send a message. Fails with [`WsError::ConnectionClosed`] once the
    /// session has ended.
    pub async fn send(&self, message: WsMessage) -> Result<()> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| HearthError::Ws(WsError::ConnectionClosed))
    }

    pub async fn send_text<T: Into<String>>(&self, text: T) -> Result<()> {
        self.send(WsMessage::Text(text.into())).await
    }

    pub async fn send_binary<B: Into<Vec<u8>>>(&self, data: B) -> Result<()> {
        self.send(WsMessage::Binary(data.into())).await
    }

    /// Initiate the closing handshake
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        self.send(WsMessage::Close(Some((code, reason.to_owned()))))
            .await
    }

    /// The negotiated subprotocol, if any
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

fn close_code_for(err: &WsError) -> u16 {
    match err {
        WsError::MessageTooLarge { .. } | WsError::FrameTooLarge { .. } => 1009,
        WsError::InvalidUtf8 => 1007,
        _ => 1002,
    }
}

pub(crate) async fn drive(conn: &mut Connection, subprotocol: Option<String>, leftover: Vec<u8>) {
    let ws_config = conn.config.ws.clone();
    let (in_tx, in_rx) = mpsc::channel(ws_config.queue_capacity);
    let (out_tx, mut out_rx) = mpsc::channel(ws_config.queue_capacity);
    let session = WsSession {
        incoming: in_rx,
        outgoing: out_tx,
        subprotocol,
    };

    let app = conn.app.clone();
    let slot = TaskSlot::claim(conn.state.clone());
    let peer = conn.peer;
    let mut handler = tokio::task::spawn_local(async move {
        let result = app.call_ws(session).await;
        drop(slot);
        if let Err(err) = result {
            warn!(peer = %peer, error = %err, "websocket handler error");
        }
    });

    let mut decoder = FrameDecoder::new_with_leftover(ws_config.max_frame_size, leftover);
    let mut assembler = MessageAssembler::new(ws_config.max_message_size);
    let mut frames: VecDeque<Frame> = VecDeque::new();
    let mut pending: VecDeque<WsMessage> = VecDeque::new();
    let mut buf = vec![0u8; 8192];
    let mut close_sent = false;
    let mut close_received = false;
    let mut close_deadline: Option<Instant> = None;
    let mut in_open = true;
    let mut out_open = true;
    let mut fatal = false;

    // frames the client sent before the 101 landed
    match decoder.feed(&[]) {
        Ok(initial) => frames.extend(initial),
        Err(err) => {
            warn!(peer = %conn.peer, error = %err, "websocket protocol error");
            let _ = send_close(&mut conn.stream, close_code_for(&err), "").await;
            close_sent = true;
            fatal = true;
        }
    }

    'session: while !fatal {
        // drain decoded frames before any further I/O
        while let Some(frame) = frames.pop_front() {
            match frame.opcode {
                Opcode::Ping => {
                    if !close_sent
                        && write_frame(&mut conn.stream, Opcode::Pong, &frame.payload)
                            .await
                            .is_err()
                    {
                        break 'session;
                    }
                    pending.push_back(WsMessage::Ping(frame.payload));
                }
                Opcode::Pong => pending.push_back(WsMessage::Pong(frame.payload)),
                Opcode::Close => {
                    close_received = true;
                    let parsed = match parse_close_payload(&frame.payload) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            debug!(peer = %conn.peer, error = %err, "bad close payload");
                            let _ =
                                send_close(&mut conn.stream, close_code_for(&err), "").await;
                            close_sent = true;
                            break 'session;
                        }
                    };
                    if !close_sent {
                        let code = parsed.as_ref().map(|(code, _)| *code).unwrap_or(1000);
                        let _ = send_close(&mut conn.stream, code, "").await;
                        close_sent = true;
                    }
                    if in_open {
                        let _ = in_tx.try_send(WsMessage::Close(parsed));
                    }
                    break 'session;
                }
                _ => match assembler.push(frame) {
                    Ok(Some(message)) => pending.push_back(message),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(peer = %conn.peer, error = %err, "websocket protocol error");
                        let _ = send_close(&mut conn.stream, close_code_for(&err), "").await;
                        close_sent = true;
                        break 'session;
                    }
                },
            }
        }

        tokio::select! {
            biased;
            changed = conn.shutdown.changed() => {
                let phase = match changed {
                    Ok(()) => *conn.shutdown.borrow(),
                    Err(_) => Phase::Force,
                };
                if phase == Phase::Force {
                    if !close_sent {
                        let _ = send_close(&mut conn.stream, 1001, "server shutting down").await;
                        close_sent = true;
                    }
                    break 'session;
                }
                // draining: sessions run until the grace period forces them
            }
            permit = in_tx.reserve(), if in_open && !pending.is_empty() => {
                match permit {
                    Ok(permit) => {
                        if let Some(message) = pending.pop_front() {
                            permit.send(message);
                        }
                    }
                    Err(_) => {
                        // handler stopped receiving
                        in_open = false;
                        pending.clear();
                    }
                }
            }
            outbound = out_rx.recv(), if out_open => {
                let Some(message) = outbound else {
                    // handler finished and dropped its session handle
                    out_open = false;
                    if !close_sent {
                        let _ = send_close(&mut conn.stream, 1000, "").await;
                        close_sent = true;
                    }
                    if close_received {
                        break 'session;
                    }
                    if close_deadline.is_none() {
                        close_deadline = Some(Instant::now() + ws_config.close_timeout);
                    }
                    continue;
                };
                if let WsMessage::Close(data) = message {
                    if !close_sent {
                        let (code, reason) = data.unwrap_or((1000, String::new()));
                        let _ = send_close(&mut conn.stream, code, &reason).await;
                        close_sent = true;
                        close_deadline = Some(Instant::now() + ws_config.close_timeout);
                    }
                    continue;
                }
                let (opcode, payload) = match message {
                    WsMessage::Text(text) => (Opcode::Text, text.into_bytes()),
                    WsMessage::Binary(data) => (Opcode::Binary, data),
                    WsMessage::Ping(data) => (Opcode::Ping, data),
                    WsMessage::Pong(data) => (Opcode::Pong, data),
                    WsMessage::Close(_) => (Opcode::Close, Vec::new()),
                };
                if write_frame(&mut conn.stream, opcode, &payload).await.is_err() {
                    break 'session;
                }
            }
            _ = maybe_sleep(close_deadline), if close_deadline.is_some() => {
                debug!(peer = %conn.peer, "closing handshake timed out");
                break 'session;
            }
            // reading pauses while decoded messages wait on the handler's
            // queue; the TCP window then backpressures the peer
            read = conn.stream.read(&mut buf), if pending.is_empty() => match read {
                Ok(0) => {
                    if !close_received {
                        // abnormal closure; surfaced to the handler as end
                        // of session rather than a failure
                        debug!(peer = %conn.peer, "websocket closed by peer");
                    }
                    break 'session;
                }
                Ok(n) => match decoder.feed(&buf[..n]) {
                    Ok(new_frames) => frames.extend(new_frames),
                    Err(err) => {
                        warn!(peer = %conn.peer, error = %err, "websocket protocol error");
                        let _ = send_close(&mut conn.stream, close_code_for(&err), "").await;
                        close_sent = true;
                        break 'session;
                    }
                },
                Err(err) => {
                    debug!(peer = %conn.peer, error = %err, "websocket read failed");
                    break 'session;
                }
            },
        }
    }

    // teardown: ending the channels tells the handler the session is over,
    // then it gets the close grace to return before being aborted
    drop(in_tx);
    drop(out_rx);
    if !handler.is_finished()
        && timeout(ws_config.close_timeout, &mut handler).await.is_err()
    {
        debug!(peer = %conn.peer, "aborting websocket handler");
        handler.abort();
    }
    debug!(peer = %conn.peer, "websocket session ended");
}

async fn write_frame(
    stream: &mut TcpStream,
    opcode: Opcode,
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&encode_frame(opcode, payload, true)).await?;
    stream.flush().await
}

async fn send_close(stream: &mut TcpStream, code: u16, reason: &str) -> std::io::Result<()> {
    write_frame(stream, Opcode::Close, &build_close_payload(code, reason)).await
}
