//! Per-connection state machine
//!
//! One task per accepted socket. The task feeds bytes to the sans-I/O
//! parser, enforces the timer discipline (at most one of the request,
//! response, and keep-alive timers is armed at any instant; expiry closes
//! the connection unconditionally), applies admission control at
//! headers-complete, dispatches complete requests to the application, and
//! writes responses back with keep-alive negotiation.

use std::net::SocketAddr;
use std::rc::Rc;

use core::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use hearth_core::admission::{self, AdmissionDecision};
use hearth_core::response::{body_suppressed, ChunkedEncoder, ResponseEncoder};
use hearth_core::websocket::{
    accept_key, build_accept_response, negotiate_subprotocol, validate_upgrade,
};
use hearth_core::{
    Body, Headers, Method, ParseError, ParseEvent, Request, RequestParser, Response, ServerConfig,
    Version,
};

use crate::app::App;
use crate::server::Phase;
use crate::state::{ConnGuard, ConnId, ConnPhase, SharedState, TaskSlot};
use crate::ws;

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Request,
    Response,
    KeepAlive,
}

/// Sleep until a deadline, or forever when none is armed
pub(crate) async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

enum Persistence {
    KeepAlive,
    Close,
}

enum ReadOutcome {
    Data(usize),
    Eof,
    TimedOut,
    Drain,
    Force,
}

/// Partial request, accumulated from parse events
#[derive(Default)]
struct Assembly {
    method: Option<Method>,
    target: String,
    version: Option<Version>,
    headers: Headers,
    body: Vec<u8>,
}

pub(crate) struct Connection {
    pub(crate) id: ConnId,
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) local: SocketAddr,
    pub(crate) config: Rc<ServerConfig>,
    pub(crate) state: SharedState,
    pub(crate) app: Rc<dyn App>,
    pub(crate) shutdown: watch::Receiver<Phase>,
    parser: RequestParser,
    /// The single armed timer, if any
    deadline: Option<(TimerKind, Instant)>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnId,
        stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        config: Rc<ServerConfig>,
        state: SharedState,
        app: Rc<dyn App>,
        shutdown: watch::Receiver<Phase>,
    ) -> Self {
        let parser = RequestParser::new(config.parse.clone());
        Self {
            id,
            stream,
            peer,
            local,
            config,
            state,
            app,
            shutdown,
            parser,
            deadline: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let _guard = ConnGuard::new(self.state.clone(), self.id);
        debug!(peer = %self.peer, id = self.id, "connection opened");

        loop {
            match self.serve_one().await {
                Ok(Persistence::KeepAlive) => {
                    self.parser.reset();
                    self.set_phase(ConnPhase::KeepAliveIdle);
                    self.arm(TimerKind::KeepAlive);
                }
                Ok(Persistence::Close) => break,
                Err(err) => {
                    debug!(peer = %self.peer, error = %err, "connection error");
                    break;
                }
            }
        }

        self.set_phase(ConnPhase::Closing);
        let _ = self.stream.shutdown().await;
        debug!(peer = %self.peer, id = self.id, "connection closed");
    }

    // ------------------------------------------------------------------
    // Request cycle
    // ------------------------------------------------------------------

    /// Read, parse, dispatch, and answer exactly one request
    async fn serve_one(&mut self) -> std::result::Result<Persistence, std::io::Error> {
        if self.deadline.is_none() {
            // fresh connection; keep-alive resumes arrive with the timer
            // already armed by the run loop
            self.set_phase(ConnPhase::AwaitingRequestLine);
            self.arm(TimerKind::Request);
        }

        let mut assembly = Assembly::default();
        let mut summary = None;
        let mut rejected = false;
        let mut complete = false;
        let mut buf = vec![0u8; 8192];

        // pipelined bytes from the previous request come first
        let mut events = match self.parser.feed(&[]) {
            Ok(events) => events,
            Err(err) => return self.reject_malformed(err).await,
        };

        loop {
            for event in events.drain(..) {
                match event {
                    ParseEvent::RequestLine {
                        method,
                        target,
                        version,
                    } => {
                        self.set_phase(ConnPhase::ReadingHeaders);
                        assembly.method = Some(method);
                        assembly.target = target;
                        assembly.version = Some(version);
                    }
                    ParseEvent::Header { name, value } => assembly.headers.push(name, value),
                    ParseEvent::HeadersComplete(head) => {
                        // the head is in; from here the response timer runs
                        self.arm(TimerKind::Response);
                        self.set_phase(ConnPhase::ReadingBody);
                        let decision = {
                            let st = self.state.borrow();
                            admission::check(
                                self.config.limit_concurrency,
                                st.connections.len(),
                                st.in_flight.len(),
                            )
                        };
                        if decision == AdmissionDecision::Reject {
                            warn!(peer = %self.peer, "exceeded concurrency limit");
                            rejected = true;
                        }
                        summary = Some(head);
                    }
                    ParseEvent::BodyChunk(chunk) => assembly.body.extend_from_slice(&chunk),
                    ParseEvent::MessageComplete => complete = true,
                }
            }
            if complete {
                break;
            }

            match self.read_more(&mut buf).await {
                ReadOutcome::Data(n) => {
                    if matches!(self.deadline, Some((TimerKind::KeepAlive, _))) {
                        // first bytes of the next request cancel the idle
                        // timer and start the request timer
                        self.set_phase(ConnPhase::AwaitingRequestLine);
                        self.arm(TimerKind::Request);
                    }
                    events = match self.parser.feed(&buf[..n]) {
                        Ok(events) => events,
                        Err(err) => return self.reject_malformed(err).await,
                    };
                }
                ReadOutcome::Eof => return Ok(Persistence::Close),
                ReadOutcome::TimedOut => {
                    debug!(peer = %self.peer, "timer expired; closing");
                    return Ok(Persistence::Close);
                }
                ReadOutcome::Drain => {
                    if assembly.method.is_some() {
                        // an active request runs to completion during drain
                        continue;
                    }
                    return Ok(Persistence::Close);
                }
                ReadOutcome::Force => return Ok(Persistence::Close),
            }
        }

        let (Some(method), Some(version), Some(summary)) =
            (assembly.method, assembly.version, summary)
        else {
            return Ok(Persistence::Close);
        };

        let request = match Request::from_parts(
            method,
            assembly.target,
            version,
            assembly.headers,
            assembly.body,
            summary.expect_continue,
            summary.upgrade_websocket,
            self.peer,
            self.local,
            self.config.http_scheme(),
        ) {
            Ok(request) => request,
            Err(err) => return self.reject_malformed(err).await,
        };

        let draining = *self.shutdown.borrow() != Phase::Running;
        let keep_alive = request.wants_keep_alive() && !draining;

        if rejected {
            // the one rejected request gets a canned responder; the
            // connection itself may persist
            let path = request.path.clone();
            let response = Response::service_unavailable();
            return self
                .finish_response(method, version, &path, response, keep_alive)
                .await;
        }

        if request.upgrade_websocket {
            return self.upgrade_websocket(request).await;
        }

        self.dispatch(request, keep_alive).await
    }

    /// Run the application call as its own task, racing the response timer
    async fn dispatch(
        &mut self,
        request: Request,
        keep_alive: bool,
    ) -> std::result::Result<Persistence, std::io::Error> {
        self.set_phase(ConnPhase::Dispatched);
        let method = request.method;
        let version = request.version;
        let path = request.path.clone();

        let app = self.app.clone();
        let slot = TaskSlot::claim(self.state.clone());
        let mut task = tokio::task::spawn_local(async move {
            let result = app.call(request).await;
            drop(slot);
            result
        });

        let deadline = self.deadline_instant();
        let joined = tokio::select! {
            joined = &mut task => Some(joined),
            _ = sleep_until(deadline) => None,
        };

        let (response, keep_alive) = match joined {
            None => {
                task.abort();
                warn!(peer = %self.peer, method = %method, path = %path, "response timed out; closing");
                return Ok(Persistence::Close);
            }
            Some(Ok(Ok(response))) => {
                let keep_alive = keep_alive && !response.wants_close();
                (response, keep_alive)
            }
            Some(Ok(Err(err))) => {
                error!(peer = %self.peer, method = %method, path = %path, error = %err, "application error");
                (Response::internal_error(), false)
            }
            Some(Err(join_err)) => {
                error!(peer = %self.peer, method = %method, path = %path, error = %join_err, "handler task failed");
                (Response::internal_error(), false)
            }
        };

        self.finish_response(method, version, &path, response, keep_alive)
            .await
    }

    /// Write the response within what remains of the response timer, then
    /// settle persistence
    async fn finish_response(
        &mut self,
        method: Method,
        version: Version,
        path: &str,
        response: Response,
        keep_alive: bool,
    ) -> std::result::Result<Persistence, std::io::Error> {
        self.set_phase(ConnPhase::WritingResponse);
        // shutdown may have begun while the handler ran
        let keep_alive = keep_alive && *self.shutdown.borrow() == Phase::Running;
        let status = response.status;
        let remaining = self
            .deadline_instant()
            .saturating_duration_since(Instant::now());

        match timeout(
            remaining,
            self.write_response(response, version, method == Method::Head, keep_alive),
        )
        .await
        {
            Err(_) => {
                warn!(peer = %self.peer, "response write timed out; closing");
                return Ok(Persistence::Close);
            }
            Ok(Err(err)) => {
                debug!(peer = %self.peer, error = %err, "write failed");
                return Ok(Persistence::Close);
            }
            Ok(Ok(())) => {}
        }

        self.cancel_timer();
        self.state.borrow_mut().total_requests += 1;
        if self.config.access_log {
            info!(
                target: "hearth::access",
                peer = %self.peer,
                method = %method,
                path = %path,
                status = status.0,
                "request complete"
            );
        }

        Ok(if keep_alive {
            Persistence::KeepAlive
        } else {
            Persistence::Close
        })
    }

    async fn write_response(
        &mut self,
        response: Response,
        version: Version,
        head_only: bool,
        keep_alive: bool,
    ) -> std::io::Result<()> {
        let default_headers = self.state.borrow().default_headers.clone();
        let head = ResponseEncoder::encode_head(
            &response,
            version,
            keep_alive,
            self.config.keep_alive_timeout,
            &default_headers,
        );
        self.stream.write_all(&head).await?;

        if !head_only && !body_suppressed(response.status) {
            match response.body {
                Body::Empty => {}
                Body::Bytes(bytes) => self.stream.write_all(&bytes).await?,
                Body::Stream(mut rx) => {
                    while let Some(chunk) = rx.recv().await {
                        if chunk.is_empty() {
                            continue;
                        }
                        self.stream.write_all(&ChunkedEncoder::encode(&chunk)).await?;
                        self.stream.flush().await?;
                    }
                    self.stream.write_all(ChunkedEncoder::finish()).await?;
                }
            }
        }
        self.stream.flush().await
    }

    /// Best-effort error response for malformed input, then close
    async fn reject_malformed(
        &mut self,
        err: ParseError,
    ) -> std::result::Result<Persistence, std::io::Error> {
        warn!(peer = %self.peer, error = %err, "malformed request");
        let response = match err {
            ParseError::BodyTooLarge { .. } => Response::payload_too_large(),
            _ => Response::bad_request(&err.to_string()),
        };
        // the version may not be known yet; answer in the protocol we speak
        let _ = timeout(
            Duration::from_secs(1),
            self.write_response(response, Version::Http11, false, false),
        )
        .await;
        Ok(Persistence::Close)
    }

    // ------------------------------------------------------------------
    // WebSocket upgrade
    // ------------------------------------------------------------------

    async fn upgrade_websocket(
        &mut self,
        request: Request,
    ) -> std::result::Result<Persistence, std::io::Error> {
        let method = request.method;
        let version = request.version;
        let path = request.path.clone();

        if !self.app.websocket_enabled() {
            let response = Response::bad_request("websocket upgrade not supported");
            return self
                .finish_response(method, version, &path, response, false)
                .await;
        }

        let key = match validate_upgrade(&request) {
            Ok(key) => key,
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "websocket handshake rejected");
                let response = Response::bad_request(&err.to_string());
                return self
                    .finish_response(method, version, &path, response, false)
                    .await;
            }
        };

        let subprotocol = match (
            request.headers.get("sec-websocket-protocol"),
            self.app.subprotocols(),
        ) {
            (Some(offer), Some(supported)) => negotiate_subprotocol(offer, &supported),
            _ => None,
        };

        let accept = accept_key(&key);
        let raw = build_accept_response(&accept, subprotocol.as_deref());
        self.stream.write_all(&raw).await?;
        self.stream.flush().await?;

        // frames carry their own liveness rules; the HTTP timers stop here
        self.cancel_timer();
        self.set_phase(ConnPhase::Dispatched);
        {
            let mut st = self.state.borrow_mut();
            st.set_websocket(self.id);
            st.total_requests += 1;
        }
        if self.config.access_log {
            info!(
                target: "hearth::access",
                peer = %self.peer,
                method = %method,
                path = %path,
                status = 101u16,
                "websocket session opened"
            );
        }

        let leftover = self.parser.take_remaining();
        ws::drive(self, subprotocol, leftover).await;
        Ok(Persistence::Close)
    }

    // ------------------------------------------------------------------
    // Timers and reads
    // ------------------------------------------------------------------

    /// Arm one timer, replacing whichever was armed before
    fn arm(&mut self, kind: TimerKind) {
        let duration = match kind {
            TimerKind::Request => self.config.request_timeout,
            TimerKind::Response => self.config.response_timeout,
            TimerKind::KeepAlive => self.config.keep_alive_timeout,
        };
        self.deadline = Some((kind, Instant::now() + duration));
    }

    fn cancel_timer(&mut self) {
        self.deadline = None;
    }

    fn deadline_instant(&self) -> Instant {
        match self.deadline {
            Some((_, at)) => at,
            None => Instant::now() + self.config.response_timeout,
        }
    }

    fn set_phase(&self, phase: ConnPhase) {
        self.state.borrow_mut().set_phase(self.id, phase);
    }

    async fn read_more(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let deadline = self.deadline.map(|(_, at)| at);
        tokio::select! {
            biased;
            changed = self.shutdown.changed() => match changed {
                Ok(()) => {
                    if *self.shutdown.borrow() == Phase::Force {
                        ReadOutcome::Force
                    } else {
                        ReadOutcome::Drain
                    }
                }
                Err(_) => ReadOutcome::Force,
            },
            _ = maybe_sleep(deadline) => ReadOutcome::TimedOut,
            read = self.stream.read(buf) => match read {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => ReadOutcome::Data(n),
                Err(err) => {
                    // transport faults close silently
                    debug!(peer = %self.peer, error = %err, "read failed");
                    ReadOutcome::Eof
                }
            },
        }
    }
}
