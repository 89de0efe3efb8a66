//! Listener and shutdown orchestrator
//!
//! The server owns the listening socket and the shared state. Everything
//! runs on a current-thread runtime inside a `LocalSet`: the accept loop
//! spawns one local task per connection and shares state through
//! `Rc<RefCell<...>>`, so no lock ever guards the registries.
//!
//! Shutdown is a phase broadcast. `Draining` stops the accept loop, closes
//! idle keep-alive connections, and lets active requests finish; when the
//! grace period runs out, `Force` tells WebSocket sessions to perform
//! their closing handshake and whatever is still open gets aborted.

use std::net::SocketAddr;
use std::rc::Rc;

use core::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hearth_core::{HearthError, Result, ServerConfig};

use crate::app::App;
use crate::conn::Connection;
use crate::state::{ConnHandle, ConnPhase, ServerState, SharedState};

/// Shutdown phases broadcast to every connection task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Force,
}

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

pub struct Server {
    config: Rc<ServerConfig>,
    app: Rc<dyn App>,
    state: SharedState,
    shutdown: Rc<watch::Sender<Phase>>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
}

/// Handle for coordinating a running server from other tasks
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Rc<watch::Sender<Phase>>,
    local_addr: Option<SocketAddr>,
}

impl ServerHandle {
    /// Begin graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(Phase::Draining);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Server {
    pub fn new(config: ServerConfig, app: Rc<dyn App>) -> Result<Self> {
        config
            .validate()
            .map_err(|reason| HearthError::Configuration { reason })?;
        let state = ServerState::new(config.default_headers.clone());
        let (shutdown, _) = watch::channel(Phase::Running);
        Ok(Self {
            config: Rc::new(config),
            app,
            state,
            shutdown: Rc::new(shutdown),
            listener: None,
            local_addr: None,
        })
    }

    /// Bind the listening socket. `serve` binds implicitly when this has
    /// not been called; calling it first makes `local_addr` available
    /// before accepting.
    pub fn bind(&mut self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| {
                HearthError::config_error(format!("invalid bind address: {}", self.config.host))
            })?;

        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        if self.config.reuse_port {
            socket.set_reuseport(true)?;
        }
        socket.bind(addr)?;
        let listener = socket.listen(self.config.backlog)?;
        self.local_addr = Some(listener.local_addr()?);
        self.listener = Some(listener);
        Ok(())
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Accept connections until shutdown begins, then drain. Must run
    /// inside a `LocalSet`.
    pub async fn serve(mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind()?;
        }
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => return Err(HearthError::config_error("listener missing after bind")),
        };
        if let Some(addr) = self.local_addr {
            info!(%addr, "listening");
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(err) if is_fatal_accept_error(&err) => {
                        return Err(err.into());
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        // new connections stop here
        drop(listener);
        info!("draining connections");
        self.drain().await;
        info!(
            total_requests = self.state.borrow().total_requests,
            "server stopped"
        );
        Ok(())
    }

    /// Serve until SIGINT or SIGTERM arrives, then shut down gracefully
    pub async fn run(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::task::spawn_local(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            let _ = shutdown.send(Phase::Draining);
        });
        self.serve().await
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let local = match (stream.local_addr(), self.local_addr) {
            (Ok(addr), _) => addr,
            (Err(_), Some(addr)) => addr,
            (Err(_), None) => peer,
        };
        let id = self.state.borrow_mut().allocate_conn_id();
        let conn = Connection::new(
            id,
            stream,
            peer,
            local,
            self.config.clone(),
            self.state.clone(),
            self.app.clone(),
            self.shutdown.subscribe(),
        );
        let task = tokio::task::spawn_local(conn.run());
        self.state.borrow_mut().register_connection(
            id,
            ConnHandle {
                peer,
                phase: ConnPhase::AwaitingRequestLine,
                websocket: false,
                abort: task.abort_handle(),
            },
        );
        debug!(%peer, id, "connection accepted");
    }

    /// Poll the registry until it empties or the grace period elapses,
    /// then force-close the rest
    async fn drain(&self) {
        let _ = self.shutdown.send(Phase::Draining);
        let deadline = Instant::now() + self.config.graceful_shutdown_timeout;
        let mut poll = tokio::time::interval(Duration::from_millis(100));

        loop {
            if self.state.borrow().connections.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            poll.tick().await;
        }

        let remaining = self.state.borrow().connections.len();
        warn!(remaining, "grace period elapsed; forcing connections closed");
        let _ = self.shutdown.send(Phase::Force);

        // a beat for WebSocket sessions to emit their close frames
        tokio::time::sleep(Duration::from_millis(100)).await;
        let aborts: Vec<_> = self
            .state
            .borrow()
            .connections
            .values()
            .map(|handle| handle.abort.clone())
            .collect();
        for abort in aborts {
            abort.abort();
        }
    }
}

/// Accept errors that cannot be retried
fn is_fatal_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    !matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
