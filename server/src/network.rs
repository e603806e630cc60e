//! Server control loop on the shared rendezvous socket
//!
//! Every client starts here with a connect request. The loop validates the
//! handshake, enforces capacity and redirects accepted clients to the private
//! port of their new session. After that the client never talks to this socket
//! again unless it lost the accept reply and retries.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shared::frame::{accept_frame, decode_control_frame, reject_frame};
use shared::{validate_connect, HandshakeError, CCREQ_CONNECT, MAX_DATAGRAM};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::{check_max_players, ConfigError, ServerConfig};
use crate::console::Console;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionError};
use crate::transport::{is_transient, send_datagram, SendError};

/// Reject reason sent when the registry is at capacity
pub const REJECT_FULL: &str = "Server is full.\n";
/// Reject reason sent for a protocol version mismatch
pub const REJECT_VERSION: &str = "Incompatible version.\n";

/// Server lifecycle; `Stopping` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Waiting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("server socket error: {0}")]
    Io(#[from] io::Error),
}

/// The rendezvous server and the sessions it owns
#[derive(Debug)]
pub struct Server {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    config: ServerConfig,
    max_players: AtomicUsize,
    state: Mutex<ServerState>,
    sessions: Arc<SessionRegistry>,
    cancel: CancellationToken,
    /// Held by `run` for its whole duration
    running: tokio::sync::Mutex<()>,
    closed: OnceCell<()>,
}

impl Server {
    /// Validates `config` and binds the rendezvous socket.
    ///
    /// Failing to bind is the one error the process cannot recover from.
    pub async fn bind(config: ServerConfig, console: Arc<Console>) -> Result<Self, ServerError> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr()).await?;
        let local_addr = socket.local_addr()?;
        info!("Server listening on {}", local_addr);

        let cancel = CancellationToken::new();
        let sessions = SessionRegistry::new(config.session_config(), console, cancel.child_token());

        Ok(Server {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
            max_players: AtomicUsize::new(config.max_players),
            config,
            state: Mutex::new(ServerState::Waiting),
            sessions,
            cancel,
            running: tokio::sync::Mutex::new(()),
            closed: OnceCell::new(),
        })
    }

    /// Runs the control loop.
    ///
    /// Returns `Ok` when shut down or when an unhandled control command
    /// arrives, and `Err` on a malformed handshake or a socket failure.
    pub async fn run(&self) -> Result<(), ServerError> {
        let _running = self.running.lock().await;
        let socket = {
            let mut state = self.state.lock();
            if *state == ServerState::Stopping {
                return Ok(());
            }
            let Some(socket) = self.socket.lock().clone() else {
                return Ok(());
            };
            *state = ServerState::Running;
            socket
        };

        let result = self.control_loop(&socket).await;
        match &result {
            Ok(()) => info!("Control loop stopped"),
            Err(e) => error!("Control loop failed: {}", e),
        }
        result
    }

    async fn control_loop(&self, socket: &UdpSocket) -> Result<(), ServerError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            // The short deadline only bounds each read; expiry is not an error.
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = timeout(self.config.control_read_timeout, socket.recv_from(&mut buf)) => read,
            };
            let (len, from) = match read {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_transient(&e) => {
                    debug!("Transient read error on control socket: {}", e);
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };

            let frame = match decode_control_frame(&buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Dropping {} bytes from {}: {}", len, from, e);
                    continue;
                }
            };

            match frame.command {
                CCREQ_CONNECT => self.handle_connect(socket, from, frame.payload).await?,
                other => {
                    warn!(
                        "Unknown control sequence {:#04x} from {}, stopping",
                        other, from
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connect(
        &self,
        socket: &UdpSocket,
        from: SocketAddr,
        payload: &[u8],
    ) -> Result<(), ServerError> {
        match validate_connect(payload) {
            Ok(()) => {}
            Err(HandshakeError::IncompatibleVersion { got, want }) => {
                info!("Rejecting {}: protocol {} does not match {}", from, got, want);
                Self::reply(socket, &reject_frame(REJECT_VERSION), from).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        // A client retrying a lost accept gets its existing port back.
        if let Some(session) = self.sessions.find(&from).await {
            Self::reacknowledge(socket, &session).await;
            return Ok(());
        }

        if self.sessions.len().await >= self.max_players() {
            info!("Rejecting {}: server is full", from);
            Self::reply(socket, &reject_frame(REJECT_FULL), from).await;
            return Ok(());
        }

        let session = match self.sessions.create(from).await {
            Ok(session) => session,
            Err(SessionError::Duplicate(_)) => {
                if let Some(session) = self.sessions.find(&from).await {
                    Self::reacknowledge(socket, &session).await;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = send_datagram(socket, &accept_frame(session.port()), from).await {
            warn!("Failed to acknowledge {}: {}; dropping its session", from, e);
            if let Err(e) = self.sessions.disconnect(&from).await {
                debug!("Session for {} already gone: {}", from, e);
            }
            return Ok(());
        }
        info!("Accepted {} on port {}", from, session.port());
        Ok(())
    }

    async fn reacknowledge(socket: &UdpSocket, session: &Session) {
        debug!(
            "Re-acknowledging {} on port {}",
            session.remote_addr(),
            session.port()
        );
        Self::reply(socket, &accept_frame(session.port()), session.remote_addr()).await;
    }

    /// Replies that need no cleanup when they fail.
    async fn reply(socket: &UdpSocket, frame: &[u8], to: SocketAddr) {
        if let Err(e) = send_datagram(socket, frame, to).await {
            warn!("Failed to reply to {}: {}", to, e);
        }
    }

    /// Stops the control loop, closes every session and releases the socket.
    ///
    /// Idempotent; concurrent callers all return once shutdown is complete.
    pub async fn shutdown(&self) {
        self.closed
            .get_or_init(|| async {
                *self.state.lock() = ServerState::Stopping;
                info!("Shutting down server on {}", self.local_addr);
                self.cancel.cancel();
                let _running = self.running.lock().await;
                self.sessions.close_all().await;
                drop(self.socket.lock().take());
                info!("Server stopped");
            })
            .await;
    }

    /// Changes capacity; only allowed before the control loop has started.
    pub fn set_max_players(&self, max_players: usize) -> Result<(), ConfigError> {
        check_max_players(max_players)?;
        let state = self.state.lock();
        if *state != ServerState::Waiting {
            return Err(ConfigError::NotIdle);
        }
        self.max_players.store(max_players, Ordering::Relaxed);
        Ok(())
    }

    pub fn max_players(&self) -> usize {
        self.max_players.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.sessions().await
    }
}
