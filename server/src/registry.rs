//! Session registry for the rendezvous server
//!
//! The registry owns every live [`Session`], keyed by the client's remote
//! address. It is responsible for:
//! - Binding a private ephemeral socket per accepted client
//! - Rejecting a second session for an address that already has one
//! - Tearing sessions down, one at a time or all at once on shutdown
//!
//! Sessions hold a weak handle back to the registry so they can remove
//! themselves when their loops fail or the client disconnects.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::console::Console;
use crate::session::{session_id, Session, SessionError, SessionId};

/// All live sessions of one server
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    config: SessionConfig,
    console: Arc<Console>,
    /// Parent of every session's cancellation token
    cancel: CancellationToken,
    /// Distinguishes a session from a later one for the same address
    next_instance: AtomicU64,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        console: Arc<Console>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            console,
            cancel,
            next_instance: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Creates and starts a session for `addr`.
    ///
    /// The duplicate check, bind and insert happen under one write lock, so
    /// two concurrent calls for the same address cannot both succeed.
    pub async fn create(&self, addr: SocketAddr) -> Result<Arc<Session>, SessionError> {
        let id = session_id(&addr);
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(SessionError::Duplicate(id));
        }

        let socket = UdpSocket::bind(SocketAddr::new(self.config.host, 0)).await?;
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let session = Session::spawn(
            instance,
            addr,
            socket,
            &self.config,
            self.cancel.child_token(),
            self.this.clone(),
            Arc::clone(&self.console),
        )?;

        info!("Session {} created on port {}", id, session.port());
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    /// Removes the session for `addr` and waits for it to close.
    ///
    /// The lock is released before waiting so a closing session can never
    /// block the registry.
    pub async fn disconnect(&self, addr: &SocketAddr) -> Result<(), SessionError> {
        let id = session_id(addr);
        let session = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(SessionError::Unknown(id))?;
        session.close().await;
        info!("Session {} disconnected", session.id());
        Ok(())
    }

    pub async fn find(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&session_id(addr)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of the live sessions
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Closes every session concurrently and returns when all are closed.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Session>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        let mut closing = JoinSet::new();
        for session in drained {
            closing.spawn(async move { session.close().await });
        }
        while let Some(result) = closing.join_next().await {
            if let Err(e) = result {
                warn!("Session close task failed: {}", e);
            }
        }
        info!("Closed {} sessions", count);
    }

    /// Self-removal path used by a session's own loops.
    ///
    /// Only removes the entry if it still belongs to `instance`; a session
    /// that was already replaced or drained leaves the registry untouched.
    pub(crate) async fn detach(&self, id: &str, instance: u64) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let owned = sessions
                .get(id)
                .is_some_and(|session| session.instance() == instance);
            if owned {
                sessions.remove(id)
            } else {
                None
            }
        };
        match removed {
            Some(session) => {
                session.close().await;
                info!("Session {} removed", id);
            }
            None => debug!("Session {} already gone", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::command::{
        encode_disconnect, encode_move, encode_nop, encode_string_command, MoveCommand,
    };
    use shared::frame::encode_datagram;
    use shared::NETFLAG_UNRELIABLE;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    fn test_config(message_timeout: Duration) -> SessionConfig {
        SessionConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            message_timeout,
            tick_interval: Duration::from_millis(10),
        }
    }

    fn test_registry(message_timeout: Duration, console: Console) -> Arc<SessionRegistry> {
        SessionRegistry::new(
            test_config(message_timeout),
            Arc::new(console),
            CancellationToken::new(),
        )
    }

    async fn client_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    /// Polls until the registry holds `expected` sessions or two seconds pass.
    async fn wait_for_len(registry: &SessionRegistry, expected: usize) -> bool {
        for _ in 0..200 {
            if registry.len().await == expected {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let client = client_socket().await;
        let addr = client.local_addr().unwrap();

        let session = assert_ok!(registry.create(addr).await);
        assert_eq!(session.remote_addr(), addr);
        assert_ne!(session.port(), 0);
        assert_eq!(session.expected_sequence(), 0);

        let found = registry.find(&addr).await.unwrap();
        assert_eq!(found.port(), session.port());
        assert_eq!(registry.len().await, 1);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let addr = client_socket().await.local_addr().unwrap();

        assert_ok!(registry.create(addr).await);
        let err = assert_err!(registry.create(addr).await);
        assert!(matches!(err, SessionError::Duplicate(id) if id == addr.to_string()));
        assert_eq!(registry.len().await, 1);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_disconnect_unknown() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = assert_err!(registry.disconnect(&addr).await);
        assert!(matches!(err, SessionError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_disconnect_releases_port() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let addr = client_socket().await.local_addr().unwrap();
        let session = registry.create(addr).await.unwrap();
        let local = session.local_addr();

        assert_ok!(registry.disconnect(&addr).await);
        assert!(session.is_closed());
        assert!(registry.find(&addr).await.is_none());

        // Closing twice is harmless.
        session.close().await;

        drop(session);
        assert_ok!(UdpSocket::bind(local).await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let mut sessions = Vec::new();
        for _ in 0..3 {
            let addr = client_socket().await.local_addr().unwrap();
            sessions.push(registry.create(addr).await.unwrap());
        }
        assert_eq!(registry.len().await, 3);

        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert!(sessions.iter().all(|s| s.is_closed()));
    }

    #[tokio::test]
    async fn test_disconnect_command_removes_session() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let client = client_socket().await;
        let addr = client.local_addr().unwrap();
        let session = registry.create(addr).await.unwrap();

        let data = encode_datagram(NETFLAG_UNRELIABLE, 0, &encode_disconnect());
        client.send_to(&data, session.local_addr()).await.unwrap();

        assert!(wait_for_len(&registry, 0).await);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_idle_session_times_out() {
        let registry = test_registry(Duration::from_millis(100), Console::new());
        let addr = client_socket().await.local_addr().unwrap();
        let session = registry.create(addr).await.unwrap();

        assert!(wait_for_len(&registry, 0).await);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_move_is_recorded() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let client = client_socket().await;
        let addr = client.local_addr().unwrap();
        let session = registry.create(addr).await.unwrap();

        let cmd = MoveCommand {
            ping: 0.5,
            movement: [200, 0, -50],
            buttons: 1,
            ..MoveCommand::default()
        };
        let data = encode_datagram(NETFLAG_UNRELIABLE, 0, &encode_move(&cmd).unwrap());
        client.send_to(&data, session.local_addr()).await.unwrap();

        let mut recorded = None;
        for _ in 0..200 {
            recorded = session.last_move();
            if recorded.is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let recorded = recorded.expect("no move recorded");
        assert_approx_eq!(recorded.ping, 0.5);
        assert_eq!(recorded, cmd);
        assert_eq!(session.expected_sequence(), 1);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_string_command_reaches_console() {
        let console = Console::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        console
            .commands
            .add("ping", move |args| {
                if args == ["now"] {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap();

        let registry = test_registry(Duration::from_secs(5), console);
        let client = client_socket().await;
        let addr = client.local_addr().unwrap();
        let session = registry.create(addr).await.unwrap();

        let data = encode_datagram(NETFLAG_UNRELIABLE, 0, &encode_string_command("ping now"));
        client.send_to(&data, session.local_addr()).await.unwrap();
        // Unknown commands are logged, not fatal.
        let data = encode_datagram(NETFLAG_UNRELIABLE, 1, &encode_string_command("nosuch"));
        client.send_to(&data, session.local_addr()).await.unwrap();

        for _ in 0..200 {
            if hits.load(Ordering::SeqCst) == 1 && session.expected_sequence() == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.len().await, 1);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_stale_datagram_dropped() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let client = client_socket().await;
        let addr = client.local_addr().unwrap();
        let session = registry.create(addr).await.unwrap();
        let payload = encode_string_command("status");

        for seq in [5u32, 3] {
            let data = encode_datagram(NETFLAG_UNRELIABLE, seq, &payload);
            client.send_to(&data, session.local_addr()).await.unwrap();
        }
        for _ in 0..50 {
            if session.expected_sequence() == 6 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(session.expected_sequence(), 6);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_foreign_peer_ignored() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let client = client_socket().await;
        let stranger = client_socket().await;
        let session = registry
            .create(client.local_addr().unwrap())
            .await
            .unwrap();

        let data = encode_datagram(NETFLAG_UNRELIABLE, 0, &encode_disconnect());
        stranger.send_to(&data, session.local_addr()).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(session.expected_sequence(), 0);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_invalid_instruction_closes_session() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let client = client_socket().await;
        let session = registry
            .create(client.local_addr().unwrap())
            .await
            .unwrap();

        let data = encode_datagram(NETFLAG_UNRELIABLE, 0, &[42]);
        client.send_to(&data, session.local_addr()).await.unwrap();

        assert!(wait_for_len(&registry, 0).await);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_foreign_traffic_does_not_keep_idle_session_alive() {
        let registry = test_registry(Duration::from_millis(150), Console::new());
        let client = client_socket().await;
        let stranger = client_socket().await;
        let session = registry
            .create(client.local_addr().unwrap())
            .await
            .unwrap();

        // The client stays silent while a stranger keeps sending.
        let nop = encode_datagram(NETFLAG_UNRELIABLE, 0, &encode_nop());
        for _ in 0..20 {
            let _ = stranger.send_to(&nop, session.local_addr()).await;
            sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(registry.len().await, 0);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_truncated_datagram_closes_session() {
        let registry = test_registry(Duration::from_secs(5), Console::new());
        let client = client_socket().await;
        let session = registry
            .create(client.local_addr().unwrap())
            .await
            .unwrap();

        // Declares 20 bytes but carries only the 8-byte header.
        let data = [0u8, 16, 0, 20, 0, 0, 0, 0];
        client.send_to(&data, session.local_addr()).await.unwrap();

        assert!(wait_for_len(&registry, 0).await);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_client_cannot_set_server_variables() {
        let console = Arc::new(Console::with_defaults());
        let registry = SessionRegistry::new(
            test_config(Duration::from_secs(5)),
            Arc::clone(&console),
            CancellationToken::new(),
        );
        let client = client_socket().await;
        let session = registry
            .create(client.local_addr().unwrap())
            .await
            .unwrap();

        for (seq, line) in ["hostname stolen", "maxplayers 8"].into_iter().enumerate() {
            let data = encode_datagram(NETFLAG_UNRELIABLE, seq as u32, &encode_string_command(line));
            client.send_to(&data, session.local_addr()).await.unwrap();
        }
        for _ in 0..100 {
            if session.expected_sequence() == 2 && session.pending_instructions() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(console.cvars.get_string("hostname").as_deref(), Some("UNNAMED"));
        assert_eq!(console.cvars.get_float("maxplayers"), Some(1.0));
        assert_eq!(registry.len().await, 1);

        registry.close_all().await;
    }
}
