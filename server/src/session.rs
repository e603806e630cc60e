//! Per-client sessions.
//!
//! A session owns a private UDP socket and runs two tasks: the network loop
//! decodes datagrams and queues instructions, the execution loop drains the
//! queue on a fixed tick. Network decoding and command effects therefore never
//! overlap for the same client.
//!
//! Teardown is `cancel -> release socket -> wait for the network loop to
//! report exit`. The socket is only closed once the loop has dropped its
//! handle, so a receive can never run on a closed socket.

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use shared::command::{read_console_string, ClientCommand, CommandError, MoveCommand};
use shared::frame::{decode_datagram, Datagram, FrameError};
use shared::MAX_DATAGRAM;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::console::Console;
use crate::registry::SessionRegistry;
use crate::transport::is_transient;

/// Canonical registry key of a client: its remote address as a string
pub type SessionId = String;

pub fn session_id(addr: &SocketAddr) -> SessionId {
    addr.to_string()
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("duplicate session: {0}")]
    Duplicate(SessionId),
    #[error("unknown session: {0}")]
    Unknown(SessionId),
    #[error("time out: {0}")]
    Timeout(SessionId),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("session socket error: {0}")]
    Io(#[from] io::Error),
}

/// Deferred work decoded from a client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Disconnect,
    /// Raw move body, parsed when executed
    Move(Vec<u8>),
    /// Raw console string body, extracted when executed
    StringCommand(Vec<u8>),
}

impl Instruction {
    /// `None` for commands with nothing to run.
    pub fn from_command(command: ClientCommand<'_>) -> Option<Self> {
        match command {
            ClientCommand::Nop => None,
            ClientCommand::Disconnect => Some(Instruction::Disconnect),
            ClientCommand::Move(body) => Some(Instruction::Move(body.to_vec())),
            ClientCommand::StringCommand(body) => Some(Instruction::StringCommand(body.to_vec())),
        }
    }
}

/// Producer/consumer queue between the two session loops
#[derive(Debug, Default)]
pub struct InstructionQueue {
    ops: Mutex<Vec<Instruction>>,
}

impl InstructionQueue {
    pub fn push(&self, op: Instruction) {
        self.ops.lock().push(op);
    }

    /// Takes everything queued so far, in order.
    pub fn drain(&self) -> Vec<Instruction> {
        std::mem::take(&mut *self.ops.lock())
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }
}

/// What the inbox did with a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Control-flagged or reliable; nothing uses those on a session socket.
    Ignored,
    /// Behind the expected sequence.
    Stale,
    Accepted,
}

/// Sequence tracking and command extraction for one session
#[derive(Debug)]
pub struct Inbox {
    expected: Arc<AtomicU32>,
    queue: Arc<InstructionQueue>,
}

impl Inbox {
    pub fn new(queue: Arc<InstructionQueue>) -> Self {
        Self::starting_at(queue, 0)
    }

    pub fn starting_at(queue: Arc<InstructionQueue>, expected: u32) -> Self {
        Self {
            expected: Arc::new(AtomicU32::new(expected)),
            queue,
        }
    }

    pub fn expected_sequence(&self) -> u32 {
        self.expected.load(Ordering::Relaxed)
    }

    /// Handles one decoded datagram.
    ///
    /// Datagrams ahead of the expected sequence are accepted and the gap is
    /// skipped: there is no retransmission to ask for missed ones.
    pub fn handle(&mut self, dgram: &Datagram<'_>) -> Result<Delivery, SessionError> {
        if dgram.is_control() || !dgram.is_unreliable() {
            return Ok(Delivery::Ignored);
        }
        let expected = self.expected_sequence();
        if dgram.is_before(expected) {
            return Ok(Delivery::Stale);
        }
        if dgram.sequence() > expected {
            trace!(
                "Skipping {} missed datagrams",
                dgram.sequence() - expected
            );
        }
        self.expected
            .store(dgram.sequence().wrapping_add(1), Ordering::Relaxed);

        let command = ClientCommand::decode(dgram.payload())?;
        if let Some(op) = Instruction::from_command(command) {
            self.queue.push(op);
        }
        Ok(Delivery::Accepted)
    }
}

/// State both loops and the registry handle can see
#[derive(Debug)]
struct SessionShared {
    id: SessionId,
    instance: u64,
    remote_addr: SocketAddr,
    queue: Arc<InstructionQueue>,
    expected: Arc<AtomicU32>,
    last_move: Mutex<Option<MoveCommand>>,
    registry: Weak<SessionRegistry>,
    console: Arc<Console>,
}

impl SessionShared {
    /// Removes this session from its registry, if both still exist.
    async fn detach(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.id, self.instance).await;
        }
    }
}

/// One connected client, owned by the [`SessionRegistry`]
#[derive(Debug)]
pub struct Session {
    shared: Arc<SessionShared>,
    local_addr: SocketAddr,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    cancel: CancellationToken,
    net_exited: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl Session {
    /// Wraps `socket` in a session and starts its network and execution loops.
    pub(crate) fn spawn(
        instance: u64,
        remote_addr: SocketAddr,
        socket: UdpSocket,
        config: &SessionConfig,
        cancel: CancellationToken,
        registry: Weak<SessionRegistry>,
        console: Arc<Console>,
    ) -> io::Result<Arc<Session>> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let queue = Arc::new(InstructionQueue::default());
        let inbox = Inbox::new(Arc::clone(&queue));
        let shared = Arc::new(SessionShared {
            id: session_id(&remote_addr),
            instance,
            remote_addr,
            queue,
            expected: Arc::clone(&inbox.expected),
            last_move: Mutex::new(None),
            registry,
            console,
        });
        let (exit_tx, net_exited) = watch::channel(false);

        let network = NetworkLoop {
            shared: Arc::clone(&shared),
            socket: Arc::clone(&socket),
            inbox,
            cancel: cancel.clone(),
            message_timeout: config.message_timeout,
        };
        tokio::spawn(async move {
            let shared = Arc::clone(&network.shared);
            let outcome = network.run().await;
            exit_tx.send_replace(true);
            match outcome {
                Ok(()) => debug!("Session {} network loop stopped", shared.id),
                Err(SessionError::Timeout(_)) => {
                    info!("Session {} timed out", shared.id);
                    shared.detach().await;
                }
                Err(e) => {
                    warn!("Closing session {} from error: {}", shared.id, e);
                    shared.detach().await;
                }
            }
        });

        let executor = Executor {
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
            tick_interval: config.tick_interval,
        };
        tokio::spawn(async move {
            let shared = Arc::clone(&executor.shared);
            if let Err(e) = executor.run().await {
                warn!("Session {} stopped executing: {}", shared.id, e);
                shared.detach().await;
            }
        });

        Ok(Arc::new(Session {
            shared,
            local_addr,
            socket: Mutex::new(Some(socket)),
            cancel,
            net_exited,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub(crate) fn instance(&self) -> u64 {
        self.shared.instance
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The ephemeral port the client was redirected to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn expected_sequence(&self) -> u32 {
        self.shared.expected.load(Ordering::Relaxed)
    }

    pub fn last_move(&self) -> Option<MoveCommand> {
        *self.shared.last_move.lock()
    }

    pub fn pending_instructions(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tears the session down and returns once its network loop has exited.
    ///
    /// Only the first call cancels and releases the socket; every call waits
    /// for the loop.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            drop(self.socket.lock().take());
        }
        let mut exited = self.net_exited.clone();
        // An Err means the loop task is gone without reporting, which is also an exit.
        let _ = exited.wait_for(|done| *done).await;
        debug!("Session {} closed", self.shared.id);
    }
}

struct NetworkLoop {
    shared: Arc<SessionShared>,
    socket: Arc<UdpSocket>,
    inbox: Inbox,
    cancel: CancellationToken,
    message_timeout: Duration,
}

impl NetworkLoop {
    /// Returns `Ok` only when cancelled. Consumes the loop so its socket
    /// handle is gone by the time the caller signals exit.
    async fn run(mut self) -> Result<(), SessionError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        // Only traffic from the client itself pushes the idle deadline back.
        let mut deadline = Instant::now() + self.message_timeout;
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = timeout_at(deadline, self.socket.recv_from(&mut buf)) => read,
            };
            let (len, from) = match read {
                Err(_) => return Err(SessionError::Timeout(self.shared.id.clone())),
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_transient(&e) => {
                    debug!("Session {} transient read error: {}", self.shared.id, e);
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            if from != self.shared.remote_addr {
                debug!(
                    "Session {} ignoring {} bytes from {}",
                    self.shared.id, len, from
                );
                continue;
            }
            deadline = Instant::now() + self.message_timeout;

            let dgram = decode_datagram(&buf[..len])?;
            trace!(
                "Session {} datagram seq={} flags={:#010x} len={}",
                self.shared.id,
                dgram.sequence(),
                dgram.flags(),
                dgram.len()
            );
            if self.inbox.handle(&dgram)? == Delivery::Stale {
                debug!(
                    "Session {} dropped stale datagram {} (expecting {})",
                    self.shared.id,
                    dgram.sequence(),
                    self.inbox.expected_sequence()
                );
            }
        }
    }
}

struct Executor {
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    tick_interval: Duration,
}

impl Executor {
    async fn run(self) -> Result<(), SessionError> {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.run_pending().await?,
            }
        }
    }

    async fn run_pending(&self) -> Result<(), SessionError> {
        for op in self.shared.queue.drain() {
            if self.cancel.is_cancelled() {
                break;
            }
            self.execute(op).await?;
        }
        Ok(())
    }

    async fn execute(&self, op: Instruction) -> Result<(), SessionError> {
        match op {
            Instruction::Disconnect => {
                info!("Client {} disconnecting", self.shared.id);
                self.shared.detach().await;
            }
            Instruction::Move(body) => {
                let cmd = MoveCommand::decode(&body)?;
                trace!("Session {} move {:?}", self.shared.id, cmd);
                *self.shared.last_move.lock() = Some(cmd);
            }
            Instruction::StringCommand(body) => {
                let line = read_console_string(&body);
                info!("{}: command: {}", self.shared.id, line);
                if let Err(e) = self.shared.console.commands.execute(&line) {
                    warn!("{}: {}", self.shared.id, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::command::{encode_move, encode_nop, encode_string_command, CLC_MOVE};
    use shared::frame::encode_datagram;
    use shared::{NETFLAG_CONTROL, NETFLAG_UNRELIABLE};

    fn datagram(sequence: u32, payload: &[u8]) -> Vec<u8> {
        encode_datagram(NETFLAG_UNRELIABLE, sequence, payload)
    }

    #[test]
    fn test_session_id_is_address_string() {
        let addr: SocketAddr = "127.0.0.1:27001".parse().unwrap();
        assert_eq!(session_id(&addr), "127.0.0.1:27001");
    }

    #[test]
    fn test_instruction_from_command() {
        assert_eq!(Instruction::from_command(ClientCommand::Nop), None);
        assert_eq!(
            Instruction::from_command(ClientCommand::Disconnect),
            Some(Instruction::Disconnect)
        );
        assert_eq!(
            Instruction::from_command(ClientCommand::StringCommand(b"say\0")),
            Some(Instruction::StringCommand(b"say\0".to_vec()))
        );
    }

    #[test]
    fn test_queue_drains_in_order() {
        let queue = InstructionQueue::default();
        queue.push(Instruction::Move(vec![1]));
        queue.push(Instruction::Disconnect);
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![Instruction::Move(vec![1]), Instruction::Disconnect]
        );
        assert!(queue.is_empty());

        queue.push(Instruction::StringCommand(vec![]));
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn test_inbox_sequencing() {
        let queue = Arc::new(InstructionQueue::default());
        let mut inbox = Inbox::starting_at(Arc::clone(&queue), 5);
        let payload = encode_string_command("status");

        let stale = datagram(3, &payload);
        let dgram = decode_datagram(&stale).unwrap();
        assert_eq!(inbox.handle(&dgram).unwrap(), Delivery::Stale);
        assert_eq!(inbox.expected_sequence(), 5);
        assert!(queue.is_empty());

        let current = datagram(5, &payload);
        let dgram = decode_datagram(&current).unwrap();
        assert_eq!(inbox.handle(&dgram).unwrap(), Delivery::Accepted);
        assert_eq!(inbox.expected_sequence(), 6);
        assert_eq!(queue.len(), 1);

        let ahead = datagram(9, &payload);
        let dgram = decode_datagram(&ahead).unwrap();
        assert_eq!(inbox.handle(&dgram).unwrap(), Delivery::Accepted);
        assert_eq!(inbox.expected_sequence(), 10);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_inbox_ignores_control_and_reliable() {
        let queue = Arc::new(InstructionQueue::default());
        let mut inbox = Inbox::new(Arc::clone(&queue));
        let payload = encode_string_command("status");

        let control = encode_datagram(NETFLAG_CONTROL | NETFLAG_UNRELIABLE, 0, &payload);
        let dgram = decode_datagram(&control).unwrap();
        assert_eq!(inbox.handle(&dgram).unwrap(), Delivery::Ignored);

        let reliable = encode_datagram(0, 0, &payload);
        let dgram = decode_datagram(&reliable).unwrap();
        assert_eq!(inbox.handle(&dgram).unwrap(), Delivery::Ignored);

        assert_eq!(inbox.expected_sequence(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_inbox_nop_advances_without_queueing() {
        let queue = Arc::new(InstructionQueue::default());
        let mut inbox = Inbox::new(Arc::clone(&queue));
        let data = datagram(0, &encode_nop());
        let dgram = decode_datagram(&data).unwrap();
        assert_eq!(inbox.handle(&dgram).unwrap(), Delivery::Accepted);
        assert_eq!(inbox.expected_sequence(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_inbox_rejects_invalid_instruction() {
        let queue = Arc::new(InstructionQueue::default());
        let mut inbox = Inbox::new(Arc::clone(&queue));
        let data = datagram(0, &[9]);
        let dgram = decode_datagram(&data).unwrap();
        assert!(matches!(
            inbox.handle(&dgram),
            Err(SessionError::Command(CommandError::InvalidInstruction(9)))
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_inbox_defers_move_parsing() {
        let queue = Arc::new(InstructionQueue::default());
        let mut inbox = Inbox::new(Arc::clone(&queue));

        // A truncated move still queues; it only fails when executed.
        let data = datagram(0, &[CLC_MOVE, 1, 2]);
        let dgram = decode_datagram(&data).unwrap();
        assert_eq!(inbox.handle(&dgram).unwrap(), Delivery::Accepted);

        let good = encode_move(&MoveCommand::default()).unwrap();
        let data = datagram(1, &good);
        let dgram = decode_datagram(&data).unwrap();
        assert_eq!(inbox.handle(&dgram).unwrap(), Delivery::Accepted);

        let ops = queue.drain();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], Instruction::Move(vec![1, 2]));
        match &ops[1] {
            Instruction::Move(body) => assert_eq!(body.len(), MoveCommand::SIZE),
            other => panic!("unexpected instruction {:?}", other),
        }
    }
}
