//! Socket helpers shared by the control loop and the sessions.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::UdpSocket;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("short write: wrote {written}, expected {expected}")]
    ShortWrite { written: usize, expected: usize },
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

/// Sends one datagram and fails unless every byte went out.
pub async fn send_datagram(
    socket: &UdpSocket,
    data: &[u8],
    addr: SocketAddr,
) -> Result<(), SendError> {
    let written = socket.send_to(data, addr).await?;
    if written != data.len() {
        return Err(SendError::ShortWrite {
            written,
            expected: data.len(),
        });
    }
    Ok(())
}

/// Read errors a receive loop should retry instead of giving up on.
///
/// Connection reset/refused show up on UDP sockets when an ICMP error for an
/// earlier send comes back; they say nothing about the next read.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}
