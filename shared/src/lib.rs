//! Wire protocol shared by the server and its clients.
//!
//! Everything in this crate is pure: it turns byte buffers into typed frames
//! and back, and never touches a socket.

pub mod command;
pub mod frame;
pub mod handshake;

pub use command::{ClientCommand, CommandError, MoveCommand};
pub use frame::{ControlFrame, ControlFrameBuilder, Datagram, FrameError};
pub use handshake::{validate_connect, HandshakeError};

/// Control flag carried in the leading word of every control frame.
pub const NETFLAG_CONTROL: u32 = 0x8000_0000;
/// Marks a data datagram as unreliable.
pub const NETFLAG_UNRELIABLE: u32 = 0x0010_0000;
/// Low 16 bits of the leading word hold the total frame length.
pub const NETFLAG_LENGTH_MASK: u32 = 0x0000_FFFF;

/// Size of a data datagram header: length+flags word and sequence number.
pub const DATAGRAM_HEADER_SIZE: usize = 8;
/// Size of a control frame header: length+flags word and command byte.
pub const CONTROL_HEADER_SIZE: usize = 5;
/// Largest datagram either peer reads in one go.
pub const MAX_DATAGRAM: usize = 1024;

/// The only protocol version this server speaks.
pub const NET_PROTOCOL_VERSION: u8 = 3;
/// Magic prefix of a connect request.
pub const CONNECT_MAGIC: [u8; 6] = *b"QUAKE\0";

/// Control commands exchanged on the rendezvous socket.
pub const CCREQ_CONNECT: u8 = 0x01;
pub const CCREP_ACCEPT: u8 = 0x81;
pub const CCREP_REJECT: u8 = 0x82;
