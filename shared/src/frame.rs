//! Control frames and data datagrams.
//!
//! Headers are big-endian on the wire; anything structured inside a payload
//! (the accept port, movement) is little-endian.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use crate::{
    CCREP_ACCEPT, CCREP_REJECT, CONTROL_HEADER_SIZE, DATAGRAM_HEADER_SIZE, NETFLAG_CONTROL,
    NETFLAG_LENGTH_MASK, NETFLAG_UNRELIABLE,
};

/// Why a buffer was not accepted as a control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotControlReason {
    TooShort,
    /// The leading word was all ones, the version probe sentinel.
    InvalidSignature,
    MissingControlFlag,
}

impl fmt::Display for NotControlReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            NotControlReason::TooShort => "too short",
            NotControlReason::InvalidSignature => "invalid control signature",
            NotControlReason::MissingControlFlag => "lacks bitmask",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("not control packet: {0}")]
    NotControl(NotControlReason),
    #[error("wrong size: got {got}, want {want}")]
    WrongLength { got: usize, want: usize },
    #[error("unexpected end of datagram: needed {needed} bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },
    #[error("control frame already finalized")]
    AlreadyFinalized,
    #[error("unexpected control command {0:#04x}")]
    UnexpectedCommand(u8),
}

impl FrameError {
    /// True for every failure that means "this is not a usable frame", as
    /// opposed to misuse of the builder.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, FrameError::AlreadyFinalized)
    }
}

fn be_word(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// A decoded control frame, borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame<'a> {
    pub command: u8,
    pub payload: &'a [u8],
}

/// Decodes a control frame received on the rendezvous socket.
///
/// The declared length must match the buffer exactly.
pub fn decode_control_frame(data: &[u8]) -> Result<ControlFrame<'_>, FrameError> {
    if data.len() < CONTROL_HEADER_SIZE {
        return Err(FrameError::NotControl(NotControlReason::TooShort));
    }
    let word = be_word(data);
    if word == u32::MAX {
        return Err(FrameError::NotControl(NotControlReason::InvalidSignature));
    }
    if word & !NETFLAG_LENGTH_MASK != NETFLAG_CONTROL {
        return Err(FrameError::NotControl(NotControlReason::MissingControlFlag));
    }
    let declared = (word & NETFLAG_LENGTH_MASK) as usize;
    if declared != data.len() {
        return Err(FrameError::WrongLength {
            got: declared,
            want: data.len(),
        });
    }
    Ok(ControlFrame {
        command: data[4],
        payload: &data[CONTROL_HEADER_SIZE..],
    })
}

/// Incrementally builds an outgoing control frame.
///
/// The header is patched in by [`ControlFrameBuilder::finish`]; after that the
/// builder only hands out the cached frame and rejects further writes.
#[derive(Debug)]
pub struct ControlFrameBuilder {
    command: u8,
    buf: BytesMut,
    frame: Option<Bytes>,
}

impl ControlFrameBuilder {
    pub fn new(command: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&[0, 0, 0, 0, command]);
        Self {
            command,
            buf,
            frame: None,
        }
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    fn check_open(&self) -> Result<(), FrameError> {
        match self.frame {
            Some(_) => Err(FrameError::AlreadyFinalized),
            None => Ok(()),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, FrameError> {
        self.check_open()?;
        self.buf.put_slice(data);
        Ok(data.len())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), FrameError> {
        self.check_open()?;
        self.buf.put_u8(value);
        Ok(())
    }

    pub fn write_i32_le(&mut self, value: i32) -> Result<(), FrameError> {
        self.check_open()?;
        self.buf.put_i32_le(value);
        Ok(())
    }

    /// Appends `text` followed by a single NUL terminator.
    pub fn write_string(&mut self, text: &str) -> Result<usize, FrameError> {
        self.check_open()?;
        self.buf.put_slice(text.as_bytes());
        self.buf.put_u8(0);
        Ok(text.len() + 1)
    }

    /// Patches the length header and returns the finished frame. Calling it
    /// again returns the same bytes.
    pub fn finish(&mut self) -> Bytes {
        if let Some(frame) = &self.frame {
            return frame.clone();
        }
        let word = NETFLAG_CONTROL | (self.buf.len() as u32 & NETFLAG_LENGTH_MASK);
        self.buf[0..4].copy_from_slice(&word.to_be_bytes());
        let frame = self.buf.split().freeze();
        self.frame = Some(frame.clone());
        frame
    }
}

/// Builds the accept reply redirecting a client to its session port.
pub fn accept_frame(port: u16) -> Bytes {
    let mut msg = ControlFrameBuilder::new(CCREP_ACCEPT);
    msg.buf.put_i32_le(i32::from(port));
    msg.finish()
}

/// Builds a reject reply carrying a human-readable reason.
pub fn reject_frame(reason: &str) -> Bytes {
    let mut msg = ControlFrameBuilder::new(CCREP_REJECT);
    msg.buf.put_slice(reason.as_bytes());
    msg.buf.put_u8(0);
    msg.finish()
}

/// What the server answered to a connect request, as seen by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    Accept { port: u16 },
    Reject { reason: String },
}

impl ServerReply {
    pub fn from_frame(frame: &ControlFrame<'_>) -> Result<Self, FrameError> {
        match frame.command {
            CCREP_ACCEPT => {
                let bytes = frame.payload.get(..4).ok_or(FrameError::UnexpectedEof {
                    needed: 4,
                    available: frame.payload.len(),
                })?;
                let port = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Ok(ServerReply::Accept { port: port as u16 })
            }
            CCREP_REJECT => {
                let end = frame
                    .payload
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(frame.payload.len());
                Ok(ServerReply::Reject {
                    reason: String::from_utf8_lossy(&frame.payload[..end]).into_owned(),
                })
            }
            other => Err(FrameError::UnexpectedCommand(other)),
        }
    }
}

/// A decoded data datagram from a session socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram<'a> {
    sequence: u32,
    flags: u32,
    payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_control(&self) -> bool {
        self.flags & NETFLAG_CONTROL != 0
    }

    pub fn is_unreliable(&self) -> bool {
        self.flags & NETFLAG_UNRELIABLE != 0
    }

    /// True when this datagram is older than the one the receiver expects.
    pub fn is_before(&self, expected: u32) -> bool {
        self.sequence < expected
    }
}

/// Decodes an 8-byte header and the payload it declares.
///
/// Bytes past the declared length are ignored.
pub fn decode_datagram(data: &[u8]) -> Result<Datagram<'_>, FrameError> {
    if data.len() < DATAGRAM_HEADER_SIZE {
        return Err(FrameError::UnexpectedEof {
            needed: DATAGRAM_HEADER_SIZE,
            available: data.len(),
        });
    }
    let (header, rest) = data.split_at(DATAGRAM_HEADER_SIZE);
    let word = be_word(&header[0..4]);
    let sequence = be_word(&header[4..8]);

    let declared = (word & NETFLAG_LENGTH_MASK) as usize;
    let payload_len =
        declared
            .checked_sub(DATAGRAM_HEADER_SIZE)
            .ok_or(FrameError::WrongLength {
                got: declared,
                want: DATAGRAM_HEADER_SIZE,
            })?;
    if rest.len() < payload_len {
        return Err(FrameError::UnexpectedEof {
            needed: payload_len,
            available: rest.len(),
        });
    }

    Ok(Datagram {
        sequence,
        flags: word & !NETFLAG_LENGTH_MASK,
        payload: &rest[..payload_len],
    })
}

/// Encodes a data datagram; the inverse of [`decode_datagram`].
pub fn encode_datagram(flags: u32, sequence: u32, payload: &[u8]) -> Vec<u8> {
    let total = DATAGRAM_HEADER_SIZE + payload.len();
    let word = (flags & !NETFLAG_LENGTH_MASK) | (total as u32 & NETFLAG_LENGTH_MASK);
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&word.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(payload);
    out
}
