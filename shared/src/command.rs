//! Client commands carried in data datagram payloads.
//!
//! The first payload byte is the opcode. The body after it is handed on
//! undecoded so the server can defer parsing to its execution loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CLC_NOP: u8 = 1;
pub const CLC_DISCONNECT: u8 = 2;
pub const CLC_MOVE: u8 = 3;
pub const CLC_STRINGCMD: u8 = 4;

/// Terminators of a console string; neither is part of the command.
const STRING_TERMINATORS: [u8; 2] = [0x00, 0xFF];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid instruction: empty command")]
    Empty,
    #[error("invalid instruction: opcode {0}")]
    InvalidInstruction(u8),
    #[error("malformed move command: {0}")]
    MalformedMove(String),
    #[error("failed to encode move command: {0}")]
    Encode(String),
}

/// A client command with its body still raw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand<'a> {
    Nop,
    Disconnect,
    Move(&'a [u8]),
    StringCommand(&'a [u8]),
}

impl<'a> ClientCommand<'a> {
    pub fn decode(payload: &'a [u8]) -> Result<Self, CommandError> {
        let (&opcode, body) = payload.split_first().ok_or(CommandError::Empty)?;
        match opcode {
            CLC_NOP => Ok(ClientCommand::Nop),
            CLC_DISCONNECT => Ok(ClientCommand::Disconnect),
            CLC_MOVE => Ok(ClientCommand::Move(body)),
            CLC_STRINGCMD => Ok(ClientCommand::StringCommand(body)),
            other => Err(CommandError::InvalidInstruction(other)),
        }
    }
}

/// Per-frame movement input, little-endian on the wire
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MoveCommand {
    pub ping: f32,
    pub angles: [i8; 3],
    /// forward, side, up
    pub movement: [i16; 3],
    pub buttons: i8,
    pub impulse: i8,
}

impl MoveCommand {
    pub const SIZE: usize = 15;

    pub fn decode(body: &[u8]) -> Result<Self, CommandError> {
        bincode::deserialize(body).map_err(|e| CommandError::MalformedMove(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        bincode::serialize(self).map_err(|e| CommandError::Encode(e.to_string()))
    }
}

/// Extracts a console command: everything up to the first NUL or 0xFF.
pub fn read_console_string(body: &[u8]) -> String {
    let end = body
        .iter()
        .position(|b| STRING_TERMINATORS.contains(b))
        .unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

pub fn encode_nop() -> Vec<u8> {
    vec![CLC_NOP]
}

pub fn encode_disconnect() -> Vec<u8> {
    vec![CLC_DISCONNECT]
}

pub fn encode_move(cmd: &MoveCommand) -> Result<Vec<u8>, CommandError> {
    let mut out = Vec::with_capacity(1 + MoveCommand::SIZE);
    out.push(CLC_MOVE);
    out.extend(cmd.encode()?);
    Ok(out)
}

pub fn encode_string_command(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 2);
    out.push(CLC_STRINGCMD);
    out.extend_from_slice(line.as_bytes());
    out.push(0);
    out
}
