//! Connect-request validation.

use bytes::Bytes;
use thiserror::Error;

use crate::frame::ControlFrameBuilder;
use crate::{CCREQ_CONNECT, CONNECT_MAGIC, NET_PROTOCOL_VERSION};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("invalid control message: {0}")]
    InvalidHandshake(String),
    #[error("invalid protocol version: protocol {got} does not match {want}")]
    IncompatibleVersion { got: u8, want: u8 },
}

/// Checks the magic and version byte of a connect-request payload.
///
/// Anything after the version byte is ignored.
pub fn validate_connect(payload: &[u8]) -> Result<(), HandshakeError> {
    let required = CONNECT_MAGIC.len() + 1;
    if payload.len() < required {
        return Err(HandshakeError::InvalidHandshake(format!(
            "body {:?} was shorter than expected {}",
            payload, required
        )));
    }
    let (magic, rest) = payload.split_at(CONNECT_MAGIC.len());
    if magic != &CONNECT_MAGIC[..] {
        return Err(HandshakeError::InvalidHandshake(format!(
            "body {:?} lacked expected magic {:?}",
            magic, CONNECT_MAGIC
        )));
    }
    let version = rest[0];
    if version != NET_PROTOCOL_VERSION {
        return Err(HandshakeError::IncompatibleVersion {
            got: version,
            want: NET_PROTOCOL_VERSION,
        });
    }
    Ok(())
}

/// Builds a complete connect-request control frame for `version`.
pub fn connect_request(version: u8) -> Bytes {
    let mut msg = ControlFrameBuilder::new(CCREQ_CONNECT);
    let mut body = CONNECT_MAGIC.to_vec();
    body.push(version);
    // A fresh builder is never finalized, so the write cannot fail.
    let _ = msg.write(&body);
    msg.finish()
}
