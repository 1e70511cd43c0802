//! Error types for the Arbor wire protocol.
//!
//! All errors are structured and testable. Errors that travel back to a
//! remote caller are mapped to an errno-style numeric code by
//! [`ProtocolError::errnum`].

use thiserror::Error;

use crate::types::MsgType;

/// errno value carried by protocol-violation responses.
pub const EPROTO: u32 = 71;
/// errno value carried by invalid-argument responses.
pub const EINVAL: u32 = 22;

/// Protocol-level errors that can occur while building, encoding or
/// decoding messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unknown message type byte on the wire
    #[error("invalid message type: {0:#04x}")]
    InvalidType(u8),

    /// Flag byte contains unrecognized bits
    #[error("invalid flags: {0:#04x}")]
    InvalidFlags(u8),

    /// STREAMING and NORESPONSE are mutually exclusive
    #[error("invalid flags: streaming and noresponse are mutually exclusive")]
    FlagConflict,

    /// Accessor does not apply to this message type
    #[error("{field} is not valid on a {msg_type} message")]
    WrongType {
        /// Field that was accessed
        field: &'static str,
        /// Actual type of the message
        msg_type: MsgType,
    },

    /// Proto frame magic byte mismatch
    #[error("invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    /// Proto frame version mismatch
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Encoded stream could not be parsed into a valid frame sequence
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// Destination buffer cannot hold the encoded message
    #[error("encode buffer too short: need {need} bytes, have {have}")]
    ShortBuffer {
        /// Bytes required
        need: usize,
        /// Bytes available
        have: usize,
    },

    /// Replacement payload aliases the current payload storage
    #[error("payload source overlaps destination")]
    PayloadOverlap,

    /// Route stack operation on a message without an enabled route stack
    #[error("route stack is not enabled")]
    RouteDisabled,

    /// Payload is not a NUL-terminated string
    #[error("payload is not a string")]
    PayloadNotString,

    /// Payload is not a JSON object
    #[error("payload is not a JSON object")]
    PayloadNotObject,

    /// JSON encode/decode failure
    #[error("json: {0}")]
    Json(String),

    /// Unknown keepalive status value
    #[error("invalid keepalive status: {0}")]
    InvalidStatus(u32),
}

impl ProtocolError {
    /// errno-style code used when this error is reported to a remote caller.
    pub fn errnum(&self) -> u32 {
        match self {
            ProtocolError::ShortBuffer { .. } | ProtocolError::PayloadOverlap => EINVAL,
            _ => EPROTO,
        }
    }
}

/// Convenient Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
