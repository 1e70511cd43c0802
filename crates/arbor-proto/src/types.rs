//! Message types and keepalive status codes.
//!
//! Type values are single bits so that a set of accepted types can be
//! expressed as a mask (see [`TypeMask`]), letting dispatch match several
//! types with one registration.

use bitflags::bitflags;

use crate::errors::{ProtocolError, Result};

/// The four message kinds that travel on the wire.
///
/// The numeric values are wire-stable; [`MsgType::from_u8`] rejects
/// anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// A request, routed toward a nodeid
    Request = 0x01,
    /// A response correlated to a request by matchtag
    Response = 0x02,
    /// An event, multicast down the tree
    Event = 0x04,
    /// A liveness heartbeat between overlay peers
    Keepalive = 0x08,
}

impl MsgType {
    /// Parse a wire type byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x04 => Ok(Self::Event),
            0x08 => Ok(Self::Keepalive),
            other => Err(ProtocolError::InvalidType(other)),
        }
    }

    /// The mask bit for this type.
    #[must_use]
    pub const fn mask(self) -> TypeMask {
        TypeMask::from_bits_retain(self as u8)
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Keepalive => "keepalive",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// A set of message types, used by dispatch registrations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeMask: u8 {
        /// Accept requests
        const REQUEST = 0x01;
        /// Accept responses
        const RESPONSE = 0x02;
        /// Accept events
        const EVENT = 0x04;
        /// Accept keepalives
        const KEEPALIVE = 0x08;
        /// Accept everything
        const ANY = 0x0f;
    }
}

impl TypeMask {
    /// Does this mask accept `t`?
    #[must_use]
    pub fn accepts(self, t: MsgType) -> bool {
        self.intersects(t.mask())
    }
}

/// Status codes carried in the second aux word of a keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KeepaliveStatus {
    /// Ordinary heartbeat
    Normal = 0,
    /// Sender is disconnecting from the overlay
    Disconnect = 1,
    /// Sender entered test-pause mode and should be marked idle
    TestPause = 2,
}

impl KeepaliveStatus {
    /// Parse a wire status word.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Disconnect),
            2 => Ok(Self::TestPause),
            other => Err(ProtocolError::InvalidStatus(other)),
        }
    }
}
