//! Error types for the overlay core.
//!
//! Errors that flow back to a remote caller carry an errno-style numeric
//! code plus optional free-form text; the constants live in [`errno`].

use thiserror::Error;

use arbor_proto::ProtocolError;

/// errno-style codes used in response messages.
pub mod errno {
    /// Operation not permitted
    pub const EPERM: u32 = 1;
    /// Invalid argument
    pub const EINVAL: u32 = 22;
    /// Read-only file system (writes to the scratchpad key ".")
    pub const EROFS: u32 = 30;
    /// Resource deadlock avoided (store-conditional version race)
    pub const EDEADLK: u32 = 35;
    /// Function not implemented (no such service / service shutdown)
    pub const ENOSYS: u32 = 38;
    /// No data available (streaming RPC terminator)
    pub const ENODATA: u32 = 61;
    /// Protocol error
    pub const EPROTO: u32 = 71;
    /// No route to host (peer not in table / mandatory send failure)
    pub const EHOSTUNREACH: u32 = 113;
}

/// Errors produced by the overlay routing engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverlayError {
    /// Destination peer is not reachable from this broker
    #[error("no route to host")]
    HostUnreachable,

    /// Message received from a peer that is not in the peer table
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    /// Message was malformed for the operation attempted
    #[error(transparent)]
    Proto(#[from] ProtocolError),

    /// Geometry or configuration error
    #[error("invalid overlay geometry: {0}")]
    Geometry(&'static str),
}

impl OverlayError {
    /// errno code reported to callers.
    pub fn errnum(&self) -> u32 {
        match self {
            OverlayError::HostUnreachable | OverlayError::UnknownPeer(_) => errno::EHOSTUNREACH,
            OverlayError::Proto(e) => e.errnum(),
            OverlayError::Geometry(_) => errno::EINVAL,
        }
    }
}

/// Errors produced by the matchtag allocator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchtagError {
    /// The tag was not allocated (or was already returned)
    #[error("matchtag {0} is not outstanding")]
    NotOutstanding(u32),

    /// The reserved tag 0 was passed where an allocated tag is required
    #[error("matchtag 0 is reserved")]
    Reserved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errnum_mapping() {
        assert_eq!(OverlayError::HostUnreachable.errnum(), errno::EHOSTUNREACH);
        assert_eq!(OverlayError::UnknownPeer("9".into()).errnum(), errno::EHOSTUNREACH);
        assert_eq!(OverlayError::Geometry("k").errnum(), errno::EINVAL);
    }
}
