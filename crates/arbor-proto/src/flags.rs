//! Message flags and role masks.

use bitflags::bitflags;

use crate::errors::{ProtocolError, Result};

bitflags! {
    /// Message feature flags (8 bits on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u8 {
        /// Message has a topic frame
        const TOPIC = 0x01;
        /// Message has a payload frame
        const PAYLOAD = 0x02;
        /// Service must not respond to this request
        const NORESPONSE = 0x04;
        /// Message has a route stack (delimiter frame present)
        const ROUTE = 0x08;
        /// Request is routed to the parent of the nodeid rank
        const UPSTREAM = 0x10;
        /// Event is withheld from unprivileged subscribers
        const PRIVATE = 0x20;
        /// Request expects multiple responses terminated by ENODATA
        const STREAMING = 0x40;
    }
}

impl MsgFlags {
    /// Parse a wire flag byte.
    ///
    /// Rejects unrecognized bits and the STREAMING|NORESPONSE combination,
    /// which is contradictory: a stream needs responses to exist.
    pub fn from_byte(byte: u8) -> Result<Self> {
        let flags = Self::from_bits(byte).ok_or(ProtocolError::InvalidFlags(byte))?;
        flags.validate()?;
        Ok(flags)
    }

    /// Check the STREAMING/NORESPONSE exclusion.
    pub fn validate(self) -> Result<()> {
        if self.contains(Self::STREAMING | Self::NORESPONSE) {
            return Err(ProtocolError::FlagConflict);
        }
        Ok(())
    }

    /// Wire representation.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.bits()
    }
}

bitflags! {
    /// Roles granted to the message sender (32 bits on the wire).
    ///
    /// `ALL` deliberately sets every bit so that future role bits are
    /// included.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RoleMask: u32 {
        /// Instance owner
        const OWNER = 0x01;
        /// Authenticated non-owner user
        const USER = 0x02;
        /// Every role
        const ALL = u32::MAX;
    }
}

impl RoleMask {
    /// No roles at all.
    pub const NONE: RoleMask = RoleMask::empty();

    /// Parse a wire rolemask word. All bit patterns are valid; unknown
    /// bits are preserved.
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self::from_bits_retain(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let flags = MsgFlags::TOPIC | MsgFlags::PAYLOAD | MsgFlags::STREAMING;
        assert_eq!(MsgFlags::from_byte(flags.to_byte()).unwrap(), flags);
    }

    #[test]
    fn unknown_bits_rejected() {
        assert_eq!(MsgFlags::from_byte(0x80), Err(ProtocolError::InvalidFlags(0x80)));
    }

    #[test]
    fn streaming_noresponse_conflict() {
        let byte = (MsgFlags::STREAMING | MsgFlags::NORESPONSE).to_byte();
        assert_eq!(MsgFlags::from_byte(byte), Err(ProtocolError::FlagConflict));
    }

    #[test]
    fn rolemask_intersection() {
        assert!(RoleMask::ALL.intersects(RoleMask::OWNER));
        assert!(RoleMask::ALL.intersects(RoleMask::USER));
        assert!(!RoleMask::NONE.intersects(RoleMask::OWNER));
        let user = RoleMask::from_u32(RoleMask::USER.bits());
        assert!(user.intersects(RoleMask::USER | RoleMask::OWNER));
    }
}
