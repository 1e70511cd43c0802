//! The fixed-layout proto frame, always the final frame of a message.
//!
//! Layout (20 bytes, big-endian words):
//!
//! ```text
//! offset 0   magic    (1 byte, 0x8e)
//! offset 1   version  (1 byte, 0x01)
//! offset 2   type     (1 byte)
//! offset 3   flags    (1 byte)
//! offset 4   userid   (u32 BE)
//! offset 8   rolemask (u32 BE)
//! offset 12  aux1     (u32 BE)  nodeid / errnum / sequence
//! offset 16  aux2     (u32 BE)  matchtag / status
//! ```
//!
//! Fields are stored as raw byte arrays so the struct has no alignment
//! requirements and every bit pattern is a valid value; `zerocopy` then
//! lets untrusted network bytes be reinterpreted without copying. Semantic
//! validation (magic, version, type, flag bits) happens in
//! [`ProtoFrame::parse`].

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    errors::{ProtocolError, Result},
    flags::MsgFlags,
    types::MsgType,
};

/// Fixed proto frame carried as the last frame of every message.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ProtoFrame {
    magic: u8,
    version: u8,
    msg_type: u8,
    flags: u8,
    userid: [u8; 4],
    rolemask: [u8; 4],
    aux1: [u8; 4],
    aux2: [u8; 4],
}

impl ProtoFrame {
    /// Size of the serialized proto frame.
    pub const SIZE: usize = 20;

    /// Magic byte identifying an Arbor proto frame.
    pub const MAGIC: u8 = 0x8e;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Build a proto frame from message fields.
    #[must_use]
    pub fn new(
        msg_type: MsgType,
        flags: MsgFlags,
        userid: u32,
        rolemask: u32,
        aux1: u32,
        aux2: u32,
    ) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            msg_type: msg_type as u8,
            flags: flags.to_byte(),
            userid: userid.to_be_bytes(),
            rolemask: rolemask.to_be_bytes(),
            aux1: aux1.to_be_bytes(),
            aux2: aux2.to_be_bytes(),
        }
    }

    /// Parse and validate a proto frame from exactly [`ProtoFrame::SIZE`]
    /// bytes.
    ///
    /// A receiver that sees a different magic or version must treat the
    /// connection as broken; both are reported as distinct errors so the
    /// transport can log which one it was.
    pub fn parse(bytes: &[u8]) -> Result<(MsgType, MsgFlags, Self)> {
        let frame = Self::read_from_bytes(bytes)
            .map_err(|_| ProtocolError::Malformed("proto frame size"))?;
        if frame.magic != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic(frame.magic));
        }
        if frame.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(frame.version));
        }
        let msg_type = MsgType::from_u8(frame.msg_type)?;
        let flags = MsgFlags::from_byte(frame.flags)?;
        Ok((msg_type, flags, frame))
    }

    /// Serialize to the 20-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Sender userid.
    #[must_use]
    pub fn userid(&self) -> u32 {
        u32::from_be_bytes(self.userid)
    }

    /// Sender rolemask.
    #[must_use]
    pub fn rolemask(&self) -> u32 {
        u32::from_be_bytes(self.rolemask)
    }

    /// First type-specific word (nodeid, errnum, or sequence).
    #[must_use]
    pub fn aux1(&self) -> u32 {
        u32::from_be_bytes(self.aux1)
    }

    /// Second type-specific word (matchtag or status).
    #[must_use]
    pub fn aux2(&self) -> u32 {
        u32::from_be_bytes(self.aux2)
    }
}

impl PartialEq for ProtoFrame {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for ProtoFrame {}

impl std::fmt::Debug for ProtoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtoFrame")
            .field("magic", &format_args!("{:#04x}", self.magic))
            .field("version", &self.version)
            .field("type", &format_args!("{:#04x}", self.msg_type))
            .field("flags", &format_args!("{:#04x}", self.flags))
            .field("userid", &self.userid())
            .field("rolemask", &format_args!("{:#010x}", self.rolemask()))
            .field("aux1", &self.aux1())
            .field("aux2", &self.aux2())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_wire_size() {
        assert_eq!(std::mem::size_of::<ProtoFrame>(), ProtoFrame::SIZE);
        assert_eq!(ProtoFrame::SIZE, 20);
    }

    #[test]
    fn round_trip() {
        let frame = ProtoFrame::new(
            MsgType::Request,
            MsgFlags::TOPIC | MsgFlags::PAYLOAD,
            1000,
            0x3,
            42,
            7,
        );
        let bytes = frame.to_bytes();
        let (msg_type, flags, parsed) = ProtoFrame::parse(&bytes).unwrap();
        assert_eq!(msg_type, MsgType::Request);
        assert_eq!(flags, MsgFlags::TOPIC | MsgFlags::PAYLOAD);
        assert_eq!(parsed.userid(), 1000);
        assert_eq!(parsed.rolemask(), 0x3);
        assert_eq!(parsed.aux1(), 42);
        assert_eq!(parsed.aux2(), 7);
    }

    #[test]
    fn reject_bad_magic() {
        let mut bytes =
            ProtoFrame::new(MsgType::Event, MsgFlags::empty(), 0, 0, 0, 0).to_bytes();
        bytes[0] = 0x42;
        assert_eq!(ProtoFrame::parse(&bytes), Err(ProtocolError::InvalidMagic(0x42)));
    }

    #[test]
    fn reject_bad_version() {
        let mut bytes =
            ProtoFrame::new(MsgType::Event, MsgFlags::empty(), 0, 0, 0, 0).to_bytes();
        bytes[1] = 0x7f;
        assert_eq!(ProtoFrame::parse(&bytes), Err(ProtocolError::UnsupportedVersion(0x7f)));
    }

    #[test]
    fn reject_short_input() {
        let bytes = [ProtoFrame::MAGIC; 10];
        assert!(ProtoFrame::parse(&bytes).is_err());
    }
}
