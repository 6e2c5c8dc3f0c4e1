//! Datagram header shared by every UDP packet type.
//!
//! ```text
//! magic:      u16  (2)   0x5444 ("TD")
//! type:       u8   (1)
//! client_id:  u32  (4)
//! ```
//!
//! All multi-byte fields are big-endian.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::TetherError;

/// Magic prefix of every Tether datagram.
pub const MAGIC: u16 = 0x5444;

/// Encoded size of [`PacketHeader`].
pub const HEADER_SIZE: usize = 7;

// ── PacketType ───────────────────────────────────────────────────

/// Datagram kinds understood by the dispatcher.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Endpoint announces itself for a session (either side → relay).
    Register = 0x01,
    /// Viewer asks the sharer for a frame (viewer → sharer).
    Request = 0x02,
    /// Complete JPEG frame (sharer → viewer).
    FullFrame = 0x03,
    /// Changed-blocks frame (sharer → viewer).
    DeltaFrame = 0x04,
    /// Viewer confirms a frame chunk (viewer → sharer).
    Ack = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = TetherError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Register),
            0x02 => Ok(Self::Request),
            0x03 => Ok(Self::FullFrame),
            0x04 => Ok(Self::DeltaFrame),
            0x05 => Ok(Self::Ack),
            _ => Err(TetherError::UnknownVariant {
                type_name: "PacketType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register => write!(f, "REGISTER"),
            Self::Request => write!(f, "REQUEST"),
            Self::FullFrame => write!(f, "FULL_FRAME"),
            Self::DeltaFrame => write!(f, "DELTA_FRAME"),
            Self::Ack => write!(f, "ACK"),
        }
    }
}

// ── PacketHeader ─────────────────────────────────────────────────

/// The fixed prefix of every datagram.
///
/// `kind` stays a raw byte so that packets of unknown type still decode
/// far enough to be logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: u8,
    pub client_id: u32,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType, client_id: u32) -> Self {
        Self {
            kind: packet_type as u8,
            client_id,
        }
    }

    /// The typed kind, or `UnknownVariant` for unassigned bytes.
    pub fn packet_type(&self) -> Result<PacketType, TetherError> {
        PacketType::try_from(self.kind)
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(MAGIC);
        dst.put_u8(self.kind);
        dst.put_u32(self.client_id);
    }

    /// Parse the header from the front of `src`.
    ///
    /// The magic is checked before anything else is read.
    pub fn decode(src: &[u8]) -> Result<Self, TetherError> {
        if src.len() < 2 {
            return Err(TetherError::Truncated {
                needed: 2,
                actual: src.len(),
            });
        }
        let mut buf = src;
        let magic = buf.get_u16();
        if magic != MAGIC {
            return Err(TetherError::InvalidMagic { found: magic });
        }
        if src.len() < HEADER_SIZE {
            return Err(TetherError::Truncated {
                needed: HEADER_SIZE,
                actual: src.len(),
            });
        }
        Ok(Self {
            kind: buf.get_u8(),
            client_id: buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_try_from() {
        assert_eq!(PacketType::try_from(0x03).unwrap(), PacketType::FullFrame);
        assert!(matches!(
            PacketType::try_from(0x7f),
            Err(TetherError::UnknownVariant { value: 0x7f, .. })
        ));
    }

    #[test]
    fn header_layout_is_big_endian() {
        let mut buf = Vec::new();
        PacketHeader::new(PacketType::Ack, 0x0102_0304).encode(&mut buf);
        assert_eq!(buf, [0x54, 0x44, 0x05, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn wrong_magic_wins_over_short_buffer() {
        // Too short for a header, but the magic is already wrong.
        let err = PacketHeader::decode(&[0xde, 0xad, 0x01]).unwrap_err();
        assert!(matches!(err, TetherError::InvalidMagic { found: 0xdead }));
    }

    #[test]
    fn short_header_is_truncated() {
        let err = PacketHeader::decode(&[0x54, 0x44, 0x01]).unwrap_err();
        assert!(matches!(
            err,
            TetherError::Truncated {
                needed: HEADER_SIZE,
                actual: 3
            }
        ));
    }

    #[test]
    fn unknown_kind_still_decodes() {
        let header = PacketHeader::decode(&[0x54, 0x44, 0x99, 0, 0, 0, 7]).unwrap();
        assert_eq!(header.kind, 0x99);
        assert_eq!(header.client_id, 7);
        assert!(header.packet_type().is_err());
    }
}
