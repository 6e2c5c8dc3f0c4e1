//! Typed UDP packets and their wire encoding.
//!
//! ## Wire format
//!
//! Every packet starts with the 7-byte [`PacketHeader`]. Type-specific
//! fields follow, big-endian:
//!
//! ```text
//! REGISTER     (nothing)
//! REQUEST      frame_id:u32
//! ACK          frame_id:u32  sequence:u16
//! FULL_FRAME   frame_id:u32  sequence:u16  total:u16  length:u32  crc32:u32  payload
//! DELTA_FRAME  (same as FULL_FRAME)
//! ```
//!
//! The CRC32 covers the payload only. A decoded frame is only returned
//! after its checksum has been recomputed and matched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TetherError;
use crate::header::{HEADER_SIZE, PacketHeader, PacketType};

// ── Constants ────────────────────────────────────────────────────

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Header plus the fixed frame fields.
pub const FRAME_HEADER_SIZE: usize = HEADER_SIZE + 16;

/// Largest frame payload that still fits in one datagram.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - FRAME_HEADER_SIZE;

const REQUEST_SIZE: usize = HEADER_SIZE + 4;
const ACK_SIZE: usize = HEADER_SIZE + 6;

/// CRC32 (IEEE) of a frame payload.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

// ── Frame ────────────────────────────────────────────────────────

/// One chunk of an encoded screen frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub client_id: u32,
    pub frame_id: u32,
    /// Index of this chunk within the frame.
    pub sequence: u16,
    /// Number of chunks making up the frame.
    pub total: u16,
    pub payload: Bytes,
}

// ── Packet ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Register { client_id: u32 },
    Request { client_id: u32, frame_id: u32 },
    FullFrame(Frame),
    DeltaFrame(Frame),
    Ack { client_id: u32, frame_id: u32, sequence: u16 },
    /// A valid header with an unassigned type byte.
    Unknown(PacketHeader),
}

impl Packet {
    pub fn header(&self) -> PacketHeader {
        match self {
            Self::Register { client_id } => PacketHeader::new(PacketType::Register, *client_id),
            Self::Request { client_id, .. } => PacketHeader::new(PacketType::Request, *client_id),
            Self::FullFrame(frame) => PacketHeader::new(PacketType::FullFrame, frame.client_id),
            Self::DeltaFrame(frame) => PacketHeader::new(PacketType::DeltaFrame, frame.client_id),
            Self::Ack { client_id, .. } => PacketHeader::new(PacketType::Ack, *client_id),
            Self::Unknown(header) => *header,
        }
    }

    pub fn client_id(&self) -> u32 {
        self.header().client_id
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Register { .. } | Self::Unknown(_) => HEADER_SIZE,
            Self::Request { .. } => REQUEST_SIZE,
            Self::Ack { .. } => ACK_SIZE,
            Self::FullFrame(frame) | Self::DeltaFrame(frame) => {
                FRAME_HEADER_SIZE + frame.payload.len()
            }
        }
    }

    pub fn encode(&self) -> Result<Bytes, TetherError> {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst)?;
        Ok(dst.freeze())
    }

    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), TetherError> {
        if let Self::FullFrame(frame) | Self::DeltaFrame(frame) = self {
            if frame.payload.len() > MAX_PAYLOAD_SIZE {
                return Err(TetherError::PayloadTooLarge {
                    size: frame.payload.len(),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
        }

        dst.reserve(self.encoded_len());
        self.header().encode(dst);
        match self {
            Self::Register { .. } | Self::Unknown(_) => {}
            Self::Request { frame_id, .. } => dst.put_u32(*frame_id),
            Self::Ack {
                frame_id, sequence, ..
            } => {
                dst.put_u32(*frame_id);
                dst.put_u16(*sequence);
            }
            Self::FullFrame(frame) | Self::DeltaFrame(frame) => {
                dst.put_u32(frame.frame_id);
                dst.put_u16(frame.sequence);
                dst.put_u16(frame.total);
                dst.put_u32(frame.payload.len() as u32);
                dst.put_u32(checksum(&frame.payload));
                dst.put_slice(&frame.payload);
            }
        }
        Ok(())
    }

    /// Decode one datagram.
    ///
    /// Fails on bad magic, short or over-long buffers, and payload
    /// checksum mismatch. Unknown type bytes decode to [`Packet::Unknown`].
    pub fn decode(src: &[u8]) -> Result<Self, TetherError> {
        let header = PacketHeader::decode(src)?;
        let packet_type = match header.packet_type() {
            Ok(t) => t,
            Err(_) => return Ok(Self::Unknown(header)),
        };

        let client_id = header.client_id;
        let mut body = &src[HEADER_SIZE..];

        match packet_type {
            PacketType::Register => {
                exact(src, HEADER_SIZE)?;
                Ok(Self::Register { client_id })
            }
            PacketType::Request => {
                exact(src, REQUEST_SIZE)?;
                Ok(Self::Request {
                    client_id,
                    frame_id: body.get_u32(),
                })
            }
            PacketType::Ack => {
                exact(src, ACK_SIZE)?;
                Ok(Self::Ack {
                    client_id,
                    frame_id: body.get_u32(),
                    sequence: body.get_u16(),
                })
            }
            PacketType::FullFrame | PacketType::DeltaFrame => {
                if src.len() < FRAME_HEADER_SIZE {
                    return Err(TetherError::Truncated {
                        needed: FRAME_HEADER_SIZE,
                        actual: src.len(),
                    });
                }
                let frame_id = body.get_u32();
                let sequence = body.get_u16();
                let total = body.get_u16();
                let declared = body.get_u32() as usize;
                let expected = body.get_u32();

                if declared != body.len() {
                    return Err(TetherError::LengthMismatch {
                        declared,
                        actual: body.len(),
                    });
                }
                let actual = checksum(body);
                if actual != expected {
                    return Err(TetherError::ChecksumMismatch { expected, actual });
                }

                let frame = Frame {
                    client_id,
                    frame_id,
                    sequence,
                    total,
                    payload: Bytes::copy_from_slice(body),
                };
                Ok(if packet_type == PacketType::FullFrame {
                    Self::FullFrame(frame)
                } else {
                    Self::DeltaFrame(frame)
                })
            }
        }
    }
}

/// Fixed-size packets must be exactly `size` bytes.
fn exact(src: &[u8], size: usize) -> Result<(), TetherError> {
    if src.len() < size {
        Err(TetherError::Truncated {
            needed: size,
            actual: src.len(),
        })
    } else if src.len() > size {
        Err(TetherError::LengthMismatch {
            declared: size,
            actual: src.len(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: Vec<u8>) -> Frame {
        Frame {
            client_id: 0xCAFE_BABE,
            frame_id: 41,
            sequence: 2,
            total: 5,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn every_type_roundtrips() {
        let packets = [
            Packet::Register { client_id: 9 },
            Packet::Request {
                client_id: 9,
                frame_id: 100,
            },
            Packet::Ack {
                client_id: 9,
                frame_id: 100,
                sequence: 3,
            },
            Packet::FullFrame(frame(vec![0xFF, 0xD8, 0xFF, 0xE0])),
            Packet::DeltaFrame(frame(b"blocks".to_vec())),
        ];
        for packet in packets {
            let bytes = packet.encode().unwrap();
            assert_eq!(bytes.len(), packet.encoded_len());
            assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn frame_payload_sizes_roundtrip() {
        for size in [0, 1, MAX_PAYLOAD_SIZE] {
            let packet = Packet::FullFrame(frame(vec![0x5A; size]));
            let bytes = packet.encode().unwrap();
            assert_eq!(bytes.len(), FRAME_HEADER_SIZE + size);
            assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn oversized_payload_is_refused() {
        let packet = Packet::DeltaFrame(frame(vec![0; MAX_PAYLOAD_SIZE + 1]));
        assert!(matches!(
            packet.encode(),
            Err(TetherError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let packet = Packet::FullFrame(frame(b"jpeg bytes".to_vec()));
        let mut bytes = packet.encode().unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(TetherError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn corrupted_magic_fails_first() {
        let packet = Packet::FullFrame(frame(b"x".to_vec()));
        let mut bytes = packet.encode().unwrap().to_vec();
        bytes[0] = 0;
        // Corrupt the payload too; magic must still be the reported error.
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(TetherError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn declared_length_must_match() {
        let packet = Packet::FullFrame(frame(vec![1, 2, 3]));
        let mut bytes = packet.encode().unwrap().to_vec();
        bytes.pop();
        assert!(matches!(
            Packet::decode(&bytes),
            Err(TetherError::LengthMismatch {
                declared: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn truncated_request_is_rejected() {
        let bytes = Packet::Request {
            client_id: 1,
            frame_id: 2,
        }
        .encode()
        .unwrap();
        assert!(matches!(
            Packet::decode(&bytes[..bytes.len() - 1]),
            Err(TetherError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_type_decodes_header_only() {
        let mut bytes = BytesMut::new();
        PacketHeader {
            kind: 0x42,
            client_id: 77,
        }
        .encode(&mut bytes);
        bytes.put_slice(b"opaque trailer");
        match Packet::decode(&bytes).unwrap() {
            Packet::Unknown(header) => {
                assert_eq!(header.kind, 0x42);
                assert_eq!(header.client_id, 77);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
