use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::{DataType, NodeId, Priority, SeqNo};
use crate::FrameError;

/// `source | dest | next_hop | ttl | priority | data_type | seq | timestamp | payload_len`
pub const FRAME_HEADER_LEN: usize = 1 + 1 + 1 + 1 + 1 + 1 + 2 + 4 + 2;

/// One MAC transmission unit.
///
/// Frames are immutable once queued; forwarding and beacon stamping build a
/// new frame that shares the payload buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub source: NodeId,
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub ttl: u8,
    pub priority: Priority,
    pub data_type: DataType,
    pub seq: SeqNo,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn validate(&self, payload_max: usize) -> Result<(), FrameError> {
        if self.ttl == 0 {
            return Err(FrameError::ZeroTtl);
        }
        if self.payload.len() > payload_max {
            return Err(FrameError::PayloadTooLarge {
                len: self.payload.len(),
                max: payload_max,
            });
        }
        if self.payload.len() > u16::MAX as usize {
            return Err(FrameError::PayloadTooLarge {
                len: self.payload.len(),
                max: u16::MAX as usize,
            });
        }
        Ok(())
    }

    pub fn with_next_hop(&self, next_hop: NodeId) -> Frame {
        Frame {
            next_hop,
            ..self.clone()
        }
    }

    pub fn with_timestamp(&self, timestamp: u32) -> Frame {
        Frame {
            timestamp,
            ..self.clone()
        }
    }

    /// Copy for the next hop with TTL decremented and relay priority.
    /// Returns `None` once the TTL is spent.
    pub fn forwarded(&self, next_hop: NodeId) -> Option<Frame> {
        let ttl = self.ttl.checked_sub(1).filter(|ttl| *ttl > 0)?;
        Some(Frame {
            next_hop,
            ttl,
            priority: Priority::RELAY,
            ..self.clone()
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.source);
        buf.put_u8(self.destination);
        buf.put_u8(self.next_hop);
        buf.put_u8(self.ttl);
        buf.put_i8(self.priority.value());
        buf.put_u8(self.data_type as u8);
        buf.put_u16_le(self.seq);
        buf.put_u32_le(self.timestamp);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes, payload_max: usize) -> Result<Frame, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: FRAME_HEADER_LEN,
                got: buf.len(),
            });
        }
        let source = buf.get_u8();
        let destination = buf.get_u8();
        let next_hop = buf.get_u8();
        let ttl = buf.get_u8();
        if ttl == 0 {
            return Err(FrameError::ZeroTtl);
        }
        let raw_priority = buf.get_i8();
        let priority = Priority::new(raw_priority).ok_or(FrameError::InvalidPriority(raw_priority))?;
        let data_type = DataType::try_from(buf.get_u8()).map_err(FrameError::UnknownDataType)?;
        let seq = buf.get_u16_le();
        let timestamp = buf.get_u32_le();
        let payload_len = buf.get_u16_le() as usize;

        if payload_len > payload_max {
            return Err(FrameError::PayloadTooLarge {
                len: payload_len,
                max: payload_max,
            });
        }
        if buf.remaining() != payload_len {
            return Err(FrameError::LengthMismatch {
                declared: payload_len,
                actual: buf.remaining(),
            });
        }

        Ok(Frame {
            source,
            destination,
            next_hop,
            ttl,
            priority,
            data_type,
            seq,
            timestamp,
            payload: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame {
            source: 3,
            destination: 9,
            next_hop: 5,
            ttl: 4,
            priority: Priority::FILE,
            data_type: DataType::File,
            seq: 0x1234,
            timestamp: 0xA0B0_C0D0,
            payload: Bytes::from_static(b"hello mesh"),
        }
    }

    #[test]
    fn test_wire_layout_is_little_endian() {
        let wire = sample().encode();
        assert_eq!(wire.len(), FRAME_HEADER_LEN + 10);
        assert_eq!(&wire[..6], &[3, 9, 5, 4, 2, DataType::File as u8]);
        assert_eq!(&wire[6..8], &[0x34, 0x12]);
        assert_eq!(&wire[8..12], &[0xD0, 0xC0, 0xB0, 0xA0]);
        assert_eq!(&wire[12..14], &[10, 0]);
        assert_eq!(&wire[14..], b"hello mesh");

        let decoded = Frame::decode(wire, 64).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let wire = sample().encode();
        assert!(matches!(
            Frame::decode(wire.slice(..5), 64),
            Err(FrameError::Truncated { .. })
        ));
        assert!(matches!(
            Frame::decode(wire.clone(), 4),
            Err(FrameError::PayloadTooLarge { len: 10, max: 4 })
        ));
        assert!(matches!(
            Frame::decode(wire.slice(..wire.len() - 1), 64),
            Err(FrameError::LengthMismatch { .. })
        ));

        let mut bad_type = wire.to_vec();
        bad_type[5] = 200;
        assert!(matches!(
            Frame::decode(Bytes::from(bad_type), 64),
            Err(FrameError::UnknownDataType(200))
        ));

        let mut zero_ttl = wire.to_vec();
        zero_ttl[3] = 0;
        assert!(matches!(
            Frame::decode(Bytes::from(zero_ttl), 64),
            Err(FrameError::ZeroTtl)
        ));
        assert_eq!(Frame { ttl: 0, ..sample() }.validate(64), Err(FrameError::ZeroTtl));

        let mut bad_priority = wire.to_vec();
        bad_priority[4] = 9;
        assert!(matches!(
            Frame::decode(Bytes::from(bad_priority), 64),
            Err(FrameError::InvalidPriority(9))
        ));
    }

    #[test]
    fn test_forwarding_is_copy_on_write() {
        let original = sample();
        let hop = original.forwarded(7).unwrap();
        assert_eq!(hop.next_hop, 7);
        assert_eq!(hop.ttl, 3);
        assert_eq!(hop.priority, Priority::RELAY);
        assert_eq!(original.next_hop, 5);
        assert_eq!(original.ttl, 4);
        assert_eq!(hop.payload.as_ptr(), original.payload.as_ptr());

        let last = Frame { ttl: 1, ..sample() };
        assert!(last.forwarded(7).is_none());
    }
}
