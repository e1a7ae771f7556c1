//! Network-control and voice-control payloads carried inside frames

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, NodeSet};
use crate::FrameError;

/// Neighbour link state as advertised in a HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkCode {
    Asym,
    Sym,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloNeighbour {
    pub id: NodeId,
    pub code: LinkCode,
    /// Sender picked this neighbour as one of its MPRs.
    pub is_mpr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub willingness: u8,
    pub assigned_nc_slot: u8,
    pub neighbours: Vec<HelloNeighbour>,
}

impl HelloMessage {
    pub fn mentions(&self, id: NodeId) -> Option<&HelloNeighbour> {
        self.neighbours.iter().find(|n| n.id == id)
    }

    pub fn symmetric_set(&self) -> NodeSet {
        self.neighbours
            .iter()
            .filter(|n| n.code == LinkCode::Sym)
            .map(|n| n.id)
            .collect()
    }

    /// Encodes, dropping trailing neighbours until the payload fits.
    pub fn encode_within(&self, payload_max: usize) -> Result<Bytes, FrameError> {
        let mut hello = self.clone();
        loop {
            let bytes = encode(&hello)?;
            if bytes.len() <= payload_max {
                return Ok(bytes);
            }
            if hello.neighbours.pop().is_none() {
                return Err(FrameError::PayloadTooLarge {
                    len: bytes.len(),
                    max: payload_max,
                });
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        decode(payload)
    }
}

/// Topology control: the originator's MPR selector set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcMessage {
    pub originator: NodeId,
    pub ansn: u16,
    pub mpr_selectors: Vec<NodeId>,
}

impl TcMessage {
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        encode(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        decode(payload)
    }
}

/// Body of CR (request) and CC (confirm) frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceControl {
    pub requester: NodeId,
    pub grant_ms: u16,
}

impl VoiceControl {
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        encode(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        decode(payload)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, FrameError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map(Bytes::from)
        .map_err(|e| FrameError::Control(e.to_string()))
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    let (value, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map_err(|e| FrameError::Control(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_with(count: u8) -> HelloMessage {
        HelloMessage {
            willingness: 3,
            assigned_nc_slot: 7,
            neighbours: (1..=count)
                .map(|id| HelloNeighbour {
                    id,
                    code: if id % 2 == 0 { LinkCode::Sym } else { LinkCode::Asym },
                    is_mpr: id == 2,
                })
                .collect(),
        }
    }

    #[test]
    fn test_hello_truncates_to_constrained_payload() {
        let hello = hello_with(12);
        let full = hello.encode_within(2800).unwrap();
        assert_eq!(HelloMessage::decode(&full).unwrap(), hello);

        let small = hello.encode_within(16).unwrap();
        assert!(small.len() <= 16);
        let decoded = HelloMessage::decode(&small).unwrap();
        assert!(decoded.neighbours.len() < 12);
        assert_eq!(decoded.neighbours[..], hello.neighbours[..decoded.neighbours.len()]);
        assert_eq!(decoded.assigned_nc_slot, 7);
    }

    #[test]
    fn test_hello_symmetric_set_and_mentions() {
        let hello = hello_with(4);
        let sym = hello.symmetric_set();
        assert!(sym.contains(2) && sym.contains(4));
        assert!(!sym.contains(1));
        assert!(hello.mentions(2).unwrap().is_mpr);
        assert!(hello.mentions(9).is_none());
    }

    #[test]
    fn test_garbage_control_payload_is_rejected() {
        assert!(matches!(TcMessage::decode(&[0xFF]), Err(FrameError::Control(_))));
    }
}
