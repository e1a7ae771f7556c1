//! core frame and message types for the TacMesh radio stack

use thiserror::Error;

pub mod control;
pub mod frame;
pub mod message;
pub mod types;

pub use control::{HelloMessage, HelloNeighbour, LinkCode, TcMessage, VoiceControl};
pub use frame::{Frame, FRAME_HEADER_LEN};
pub use message::{ApplicationMessage, DeliveryStatus, DropReason};
pub use types::{DataType, NodeId, NodeSet, Priority, SeqNo, TransmissionType, BROADCAST};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("unknown data type tag {0}")]
    UnknownDataType(u8),

    #[error("priority {0} outside -1..=4")]
    InvalidPriority(i8),

    #[error("declared payload length {declared} but {actual} bytes follow")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("TTL exhausted")]
    TtlExpired,

    #[error("TTL of zero on the wire")]
    ZeroTtl,

    #[error("control payload: {0}")]
    Control(String),
}
