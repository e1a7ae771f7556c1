use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{DataType, NodeId, TransmissionType, BROADCAST};

/// Traffic injected by the application layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    pub source: NodeId,
    pub destination: NodeId,
    pub data_type: DataType,
    pub tx_type: TransmissionType,
    /// Explicit caller priority, honoured only when it is a data tier.
    pub priority: Option<i8>,
    pub payload: Bytes,
    pub preemption_allowed: bool,
}

impl ApplicationMessage {
    pub fn unicast(source: NodeId, destination: NodeId, data_type: DataType, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            destination,
            data_type,
            tx_type: TransmissionType::Unicast,
            priority: None,
            payload: payload.into(),
            preemption_allowed: false,
        }
    }

    pub fn broadcast(source: NodeId, data_type: DataType, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            destination: BROADCAST,
            data_type,
            tx_type: TransmissionType::Broadcast,
            priority: None,
            payload: payload.into(),
            preemption_allowed: false,
        }
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST || self.tx_type == TransmissionType::Broadcast
    }
}

/// Terminal reasons reported back to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Backpressure,
    NoRoute,
    LinkDown,
    TtlExpired,
    InvalidFrame,
    SlotUnavailable,
    PhyRejected,
    Duplicate,
    NotSynchronised,
    /// A lower layer did not answer within the request timeout.
    Timeout,
    Internal,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::Backpressure => "backpressure",
            DropReason::NoRoute => "no_route",
            DropReason::LinkDown => "link_down",
            DropReason::TtlExpired => "ttl_expired",
            DropReason::InvalidFrame => "invalid_frame",
            DropReason::SlotUnavailable => "slot_unavailable",
            DropReason::PhyRejected => "phy_rejected",
            DropReason::Duplicate => "duplicate",
            DropReason::NotSynchronised => "not_synchronised",
            DropReason::Timeout => "timeout",
            DropReason::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Dropped(DropReason),
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Queued)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Queued => f.write_str("queued"),
            DeliveryStatus::Sent => f.write_str("sent"),
            DeliveryStatus::Dropped(reason) => write!(f, "dropped:{}", reason),
        }
    }
}
