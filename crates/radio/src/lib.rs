//! radio resource control layer for the TacMesh TDMA mesh

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tacmesh_core::{DropReason, FrameError, NodeId};
use tacmesh_core::types::NC_SLOTS_PER_SUPERCYCLE;

pub mod admission;
pub mod clock;
pub mod fabric;
pub mod medium;
pub mod nc;
pub mod neighbour;
pub mod node;
pub mod olsr;
pub mod phy;
pub mod pool;
pub mod queue;
pub mod rrc;
pub mod scheduler;
pub mod tdma;
pub mod voice;

pub use clock::{FrameClock, SyncStatus, TimeSync};
pub use fabric::{FabricReceiver, FabricSender, Header, Message, MessageKind, PttEvent, RequestId};
pub use medium::{LinkProfile, MediumConfig, RadioMedium};
pub use neighbour::{NeighbourEntry, NeighbourTable, RouteCache};
pub use node::{spawn_node, AppEvent, NodeHandle};
pub use phy::{RadioDevice, RxFrame};
pub use pool::{Pool, PoolIndex, SharedPool};
pub use queue::{FrameQueue, QueueKind, QueueSet};
pub use scheduler::{SlotDecision, SlotScheduler, SlotType, SLOT_SCHEDULE};
pub use voice::{VoiceReservation, VoiceState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("frame pool exhausted")]
    PoolFull,

    #[error("queue full")]
    QueueFull,

    #[error("queue empty")]
    QueueEmpty,

    #[error("frame already queued")]
    Duplicate,

    #[error("neighbour table full")]
    TableFull,

    #[error("pool slot {0} is not allocated")]
    UnallocatedSlot(usize),

    #[error("no route to node {0}")]
    NoRoute(NodeId),

    #[error("no slot available")]
    SlotUnavailable,

    #[error("request timed out")]
    Timeout,

    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    #[error("link to node {0} is down")]
    LinkDown(NodeId),

    #[error("not synchronised to the network")]
    NotSynchronised,

    #[error("illegal voice FSM transition: {event} in {state}")]
    FsmIllegalTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("fabric channel {0} closed")]
    ChannelClosed(&'static str),
}

impl RadioError {
    /// Reason surfaced to the application when this error ends a message.
    pub fn drop_reason(&self) -> DropReason {
        match self {
            RadioError::PoolFull | RadioError::QueueFull | RadioError::TableFull => DropReason::Backpressure,
            RadioError::Duplicate => DropReason::Duplicate,
            RadioError::NoRoute(_) => DropReason::NoRoute,
            RadioError::SlotUnavailable => DropReason::SlotUnavailable,
            RadioError::Timeout => DropReason::Timeout,
            RadioError::InvalidFrame(FrameError::TtlExpired) => DropReason::TtlExpired,
            RadioError::InvalidFrame(_) => DropReason::InvalidFrame,
            RadioError::LinkDown(_) => DropReason::LinkDown,
            RadioError::NotSynchronised => DropReason::NotSynchronised,
            RadioError::QueueEmpty
            | RadioError::UnallocatedSlot(_)
            | RadioError::FsmIllegalTransition { .. }
            | RadioError::ChannelClosed(_) => DropReason::Internal,
        }
    }
}

/// How NC slots are handed out when no explicit slot is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NcLayout {
    /// Node `k` owns NC slot `k`: early frames of the supercycle fill first.
    Packed,
    /// Node `k` owns the first NC slot of frame `k - 1`, so small meshes beacon every frame.
    Interleaved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    pub node_id: NodeId,
    pub payload_max: usize,
    pub queue_size: usize,
    pub frame_pool_size: usize,
    pub channel_capacity: usize,
    pub max_monitored_nodes: usize,
    pub neighbour_timeout_supercycles: u64,
    pub voice_grant: Duration,
    pub cr_timeout: Duration,
    pub request_timeout: Duration,
    pub route_request_timeout: Duration,
    pub route_cache_ttl: Duration,
    pub admit_wait: Duration,
    pub slot_duration: Duration,
    pub max_scan_time: Duration,
    /// Supercycles between HELLOs.
    pub hello_interval: u64,
    /// Supercycles between periodic TCs.
    pub tc_interval: u64,
    pub willingness: u8,
    pub network_diameter: u8,
    pub gu_transmit_probability: f64,
    pub rng_seed: Option<u64>,
    pub nc_slot: Option<u8>,
    pub nc_layout: NcLayout,
    pub rssi_min: f32,
    pub snr_min: f32,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            payload_max: 2800,
            queue_size: 10,
            frame_pool_size: 64,
            channel_capacity: 32,
            max_monitored_nodes: tacmesh_core::types::MAX_MONITORED_NODES,
            neighbour_timeout_supercycles: 2,
            voice_grant: Duration::from_millis(3000),
            cr_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(5000),
            route_request_timeout: Duration::from_millis(200),
            route_cache_ttl: Duration::from_millis(1000),
            admit_wait: Duration::from_millis(200),
            slot_duration: Duration::from_millis(10),
            max_scan_time: Duration::from_millis(200),
            hello_interval: 1,
            tc_interval: 5,
            willingness: 3,
            network_diameter: 8,
            gu_transmit_probability: 0.5,
            rng_seed: None,
            nc_slot: None,
            nc_layout: NcLayout::Packed,
            rssi_min: -90.0,
            snr_min: 10.0,
        }
    }
}

impl RadioConfig {
    pub fn for_node(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Voice-only builds with a 16 byte payload cap.
    pub fn constrained(node_id: NodeId) -> Self {
        Self {
            node_id,
            payload_max: 16,
            ..Default::default()
        }
    }

    pub fn data(node_id: NodeId) -> Self {
        Self {
            node_id,
            payload_max: 2800,
            ..Default::default()
        }
    }

    pub fn frame_duration(&self) -> Duration {
        self.slot_duration * tacmesh_core::types::SLOTS_PER_FRAME as u32
    }

    pub fn supercycle_duration(&self) -> Duration {
        self.slot_duration * tacmesh_core::types::SLOTS_PER_SUPERCYCLE as u32
    }

    /// NC slot number (1..=40) owned by this node.
    pub fn own_nc_slot(&self) -> u8 {
        if let Some(slot) = self.nc_slot {
            return slot.clamp(1, NC_SLOTS_PER_SUPERCYCLE);
        }
        let k = self.node_id.saturating_sub(1) % NC_SLOTS_PER_SUPERCYCLE;
        match self.nc_layout {
            NcLayout::Packed => k + 1,
            NcLayout::Interleaved => {
                let frames = NC_SLOTS_PER_SUPERCYCLE / 2;
                (k % frames) * 2 + (k / frames) + 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nc_slot_layouts() {
        let packed = RadioConfig::for_node(3);
        assert_eq!(packed.own_nc_slot(), 3);

        let interleaved = RadioConfig {
            nc_layout: NcLayout::Interleaved,
            ..RadioConfig::for_node(3)
        };
        // node 3 -> frame 2, first NC slot
        assert_eq!(interleaved.own_nc_slot(), 5);
        let late = RadioConfig {
            nc_layout: NcLayout::Interleaved,
            ..RadioConfig::for_node(21)
        };
        assert_eq!(late.own_nc_slot(), 2);

        let explicit = RadioConfig {
            nc_slot: Some(39),
            ..RadioConfig::for_node(3)
        };
        assert_eq!(explicit.own_nc_slot(), 39);
    }

    #[test]
    fn test_presets() {
        assert_eq!(RadioConfig::constrained(1).payload_max, 16);
        assert_eq!(RadioConfig::data(1).payload_max, 2800);
        assert_eq!(RadioConfig::default().frame_duration(), Duration::from_millis(100));
        assert_eq!(RadioConfig::default().supercycle_duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_drop_reason_mapping() {
        assert_eq!(RadioError::QueueFull.drop_reason(), DropReason::Backpressure);
        assert_eq!(RadioError::PoolFull.drop_reason(), DropReason::Backpressure);
        assert_eq!(RadioError::NoRoute(4).drop_reason(), DropReason::NoRoute);
        assert_eq!(
            RadioError::InvalidFrame(FrameError::TtlExpired).drop_reason(),
            DropReason::TtlExpired
        );
        assert_eq!(RadioError::Timeout.drop_reason(), DropReason::Timeout);
        assert_eq!(RadioError::Duplicate.drop_reason(), DropReason::Duplicate);
        assert_eq!(RadioError::TableFull.drop_reason(), DropReason::Backpressure);
        assert_eq!(RadioError::UnallocatedSlot(3).drop_reason(), DropReason::Internal);
    }
}
