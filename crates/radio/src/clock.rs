//! TDMA frame clock and beacon-driven time synchronisation

use std::time::Duration;
use tokio::time::Instant;
use log::{debug, info, warn};

use tacmesh_core::types::{CYCLES_PER_SUPERCYCLE, FRAMES_PER_CYCLE, FRAMES_PER_SUPERCYCLE, SLOTS_PER_FRAME};
use tacmesh_core::NodeId;

/// Position in the slot / frame / cycle / supercycle hierarchy.
///
/// The clock counts absolute slots since the network epoch; all other
/// counters derive from that, so shifting the clock keeps them consistent.
#[derive(Debug, Clone)]
pub struct FrameClock {
    position: u64,
    boundary: Instant,
    slot_duration: Duration,
    sync_frame: Option<u64>,
}

impl FrameClock {
    pub fn new(slot_duration: Duration, now: Instant) -> Self {
        Self {
            position: 0,
            boundary: now,
            slot_duration,
            sync_frame: None,
        }
    }

    pub fn slot_duration(&self) -> Duration {
        self.slot_duration
    }

    fn slot_ms(&self) -> u64 {
        (self.slot_duration.as_millis() as u64).max(1)
    }

    pub fn frame_ms(&self) -> u64 {
        self.slot_ms() * SLOTS_PER_FRAME as u64
    }

    /// Advances one slot.
    pub fn tick(&mut self) {
        self.position += 1;
        self.boundary += self.slot_duration;
    }

    pub fn next_boundary(&self) -> Instant {
        self.boundary + self.slot_duration
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn slot_in_frame(&self) -> u8 {
        (self.position % SLOTS_PER_FRAME as u64) as u8
    }

    pub fn frame_number(&self) -> u64 {
        self.position / SLOTS_PER_FRAME as u64
    }

    pub fn frame_in_cycle(&self) -> u8 {
        (self.frame_number() % FRAMES_PER_CYCLE as u64) as u8
    }

    pub fn cycle_in_supercycle(&self) -> u8 {
        ((self.frame_number() / FRAMES_PER_CYCLE as u64) % CYCLES_PER_SUPERCYCLE as u64) as u8
    }

    pub fn frame_in_supercycle(&self) -> u8 {
        (self.frame_number() % FRAMES_PER_SUPERCYCLE as u64) as u8
    }

    pub fn supercycle(&self) -> u64 {
        self.frame_number() / FRAMES_PER_SUPERCYCLE as u64
    }

    /// NC slot number 1..=40 when the current slot is slot 8 or 9.
    pub fn nc_slot_number(&self) -> Option<u8> {
        let slot = self.slot_in_frame();
        (slot >= 8).then(|| self.frame_in_supercycle() * 2 + (slot - 8) + 1)
    }

    pub fn is_supercycle_start(&self) -> bool {
        self.position % (SLOTS_PER_FRAME as u64 * FRAMES_PER_SUPERCYCLE as u64) == 0
    }

    /// Network time at the start of the current slot, as carried in frame timestamps.
    pub fn slot_start_time(&self) -> u32 {
        (self.position * self.slot_ms()) as u32
    }

    pub fn network_time_ms(&self, now: Instant) -> u64 {
        self.position * self.slot_ms() + now.saturating_duration_since(self.boundary).as_millis() as u64
    }

    /// Jumps to an absolute network time.
    pub fn adopt(&mut self, network_time_ms: u64, now: Instant) {
        let slot_ms = self.slot_ms();
        self.position = network_time_ms / slot_ms;
        let into_slot = Duration::from_millis(network_time_ms % slot_ms);
        self.boundary = now.checked_sub(into_slot).unwrap_or(now);
    }

    /// Moves local time by `offset_ms` (positive when the network is ahead).
    pub fn adjust(&mut self, offset_ms: i64, now: Instant) {
        let current = self.network_time_ms(now) as i64;
        let target = (current + offset_ms).max(0) as u64;
        self.adopt(target, now);
    }

    pub fn mark_synchronised(&mut self) {
        let frame = self.frame_number();
        self.sync_frame = Some(if self.slot_in_frame() == 0 { frame } else { frame + 1 });
    }

    pub fn clear_sync(&mut self) {
        self.sync_frame = None;
    }

    pub fn is_synchronised(&self) -> bool {
        self.sync_frame.is_some()
    }

    /// Full frames elapsed since synchronisation; `None` before sync or in
    /// the partial frame in which sync happened.
    pub fn frame_count(&self) -> Option<u64> {
        self.sync_frame.and_then(|start| self.frame_number().checked_sub(start))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Unsynchronised,
    Scanning { until: Instant },
    MasterHeard,
    Master,
}

/// Wrap-safe difference `network - local` folded into half a frame.
pub fn wrap_offset(network_ms: u64, local_ms: u64, frame_ms: u64) -> i64 {
    let frame = frame_ms as i64;
    let diff = ((network_ms % frame_ms) as i64 - (local_ms % frame_ms) as i64).rem_euclid(frame);
    if diff > frame / 2 {
        diff - frame
    } else {
        diff
    }
}

#[derive(Debug)]
pub struct TimeSync {
    own_id: NodeId,
    status: SyncStatus,
    samples: Vec<i64>,
    last_beacon_supercycle: u64,
    loss_limit: u64,
}

pub enum BeaconOutcome {
    /// First beacon: adopt the sender's absolute time.
    Acquired,
    Sampled,
    Ignored,
}

impl TimeSync {
    pub fn new(own_id: NodeId, neighbour_timeout_supercycles: u64) -> Self {
        Self {
            own_id,
            status: SyncStatus::Unsynchronised,
            samples: Vec::new(),
            last_beacon_supercycle: 0,
            loss_limit: 2 * neighbour_timeout_supercycles,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn is_synchronised(&self) -> bool {
        matches!(self.status, SyncStatus::MasterHeard | SyncStatus::Master)
    }

    pub fn start_scan(&mut self, now: Instant, max_scan: Duration) {
        debug!("Node {} starting acquisition scan ({:?})", self.own_id, max_scan);
        self.samples.clear();
        self.status = SyncStatus::Scanning { until: now + max_scan };
    }

    /// Returns `true` when the scan ran out and this node became MASTER.
    pub fn poll_scan(&mut self, now: Instant, supercycle: u64) -> bool {
        match self.status {
            SyncStatus::Scanning { until } if now >= until => {
                info!("Node {} heard no beacon, declaring MASTER", self.own_id);
                self.status = SyncStatus::Master;
                self.last_beacon_supercycle = supercycle;
                true
            }
            _ => false,
        }
    }

    pub fn on_beacon(&mut self, source: NodeId, network_ms: u64, local_ms: u64, frame_ms: u64, supercycle: u64) -> BeaconOutcome {
        match self.status {
            SyncStatus::Unsynchronised | SyncStatus::Scanning { .. } => {
                info!("Node {} synchronised to beacon from {}", self.own_id, source);
                self.status = SyncStatus::MasterHeard;
                self.samples.clear();
                BeaconOutcome::Acquired
            }
            SyncStatus::Master if source > self.own_id => BeaconOutcome::Ignored,
            SyncStatus::Master => {
                info!("Node {} yielding MASTER role to node {}", self.own_id, source);
                self.status = SyncStatus::MasterHeard;
                self.last_beacon_supercycle = supercycle;
                self.samples.push(wrap_offset(network_ms, local_ms, frame_ms));
                BeaconOutcome::Sampled
            }
            SyncStatus::MasterHeard => {
                self.last_beacon_supercycle = supercycle;
                self.samples.push(wrap_offset(network_ms, local_ms, frame_ms));
                BeaconOutcome::Sampled
            }
        }
    }

    /// Records the supercycle at which sync was acquired.
    pub fn note_acquired(&mut self, supercycle: u64) {
        self.last_beacon_supercycle = supercycle;
    }

    /// Mean of the collected offsets, clearing them.
    pub fn take_offset(&mut self) -> Option<i64> {
        if self.samples.is_empty() {
            return None;
        }
        let mean = self.samples.iter().sum::<i64>() / self.samples.len() as i64;
        self.samples.clear();
        Some(mean)
    }

    /// Returns `true` when beacons have been missing long enough to drop sync.
    pub fn check_loss(&mut self, supercycle: u64) -> bool {
        if self.status != SyncStatus::MasterHeard {
            return false;
        }
        if supercycle.saturating_sub(self.last_beacon_supercycle) > self.loss_limit {
            warn!("Node {} lost beacons for {} supercycles, re-acquiring", self.own_id, self.loss_limit);
            self.status = SyncStatus::Unsynchronised;
            self.samples.clear();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_roll_over() {
        let now = Instant::now();
        let mut clock = FrameClock::new(Duration::from_millis(10), now);
        for _ in 0..9 {
            clock.tick();
        }
        assert_eq!(clock.slot_in_frame(), 9);
        assert_eq!(clock.nc_slot_number(), Some(2));
        clock.tick();
        assert_eq!((clock.slot_in_frame(), clock.frame_in_cycle()), (0, 1));

        for _ in 0..90 {
            clock.tick();
        }
        assert_eq!((clock.frame_in_cycle(), clock.cycle_in_supercycle()), (0, 1));
        for _ in 0..100 {
            clock.tick();
        }
        assert_eq!(clock.supercycle(), 1);
        assert_eq!(clock.cycle_in_supercycle(), 0);
        assert!(clock.is_supercycle_start());
    }

    #[test]
    fn test_nc_slots_cover_forty_per_supercycle() {
        let mut clock = FrameClock::new(Duration::from_millis(10), Instant::now());
        let mut seen = Vec::new();
        for _ in 0..200 {
            if let Some(nc) = clock.nc_slot_number() {
                seen.push(nc);
            }
            clock.tick();
        }
        assert_eq!(seen, (1..=40).collect::<Vec<u8>>());
    }

    #[test]
    fn test_frame_count_starts_at_first_full_frame() {
        let now = Instant::now();
        let mut clock = FrameClock::new(Duration::from_millis(10), now);
        assert_eq!(clock.frame_count(), None);
        clock.mark_synchronised();
        assert_eq!(clock.frame_count(), Some(0));

        let mut mid = FrameClock::new(Duration::from_millis(10), now);
        mid.adopt(35, now);
        mid.mark_synchronised();
        assert_eq!(mid.frame_count(), None);
        for _ in 0..7 {
            mid.tick();
        }
        assert_eq!(mid.frame_count(), Some(0));
    }

    #[test]
    fn test_wrap_offset_is_wrap_safe() {
        assert_eq!(wrap_offset(105, 100, 100), 5);
        assert_eq!(wrap_offset(2, 98, 100), 4);
        assert_eq!(wrap_offset(98, 2, 100), -4);
        assert_eq!(wrap_offset(50, 0, 100), 50);
    }

    #[test]
    fn test_adjust_moves_position() {
        let now = Instant::now();
        let mut clock = FrameClock::new(Duration::from_millis(10), now);
        clock.adopt(1_000, now);
        assert_eq!(clock.position(), 100);
        clock.adjust(25, now);
        assert_eq!(clock.position(), 102);
        assert_eq!(clock.network_time_ms(now), 1_025);
        clock.adjust(-30, now);
        assert_eq!(clock.network_time_ms(now), 995);
    }

    #[test]
    fn test_averaged_offset() {
        let mut sync = TimeSync::new(5, 2);
        sync.start_scan(Instant::now(), Duration::from_millis(200));
        assert!(matches!(sync.on_beacon(1, 0, 0, 100, 0), BeaconOutcome::Acquired));
        assert!(sync.is_synchronised());
        sync.on_beacon(1, 104, 100, 100, 0);
        sync.on_beacon(2, 2, 100, 100, 0);
        assert_eq!(sync.take_offset(), Some(3));
        assert_eq!(sync.take_offset(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_declares_master() {
        let mut sync = TimeSync::new(4, 2);
        let start = Instant::now();
        sync.start_scan(start, Duration::from_millis(200));
        assert!(!sync.poll_scan(start + Duration::from_millis(150), 0));
        assert!(sync.poll_scan(start + Duration::from_millis(200), 0));
        assert_eq!(sync.status(), SyncStatus::Master);
        assert!(!sync.check_loss(100));
    }

    #[test]
    fn test_master_yields_to_lower_id_and_loss_drops_sync() {
        let mut sync = TimeSync::new(4, 2);
        sync.start_scan(Instant::now(), Duration::ZERO);
        sync.poll_scan(Instant::now(), 0);
        assert!(matches!(sync.on_beacon(9, 0, 0, 100, 1), BeaconOutcome::Ignored));
        assert_eq!(sync.status(), SyncStatus::Master);
        assert!(matches!(sync.on_beacon(2, 0, 0, 100, 1), BeaconOutcome::Sampled));
        assert_eq!(sync.status(), SyncStatus::MasterHeard);

        assert!(!sync.check_loss(5));
        assert!(sync.check_loss(6));
        assert!(!sync.is_synchronised());
    }
}
