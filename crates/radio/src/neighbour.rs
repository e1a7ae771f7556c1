//! Per-neighbour link state, MPR bookkeeping and the next-hop cache

use std::collections::{BTreeMap, HashMap};
use tokio::time::{Duration, Instant};
use log::{debug, warn};

use tacmesh_core::{LinkCode, NodeId, NodeSet};

use crate::RadioError;

pub const RSSI_RANGE: (f32, f32) = (-120.0, -50.0);
pub const SNR_RANGE: (f32, f32) = (0.0, 40.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct NeighbourEntry {
    pub id: NodeId,
    pub state: LinkState,
    pub link_code: LinkCode,
    pub rssi: f32,
    pub snr: f32,
    pub per: f32,
    pub last_heard: u64,
    /// 0 until the neighbour has told us.
    pub nc_slot: u8,
    pub willingness: u8,
    pub is_mpr: bool,
    pub is_mpr_selector: bool,
    /// Symmetric neighbours this neighbour advertised.
    pub two_hop: NodeSet,
    metrics_known: bool,
}

impl NeighbourEntry {
    fn new(id: NodeId, nc_slot: u8, now: u64) -> Self {
        Self {
            id,
            state: LinkState::Up,
            link_code: LinkCode::Asym,
            rssi: RSSI_RANGE.0,
            snr: SNR_RANGE.0,
            per: 0.0,
            last_heard: now,
            nc_slot,
            willingness: 3,
            is_mpr: false,
            is_mpr_selector: false,
            two_hop: NodeSet::new(),
            metrics_known: false,
        }
    }

    pub fn is_symmetric(&self) -> bool {
        self.state == LinkState::Up && self.link_code == LinkCode::Sym
    }

    pub fn metrics_known(&self) -> bool {
        self.metrics_known
    }
}

#[derive(Debug)]
pub struct NeighbourTable {
    own_id: NodeId,
    entries: BTreeMap<NodeId, NeighbourEntry>,
    capacity: usize,
    timeout_supercycles: u64,
}

impl NeighbourTable {
    pub fn new(own_id: NodeId, capacity: usize, timeout_supercycles: u64) -> Self {
        Self {
            own_id,
            entries: BTreeMap::new(),
            capacity,
            timeout_supercycles,
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    /// Creates or refreshes an entry. Returns `true` when the neighbour is new.
    pub fn on_hello(&mut self, source: NodeId, assigned_nc_slot: u8, supercycle_now: u64) -> Result<bool, RadioError> {
        if let Some(entry) = self.entries.get_mut(&source) {
            entry.last_heard = supercycle_now;
            entry.state = LinkState::Up;
            if assigned_nc_slot != 0 {
                entry.nc_slot = assigned_nc_slot;
            }
            return Ok(false);
        }
        if self.entries.len() >= self.capacity {
            warn!("Neighbour table full ({} entries), ignoring node {}", self.capacity, source);
            return Err(RadioError::TableFull);
        }
        debug!("New neighbour {} (nc slot {})", source, assigned_nc_slot);
        self.entries
            .insert(source, NeighbourEntry::new(source, assigned_nc_slot, supercycle_now));
        Ok(true)
    }

    /// Updates link metrics, clamped to the radio's physical range. PER is kept
    /// when `per` is `None`.
    pub fn on_metrics(&mut self, source: NodeId, rssi: f32, snr: f32, per: Option<f32>) -> bool {
        let Some(entry) = self.entries.get_mut(&source) else {
            return false;
        };
        entry.rssi = clamp_finite(rssi, RSSI_RANGE.0, RSSI_RANGE.1);
        entry.snr = clamp_finite(snr, SNR_RANGE.0, SNR_RANGE.1);
        if let Some(per) = per {
            entry.per = clamp_finite(per, 0.0, 1.0);
        }
        entry.metrics_known = true;
        true
    }

    /// Removes entries not heard for more than the timeout; returns their ids.
    pub fn age(&mut self, supercycle_now: u64) -> Vec<NodeId> {
        let timeout = self.timeout_supercycles;
        let expired: Vec<NodeId> = self
            .entries
            .values()
            .filter(|e| supercycle_now.saturating_sub(e.last_heard) > timeout)
            .map(|e| e.id)
            .collect();
        for id in &expired {
            debug!("Neighbour {} timed out", id);
            self.entries.remove(id);
        }
        expired
    }

    pub fn is_link_usable(&self, id: NodeId, rssi_min: f32, snr_min: f32) -> bool {
        self.entries
            .get(&id)
            .map_or(false, |e| e.state == LinkState::Up && e.rssi >= rssi_min && e.snr >= snr_min)
    }

    pub fn is_neighbour(&self, id: NodeId) -> bool {
        self.entries.get(&id).map_or(false, |e| e.state == LinkState::Up)
    }

    pub fn get(&self, id: NodeId) -> Option<&NeighbourEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NeighbourEntry> {
        self.entries.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighbourEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn symmetric_neighbours(&self) -> NodeSet {
        self.entries.values().filter(|e| e.is_symmetric()).map(|e| e.id).collect()
    }

    pub fn mpr_selectors(&self) -> NodeSet {
        self.entries
            .values()
            .filter(|e| e.is_mpr_selector)
            .map(|e| e.id)
            .collect()
    }

    pub fn mprs(&self) -> NodeSet {
        self.entries.values().filter(|e| e.is_mpr).map(|e| e.id).collect()
    }

    /// Greedy MPR selection: cover every strict two-hop neighbour through
    /// symmetric one-hop neighbours, preferring willingness then coverage.
    pub fn select_mprs(&mut self) -> NodeSet {
        let one_hop = self.symmetric_neighbours();
        let mut uncovered = NodeSet::new();
        for entry in self.entries.values().filter(|e| e.is_symmetric()) {
            for n in entry.two_hop.iter() {
                if n != self.own_id && !one_hop.contains(n) {
                    uncovered.insert(n);
                }
            }
        }

        let mut selected = NodeSet::new();
        while !uncovered.is_empty() {
            let best = self
                .entries
                .values()
                .filter(|e| e.is_symmetric() && !selected.contains(e.id) && e.willingness > 0)
                .map(|e| {
                    let coverage = e.two_hop.iter().filter(|n| uncovered.contains(*n)).count();
                    (e.id, e.willingness, coverage)
                })
                .filter(|(_, _, coverage)| *coverage > 0)
                .max_by_key(|(id, willingness, coverage)| (*willingness, *coverage, std::cmp::Reverse(*id)));
            let Some((id, _, _)) = best else {
                break;
            };
            selected.insert(id);
            if let Some(entry) = self.entries.get(&id) {
                for n in entry.two_hop.iter() {
                    uncovered.remove(n);
                }
            }
        }

        for entry in self.entries.values_mut() {
            entry.is_mpr = selected.contains(entry.id);
        }
        selected
    }
}

fn clamp_finite(value: f32, lo: f32, hi: f32) -> f32 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRoute {
    next_hop: NodeId,
    hop_count: u8,
    learned: Instant,
}

/// Last good OLSR answers, served while fresh and as a degraded fallback after.
#[derive(Debug)]
pub struct RouteCache {
    ttl: Duration,
    routes: HashMap<NodeId, CachedRoute>,
}

impl RouteCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            routes: HashMap::new(),
        }
    }

    pub fn insert(&mut self, dest: NodeId, next_hop: NodeId, hop_count: u8, now: Instant) {
        self.routes.insert(
            dest,
            CachedRoute {
                next_hop,
                hop_count,
                learned: now,
            },
        );
    }

    pub fn fresh(&self, dest: NodeId, now: Instant) -> Option<(NodeId, u8)> {
        self.routes
            .get(&dest)
            .filter(|r| now.saturating_duration_since(r.learned) <= self.ttl)
            .map(|r| (r.next_hop, r.hop_count))
    }

    /// Any cached answer regardless of age.
    pub fn last_known(&self, dest: NodeId) -> Option<(NodeId, u8)> {
        self.routes.get(&dest).map(|r| (r.next_hop, r.hop_count))
    }

    pub fn remove(&mut self, dest: NodeId) {
        self.routes.remove(&dest);
    }

    /// Drops every route whose next hop is `neighbour`.
    pub fn invalidate_via(&mut self, neighbour: NodeId) -> usize {
        let before = self.routes.len();
        self.routes
            .retain(|dest, r| r.next_hop != neighbour && *dest != neighbour);
        before - self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_creates_then_refreshes() {
        let mut table = NeighbourTable::new(1, 40, 2);
        assert_eq!(table.on_hello(2, 5, 10), Ok(true));
        assert_eq!(table.on_hello(2, 0, 11), Ok(false));
        let entry = table.get(2).unwrap();
        assert_eq!(entry.last_heard, 11);
        assert_eq!(entry.nc_slot, 5);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut table = NeighbourTable::new(1, 2, 2);
        table.on_hello(2, 0, 0).unwrap();
        table.on_hello(3, 0, 0).unwrap();
        assert_eq!(table.on_hello(4, 0, 0), Err(RadioError::TableFull));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_metrics_are_clamped() {
        let mut table = NeighbourTable::new(1, 40, 2);
        table.on_hello(2, 0, 0).unwrap();
        assert!(table.on_metrics(2, -10.0, 55.0, Some(1.5)));
        let e = table.get(2).unwrap();
        assert_eq!((e.rssi, e.snr, e.per), (-50.0, 40.0, 1.0));

        table.on_metrics(2, -200.0, -3.0, None);
        let e = table.get(2).unwrap();
        assert_eq!((e.rssi, e.snr, e.per), (-120.0, 0.0, 1.0));
        assert!(!table.on_metrics(9, -60.0, 20.0, None));
    }

    #[test]
    fn test_aging_removes_after_timeout() {
        let mut table = NeighbourTable::new(1, 40, 2);
        table.on_hello(2, 0, 10).unwrap();
        assert!(table.age(12).is_empty());
        assert_eq!(table.age(13), vec![2]);
        assert!(!table.is_neighbour(2));
    }

    #[test]
    fn test_link_usable_gate() {
        let mut table = NeighbourTable::new(1, 40, 2);
        table.on_hello(2, 0, 0).unwrap();
        assert!(!table.is_link_usable(2, -90.0, 10.0));
        table.on_metrics(2, -70.0, 20.0, None);
        assert!(table.is_link_usable(2, -90.0, 10.0));
        table.on_metrics(2, -95.0, 20.0, None);
        assert!(!table.is_link_usable(2, -90.0, 10.0));
    }

    #[test]
    fn test_mpr_selection_covers_two_hop() {
        let mut table = NeighbourTable::new(1, 40, 2);
        for id in [2, 3, 4] {
            table.on_hello(id, 0, 0).unwrap();
            table.get_mut(id).unwrap().link_code = LinkCode::Sym;
        }
        table.get_mut(2).unwrap().two_hop = [1, 5, 6].into_iter().collect();
        table.get_mut(3).unwrap().two_hop = [1, 6].into_iter().collect();
        table.get_mut(4).unwrap().two_hop = [1, 7].into_iter().collect();

        let mprs = table.select_mprs();
        assert!(mprs.contains(2));
        assert!(mprs.contains(4));
        assert!(!mprs.contains(3));
        assert!(table.get(2).unwrap().is_mpr);
        assert!(!table.get(3).unwrap().is_mpr);
    }

    #[test]
    fn test_route_cache_freshness_and_invalidation() {
        let start = Instant::now();
        let mut cache = RouteCache::new(Duration::from_millis(1000));
        cache.insert(9, 2, 2, start);
        cache.insert(8, 3, 2, start);
        assert_eq!(cache.fresh(9, start + Duration::from_millis(999)), Some((2, 2)));
        assert_eq!(cache.fresh(9, start + Duration::from_millis(1001)), None);
        assert_eq!(cache.last_known(9), Some((2, 2)));

        assert_eq!(cache.invalidate_via(2), 1);
        assert_eq!(cache.last_known(9), None);
        assert_eq!(cache.last_known(8), Some((3, 2)));
    }
}
