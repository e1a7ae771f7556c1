//! Network-control cycle: HELLO and TC generation, neighbour sensing and the
//! OLSR pushes that follow from them
//!
//! [`NcCycle`] holds the per-supercycle bookkeeping and works on a borrowed
//! [`NeighbourTable`]. The task in [`run`] feeds it frames relayed up by the
//! MAC and the MAC's supercycle ticks, refreshes link metrics from the PHY and
//! submits the resulting frames for the node's NC slot.

use std::sync::Arc;
use futures_util::future::join_all;
use log::{debug, info, trace, warn};

use tacmesh_core::{
    DataType, Frame, FrameError, HelloMessage, HelloNeighbour, LinkCode, NodeId, NodeSet, Priority, SeqNo,
    TcMessage, BROADCAST,
};

use crate::fabric::{FabricReceiver, Message, PhyToRrc, RrcToOlsr, RrcToPhy, RrcToTdma, TdmaToRrc};
use crate::neighbour::NeighbourTable;
use crate::rrc::RrcShared;
use crate::{RadioConfig, RadioError};

#[derive(Debug, Clone)]
pub enum NcEvent {
    /// HELLO or TC heard on air.
    Frame(Frame),
    Supercycle { number: u64, synchronised: bool },
}

/// What one supercycle tick produced.
#[derive(Debug, Default)]
pub struct NcOutput {
    pub expired: Vec<NodeId>,
    pub hello: Option<HelloMessage>,
    pub tc: Option<TcMessage>,
}

#[derive(Debug)]
pub struct NcCycle {
    own_id: NodeId,
    willingness: u8,
    payload_max: usize,
    hello_interval: u64,
    tc_interval: u64,
    diameter: u8,
    own_nc_slot: u8,
    /// Neighbours timed out since the last HELLO.
    lost: NodeSet,
    last_selectors: NodeSet,
    last_tc: Option<u64>,
    ansn: u16,
    selectors_dirty: bool,
}

impl NcCycle {
    pub fn new(config: &RadioConfig) -> Self {
        Self {
            own_id: config.node_id,
            willingness: config.willingness,
            payload_max: config.payload_max,
            hello_interval: config.hello_interval.max(1),
            tc_interval: config.tc_interval.max(1),
            diameter: config.network_diameter,
            own_nc_slot: config.own_nc_slot(),
            lost: NodeSet::new(),
            last_selectors: NodeSet::new(),
            last_tc: None,
            ansn: 0,
            selectors_dirty: false,
        }
    }

    pub fn ansn(&self) -> u16 {
        self.ansn
    }

    /// Applies a HELLO from `source`. Returns `true` when our MPR selector set changed.
    pub fn on_hello(
        &mut self,
        table: &mut NeighbourTable,
        source: NodeId,
        hello: &HelloMessage,
        supercycle: u64,
    ) -> Result<bool, RadioError> {
        if table.on_hello(source, hello.assigned_nc_slot, supercycle)? {
            info!("Node {} discovered neighbour {}", self.own_id, source);
        }
        self.lost.remove(source);

        let mention = hello.mentions(self.own_id).copied();
        if let Some(entry) = table.get_mut(source) {
            entry.link_code = match mention {
                Some(n) if n.code != LinkCode::Lost => LinkCode::Sym,
                _ => LinkCode::Asym,
            };
            entry.willingness = hello.willingness;
            entry.is_mpr_selector = mention.is_some_and(|n| n.is_mpr && n.code != LinkCode::Lost);
            entry.two_hop = hello.symmetric_set();
        }
        Ok(self.refresh_selectors(table))
    }

    fn refresh_selectors(&mut self, table: &NeighbourTable) -> bool {
        let selectors = table.mpr_selectors();
        if selectors == self.last_selectors {
            return false;
        }
        debug!("Node {} MPR selectors now {:?}", self.own_id, selectors);
        self.last_selectors = selectors;
        self.selectors_dirty = true;
        true
    }

    /// Ages the table, reselects MPRs and decides which control messages are due.
    pub fn on_supercycle(&mut self, table: &mut NeighbourTable, supercycle: u64) -> NcOutput {
        let expired = table.age(supercycle);
        for id in &expired {
            self.lost.insert(*id);
        }
        self.refresh_selectors(table);
        table.select_mprs();

        let hello = (supercycle % self.hello_interval == 0).then(|| self.build_hello(table));
        let periodic = self
            .last_tc
            .map_or(true, |last| supercycle.saturating_sub(last) >= self.tc_interval);
        let tc = if self.selectors_dirty || (periodic && !self.last_selectors.is_empty()) {
            Some(self.build_tc(supercycle))
        } else {
            None
        };
        NcOutput { expired, hello, tc }
    }

    /// Symmetric links first, then asymmetric, then links lost since the last HELLO.
    pub fn build_hello(&mut self, table: &NeighbourTable) -> HelloMessage {
        let mut neighbours: Vec<HelloNeighbour> = table
            .iter()
            .filter(|e| e.is_symmetric())
            .map(|e| HelloNeighbour {
                id: e.id,
                code: LinkCode::Sym,
                is_mpr: e.is_mpr,
            })
            .collect();
        neighbours.extend(table.iter().filter(|e| !e.is_symmetric()).map(|e| HelloNeighbour {
            id: e.id,
            code: LinkCode::Asym,
            is_mpr: false,
        }));
        neighbours.extend(
            self.lost
                .iter()
                .filter(|id| table.get(*id).is_none())
                .map(|id| HelloNeighbour {
                    id,
                    code: LinkCode::Lost,
                    is_mpr: false,
                }),
        );
        self.lost = NodeSet::new();
        HelloMessage {
            willingness: self.willingness,
            assigned_nc_slot: self.own_nc_slot,
            neighbours,
        }
    }

    fn build_tc(&mut self, supercycle: u64) -> TcMessage {
        if self.selectors_dirty {
            self.ansn = self.ansn.wrapping_add(1);
            self.selectors_dirty = false;
        }
        self.last_tc = Some(supercycle);
        TcMessage {
            originator: self.own_id,
            ansn: self.ansn,
            mpr_selectors: self.last_selectors.iter().collect(),
        }
    }

    pub fn hello_frame(&self, hello: &HelloMessage, seq: SeqNo) -> Result<Frame, FrameError> {
        let payload = hello.encode_within(self.payload_max)?;
        Ok(self.control_frame(DataType::Hello, 1, seq, payload))
    }

    /// TC frame, trimming selectors from the tail until it fits.
    pub fn tc_frame(&self, tc: &TcMessage, seq: SeqNo) -> Result<Frame, FrameError> {
        let mut tc = tc.clone();
        let payload = loop {
            let payload = tc.encode()?;
            if payload.len() <= self.payload_max {
                break payload;
            }
            if tc.mpr_selectors.pop().is_none() {
                return Err(FrameError::PayloadTooLarge {
                    len: payload.len(),
                    max: self.payload_max,
                });
            }
        };
        Ok(self.control_frame(DataType::Tc, self.diameter, seq, payload))
    }

    fn control_frame(&self, data_type: DataType, ttl: u8, seq: SeqNo, payload: bytes::Bytes) -> Frame {
        Frame {
            source: self.own_id,
            destination: BROADCAST,
            next_hop: BROADCAST,
            ttl,
            priority: Priority::VOICE,
            data_type,
            seq,
            timestamp: 0,
            payload,
        }
    }
}

pub async fn run(shared: Arc<RrcShared>, mut cycle: NcCycle, mut events: FabricReceiver<NcEvent>) {
    info!("NC task for node {} started", shared.own_id());
    let mut supercycle = 0;
    while let Some(event) = events.recv().await {
        match event {
            NcEvent::Frame(frame) => on_control_frame(&shared, &mut cycle, frame, supercycle).await,
            NcEvent::Supercycle { number, synchronised } => {
                supercycle = number;
                on_supercycle(&shared, &mut cycle, number, synchronised).await;
            }
        }
    }
    debug!("NC task for node {} stopped", shared.own_id());
}

async fn on_control_frame(shared: &RrcShared, cycle: &mut NcCycle, frame: Frame, supercycle: u64) {
    match frame.data_type {
        DataType::Hello => {
            let hello = match HelloMessage::decode(&frame.payload) {
                Ok(hello) => hello,
                Err(e) => {
                    debug!("Node {} bad HELLO from {}: {}", shared.own_id(), frame.source, e);
                    return;
                }
            };
            let applied = {
                let mut table = shared.table.write().await;
                cycle.on_hello(&mut table, frame.source, &hello, supercycle)
            };
            if let Err(e) = applied {
                warn!("Node {} HELLO from {} not recorded: {}", shared.own_id(), frame.source, e);
                return;
            }
            let push = RrcToOlsr::HelloNc {
                src: frame.source,
                assigned_nc_slot: hello.assigned_nc_slot,
                neighbours: hello.symmetric_set(),
            };
            if let Err(e) = shared.senders.to_olsr.try_send(Message::new(push)) {
                debug!("Node {} HELLO push to OLSR dropped: {}", shared.own_id(), e);
            }
        }
        DataType::Tc => {
            let tc = match TcMessage::decode(&frame.payload) {
                Ok(tc) => tc,
                Err(e) => {
                    debug!("Node {} bad TC from {}: {}", shared.own_id(), frame.source, e);
                    return;
                }
            };
            if tc.originator == shared.own_id() {
                return;
            }
            trace!("Node {} TC from {} ansn {}", shared.own_id(), tc.originator, tc.ansn);
            let push = RrcToOlsr::TcRx {
                originator: tc.originator,
                mpr_selectors: tc.mpr_selectors.iter().copied().collect(),
            };
            if let Err(e) = shared.senders.to_olsr.try_send(Message::new(push)) {
                debug!("Node {} TC push to OLSR dropped: {}", shared.own_id(), e);
            }
        }
        other => trace!("Node {} NC task ignoring {:?}", shared.own_id(), other),
    }
}

async fn on_supercycle(shared: &RrcShared, cycle: &mut NcCycle, number: u64, synchronised: bool) {
    let output = {
        let mut table = shared.table.write().await;
        cycle.on_supercycle(&mut table, number)
    };

    for node in &output.expired {
        let dropped = shared.routes.lock().await.invalidate_via(*node);
        debug!("Node {} lost neighbour {} ({} routes dropped)", shared.own_id(), node, dropped);
        let push = Message::new(RrcToOlsr::LinkLost { node: *node });
        if let Err(e) = shared.senders.to_olsr.try_send(push) {
            debug!("Node {} link-lost push to OLSR dropped: {}", shared.own_id(), e);
        }
    }

    refresh_metrics(shared).await;

    if !synchronised {
        trace!("Node {} not synchronised, holding NC traffic", shared.own_id());
        return;
    }
    if let Some(hello) = &output.hello {
        match cycle.hello_frame(hello, shared.seq.next()) {
            Ok(frame) => submit(shared, frame).await,
            Err(e) => warn!("Node {} could not build HELLO: {}", shared.own_id(), e),
        }
    }
    if let Some(tc) = &output.tc {
        match cycle.tc_frame(tc, shared.seq.next()) {
            Ok(frame) => submit(shared, frame).await,
            Err(e) => warn!("Node {} could not build TC: {}", shared.own_id(), e),
        }
    }
}

/// Pulls fresh RSSI, SNR and PER for every neighbour, all requests in
/// flight at once. A neighbour whose request times out keeps its previous values.
pub async fn refresh_metrics(shared: &RrcShared) {
    let nodes: Vec<NodeId> = shared.table.read().await.iter().map(|e| e.id).collect();
    let requests = nodes.into_iter().map(|node| async move {
        let request = Message::new(RrcToPhy::MetricsReq { node });
        let answer = shared
            .phy
            .request(&shared.senders.to_phy, request, shared.config.route_request_timeout)
            .await;
        (node, answer)
    });
    for (node, answer) in join_all(requests).await {
        match answer {
            Ok(PhyToRrc::MetricsResp { rssi, snr, per, .. }) => {
                shared.table.write().await.on_metrics(node, rssi, snr, Some(per));
            }
            Ok(other) => debug!("Node {} unexpected metrics answer {:?}", shared.own_id(), other),
            Err(e) => trace!("Node {} metrics for {} stale: {}", shared.own_id(), node, e),
        }
    }
}

async fn submit(shared: &RrcShared, frame: Frame) {
    let kind = frame.data_type;
    let payload_idx = match shared.frame_pool.lock().await.store(frame) {
        Ok(idx) => idx,
        Err(e) => {
            warn!("Node {} no pool room for {:?}: {}", shared.own_id(), kind, e);
            return;
        }
    };
    let request = Message::new(RrcToTdma::NcSlotReq { payload_idx });
    match shared
        .tdma
        .request(&shared.senders.to_tdma, request, shared.config.request_timeout)
        .await
    {
        Ok(TdmaToRrc::NcSlotResp { success: true, assigned_slot }) => {
            trace!("Node {} {:?} queued for NC slot {}", shared.own_id(), kind, assigned_slot);
        }
        Ok(_) => debug!("Node {} MAC refused {:?}", shared.own_id(), kind),
        Err(RadioError::Timeout) => debug!("Node {} NC submit of {:?} timed out", shared.own_id(), kind),
        Err(e) => {
            shared.frame_pool.lock().await.release(payload_idx);
            debug!("Node {} NC submit of {:?} failed: {}", shared.own_id(), kind, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(id: NodeId) -> NcCycle {
        NcCycle::new(&RadioConfig::for_node(id))
    }

    fn hello(neighbours: &[(NodeId, LinkCode, bool)]) -> HelloMessage {
        HelloMessage {
            willingness: 3,
            assigned_nc_slot: 2,
            neighbours: neighbours
                .iter()
                .map(|&(id, code, is_mpr)| HelloNeighbour { id, code, is_mpr })
                .collect(),
        }
    }

    #[test]
    fn test_link_becomes_symmetric_once_mentioned() {
        let mut nc = cycle(1);
        let mut table = NeighbourTable::new(1, 40, 2);

        nc.on_hello(&mut table, 2, &hello(&[]), 0).unwrap();
        assert_eq!(table.get(2).unwrap().link_code, LinkCode::Asym);
        assert_eq!(table.get(2).unwrap().nc_slot, 2);

        nc.on_hello(&mut table, 2, &hello(&[(1, LinkCode::Asym, false), (3, LinkCode::Sym, false)]), 1)
            .unwrap();
        let entry = table.get(2).unwrap();
        assert_eq!(entry.link_code, LinkCode::Sym);
        assert!(entry.two_hop.contains(3));
        assert!(!entry.two_hop.contains(1));
    }

    #[test]
    fn test_selector_change_triggers_tc() {
        let mut nc = cycle(1);
        let mut table = NeighbourTable::new(1, 40, 2);
        let changed = nc
            .on_hello(&mut table, 2, &hello(&[(1, LinkCode::Sym, true)]), 0)
            .unwrap();
        assert!(changed);

        let out = nc.on_supercycle(&mut table, 1);
        let tc = out.tc.unwrap();
        assert_eq!(tc.mpr_selectors, vec![2]);
        assert_eq!(tc.ansn, 1);

        // unchanged selectors wait for the periodic interval
        assert!(nc.on_supercycle(&mut table, 2).tc.is_none());
        nc.on_hello(&mut table, 2, &hello(&[(1, LinkCode::Sym, true)]), 5).unwrap();
        let periodic = nc.on_supercycle(&mut table, 6).tc.unwrap();
        assert_eq!(periodic.ansn, 1);
    }

    #[test]
    fn test_expired_neighbour_advertised_lost_once() {
        let mut nc = cycle(1);
        let mut table = NeighbourTable::new(1, 40, 2);
        nc.on_hello(&mut table, 2, &hello(&[(1, LinkCode::Sym, false)]), 0).unwrap();
        nc.on_hello(&mut table, 3, &hello(&[]), 3).unwrap();

        let out = nc.on_supercycle(&mut table, 3);
        assert_eq!(out.expired, vec![2]);
        let advertised = out.hello.unwrap();
        let codes: Vec<_> = advertised.neighbours.iter().map(|n| (n.id, n.code)).collect();
        assert_eq!(codes, vec![(3, LinkCode::Asym), (2, LinkCode::Lost)]);

        let next = nc.on_supercycle(&mut table, 4).hello.unwrap();
        assert!(next.mentions(2).is_none());
    }

    #[test]
    fn test_hello_orders_symmetric_first() {
        let mut nc = cycle(1);
        let mut table = NeighbourTable::new(1, 40, 2);
        nc.on_hello(&mut table, 5, &hello(&[]), 0).unwrap();
        nc.on_hello(&mut table, 7, &hello(&[(1, LinkCode::Sym, false)]), 0).unwrap();
        let hello = nc.build_hello(&table);
        assert_eq!(hello.neighbours[0].id, 7);
        assert_eq!(hello.neighbours[0].code, LinkCode::Sym);
        assert_eq!(hello.neighbours[1].id, 5);
        assert_eq!(hello.assigned_nc_slot, 1);
    }

    #[test]
    fn test_control_frames_fit_constrained_payload() {
        let nc = NcCycle::new(&RadioConfig::constrained(1));
        let big = HelloMessage {
            willingness: 3,
            assigned_nc_slot: 1,
            neighbours: (2..30)
                .map(|id| HelloNeighbour {
                    id,
                    code: LinkCode::Sym,
                    is_mpr: false,
                })
                .collect(),
        };
        let frame = nc.hello_frame(&big, 9).unwrap();
        assert!(frame.payload_len() <= 16);
        assert_eq!(frame.ttl, 1);
        assert_eq!(frame.destination, BROADCAST);

        let tc = TcMessage {
            originator: 1,
            ansn: 4,
            mpr_selectors: (2..30).collect(),
        };
        let frame = nc.tc_frame(&tc, 10).unwrap();
        assert!(frame.payload_len() <= 16);
        assert_eq!(frame.ttl, 8);
        assert_eq!(frame.data_type, DataType::Tc);
    }
}
