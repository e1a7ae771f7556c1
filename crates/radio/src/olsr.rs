//! Stand-in OLSR daemon answering route requests from HELLO and TC pushes
//!
//! Knows one-hop neighbours and their advertised symmetric sets, plus the
//! MPR selector sets from TCs. No TC forwarding and no shortest-path run:
//! routes are looked up at most three hops deep.

use std::collections::BTreeMap;
use log::{debug, info, trace};

use tacmesh_core::{NodeId, NodeSet};

use crate::fabric::{FabricReceiver, FabricSender, Message, OlsrToRrc, RouteStatus, RrcToOlsr};

#[derive(Debug, Default)]
pub struct OlsrState {
    own_id: NodeId,
    neighbours: BTreeMap<NodeId, NodeSet>,
    topology: BTreeMap<NodeId, NodeSet>,
}

impl OlsrState {
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            ..Default::default()
        }
    }

    pub fn on_hello(&mut self, source: NodeId, neighbours: NodeSet) {
        self.neighbours.insert(source, neighbours);
    }

    pub fn on_tc(&mut self, originator: NodeId, mpr_selectors: NodeSet) {
        if originator != self.own_id {
            self.topology.insert(originator, mpr_selectors);
        }
    }

    pub fn on_link_lost(&mut self, node: NodeId) {
        if self.neighbours.remove(&node).is_some() {
            debug!("OLSR {} dropped neighbour {}", self.own_id, node);
        }
    }

    /// Next hop toward `node` if it is at most two hops away.
    fn via_near(&self, node: NodeId) -> Option<(NodeId, u8)> {
        if self.neighbours.contains_key(&node) {
            return Some((node, 1));
        }
        self.neighbours
            .iter()
            .find(|(n, sym)| **n != node && sym.contains(node))
            .map(|(n, _)| (*n, 2))
    }

    pub fn route(&self, dest: NodeId) -> Option<(NodeId, u8)> {
        if dest == self.own_id {
            return None;
        }
        if let Some(route) = self.via_near(dest) {
            return Some(route);
        }
        // nodes adjacent to dest: its selectors, and originators that list it
        let selectors = self.topology.get(&dest).copied().unwrap_or_default();
        let listing = self
            .topology
            .iter()
            .filter(|(_, sel)| sel.contains(dest))
            .map(|(origin, _)| *origin);
        selectors
            .iter()
            .chain(listing)
            .filter(|hop| *hop != self.own_id)
            .filter_map(|hop| self.via_near(hop).map(|(next, n)| (next, n + 1)))
            .min_by_key(|(next, hops)| (*hops, *next))
    }

    pub async fn run(mut self, mut from_rrc: FabricReceiver<Message<RrcToOlsr>>, to_rrc: FabricSender<Message<OlsrToRrc>>) {
        info!("OLSR stub for node {} started", self.own_id);
        while let Some(msg) = from_rrc.recv().await {
            match msg.body {
                RrcToOlsr::RouteReq { dest, src } => {
                    let body = match self.route(dest) {
                        Some((next_hop, hop_count)) => OlsrToRrc::RouteResp {
                            dest,
                            next_hop,
                            hop_count,
                            status: RouteStatus::Ok,
                        },
                        None => OlsrToRrc::RouteResp {
                            dest,
                            next_hop: 0,
                            hop_count: 0,
                            status: RouteStatus::NoRoute,
                        },
                    };
                    trace!("OLSR {} route {} -> {}: {:?}", self.own_id, src, dest, body);
                    if let Err(e) = to_rrc.try_send(Message::reply_to(&msg.header, body)) {
                        debug!("OLSR {} route response dropped: {}", self.own_id, e);
                    }
                }
                RrcToOlsr::TriggerDiscovery { dest } => {
                    debug!("OLSR {} asked to discover {}", self.own_id, dest);
                }
                RrcToOlsr::HelloNc { src, neighbours, .. } => self.on_hello(src, neighbours),
                RrcToOlsr::TcRx { originator, mpr_selectors } => self.on_tc(originator, mpr_selectors),
                RrcToOlsr::LinkLost { node } => self.on_link_lost(node),
            }
        }
        debug!("OLSR stub for node {} stopped", self.own_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::channel;

    fn set(ids: &[NodeId]) -> NodeSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_one_and_two_hop_routes() {
        let mut olsr = OlsrState::new(1);
        olsr.on_hello(2, set(&[1, 3]));
        assert_eq!(olsr.route(2), Some((2, 1)));
        assert_eq!(olsr.route(3), Some((2, 2)));
        assert_eq!(olsr.route(9), None);
        assert_eq!(olsr.route(1), None);
    }

    #[test]
    fn test_three_hop_route_via_tc() {
        let mut olsr = OlsrState::new(1);
        olsr.on_hello(2, set(&[1, 3]));
        // 4 chose 3 as MPR
        olsr.on_tc(3, set(&[4]));
        assert_eq!(olsr.route(4), Some((2, 3)));
    }

    #[test]
    fn test_lost_link_removes_routes() {
        let mut olsr = OlsrState::new(1);
        olsr.on_hello(2, set(&[1, 3]));
        olsr.on_link_lost(2);
        assert_eq!(olsr.route(2), None);
        assert_eq!(olsr.route(3), None);
    }

    #[tokio::test]
    async fn test_route_request_answered_with_same_id() {
        let (to_olsr, from_rrc) = channel("rrc->olsr", 4);
        let (to_rrc, mut from_olsr) = channel("olsr->rrc", 4);
        let mut state = OlsrState::new(1);
        state.on_hello(2, set(&[1]));
        tokio::spawn(state.run(from_rrc, to_rrc));

        let req = Message::new(RrcToOlsr::RouteReq { dest: 5, src: 1 });
        let id = req.header.request_id;
        to_olsr.try_send(req).unwrap();
        let resp = from_olsr.recv().await.unwrap();
        assert_eq!(resp.header.request_id, id);
        assert!(matches!(resp.body, OlsrToRrc::RouteResp { status: RouteStatus::NoRoute, .. }));
    }
}
