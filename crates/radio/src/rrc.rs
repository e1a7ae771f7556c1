//! RRC actor: admission of APP traffic, relay of received frames and
//! delivery-status bookkeeping
//!
//! The actor loop only routes messages. Responses complete the matching
//! [`Correlator`]; APP traffic goes to the ordered admission task and relays
//! that need a route run in their own tasks, so a slow OLSR answer never
//! stalls the loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use log::{debug, info, trace, warn};

use tacmesh_core::{ApplicationMessage, DeliveryStatus, DropReason, Frame, FrameError, NodeId, SeqNo, BROADCAST};

use crate::admission::{self, Submission};
use crate::fabric::{
    channel, AppToRrc, Correlator, FabricReceiver, FabricSender, Header, Message, OlsrToRrc, PhyToRrc, RrcToApp, RrcToOlsr,
    RrcToPhy, RrcToTdma, TdmaToRrc,
};
use crate::nc::NcEvent;
use crate::neighbour::{NeighbourTable, RouteCache};
use crate::pool::SharedPool;
use crate::tdma::SeqCounter;
use crate::{RadioConfig, RadioError};

pub const RELAY_WINDOW: usize = 256;

/// Recently relayed `(source, seq)` pairs.
#[derive(Debug)]
pub struct RelayWindow {
    order: VecDeque<(NodeId, SeqNo)>,
    seen: HashSet<(NodeId, SeqNo)>,
    capacity: usize,
}

impl RelayWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` when the pair was already seen.
    pub fn insert(&mut self, source: NodeId, seq: SeqNo) -> bool {
        if !self.seen.insert((source, seq)) {
            return false;
        }
        self.order.push_back((source, seq));
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct RrcStats {
    admitted: AtomicU64,
    delivered_up: AtomicU64,
    relayed: AtomicU64,
    duplicates: AtomicU64,
    status_overflow: AtomicU64,
    phy_tx: AtomicU64,
    phy_rx: AtomicU64,
    drops: std::sync::Mutex<HashMap<DropReason, u64>>,
}

#[derive(Debug, Clone, Default)]
pub struct RrcSnapshot {
    pub admitted: u64,
    pub delivered_up: u64,
    pub relayed: u64,
    pub duplicates: u64,
    pub status_overflow: u64,
    pub phy_tx: u64,
    pub phy_rx: u64,
    pub drops: HashMap<DropReason, u64>,
}

impl RrcStats {
    pub fn count_drop(&self, reason: DropReason) {
        if let Ok(mut drops) = self.drops.lock() {
            *drops.entry(reason).or_default() += 1;
        }
    }

    pub fn snapshot(&self) -> RrcSnapshot {
        RrcSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            delivered_up: self.delivered_up.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            status_overflow: self.status_overflow.load(Ordering::Relaxed),
            phy_tx: self.phy_tx.load(Ordering::Relaxed),
            phy_rx: self.phy_rx.load(Ordering::Relaxed),
            drops: self.drops.lock().map(|d| d.clone()).unwrap_or_default(),
        }
    }
}

#[derive(Debug)]
struct PendingTx {
    header: Header,
    queued_reported: bool,
    early: Option<DeliveryStatus>,
}

pub struct RrcSenders {
    pub to_app: FabricSender<Message<RrcToApp>>,
    pub to_olsr: FabricSender<Message<RrcToOlsr>>,
    pub to_tdma: FabricSender<Message<RrcToTdma>>,
    pub to_phy: FabricSender<Message<RrcToPhy>>,
}

/// State shared by the RRC loop, admission tasks and the NC task.
pub struct RrcShared {
    pub config: RadioConfig,
    pub senders: RrcSenders,
    pub olsr: Correlator<OlsrToRrc>,
    pub tdma: Correlator<TdmaToRrc>,
    pub phy: Correlator<PhyToRrc>,
    pub table: Arc<RwLock<NeighbourTable>>,
    pub routes: Mutex<RouteCache>,
    pub frame_pool: SharedPool<Frame>,
    pub msg_pool: SharedPool<ApplicationMessage>,
    pub seq: Arc<SeqCounter>,
    pub stats: RrcStats,
    pending: Mutex<HashMap<SeqNo, PendingTx>>,
    relay_window: Mutex<RelayWindow>,
}

impl RrcShared {
    pub fn new(
        config: RadioConfig,
        senders: RrcSenders,
        table: Arc<RwLock<NeighbourTable>>,
        frame_pool: SharedPool<Frame>,
        msg_pool: SharedPool<ApplicationMessage>,
        seq: Arc<SeqCounter>,
    ) -> Self {
        let routes = RouteCache::new(config.route_cache_ttl);
        Self {
            config,
            senders,
            olsr: Correlator::new("olsr"),
            tdma: Correlator::new("tdma"),
            phy: Correlator::new("phy"),
            table,
            routes: Mutex::new(routes),
            frame_pool,
            msg_pool,
            seq,
            stats: RrcStats::default(),
            pending: Mutex::new(HashMap::new()),
            relay_window: Mutex::new(RelayWindow::new(RELAY_WINDOW)),
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.config.node_id
    }

    fn send_status(&self, header: &Header, seq: Option<SeqNo>, status: DeliveryStatus) {
        let msg = Message::reply_to(header, RrcToApp::DeliveryStatus { seq, status });
        if self.senders.to_app.try_send(msg).is_err() {
            self.stats.status_overflow.fetch_add(1, Ordering::Relaxed);
            warn!("Node {} could not report {} for seq {:?}", self.own_id(), status, seq);
        }
    }

    /// Terminal drop of an APP message.
    pub fn report_drop(&self, header: &Header, seq: Option<SeqNo>, reason: DropReason) {
        debug!("Node {} dropping request {}: {}", self.own_id(), header.request_id, reason);
        self.stats.count_drop(reason);
        self.send_status(header, seq, DeliveryStatus::Dropped(reason));
    }

    /// Registers `seq` before it is handed to TDMA so TX reports can find it.
    pub async fn track(&self, seq: SeqNo, header: Header) {
        self.pending.lock().await.insert(
            seq,
            PendingTx {
                header,
                queued_reported: false,
                early: None,
            },
        );
    }

    pub async fn untrack(&self, seq: SeqNo) {
        self.pending.lock().await.remove(&seq);
    }

    /// Sends `queued`, then any TX report that overtook it.
    pub async fn confirm_queued(&self, seq: SeqNo) {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get_mut(&seq) else {
            return;
        };
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        self.send_status(&entry.header, Some(seq), DeliveryStatus::Queued);
        match entry.early.take() {
            Some(status) => {
                let header = entry.header;
                pending.remove(&seq);
                self.finish(&header, seq, status);
            }
            None => entry.queued_reported = true,
        }
    }

    async fn on_tx_report(&self, seq: SeqNo, status: DeliveryStatus) {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get_mut(&seq) else {
            trace!("Node {} TX report for untracked seq {}", self.own_id(), seq);
            return;
        };
        if entry.queued_reported {
            let header = entry.header;
            pending.remove(&seq);
            self.finish(&header, seq, status);
        } else {
            entry.early = Some(status);
        }
    }

    fn finish(&self, header: &Header, seq: SeqNo, status: DeliveryStatus) {
        if let DeliveryStatus::Dropped(reason) = status {
            self.stats.count_drop(reason);
        }
        self.send_status(header, Some(seq), status);
    }

    /// Hands a received frame up to the application.
    async fn deliver(&self, frame: Frame) {
        let source = frame.source;
        let data_type = frame.data_type;
        let Ok(frame_idx) = self.frame_pool.lock().await.store(frame) else {
            self.stats.count_drop(DropReason::Backpressure);
            return;
        };
        let msg = Message::new(RrcToApp::Rx {
            source,
            data_type,
            frame_idx,
        });
        if self.senders.to_app.try_send(msg).is_err() {
            self.frame_pool.lock().await.release(frame_idx);
            self.stats.count_drop(DropReason::Backpressure);
            return;
        }
        self.stats.delivered_up.fetch_add(1, Ordering::Relaxed);
    }

    /// Delivers or forwards a non-NC frame from the MAC.
    pub async fn relay(&self, frame: Frame) {
        if !self.relay_window.lock().await.insert(frame.source, frame.seq) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            self.stats.count_drop(DropReason::Duplicate);
            return;
        }
        if frame.destination == self.own_id() || frame.destination == BROADCAST {
            self.deliver(frame).await;
            return;
        }
        if let Err(e) = self.forward(frame).await {
            debug!("Node {} relay dropped: {}", self.own_id(), e);
            self.stats.count_drop(e.drop_reason());
        }
    }

    async fn forward(&self, frame: Frame) -> Result<(), RadioError> {
        let mut forwarded = frame
            .forwarded(frame.next_hop)
            .ok_or(RadioError::InvalidFrame(FrameError::TtlExpired))?;
        let next_hop = admission::resolve_next_hop(self, frame.destination).await?;
        forwarded.next_hop = next_hop;
        let seq = forwarded.seq;
        let frame_idx = self.frame_pool.lock().await.store(forwarded)?;
        let request = Message::new(RrcToTdma::EnqueueReq { frame_idx });
        match self.tdma.request(&self.senders.to_tdma, request, self.config.request_timeout).await {
            Ok(TdmaToRrc::EnqueueResp { outcome: Ok(_) }) => {
                trace!("Node {} relaying {}:{} via {}", self.own_id(), frame.source, seq, next_hop);
                self.stats.relayed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(TdmaToRrc::EnqueueResp { outcome: Err(reason) }) => {
                self.stats.count_drop(reason);
                Ok(())
            }
            Ok(_) => Err(RadioError::ChannelClosed("tdma")),
            Err(e) => {
                if !matches!(e, RadioError::Timeout) {
                    self.frame_pool.lock().await.release(frame_idx);
                }
                Err(e)
            }
        }
    }
}

pub struct RrcChannels {
    pub from_app: FabricReceiver<Message<AppToRrc>>,
    pub from_olsr: FabricReceiver<Message<OlsrToRrc>>,
    pub from_tdma: FabricReceiver<Message<TdmaToRrc>>,
    pub from_phy: FabricReceiver<Message<PhyToRrc>>,
}

pub async fn run(shared: Arc<RrcShared>, mut channels: RrcChannels, to_nc: FabricSender<NcEvent>) {
    info!("RRC for node {} started", shared.own_id());
    let (to_admission, admission_rx) = channel("rrc->admission", shared.config.channel_capacity);
    tokio::spawn(admission::run(shared.clone(), admission_rx));
    loop {
        tokio::select! {
            msg = channels.from_app.recv() => match msg {
                Some(msg) => on_app(&shared, msg, &to_admission).await,
                None => break,
            },
            msg = channels.from_olsr.recv() => match msg {
                Some(msg) => {
                    shared.olsr.complete(msg.header.request_id, msg.body).await;
                }
                None => break,
            },
            msg = channels.from_tdma.recv() => match msg {
                Some(msg) => on_tdma(&shared, msg, &to_nc).await,
                None => break,
            },
            msg = channels.from_phy.recv() => match msg {
                Some(msg) => match msg.body {
                    PhyToRrc::PktCount { tx, rx } => {
                        shared.stats.phy_tx.store(tx, Ordering::Relaxed);
                        shared.stats.phy_rx.store(rx, Ordering::Relaxed);
                    }
                    body => {
                        shared.phy.complete(msg.header.request_id, body).await;
                    }
                },
                None => break,
            },
        }
    }
    debug!("RRC for node {} stopped", shared.own_id());
}

async fn on_app(shared: &Arc<RrcShared>, msg: Message<AppToRrc>, to_admission: &FabricSender<Submission>) {
    match msg.body {
        AppToRrc::Traffic { msg_idx } => {
            let submission = Submission {
                header: msg.header,
                msg_idx,
            };
            if let Err(e) = to_admission.try_send(submission) {
                shared.msg_pool.lock().await.release(msg_idx);
                shared.report_drop(&msg.header, None, e.drop_reason());
            }
        }
        AppToRrc::Ptt(event) => {
            if let Err(e) = shared.senders.to_tdma.try_send(Message::new(RrcToTdma::Voice(event))) {
                warn!("Node {} PTT {:?} not delivered: {}", shared.own_id(), event, e);
            }
        }
    }
}

async fn on_tdma(shared: &Arc<RrcShared>, msg: Message<TdmaToRrc>, to_nc: &FabricSender<NcEvent>) {
    match msg.body {
        TdmaToRrc::RelayFrame { frame_idx } => {
            let Some(frame) = shared.frame_pool.lock().await.take(frame_idx) else {
                return;
            };
            if frame.data_type.is_network_control() {
                if to_nc.try_send(NcEvent::Frame(frame)).is_err() {
                    debug!("Node {} NC task busy, control frame dropped", shared.own_id());
                }
                return;
            }
            let shared = shared.clone();
            tokio::spawn(async move { shared.relay(frame).await });
        }
        TdmaToRrc::TxDone { seq } => shared.on_tx_report(seq, DeliveryStatus::Sent).await,
        TdmaToRrc::TxFail { seq, reason } => shared.on_tx_report(seq, DeliveryStatus::Dropped(reason)).await,
        TdmaToRrc::Supercycle { number, synchronised } => {
            if to_nc.try_send(NcEvent::Supercycle { number, synchronised }).is_err() {
                debug!("Node {} NC task busy, supercycle {} skipped", shared.own_id(), number);
            }
        }
        body => {
            shared.tdma.complete(msg.header.request_id, body).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_window_rejects_repeats() {
        let mut window = RelayWindow::new(3);
        assert!(window.insert(1, 10));
        assert!(!window.insert(1, 10));
        assert!(window.insert(2, 10));
        assert!(window.insert(1, 11));
        assert!(window.insert(1, 12));
        // (1, 10) aged out of the window
        assert!(window.insert(1, 10));
    }

    #[test]
    fn test_drop_counters() {
        let stats = RrcStats::default();
        stats.count_drop(DropReason::NoRoute);
        stats.count_drop(DropReason::NoRoute);
        stats.count_drop(DropReason::LinkDown);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.drops.get(&DropReason::NoRoute), Some(&2));
        assert_eq!(snapshot.drops.get(&DropReason::LinkDown), Some(&1));
    }
}
