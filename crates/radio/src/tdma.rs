//! TDMA MAC: owns the frame queues, the frame clock, time sync and the voice
//! reservation, and runs the slot loop.
//!
//! Everything the slot loop does is a plain method on [`Mac`] so that slot
//! behaviour can be driven step by step in tests; [`Mac::run`] only adds the
//! timer and the fabric around it.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::Bytes;
use tokio::time::{sleep_until, Instant};
use log::{debug, info, trace, warn};

use tacmesh_core::{DataType, DropReason, Frame, NodeId, Priority, SeqNo, VoiceControl, BROADCAST};

use crate::clock::{BeaconOutcome, FrameClock, SyncStatus, TimeSync};
use crate::fabric::{FabricReceiver, FabricSender, Message, PhyToTdma, PttEvent, RrcToTdma, TdmaToPhy, TdmaToRrc};
use crate::pool::SharedPool;
use crate::queue::{QueueError, QueueKind, QueueSet};
use crate::scheduler::{Backoff, BernoulliBackoff, SchedulerStats, SlotContext, SlotDecision, SlotScheduler, SLOT_SCHEDULE, SlotType};
use crate::voice::{VoiceReservation, VoiceState};
use crate::{RadioConfig, RadioError};

pub const PHY_SUBMIT_BUDGET: Duration = Duration::from_millis(1);

/// Per-node frame sequence numbers, shared by every layer that originates frames.
#[derive(Debug, Default)]
pub struct SeqCounter(AtomicU16);

impl SeqCounter {
    pub fn new() -> Self {
        Self(AtomicU16::new(1))
    }

    pub fn next(&self) -> SeqNo {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MacStats {
    pub relayed_up: u64,
    pub filtered: u64,
    pub beacons_sent: u64,
    pub cc_sent: u64,
    pub stale_nc_replaced: u64,
    pub resyncs: u64,
    pub bad_control: u64,
    pub tx_done: u64,
    pub tx_fail: u64,
}

/// Snapshot published by the running MAC.
#[derive(Debug, Clone)]
pub struct MacDiagnostics {
    pub scheduler: SchedulerStats,
    pub mac: MacStats,
    pub sync: SyncStatus,
    pub voice: &'static str,
    pub queued: usize,
    pub supercycle: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RxOutcome {
    /// Hand the frame to RRC.
    Relay(Frame),
    Consumed,
    Filtered,
}

pub struct MacChannels {
    pub from_rrc: FabricReceiver<Message<RrcToTdma>>,
    pub to_rrc: FabricSender<Message<TdmaToRrc>>,
    pub from_phy: FabricReceiver<Message<PhyToTdma>>,
    pub to_phy: FabricSender<Message<TdmaToPhy>>,
}

pub struct Mac {
    own_id: NodeId,
    own_nc_slot: u8,
    max_scan: Duration,
    request_timeout: Duration,
    queues: QueueSet,
    scheduler: SlotScheduler,
    voice: VoiceReservation,
    mv_holder: Option<(NodeId, Instant)>,
    clock: FrameClock,
    sync: TimeSync,
    seq: Arc<SeqCounter>,
    stats: MacStats,
}

impl Mac {
    pub fn new(config: &RadioConfig, seq: Arc<SeqCounter>, now: Instant) -> Self {
        let backoff = BernoulliBackoff::new(config.gu_transmit_probability, config.rng_seed);
        Self::with_backoff(config, Box::new(backoff), seq, now)
    }

    pub fn with_backoff(config: &RadioConfig, backoff: Box<dyn Backoff>, seq: Arc<SeqCounter>, now: Instant) -> Self {
        Self {
            own_id: config.node_id,
            own_nc_slot: config.own_nc_slot(),
            max_scan: config.max_scan_time,
            request_timeout: config.request_timeout,
            queues: QueueSet::new(config.queue_size),
            scheduler: SlotScheduler::new(backoff),
            voice: VoiceReservation::new(config.node_id, config.voice_grant, config.cr_timeout),
            mv_holder: None,
            clock: FrameClock::new(config.slot_duration, now),
            sync: TimeSync::new(config.node_id, config.neighbour_timeout_supercycles),
            seq,
            stats: MacStats::default(),
        }
    }

    /// Begins the acquisition scan.
    pub fn start(&mut self, now: Instant) {
        self.sync.start_scan(now, self.max_scan);
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn queues_mut(&mut self) -> &mut QueueSet {
        &mut self.queues
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    pub fn voice_state(&self) -> VoiceState {
        self.voice.state()
    }

    pub fn mv_holder(&self) -> Option<NodeId> {
        self.mv_holder.map(|(id, _)| id)
    }

    pub fn stats(&self) -> &MacStats {
        &self.stats
    }

    pub fn scheduler_stats(&self) -> &SchedulerStats {
        self.scheduler.stats()
    }

    pub fn diagnostics(&self) -> MacDiagnostics {
        MacDiagnostics {
            scheduler: self.scheduler.stats().clone(),
            mac: self.stats.clone(),
            sync: self.sync.status(),
            voice: self.voice.state().name(),
            queued: self.queues.total_len(),
            supercycle: self.clock.supercycle(),
        }
    }

    /// Treats the node as synchronised at the current clock position.
    pub fn force_sync(&mut self, now: Instant) {
        self.sync.start_scan(now, Duration::ZERO);
        self.sync.poll_scan(now, self.clock.supercycle());
        self.clock.mark_synchronised();
    }

    /// `(available, suggested_slot)` for traffic of `priority`.
    pub fn slot_check(&self, priority: Priority) -> (bool, u8) {
        let kind = QueueKind::for_priority(priority);
        let mut available = !self.queues.get(kind).is_full();
        if kind == QueueKind::AnalogVoice {
            available &= !self.voice.is_idle();
        }
        (available, self.next_serving_slot(kind))
    }

    fn next_serving_slot(&self, kind: QueueKind) -> u8 {
        let serves = |slot: u8| match (SLOT_SCHEDULE[slot as usize], kind) {
            (SlotType::Mv, QueueKind::AnalogVoice | QueueKind::Data(0)) => true,
            (SlotType::Du, QueueKind::Data(0) | QueueKind::Data(1)) => true,
            (SlotType::Gu, QueueKind::Relay | QueueKind::Data(2) | QueueKind::Data(3)) => true,
            (SlotType::Nc, QueueKind::Nc) => slot == 8 + (self.own_nc_slot - 1) % 2,
            _ => false,
        };
        let current = self.clock.slot_in_frame();
        (1..=SLOT_SCHEDULE.len() as u8)
            .map(|d| (current + d) % SLOT_SCHEDULE.len() as u8)
            .find(|slot| serves(*slot))
            .unwrap_or(current)
    }

    /// Queues an admitted frame by its priority.
    pub fn admit(&mut self, frame: Frame) -> Result<SeqNo, DropReason> {
        if frame.data_type == DataType::AnalogVoice && self.voice.is_idle() {
            return Err(DropReason::SlotUnavailable);
        }
        let seq = frame.seq;
        match self.queues.enqueue_by_priority(frame) {
            Ok(kind) => {
                trace!("Node {} queued seq {} on {}", self.own_id, seq, kind.name());
                Ok(seq)
            }
            Err(QueueError::Duplicate) => Err(DropReason::Duplicate),
            Err(_) => Err(DropReason::Backpressure),
        }
    }

    /// Queues an NC frame, replacing HELLOs and beacons still waiting at the head.
    pub fn submit_nc(&mut self, frame: Frame) -> (bool, u8) {
        if frame.data_type == DataType::Hello {
            let stale = self
                .queues
                .get_mut(QueueKind::Nc)
                .drain_while(|f| matches!(f.data_type, DataType::Hello | DataType::Beacon));
            self.stats.stale_nc_replaced += stale.len() as u64;
        }
        let ok = self.queues.get_mut(QueueKind::Nc).enqueue(frame).is_ok();
        (ok, self.own_nc_slot)
    }

    pub fn ptt(&mut self, event: PttEvent, now: Instant) -> Result<(), RadioError> {
        match event {
            PttEvent::Press => {
                let seq = self.seq.next();
                self.voice.ptt_press(now, seq, &mut self.queues)
            }
            PttEvent::Release => {
                self.voice.ptt_release(&mut self.queues);
                Ok(())
            }
        }
    }

    /// Classifies a frame heard on air.
    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> RxOutcome {
        if frame.source == self.own_id {
            self.stats.filtered += 1;
            return RxOutcome::Filtered;
        }
        match frame.data_type {
            DataType::Beacon => {
                self.on_beacon(&frame, now);
                RxOutcome::Consumed
            }
            DataType::Hello => {
                self.on_beacon(&frame, now);
                self.stats.relayed_up += 1;
                RxOutcome::Relay(frame)
            }
            DataType::ControlRequest => {
                self.on_peer_cr(&frame, now);
                RxOutcome::Consumed
            }
            DataType::ControlConfirm => {
                self.on_cc(&frame, now);
                RxOutcome::Consumed
            }
            _ if frame.next_hop == self.own_id || frame.next_hop == BROADCAST => {
                self.stats.relayed_up += 1;
                RxOutcome::Relay(frame)
            }
            _ => {
                self.stats.filtered += 1;
                RxOutcome::Filtered
            }
        }
    }

    fn on_beacon(&mut self, frame: &Frame, now: Instant) {
        let network_ms = frame.timestamp as u64;
        let local_ms = self.clock.network_time_ms(now);
        let was_master = self.sync.status() == SyncStatus::Master;
        let supercycle = self.clock.supercycle();
        match self.sync.on_beacon(frame.source, network_ms, local_ms, self.clock.frame_ms(), supercycle) {
            BeaconOutcome::Acquired => {
                self.clock.adopt(network_ms, now);
                self.clock.mark_synchronised();
                self.sync.note_acquired(self.clock.supercycle());
            }
            BeaconOutcome::Sampled if was_master => {
                // the old master's supercycle numbering is not comparable
                self.sync.take_offset();
                self.clock.adopt(network_ms, now);
                self.clock.mark_synchronised();
                self.sync.note_acquired(self.clock.supercycle());
            }
            BeaconOutcome::Sampled | BeaconOutcome::Ignored => {}
        }
    }

    fn on_peer_cr(&mut self, frame: &Frame, now: Instant) {
        let Ok(request) = VoiceControl::decode(&frame.payload) else {
            self.stats.bad_control += 1;
            return;
        };
        if !self.voice.is_idle() || self.mv_holder.is_some() {
            debug!("Node {} ignoring CR from {}, MV busy", self.own_id, request.requester);
            return;
        }
        let grant = Duration::from_millis(request.grant_ms as u64);
        let Ok(payload) = request.encode() else {
            self.stats.bad_control += 1;
            return;
        };
        let cc = Frame {
            source: self.own_id,
            destination: request.requester,
            next_hop: BROADCAST,
            ttl: 1,
            priority: Priority::VOICE,
            data_type: DataType::ControlConfirm,
            seq: self.seq.next(),
            timestamp: 0,
            payload,
        };
        match self.queues.get_mut(QueueKind::Data(0)).enqueue(cc) {
            Ok(()) => {
                self.stats.cc_sent += 1;
                self.mv_holder = Some((request.requester, now + grant));
                debug!("Node {} granting MV to {} for {:?}", self.own_id, request.requester, grant);
            }
            Err(e) => debug!("Node {} could not queue CC: {:?}", self.own_id, e),
        }
    }

    fn on_cc(&mut self, frame: &Frame, now: Instant) {
        let Ok(confirm) = VoiceControl::decode(&frame.payload) else {
            self.stats.bad_control += 1;
            return;
        };
        if confirm.requester == self.own_id {
            if self.voice.cc_received(now) {
                self.mv_holder = None;
            }
        } else {
            let until = now + Duration::from_millis(confirm.grant_ms as u64);
            self.mv_holder = Some((confirm.requester, until));
        }
    }

    /// Advances the clock one slot and decides what to send in it.
    pub fn advance(&mut self, now: Instant) -> SlotDecision {
        self.clock.tick();
        self.on_slot(now)
    }

    fn on_slot(&mut self, now: Instant) -> SlotDecision {
        self.voice.poll(now, &mut self.queues);
        if self.mv_holder.is_some_and(|(_, until)| now >= until) {
            self.mv_holder = None;
        }

        let supercycle = self.clock.supercycle();
        if !self.clock.is_synchronised() && self.sync.poll_scan(now, supercycle) {
            self.clock.mark_synchronised();
        }
        if self.clock.is_supercycle_start() && self.sync.check_loss(supercycle) {
            self.clock.clear_sync();
            self.sync.start_scan(now, self.max_scan);
            self.stats.resyncs += 1;
        }

        let nc_slot = self.clock.nc_slot_number();
        if nc_slot == Some(self.own_nc_slot)
            && self.sync.status() == SyncStatus::Master
            && self.queues.get(QueueKind::Nc).is_empty()
        {
            let beacon = self.beacon();
            if self.queues.get_mut(QueueKind::Nc).enqueue(beacon).is_ok() {
                self.stats.beacons_sent += 1;
            }
        }

        let ctx = SlotContext {
            slot_in_frame: self.clock.slot_in_frame(),
            nc_slot,
            own_nc_slot: self.own_nc_slot,
            synchronised: self.clock.is_synchronised() && self.sync.is_synchronised(),
            frame_count: self.clock.frame_count(),
            voice_active: self.voice.is_active(),
            mv_held_elsewhere: self.mv_holder.is_some(),
        };
        let decision = match self.scheduler.decide(&ctx, &mut self.queues) {
            SlotDecision::Transmit { frame, source: QueueKind::Nc } => SlotDecision::Transmit {
                frame: frame.with_timestamp(self.clock.slot_start_time()),
                source: QueueKind::Nc,
            },
            other => other,
        };

        if self.clock.slot_in_frame() as usize == SLOT_SCHEDULE.len() - 1 {
            if let Some(offset) = self.sync.take_offset() {
                if offset != 0 {
                    trace!("Node {} adjusting clock by {} ms", self.own_id, offset);
                    self.clock.adjust(offset, now);
                }
            }
        }
        decision
    }

    fn beacon(&self) -> Frame {
        Frame {
            source: self.own_id,
            destination: BROADCAST,
            next_hop: BROADCAST,
            ttl: 1,
            priority: Priority::VOICE,
            data_type: DataType::Beacon,
            seq: self.seq.next(),
            timestamp: 0,
            payload: Bytes::new(),
        }
    }

    /// Returns the seq to report as `TX_FAIL` when the frame was dropped.
    pub fn on_phy_rejected(&mut self, frame: Frame, source: QueueKind) -> Option<SeqNo> {
        let own = self.is_own_traffic(&frame);
        let seq = frame.seq;
        if self.scheduler.on_phy_rejected(frame, source, &mut self.queues) || !own {
            return None;
        }
        self.stats.tx_fail += 1;
        Some(seq)
    }

    /// The PHY took the frame; its report follows once the device is done.
    pub fn on_phy_accepted(&mut self, frame: &Frame) {
        self.scheduler.on_phy_accepted(frame);
    }

    /// Turns the device outcome of one of our frames into `TX_DONE` or `TX_FAIL`.
    pub fn on_tx_result(&mut self, source: NodeId, seq: SeqNo, data_type: DataType, ok: bool) -> Option<TdmaToRrc> {
        if source != self.own_id || !data_type.is_application() {
            return None;
        }
        if ok {
            self.stats.tx_done += 1;
            Some(TdmaToRrc::TxDone { seq })
        } else {
            self.stats.tx_fail += 1;
            Some(TdmaToRrc::TxFail {
                seq,
                reason: DropReason::PhyRejected,
            })
        }
    }

    /// Whether an RRC request has outlived the time RRC waits for its answer.
    pub fn is_stale(&self, created: Instant, now: Instant) -> bool {
        now.saturating_duration_since(created) >= self.request_timeout
    }

    fn is_own_traffic(&self, frame: &Frame) -> bool {
        frame.source == self.own_id && frame.data_type.is_application()
    }

    pub async fn run(mut self, mut channels: MacChannels, frame_pool: SharedPool<Frame>, diagnostics: Arc<Mutex<MacDiagnostics>>) {
        self.start(Instant::now());
        info!("TDMA MAC for node {} started (NC slot {})", self.own_id, self.own_nc_slot);

        loop {
            let boundary = self.clock.next_boundary();
            tokio::select! {
                biased;
                _ = sleep_until(boundary) => {
                    let now = Instant::now();
                    let decision = self.advance(now);
                    self.dispatch(decision, &channels, &frame_pool).await;
                    self.flush_to_l3(&channels.to_rrc, &frame_pool).await;
                    if self.clock.is_supercycle_start() {
                        let push = TdmaToRrc::Supercycle {
                            number: self.clock.supercycle(),
                            synchronised: self.sync.is_synchronised(),
                        };
                        if let Err(e) = channels.to_rrc.try_send(Message::new(push)) {
                            debug!("Node {} supercycle push dropped: {}", self.own_id, e);
                        }
                    }
                    if self.clock.slot_in_frame() == 0 {
                        if let Ok(mut snapshot) = diagnostics.lock() {
                            *snapshot = self.diagnostics();
                        }
                    }
                }
                msg = channels.from_rrc.recv() => match msg {
                    Some(msg) => self.on_rrc(msg, &channels.to_rrc, &frame_pool).await,
                    None => break,
                },
                msg = channels.from_phy.recv() => match msg {
                    Some(msg) => self.on_phy(msg, &channels.to_rrc, &frame_pool).await,
                    None => break,
                },
            }
        }
        debug!("TDMA MAC for node {} stopped", self.own_id);
    }

    async fn on_rrc(&mut self, msg: Message<RrcToTdma>, to_rrc: &FabricSender<Message<TdmaToRrc>>, frame_pool: &SharedPool<Frame>) {
        let header = msg.header;
        let response = match msg.body {
            RrcToTdma::SlotCheckReq { priority, .. } => {
                let (available, suggested_slot) = self.slot_check(priority);
                TdmaToRrc::SlotCheckResp { available, suggested_slot }
            }
            RrcToTdma::EnqueueReq { frame_idx } => {
                let frame = frame_pool.lock().await.take(frame_idx);
                let outcome = match frame {
                    // RRC has already reported this one as timed out
                    Some(frame) if self.is_stale(header.created, Instant::now()) => {
                        debug!("Node {} discarding stale enqueue of seq {}", self.own_id, frame.seq);
                        Err(DropReason::Timeout)
                    }
                    Some(frame) => self.admit(frame),
                    None => Err(DropReason::Internal),
                };
                TdmaToRrc::EnqueueResp { outcome }
            }
            RrcToTdma::NcSlotReq { payload_idx } => {
                let (success, assigned_slot) = match frame_pool.lock().await.take(payload_idx) {
                    Some(frame) => self.submit_nc(frame),
                    None => (false, self.own_nc_slot),
                };
                TdmaToRrc::NcSlotResp { success, assigned_slot }
            }
            RrcToTdma::Voice(event) => {
                if let Err(e) = self.ptt(event, Instant::now()) {
                    warn!("Node {} PTT {:?} failed: {}", self.own_id, event, e);
                }
                return;
            }
        };
        if let Err(e) = to_rrc.try_send(Message::reply_to(&header, response)) {
            debug!("Node {} TDMA response dropped: {}", self.own_id, e);
        }
    }

    async fn on_phy(
        &mut self,
        msg: Message<PhyToTdma>,
        to_rrc: &FabricSender<Message<TdmaToRrc>>,
        frame_pool: &SharedPool<Frame>,
    ) {
        let (frame_idx, rssi, snr) = match msg.body {
            PhyToTdma::FrameRx { frame_idx, rssi, snr } => (frame_idx, rssi, snr),
            PhyToTdma::TxResult {
                source,
                seq,
                data_type,
                ok,
            } => {
                if let Some(report) = self.on_tx_result(source, seq, data_type, ok) {
                    if let Err(e) = to_rrc.try_send(Message::new(report)) {
                        debug!("Node {} TX report dropped: {}", self.own_id, e);
                    }
                }
                return;
            }
        };
        let Some(frame) = frame_pool.lock().await.take(frame_idx) else {
            return;
        };
        trace!("Node {} RX {}:{} ({:?}) rssi {:.1} snr {:.1}", self.own_id, frame.source, frame.seq, frame.data_type, rssi, snr);
        if let RxOutcome::Relay(frame) = self.on_frame(frame, Instant::now()) {
            if self.queues.get_mut(QueueKind::ToL3).enqueue(frame).is_err() {
                debug!("Node {} to-L3 queue full, frame dropped", self.own_id);
            }
        }
    }

    /// Hands received frames up to RRC, keeping them queued while the channel is full.
    async fn flush_to_l3(&mut self, to_rrc: &FabricSender<Message<TdmaToRrc>>, frame_pool: &SharedPool<Frame>) {
        while let Ok(frame) = self.queues.get_mut(QueueKind::ToL3).dequeue() {
            let stored = frame_pool.lock().await.store(frame.clone());
            let Ok(frame_idx) = stored else {
                let _ = self.queues.get_mut(QueueKind::ToL3).requeue_front(frame);
                return;
            };
            let msg = Message::new(TdmaToRrc::RelayFrame { frame_idx });
            if to_rrc.try_send(msg).is_err() {
                frame_pool.lock().await.release(frame_idx);
                let _ = self.queues.get_mut(QueueKind::ToL3).requeue_front(frame);
                return;
            }
        }
    }

    async fn dispatch(&mut self, decision: SlotDecision, channels: &MacChannels, frame_pool: &SharedPool<Frame>) {
        let SlotDecision::Transmit { frame, source } = decision else {
            return;
        };
        let slot = self.clock.slot_in_frame();
        let stored = frame_pool.lock().await.store(frame.clone());
        let report = match stored {
            Ok(frame_idx) => {
                let msg = Message::new(TdmaToPhy::Transmit { frame_idx, slot });
                match channels.to_phy.send_timeout(msg, PHY_SUBMIT_BUDGET).await {
                    Ok(()) => {
                        self.on_phy_accepted(&frame);
                        None
                    }
                    Err(_) => {
                        frame_pool.lock().await.release(frame_idx);
                        self.on_phy_rejected(frame, source).map(|seq| TdmaToRrc::TxFail {
                            seq,
                            reason: DropReason::PhyRejected,
                        })
                    }
                }
            }
            Err(_) => self.on_phy_rejected(frame, source).map(|seq| TdmaToRrc::TxFail {
                seq,
                reason: DropReason::PhyRejected,
            }),
        };
        if let Some(report) = report {
            if let Err(e) = channels.to_rrc.try_send(Message::new(report)) {
                debug!("Node {} TX report dropped: {}", self.own_id, e);
            }
        }
    }
}
