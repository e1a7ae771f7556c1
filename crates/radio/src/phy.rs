//! PHY adapter: the radio device seam, per-link metrics and the PHY actor

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{interval, Instant, MissedTickBehavior};
use log::{debug, info, trace, warn};

use tacmesh_core::{Frame, NodeId, SeqNo};

use crate::fabric::{FabricReceiver, FabricSender, Message, PhyToRrc, PhyToTdma, RrcToPhy, TdmaToPhy};
use crate::neighbour::{RSSI_RANGE, SNR_RANGE};
use crate::pool::SharedPool;
use crate::RadioError;

const METRIC_SMOOTHING: f32 = 0.25;
const PER_WINDOW: u64 = 256;
pub const PKT_COUNT_INTERVAL: Duration = Duration::from_secs(1);

/// One burst heard on air, still in wire form.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub wire: Bytes,
    /// Node whose radio sent the burst (differs from the frame source on relays).
    pub transmitter: NodeId,
    pub rssi: f32,
    pub snr: f32,
}

/// A half-duplex radio the PHY actor drives.
#[async_trait]
pub trait RadioDevice: Send + Sync {
    async fn transmit(&self, wire: Bytes) -> Result<(), RadioError>;

    async fn receive(&self) -> Result<RxFrame, RadioError>;
}

#[derive(Debug, Clone)]
struct LinkStats {
    rssi: f32,
    snr: f32,
    last_seq: Option<SeqNo>,
    received: u64,
    missed: u64,
    last_heard: Instant,
}

impl LinkStats {
    fn new(rssi: f32, snr: f32, now: Instant) -> Self {
        Self {
            rssi,
            snr,
            last_seq: None,
            received: 0,
            missed: 0,
            last_heard: now,
        }
    }

    fn observe_signal(&mut self, rssi: f32, snr: f32, now: Instant) {
        self.rssi += METRIC_SMOOTHING * (rssi - self.rssi);
        self.snr += METRIC_SMOOTHING * (snr - self.snr);
        self.last_heard = now;
    }

    /// Counts sequence gaps. Frames leave a node out of seq order across
    /// priority queues, so a late seq gives back one previously missed.
    fn observe_seq(&mut self, seq: SeqNo) {
        self.received += 1;
        match self.last_seq {
            None => self.last_seq = Some(seq),
            Some(last) => {
                match seq.wrapping_sub(last) {
                    0 => {}
                    ahead @ 1..=0x7fff => {
                        self.missed += (ahead - 1) as u64;
                        self.last_seq = Some(seq);
                    }
                    _ => self.missed = self.missed.saturating_sub(1),
                }
            }
        }
        if self.received + self.missed > PER_WINDOW {
            self.received /= 2;
            self.missed /= 2;
        }
    }

    fn per(&self) -> f32 {
        let total = self.received + self.missed;
        if total == 0 {
            0.0
        } else {
            self.missed as f32 / total as f32
        }
    }
}

/// Link quality as seen by this radio, keyed by transmitting neighbour.
#[derive(Debug)]
pub struct LinkMonitor {
    links: HashMap<NodeId, LinkStats>,
    active_window: Duration,
}

impl LinkMonitor {
    pub fn new(active_window: Duration) -> Self {
        Self {
            links: HashMap::new(),
            active_window,
        }
    }

    pub fn observe(&mut self, transmitter: NodeId, frame: &Frame, rssi: f32, snr: f32, now: Instant) {
        let link = self
            .links
            .entry(transmitter)
            .or_insert_with(|| LinkStats::new(rssi, snr, now));
        link.observe_signal(rssi, snr, now);
        // relayed frames carry someone else's sequence space
        if frame.source == transmitter {
            link.observe_seq(frame.seq);
        }
    }

    /// `(rssi, snr, per)`; an unheard node reports the floor of every range.
    pub fn metrics(&self, node: NodeId) -> (f32, f32, f32) {
        match self.links.get(&node) {
            Some(link) => (link.rssi, link.snr, link.per()),
            None => (RSSI_RANGE.0, SNR_RANGE.0, 1.0),
        }
    }

    pub fn is_active(&self, node: NodeId, now: Instant) -> bool {
        self.links
            .get(&node)
            .map_or(false, |l| now.saturating_duration_since(l.last_heard) <= self.active_window)
    }
}

#[derive(Debug, Default, Clone)]
pub struct PhyStats {
    pub tx: u64,
    pub rx: u64,
    pub tx_errors: u64,
    pub invalid_rx: u64,
    pub rx_pool_drops: u64,
    pub rx_channel_drops: u64,
}

pub struct PhyChannels {
    pub from_tdma: FabricReceiver<Message<TdmaToPhy>>,
    pub to_tdma: FabricSender<Message<PhyToTdma>>,
    pub from_rrc: FabricReceiver<Message<RrcToPhy>>,
    pub to_rrc: FabricSender<Message<PhyToRrc>>,
}

pub struct Phy {
    own_id: NodeId,
    payload_max: usize,
    device: Arc<dyn RadioDevice>,
    frame_pool: SharedPool<Frame>,
    monitor: LinkMonitor,
    stats: Arc<std::sync::Mutex<PhyStats>>,
}

impl Phy {
    pub fn new(
        own_id: NodeId,
        payload_max: usize,
        device: Arc<dyn RadioDevice>,
        frame_pool: SharedPool<Frame>,
        active_window: Duration,
    ) -> Self {
        Self {
            own_id,
            payload_max,
            device,
            frame_pool,
            monitor: LinkMonitor::new(active_window),
            stats: Arc::new(std::sync::Mutex::new(PhyStats::default())),
        }
    }

    pub fn stats_handle(&self) -> Arc<std::sync::Mutex<PhyStats>> {
        self.stats.clone()
    }

    fn bump<F: FnOnce(&mut PhyStats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn counts(&self) -> (u64, u64) {
        self.stats.lock().map(|s| (s.tx, s.rx)).unwrap_or_default()
    }

    pub async fn run(mut self, mut channels: PhyChannels) {
        info!("PHY for node {} started", self.own_id);
        let mut pkt_timer = interval(PKT_COUNT_INTERVAL);
        pkt_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let device = self.device.clone();

        loop {
            tokio::select! {
                msg = channels.from_tdma.recv() => match msg {
                    Some(msg) => self.on_transmit(msg, &channels.to_tdma).await,
                    None => break,
                },
                msg = channels.from_rrc.recv() => match msg {
                    Some(msg) => self.on_rrc(msg, &channels.to_rrc),
                    None => break,
                },
                rx = device.receive() => match rx {
                    Ok(rx) => self.on_receive(rx, &channels.to_tdma).await,
                    Err(e) => {
                        warn!("Node {} radio receive failed: {}", self.own_id, e);
                        break;
                    }
                },
                _ = pkt_timer.tick() => {
                    let (tx, rx) = self.counts();
                    let _ = channels.to_rrc.try_send(Message::new(PhyToRrc::PktCount { tx, rx }));
                }
            }
        }
        debug!("PHY for node {} stopped", self.own_id);
    }

    /// Puts one frame on air and tells the MAC how it went.
    async fn on_transmit(&mut self, msg: Message<TdmaToPhy>, to_tdma: &FabricSender<Message<PhyToTdma>>) {
        let TdmaToPhy::Transmit { frame_idx, slot } = msg.body;
        let Some(frame) = self.frame_pool.lock().await.take(frame_idx) else {
            trace!("Spurious transmit wakeup for {}", frame_idx);
            return;
        };
        trace!("Node {} TX {}:{} in slot {}", self.own_id, frame.source, frame.seq, slot);
        let ok = match self.device.transmit(frame.encode()).await {
            Ok(()) => {
                self.bump(|s| s.tx += 1);
                true
            }
            Err(e) => {
                warn!("Node {} radio transmit failed: {}", self.own_id, e);
                self.bump(|s| s.tx_errors += 1);
                false
            }
        };
        let result = Message::new(PhyToTdma::TxResult {
            source: frame.source,
            seq: frame.seq,
            data_type: frame.data_type,
            ok,
        });
        if let Err(e) = to_tdma.try_send(result) {
            debug!("Node {} TX result for {}:{} lost: {}", self.own_id, frame.source, frame.seq, e);
        }
    }

    fn on_rrc(&mut self, msg: Message<RrcToPhy>, to_rrc: &FabricSender<Message<PhyToRrc>>) {
        let body = match msg.body {
            RrcToPhy::MetricsReq { node } => {
                let (rssi, snr, per) = self.monitor.metrics(node);
                PhyToRrc::MetricsResp { node, rssi, snr, per }
            }
            RrcToPhy::LinkStatusReq { node } => PhyToRrc::LinkStatus {
                node,
                active: self.monitor.is_active(node, Instant::now()),
            },
        };
        if let Err(e) = to_rrc.try_send(Message::reply_to(&msg.header, body)) {
            debug!("Node {} PHY response dropped: {}", self.own_id, e);
        }
    }

    async fn on_receive(&mut self, rx: RxFrame, to_tdma: &FabricSender<Message<PhyToTdma>>) {
        let frame = match Frame::decode(rx.wire, self.payload_max) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Node {} dropping invalid burst from {}: {}", self.own_id, rx.transmitter, e);
                self.bump(|s| s.invalid_rx += 1);
                return;
            }
        };
        self.bump(|s| s.rx += 1);
        self.monitor.observe(rx.transmitter, &frame, rx.rssi, rx.snr, Instant::now());

        let frame_idx = match self.frame_pool.lock().await.store(frame) {
            Ok(idx) => idx,
            Err(_) => {
                self.bump(|s| s.rx_pool_drops += 1);
                return;
            }
        };
        let msg = Message::new(PhyToTdma::FrameRx {
            frame_idx,
            rssi: rx.rssi,
            snr: rx.snr,
        });
        if to_tdma.try_send(msg).is_err() {
            self.frame_pool.lock().await.release(frame_idx);
            self.bump(|s| s.rx_channel_drops += 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tacmesh_core::{DataType, Priority, BROADCAST};

    fn frame(source: NodeId, seq: SeqNo) -> Frame {
        Frame {
            source,
            destination: BROADCAST,
            next_hop: BROADCAST,
            ttl: 1,
            priority: Priority::SMS,
            data_type: DataType::Sms,
            seq,
            timestamp: 0,
            payload: Bytes::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_from_sequence_gaps() {
        let mut monitor = LinkMonitor::new(Duration::from_secs(4));
        let now = Instant::now();
        for seq in [1, 2, 4, 5] {
            monitor.observe(3, &frame(3, seq), -70.0, 20.0, now);
        }
        let (_, _, per) = monitor.metrics(3);
        assert!((per - 0.2).abs() < 1e-6);

        // a relayed frame from another source does not count
        monitor.observe(3, &frame(9, 100), -70.0, 20.0, now);
        assert!((monitor.metrics(3).2 - 0.2).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_frame_forgives_a_gap() {
        let mut monitor = LinkMonitor::new(Duration::from_secs(4));
        let now = Instant::now();
        for seq in [10, 12, 11] {
            monitor.observe(2, &frame(2, seq), -70.0, 20.0, now);
        }
        assert_eq!(monitor.metrics(2).2, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_activity_window() {
        let mut monitor = LinkMonitor::new(Duration::from_secs(4));
        let start = Instant::now();
        monitor.observe(2, &frame(2, 1), -70.0, 20.0, start);
        assert!(monitor.is_active(2, start + Duration::from_secs(4)));
        assert!(!monitor.is_active(2, start + Duration::from_secs(5)));
        assert!(!monitor.is_active(7, start));
        assert_eq!(monitor.metrics(7), (RSSI_RANGE.0, SNR_RANGE.0, 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_is_smoothed() {
        let mut monitor = LinkMonitor::new(Duration::from_secs(4));
        let now = Instant::now();
        monitor.observe(2, &frame(2, 1), -80.0, 20.0, now);
        monitor.observe(2, &frame(2, 2), -60.0, 20.0, now);
        let (rssi, _, _) = monitor.metrics(2);
        assert!((rssi - -75.0).abs() < 1e-4);
    }

    struct Broken;

    #[async_trait]
    impl RadioDevice for Broken {
        async fn transmit(&self, _wire: Bytes) -> Result<(), RadioError> {
            Err(RadioError::LinkDown(BROADCAST))
        }

        async fn receive(&self) -> Result<RxFrame, RadioError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_device_failure_reported_to_mac() {
        let pool = crate::pool::shared_pool(4);
        let mut phy = Phy::new(1, 2800, Arc::new(Broken), pool.clone(), Duration::from_secs(4));
        let (to_tdma, mut from_phy) = crate::fabric::channel("phy->tdma", 4);
        let frame_idx = pool.lock().await.store(frame(1, 7)).unwrap();

        phy.on_transmit(Message::new(TdmaToPhy::Transmit { frame_idx, slot: 3 }), &to_tdma)
            .await;

        let result = from_phy.try_recv().unwrap();
        assert!(matches!(
            result.body,
            PhyToTdma::TxResult { source: 1, seq: 7, data_type: DataType::Sms, ok: false }
        ));
        assert_eq!(phy.stats_handle().lock().unwrap().tx_errors, 1);
        assert_eq!(pool.lock().await.in_use(), 0);
    }
}
