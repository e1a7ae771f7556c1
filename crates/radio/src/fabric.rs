//! Typed, bounded, unidirectional channels between adjacent layers
//!
//! Every record carries a [`Header`]. Requests and responses share a request
//! id and are matched through a [`Correlator`]; a response that arrives after
//! its caller gave up is dropped and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Instant};
use log::{debug, trace, warn};

use tacmesh_core::{DataType, DeliveryStatus, DropReason, NodeId, NodeSet, Priority, SeqNo};

use crate::pool::PoolIndex;
use crate::RadioError;

pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonic request id.
pub fn next_request_id() -> RequestId {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AppTraffic,
    AppPtt,
    AppDeliveryStatus,
    AppRx,
    OlsrRouteReq,
    OlsrRouteResp,
    OlsrTriggerDiscovery,
    OlsrHelloNc,
    OlsrTcRx,
    OlsrLinkLost,
    TdmaSlotCheckReq,
    TdmaSlotCheckResp,
    TdmaNcReq,
    TdmaNcResp,
    TdmaEnqueueReq,
    TdmaEnqueueResp,
    TdmaVoice,
    TdmaTxDone,
    TdmaTxFail,
    TdmaSupercycle,
    MacRelayFrame,
    PhyTransmit,
    PhyFrameRx,
    PhyTxResult,
    PhyMetricsReq,
    PhyMetricsResp,
    PhyLinkStatusReq,
    PhyLinkStatus,
    PhyPktCount,
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub kind: MessageKind,
    pub request_id: RequestId,
    pub created: Instant,
}

pub trait MessageBody {
    fn kind(&self) -> MessageKind;
}

#[derive(Debug, Clone)]
pub struct Message<B> {
    pub header: Header,
    pub body: B,
}

impl<B: MessageBody> Message<B> {
    /// New message with a fresh request id.
    pub fn new(body: B) -> Self {
        Self::with_id(next_request_id(), body)
    }

    /// Response correlated with `request`.
    pub fn reply_to(request: &Header, body: B) -> Self {
        Self::with_id(request.request_id, body)
    }

    fn with_id(request_id: RequestId, body: B) -> Self {
        Self {
            header: Header {
                kind: body.kind(),
                request_id,
                created: Instant::now(),
            },
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttEvent {
    Press,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Ok,
    NoRoute,
}

#[derive(Debug, Clone)]
pub enum AppToRrc {
    Traffic { msg_idx: PoolIndex },
    Ptt(PttEvent),
}

#[derive(Debug, Clone)]
pub enum RrcToApp {
    /// `request_id` in the header matches the `Traffic` message it reports on.
    DeliveryStatus { seq: Option<SeqNo>, status: DeliveryStatus },
    Rx {
        source: NodeId,
        data_type: DataType,
        frame_idx: PoolIndex,
    },
}

#[derive(Debug, Clone)]
pub enum RrcToOlsr {
    RouteReq { dest: NodeId, src: NodeId },
    TriggerDiscovery { dest: NodeId },
    HelloNc {
        src: NodeId,
        assigned_nc_slot: u8,
        neighbours: NodeSet,
    },
    TcRx {
        originator: NodeId,
        mpr_selectors: NodeSet,
    },
    LinkLost { node: NodeId },
}

#[derive(Debug, Clone)]
pub enum OlsrToRrc {
    RouteResp {
        dest: NodeId,
        next_hop: NodeId,
        hop_count: u8,
        status: RouteStatus,
    },
}

#[derive(Debug, Clone)]
pub enum RrcToTdma {
    SlotCheckReq { next_hop: NodeId, priority: Priority },
    NcSlotReq { payload_idx: PoolIndex },
    EnqueueReq { frame_idx: PoolIndex },
    Voice(PttEvent),
}

#[derive(Debug, Clone)]
pub enum TdmaToRrc {
    SlotCheckResp { available: bool, suggested_slot: u8 },
    NcSlotResp { success: bool, assigned_slot: u8 },
    EnqueueResp { outcome: Result<SeqNo, DropReason> },
    RelayFrame { frame_idx: PoolIndex },
    TxDone { seq: SeqNo },
    TxFail { seq: SeqNo, reason: DropReason },
    Supercycle { number: u64, synchronised: bool },
}

#[derive(Debug, Clone)]
pub enum TdmaToPhy {
    Transmit { frame_idx: PoolIndex, slot: u8 },
}

#[derive(Debug, Clone)]
pub enum PhyToTdma {
    FrameRx {
        frame_idx: PoolIndex,
        rssi: f32,
        snr: f32,
    },
    /// Outcome of a `Transmit` once the device has finished with it.
    TxResult {
        source: NodeId,
        seq: SeqNo,
        data_type: DataType,
        ok: bool,
    },
}

#[derive(Debug, Clone)]
pub enum RrcToPhy {
    MetricsReq { node: NodeId },
    LinkStatusReq { node: NodeId },
}

#[derive(Debug, Clone)]
pub enum PhyToRrc {
    MetricsResp {
        node: NodeId,
        rssi: f32,
        snr: f32,
        per: f32,
    },
    LinkStatus { node: NodeId, active: bool },
    PktCount { tx: u64, rx: u64 },
}

impl MessageBody for AppToRrc {
    fn kind(&self) -> MessageKind {
        match self {
            AppToRrc::Traffic { .. } => MessageKind::AppTraffic,
            AppToRrc::Ptt(_) => MessageKind::AppPtt,
        }
    }
}

impl MessageBody for RrcToApp {
    fn kind(&self) -> MessageKind {
        match self {
            RrcToApp::DeliveryStatus { .. } => MessageKind::AppDeliveryStatus,
            RrcToApp::Rx { .. } => MessageKind::AppRx,
        }
    }
}

impl MessageBody for RrcToOlsr {
    fn kind(&self) -> MessageKind {
        match self {
            RrcToOlsr::RouteReq { .. } => MessageKind::OlsrRouteReq,
            RrcToOlsr::TriggerDiscovery { .. } => MessageKind::OlsrTriggerDiscovery,
            RrcToOlsr::HelloNc { .. } => MessageKind::OlsrHelloNc,
            RrcToOlsr::TcRx { .. } => MessageKind::OlsrTcRx,
            RrcToOlsr::LinkLost { .. } => MessageKind::OlsrLinkLost,
        }
    }
}

impl MessageBody for OlsrToRrc {
    fn kind(&self) -> MessageKind {
        MessageKind::OlsrRouteResp
    }
}

impl MessageBody for RrcToTdma {
    fn kind(&self) -> MessageKind {
        match self {
            RrcToTdma::SlotCheckReq { .. } => MessageKind::TdmaSlotCheckReq,
            RrcToTdma::NcSlotReq { .. } => MessageKind::TdmaNcReq,
            RrcToTdma::EnqueueReq { .. } => MessageKind::TdmaEnqueueReq,
            RrcToTdma::Voice(_) => MessageKind::TdmaVoice,
        }
    }
}

impl MessageBody for TdmaToRrc {
    fn kind(&self) -> MessageKind {
        match self {
            TdmaToRrc::SlotCheckResp { .. } => MessageKind::TdmaSlotCheckResp,
            TdmaToRrc::NcSlotResp { .. } => MessageKind::TdmaNcResp,
            TdmaToRrc::EnqueueResp { .. } => MessageKind::TdmaEnqueueResp,
            TdmaToRrc::RelayFrame { .. } => MessageKind::MacRelayFrame,
            TdmaToRrc::TxDone { .. } => MessageKind::TdmaTxDone,
            TdmaToRrc::TxFail { .. } => MessageKind::TdmaTxFail,
            TdmaToRrc::Supercycle { .. } => MessageKind::TdmaSupercycle,
        }
    }
}

impl MessageBody for TdmaToPhy {
    fn kind(&self) -> MessageKind {
        MessageKind::PhyTransmit
    }
}

impl MessageBody for PhyToTdma {
    fn kind(&self) -> MessageKind {
        match self {
            PhyToTdma::FrameRx { .. } => MessageKind::PhyFrameRx,
            PhyToTdma::TxResult { .. } => MessageKind::PhyTxResult,
        }
    }
}

impl MessageBody for RrcToPhy {
    fn kind(&self) -> MessageKind {
        match self {
            RrcToPhy::MetricsReq { .. } => MessageKind::PhyMetricsReq,
            RrcToPhy::LinkStatusReq { .. } => MessageKind::PhyLinkStatusReq,
        }
    }
}

impl MessageBody for PhyToRrc {
    fn kind(&self) -> MessageKind {
        match self {
            PhyToRrc::MetricsResp { .. } => MessageKind::PhyMetricsResp,
            PhyToRrc::LinkStatus { .. } => MessageKind::PhyLinkStatus,
            PhyToRrc::PktCount { .. } => MessageKind::PhyPktCount,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelStats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    overflow: AtomicU64,
}

impl ChannelStats {
    /// `(enqueue_count, dequeue_count, overflow_count)`
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.enqueued.load(Ordering::Relaxed),
            self.dequeued.load(Ordering::Relaxed),
            self.overflow.load(Ordering::Relaxed),
        )
    }
}

pub struct FabricSender<T> {
    name: &'static str,
    inner: mpsc::Sender<T>,
    stats: Arc<ChannelStats>,
}

impl<T> Clone for FabricSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: self.stats.clone(),
        }
    }
}

pub struct FabricReceiver<T> {
    name: &'static str,
    inner: mpsc::Receiver<T>,
    stats: Arc<ChannelStats>,
}

pub fn channel<T>(name: &'static str, capacity: usize) -> (FabricSender<T>, FabricReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(ChannelStats::default());
    (
        FabricSender {
            name,
            inner: tx,
            stats: stats.clone(),
        },
        FabricReceiver {
            name,
            inner: rx,
            stats,
        },
    )
}

impl<T> FabricSender<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Non-blocking send; a full channel counts an overflow.
    pub fn try_send(&self, msg: T) -> Result<(), RadioError> {
        match self.inner.try_send(msg) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.overflow.fetch_add(1, Ordering::Relaxed);
                debug!("Channel {} full, message not sent", self.name);
                Err(RadioError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RadioError::ChannelClosed(self.name)),
        }
    }

    /// Waits for capacity up to `deadline`.
    pub async fn send_timeout(&self, msg: T, deadline: Duration) -> Result<(), RadioError> {
        match self.inner.send_timeout(msg, deadline).await {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.stats.overflow.fetch_add(1, Ordering::Relaxed);
                Err(RadioError::Timeout)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(RadioError::ChannelClosed(self.name)),
        }
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        self.stats.snapshot()
    }
}

impl<T> FabricReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        let msg = self.inner.recv().await;
        if msg.is_some() {
            self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        msg
    }

    pub async fn recv_timeout(&mut self, deadline: Duration) -> Result<T, RadioError> {
        match timeout(deadline, self.inner.recv()).await {
            Ok(Some(msg)) => {
                self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                Ok(msg)
            }
            Ok(None) => Err(RadioError::ChannelClosed(self.name)),
            Err(_) => Err(RadioError::Timeout),
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        let msg = self.inner.try_recv().ok();
        if msg.is_some() {
            self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        self.stats.snapshot()
    }
}

/// Matches responses to outstanding requests by request id.
pub struct Correlator<R> {
    name: &'static str,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<R>>>,
    late_responses: AtomicU64,
    timeouts: AtomicU64,
}

impl<R> Correlator<R> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Mutex::new(HashMap::new()),
            late_responses: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Sends `msg` and waits up to `deadline` for the matching response.
    /// On expiry the id is abandoned so a late response is dropped.
    pub async fn request<B>(
        &self,
        sender: &FabricSender<Message<B>>,
        msg: Message<B>,
        deadline: Duration,
    ) -> Result<R, RadioError> {
        let id = msg.header.request_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = sender.try_send(msg) {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RadioError::ChannelClosed(self.name)),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                let n = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    warn!("{} request {} timed out after {:?} ({} timeouts so far)", self.name, id, deadline, n);
                }
                Err(RadioError::Timeout)
            }
        }
    }

    /// Delivers a response. Returns `false` when nobody is waiting any more.
    pub async fn complete(&self, request_id: RequestId, response: R) -> bool {
        let waiter = self.pending.lock().await.remove(&request_id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                self.late_responses.fetch_add(1, Ordering::Relaxed);
                trace!("{} dropping late response for request {}", self.name, request_id);
                false
            }
        }
    }

    pub fn late_responses(&self) -> u64 {
        self.late_responses.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_request_ids_are_monotonic() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_overflow_counts_without_reordering() {
        let (tx, mut rx) = channel::<u32>("test", 2);
        assert_ok!(tx.try_send(1));
        assert_ok!(tx.try_send(2));
        assert_eq!(tx.try_send(3), Err(RadioError::QueueFull));
        assert_eq!(rx.recv().await, Some(1));
        assert_ok!(tx.try_send(4));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(4));
        assert_eq!(tx.stats(), (3, 3, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_and_send_timeout() {
        let (tx, mut rx) = channel::<u32>("test", 1);
        assert_eq!(rx.recv_timeout(Duration::from_millis(5)).await, Err(RadioError::Timeout));
        assert_ok!(tx.send_timeout(1, Duration::from_millis(1)).await);
        assert_err!(tx.send_timeout(2, Duration::from_millis(1)).await);
        assert_eq!(tx.stats().2, 1);
    }

    #[tokio::test]
    async fn test_response_matched_by_request_id() {
        let correlator = Arc::new(Correlator::<u32>::new("olsr"));
        let (tx, mut rx) = channel::<Message<RrcToOlsr>>("rrc->olsr", 4);

        let responder = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                let req = rx.recv().await.unwrap();
                assert_eq!(req.header.kind, MessageKind::OlsrRouteReq);
                // an unrelated id is not mistaken for ours
                assert!(!correlator.complete(req.header.request_id + 1000, 1).await);
                assert!(correlator.complete(req.header.request_id, 42).await);
            })
        };

        let msg = Message::new(RrcToOlsr::RouteReq { dest: 5, src: 1 });
        let answer = correlator.request(&tx, msg, Duration::from_secs(1)).await;
        assert_eq!(answer, Ok(42));
        responder.await.unwrap();
        assert_eq!(correlator.late_responses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_discarded() {
        let correlator = Correlator::<u32>::new("tdma");
        let (tx, mut rx) = channel::<Message<RrcToTdma>>("rrc->tdma", 4);
        let msg = Message::new(RrcToTdma::Voice(PttEvent::Press));
        let id = msg.header.request_id;

        let result = correlator.request(&tx, msg, Duration::from_millis(200)).await;
        assert_eq!(result, Err(RadioError::Timeout));
        assert!(rx.try_recv().is_some());
        assert!(!correlator.complete(id, 7).await);
        assert_eq!(correlator.timeouts(), 1);
        assert_eq!(correlator.late_responses(), 1);
    }
}
