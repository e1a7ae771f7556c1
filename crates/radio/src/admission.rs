//! Admission of APP traffic: classify, route, gate on link quality, check
//! for a slot, then hand the frame to the MAC
//!
//! Submissions are classified in arrival order and passed to one lane per
//! priority. A lane admits one message at a time, so sequence numbers and
//! queue positions follow submission order within a priority while a data
//! tier waiting for room never holds up voice.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use log::{debug, trace};

use tacmesh_core::{ApplicationMessage, DataType, DropReason, Frame, FrameError, NodeId, Priority, BROADCAST};

use crate::fabric::{
    channel, FabricReceiver, FabricSender, Header, Message, OlsrToRrc, PhyToRrc, RouteStatus, RrcToOlsr, RrcToPhy,
    RrcToTdma, TdmaToRrc,
};
use crate::pool::PoolIndex;
use crate::rrc::RrcShared;
use crate::RadioError;

/// Priority for an APP message. An explicit data tier wins except for analog
/// voice and relay traffic, which keep their fixed classes.
pub fn classify(msg: &ApplicationMessage) -> Result<Priority, RadioError> {
    if !msg.data_type.is_application() {
        return Err(FrameError::UnknownDataType(msg.data_type as u8).into());
    }
    let fixed = matches!(msg.data_type, DataType::AnalogVoice | DataType::Relay);
    Ok(match msg.priority.and_then(Priority::data_tier) {
        Some(priority) if !fixed => priority,
        _ => msg.data_type.default_priority(),
    })
}

/// An APP message handed over by the RRC loop, still in the message pool.
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub header: Header,
    pub msg_idx: PoolIndex,
}

struct Admitted {
    header: Header,
    msg: ApplicationMessage,
}

/// Ordered admission for one node. Ends when the RRC loop drops its sender.
pub async fn run(shared: Arc<RrcShared>, mut inbox: FabricReceiver<Submission>) {
    let mut lanes: HashMap<Priority, FabricSender<Admitted>> = HashMap::new();
    while let Some(Submission { header, msg_idx }) = inbox.recv().await {
        let Some(msg) = shared.msg_pool.lock().await.take(msg_idx) else {
            debug!("Node {} traffic for empty message slot {}", shared.own_id(), msg_idx);
            continue;
        };
        let priority = match classify(&msg) {
            Ok(priority) => priority,
            Err(e) => {
                shared.report_drop(&header, None, e.drop_reason());
                continue;
            }
        };
        let lane = lanes.entry(priority).or_insert_with(|| {
            let (tx, rx) = channel("admission lane", shared.config.channel_capacity);
            tokio::spawn(run_lane(shared.clone(), priority, rx));
            tx
        });
        if let Err(e) = lane.try_send(Admitted { header, msg }) {
            debug!(
                "Node {} admission lane {} refused request {}: {}",
                shared.own_id(),
                priority.value(),
                header.request_id,
                e
            );
            shared.report_drop(&header, None, e.drop_reason());
        }
    }
    debug!("Node {} admission stopped", shared.own_id());
}

async fn run_lane(shared: Arc<RrcShared>, priority: Priority, mut inbox: FabricReceiver<Admitted>) {
    while let Some(Admitted { header, msg }) = inbox.recv().await {
        if let Err(reason) = admit(&shared, &header, msg, priority).await {
            shared.report_drop(&header, None, reason);
        }
    }
}

/// Runs one APP message through admission on the caller's task and reports the outcome.
pub async fn handle_traffic(shared: Arc<RrcShared>, header: Header, msg_idx: PoolIndex) {
    let Some(msg) = shared.msg_pool.lock().await.take(msg_idx) else {
        debug!("Node {} traffic for empty message slot {}", shared.own_id(), msg_idx);
        return;
    };
    let admitted = match classify(&msg) {
        Ok(priority) => admit(&shared, &header, msg, priority).await,
        Err(e) => Err(e.drop_reason()),
    };
    if let Err(reason) = admitted {
        shared.report_drop(&header, None, reason);
    }
}

async fn admit(shared: &RrcShared, header: &Header, msg: ApplicationMessage, priority: Priority) -> Result<(), DropReason> {
    if msg.payload.len() > shared.config.payload_max {
        return Err(DropReason::InvalidFrame);
    }
    let broadcast = msg.is_broadcast();
    let destination = if broadcast { BROADCAST } else { msg.destination };

    let next_hop = resolve_next_hop(shared, destination)
        .await
        .map_err(|e| e.drop_reason())?;
    if priority.value() <= 1 {
        check_link(shared, next_hop).await.map_err(|e| e.drop_reason())?;
    }
    check_slot(shared, next_hop, priority).await?;

    let frame = Frame {
        source: shared.own_id(),
        destination,
        next_hop,
        ttl: if broadcast { 1 } else { shared.config.network_diameter },
        priority,
        data_type: msg.data_type,
        seq: shared.seq.next(),
        timestamp: 0,
        payload: msg.payload,
    };
    frame
        .validate(shared.config.payload_max)
        .map_err(|e| RadioError::from(e).drop_reason())?;
    enqueue(shared, header, frame).await
}

/// Next hop toward `dest`: direct for broadcast and neighbours, otherwise a
/// fresh cached route or an OLSR lookup. A stale cached route is used only
/// when OLSR does not answer in time.
pub async fn resolve_next_hop(shared: &RrcShared, dest: NodeId) -> Result<NodeId, RadioError> {
    if dest == BROADCAST {
        return Ok(BROADCAST);
    }
    if dest == shared.own_id() {
        return Err(RadioError::NoRoute(dest));
    }
    if shared.table.read().await.is_neighbour(dest) {
        return Ok(dest);
    }
    if let Some((next_hop, _)) = shared.routes.lock().await.fresh(dest, Instant::now()) {
        return Ok(next_hop);
    }

    let request = Message::new(RrcToOlsr::RouteReq {
        dest,
        src: shared.own_id(),
    });
    let answer = shared
        .olsr
        .request(&shared.senders.to_olsr, request, shared.config.route_request_timeout)
        .await;
    match answer {
        Ok(OlsrToRrc::RouteResp {
            next_hop,
            hop_count,
            status: RouteStatus::Ok,
            ..
        }) => {
            trace!("Node {} route to {} via {} ({} hops)", shared.own_id(), dest, next_hop, hop_count);
            shared.routes.lock().await.insert(dest, next_hop, hop_count, Instant::now());
            Ok(next_hop)
        }
        Ok(OlsrToRrc::RouteResp { .. }) => {
            shared.routes.lock().await.remove(dest);
            let _ = shared
                .senders
                .to_olsr
                .try_send(Message::new(RrcToOlsr::TriggerDiscovery { dest }));
            Err(RadioError::NoRoute(dest))
        }
        Err(RadioError::Timeout) => match shared.routes.lock().await.last_known(dest) {
            Some((next_hop, _)) => {
                debug!("Node {} OLSR silent, using stale route to {} via {}", shared.own_id(), dest, next_hop);
                Ok(next_hop)
            }
            None => Err(RadioError::NoRoute(dest)),
        },
        Err(e) => {
            debug!("Node {} route request for {} failed: {}", shared.own_id(), dest, e);
            Err(RadioError::NoRoute(dest))
        }
    }
}

/// Link gate for voice and video. Falls back to asking the PHY whether the
/// next hop is still heard when the table's metrics are below threshold.
async fn check_link(shared: &RrcShared, next_hop: NodeId) -> Result<(), RadioError> {
    if next_hop == BROADCAST {
        return Ok(());
    }
    let (usable, metrics_known) = {
        let table = shared.table.read().await;
        let usable = table.is_link_usable(next_hop, shared.config.rssi_min, shared.config.snr_min);
        (usable, table.get(next_hop).is_some_and(|e| e.metrics_known()))
    };
    if usable {
        return Ok(());
    }

    let request = Message::new(RrcToPhy::LinkStatusReq { node: next_hop });
    match shared
        .phy
        .request(&shared.senders.to_phy, request, shared.config.route_request_timeout)
        .await
    {
        Ok(PhyToRrc::LinkStatus { active: true, .. }) => Ok(()),
        Ok(_) => Err(RadioError::LinkDown(next_hop)),
        // no fresh answer: trust the table only if it ever had metrics
        Err(_) if metrics_known => Err(RadioError::LinkDown(next_hop)),
        Err(_) => Ok(()),
    }
}

/// Asks the MAC for room. Data tiers wait up to the admit window for a full
/// queue to drain; voice classes fail at once.
async fn check_slot(shared: &RrcShared, next_hop: NodeId, priority: Priority) -> Result<(), DropReason> {
    let started = Instant::now();
    loop {
        let request = Message::new(RrcToTdma::SlotCheckReq { next_hop, priority });
        let answer = shared
            .tdma
            .request(&shared.senders.to_tdma, request, shared.config.request_timeout)
            .await;
        match answer {
            Ok(TdmaToRrc::SlotCheckResp { available: true, .. }) => return Ok(()),
            Ok(TdmaToRrc::SlotCheckResp { available: false, .. }) => {
                if priority == Priority::PTT {
                    return Err(DropReason::SlotUnavailable);
                }
                if priority.value() < 2 || started.elapsed() >= shared.config.admit_wait {
                    return Err(DropReason::Backpressure);
                }
                sleep(shared.config.slot_duration).await;
            }
            Ok(other) => {
                debug!("Node {} unexpected slot check answer {:?}", shared.own_id(), other);
                return Err(DropReason::Internal);
            }
            // slot state unknown, the enqueue itself still reports backpressure
            Err(RadioError::Timeout) => return Ok(()),
            Err(e) => return Err(e.drop_reason()),
        }
    }
}

async fn enqueue(shared: &RrcShared, header: &Header, frame: Frame) -> Result<(), DropReason> {
    let seq = frame.seq;
    let frame_idx = shared
        .frame_pool
        .lock()
        .await
        .store(frame)
        .map_err(|e| e.drop_reason())?;
    shared.track(seq, *header).await;

    let request = Message::new(RrcToTdma::EnqueueReq { frame_idx });
    let answer = shared
        .tdma
        .request(&shared.senders.to_tdma, request, shared.config.request_timeout)
        .await;
    match answer {
        Ok(TdmaToRrc::EnqueueResp { outcome: Ok(_) }) => {
            shared.confirm_queued(seq).await;
            Ok(())
        }
        Ok(TdmaToRrc::EnqueueResp { outcome: Err(reason) }) => {
            shared.untrack(seq).await;
            shared.report_drop(header, Some(seq), reason);
            Ok(())
        }
        Ok(other) => {
            shared.untrack(seq).await;
            debug!("Node {} unexpected enqueue answer {:?}", shared.own_id(), other);
            Err(DropReason::Internal)
        }
        Err(e) => {
            shared.untrack(seq).await;
            // a timed-out request is still in the MAC's channel; the MAC discards it as stale
            if !matches!(e, RadioError::Timeout) {
                shared.frame_pool.lock().await.release(frame_idx);
            }
            Err(e.drop_reason())
        }
    }
}
