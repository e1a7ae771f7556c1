//! Simulation scenarios for exercising TacMesh nodes over the simulated medium

use std::collections::HashMap;
use std::time::Duration;
use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use tokio::time::{sleep, Instant};
use log::{debug, info};

use tacmesh_core::{ApplicationMessage, DataType, DeliveryStatus, DropReason, NodeId};
use tacmesh_radio::{AppEvent, NodeHandle, PttEvent, RequestId};

use crate::SimNetwork;

#[derive(Debug, Default, Clone)]
pub struct ScenarioReport {
    pub name: String,
    pub offered: u64,
    pub queued: u64,
    pub sent: u64,
    pub delivered: u64,
    pub drops: HashMap<DropReason, u64>,
    pub elapsed: Duration,
}

impl ScenarioReport {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn record(&mut self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Queued => self.queued += 1,
            DeliveryStatus::Sent => self.sent += 1,
            DeliveryStatus::Dropped(reason) => *self.drops.entry(reason).or_default() += 1,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.drops.values().sum()
    }

    pub fn delivery_ratio(&self) -> f64 {
        if self.offered == 0 {
            return 0.0;
        }
        self.delivered as f64 / self.offered as f64
    }

    fn terminal(&self) -> u64 {
        self.sent + self.dropped()
    }
}

fn pair_mut(nodes: &mut [NodeHandle], a: NodeId, b: NodeId) -> Result<(&mut NodeHandle, &mut NodeHandle)> {
    let ia = nodes.iter().position(|n| n.id() == a).ok_or_else(|| anyhow!("no node {}", a))?;
    let ib = nodes.iter().position(|n| n.id() == b).ok_or_else(|| anyhow!("no node {}", b))?;
    if ia == ib {
        bail!("sender and receiver are both node {}", a);
    }
    if ia < ib {
        let (left, right) = nodes.split_at_mut(ib);
        Ok((&mut left[ia], &mut right[0]))
    } else {
        let (left, right) = nodes.split_at_mut(ia);
        Ok((&mut right[0], &mut left[ib]))
    }
}

/// Sends `count` messages from `from` to `to`, one per `spacing`, and waits
/// until every message has a terminal status or `deadline` passes.
pub async fn unicast_exchange(
    net: &mut SimNetwork,
    from: NodeId,
    to: NodeId,
    count: u64,
    data_type: DataType,
    spacing: Duration,
    deadline: Duration,
) -> Result<ScenarioReport> {
    let mut report = ScenarioReport::new(format!("{:?} {} -> {}", data_type, from, to));
    let (sender, receiver) = pair_mut(&mut net.nodes, from, to)?;
    let started = Instant::now();
    let payload_max = sender.config().payload_max;

    let mut requests: Vec<RequestId> = Vec::new();
    for n in 0..count {
        let body = format!("msg {} from {}", n, from);
        let mut payload = body.into_bytes();
        payload.truncate(payload_max);
        let msg = ApplicationMessage::unicast(from, to, data_type, Bytes::from(payload));
        match sender.send(msg).await {
            Ok(id) => requests.push(id),
            Err(e) => {
                debug!("Node {} refused message {}: {}", from, n, e);
                *report.drops.entry(e.drop_reason()).or_default() += 1;
            }
        }
        report.offered += 1;
        sleep(spacing).await;
    }

    let end = started + deadline;
    while (report.terminal() < requests.len() as u64 || report.delivered < report.sent) && Instant::now() < end {
        tokio::select! {
            event = sender.next_event() => match event {
                Some(AppEvent::Status { request_id, status, .. }) if requests.contains(&request_id) => {
                    report.record(status);
                }
                Some(_) => {}
                None => bail!("node {} stopped", from),
            },
            event = receiver.next_event() => match event {
                Some(AppEvent::Rx { source, data_type: dt, .. }) if source == from && dt == data_type => {
                    report.delivered += 1;
                }
                Some(_) => {}
                None => bail!("node {} stopped", to),
            },
            _ = tokio::time::sleep_until(end) => break,
        }
    }
    report.elapsed = started.elapsed();
    info!(
        "{}: {} offered, {} sent, {} delivered, {} dropped",
        report.name,
        report.offered,
        report.sent,
        report.delivered,
        report.dropped()
    );
    Ok(report)
}

/// Presses PTT on `talker`, waits for the MV grant, sends `frames` analog
/// voice bursts one frame apart and releases. Counts bursts heard by every
/// other node.
pub async fn ptt_talk_spurt(net: &mut SimNetwork, talker: NodeId, frames: u64) -> Result<ScenarioReport> {
    let mut report = ScenarioReport::new(format!("PTT from {}", talker));
    let index = net
        .nodes
        .iter()
        .position(|n| n.id() == talker)
        .ok_or_else(|| anyhow!("no node {}", talker))?;
    let started = Instant::now();
    let (frame_duration, cr_timeout) = {
        let config = net.nodes[index].config();
        (config.frame_duration(), config.cr_timeout)
    };

    net.nodes[index].ptt(PttEvent::Press)?;
    let grant_deadline = Instant::now() + cr_timeout * 2;
    loop {
        let voice = net.nodes[index].mac_diagnostics().map(|d| d.voice);
        if voice == Some("ACTIVE_TX") {
            break;
        }
        if Instant::now() >= grant_deadline {
            net.nodes[index].ptt(PttEvent::Release)?;
            bail!("node {} never got an MV grant", talker);
        }
        sleep(frame_duration).await;
    }
    info!("Node {} holds MV after {:?}", talker, started.elapsed());

    let mut requests = Vec::new();
    for n in 0..frames {
        let msg = ApplicationMessage::broadcast(talker, DataType::AnalogVoice, Bytes::from(vec![n as u8; 8]));
        requests.push(net.nodes[index].send(msg).await?);
        report.offered += 1;
        sleep(frame_duration).await;
    }
    sleep(frame_duration * 2).await;
    net.nodes[index].ptt(PttEvent::Release)?;

    for (i, node) in net.nodes.iter_mut().enumerate() {
        while let Ok(event) = node.next_event_timeout(frame_duration).await {
            match event {
                AppEvent::Status { request_id, status, .. } if i == index && requests.contains(&request_id) => {
                    report.record(status)
                }
                AppEvent::Rx {
                    source,
                    data_type: DataType::AnalogVoice,
                    ..
                } if i != index && source == talker => report.delivered += 1,
                _ => {}
            }
        }
    }
    report.elapsed = started.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimulationPresets, Topology};
    use tacmesh_radio::{LinkProfile, MediumConfig, RadioConfig};

    fn lossless() -> MediumConfig {
        MediumConfig {
            rng_seed: Some(5),
            signal_jitter_db: 0.0,
            default_link: LinkProfile {
                rssi: -60.0,
                snr: 25.0,
                loss: 0.0,
            },
            ..SimulationPresets::good_conditions()
        }
    }

    fn template() -> RadioConfig {
        RadioConfig {
            rng_seed: Some(40),
            ..RadioConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_mesh_sms_delivery() {
        let mut net = SimNetwork::build(3, Topology::FullMesh, lossless(), &template()).await;
        net.wait_for_neighbours(2, Duration::from_secs(20)).await.unwrap();

        let report = unicast_exchange(
            &mut net,
            1,
            3,
            4,
            DataType::Sms,
            Duration::from_millis(100),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(report.queued, 4);
        assert_eq!(report.sent, 4);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.dropped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_relays_through_middle_node() {
        let mut net = SimNetwork::build(3, Topology::Line, lossless(), &template()).await;
        net.wait_for_neighbours(1, Duration::from_secs(20)).await.unwrap();
        // let HELLOs settle into symmetric links on both hops
        sleep(Duration::from_secs(10)).await;

        let report = unicast_exchange(
            &mut net,
            1,
            3,
            1,
            DataType::Sms,
            Duration::from_millis(10),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(report.delivered, 1);
        assert!(net.node(2).unwrap().rrc_stats().relayed >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_talk_spurt_reaches_listeners() {
        let mut net = SimNetwork::build(3, Topology::FullMesh, lossless(), &template()).await;
        net.wait_for_neighbours(2, Duration::from_secs(20)).await.unwrap();

        let report = ptt_talk_spurt(&mut net, 2, 3).await.unwrap();
        assert_eq!(report.offered, 3);
        assert_eq!(report.queued, 3);
        // two listeners, three bursts each
        assert_eq!(report.delivered, 6);
    }

    #[tokio::test]
    async fn test_pair_mut_rejects_same_node() {
        let mut net = SimNetwork::build(2, Topology::FullMesh, lossless(), &template()).await;
        assert!(pair_mut(&mut net.nodes, 1, 1).is_err());
        let (a, b) = pair_mut(&mut net.nodes, 2, 1).unwrap();
        assert_eq!((a.id(), b.id()), (2, 1));
        net.shutdown();
    }
}
