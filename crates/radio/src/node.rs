//! One radio node: the PHY, MAC, RRC, NC and OLSR tasks wired over the fabric

use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use log::info;

use tacmesh_core::{ApplicationMessage, DataType, DeliveryStatus, NodeId, SeqNo};

use crate::fabric::{channel, AppToRrc, FabricReceiver, FabricSender, Message, PttEvent, RequestId, RrcToApp};
use crate::nc::{self, NcCycle};
use crate::neighbour::{NeighbourEntry, NeighbourTable};
use crate::olsr::OlsrState;
use crate::phy::{Phy, PhyChannels, PhyStats, RadioDevice};
use crate::pool::{shared_pool, SharedPool};
use crate::rrc::{self, RrcChannels, RrcSenders, RrcShared, RrcSnapshot};
use crate::tdma::{Mac, MacChannels, MacDiagnostics, SeqCounter};
use crate::{RadioConfig, RadioError};

/// What the application hears back from its node.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Status {
        request_id: RequestId,
        seq: Option<SeqNo>,
        status: DeliveryStatus,
    },
    Rx {
        source: NodeId,
        data_type: DataType,
        payload: Bytes,
    },
}

pub struct NodeHandle {
    id: NodeId,
    to_rrc: FabricSender<Message<AppToRrc>>,
    events: FabricReceiver<Message<RrcToApp>>,
    stashed: Option<Message<RrcToApp>>,
    msg_pool: SharedPool<ApplicationMessage>,
    rrc: Arc<RrcShared>,
    mac_diagnostics: Arc<std::sync::Mutex<MacDiagnostics>>,
    phy_stats: Arc<std::sync::Mutex<PhyStats>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Builds every layer of a node on `device` and spawns their tasks.
pub fn spawn_node(config: RadioConfig, device: Arc<dyn RadioDevice>) -> NodeHandle {
    let id = config.node_id;
    let cap = config.channel_capacity;

    let (app_tx, app_rx) = channel("app->rrc", cap);
    let (rrc_app_tx, rrc_app_rx) = channel("rrc->app", cap);
    let (rrc_olsr_tx, rrc_olsr_rx) = channel("rrc->olsr", cap);
    let (olsr_rrc_tx, olsr_rrc_rx) = channel("olsr->rrc", cap);
    let (rrc_tdma_tx, rrc_tdma_rx) = channel("rrc->tdma", cap);
    let (tdma_rrc_tx, tdma_rrc_rx) = channel("tdma->rrc", cap);
    let (tdma_phy_tx, tdma_phy_rx) = channel("tdma->phy", cap);
    let (phy_tdma_tx, phy_tdma_rx) = channel("phy->tdma", cap);
    let (rrc_phy_tx, rrc_phy_rx) = channel("rrc->phy", cap);
    let (phy_rrc_tx, phy_rrc_rx) = channel("phy->rrc", cap);
    let (nc_tx, nc_rx) = channel("rrc->nc", cap);

    let frame_pool = shared_pool(config.frame_pool_size);
    let msg_pool = shared_pool(config.frame_pool_size);
    let seq = Arc::new(SeqCounter::new());
    let table = Arc::new(RwLock::new(NeighbourTable::new(
        id,
        config.max_monitored_nodes,
        config.neighbour_timeout_supercycles,
    )));

    let active_window = config.supercycle_duration() * config.neighbour_timeout_supercycles.max(1) as u32;
    let phy = Phy::new(id, config.payload_max, device, frame_pool.clone(), active_window);
    let phy_stats = phy.stats_handle();

    let mac = Mac::new(&config, seq.clone(), Instant::now());
    let mac_diagnostics = Arc::new(std::sync::Mutex::new(mac.diagnostics()));

    let cycle = NcCycle::new(&config);
    let olsr = OlsrState::new(id);
    let rrc = Arc::new(RrcShared::new(
        config,
        RrcSenders {
            to_app: rrc_app_tx,
            to_olsr: rrc_olsr_tx,
            to_tdma: rrc_tdma_tx,
            to_phy: rrc_phy_tx,
        },
        table,
        frame_pool.clone(),
        msg_pool.clone(),
        seq,
    ));

    let tasks = vec![
        tokio::spawn(phy.run(PhyChannels {
            from_tdma: tdma_phy_rx,
            to_tdma: phy_tdma_tx,
            from_rrc: rrc_phy_rx,
            to_rrc: phy_rrc_tx,
        })),
        tokio::spawn(mac.run(
            MacChannels {
                from_rrc: rrc_tdma_rx,
                to_rrc: tdma_rrc_tx,
                from_phy: phy_tdma_rx,
                to_phy: tdma_phy_tx,
            },
            frame_pool,
            mac_diagnostics.clone(),
        )),
        tokio::spawn(rrc::run(
            rrc.clone(),
            RrcChannels {
                from_app: app_rx,
                from_olsr: olsr_rrc_rx,
                from_tdma: tdma_rrc_rx,
                from_phy: phy_rrc_rx,
            },
            nc_tx,
        )),
        tokio::spawn(nc::run(rrc.clone(), cycle, nc_rx)),
        tokio::spawn(olsr.run(rrc_olsr_rx, olsr_rrc_tx)),
    ];
    info!("Node {} up", id);

    NodeHandle {
        id,
        to_rrc: app_tx,
        events: rrc_app_rx,
        stashed: None,
        msg_pool,
        rrc,
        mac_diagnostics,
        phy_stats,
        tasks,
    }
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &RadioConfig {
        &self.rrc.config
    }

    /// Hands a message to the stack. The returned id tags its status events.
    pub async fn send(&self, msg: ApplicationMessage) -> Result<RequestId, RadioError> {
        let msg_idx = self.msg_pool.lock().await.store(msg)?;
        let request = Message::new(AppToRrc::Traffic { msg_idx });
        let request_id = request.header.request_id;
        if let Err(e) = self.to_rrc.try_send(request) {
            self.msg_pool.lock().await.release(msg_idx);
            return Err(e);
        }
        Ok(request_id)
    }

    pub fn ptt(&self, event: PttEvent) -> Result<(), RadioError> {
        self.to_rrc.try_send(Message::new(AppToRrc::Ptt(event)))
    }

    /// Next status or received payload; `None` once the stack has stopped.
    /// Cancel safe: a message taken off the channel is kept until returned.
    pub async fn next_event(&mut self) -> Option<AppEvent> {
        loop {
            if self.stashed.is_none() {
                self.stashed = Some(self.events.recv().await?);
            }
            let frame_idx = match self.stashed.as_ref().map(|m| &m.body) {
                Some(RrcToApp::Rx { frame_idx, .. }) => Some(*frame_idx),
                _ => None,
            };
            let payload = match frame_idx {
                Some(idx) => self.rrc.frame_pool.lock().await.take(idx).map(|f| f.payload),
                None => None,
            };
            let msg = self.stashed.take()?;
            match msg.body {
                RrcToApp::DeliveryStatus { seq, status } => {
                    return Some(AppEvent::Status {
                        request_id: msg.header.request_id,
                        seq,
                        status,
                    })
                }
                RrcToApp::Rx { source, data_type, .. } => {
                    if let Some(payload) = payload {
                        return Some(AppEvent::Rx {
                            source,
                            data_type,
                            payload,
                        });
                    }
                }
            }
        }
    }

    pub async fn next_event_timeout(&mut self, deadline: Duration) -> Result<AppEvent, RadioError> {
        match tokio::time::timeout(deadline, self.next_event()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(RadioError::ChannelClosed("rrc->app")),
            Err(_) => Err(RadioError::Timeout),
        }
    }

    pub fn mac_diagnostics(&self) -> Option<MacDiagnostics> {
        self.mac_diagnostics.lock().ok().map(|d| d.clone())
    }

    pub fn phy_stats(&self) -> PhyStats {
        self.phy_stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn rrc_stats(&self) -> RrcSnapshot {
        self.rrc.stats.snapshot()
    }

    /// `(in_use, high_water, capacity)` of the shared frame pool.
    pub async fn frame_pool_usage(&self) -> (usize, usize, usize) {
        let pool = self.rrc.frame_pool.lock().await;
        (pool.in_use(), pool.high_water(), pool.capacity())
    }

    /// `(enqueued, dequeued, overflow)` on the APP ingress channel.
    pub fn ingress_stats(&self) -> (u64, u64, u64) {
        self.to_rrc.stats()
    }

    pub async fn neighbours(&self) -> Vec<NeighbourEntry> {
        self.rrc.table.read().await.iter().cloned().collect()
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
