//! simulation tools for TacMesh

pub mod scenarios;

use std::sync::Arc;
use std::time::Duration;
use log::info;

use tacmesh_core::NodeId;
use tacmesh_radio::{spawn_node, LinkProfile, MediumConfig, NodeHandle, RadioConfig, RadioMedium, RadioError};

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> MediumConfig {
        MediumConfig {
            latency: Duration::from_millis(1),
            signal_jitter_db: 1.0,
            default_link: LinkProfile {
                rssi: -65.0,
                snr: 25.0,
                loss: 0.02,
            },
            ..Default::default()
        }
    }

    pub fn average_conditions() -> MediumConfig {
        MediumConfig {
            latency: Duration::from_millis(2),
            signal_jitter_db: 3.0,
            default_link: LinkProfile {
                rssi: -80.0,
                snr: 15.0,
                loss: 0.10,
            },
            ..Default::default()
        }
    }

    pub fn poor_conditions() -> MediumConfig {
        MediumConfig {
            latency: Duration::from_millis(3),
            signal_jitter_db: 5.0,
            default_link: LinkProfile {
                rssi: -92.0,
                snr: 8.0,
                loss: 0.25,
            },
            ..Default::default()
        }
    }

    /// Heavy fading: most bursts lost, links rarely above the voice gate.
    pub fn extreme_conditions() -> MediumConfig {
        MediumConfig {
            latency: Duration::from_millis(5),
            signal_jitter_db: 8.0,
            default_link: LinkProfile {
                rssi: -105.0,
                snr: 4.0,
                loss: 0.45,
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Every node hears every other node.
    FullMesh,
    /// Node `k` hears only `k - 1` and `k + 1`.
    Line,
}

/// A set of nodes sharing one simulated medium.
pub struct SimNetwork {
    pub medium: Arc<RadioMedium>,
    pub nodes: Vec<NodeHandle>,
}

impl SimNetwork {
    /// Spawns nodes `1..=count`, each configured from `template` with its own id.
    pub async fn build(count: u8, topology: Topology, medium: MediumConfig, template: &RadioConfig) -> Self {
        let link = medium.default_link;
        let medium = RadioMedium::new(MediumConfig {
            full_mesh: topology == Topology::FullMesh,
            ..medium
        });
        if topology == Topology::Line {
            for id in 1..count {
                medium.set_link(id, id + 1, link).await;
            }
        }

        let mut nodes = Vec::with_capacity(count as usize);
        for id in 1..=count {
            let port = medium.join(id).await;
            let config = RadioConfig {
                node_id: id,
                rng_seed: template.rng_seed.map(|seed| seed.wrapping_add(id as u64)),
                ..template.clone()
            };
            nodes.push(spawn_node(config, Arc::new(port)));
        }
        info!("Simulated {:?} network of {} nodes up", topology, count);
        Self { medium, nodes }
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeHandle> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeHandle> {
        self.nodes.iter_mut().find(|n| n.id() == id)
    }

    /// Waits until every node has at least `min` neighbours.
    pub async fn wait_for_neighbours(&self, min: usize, deadline: Duration) -> Result<Duration, RadioError> {
        let started = tokio::time::Instant::now();
        loop {
            let mut ready = true;
            for node in &self.nodes {
                if node.neighbours().await.len() < min {
                    ready = false;
                    break;
                }
            }
            if ready {
                return Ok(started.elapsed());
            }
            if started.elapsed() >= deadline {
                return Err(RadioError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn shutdown(&mut self) {
        for node in &mut self.nodes {
            node.shutdown();
        }
    }
}
