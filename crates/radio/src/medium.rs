//! Simulated shared air for running a whole mesh inside one process

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep_until, Instant};
use log::{debug, error, info, trace};

use tacmesh_core::NodeId;

use crate::phy::{RadioDevice, RxFrame};
use crate::RadioError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkProfile {
    pub rssi: f32,
    pub snr: f32,
    /// Base probability that a burst is lost on this link.
    pub loss: f64,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            rssi: -70.0,
            snr: 20.0,
            loss: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediumConfig {
    pub latency: Duration,
    /// Standard deviation of the per-burst RSSI and SNR noise, in dB.
    pub signal_jitter_db: f32,
    pub bursty_loss: bool,
    /// Every pair of nodes hears each other unless a link says otherwise.
    pub full_mesh: bool,
    pub default_link: LinkProfile,
    pub rng_seed: Option<u64>,
    pub air_queue: usize,
    pub port_queue: usize,
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(1),
            signal_jitter_db: 1.0,
            bursty_loss: true,
            full_mesh: true,
            default_link: LinkProfile::default(),
            rng_seed: None,
            air_queue: 100_000,
            port_queue: 1000,
        }
    }
}

struct Burst {
    from: NodeId,
    wire: Bytes,
    deliver_at: Instant,
}

#[derive(Debug, Default)]
struct MediumStats {
    bursts_sent: u64,
    deliveries: u64,
    dropped: u64,
    bytes_delivered: u64,
}

type LinkMap = HashMap<(NodeId, NodeId), Option<LinkProfile>>;

/// Loss multiplier: mostly near the base rate, sometimes a fade at 2-3x.
fn bursty_factor(r: f64) -> f64 {
    if r < 0.7 {
        0.8 + (r / 0.7) * 0.4
    } else if r < 0.95 {
        1.2 + ((r - 0.7) / 0.25) * 0.6
    } else {
        2.0 + ((r - 0.95) / 0.05) * 1.0
    }
}

pub struct RadioMedium {
    ports: Arc<RwLock<HashMap<NodeId, mpsc::Sender<RxFrame>>>>,
    links: Arc<RwLock<LinkMap>>,
    config: MediumConfig,
    stats: Arc<Mutex<MediumStats>>,
    air: mpsc::Sender<Burst>,
}

impl RadioMedium {
    pub fn new(config: MediumConfig) -> Arc<Self> {
        let ports = Arc::new(RwLock::new(HashMap::<NodeId, mpsc::Sender<RxFrame>>::new()));
        let links = Arc::new(RwLock::new(LinkMap::new()));
        let stats = Arc::new(Mutex::new(MediumStats::default()));
        let (air, mut air_rx) = mpsc::channel::<Burst>(config.air_queue.max(1));

        info!("Radio medium initialised: {:?}", config);

        let task_ports = ports.clone();
        let task_links = links.clone();
        let task_stats = stats.clone();
        let task_config = config.clone();
        tokio::spawn(async move {
            let mut rng = match task_config.rng_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let noise = Normal::new(0.0f32, task_config.signal_jitter_db).ok();

            while let Some(burst) = air_rx.recv().await {
                sleep_until(burst.deliver_at).await;
                let ports = task_ports.read().await;
                let links = task_links.read().await;
                let mut stats = task_stats.lock().await;

                for (&to, port) in ports.iter() {
                    if to == burst.from {
                        continue;
                    }
                    let profile = match links.get(&(burst.from, to)) {
                        Some(Some(profile)) => *profile,
                        Some(None) => continue,
                        None if task_config.full_mesh => task_config.default_link,
                        None => continue,
                    };

                    let loss = if task_config.bursty_loss {
                        profile.loss * bursty_factor(rng.random::<f64>())
                    } else {
                        profile.loss
                    };
                    if rng.random::<f64>() < loss {
                        stats.dropped += 1;
                        debug!("Burst {} -> {} lost on air (p={:.3})", burst.from, to, loss);
                        continue;
                    }

                    let (rssi, snr) = match &noise {
                        Some(noise) => (profile.rssi + noise.sample(&mut rng), profile.snr + noise.sample(&mut rng)),
                        None => (profile.rssi, profile.snr),
                    };
                    let rx = RxFrame {
                        wire: burst.wire.clone(),
                        transmitter: burst.from,
                        rssi,
                        snr,
                    };
                    match port.try_send(rx) {
                        Ok(()) => {
                            trace!("Burst {} -> {} delivered", burst.from, to);
                            stats.deliveries += 1;
                            stats.bytes_delivered += burst.wire.len() as u64;
                        }
                        Err(e) => {
                            stats.dropped += 1;
                            debug!("Node {} receive buffer rejected burst: {}", to, e);
                        }
                    }
                }
            }
            debug!("Radio medium task stopped");
        });

        Arc::new(Self {
            ports,
            links,
            config,
            stats,
            air,
        })
    }

    pub async fn join(self: &Arc<Self>, id: NodeId) -> AirPort {
        let (tx, rx) = mpsc::channel(self.config.port_queue.max(1));
        self.ports.write().await.insert(id, tx);
        AirPort {
            id,
            medium: Arc::clone(self),
            receiver: Mutex::new(rx),
        }
    }

    pub async fn leave(&self, id: NodeId) {
        self.ports.write().await.remove(&id);
    }

    /// Sets the link in both directions.
    pub async fn set_link(&self, a: NodeId, b: NodeId, profile: LinkProfile) {
        let mut links = self.links.write().await;
        links.insert((a, b), Some(profile));
        links.insert((b, a), Some(profile));
    }

    pub async fn set_one_way(&self, from: NodeId, to: NodeId, profile: LinkProfile) {
        self.links.write().await.insert((from, to), Some(profile));
    }

    /// Takes the pair out of radio range, overriding `full_mesh`.
    pub async fn cut_link(&self, a: NodeId, b: NodeId) {
        let mut links = self.links.write().await;
        links.insert((a, b), None);
        links.insert((b, a), None);
    }

    fn submit(&self, from: NodeId, wire: Bytes) -> Result<(), RadioError> {
        let burst = Burst {
            from,
            wire,
            deliver_at: Instant::now() + self.config.latency,
        };
        match self.air.try_send(burst) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!("Radio medium queue is FULL, burst from {} lost", from);
                Err(RadioError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RadioError::ChannelClosed("air")),
        }
    }

    /// `(bursts_sent, deliveries, dropped, bytes_delivered)`
    pub async fn get_stats(&self) -> (u64, u64, u64, u64) {
        let stats = self.stats.lock().await;
        (stats.bursts_sent, stats.deliveries, stats.dropped, stats.bytes_delivered)
    }
}

/// One node's antenna on the shared medium.
pub struct AirPort {
    id: NodeId,
    medium: Arc<RadioMedium>,
    receiver: Mutex<mpsc::Receiver<RxFrame>>,
}

impl AirPort {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

#[async_trait]
impl RadioDevice for AirPort {
    async fn transmit(&self, wire: Bytes) -> Result<(), RadioError> {
        self.medium.submit(self.id, wire)?;
        self.medium.stats.lock().await.bursts_sent += 1;
        Ok(())
    }

    async fn receive(&self) -> Result<RxFrame, RadioError> {
        self.receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or(RadioError::ChannelClosed("air"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn quiet() -> MediumConfig {
        MediumConfig {
            signal_jitter_db: 0.0,
            rng_seed: Some(7),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reaches_everyone_else() {
        let medium = RadioMedium::new(quiet());
        let a = medium.join(1).await;
        let b = medium.join(2).await;
        let c = medium.join(3).await;

        a.transmit(Bytes::from_static(b"hello")).await.unwrap();
        for port in [&b, &c] {
            let rx = port.receive().await.unwrap();
            assert_eq!(rx.transmitter, 1);
            assert_eq!(&rx.wire[..], b"hello");
            assert_eq!(rx.rssi, -70.0);
        }
        assert!(timeout(Duration::from_millis(20), a.receive()).await.is_err());
        assert_eq!(medium.get_stats().await, (1, 2, 0, 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cut_and_one_way_links() {
        let medium = RadioMedium::new(quiet());
        let a = medium.join(1).await;
        let b = medium.join(2).await;
        medium.cut_link(1, 2).await;
        a.transmit(Bytes::from_static(b"x")).await.unwrap();
        assert!(timeout(Duration::from_millis(20), b.receive()).await.is_err());

        let weak = LinkProfile {
            rssi: -100.0,
            snr: 3.0,
            loss: 0.0,
        };
        medium.set_one_way(1, 2, weak).await;
        a.transmit(Bytes::from_static(b"y")).await.unwrap();
        let rx = b.receive().await.unwrap();
        assert_eq!((rx.rssi, rx.snr), (-100.0, 3.0));
        b.transmit(Bytes::from_static(b"z")).await.unwrap();
        assert!(timeout(Duration::from_millis(20), a.receive()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_loss_drops_every_burst() {
        let medium = RadioMedium::new(MediumConfig {
            default_link: LinkProfile {
                loss: 1.0,
                ..Default::default()
            },
            bursty_loss: false,
            ..quiet()
        });
        let a = medium.join(1).await;
        let b = medium.join(2).await;
        for _ in 0..5 {
            a.transmit(Bytes::from_static(b"lost")).await.unwrap();
        }
        assert!(timeout(Duration::from_millis(50), b.receive()).await.is_err());
        assert_eq!(medium.get_stats().await.2, 5);
    }

    #[test]
    fn test_bursty_factor_range() {
        assert!((bursty_factor(0.0) - 0.8).abs() < 1e-9);
        assert!((bursty_factor(0.7) - 1.2).abs() < 1e-9);
        assert!(bursty_factor(0.99) > 2.0);
    }
}
