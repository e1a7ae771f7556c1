//! Unix-socket application gateway for a TacMesh node.
//!
//! Clients speak line-delimited JSON. Each line from a client is a
//! [`GatewayRequest`]; each line back is a [`GatewayEvent`]. Delivery
//! statuses go only to the client that submitted the message, received
//! payloads go to every connected client.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use tacmesh_core::{ApplicationMessage, DataType, DeliveryStatus, DropReason, NodeId, SeqNo, BROADCAST};
use tacmesh_radio::{AppEvent, NodeHandle, PttEvent, RequestId};

/// Longest accepted request line.
pub const MAX_LINE: usize = 16 * 1024;

const CLIENT_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("codec: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("node stopped")]
    NodeStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayRequest {
    /// `destination` absent means broadcast.
    Send {
        #[serde(default)]
        destination: Option<NodeId>,
        data_type: DataType,
        #[serde(default)]
        priority: Option<i8>,
        payload: Vec<u8>,
    },
    Ptt {
        pressed: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayEvent {
    Accepted {
        request_id: RequestId,
    },
    Rejected {
        reason: DropReason,
        message: String,
    },
    DeliveryStatus {
        request_id: RequestId,
        seq: Option<SeqNo>,
        status: DeliveryStatus,
    },
    Rx {
        source: NodeId,
        data_type: DataType,
        payload: Vec<u8>,
    },
    Error {
        message: String,
    },
}

impl GatewayRequest {
    fn into_message(self, source: NodeId) -> Option<ApplicationMessage> {
        match self {
            GatewayRequest::Send {
                destination,
                data_type,
                priority,
                payload,
            } => {
                let mut msg = match destination {
                    Some(dest) if dest != BROADCAST => ApplicationMessage::unicast(source, dest, data_type, payload),
                    _ => ApplicationMessage::broadcast(source, data_type, payload),
                };
                msg.priority = priority;
                Some(msg)
            }
            GatewayRequest::Ptt { .. } => None,
        }
    }
}

type ClientId = u64;

struct Command {
    client: ClientId,
    request: GatewayRequest,
}

#[derive(Clone)]
struct Gateway {
    clients: Arc<RwLock<HashMap<ClientId, mpsc::Sender<GatewayEvent>>>>,
    commands: mpsc::Sender<Command>,
    next_client: Arc<AtomicU64>,
}

/// Binds `path`, replacing a stale socket file, and serves `node` on it.
pub async fn serve(path: impl AsRef<Path>, node: NodeHandle) -> Result<(), GatewayError> {
    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!("Gateway for node {} listening on {}", node.id(), path.display());
    run_gateway(listener, node).await
}

/// Accepts clients on `listener` until the node stops.
pub async fn run_gateway(listener: UnixListener, node: NodeHandle) -> Result<(), GatewayError> {
    let (commands, command_rx) = mpsc::channel(CLIENT_QUEUE);
    let gateway = Gateway {
        clients: Arc::new(RwLock::new(HashMap::new())),
        commands,
        next_client: Arc::new(AtomicU64::new(1)),
    };
    let mut bridge = tokio::spawn(bridge(node, command_rx, gateway.clients.clone()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, gateway).await {
                        warn!("Client closed with error: {}", e);
                    }
                });
            }
            _ = &mut bridge => {
                info!("Node stopped, gateway shutting down");
                return Err(GatewayError::NodeStopped);
            }
        }
    }
}

/// Owns the node: executes client commands and fans node events out.
async fn bridge(
    mut node: NodeHandle,
    mut commands: mpsc::Receiver<Command>,
    clients: Arc<RwLock<HashMap<ClientId, mpsc::Sender<GatewayEvent>>>>,
) {
    let mut owners: HashMap<RequestId, ClientId> = HashMap::new();
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(Command { client, request }) = command else { break };
                let reply = execute(&node, &mut owners, client, request).await;
                if let Some(reply) = reply {
                    push(&clients, client, reply).await;
                }
            }
            event = node.next_event() => {
                let Some(event) = event else { break };
                match event {
                    AppEvent::Status { request_id, seq, status } => {
                        let owner = if status.is_terminal() {
                            owners.remove(&request_id)
                        } else {
                            owners.get(&request_id).copied()
                        };
                        match owner {
                            Some(client) => {
                                push(&clients, client, GatewayEvent::DeliveryStatus { request_id, seq, status }).await
                            }
                            None => debug!("Status for unknown request {}: {}", request_id, status),
                        }
                    }
                    AppEvent::Rx { source, data_type, payload } => {
                        let event = GatewayEvent::Rx {
                            source,
                            data_type,
                            payload: payload.to_vec(),
                        };
                        let guard = clients.read().await;
                        for (&id, tx) in guard.iter() {
                            if tx.try_send(event.clone()).is_err() {
                                warn!("Client {} lagging, dropped rx from {}", id, source);
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn execute(
    node: &NodeHandle,
    owners: &mut HashMap<RequestId, ClientId>,
    client: ClientId,
    request: GatewayRequest,
) -> Option<GatewayEvent> {
    if let GatewayRequest::Ptt { pressed } = request {
        let event = if pressed { PttEvent::Press } else { PttEvent::Release };
        return match node.ptt(event) {
            Ok(()) => None,
            Err(e) => Some(GatewayEvent::Rejected {
                reason: e.drop_reason(),
                message: e.to_string(),
            }),
        };
    }
    let msg = request.into_message(node.id())?;
    let destination = msg.destination;
    match node.send(msg).await {
        Ok(request_id) => {
            debug!("Client {} submitted request {} for {}", client, request_id, destination);
            owners.insert(request_id, client);
            Some(GatewayEvent::Accepted { request_id })
        }
        Err(e) => Some(GatewayEvent::Rejected {
            reason: e.drop_reason(),
            message: e.to_string(),
        }),
    }
}

async fn push(clients: &RwLock<HashMap<ClientId, mpsc::Sender<GatewayEvent>>>, client: ClientId, event: GatewayEvent) {
    let guard = clients.read().await;
    if let Some(tx) = guard.get(&client) {
        if tx.try_send(event).is_err() {
            warn!("Client {} lagging, event dropped", client);
        }
    }
}

async fn handle_client(stream: UnixStream, gateway: Gateway) -> Result<(), GatewayError> {
    let id = gateway.next_client.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut lines) = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE)).split();
    let (tx, mut rx) = mpsc::channel::<GatewayEvent>(CLIENT_QUEUE);
    gateway.clients.write().await.insert(id, tx.clone());
    info!("Client {} connected", id);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    error!("Cannot encode event: {}", e);
                    continue;
                }
            };
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut result = Ok(());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                result = Err(e.into());
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<GatewayRequest>(&line) {
            Ok(request) => {
                if gateway.commands.send(Command { client: id, request }).await.is_err() {
                    result = Err(GatewayError::NodeStopped);
                    break;
                }
            }
            Err(e) => {
                let _ = tx.try_send(GatewayEvent::Error {
                    message: format!("bad request: {}", e),
                });
            }
        }
    }

    gateway.clients.write().await.remove(&id);
    drop(tx);
    let _ = writer.await;
    info!("Client {} disconnected", id);
    result
}
