//! The signaling hub of one node.
//!
//! Keeps `(client → node)` routing in the substrate so a message addressed
//! to a client on another node can be forwarded over the shared relay
//! channel:
//!
//! ```text
//! Ca ──offer{target=Cb}──▶ Hub A
//!                           │ local? no
//!                           │ home(Cb) = node B   (signaling:clients:Cb)
//!                           ▼
//!                  signaling:relay ──▶ Hub B ──▶ Cb
//! ```
//!
//! Rooms and client hashes live in the substrate with TTLs refreshed by the
//! heartbeat task; a crashed node's clients decay out of participant lists
//! within the TTL without any explicit cleanup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tandem_core::NodeConfig;
use tandem_substrate::{Batch, SubEvent, Substrate};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::{keys, Envelope, Participant, RelayFrame, Role};

/// Hub knobs derived from the node configuration.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub node_id: String,
    pub heartbeat_interval: Duration,
    /// TTL on client hashes and the server heartbeat; stale entries decay
    /// out of routing within this bound.
    pub client_ttl: Duration,
}

impl SignalConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            heartbeat_interval: config.heartbeat_interval,
            client_ttl: config.heartbeat_interval * 6,
        }
    }
}

struct LocalClient {
    tx: mpsc::UnboundedSender<Envelope>,
    room: Option<String>,
    role: Option<Role>,
}

/// A connected client as seen by the transport layer.
pub struct ClientConn {
    pub client_id: String,
    pub rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Counters for health output.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
}

pub struct SignalHub {
    substrate: Substrate,
    config: SignalConfig,
    clients: RwLock<HashMap<String, LocalClient>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalHub {
    pub fn new(substrate: Substrate, config: SignalConfig) -> Arc<Self> {
        Arc::new(Self {
            substrate,
            config,
            clients: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the relay listener and the heartbeat task.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        let relay_hub = Arc::clone(self);
        tasks.push(tokio::spawn(async move { relay_hub.relay_loop().await }));
        let beat_hub = Arc::clone(self);
        tasks.push(tokio::spawn(async move { beat_hub.heartbeat_loop().await }));
    }

    /// Stop background tasks (shutdown and tests).
    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    /// Accept a client: generates the id and queues the `welcome` greeting.
    pub async fn connect(&self) -> ClientConn {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Envelope::Welcome {
            client_id: client_id.clone(),
        });
        self.clients.write().await.insert(
            client_id.clone(),
            LocalClient {
                tx,
                room: None,
                role: None,
            },
        );
        log::debug!("client {client_id} connected to node {}", self.config.node_id);
        ClientConn { client_id, rx }
    }

    /// Handle one inbound envelope from a connected client.
    pub async fn handle(&self, client_id: &str, envelope: Envelope) {
        match envelope {
            Envelope::Join { room_id, role } => self.join(client_id, room_id, role).await,
            env @ (Envelope::Offer { .. }
            | Envelope::Answer { .. }
            | Envelope::IceCandidate { .. }) => self.route(client_id, env).await,
            Envelope::Leave => self.leave(client_id, true).await,
            other => {
                log::debug!("client {client_id}: ignoring {other:?}");
            }
        }
    }

    /// Tear down a client on socket close or heartbeat timeout.
    pub async fn disconnect(&self, client_id: &str) {
        self.leave(client_id, true).await;
        self.clients.write().await.remove(client_id);
        log::debug!("client {client_id} disconnected");
    }

    pub async fn stats(&self) -> HubStats {
        let clients = self.clients.read().await;
        let rooms: HashSet<&str> = clients
            .values()
            .filter_map(|c| c.room.as_deref())
            .collect();
        HubStats {
            connections: clients.len(),
            rooms: rooms.len(),
        }
    }

    async fn join(&self, client_id: &str, room_id: Option<String>, role: Option<String>) {
        let (Some(room_id), Some(role_raw)) = (room_id, role) else {
            self.send_to(
                client_id,
                Envelope::error("invalid_input", "join requires roomId and role"),
            )
            .await;
            return;
        };
        let role: Role = match role_raw.parse() {
            Ok(role) => role,
            Err(e) => {
                self.send_to(client_id, Envelope::error("invalid_input", e.to_string()))
                    .await;
                return;
            }
        };

        // A client belongs to at most one room.
        self.leave(client_id, true).await;

        let register = Batch::new()
            .hset(
                keys::client(client_id),
                vec![
                    ("room".to_string(), room_id.clone()),
                    ("role".to_string(), role.as_str().to_string()),
                    ("node".to_string(), self.config.node_id.clone()),
                ],
                Some(self.config.client_ttl),
            )
            .sadd(keys::members(&room_id), client_id)
            .sadd(keys::ROOMS_INDEX, room_id.clone());
        if let Err(e) = self.substrate.exec(register).await {
            self.send_to(client_id, Envelope::error("unavailable", e.to_string()))
                .await;
            return;
        }

        {
            let mut clients = self.clients.write().await;
            if let Some(c) = clients.get_mut(client_id) {
                c.room = Some(room_id.clone());
                c.role = Some(role);
            }
        }

        let participants = self.participants(&room_id, client_id).await;
        self.send_to(
            client_id,
            Envelope::Joined {
                room_id: room_id.clone(),
                participants,
            },
        )
        .await;

        self.broadcast_local(
            &room_id,
            Some(client_id),
            Envelope::PeerJoined {
                peer_id: client_id.to_string(),
                role: role.as_str().to_string(),
            },
        )
        .await;
        log::info!(
            "client {client_id} joined room {room_id} as {} on node {}",
            role.as_str(),
            self.config.node_id
        );
    }

    /// Current members of a room, excluding `except`, with lazy cleanup of
    /// members whose client hash has expired.
    async fn participants(&self, room_id: &str, except: &str) -> Vec<Participant> {
        let members = self
            .substrate
            .smembers(&keys::members(room_id))
            .await
            .unwrap_or_default();
        let mut participants = Vec::new();
        for member in members {
            if member == except {
                continue;
            }
            let hash = self
                .substrate
                .hgetall(&keys::client(&member))
                .await
                .unwrap_or_default();
            if hash.is_empty() {
                // Hash TTL expired: the owning node is gone.
                let _ = self.substrate.srem(&keys::members(room_id), &member).await;
                continue;
            }
            participants.push(Participant {
                client_id: member,
                role: hash.get("role").cloned().unwrap_or_default(),
            });
        }
        participants
    }

    async fn route(&self, sender: &str, envelope: Envelope) {
        let Some(target) = envelope.target_id().map(str::to_string) else {
            return;
        };
        let stamped = envelope.with_from(sender);

        // Local target: deliver directly.
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(&target) {
                let _ = client.tx.send(stamped);
                return;
            }
        }

        // Remote target: look up the home node and relay.
        let hash = self
            .substrate
            .hgetall(&keys::client(&target))
            .await
            .unwrap_or_default();
        let Some(target_node) = hash.get("node").cloned() else {
            if stamped.reports_missing_target() {
                self.send_to(
                    sender,
                    Envelope::error("target_missing", format!("client {target} is not connected")),
                )
                .await;
            }
            return;
        };

        let frame = RelayFrame {
            origin_node: self.config.node_id.clone(),
            target_node,
            target_client_id: target,
            envelope: stamped,
        };
        if let Ok(payload) = serde_json::to_vec(&frame) {
            let _ = self.substrate.publish(keys::RELAY_CHANNEL, payload).await;
        }
    }

    async fn leave(&self, client_id: &str, notify: bool) {
        let room = {
            let mut clients = self.clients.write().await;
            match clients.get_mut(client_id) {
                Some(c) => {
                    c.role = None;
                    c.room.take()
                }
                None => None,
            }
        };
        let Some(room) = room else { return };

        let _ = self
            .substrate
            .exec(
                Batch::new()
                    .srem(keys::members(&room), client_id)
                    .del(keys::client(client_id)),
            )
            .await;
        // Empty rooms fall out of the index.
        if self
            .substrate
            .scard(&keys::members(&room))
            .await
            .unwrap_or(0)
            == 0
        {
            let _ = self.substrate.srem(keys::ROOMS_INDEX, &room).await;
        }

        if notify {
            self.broadcast_local(
                &room,
                Some(client_id),
                Envelope::PeerLeft {
                    peer_id: client_id.to_string(),
                },
            )
            .await;
        }
    }

    async fn send_to(&self, client_id: &str, envelope: Envelope) {
        let clients = self.clients.read().await;
        if let Some(client) = clients.get(client_id) {
            let _ = client.tx.send(envelope);
        }
    }

    async fn broadcast_local(&self, room_id: &str, except: Option<&str>, envelope: Envelope) {
        let clients = self.clients.read().await;
        for (id, client) in clients.iter() {
            if except == Some(id.as_str()) {
                continue;
            }
            if client.room.as_deref() == Some(room_id) {
                let _ = client.tx.send(envelope.clone());
            }
        }
    }

    async fn relay_loop(self: Arc<Self>) {
        let mut sub = match self.substrate.subscribe(keys::RELAY_CHANNEL).await {
            Ok(sub) => sub,
            Err(e) => {
                log::error!("relay subscription failed: {e}");
                return;
            }
        };
        while let Some(event) = sub.next().await {
            let payload = match event {
                SubEvent::Message(payload) => payload,
                SubEvent::Lagged(n) => {
                    log::warn!("relay listener lagged by {n} messages");
                    continue;
                }
            };
            let Ok(frame) = serde_json::from_slice::<RelayFrame>(&payload) else {
                log::warn!("undecodable relay frame dropped");
                continue;
            };
            if frame.target_node != self.config.node_id {
                continue;
            }

            let delivered = {
                let clients = self.clients.read().await;
                clients
                    .get(&frame.target_client_id)
                    .map(|c| c.tx.send(frame.envelope.clone()).is_ok())
                    .unwrap_or(false)
            };
            if delivered {
                continue;
            }

            // Target raced away between lookup and delivery. Offers and
            // answers are reported back to the sender; ICE drops silently.
            if frame.envelope.reports_missing_target() {
                let sender = match &frame.envelope {
                    Envelope::Offer { from_id, .. } | Envelope::Answer { from_id, .. } => {
                        from_id.clone()
                    }
                    _ => None,
                };
                if let Some(sender) = sender {
                    let bounce = RelayFrame {
                        origin_node: self.config.node_id.clone(),
                        target_node: frame.origin_node,
                        target_client_id: sender,
                        envelope: Envelope::error(
                            "target_missing",
                            format!("client {} is not connected", frame.target_client_id),
                        ),
                    };
                    if let Ok(payload) = serde_json::to_vec(&bounce) {
                        let _ = self.substrate.publish(keys::RELAY_CHANNEL, payload).await;
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let (connections, rooms, roomed_clients) = {
                let clients = self.clients.read().await;
                let rooms: HashSet<String> =
                    clients.values().filter_map(|c| c.room.clone()).collect();
                let roomed: Vec<String> = clients
                    .iter()
                    .filter(|(_, c)| c.room.is_some())
                    .map(|(id, _)| id.clone())
                    .collect();
                (clients.len(), rooms.len(), roomed)
            };

            let fields: Vec<(&str, String)> = vec![
                ("connections", connections.to_string()),
                ("rooms", rooms.to_string()),
                ("updated_at", now_ms().to_string()),
            ];
            if let Err(e) = self
                .substrate
                .hset(
                    &keys::server(&self.config.node_id),
                    &fields,
                    Some(self.config.client_ttl),
                )
                .await
            {
                log::warn!("server heartbeat write failed: {e}");
            }

            // Keep this node's routable clients from decaying.
            for client_id in roomed_clients {
                let _ = self
                    .substrate
                    .expire(&keys::client(&client_id), self.config.client_ttl)
                    .await;
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
