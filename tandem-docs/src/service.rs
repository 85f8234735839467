//! Document rooms: authoritative yrs docs, write-behind persistence and
//! the cross-node awareness relay.
//!
//! ```text
//! Client A ──┐
//!             ├── DocRoom (doc_id) ── yrs Doc ── broadcast fan-out
//! Client B ──┘        │
//!                     ├── docs:{doc_id}        (encoded state, KV)
//!                     └── awareness:{doc_id}   (channel, origin-tagged)
//! ```
//!
//! Persistence is write-behind: updates merge into the in-memory doc
//! immediately and the full encoded state is re-written after a coalescing
//! debounce. CRDT merges are idempotent and commutative, so a late or
//! repeated write cannot corrupt the stored state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tandem_core::{Fault, NodeConfig};
use tandem_substrate::{SubEvent, Substrate};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::protocol::{AwarenessFrame, AwarenessState, DocMessage, DocMsgType};

/// Substrate keys owned by the document service.
pub(crate) mod keys {
    pub fn doc(doc_id: &str) -> String {
        format!("docs:{doc_id}")
    }

    pub fn awareness_channel(doc_id: &str) -> String {
        format!("awareness:{doc_id}")
    }
}

/// Document identity: `(workspace, path)` flattened into one id.
pub fn doc_id(workspace_id: &str, path: &str) -> String {
    format!("{workspace_id}/{path}")
}

/// Service knobs derived from the node configuration.
#[derive(Debug, Clone)]
pub struct DocConfig {
    pub node_id: String,
    /// Coalescing window for write-behind persistence.
    pub persist_debounce: Duration,
    /// Fan-out buffer per local subscriber.
    pub broadcast_capacity: usize,
}

impl DocConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            persist_debounce: Duration::from_millis(50),
            broadcast_capacity: 256,
        }
    }
}

struct DocRoom {
    doc: yrs::Doc,
    broadcast: broadcast::Sender<Arc<Vec<u8>>>,
    awareness: HashMap<Uuid, AwarenessState>,
    clients: usize,
    persist_pending: Arc<AtomicBool>,
    relay_task: tokio::task::JoinHandle<()>,
}

/// A client attached to a document room.
pub struct DocConn {
    pub client_id: Uuid,
    pub rx: broadcast::Receiver<Arc<Vec<u8>>>,
    /// Messages to deliver immediately: the full document state as a
    /// `SyncStep2` plus the presence of every peer already in the room.
    pub backlog: Vec<Vec<u8>>,
}

type Rooms = Arc<RwLock<HashMap<String, DocRoom>>>;

pub struct DocService {
    substrate: Substrate,
    config: DocConfig,
    rooms: Rooms,
}

impl DocService {
    pub fn new(substrate: Substrate, config: DocConfig) -> Arc<Self> {
        Arc::new(Self {
            substrate,
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Attach a client to a document, creating the room and loading the
    /// persisted state on first attach.
    pub async fn attach(self: &Arc<Self>, workspace_id: &str, path: &str) -> Result<DocConn, Fault> {
        let doc_id = doc_id(workspace_id, path);
        let client_id = Uuid::new_v4();

        // Substrate I/O happens before the rooms lock; the extra
        // subscription is discarded when the room already exists.
        let persisted = self
            .substrate
            .get(&keys::doc(&doc_id))
            .await
            .map_err(Fault::from)?;
        let sub = self
            .substrate
            .subscribe(&keys::awareness_channel(&doc_id))
            .await
            .map_err(Fault::from)?;

        let mut rooms = self.rooms.write().await;
        if !rooms.contains_key(&doc_id) {
            let doc = yrs::Doc::new();
            if let Some(encoded) = persisted {
                match BASE64.decode(encoded.as_bytes()) {
                    Ok(bytes) => {
                        if let Ok(update) = Update::decode_v1(&bytes) {
                            let mut txn = doc.transact_mut();
                            let _ = txn.apply_update(update);
                            log::info!("loaded persisted state for doc {doc_id}");
                        }
                    }
                    Err(e) => log::error!("corrupt persisted state for doc {doc_id}: {e}"),
                }
            }
            let (tx, _) = broadcast::channel(self.config.broadcast_capacity);
            let relay_task = tokio::spawn(relay_awareness(
                sub,
                Arc::clone(&self.rooms),
                doc_id.clone(),
                self.config.node_id.clone(),
            ));
            rooms.insert(
                doc_id.clone(),
                DocRoom {
                    doc,
                    broadcast: tx,
                    awareness: HashMap::new(),
                    clients: 0,
                    persist_pending: Arc::new(AtomicBool::new(false)),
                    relay_task,
                },
            );
        }
        let room = rooms.get_mut(&doc_id).expect("room exists after insert");

        room.clients += 1;
        let rx = room.broadcast.subscribe();

        // Full state for immediate load, then the presence of current peers.
        let mut backlog = Vec::new();
        {
            let txn = room.doc.transact();
            let state = txn.encode_state_as_update_v1(&StateVector::default());
            if let Ok(bytes) = DocMessage::sync_step2(Uuid::nil(), state).encode() {
                backlog.push(bytes);
            }
        }
        for (peer, state) in &room.awareness {
            if let Ok(bytes) = DocMessage::awareness(*peer, state).encode() {
                backlog.push(bytes);
            }
        }

        if let Ok(joined) = DocMessage::peer_joined(client_id).encode() {
            let _ = room.broadcast.send(Arc::new(joined));
        }
        log::info!("client {client_id} attached to doc {doc_id}");
        Ok(DocConn {
            client_id,
            rx,
            backlog,
        })
    }

    /// Handle one protocol message; returns a direct reply when the
    /// message calls for one.
    pub async fn handle(
        self: &Arc<Self>,
        doc_id: &str,
        client_id: Uuid,
        msg: DocMessage,
    ) -> Result<Option<DocMessage>, Fault> {
        match msg.msg_type {
            DocMsgType::SyncStep1 => {
                let rooms = self.rooms.read().await;
                let room = rooms
                    .get(doc_id)
                    .ok_or_else(|| Fault::not_found(format!("document {doc_id}")))?;
                let sv = StateVector::decode_v1(&msg.payload)
                    .map_err(|e| Fault::invalid(format!("bad state vector: {e}")))?;
                let diff = {
                    let txn = room.doc.transact();
                    txn.encode_diff_v1(&sv)
                };
                Ok(Some(DocMessage::sync_step2(Uuid::nil(), diff)))
            }
            DocMsgType::Update | DocMsgType::SyncStep2 => {
                {
                    let mut rooms = self.rooms.write().await;
                    let room = rooms
                        .get_mut(doc_id)
                        .ok_or_else(|| Fault::not_found(format!("document {doc_id}")))?;
                    match Update::decode_v1(&msg.payload) {
                        Ok(update) => {
                            let mut txn = room.doc.transact_mut();
                            let _ = txn.apply_update(update);
                        }
                        Err(e) => {
                            return Err(Fault::invalid(format!("undecodable update: {e}")))
                        }
                    }
                    if let Ok(bytes) = msg.encode() {
                        let _ = room.broadcast.send(Arc::new(bytes));
                    }
                }
                self.schedule_persist(doc_id).await;
                Ok(None)
            }
            DocMsgType::Awareness => {
                let state = msg
                    .awareness_state()
                    .map_err(|e| Fault::invalid(e.to_string()))?;
                {
                    let mut rooms = self.rooms.write().await;
                    let room = rooms
                        .get_mut(doc_id)
                        .ok_or_else(|| Fault::not_found(format!("document {doc_id}")))?;
                    room.awareness.insert(client_id, state.clone());
                    if let Ok(bytes) = msg.encode() {
                        let _ = room.broadcast.send(Arc::new(bytes));
                    }
                }
                // Tagged with this node's origin marker; subscribers skip
                // their own frames to avoid applying the echo.
                let frame = AwarenessFrame {
                    origin_node: self.config.node_id.clone(),
                    client_id,
                    state: Some(state),
                };
                let _ = self
                    .substrate
                    .publish(&keys::awareness_channel(doc_id), frame.encode())
                    .await;
                Ok(None)
            }
            DocMsgType::Ping => Ok(Some(DocMessage::pong(client_id))),
            _ => {
                log::debug!("doc {doc_id}: ignoring {:?}", msg.msg_type);
                Ok(None)
            }
        }
    }

    /// Detach a client. The last local client triggers a final persist and
    /// the node unsubscribes from the awareness channel; the persisted
    /// state is retained (no TTL).
    pub async fn detach(self: &Arc<Self>, doc_id: &str, client_id: Uuid) {
        let mut final_state = None;
        {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(doc_id) else { return };
            room.clients = room.clients.saturating_sub(1);
            room.awareness.remove(&client_id);
            if let Ok(bytes) = DocMessage::peer_left(client_id).encode() {
                let _ = room.broadcast.send(Arc::new(bytes));
            }
            if room.clients == 0 {
                let txn = room.doc.transact();
                final_state = Some(txn.encode_state_as_update_v1(&StateVector::default()));
                drop(txn);
                room.relay_task.abort();
                rooms.remove(doc_id);
                log::info!("doc {doc_id}: room closed (no local clients)");
            }
        }

        let leave = AwarenessFrame {
            origin_node: self.config.node_id.clone(),
            client_id,
            state: None,
        };
        let _ = self
            .substrate
            .publish(&keys::awareness_channel(doc_id), leave.encode())
            .await;

        if let Some(state) = final_state {
            self.persist_bytes(doc_id, &state).await;
        }
    }

    /// Current presence map of a document (diagnostics and tests).
    pub async fn awareness_of(&self, doc_id: &str) -> HashMap<Uuid, AwarenessState> {
        let rooms = self.rooms.read().await;
        rooms
            .get(doc_id)
            .map(|room| room.awareness.clone())
            .unwrap_or_default()
    }

    /// Encoded state of the in-memory document.
    pub async fn encoded_state(&self, doc_id: &str) -> Option<Vec<u8>> {
        let rooms = self.rooms.read().await;
        rooms.get(doc_id).map(|room| {
            let txn = room.doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        })
    }

    /// Encoded state persisted in the substrate.
    pub async fn persisted_state(&self, doc_id: &str) -> Option<Vec<u8>> {
        let encoded = self.substrate.get(&keys::doc(doc_id)).await.ok()??;
        BASE64.decode(encoded.as_bytes()).ok()
    }

    /// Number of open rooms on this node.
    pub async fn open_docs(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Remove every persisted document of a workspace.
    pub async fn purge_workspace(&self, workspace_id: &str) -> Result<usize, Fault> {
        let prefix = format!("docs:{workspace_id}/");
        let keys = self
            .substrate
            .scan_prefix(&prefix)
            .await
            .map_err(Fault::from)?;
        let mut removed = 0;
        for key in keys {
            if self.substrate.del(&key).await.map_err(Fault::from)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Write-behind: arm one persist per debounce window.
    async fn schedule_persist(self: &Arc<Self>, doc_id: &str) {
        let pending = {
            let rooms = self.rooms.read().await;
            match rooms.get(doc_id) {
                Some(room) => Arc::clone(&room.persist_pending),
                None => return,
            }
        };
        if pending.swap(true, Ordering::SeqCst) {
            return; // A persist is already scheduled.
        }

        let service = Arc::clone(self);
        let doc_id = doc_id.to_string();
        let debounce = self.config.persist_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            pending.store(false, Ordering::SeqCst);
            let state = service.encoded_state(&doc_id).await;
            if let Some(state) = state {
                service.persist_bytes(&doc_id, &state).await;
            }
        });
    }

    async fn persist_bytes(&self, doc_id: &str, state: &[u8]) {
        let encoded = BASE64.encode(state);
        if let Err(e) = self.substrate.set(&keys::doc(doc_id), &encoded).await {
            log::error!("doc {doc_id}: persist failed: {e}");
        }
    }
}

/// Per-room relay: applies inbound awareness frames from other nodes.
async fn relay_awareness(
    mut sub: tandem_substrate::Subscription,
    rooms: Rooms,
    doc_id: String,
    node_id: String,
) {
    while let Some(event) = sub.next().await {
        let payload = match event {
            SubEvent::Message(payload) => payload,
            SubEvent::Lagged(n) => {
                log::warn!("doc {doc_id}: awareness relay lagged by {n}");
                continue;
            }
        };
        let Ok(frame) = AwarenessFrame::decode(&payload) else {
            continue;
        };
        if frame.origin_node == node_id {
            continue; // Own frame echoed back.
        }

        let mut rooms_w = rooms.write().await;
        let Some(room) = rooms_w.get_mut(&doc_id) else {
            break; // Room closed under us.
        };
        let message = match frame.state {
            Some(state) => {
                room.awareness.insert(frame.client_id, state.clone());
                DocMessage::awareness(frame.client_id, &state)
            }
            None => {
                room.awareness.remove(&frame.client_id);
                DocMessage::peer_left(frame.client_id)
            }
        };
        if let Ok(bytes) = message.encode() {
            let _ = room.broadcast.send(Arc::new(bytes));
        }
    }
}
