//! HTTP/WS surface of a node.
//!
//! Static dispatch by URL prefix: `/v1/simulations/*` → the simulation
//! service, `/v1/signaling` → the signaling hub, `/v1/documents/*` → the
//! document service. Clients are not pinned to nodes; cross-node
//! addressability is the relay fabric's job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tandem_core::{Fault, FaultKind, NodeConfig};
use tandem_docs::{doc_id, DocConfig, DocMessage, DocService};
use tandem_signal::{Envelope, SignalConfig, SignalHub};
use tandem_sim::{
    kinematic_factory, ControlVerb, CreateSession, ExecRequest, SimConfig, SimService, StreamEvent,
    StreamItem,
};
use tandem_substrate::Substrate;

use crate::auth::{Claims, TokenVerifier};
use crate::cache::ResponseCache;
use crate::limit::{RateLimiter, RouteClass};

/// Response cache TTL for read-heavy GETs.
const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Fault carried out of a handler; maps the taxonomy onto status codes.
pub struct ApiError(pub Fault);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            FaultKind::NotFound => StatusCode::NOT_FOUND,
            FaultKind::AlreadyExists | FaultKind::Busy | FaultKind::InvalidTransition => {
                StatusCode::CONFLICT
            }
            FaultKind::InvalidInput => StatusCode::BAD_REQUEST,
            FaultKind::Unauthorized => StatusCode::UNAUTHORIZED,
            FaultKind::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            FaultKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            FaultKind::Degraded | FaultKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            FaultKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": {
                "kind": self.0.kind.as_str(),
                "message": self.0.message,
                "retriable": self.0.retriable(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<Fault> for ApiError {
    fn from(fault: Fault) -> Self {
        Self(fault)
    }
}

/// One node's assembled services plus the edge policies.
#[derive(Clone)]
pub struct Gateway {
    pub sim: Arc<SimService>,
    pub hub: Arc<SignalHub>,
    pub docs: Arc<DocService>,
    pub auth: TokenVerifier,
    pub limiter: RateLimiter,
    pub cache: ResponseCache,
    pub substrate: Substrate,
    pub node_id: String,
}

impl Gateway {
    pub fn new(substrate: Substrate, config: &NodeConfig) -> Self {
        Self {
            sim: SimService::new(
                substrate.clone(),
                SimConfig::from_node(config),
                kinematic_factory(),
            ),
            hub: SignalHub::new(substrate.clone(), SignalConfig::from_node(config)),
            docs: DocService::new(substrate.clone(), DocConfig::from_node(config)),
            auth: TokenVerifier::new(substrate.clone(), &config.auth_secret),
            limiter: RateLimiter::new(substrate.clone()),
            cache: ResponseCache::new(substrate.clone(), RESPONSE_CACHE_TTL),
            substrate,
            node_id: config.node_id.clone(),
        }
    }

    /// Replace the rate limiter (tests configure tight buckets).
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/v1/simulations/create", post(create_sim))
            .route("/v1/simulations/{session_id}", delete(delete_sim))
            .route("/v1/simulations/{session_id}/execute", post(execute_code))
            .route("/v1/simulations/{session_id}/state", get(session_state))
            .route("/v1/simulations/{session_id}/stream", get(stream_ws))
            .route("/v1/signaling", get(signaling_ws))
            .route("/v1/documents/{workspace_id}/{*path}", get(document_ws))
            .with_state(self)
    }
}

/// Resolve the bearer token (header or `?token=` for WebSockets), verify
/// it, and spend one unit of the route class budget.
async fn authorize(
    gateway: &Gateway,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    class: RouteClass,
) -> Result<Claims, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query.get("token").cloned())
        .ok_or_else(|| ApiError(Fault::new(FaultKind::Unauthorized, "missing bearer token")))?;
    let claims = gateway.auth.verify(&token).await.map_err(ApiError)?;
    gateway.limiter.check(&claims.sub, class).await?;
    Ok(claims)
}

async fn health(State(gateway): State<Gateway>) -> Json<serde_json::Value> {
    let hub = gateway.hub.stats().await;
    let substrate = gateway.substrate.stats().await;
    Json(serde_json::json!({
        "status": "healthy",
        "node_id": gateway.node_id,
        "active_simulations": gateway.sim.local_sessions().await,
        "signaling_connections": hub.connections,
        "signaling_rooms": hub.rooms,
        "open_documents": gateway.docs.open_docs().await,
        "substrate_channels": substrate.active_channels,
    }))
}

async fn create_sim(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Json(body): Json<CreateSession>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&gateway, &headers, &HashMap::new(), RouteClass::Api).await?;
    gateway.sim.create(body).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"status": "created"})),
    ))
}

async fn delete_sim(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&gateway, &headers, &HashMap::new(), RouteClass::Api).await?;
    let outcome = gateway.sim.delete(&session_id).await?;
    Ok(Json(serde_json::json!({"status": outcome.as_str()})))
}

async fn execute_code(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<ExecRequest>,
) -> Result<Json<tandem_sim::ExecOutcome>, ApiError> {
    authorize(&gateway, &headers, &HashMap::new(), RouteClass::Api).await?;
    let outcome = gateway.sim.execute(&session_id, body).await?;
    Ok(Json(outcome))
}

async fn session_state(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let claims = authorize(&gateway, &headers, &HashMap::new(), RouteClass::Api).await?;

    let route = format!("/v1/simulations/{session_id}/state");
    let x_cache = HeaderName::from_static("x-cache");
    if let Some(body) = gateway.cache.get(&route, "", &claims.sub).await {
        return Ok((
            [
                (header::CONTENT_TYPE, "application/json"),
                (x_cache, "hit"),
            ],
            body,
        )
            .into_response());
    }

    let snapshot = gateway.sim.get_state(&session_id).await?;
    let body = serde_json::to_string(&snapshot).map_err(|e| ApiError(Fault::internal(e.to_string())))?;
    gateway.cache.put(&route, "", &claims.sub, &body).await;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (x_cache, "miss"),
        ],
        body,
    )
        .into_response())
}

async fn stream_ws(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authorize(&gateway, &headers, &query, RouteClass::Stream).await?;
    // Reject unknown sessions before upgrading.
    gateway.sim.get_state(&session_id).await?;
    let from_frame = query.get("from_frame").and_then(|v| v.parse().ok());
    Ok(ws.on_upgrade(move |socket| stream_pump(gateway, socket, session_id, from_frame)))
}

async fn stream_pump(
    gateway: Gateway,
    socket: WebSocket,
    session_id: String,
    from_frame: Option<u64>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut stream = match gateway.sim.subscribe_stream(&session_id, from_frame).await {
        Ok(stream) => stream,
        Err(fault) => {
            let _ = ws_tx
                .send(Message::Text(fault_event(&fault).into()))
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(StreamItem::Frame(frame)) => {
                    if ws_tx.send(Message::Binary(frame.encode().into())).await.is_err() {
                        break;
                    }
                }
                Some(StreamItem::Exec(result)) => {
                    let event = StreamEvent::ExecResult { result };
                    let text = serde_json::to_string(&event).unwrap_or_default();
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(StreamItem::Dropped(n)) => {
                    let event = StreamEvent::Status {
                        status: "lagged".to_string(),
                        frame_index: n,
                    };
                    let text = serde_json::to_string(&event).unwrap_or_default();
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    if text == "ping" {
                        let _ = ws_tx.send(Message::Text("pong".into())).await;
                        continue;
                    }
                    let result = match ControlVerb::parse(&text) {
                        Ok(verb) => gateway.sim.send_control(&session_id, verb).await,
                        Err(fault) => Err(fault),
                    };
                    if let Err(fault) = result {
                        let _ = ws_tx.send(Message::Text(fault_event(&fault).into())).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            },
        }
    }
    stream.detach();
    log::debug!("stream subscriber for {session_id} detached");
}

async fn signaling_ws(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authorize(&gateway, &headers, &query, RouteClass::Signal).await?;
    Ok(ws.on_upgrade(move |socket| signal_pump(gateway, socket)))
}

async fn signal_pump(gateway: Gateway, socket: WebSocket) {
    let mut conn = gateway.hub.connect().await;
    let client_id = conn.client_id.clone();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            outbound = conn.rx.recv() => match outbound {
                Some(envelope) => {
                    let text = serde_json::to_string(&envelope).unwrap_or_default();
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => gateway.hub.handle(&client_id, envelope).await,
                        Err(e) => {
                            let err = Envelope::error("invalid_input", format!("bad envelope: {e}"));
                            let text = serde_json::to_string(&err).unwrap_or_default();
                            let _ = ws_tx.send(Message::Text(text.into())).await;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            },
        }
    }
    gateway.hub.disconnect(&client_id).await;
}

async fn document_ws(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Path((workspace_id, path)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authorize(&gateway, &headers, &query, RouteClass::Api).await?;
    Ok(ws.on_upgrade(move |socket| doc_pump(gateway, socket, workspace_id, path)))
}

async fn doc_pump(gateway: Gateway, socket: WebSocket, workspace_id: String, path: String) {
    let id = doc_id(&workspace_id, &path);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut conn = match gateway.docs.attach(&workspace_id, &path).await {
        Ok(conn) => conn,
        Err(fault) => {
            let _ = ws_tx.send(Message::Text(fault_event(&fault).into())).await;
            return;
        }
    };

    // Current document state plus the presence of peers already attached.
    for bytes in std::mem::take(&mut conn.backlog) {
        if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
            gateway.docs.detach(&id, conn.client_id).await;
            return;
        }
    }

    loop {
        tokio::select! {
            fanout = conn.rx.recv() => match fanout {
                Ok(bytes) => {
                    // Skip our own messages echoed back by the room.
                    if let Ok(msg) = DocMessage::decode(&bytes) {
                        if msg.client_id == conn.client_id {
                            continue;
                        }
                    }
                    if ws_tx.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("doc client {} lagged by {n}", conn.client_id);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    match DocMessage::decode(&bytes) {
                        Ok(mut msg) => {
                            // Identity is server-assigned, not client-claimed.
                            msg.client_id = conn.client_id;
                            match gateway.docs.handle(&id, conn.client_id, msg).await {
                                Ok(Some(reply)) => {
                                    if let Ok(encoded) = reply.encode() {
                                        if ws_tx.send(Message::Binary(encoded.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                Ok(None) => {}
                                Err(fault) => {
                                    let _ = ws_tx
                                        .send(Message::Text(fault_event(&fault).into()))
                                        .await;
                                }
                            }
                        }
                        Err(e) => log::warn!("undecodable document message: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            },
        }
    }
    gateway.docs.detach(&id, conn.client_id).await;
}

fn fault_event(fault: &Fault) -> String {
    serde_json::json!({
        "type": "error",
        "kind": fault.kind.as_str(),
        "message": fault.message,
        "retriable": fault.retriable(),
    })
    .to_string()
}
