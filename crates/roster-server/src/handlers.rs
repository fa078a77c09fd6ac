//! Connection handlers for the roster server.
//!
//! Every WebSocket is driven through a [`GatewayConnection`]; the HTTP side
//! exposes read-only presence lookups and the fan-out entry point used by
//! other services.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::state::AppState;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use roster_core::{
    ConnectionId, EmitReport, Envelope, GatewayConnection, GatewayError, Identity, LocalDispatch,
    PrincipalKind, RegistryError,
};
use roster_protocol::{codec, codes, Frame, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/presence/:kind", get(online_handler))
        .route("/presence/:kind/:id", get(presence_handler))
        .route("/emit", post(emit_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the backends cannot be reached or the server fails
/// to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::build(config).await?);
    state.reclaim().await;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(node = %state.config.node(), "Roster server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Roster server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

/// Errors surfaced by the HTTP endpoints.
#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Unavailable(#[from] RegistryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.registry.health_check().await {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "node": state.config.node(),
            "connections": state.open_connections(),
            "version": env!("CARGO_PKG_VERSION")
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "node": state.config.node(),
                "error": e.to_string()
            })),
        )
            .into_response(),
    }
}

fn parse_kind(kind: &str) -> Result<PrincipalKind, ApiError> {
    kind.parse::<PrincipalKind>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceView {
    pub identity: String,
    pub online: bool,
    pub connections: usize,
}

async fn presence_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<PresenceView>, ApiError> {
    let identity = Identity::new(parse_kind(&kind)?, id);
    let connections = state.registry.list_connections(&identity).await?;

    Ok(Json(PresenceView {
        identity: identity.to_string(),
        online: !connections.is_empty(),
        connections: connections.len(),
    }))
}

async fn online_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let online = state
        .registry
        .online_identities(Some(parse_kind(&kind)?))
        .await?;
    Ok(Json(online.iter().map(|identity| identity.id.clone()).collect()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmitRequest {
    /// Identities in `kind:id` form.
    pub identities: Vec<String>,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

async fn emit_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmitRequest>,
) -> Result<Json<EmitReport>, ApiError> {
    let identities = request
        .identities
        .iter()
        .map(|raw| raw.parse::<Identity>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let payload = serde_json::to_vec(&request.payload)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let report = state.emitter.emit(identities, &request.event, payload).await;
    metrics::record_emit(&report);
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Ok(slot) = state.connection_slots.clone().try_acquire_owned() else {
        warn!("Connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            handle_websocket(socket, state, params.token).await;
            drop(slot);
        })
}

type WsSender = SplitSink<WebSocket, Message>;

/// Whether the read loop keeps going after a frame.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate(state.config.node());
    let mut session = state.gateway.accept(connection_id.clone());
    let mut outbound = Outbound::default();

    debug!(connection = %connection_id, "WebSocket connected");

    if let Err(e) = serve(socket, &state, &mut session, &mut outbound, token).await {
        debug!(connection = %connection_id, error = %e, "Connection ended with error");
    }

    outbound.release(&state.dispatch);
    match session.close().await {
        Ok(transition) if transition.edge => {
            debug!(connection = %connection_id, "Closed last connection of identity");
        }
        Ok(_) => {}
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Failed to unregister closed connection");
            metrics::record_error("unregister");
        }
    }

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Outbound queue of the connection's current session.
///
/// The queue is keyed by the session's handle id and replaced whenever the
/// session changes, so envelopes addressed to an earlier identity are
/// dropped with its queue.
#[derive(Default)]
struct Outbound {
    handle: Option<ConnectionId>,
    queue: Option<mpsc::Receiver<Arc<Envelope>>>,
}

impl Outbound {
    /// Follow the session's current handle.
    fn sync(&mut self, dispatch: &LocalDispatch, session: &GatewayConnection) {
        let current = session.handle().map(|handle| &handle.id);
        if self.handle.as_ref() == current {
            return;
        }
        self.release(dispatch);
        if let Some(id) = current {
            self.queue = Some(dispatch.attach(id.clone()));
            self.handle = Some(id.clone());
        }
    }

    fn release(&mut self, dispatch: &LocalDispatch) {
        if let Some(id) = self.handle.take() {
            dispatch.detach(&id);
        }
        self.queue = None;
    }

    async fn next(&mut self) -> Option<Arc<Envelope>> {
        match self.queue.as_mut() {
            Some(queue) => queue.recv().await,
            None => std::future::pending().await,
        }
    }
}

async fn serve(
    socket: WebSocket,
    state: &AppState,
    session: &mut GatewayConnection,
    outbound: &mut Outbound,
    token: Option<String>,
) -> Result<()> {
    let (mut sender, mut receiver) = socket.split();

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(session.id().as_str(), PROTOCOL_VERSION.major, heartbeat);
    send_frame(&mut sender, &connected).await?;

    if let Some(token) = token {
        let reply = login(session, outbound, &state.dispatch, 0, &token).await;
        send_frame(&mut sender, &reply).await?;
    }

    let idle = state.config.heartbeat.idle_timeout();
    let deadline = tokio::time::sleep(idle);
    tokio::pin!(deadline);

    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(envelope) = outbound.next() => {
                let frame = Frame::event(envelope.event.clone(), envelope.payload.to_vec());
                send_frame(&mut sender, &frame).await?;
            }

            () = &mut deadline => {
                debug!(connection = %session.id(), "Idle timeout");
                let frame = Frame::error(0, codes::CONNECTION_CLOSED, "idle timeout");
                send_frame(&mut sender, &frame).await?;
                return Ok(());
            }

            msg = receiver.next() => {
                deadline.as_mut().reset(Instant::now() + idle);

                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    metrics::record_frame(data.len(), "inbound");
                                    let flow = handle_frame(frame, state, session, outbound, &mut sender).await?;
                                    if flow == Flow::Close {
                                        return Ok(());
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %session.id(), error = %e, "Undecodable frame");
                                    metrics::record_error("decode");
                                    let frame = Frame::error(0, codes::INVALID_FRAME, e.to_string());
                                    send_frame(&mut sender, &frame).await?;
                                    return Ok(());
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(_))) => {
                        let frame = Frame::error(0, codes::INVALID_FRAME, "binary frames only");
                        send_frame(&mut sender, &frame).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %session.id(), "Received close frame");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        metrics::record_error("websocket");
                        return Err(e.into());
                    }
                    None => {
                        debug!(connection = %session.id(), "WebSocket stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn error_code(e: &GatewayError) -> u16 {
    match e {
        GatewayError::Authentication(_) => codes::AUTHENTICATION_FAILED,
        GatewayError::Registry(_) => codes::STORE_UNAVAILABLE,
        GatewayError::Closed => codes::CONNECTION_CLOSED,
    }
}

/// Log in and move the outbound queue to the resulting session before the
/// reply goes out.
async fn login(
    session: &mut GatewayConnection,
    outbound: &mut Outbound,
    dispatch: &LocalDispatch,
    id: u64,
    token: &str,
) -> Frame {
    let result = session.login(token).await;
    outbound.sync(dispatch, session);
    match result {
        Ok(outcome) => Frame::authenticated(id, outcome.handle.identity.to_string()),
        Err(e) => {
            if matches!(e, GatewayError::Authentication(_)) {
                metrics::record_auth_failure();
            }
            Frame::error(id, error_code(&e), e.to_string())
        }
    }
}

async fn handle_frame(
    frame: Frame,
    state: &AppState,
    session: &mut GatewayConnection,
    outbound: &mut Outbound,
    sender: &mut WsSender,
) -> Result<Flow> {
    match frame {
        Frame::Connect { version, token } => {
            if PROTOCOL_VERSION.negotiate(version).is_none() {
                warn!(connection = %session.id(), version, "Unsupported protocol version");
                let message = format!("unsupported protocol version {version}");
                send_frame(sender, &Frame::error(0, codes::UNSUPPORTED_VERSION, message)).await?;
                return Ok(Flow::Close);
            }
            if let Some(token) = token {
                let reply = login(session, outbound, &state.dispatch, 0, &token).await;
                send_frame(sender, &reply).await?;
            }
        }

        Frame::Login { id, token } => {
            let reply = login(session, outbound, &state.dispatch, id, &token).await;
            send_frame(sender, &reply).await?;
        }

        Frame::Logout { id, .. } => {
            let result = session.logout().await;
            outbound.sync(&state.dispatch, session);
            let reply = match result {
                Ok(_) => Frame::ack(id),
                Err(e) => Frame::error(id, error_code(&e), e.to_string()),
            };
            send_frame(sender, &reply).await?;
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(timestamp)).await?;
        }

        Frame::Pong { .. } => {}

        other => {
            warn!(connection = %session.id(), frame_type = ?other.frame_type(), "Unexpected frame type");
            let id = other.request_id().unwrap_or(0);
            send_frame(sender, &Frame::error(id, codes::INVALID_FRAME, "unexpected frame")).await?;
        }
    }

    Ok(Flow::Continue)
}

async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
