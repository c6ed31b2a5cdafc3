use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use meteorelay_core::{
    AckFrame, ClientFrame, ExceptionPayload, Identity, RelayEvent, ServerFrame,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        OwnedSemaphorePermit, RwLock, Semaphore,
    },
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::SocketConfig,
    correlation,
    token::{ConnectionRequest, TokenError, TokenService},
    AppState,
};

/// Handshake header asking the relay to drop info/debug lines for the connection.
pub const SUPPRESS_LOGS_HEADER: &str = "x-suppress-logs";
pub const PERMISSION_DENIED_MESSAGE: &str = "Permission denied";
const MALFORMED_FRAME_MESSAGE: &str = "Malformed frame";
const INTERNAL_ERROR_MESSAGE: &str = "Internal error";
const MEMBER_QUEUE_CAPACITY: usize = 256;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] TokenError),
    #[error("{}", PERMISSION_DENIED_MESSAGE)]
    PermissionDenied,
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("unexpected failure: {0}")]
    Unexpected(#[from] anyhow::Error),
}

impl GatewayError {
    /// The `{status, message}` body the offending client receives.
    pub fn exception(&self) -> ExceptionPayload {
        match self {
            GatewayError::Auth(TokenError::Signing(_)) => {
                ExceptionPayload::error(INTERNAL_ERROR_MESSAGE)
            }
            GatewayError::Auth(err) => ExceptionPayload::ws_error(err.to_string()),
            GatewayError::PermissionDenied => ExceptionPayload::ws_error(PERMISSION_DENIED_MESSAGE),
            GatewayError::MalformedFrame(_) => ExceptionPayload::error(MALFORMED_FRAME_MESSAGE),
            GatewayError::Unexpected(_) => ExceptionPayload::error(INTERNAL_ERROR_MESSAGE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Joined,
    AuthFailed,
    Closed,
}

/// One client session as seen by the gateway task that owns it.
#[derive(Debug)]
pub struct Connection {
    id: String,
    identity: Option<Identity>,
    state: ConnectionState,
}

impl Connection {
    fn accept() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identity: None,
            state: ConnectionState::Connecting,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(from = ?self.state, to = ?next, "connection state changed");
        self.state = next;
    }

    fn join(&mut self, identity: Identity) {
        self.identity = Some(identity);
        self.transition(ConnectionState::Joined);
    }
}

/// A relayed event as it travels through the room, serialized once.
#[derive(Debug)]
pub struct RoomMessage {
    origin: String,
    event: RelayEvent,
    text: String,
}

impl RoomMessage {
    fn new(origin: &str, event: RelayEvent, data: Value) -> Result<Self, GatewayError> {
        let frame = ServerFrame::new(event.as_str(), data);
        let text = serde_json::to_string(&frame).map_err(|err| anyhow!(err))?;
        Ok(Self {
            origin: origin.to_string(),
            event,
            text,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Ack(AckFrame),
    Event(ServerFrame),
}

/// Outbound queues of a room's members, keyed by connection id.
type RoomMembers = HashMap<String, mpsc::Sender<Arc<RoomMessage>>>;

#[derive(Clone)]
pub struct ConnectionGateway {
    tokens: Arc<TokenService>,
    rooms: Arc<RwLock<HashMap<String, RoomMembers>>>,
    semaphore: Arc<Semaphore>,
    room_name: String,
    exception_event: String,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl ConnectionGateway {
    pub fn new(tokens: Arc<TokenService>, config: &SocketConfig) -> Self {
        Self {
            tokens,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            room_name: config.room_name.clone(),
            exception_event: config.exception_event.clone(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    #[cfg(test)]
    pub fn tokens(&self) -> Arc<TokenService> {
        self.tokens.clone()
    }

    /// Extract, verify and decode the credential presented on the handshake.
    pub fn authenticate(&self, request: &ConnectionRequest) -> Result<Identity, GatewayError> {
        let credential = self.tokens.extract_from_connection_request(request)?;
        self.tokens.verify(&credential)?;
        Ok(self.tokens.decode(&credential)?)
    }

    /// Guard, handler and error filter for one inbound text frame. Returns the
    /// frames owed to the sender.
    pub async fn dispatch(&self, connection: &Connection, raw: &str) -> Vec<Reply> {
        let frame: ClientFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                let err = GatewayError::from(err);
                warn!(error = %err, "discarding malformed frame");
                return vec![self.exception_reply(&err)];
            }
        };

        let Some(event) = RelayEvent::from_name(&frame.event) else {
            debug!(event = %frame.event, "ignoring unrecognized event");
            return Vec::new();
        };

        let mut replies = Vec::new();
        match self.relay(connection, event, frame.data).await {
            Ok(_) => {}
            Err(GatewayError::PermissionDenied) => {
                let login = connection.identity().map(|identity| identity.login.as_str());
                warn!(login = ?login, event = event.as_str(), "relay denied: identity lacks write capability");
                self.record_relay(event, "denied");
                replies.push(self.exception_reply(&GatewayError::PermissionDenied));
            }
            Err(err) => {
                error!(event = event.as_str(), error = ?err, "failed to process relay event");
                self.record_relay(event, "failed");
            }
        }

        if let Some(id) = frame.id {
            replies.push(Reply::Ack(AckFrame::ok(id)));
        }
        replies
    }

    async fn relay(
        &self,
        connection: &Connection,
        event: RelayEvent,
        data: Value,
    ) -> Result<usize, GatewayError> {
        let identity = connection
            .identity()
            .ok_or_else(|| anyhow!("connection {} has no attached identity", connection.id()))?;
        if !identity.can_emit() {
            return Err(GatewayError::PermissionDenied);
        }

        let message = Arc::new(RoomMessage::new(connection.id(), event, data)?);
        let recipients = self.broadcast(&self.room_name, message).await;
        debug!(
            event = event.as_str(),
            login = %identity.login,
            room = %self.room_name,
            recipients,
            "relayed event to room"
        );
        self.record_relay(event, "relayed");
        Ok(recipients)
    }

    fn exception_reply(&self, err: &GatewayError) -> Reply {
        Reply::Event(ServerFrame::exception(
            self.exception_event.as_str(),
            &err.exception(),
        ))
    }

    /// Queues the message for every member except its origin. A member whose
    /// queue is full misses this message but stays joined.
    async fn broadcast(&self, room: &str, message: Arc<RoomMessage>) -> usize {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for (member, queue) in members {
            if *member == message.origin {
                continue;
            }
            match queue.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        member = %member,
                        event = message.event.as_str(),
                        "member queue full; dropping relayed event"
                    );
                    self.record_relay(message.event, "dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    async fn subscribe(&self, room: &str, member: &str) -> mpsc::Receiver<Arc<RoomMessage>> {
        let (queue, rx) = mpsc::channel(MEMBER_QUEUE_CAPACITY);
        self.rooms
            .write()
            .await
            .entry(room.to_string())
            .or_default()
            .insert(member.to_string(), queue);
        rx
    }

    async fn leave(&self, room: &str, member: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(member);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    pub async fn member_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .get(&self.room_name)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn open_websocket(
        self: Arc<Self>,
        request: ConnectionRequest,
        suppress_logs: bool,
        ws: WebSocketUpgrade,
    ) -> Response {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => ws.on_upgrade(move |socket| async move {
                let connection = Connection::accept();
                let id = connection.id.clone();
                let session = self.run_socket(connection, socket, request, permit);
                correlation::with_log_suppression(
                    suppress_logs,
                    correlation::with_correlation(id, session),
                )
                .await
            }),
            Err(_) => {
                warn!("rejecting websocket upgrade: connection limit reached");
                (StatusCode::TOO_MANY_REQUESTS, "connection limit reached").into_response()
            }
        }
    }

    async fn run_socket(
        self: Arc<Self>,
        mut connection: Connection,
        mut socket: WebSocket,
        request: ConnectionRequest,
        _permit: OwnedSemaphorePermit,
    ) {
        connection.transition(ConnectionState::Authenticating);
        info!("starting connection");

        let identity = match self.authenticate(&request) {
            Ok(identity) => identity,
            Err(err) => {
                connection.transition(ConnectionState::AuthFailed);
                info!(reason = %err, "socket forced to disconnect");
                self.reject(&mut socket, &err).await;
                connection.transition(ConnectionState::Closed);
                return;
            }
        };

        let mut rx = self.subscribe(&self.room_name, connection.id()).await;
        info!(
            login = %identity.login,
            role = %identity.role,
            room = %self.room_name(),
            "identity joined room"
        );
        connection.join(identity);
        self.record_connection_delta(1);

        if send_text(&mut socket, &ServerFrame::connected(connection.id())).await {
            self.serve(&connection, &mut socket, &mut rx).await;
        }

        self.leave(&self.room_name, connection.id()).await;
        drop(rx);
        self.record_connection_delta(-1);
        connection.transition(ConnectionState::Closed);
        let login = connection.identity().map(|identity| identity.login.as_str());
        let remaining = self.member_count().await;
        info!(login = ?login, remaining, "identity disconnected");
    }

    async fn serve(
        &self,
        connection: &Connection,
        socket: &mut WebSocket,
        rx: &mut mpsc::Receiver<Arc<RoomMessage>>,
    ) {
        loop {
            tokio::select! {
                queued = rx.recv() => {
                    let Some(message) = queued else { break };
                    let outbound = WsMessage::Text(message.text.clone().into());
                    if timeout(SEND_TIMEOUT, socket.send(outbound)).await.map_or(true, |res| res.is_err()) {
                        warn!(event = message.event.as_str(), "websocket send failed or timed out");
                        break;
                    }
                }
                message = socket.recv() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            let replies = correlation::with_correlation(
                                connection.id(),
                                self.dispatch(connection, text.as_str()),
                            )
                            .await;
                            let mut failed = false;
                            for reply in &replies {
                                if !send_text(socket, reply).await {
                                    failed = true;
                                    break;
                                }
                            }
                            if failed {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            debug!("ignoring non-text frame");
                        }
                        Some(Err(err)) => {
                            error!(error = %err, "websocket receive failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn reject(&self, socket: &mut WebSocket, err: &GatewayError) {
        let frame = ServerFrame::exception(self.exception_event.as_str(), &err.exception());
        debug!(event = %self.exception_event, message = %err, "emitting exception");
        send_text(socket, &frame).await;
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: err.to_string().into(),
            })))
            .await;
    }

    fn record_relay(&self, event: RelayEvent, outcome: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_relay(event.as_str(), outcome);
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (event, outcome);
        }
    }

    fn record_connection_delta(&self, delta: i64) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.ws_connections_active.add(delta);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = delta;
    }
}

async fn send_text<T: Serialize>(socket: &mut WebSocket, payload: &T) -> bool {
    let text = match serde_json::to_string(payload) {
        Ok(text) => text,
        Err(err) => {
            error!(error = %err, "failed to encode outbound frame");
            return false;
        }
    };
    match timeout(SEND_TIMEOUT, socket.send(WsMessage::Text(text.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(error = %err, "websocket send failed");
            false
        }
        Err(_) => {
            warn!("websocket send timeout");
            false
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    pub token: Option<String>,
}

fn suppress_logs_requested(headers: &HeaderMap) -> bool {
    headers
        .get(SUPPRESS_LOGS_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub async fn relay_socket(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let suppress_logs = suppress_logs_requested(&headers);
    let request = ConnectionRequest::new(query.token, headers);
    state.gateway().open_websocket(request, suppress_logs, ws)
}
