//! Active end-to-end liveness check.
//!
//! The probe issues a credential for a synthetic read-only identity, connects
//! to the relay the way any client would and waits for the `connect` frame.
//! It never returns an error: every failure becomes an unhealthy [`ProbeReport`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderValue};
use futures::StreamExt;
use meteorelay_core::{Capability, ExceptionPayload, Identity, ServerFrame, CONNECT_EVENT};
use serde::Serialize;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
};
use tracing::{debug, warn};

use crate::{config::HealthConfig, gateway::SUPPRESS_LOGS_HEADER, token::TokenService};

pub const PROBE_LOGIN: &str = "health-check";
pub const UNAVAILABLE_REASON: &str = "Socket server not available";
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProbeReport {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            reason: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeState {
    Connecting,
    Established,
    Failed(String),
}

#[async_trait]
pub trait ProbeConnection: Send + Sync {
    fn state(&self) -> ProbeState;
    async fn close(&mut self);
}

/// Opens probing connections. Opening never fails; problems surface through
/// [`ProbeConnection::state`].
#[async_trait]
pub trait ProbeConnector: Send + Sync {
    async fn open(&self, url: &str, credential: &str) -> Box<dyn ProbeConnection>;
}

pub struct LivenessProbe {
    tokens: Arc<TokenService>,
    connector: Arc<dyn ProbeConnector>,
    url: String,
    attempts: u32,
    interval: Duration,
}

impl LivenessProbe {
    pub fn new(
        tokens: Arc<TokenService>,
        connector: Arc<dyn ProbeConnector>,
        url: impl Into<String>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            tokens,
            connector,
            url: url.into(),
            attempts: config.attempts,
            interval: config.interval(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn check(&self) -> ProbeReport {
        let identity = Identity::new(PROBE_LOGIN, Capability::Read);
        let credential = match self.tokens.issue(&identity) {
            Ok(credential) => credential,
            Err(err) => {
                warn!(error = %err, "liveness probe could not issue a credential");
                return ProbeReport::unhealthy(err.to_string());
            }
        };

        let mut connection = self.connector.open(&self.url, &credential).await;
        let report = self.await_established(connection.as_ref()).await;
        connection.close().await;
        report
    }

    async fn await_established(&self, connection: &dyn ProbeConnection) -> ProbeReport {
        for attempt in 1..=self.attempts {
            sleep(self.interval).await;
            match connection.state() {
                ProbeState::Established => {
                    debug!(attempt, "liveness probe established");
                    return ProbeReport::healthy();
                }
                ProbeState::Failed(reason) => {
                    warn!(attempt, %reason, url = %self.url, "liveness probe connection failed");
                    return ProbeReport::unhealthy(reason);
                }
                ProbeState::Connecting => {
                    debug!(attempt, "liveness probe still connecting");
                }
            }
        }
        warn!(attempts = self.attempts, url = %self.url, "liveness probe exhausted attempts");
        ProbeReport::unhealthy(UNAVAILABLE_REASON)
    }
}

/// Connects over a real WebSocket using tokio-tungstenite.
pub struct WebSocketConnector {
    exception_event: String,
}

impl WebSocketConnector {
    pub fn new(exception_event: impl Into<String>) -> Self {
        Self {
            exception_event: exception_event.into(),
        }
    }
}

#[async_trait]
impl ProbeConnector for WebSocketConnector {
    async fn open(&self, url: &str, credential: &str) -> Box<dyn ProbeConnection> {
        let (state_tx, state_rx) = watch::channel(ProbeState::Connecting);

        let mut request = match url.into_client_request() {
            Ok(request) => request,
            Err(err) => {
                state_tx.send_replace(ProbeState::Failed(err.to_string()));
                return Box::new(WebSocketConnection::detached(state_rx));
            }
        };
        let authorization = match HeaderValue::from_str(&format!("Bearer {credential}")) {
            Ok(value) => value,
            Err(err) => {
                state_tx.send_replace(ProbeState::Failed(err.to_string()));
                return Box::new(WebSocketConnection::detached(state_rx));
            }
        };
        request.headers_mut().insert(AUTHORIZATION, authorization);
        request
            .headers_mut()
            .insert(SUPPRESS_LOGS_HEADER, HeaderValue::from_static("true"));

        let (close_tx, close_rx) = oneshot::channel();
        let exception_event = self.exception_event.clone();
        let task = tokio::spawn(drive(request, exception_event, state_tx, close_rx));

        Box::new(WebSocketConnection {
            state: state_rx,
            close_tx: Some(close_tx),
            task: Some(task),
        })
    }
}

async fn drive(
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    exception_event: String,
    state: watch::Sender<ProbeState>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let connected = tokio::select! {
        result = connect_async(request) => result,
        _ = &mut close_rx => return,
    };
    let mut stream = match connected {
        Ok((stream, _)) => stream,
        Err(err) => {
            state.send_replace(ProbeState::Failed(err.to_string()));
            return;
        }
    };

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = stream.close(None).await;
                return;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<ServerFrame>(text.as_str()) else {
                        continue;
                    };
                    if frame.event == CONNECT_EVENT {
                        state.send_replace(ProbeState::Established);
                    } else if frame.event == exception_event {
                        let reason = serde_json::from_value::<ExceptionPayload>(frame.data)
                            .map(|payload| payload.message)
                            .unwrap_or_else(|_| UNAVAILABLE_REASON.to_string());
                        state.send_replace(ProbeState::Failed(reason));
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    state.send_if_modified(|current| match current {
                        ProbeState::Failed(_) => false,
                        _ => {
                            *current = ProbeState::Failed("connection closed".to_string());
                            true
                        }
                    });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    state.send_replace(ProbeState::Failed(err.to_string()));
                    return;
                }
            }
        }
    }
}

pub struct WebSocketConnection {
    state: watch::Receiver<ProbeState>,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketConnection {
    fn detached(state: watch::Receiver<ProbeState>) -> Self {
        Self {
            state,
            close_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl ProbeConnection for WebSocketConnection {
    fn state(&self) -> ProbeState {
        self.state.borrow().clone()
    }

    async fn close(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if timeout(CLOSE_GRACE, task).await.is_err() {
                debug!("liveness probe connection did not close in time");
            }
        }
    }
}
