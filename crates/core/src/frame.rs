//! JSON text frames exchanged over the relay WebSocket.
//!
//! Clients send [`ClientFrame`]s; the relay answers with [`AckFrame`]s for
//! frames carrying an `id` and pushes [`ServerFrame`]s for relayed events,
//! the handshake-complete signal and exceptions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name of the frame a member receives once it has joined the room.
pub const CONNECT_EVENT: &str = "connect";
/// Acknowledgement value returned for every recognized relay event.
pub const ACK_OK: &str = "OK";

/// Telemetry categories a `write` member may relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayEvent {
    AirMeasurement,
    GroundTemperature,
    WindMeasurement,
    Rainfall,
}

impl RelayEvent {
    pub const ALL: [RelayEvent; 4] = [
        RelayEvent::AirMeasurement,
        RelayEvent::GroundTemperature,
        RelayEvent::WindMeasurement,
        RelayEvent::Rainfall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayEvent::AirMeasurement => "emitAirMeasurement",
            RelayEvent::GroundTemperature => "emitGroundTemperature",
            RelayEvent::WindMeasurement => "emitWindMeasurement",
            RelayEvent::Rainfall => "emitRainfall",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl ClientFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            id: None,
        }
    }

    pub fn with_ack(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub event: String,
    pub data: Value,
}

impl ServerFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn connected(connection_id: &str) -> Self {
        Self::new(CONNECT_EVENT, serde_json::json!({ "sid": connection_id }))
    }

    pub fn exception(event: impl Into<String>, payload: &ExceptionPayload) -> Self {
        let data = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::new(event, data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub ack: u64,
    pub data: String,
}

impl AckFrame {
    pub fn ok(id: u64) -> Self {
        Self {
            ack: id,
            data: ACK_OK.to_string(),
        }
    }
}

/// `ws_error` marks expected application failures, `error` anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionStatus {
    WsError,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub status: ExceptionStatus,
    pub message: String,
}

impl ExceptionPayload {
    pub fn ws_error(message: impl Into<String>) -> Self {
        Self {
            status: ExceptionStatus::WsError,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExceptionStatus::Error,
            message: message.into(),
        }
    }
}
