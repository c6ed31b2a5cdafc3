#![cfg(feature = "metrics")]

use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub ws_connections_active: IntGauge,
    pub relay_events_total: IntCounterVec,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "meteorelay_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let ws_connections_active = IntGauge::new(
            "meteorelay_ws_connections_active",
            "Authenticated relay connections currently joined to the room",
        )?;
        registry.register(Box::new(ws_connections_active.clone()))?;

        let relay_events_total = IntCounterVec::new(
            Opts::new(
                "meteorelay_relay_events_total",
                "Inbound relay events, labeled by event name and outcome",
            ),
            &["event", "outcome"],
        )?;
        registry.register(Box::new(relay_events_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            ws_connections_active,
            relay_events_total,
        }))
    }

    pub fn record_relay(&self, event: &str, outcome: &str) {
        self.relay_events_total
            .with_label_values(&[event, outcome])
            .inc();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
