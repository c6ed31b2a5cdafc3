mod config;
mod correlation;
mod gateway;
mod liveness;
mod login;
#[cfg(feature = "metrics")]
mod metrics;
mod token;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";
const SOCKET_COMPONENT: &str = "socketServerAvailable";

#[cfg(feature = "metrics")]
use anyhow::Context;
use anyhow::{bail, Result};
#[cfg(feature = "metrics")]
use axum::{http::header::CONTENT_TYPE, response::IntoResponse};
use axum::{
    body::HttpBody,
    extract::{MatchedPath, State},
    http::{header::HeaderName, HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use clap::{Args, Parser, Subcommand};
use meteorelay_core::{Capability, Identity};
use serde::Serialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc, time::Duration};
#[cfg(test)]
use tokio::sync::Notify;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::field::{Field, Visit};
use tracing::{error, info, warn, Event, Level, Metadata, Subscriber};
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::fmt::{
    format::Format as FmtFormat, format::Writer as FmtWriter, writer::MakeWriter, FmtContext,
    FormatEvent, FormatFields,
};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
use std::sync::Mutex;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::{CliOverrides, LogFormat, RuntimeEnvironment, ServerConfig},
    gateway::ConnectionGateway,
    liveness::{LivenessProbe, ProbeReport, WebSocketConnector},
    login::{InMemoryUserDirectory, LoginService, UserDirectory},
    token::TokenService,
};

#[derive(Parser, Debug, Default)]
#[command(
    name = "meteorelay-server",
    version,
    about = "Authenticated telemetry relay"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    environment: Option<RuntimeEnvironment>,
    #[arg(long)]
    jwt_secret: Option<String>,
    #[arg(long)]
    jwt_ttl_secs: Option<u64>,
    #[arg(long)]
    max_connections: Option<usize>,
    #[arg(long)]
    health_attempts: Option<u32>,
    #[arg(long)]
    health_interval_ms: Option<u64>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            environment: self.environment,
            jwt_secret: self.jwt_secret,
            jwt_ttl_secs: self.jwt_ttl_secs,
            max_connections: self.max_connections,
            health_attempts: self.health_attempts,
            health_interval_ms: self.health_interval_ms,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Print a signed relay token for an identity.
    IssueToken(IssueTokenCommand),
    /// Print an argon2 hash suitable for `auth.users[].password_hash`.
    HashPassword(HashPasswordCommand),
    /// Run the liveness probe against a running relay.
    Probe(ProbeCommand),
}

#[derive(Args, Debug)]
struct IssueTokenCommand {
    /// Login embedded in the token.
    #[arg(long)]
    login: String,
    /// Capability granted to the holder (read or write).
    #[arg(long, default_value = "read")]
    role: Capability,
}

#[derive(Args, Debug)]
struct HashPasswordCommand {
    #[arg(long)]
    password: String,
}

#[derive(Args, Debug)]
struct ProbeCommand {
    /// Relay WebSocket URL; defaults to the configured listener.
    #[arg(long)]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    let config = Arc::new(config);
    run(config).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::IssueToken(cmd) => issue_token(config, cmd),
        CliCommand::HashPassword(cmd) => {
            println!("{}", login::hash_password(&cmd.password)?);
            Ok(())
        }
        CliCommand::Probe(cmd) => probe(config, cmd).await,
    }
}

/// Tokens signed with a generated secret are useless outside this process.
fn configured_token_service(config: &ServerConfig) -> Result<TokenService> {
    if config.auth.jwt_secret.is_none() {
        bail!("auth.jwt_secret must be configured for this command");
    }
    Ok(TokenService::from_config(&config.auth))
}

fn issue_token(config: &ServerConfig, cmd: IssueTokenCommand) -> Result<()> {
    let tokens = configured_token_service(config)?;
    let identity = Identity::new(cmd.login, cmd.role);
    println!("{}", tokens.issue(&identity)?);
    Ok(())
}

async fn probe(config: &ServerConfig, cmd: ProbeCommand) -> Result<()> {
    let tokens = Arc::new(configured_token_service(config)?);
    let url = match cmd.url {
        Some(url) => url,
        None => config.probe_url(config.listener_addr()?),
    };
    let connector = Arc::new(WebSocketConnector::new(config.socket.exception_event.clone()));
    let probe = LivenessProbe::new(tokens, connector, url, &config.health);
    let report = probe.check().await;
    println!("{}", serde_json::to_string(&health_body(&report))?);
    if !report.healthy {
        bail!("relay at {} is unhealthy", probe.url());
    }
    Ok(())
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no METEORELAY_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected METEORELAY_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        environment = config.environment.as_str(),
        jwt_algorithm = config.auth.algorithm.as_str(),
        jwt_ttl_secs = config.auth.jwt_ttl_secs,
        login_user_count = config.auth.users.len(),
        room = %config.socket.room_name,
        max_connections = config.socket.max_connections,
        health_attempts = config.health.attempts,
        health_interval_ms = config.health.interval_ms,
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        "resolved server configuration"
    );

    let tokens = Arc::new(TokenService::from_config(&config.auth));
    if tokens.uses_generated_secret() {
        warn!("no auth.jwt_secret supplied; generated ephemeral signing secret, tokens will not survive a restart");
    }

    let directory = InMemoryUserDirectory::from_entries(&config.auth.users);
    if directory.is_empty() {
        info!("no login users configured; /auth/login rejects every attempt");
    }

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let connector = Arc::new(WebSocketConnector::new(config.socket.exception_event.clone()));
    let probe = LivenessProbe::new(
        tokens.clone(),
        connector,
        config.probe_url(local_addr),
        &config.health,
    );

    #[cfg(feature = "metrics")]
    let metrics_ctx = if config.metrics.enabled {
        Some(MetricsContext::init()?)
    } else {
        None
    };

    let state = AppState::new(config.clone(), tokens, Arc::new(directory))
        .with_probe(Some(Arc::new(probe)));
    #[cfg(feature = "metrics")]
    let state = state.with_metrics(metrics_ctx);

    #[cfg(feature = "metrics")]
    {
        if config.metrics.enabled {
            if let Some(bind_addr) = &config.metrics.bind_addr {
                let metrics_addr: SocketAddr = bind_addr
                    .parse()
                    .context("failed to parse metrics bind addr")?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_metrics(metrics_addr, state).await {
                        error!(?err, "metrics server terminated unexpectedly");
                    }
                });
            }
        }
    }

    let app = build_app(state);
    info!("listening on {local_addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    gateway: Arc<ConnectionGateway>,
    login: Arc<LoginService>,
    probe: Option<Arc<LivenessProbe>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        tokens: Arc<TokenService>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        let gateway = Arc::new(ConnectionGateway::new(tokens.clone(), &config.socket));
        let login = Arc::new(LoginService::new(directory, tokens));
        Self {
            config,
            gateway,
            login,
            probe: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    fn with_probe(mut self, probe: Option<Arc<LivenessProbe>>) -> Self {
        self.probe = probe;
        self
    }

    #[cfg(feature = "metrics")]
    fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        let gateway = ConnectionGateway::clone(&self.gateway).with_metrics(metrics.clone());
        self.gateway = Arc::new(gateway);
        self.metrics = metrics;
        self
    }

    fn gateway(&self) -> Arc<ConnectionGateway> {
        self.gateway.clone()
    }

    fn login_service(&self) -> Arc<LoginService> {
        self.login.clone()
    }

    fn probe(&self) -> Option<Arc<LivenessProbe>> {
        self.probe.clone()
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled(&self) -> bool {
        self.config.metrics.enabled
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> Option<Arc<MetricsContext>> {
        self.metrics.clone()
    }

    fn record_http_request(&self, route: &str, status: u16) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            let status_str = status.to_string();
            metrics
                .http_requests_total
                .with_label_values(&[route, status_str.as_str()])
                .inc();
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (route, status);
        }
    }
}

fn health_body(report: &ProbeReport) -> Value {
    if report.healthy {
        json!({
            "status": "ok",
            "info": { SOCKET_COMPONENT: { "status": "up" } },
        })
    } else {
        json!({
            "status": "error",
            "error": {
                SOCKET_COMPONENT: {
                    "status": "down",
                    "exception": report.reason.as_deref().unwrap_or_default(),
                }
            },
        })
    }
}

async fn health(
    matched_path: MatchedPath,
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    let report = match state.probe() {
        Some(probe) => probe.check().await,
        None => ProbeReport::unhealthy("liveness probe not configured"),
    };
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    state.record_http_request(matched_path.as_str(), status.as_u16());
    (status, Json(health_body(&report)))
}

fn init_tracing(config: &ServerConfig) {
    // Respect RUST_LOG if set, otherwise default to info with debug for the relay.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meteorelay_server=debug"));

    let json = matches!(config.log_format(), LogFormat::Json);
    let subscriber = build_subscriber(json, env_filter);

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

async fn shutdown_signal() {
    #[cfg(test)]
    {
        let notify_opt = TEST_SHUTDOWN_NOTIFY
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        if let Some(notify) = notify_opt {
            tokio::select! {
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!(?e, "failed to install Ctrl+C handler");
                    }
                }
                _ = notify.notified() => {}
            }
            info!("shutdown signal received");
            if let Ok(mut guard) = TEST_SHUTDOWN_NOTIFY.lock() {
                *guard = None;
            }
            return;
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version(matched_path: MatchedPath, State(state): State<AppState>) -> Json<VersionResponse> {
    state.record_http_request(matched_path.as_str(), StatusCode::OK.as_u16());
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn build_app(state: AppState) -> Router {
    #[cfg(feature = "metrics")]
    let expose_metrics_here = state.metrics_enabled() && state.config.metrics.bind_addr.is_none();
    let development = state.config.is_development();

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/auth/login", post(login::login))
        .route("/ws", get(gateway::relay_socket));

    #[cfg(feature = "metrics")]
    {
        if expose_metrics_here {
            router = router.route("/metrics", get(metrics_handler));
        }
    }

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(HttpSpanMaker)
        .on_response(HttpOnResponse::new());

    let instrumentation_layers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(PropagateHeaderLayer::new(request_id_header.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .into_inner();

    let mut router = router.layer(instrumentation_layers);
    if development {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

#[derive(Clone, Default)]
struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let method = request.method().clone();
        let uri_path = request.uri().path().to_string();
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| uri_path.clone());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .map(|value| value.to_owned())
            .unwrap_or_else(|| "unknown".to_string());

        tracing::info_span!(
            "http.request",
            method = %method,
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
struct HttpOnResponse;

impl HttpOnResponse {
    fn new() -> Self {
        Self
    }
}

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: Duration,
        span: &tracing::Span,
    ) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown");

        span.record("status_code", tracing::field::display(status));
        span.record("latency_ms", tracing::field::display(latency_ms));

        tracing::debug!(
            parent: span,
            request_id = %request_id,
            status = status,
            latency_ms,
            "request completed"
        );
    }
}

#[cfg(test)]
fn build_subscriber_with_writer<W>(
    json: bool,
    env_filter: EnvFilter,
    writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    build_subscriber_inner(json, env_filter, writer)
}

fn build_subscriber(
    json: bool,
    env_filter: EnvFilter,
) -> Box<dyn tracing::Subscriber + Send + Sync> {
    build_subscriber_inner(json, env_filter, std::io::stderr)
}

/// Correlation fields captured from span attributes.
#[derive(Clone, Default)]
struct SpanTags {
    request_id: Option<String>,
    connection_id: Option<String>,
}

#[derive(Default)]
struct SpanTagVisitor {
    tags: SpanTags,
}

impl SpanTagVisitor {
    fn slot(&mut self, field: &Field) -> Option<&mut Option<String>> {
        match field.name() {
            "request_id" => Some(&mut self.tags.request_id),
            "connection_id" => Some(&mut self.tags.connection_id),
            _ => None,
        }
    }
}

impl Visit for SpanTagVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if let Some(slot) = self.slot(field) {
            *slot = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if let Some(slot) = self.slot(field) {
            if slot.is_none() {
                let rendered = format!("{value:?}");
                *slot = Some(rendered.trim_matches('"').to_string());
            }
        }
    }
}

#[derive(Default)]
struct SpanTagStorageLayer;

impl<S> Layer<S> for SpanTagStorageLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: LayerContext<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut visitor = SpanTagVisitor::default();
            attrs.record(&mut visitor);
            let tags = visitor.tags;
            if tags.request_id.is_some() || tags.connection_id.is_some() {
                span.extensions_mut().insert(tags);
            }
        }
    }
}

struct CorrelatedEventFormat<E> {
    inner: E,
}

impl<E> CorrelatedEventFormat<E> {
    fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<S, N, E> FormatEvent<S, N> for CorrelatedEventFormat<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut request_id = None;
        let mut connection_id = correlation::current();
        if let Some(scope) = ctx.event_scope() {
            for span in scope {
                let extensions = span.extensions();
                if let Some(tags) = extensions.get::<SpanTags>() {
                    if request_id.is_none() {
                        request_id = tags.request_id.clone();
                    }
                    if connection_id.is_none() {
                        connection_id = tags.connection_id.clone();
                    }
                }
            }
        }

        if let Some(request_id) = request_id {
            write!(writer, "[request_id={request_id}] ")?;
        }
        if let Some(connection_id) = connection_id {
            write!(writer, "[connection_id={connection_id}] ")?;
        }

        self.inner.format_event(ctx, writer, event)
    }
}

/// Drops info and more verbose events while the current connection asked for silence.
/// Evaluated per event, so the verdict must never be cached per callsite.
fn passes_suppression<S>(metadata: &Metadata<'_>, _ctx: &LayerContext<'_, S>) -> bool {
    !(metadata.is_event() && *metadata.level() >= Level::INFO && correlation::logs_suppressed())
}

fn build_subscriber_inner<W>(
    json: bool,
    env_filter: EnvFilter,
    make_writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    if json {
        let format = FmtFormat::default()
            .with_target(true)
            .with_level(true)
            .json();

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(SpanTagStorageLayer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .event_format(CorrelatedEventFormat::new(format))
                        .with_writer(make_writer)
                        .with_filter(dynamic_filter_fn(passes_suppression)),
                ),
        )
    } else {
        let format = FmtFormat::default().with_target(true).with_level(true);

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(SpanTagStorageLayer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .event_format(CorrelatedEventFormat::new(format))
                        .with_writer(make_writer)
                        .with_filter(dynamic_filter_fn(passes_suppression)),
                ),
        )
    }
}

#[cfg(test)]
static TEST_SHUTDOWN_NOTIFY: Lazy<Mutex<Option<Arc<Notify>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(test)]
fn install_shutdown_trigger() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    *TEST_SHUTDOWN_NOTIFY.lock().unwrap() = Some(notify.clone());
    notify
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    if !state.metrics_enabled() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(metrics) = state.metrics() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
fn build_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(feature = "metrics")]
async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let router = build_metrics_router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("metrics listening on {addr}");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{HealthConfig, UserEntry},
        login::hash_password,
        token::tests::test_token_service,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use futures::{SinkExt, StreamExt};
    use meteorelay_core::ClientFrame;
    use serial_test::serial;
    use std::io::ErrorKind;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{client::IntoClientRequest, protocol::frame::coding::CloseCode, Message as WsMessage},
        MaybeTlsStream, WebSocketStream,
    };
    use tower::ServiceExt; // for `oneshot`
    use tracing::{debug, info, warn};
    use tracing_subscriber::fmt::writer::MakeWriter;
    use tracing_subscriber::EnvFilter;

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WRITER_LOGIN: &str = "station";
    const WRITER_PASSWORD: &str = "hunter2";

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::default())
    }

    fn test_directory() -> Arc<InMemoryUserDirectory> {
        Arc::new(InMemoryUserDirectory::from_entries(&[UserEntry {
            login: WRITER_LOGIN.into(),
            password_hash: hash_password(WRITER_PASSWORD).expect("hash"),
            role: Capability::Write,
        }]))
    }

    fn test_state(config: Arc<ServerConfig>) -> AppState {
        AppState::new(config, Arc::new(test_token_service()), test_directory())
    }

    fn token_for(login: &str, role: Capability) -> String {
        test_token_service()
            .issue(&Identity::new(login, role))
            .expect("issue token")
    }

    async fn bind_test_listener() -> Option<TcpListener> {
        match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                eprintln!("skipping websocket test due to permission error: {err}");
                None
            }
            Err(err) => panic!("failed to bind test listener: {err}"),
        }
    }

    async fn spawn_relay(state: AppState) -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = bind_test_listener().await?;
        let addr = listener.local_addr().unwrap();
        let app = build_app(state);
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("websocket test server error");
        });
        Some((addr, server))
    }

    async fn connect_with_token(addr: SocketAddr, token: Option<&str>) -> WsClient {
        let url = match token {
            Some(token) => format!("ws://{addr}/ws?token={token}"),
            None => format!("ws://{addr}/ws"),
        };
        let (socket, _) = connect_async(url).await.expect("websocket handshake");
        socket
    }

    async fn next_json(socket: &mut WsClient) -> Value {
        loop {
            let message = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("frame expected")
                .expect("stream item")
                .expect("websocket frame");
            match message {
                WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected websocket message {other:?}"),
            }
        }
    }

    async fn send_frame(socket: &mut WsClient, frame: ClientFrame) {
        let text = serde_json::to_string(&frame).expect("encode frame");
        socket
            .send(WsMessage::Text(text.into()))
            .await
            .expect("send frame");
    }

    async fn joined_client(addr: SocketAddr, login: &str, role: Capability) -> WsClient {
        let token = token_for(login, role);
        let mut socket = connect_with_token(addr, Some(&token)).await;
        let connected = next_json(&mut socket).await;
        assert_eq!(connected["event"], "connect");
        assert!(connected["data"]["sid"].is_string());
        socket
    }

    #[derive(Clone, Default)]
    struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn contents(&self) -> String {
            let data = self.buffer.lock().expect("lock");
            String::from_utf8_lossy(&data).to_string()
        }
    }

    struct CaptureHandle {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureHandle;

        fn make_writer(&'a self) -> Self::Writer {
            CaptureHandle {
                buffer: self.buffer.clone(),
            }
        }
    }

    impl Write for CaptureHandle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.buffer.lock().expect("lock");
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn version_route_reports_package_version_with_security_headers() {
        let app = build_app(test_state(test_config()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/version")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        {
            let headers = response.headers();
            assert_eq!(
                headers
                    .get("content-security-policy")
                    .and_then(|value| value.to_str().ok()),
                Some(CONTENT_SECURITY_POLICY)
            );
            assert_eq!(
                headers
                    .get("referrer-policy")
                    .and_then(|value| value.to_str().ok()),
                Some(REFERRER_POLICY)
            );
            assert_eq!(
                headers
                    .get("x-content-type-options")
                    .and_then(|value| value.to_str().ok()),
                Some(X_CONTENT_TYPE_OPTIONS)
            );
            assert_eq!(
                headers
                    .get("x-frame-options")
                    .and_then(|value| value.to_str().ok()),
                Some(X_FRAME_OPTIONS)
            );
            assert!(headers.get(REQUEST_ID_HEADER).is_some());
        }
        let payload = body_json(response).await;
        assert_eq!(payload["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn request_id_is_propagated() {
        let app = build_app(test_state(test_config()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/version")
                    .header(REQUEST_ID_HEADER, "test-observability")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok()),
            Some("test-observability")
        );
    }

    #[tokio::test]
    async fn health_reports_down_without_probe() {
        let app = build_app(test_state(test_config()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let payload = body_json(response).await;
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error"][SOCKET_COMPONENT]["status"], "down");
    }

    #[tokio::test]
    async fn health_reports_up_when_relay_accepts_probe() {
        let Some(listener) = bind_test_listener().await else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let config = test_config();
        let tokens = Arc::new(test_token_service());
        let health = HealthConfig {
            interval_ms: 50,
            ..HealthConfig::default()
        };
        let probe = LivenessProbe::new(
            tokens.clone(),
            Arc::new(WebSocketConnector::new("exception")),
            config.probe_url(addr),
            &health,
        );
        let state = AppState::new(config, tokens, test_directory()).with_probe(Some(Arc::new(probe)));

        let app = build_app(state.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("test server error");
        });

        let response = build_app(state.clone())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(
            payload,
            json!({"status": "ok", "info": {"socketServerAvailable": {"status": "up"}}})
        );

        // The probe connection is closed once the check completes.
        let mut members = state.gateway().member_count().await;
        for _ in 0..40 {
            if members == 0 {
                break;
            }
            sleep(Duration::from_millis(25)).await;
            members = state.gateway().member_count().await;
        }
        assert_eq!(members, 0);

        server.abort();
    }

    #[tokio::test]
    async fn health_reports_down_when_relay_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = test_config();
        let tokens = Arc::new(test_token_service());
        let health = HealthConfig {
            interval_ms: 20,
            ..HealthConfig::default()
        };
        let probe = LivenessProbe::new(
            tokens.clone(),
            Arc::new(WebSocketConnector::new("exception")),
            config.probe_url(addr),
            &health,
        );
        let state = AppState::new(config, tokens, test_directory()).with_probe(Some(Arc::new(probe)));

        let response = build_app(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let payload = body_json(response).await;
        assert_eq!(payload["status"], "error");
        let component = &payload["error"][SOCKET_COMPONENT];
        assert_eq!(component["status"], "down");
        assert!(!component["exception"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn login_route_rejects_invalid_inputs() {
        let app = build_app(test_state(test_config()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"login": "", "password": "x".repeat(65)}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "validation_error");
        let details = payload["details"].as_array().unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0]["field"], "login");
        assert_eq!(details[1]["field"], "password");
    }

    #[tokio::test]
    async fn login_route_returns_unauthorized_on_invalid_credentials() {
        let app = build_app(test_state(test_config()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"login": WRITER_LOGIN, "password": "wrong"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "invalid_credentials");
    }

    #[tokio::test]
    async fn login_route_returns_token_on_success() {
        let app = build_app(test_state(test_config()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"login": WRITER_LOGIN, "password": WRITER_PASSWORD}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        let token = payload["access_token"].as_str().unwrap();
        let identity = test_token_service().decode(token).unwrap();
        assert_eq!(identity, Identity::new(WRITER_LOGIN, Capability::Write));
    }

    #[tokio::test]
    async fn websocket_without_credential_is_rejected() {
        let Some((addr, server)) = spawn_relay(test_state(test_config())).await else {
            return;
        };

        let mut socket = connect_with_token(addr, None).await;
        let exception = next_json(&mut socket).await;
        assert_eq!(
            exception,
            json!({"event": "exception", "data": {"status": "ws_error", "message": "No auth token provided"}})
        );
        let closing = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("close expected");
        match closing {
            Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Policy),
            other => panic!("expected policy close, got {other:?}"),
        }

        server.abort();
    }

    #[tokio::test]
    async fn websocket_with_invalid_credential_is_rejected() {
        let Some((addr, server)) = spawn_relay(test_state(test_config())).await else {
            return;
        };

        let mut socket = connect_with_token(addr, Some("not-a-token")).await;
        let exception = next_json(&mut socket).await;
        assert_eq!(exception["data"]["status"], "ws_error");
        assert_eq!(exception["data"]["message"], "Invalid token");

        server.abort();
    }

    #[tokio::test]
    async fn websocket_accepts_bearer_header() {
        let Some((addr, server)) = spawn_relay(test_state(test_config())).await else {
            return;
        };

        let token = token_for("viewer", Capability::Read);
        let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        let (mut socket, _) = connect_async(request).await.unwrap();
        assert_eq!(next_json(&mut socket).await["event"], "connect");

        server.abort();
    }

    #[tokio::test]
    async fn websocket_relays_to_other_members_once() {
        let state = test_state(test_config());
        let Some((addr, server)) = spawn_relay(state.clone()).await else {
            return;
        };

        let mut viewer = joined_client(addr, "viewer", Capability::Read).await;
        let mut observer = joined_client(addr, "observer", Capability::Read).await;
        let mut station = joined_client(addr, WRITER_LOGIN, Capability::Write).await;
        assert_eq!(state.gateway().member_count().await, 3);

        let payload = json!({"temperature": 7.5, "depth": 10});
        send_frame(
            &mut station,
            ClientFrame::new("emitGroundTemperature", payload.clone()).with_ack(1),
        )
        .await;

        assert_eq!(next_json(&mut station).await, json!({"ack": 1, "data": "OK"}));
        let relayed = json!({"event": "emitGroundTemperature", "data": payload});
        assert_eq!(next_json(&mut viewer).await, relayed);
        assert_eq!(next_json(&mut observer).await, relayed);

        // Neither an echo for the sender nor a duplicate for either reader.
        assert!(timeout(Duration::from_millis(200), station.next()).await.is_err());
        assert!(timeout(Duration::from_millis(200), viewer.next()).await.is_err());
        assert!(timeout(Duration::from_millis(200), observer.next()).await.is_err());

        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn websocket_writer_flooding_alone_stays_joined() {
        let state = test_state(test_config());
        let Some((addr, server)) = spawn_relay(state.clone()).await else {
            return;
        };

        let mut station = joined_client(addr, WRITER_LOGIN, Capability::Write).await;
        for amount in 0..2_000 {
            send_frame(
                &mut station,
                ClientFrame::new("emitRainfall", json!({ "amount": amount })),
            )
            .await;
        }
        send_frame(
            &mut station,
            ClientFrame::new("emitRainfall", json!({"amount": -1})).with_ack(42),
        )
        .await;

        let ack = timeout(Duration::from_secs(10), next_json(&mut station))
            .await
            .expect("ack after flood");
        assert_eq!(ack, json!({"ack": 42, "data": "OK"}));
        assert_eq!(state.gateway().member_count().await, 1);

        server.abort();
    }

    #[tokio::test]
    async fn websocket_read_member_is_denied_and_stays_connected() {
        let Some((addr, server)) = spawn_relay(test_state(test_config())).await else {
            return;
        };

        let mut observer = joined_client(addr, "observer", Capability::Read).await;
        let mut viewer = joined_client(addr, "viewer", Capability::Read).await;

        send_frame(
            &mut viewer,
            ClientFrame::new("emitRainfall", json!({"amount": 2})).with_ack(5),
        )
        .await;
        assert_eq!(
            next_json(&mut viewer).await,
            json!({"event": "exception", "data": {"status": "ws_error", "message": "Permission denied"}})
        );
        assert_eq!(next_json(&mut viewer).await, json!({"ack": 5, "data": "OK"}));
        assert!(timeout(Duration::from_millis(200), observer.next()).await.is_err());

        send_frame(
            &mut viewer,
            ClientFrame::new("emitWindMeasurement", json!({})).with_ack(6),
        )
        .await;
        assert_eq!(next_json(&mut viewer).await["data"]["message"], "Permission denied");
        assert_eq!(next_json(&mut viewer).await, json!({"ack": 6, "data": "OK"}));

        server.abort();
    }

    #[tokio::test]
    async fn websocket_rejects_when_capacity_reached() {
        let mut config = ServerConfig::default();
        config.socket.max_connections = 0;
        let Some((addr, server)) = spawn_relay(test_state(Arc::new(config))).await else {
            return;
        };

        match connect_async(format!("ws://{addr}/ws")).await {
            Ok(_) => panic!("handshake unexpectedly succeeded"),
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            }
            Err(err) => panic!("unexpected websocket error: {err:?}"),
        }

        server.abort();
    }

    #[test]
    fn build_subscriber_emits_expected_formats() {
        let json_writer = CaptureWriter::default();
        let json_subscriber =
            build_subscriber_with_writer(true, EnvFilter::new("info"), json_writer.clone());
        tracing::subscriber::with_default(json_subscriber, || {
            info!(message = "json-output");
        });
        let json_output = json_writer.contents();
        assert!(json_output.contains("\"message\":\"json-output\""));

        let compact_writer = CaptureWriter::default();
        let compact_subscriber =
            build_subscriber_with_writer(false, EnvFilter::new("info"), compact_writer.clone());
        tracing::subscriber::with_default(compact_subscriber, || {
            info!("compact-output");
        });
        let compact_output = compact_writer.contents();
        assert!(compact_output.contains("compact-output"));
        assert!(!compact_output.contains("\"compact-output\""));
    }

    #[tokio::test]
    async fn connection_logs_carry_correlation_id() {
        let writer = CaptureWriter::default();
        let subscriber = build_subscriber_with_writer(false, EnvFilter::new("debug"), writer.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        correlation::with_correlation("conn-42", async {
            tokio::task::yield_now().await;
            info!("relayed from inside connection");
        })
        .await;
        info!("outside any connection");

        let output = writer.contents();
        let inside = output
            .lines()
            .find(|line| line.contains("relayed from inside connection"))
            .expect("inside line");
        assert!(inside.contains("[connection_id=conn-42]"));
        let outside = output
            .lines()
            .find(|line| line.contains("outside any connection"))
            .expect("outside line");
        assert!(!outside.contains("connection_id="));
    }

    #[tokio::test]
    async fn suppressed_connections_only_log_warnings_and_errors() {
        let writer = CaptureWriter::default();
        let subscriber = build_subscriber_with_writer(false, EnvFilter::new("debug"), writer.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let session = correlation::with_correlation("health-1", async {
            debug!("suppressed debug line");
            info!("suppressed info line");
            warn!("kept warning line");
        });
        correlation::with_log_suppression(true, session).await;
        info!("unrelated info line");

        let output = writer.contents();
        assert!(!output.contains("suppressed debug line"));
        assert!(!output.contains("suppressed info line"));
        assert!(output.contains("kept warning line"));
        assert!(output.contains("unrelated info line"));
    }

    #[test]
    #[serial]
    fn init_tracing_tolerates_multiple_invocations() {
        let config = ServerConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }

    #[tokio::test]
    #[serial]
    async fn server_shuts_down_when_triggered() {
        if bind_test_listener().await.is_none() {
            return;
        }
        let notify = install_shutdown_trigger();
        let mut config = ServerConfig::default();
        config.bind_addr = Some("127.0.0.1:0".into());
        let config = Arc::new(config);

        let handle = tokio::spawn(run(config));

        sleep(Duration::from_millis(50)).await;
        notify.notify_one();

        let join = timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not shut down in time");
        join.expect("server task panicked")
            .expect("server returned error");
    }

    #[test]
    fn cli_overrides_convert_and_apply() {
        let cli = Cli::parse_from(vec![
            "meteorelay-server",
            "--bind-addr",
            "127.0.0.1:5000",
            "--host",
            "127.0.0.1",
            "--port",
            "5000",
            "--log-format",
            "json",
            "--environment",
            "production",
            "--jwt-secret",
            "cli-secret",
            "--jwt-ttl-secs",
            "60",
            "--max-connections",
            "8",
            "--health-attempts",
            "3",
            "--health-interval-ms",
            "250",
            "--metrics-enabled",
            "true",
            "--metrics-bind-addr",
            "127.0.0.1:9100",
        ]);

        let overrides = cli.config.into_overrides();
        let mut config = ServerConfig::default();
        config.apply_overrides(&overrides).expect("overrides apply");

        assert_eq!(config.bind_addr.as_deref(), Some("127.0.0.1:5000"));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5000);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.environment, RuntimeEnvironment::Production);
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("cli-secret"));
        assert_eq!(config.auth.jwt_ttl_secs, 60);
        assert_eq!(config.socket.max_connections, 8);
        assert_eq!(config.health.attempts, 3);
        assert_eq!(config.health.interval_ms, 250);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.bind_addr.as_deref(), Some("127.0.0.1:9100"));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from(["meteorelay-server", "issue-token", "--login", "station", "--role", "write"]);
        match cli.command {
            Some(CliCommand::IssueToken(cmd)) => {
                assert_eq!(cmd.login, "station");
                assert_eq!(cmd.role, Capability::Write);
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["meteorelay-server", "issue-token", "--login", "x", "--role", "admin"]).is_err());
    }

    #[test]
    fn issue_token_requires_configured_secret() {
        let config = ServerConfig::default();
        let err = issue_token(
            &config,
            IssueTokenCommand {
                login: "station".into(),
                role: Capability::Read,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("auth.jwt_secret"));
    }

    #[test]
    fn health_body_matches_wire_shape() {
        assert_eq!(
            health_body(&ProbeReport::unhealthy("Socket server not available")),
            json!({"status": "error", "error": {"socketServerAvailable": {"status": "down", "exception": "Socket server not available"}}})
        );
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled_config() -> Arc<ServerConfig> {
        let mut config = ServerConfig::default();
        config.metrics.enabled = true;
        Arc::new(config)
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn metrics_route_exposed_when_enabled() {
        let metrics_ctx = MetricsContext::init().expect("metrics init");
        let state = test_state(metrics_enabled_config()).with_metrics(Some(metrics_ctx));

        build_app(state.clone())
            .oneshot(Request::builder().uri("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let response = build_app(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("meteorelay_http_requests_total"));
        assert!(text.contains("meteorelay_ws_connections_active"));
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn metrics_route_absent_when_disabled() {
        let app = build_app(test_state(test_config()));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn metrics_route_served_on_dedicated_listener_when_configured() {
        let metrics_ctx = MetricsContext::init().expect("metrics init");
        let mut config = ServerConfig::default();
        config.metrics.enabled = true;
        config.metrics.bind_addr = Some("127.0.0.1:0".into());
        let state = test_state(Arc::new(config)).with_metrics(Some(metrics_ctx));

        let response = build_app(state.clone())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = build_metrics_router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
