use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use jsonwebtoken::Algorithm;
use meteorelay_core::Capability;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Production,
}

/// HMAC algorithms accepted for relay credentials.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum TokenAlgorithm {
    #[default]
    Hs256,
    Hs384,
    Hs512,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

/// An account allowed to obtain credentials through the login endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserEntry {
    pub login: String,
    /// Argon2 PHC string, see the `hash-password` subcommand.
    pub password_hash: String,
    pub role: Capability,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub jwt_ttl_secs: u64,
    pub algorithm: TokenAlgorithm,
    pub users: Vec<UserEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_ttl_secs: 86_400,
            algorithm: TokenAlgorithm::Hs256,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SocketConfig {
    pub room_name: String,
    pub exception_event: String,
    pub max_connections: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            room_name: "room".to_string(),
            exception_event: "exception".to_string(),
            max_connections: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    pub attempts: u32,
    pub interval_ms: u64,
    pub probe_host: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_ms: 1_000,
            probe_host: "127.0.0.1".to_string(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub environment: RuntimeEnvironment,
    pub auth: AuthConfig,
    pub socket: SocketConfig,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8081,
            log_format: LogFormat::Compact,
            environment: RuntimeEnvironment::Development,
            auth: AuthConfig::default(),
            socket: SocketConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Values supplied on the command line; they win over files and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub environment: Option<RuntimeEnvironment>,
    pub jwt_secret: Option<String>,
    pub jwt_ttl_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub health_attempts: Option<u32>,
    pub health_interval_ms: Option<u64>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "METEORELAY_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("environment", defaults.environment.as_str())?
            .set_default("auth.jwt_ttl_secs", defaults.auth.jwt_ttl_secs as i64)?
            .set_default("auth.algorithm", defaults.auth.algorithm.as_str())?
            .set_default("socket.room_name", defaults.socket.room_name.clone())?
            .set_default("health.attempts", defaults.health.attempts as i64)?
            .set_default("health.interval_ms", defaults.health.interval_ms as i64)?
            .set_default("metrics.enabled", defaults.metrics.enabled)?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Names of the `METEORELAY_SERVER__*` variables present in the environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .collect();
        keys.sort();
        keys
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(format) = overrides.log_format {
            self.log_format = format;
        }
        if let Some(environment) = overrides.environment {
            self.environment = environment;
        }
        if let Some(secret) = &overrides.jwt_secret {
            self.auth.jwt_secret = Some(secret.clone());
        }
        if let Some(ttl) = overrides.jwt_ttl_secs {
            self.auth.jwt_ttl_secs = ttl;
        }
        if let Some(max) = overrides.max_connections {
            self.socket.max_connections = max;
        }
        if let Some(attempts) = overrides.health_attempts {
            self.health.attempts = attempts;
        }
        if let Some(interval) = overrides.health_interval_ms {
            self.health.interval_ms = interval;
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    /// WebSocket URL the liveness probe dials, given the address actually bound.
    pub fn probe_url(&self, local_addr: SocketAddr) -> String {
        format!(
            "ws://{}:{}/ws",
            self.health.probe_host,
            local_addr.port()
        )
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    pub fn is_development(&self) -> bool {
        matches!(self.environment, RuntimeEnvironment::Development)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 && self.bind_addr.is_none() {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if self.auth.jwt_ttl_secs == 0 {
            return Err(ConfigError::Invalid("auth.jwt_ttl_secs must be positive".into()));
        }
        if matches!(&self.auth.jwt_secret, Some(secret) if secret.trim().is_empty()) {
            return Err(ConfigError::Invalid("auth.jwt_secret cannot be blank".into()));
        }
        if self.health.attempts == 0 {
            return Err(ConfigError::Invalid("health.attempts must be at least 1".into()));
        }
        if self.socket.room_name.trim().is_empty() {
            return Err(ConfigError::Invalid("socket.room_name cannot be blank".into()));
        }
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}

impl RuntimeEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeEnvironment::Development => "development",
            RuntimeEnvironment::Production => "production",
        }
    }
}

impl FromStr for RuntimeEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(RuntimeEnvironment::Development),
            "production" | "prod" => Ok(RuntimeEnvironment::Production),
            other => Err(format!("unsupported environment '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for RuntimeEnvironment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        RuntimeEnvironment::from_str(&value).map_err(D::Error::custom)
    }
}

impl TokenAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenAlgorithm::Hs256 => "HS256",
            TokenAlgorithm::Hs384 => "HS384",
            TokenAlgorithm::Hs512 => "HS512",
        }
    }

    pub fn jwt(&self) -> Algorithm {
        match self {
            TokenAlgorithm::Hs256 => Algorithm::HS256,
            TokenAlgorithm::Hs384 => Algorithm::HS384,
            TokenAlgorithm::Hs512 => Algorithm::HS512,
        }
    }
}

impl FromStr for TokenAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HS256" => Ok(TokenAlgorithm::Hs256),
            "HS384" => Ok(TokenAlgorithm::Hs384),
            "HS512" => Ok(TokenAlgorithm::Hs512),
            other => Err(format!("unsupported token algorithm '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for TokenAlgorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        TokenAlgorithm::from_str(&value).map_err(D::Error::custom)
    }
}
