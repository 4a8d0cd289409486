use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

/// Upper bound on session lifetime; one year.
pub const MAX_SESSION_TTL_HOURS: i64 = 24 * 366;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid gateway setting: {0}")]
    InvalidGateway(String),
    #[error("invalid session setting: {0}")]
    InvalidSession(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// URL-safe base64 encoded ed25519 signing key. Generated per process when absent.
    pub signing_key: Option<String>,
    pub ttl_hours: i64,
    /// Reject realtime events and history requests that lack a valid session.
    pub required: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signing_key: None,
            ttl_hours: 24,
            required: true,
        }
    }
}

/// How message and delivery notifications reach clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every connected client receives every notification and filters locally.
    #[default]
    Broadcast,
    /// Notifications go only to connections bound to the involved identities.
    Addressed,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Broadcast => "broadcast",
            DeliveryMode::Addressed => "addressed",
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "broadcast" => Ok(DeliveryMode::Broadcast),
            "addressed" => Ok(DeliveryMode::Addressed),
            other => Err(format!("unsupported delivery mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_connections: usize,
    pub outbox_capacity: usize,
    pub send_timeout_secs: u64,
    pub delivery: DeliveryMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            outbox_capacity: 64,
            send_timeout_secs: 10,
            delivery: DeliveryMode::Broadcast,
        }
    }
}

impl GatewayConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed browser origins; `*` allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub session: SessionConfig,
    pub gateway: GatewayConfig,
    pub cors: CorsConfig,
    pub metrics: MetricsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 5000,
            log_format: LogFormat::Compact,
            database_url: None,
            session: SessionConfig::default(),
            gateway: GatewayConfig::default(),
            cors: CorsConfig::default(),
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
    pub database_url: Option<String>,
    pub session_signing_key: Option<String>,
    pub session_ttl_hours: Option<i64>,
    pub session_required: Option<bool>,
    pub delivery: Option<DeliveryMode>,
    pub max_connections: Option<usize>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "PARLEY_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cors.allowed_origins")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("session.ttl_hours", defaults.session.ttl_hours)?
            .set_default("session.required", defaults.session.required)?
            .set_default("gateway.delivery", defaults.gateway.delivery.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
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
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(key) = &overrides.session_signing_key {
            self.session.signing_key = Some(key.clone());
        }
        if let Some(ttl) = overrides.session_ttl_hours {
            self.session.ttl_hours = ttl;
        }
        if let Some(required) = overrides.session_required {
            self.session.required = required;
        }
        if let Some(delivery) = overrides.delivery {
            self.gateway.delivery = delivery;
        }
        if let Some(max) = overrides.max_connections {
            self.gateway.max_connections = max;
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        self.validate()
    }

    /// Names of the `PARLEY_SERVER__*` variables present in the environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = env::vars()
            .filter_map(|(key, _)| key.strip_prefix(&prefix).map(|rest| rest.to_ascii_lowercase()))
            .collect();
        keys.sort();
        keys
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

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if self.gateway.max_connections == 0 {
            return Err(ConfigError::InvalidGateway(
                "max_connections must be positive".into(),
            ));
        }
        if self.gateway.outbox_capacity == 0 {
            return Err(ConfigError::InvalidGateway(
                "outbox_capacity must be positive".into(),
            ));
        }
        if self.gateway.send_timeout_secs == 0 {
            return Err(ConfigError::InvalidGateway(
                "send_timeout_secs must be positive".into(),
            ));
        }
        if self.session.ttl_hours <= 0 {
            return Err(ConfigError::InvalidSession(
                "ttl_hours must be positive".into(),
            ));
        }
        if self.session.ttl_hours > MAX_SESSION_TTL_HOURS {
            return Err(ConfigError::InvalidSession(format!(
                "ttl_hours must not exceed {MAX_SESSION_TTL_HOURS}"
            )));
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
