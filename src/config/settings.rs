use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server, the broker backend, the push service and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub push: PushSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the WebSocket server will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Which backend carries events and presence state.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Nats,
    Redis,
    Memory,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKind::Nats => f.write_str("nats"),
            BrokerKind::Redis => f.write_str("redis"),
            BrokerKind::Memory => f.write_str("memory"),
        }
    }
}

/// Configuration settings for the broker.
///
/// `kind` and `persistence` are read once at boot and fixed for the process lifetime.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
    pub persistence: bool,
    pub nats_url: String,
    pub redis_url: String,
    pub poll_window_secs: u64,
    pub sled_path: String,
}

/// Shortest poll window handed to durable streams. Zero would make the
/// memory feed spin and turn into an unbounded Redis `BLOCK 0`.
pub const MIN_POLL_WINDOW_SECS: u64 = 1;

impl BrokerSettings {
    /// Poll window of durable stream feeds, at least [`MIN_POLL_WINDOW_SECS`].
    pub fn poll_window(&self) -> Duration {
        Duration::from_secs(self.poll_window_secs.max(MIN_POLL_WINDOW_SECS))
    }
}

/// Configuration settings for the push service and its identity headers.
#[derive(Debug, Deserialize, Clone)]
pub struct PushSettings {
    pub enable_device_support: bool,
    pub client_header: String,
    pub device_header: String,
    pub device_attribute_headers: Vec<String>,
    pub device_validation_timeout_ms: u64,
}

impl PushSettings {
    pub fn device_validation_timeout(&self) -> Duration {
        Duration::from_millis(self.device_validation_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub push: Option<PartialPushSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub kind: Option<BrokerKind>,
    pub persistence: Option<bool>,
    pub nats_url: Option<String>,
    pub redis_url: Option<String>,
    pub poll_window_secs: Option<u64>,
    pub sled_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPushSettings {
    pub enable_device_support: Option<bool>,
    pub client_header: Option<String>,
    pub device_header: Option<String>,
    pub device_attribute_headers: Option<Vec<String>>,
    pub device_validation_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            persistence: false,
            nats_url: "nats://127.0.0.1:4222".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            poll_window_secs: 60,
            sled_path: "propel_db".to_string(),
        }
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            enable_device_support: false,
            client_header: "x-client-id".to_string(),
            device_header: "x-device-id".to_string(),
            device_attribute_headers: Vec::new(),
            device_validation_timeout_ms: 1000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            broker: BrokerSettings::default(),
            push: PushSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
