mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerKind, BrokerSettings, LoggingSettings, PushSettings, ServerSettings, Settings,
};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct with every section filled in
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("PROPEL")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("push.device_attribute_headers")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let broker = partial.broker;
    let push = partial.push;
    let logging = partial.logging;

    Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        broker: BrokerSettings {
            kind: broker
                .as_ref()
                .and_then(|b| b.kind)
                .unwrap_or(default.broker.kind),
            persistence: broker
                .as_ref()
                .and_then(|b| b.persistence)
                .unwrap_or(default.broker.persistence),
            nats_url: broker
                .as_ref()
                .and_then(|b| b.nats_url.clone())
                .unwrap_or(default.broker.nats_url),
            redis_url: broker
                .as_ref()
                .and_then(|b| b.redis_url.clone())
                .unwrap_or(default.broker.redis_url),
            poll_window_secs: broker
                .as_ref()
                .and_then(|b| b.poll_window_secs)
                .unwrap_or(default.broker.poll_window_secs),
            sled_path: broker
                .as_ref()
                .and_then(|b| b.sled_path.clone())
                .unwrap_or(default.broker.sled_path),
        },
        push: PushSettings {
            enable_device_support: push
                .as_ref()
                .and_then(|p| p.enable_device_support)
                .unwrap_or(default.push.enable_device_support),
            client_header: push
                .as_ref()
                .and_then(|p| p.client_header.clone())
                .unwrap_or(default.push.client_header),
            device_header: push
                .as_ref()
                .and_then(|p| p.device_header.clone())
                .unwrap_or(default.push.device_header),
            device_attribute_headers: push
                .as_ref()
                .and_then(|p| p.device_attribute_headers.clone())
                .unwrap_or(default.push.device_attribute_headers),
            device_validation_timeout_ms: push
                .as_ref()
                .and_then(|p| p.device_validation_timeout_ms)
                .unwrap_or(default.push.device_validation_timeout_ms),
        },
        logging: LoggingSettings {
            level: logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    }
}
