//! CLI for Propel
//!
//! Subcommands:
//! - `server`: run the WebSocket relay
//! - `publish`: publish one event to a client, a device or a topic
//! - `devices`: list the devices of a client that answer a live ping

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use propel::config::{BrokerKind, Settings, load_config};
use propel::persistence;
use propel::pubsub::PubSub;
use propel::push::{Event, InMemoryMetrics, PushService};
use propel::transport::websocket::start_websocket_server;
use propel::utils::logging;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "propel")]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Publish an event through the configured broker
    Publish {
        /// Topic to publish to
        #[arg(long, conflicts_with = "client", required_unless_present = "client")]
        topic: Option<String>,
        /// Client to publish to
        #[arg(long)]
        client: Option<String>,
        /// Device of the client (needs device support)
        #[arg(long, requires = "client")]
        device: Option<String>,
        /// Event name
        #[arg(long)]
        event: String,
        /// Event payload; parsed as JSON, sent as a string otherwise
        #[arg(long)]
        data: String,
    },
    /// List the active devices of a client
    Devices {
        #[arg(long)]
        client: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&config.logging.level);

    let result = match cmd {
        Command::Server => run_server(config).await,
        Command::Publish {
            topic,
            client,
            device,
            event,
            data,
        } => run_publish(config, topic, client, device, event, data).await,
        Command::Devices { client } => run_devices(config, &client).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

async fn build_service(config: &Settings) -> Result<(Arc<PushService>, Arc<InMemoryMetrics>), Box<dyn Error>> {
    let pubsub = Arc::new(PubSub::connect(&config.broker).await?);
    debug!(broker = pubsub.broker_name(), "pubsub ready");
    let presence = persistence::connect(&config.broker).await?;
    let metrics = Arc::new(InMemoryMetrics::new());
    let service = Arc::new(PushService::new(
        pubsub,
        presence,
        metrics.clone(),
        config.push.clone(),
    ));
    Ok((service, metrics))
}

async fn run_server(config: Settings) -> Result<(), Box<dyn Error>> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let (service, metrics) = build_service(&config).await?;
    let listener = TcpListener::bind(&addr).await?;
    info!(
        broker = %config.broker.kind,
        persistence = config.broker.persistence,
        device_support = config.push.enable_device_support,
        "starting relay"
    );

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(start_websocket_server(listener, service, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    shutdown.cancel();
    let _ = server.await;

    info!(
        connected = metrics.connected_clients(),
        sessions = metrics.completed_sessions(),
        session_secs = metrics.total_session_time().as_secs(),
        sent = metrics.total_sent(),
        received = metrics.total_received(),
        "relay stopped"
    );
    Ok(())
}

async fn run_publish(
    config: Settings,
    topic: Option<String>,
    client: Option<String>,
    device: Option<String>,
    event: String,
    data: String,
) -> Result<(), Box<dyn Error>> {
    if config.broker.kind == BrokerKind::Memory {
        warn!("memory broker only reaches subscribers in this process");
    }
    let (service, _) = build_service(&config).await?;
    let data = serde_json::from_str(&data).unwrap_or(Value::String(data));
    let event = Event::new(event, data);

    match (topic, client, device) {
        (Some(topic), _, _) => service.publish_to_topic(&topic, &event).await?,
        (None, Some(client), Some(device)) => {
            service
                .publish_to_client_with_device(&client, &device, &event)
                .await?
        }
        (None, Some(client), None) => service.publish_to_client(&client, &event).await?,
        (None, None, _) => return Err("either --topic or --client is required".into()),
    }
    info!(event = %event.name, "event published");
    Ok(())
}

async fn run_devices(config: Settings, client: &str) -> Result<(), Box<dyn Error>> {
    let (service, _) = build_service(&config).await?;
    let devices = service.get_client_active_devices(client).await?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}
