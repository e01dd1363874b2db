//! The `persistence` module holds the device presence store.
//!
//! Presence entries are keyed by client id; each field is a device id and
//! each value the device's attributes as opaque bytes (a JSON object in
//! practice). Backends pick their own encoding for the per-client map.
//!
//! A client with no entry loads as an empty map, never as an error.

pub mod memory;
pub mod nats_kv;
pub mod redis_hash;
pub mod sled_store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::config::{BrokerKind, BrokerSettings};
use crate::utils::Result;

pub use memory::MemoryPresenceStore;
pub use nats_kv::NatsKvStore;
pub use redis_hash::RedisHashStore;
pub use sled_store::SledPresenceStore;

/// Device presence keyed by client id.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Records (or overwrites) one device of a client.
    async fn store(&self, client_id: &str, device_id: &str, attributes: Bytes) -> Result<()>;

    /// Every device recorded for the client.
    async fn load(&self, client_id: &str) -> Result<HashMap<String, Bytes>>;

    /// Removes the listed devices. An empty list is a no-op.
    async fn delete(&self, client_id: &str, device_ids: &[String]) -> Result<()>;
}

/// Builds the presence backend matching the broker selection.
pub async fn connect(settings: &BrokerSettings) -> Result<Arc<dyn PresenceStore>> {
    let store: Arc<dyn PresenceStore> = match settings.kind {
        BrokerKind::Redis => Arc::new(RedisHashStore::connect(&settings.redis_url).await?),
        BrokerKind::Nats => Arc::new(NatsKvStore::connect(&settings.nats_url).await?),
        BrokerKind::Memory if settings.persistence => {
            Arc::new(SledPresenceStore::open(&settings.sled_path)?)
        }
        BrokerKind::Memory => Arc::new(MemoryPresenceStore::new()),
    };
    info!(store = store.name(), "initialised presence store");
    Ok(store)
}
