use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::PresenceStore;
use crate::utils::Result;

/// Presence in one Redis hash per client: field = device id, value =
/// attribute bytes. HSET and HDEL are single atomic commands; Redis drops
/// the hash once its last field is deleted.
#[derive(Clone)]
pub struct RedisHashStore {
    conn: ConnectionManager,
}

impl RedisHashStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(url, "connected to redis for presence");
        Ok(Self { conn })
    }
}

#[async_trait]
impl PresenceStore for RedisHashStore {
    fn name(&self) -> &'static str {
        "redis-hash"
    }

    async fn store(&self, client_id: &str, device_id: &str, attributes: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(client_id, device_id, attributes.as_ref()).await?;
        Ok(())
    }

    async fn load(&self, client_id: &str) -> Result<HashMap<String, Bytes>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, Vec<u8>> = conn.hgetall(client_id).await?;
        Ok(raw
            .into_iter()
            .map(|(device_id, attributes)| (device_id, Bytes::from(attributes)))
            .collect())
    }

    async fn delete(&self, client_id: &str, device_ids: &[String]) -> Result<()> {
        if device_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(client_id, device_ids).await?;
        Ok(())
    }
}
