use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::PresenceStore;
use crate::utils::Result;

/// Process-local presence store. Every operation is atomic per client.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    clients: DashMap<String, HashMap<String, Bytes>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_client(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn store(&self, client_id: &str, device_id: &str, attributes: Bytes) -> Result<()> {
        self.clients
            .entry(client_id.to_string())
            .or_default()
            .insert(device_id.to_string(), attributes);
        Ok(())
    }

    async fn load(&self, client_id: &str) -> Result<HashMap<String, Bytes>> {
        Ok(self
            .clients
            .get(client_id)
            .map(|devices| devices.clone())
            .unwrap_or_default())
    }

    async fn delete(&self, client_id: &str, device_ids: &[String]) -> Result<()> {
        if device_ids.is_empty() {
            return Ok(());
        }
        if let Some(mut devices) = self.clients.get_mut(client_id) {
            for device_id in device_ids {
                devices.remove(device_id);
            }
        }
        self.clients
            .remove_if(client_id, |_, devices| devices.is_empty());
        Ok(())
    }
}
