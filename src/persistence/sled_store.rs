use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use sled::{Db, Tree};

use super::PresenceStore;
use crate::utils::Result;

const PRESENCE_TREE: &str = "presence";
const KEY_SEPARATOR: u8 = 0;

/// Composite key `client \0 device`, so a prefix scan lists a client's devices.
fn device_key(client_id: &str, device_id: &str) -> Vec<u8> {
    let mut key = client_prefix(client_id);
    key.extend_from_slice(device_id.as_bytes());
    key
}

fn client_prefix(client_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(client_id.len() + 1);
    prefix.extend_from_slice(client_id.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Durable single-node presence store on `sled`.
///
/// One key per device, so store and delete are single atomic tree operations.
#[derive(Clone)]
pub struct SledPresenceStore {
    db: Db,
    tree: Tree,
}

impl SledPresenceStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(PRESENCE_TREE)?;
        Ok(Self { db, tree })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledPresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledPresenceStore")
            .field("db", &"sled::Db")
            .field("devices", &self.tree.len())
            .finish()
    }
}

#[async_trait]
impl PresenceStore for SledPresenceStore {
    fn name(&self) -> &'static str {
        "sled"
    }

    async fn store(&self, client_id: &str, device_id: &str, attributes: Bytes) -> Result<()> {
        self.tree
            .insert(device_key(client_id, device_id), attributes.as_ref())?;
        Ok(())
    }

    async fn load(&self, client_id: &str) -> Result<HashMap<String, Bytes>> {
        let prefix = client_prefix(client_id);
        let mut devices = HashMap::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (key, value) = item?;
            let device_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            devices.insert(device_id, Bytes::copy_from_slice(&value));
        }
        Ok(devices)
    }

    async fn delete(&self, client_id: &str, device_ids: &[String]) -> Result<()> {
        for device_id in device_ids {
            self.tree.remove(device_key(client_id, device_id))?;
        }
        Ok(())
    }
}
