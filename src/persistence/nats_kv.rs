use std::collections::{BTreeMap, HashMap};

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::PresenceStore;
use crate::broker::nats::{nats_error, nats_safe_name};
use crate::utils::{PushError, Result};

pub const PRESENCE_BUCKET: &str = "propel-presence";

const MAX_CAS_ATTEMPTS: usize = 8;

/// Per-client device map as stored in the bucket.
type DeviceMap = BTreeMap<String, String>;

pub(crate) fn encode_devices(devices: &DeviceMap) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(devices)?))
}

pub(crate) fn decode_devices(raw: &[u8]) -> Result<DeviceMap> {
    if raw.is_empty() {
        return Ok(DeviceMap::new());
    }
    Ok(serde_json::from_slice(raw)?)
}

/// Presence in a JetStream key-value bucket, one JSON blob per client.
///
/// Writes are a read-modify-write guarded by the entry revision: a writer
/// that loses the race reloads and retries, so concurrent connects for the
/// same client never drop each other's device.
pub struct NatsKvStore {
    store: kv::Store,
}

impl NatsKvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|err| nats_error("connect", err))?;
        let context = jetstream::new(client);
        let store = match context.get_key_value(PRESENCE_BUCKET).await {
            Ok(store) => store,
            Err(_) => context
                .create_key_value(kv::Config {
                    bucket: PRESENCE_BUCKET.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|err| nats_error("bucket setup", err))?,
        };
        debug!(url, bucket = PRESENCE_BUCKET, "connected to nats kv for presence");
        Ok(Self { store })
    }

    async fn read(&self, key: &str) -> Result<(DeviceMap, Option<u64>)> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|err| nats_error("kv read", err))?;
        Ok(match entry {
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => {
                (decode_devices(&entry.value)?, Some(entry.revision))
            }
            // Tombstone: the key can be rewritten from scratch at this revision.
            Some(entry) => (DeviceMap::new(), Some(entry.revision)),
            None => (DeviceMap::new(), None),
        })
    }

    /// Applies `change` to the client's map and writes it back if the
    /// revision is unchanged, retrying on conflict.
    async fn modify<F>(&self, client_id: &str, change: F) -> Result<()>
    where
        F: Fn(&mut DeviceMap) + Send + Sync,
    {
        let key = nats_safe_name(client_id);
        let mut last_error = None;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (mut devices, revision) = self.read(&key).await?;
            change(&mut devices);
            let value = encode_devices(&devices)?;

            let written = match revision {
                Some(revision) => self
                    .store
                    .update(&key, value, revision)
                    .await
                    .map_err(|err| nats_error("kv update", err)),
                None => self
                    .store
                    .create(&key, value)
                    .await
                    .map_err(|err| nats_error("kv create", err)),
            };
            match written {
                Ok(_) => return Ok(()),
                Err(err) => {
                    debug!(client_id, attempt, error = %err, "presence write conflicted, retrying");
                    last_error = Some(err);
                }
            }
        }
        warn!(client_id, attempts = MAX_CAS_ATTEMPTS, "giving up on presence write");
        Err(last_error
            .unwrap_or_else(|| PushError::internal("presence write failed without an error")))
    }
}

#[async_trait]
impl PresenceStore for NatsKvStore {
    fn name(&self) -> &'static str {
        "nats-kv"
    }

    async fn store(&self, client_id: &str, device_id: &str, attributes: Bytes) -> Result<()> {
        let attributes = String::from_utf8(attributes.to_vec()).map_err(|_| {
            PushError::invalid_argument("device attributes must be UTF-8 encoded JSON")
        })?;
        self.modify(client_id, |devices| {
            devices.insert(device_id.to_string(), attributes.clone());
        })
        .await
    }

    async fn load(&self, client_id: &str) -> Result<HashMap<String, Bytes>> {
        let (devices, _) = self.read(&nats_safe_name(client_id)).await?;
        Ok(devices
            .into_iter()
            .map(|(device_id, attributes)| (device_id, Bytes::from(attributes)))
            .collect())
    }

    async fn delete(&self, client_id: &str, device_ids: &[String]) -> Result<()> {
        if device_ids.is_empty() {
            return Ok(());
        }
        self.modify(client_id, |devices| {
            for device_id in device_ids {
                devices.remove(device_id);
            }
        })
        .await
    }
}
