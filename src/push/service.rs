use std::collections::{HashMap, HashSet};
use std::slice;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::{self, Instant as Deadline};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metrics::MetricsSink;
use super::model::{
    ClientActiveDevices, Device, Event, TopicPublish, device_channel, require, response_topic,
};
use crate::broker::PublishRequest;
use crate::config::PushSettings;
use crate::persistence::PresenceStore;
use crate::pubsub::{PubSub, Subscription};
use crate::utils::{PushError, Result};

/// The root subscription of one connected client, plus what is needed to
/// tear it down.
#[derive(Debug)]
pub struct ClientSubscription {
    pub subscription: Subscription,
    pub client_id: String,
    pub device: Option<Device>,
    pub connected_at: DateTime<Utc>,
    started: Instant,
}

impl ClientSubscription {
    pub fn device_id(&self) -> Option<&str> {
        self.device.as_ref().map(|device| device.id.as_str())
    }
}

/// Business operations of the relay. Cheap to share behind an `Arc`.
pub struct PushService {
    pubsub: Arc<PubSub>,
    presence: Arc<dyn PresenceStore>,
    metrics: Arc<dyn MetricsSink>,
    settings: PushSettings,
}

impl PushService {
    pub fn new(
        pubsub: Arc<PubSub>,
        presence: Arc<dyn PresenceStore>,
        metrics: Arc<dyn MetricsSink>,
        settings: PushSettings,
    ) -> Self {
        Self {
            pubsub,
            presence,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &PushSettings {
        &self.settings
    }

    pub fn device_support_enabled(&self) -> bool {
        self.settings.enable_device_support
    }

    /// Counts an event handed to a connected client.
    pub fn record_received(&self, event_name: &str) {
        self.metrics.message_received(event_name);
    }

    fn require_device_support(&self) -> Result<()> {
        if !self.settings.enable_device_support {
            return Err(PushError::failed_precondition("device support is not enabled"));
        }
        Ok(())
    }

    async fn publish_event(&self, channel: String, event: &Event) -> Result<()> {
        let payload = event.encode()?;
        self.pubsub
            .publish(PublishRequest::new(channel, payload))
            .await?;
        self.metrics.message_sent(&event.name);
        Ok(())
    }

    pub async fn publish_to_client(&self, client_id: &str, event: &Event) -> Result<()> {
        require(client_id, "client id")?;
        event.validate()?;
        self.publish_event(client_id.to_string(), event).await
    }

    pub async fn publish_to_client_with_device(
        &self,
        client_id: &str,
        device_id: &str,
        event: &Event,
    ) -> Result<()> {
        self.require_device_support()?;
        require(client_id, "client id")?;
        require(device_id, "device id")?;
        event.validate()?;
        self.publish_event(device_channel(client_id, device_id), event)
            .await
    }

    pub async fn publish_to_topic(&self, topic: &str, event: &Event) -> Result<()> {
        require(topic, "topic")?;
        event.validate()?;
        self.publish_event(topic.to_string(), event).await
    }

    /// Validates every item, then publishes them as one batch.
    pub async fn publish_to_topics(&self, batch: &[TopicPublish]) -> Result<()> {
        if batch.is_empty() {
            return Err(PushError::invalid_argument("at least one topic event is required"));
        }
        for item in batch {
            require(&item.topic, "topic")?;
            item.event.validate()?;
        }

        let mut requests = Vec::with_capacity(batch.len());
        for item in batch {
            requests.push(PublishRequest::new(item.topic.clone(), item.event.encode()?));
        }
        self.pubsub.publish_bulk(requests).await?;
        for item in batch {
            self.metrics.message_sent(&item.event.name);
        }
        Ok(())
    }

    /// Opens the client's root subscription.
    ///
    /// With device support on and a device given, the device channel is a
    /// second root subject of the same subscription and the device is
    /// recorded in the presence store. Feeds stop when `parent` is cancelled.
    pub async fn async_client_subscribe(
        &self,
        client_id: &str,
        device: Option<Device>,
        parent: &CancellationToken,
    ) -> Result<ClientSubscription> {
        require(client_id, "client id")?;
        let device = match device {
            Some(device) if self.settings.enable_device_support => {
                require(&device.id, "device id")?;
                Some(device)
            }
            Some(device) => {
                debug!(client_id, device_id = %device.id, "device support disabled, ignoring device");
                None
            }
            None => None,
        };

        let mut subjects = vec![client_id.to_string()];
        if let Some(device) = &device {
            subjects.push(device_channel(client_id, &device.id));
        }
        let subscription = self.pubsub.async_subscribe(&subjects, parent).await?;

        if let Some(device) = &device {
            if let Err(err) = self.register_device(client_id, device).await {
                if let Err(cleanup) = self.pubsub.unsubscribe(&subscription).await {
                    warn!(client_id, error = %cleanup, "failed to release subscription after device setup failed");
                }
                return Err(err);
            }
        }

        self.metrics.client_connected();
        info!(client_id, device_id = ?device.as_ref().map(|d| &d.id), subscription = %subscription.id, "client subscribed");
        Ok(ClientSubscription {
            subscription,
            client_id: client_id.to_string(),
            device,
            connected_at: Utc::now(),
            started: Instant::now(),
        })
    }

    async fn register_device(&self, client_id: &str, device: &Device) -> Result<()> {
        let attributes = Bytes::from(serde_json::to_vec(&device.attributes)?);
        self.presence
            .store(client_id, &device.id, attributes)
            .await
    }

    /// Ends a client session: presence cleanup and metrics are best effort,
    /// the subscription teardown result is returned.
    pub async fn client_unsubscribe(&self, client: &ClientSubscription) -> Result<()> {
        if let Some(device) = &client.device {
            if let Err(err) = self
                .presence
                .delete(&client.client_id, slice::from_ref(&device.id))
                .await
            {
                warn!(client_id = %client.client_id, device_id = %device.id, error = %err, "failed to clear presence");
            }
        }

        let session = client.started.elapsed();
        self.metrics.client_disconnected(session);
        info!(client_id = %client.client_id, session_ms = session.as_millis() as u64, "client unsubscribed");

        self.pubsub.unsubscribe(&client.subscription).await
    }

    pub async fn topic_subscribe(&self, client: &ClientSubscription, topic: &str) -> Result<()> {
        require(topic, "topic")?;
        self.pubsub
            .add_subscription(&client.subscription, topic)
            .await?;
        debug!(client_id = %client.client_id, topic, "topic joined");
        Ok(())
    }

    pub async fn topic_unsubscribe(&self, client: &ClientSubscription, topic: &str) -> Result<()> {
        require(topic, "topic")?;
        self.pubsub
            .remove_subscription(&client.subscription, topic)
            .await?;
        debug!(client_id = %client.client_id, topic, "topic left");
        Ok(())
    }

    /// Answers a validation ping on behalf of a connected device.
    ///
    /// The ping payload names the device; the echo goes to that device's
    /// response topic and carries the same device id.
    pub async fn confirm_device_validation(&self, client_id: &str, ping: &Event) -> Result<()> {
        let device_id = ping.data.as_str().filter(|id| !id.is_empty()).ok_or_else(|| {
            PushError::invalid_argument("validation ping does not carry a device id")
        })?;
        let topic = response_topic(client_id, device_id);
        let echo = Event::new(topic.clone(), ping.data.clone());
        self.pubsub
            .publish(PublishRequest::new(topic, echo.encode()?))
            .await
    }

    /// Devices of `client_id` that answer a live ping within the validation
    /// timeout. Devices that stay silent are evicted from the presence store.
    pub async fn get_client_active_devices(&self, client_id: &str) -> Result<ClientActiveDevices> {
        self.require_device_support()?;
        require(client_id, "client id")?;

        let stored = self.presence.load(client_id).await?;
        if stored.is_empty() {
            return Ok(ClientActiveDevices::default());
        }
        let deadline = Deadline::now() + self.settings.device_validation_timeout();

        let candidates: Vec<String> = stored.keys().cloned().collect();
        let responded = self
            .collect_validations(client_id, &candidates, deadline)
            .await?;

        let stale: Vec<String> = candidates
            .iter()
            .filter(|device_id| !responded.contains(*device_id))
            .cloned()
            .collect();
        if !stale.is_empty() {
            info!(client_id, stale = ?stale, "evicting devices that did not answer");
            if let Err(err) = self.presence.delete(client_id, &stale).await {
                warn!(client_id, error = %err, "failed to evict stale devices");
            }
        }

        let mut devices: Vec<Device> = stored
            .into_iter()
            .filter(|(device_id, _)| responded.contains(device_id))
            .map(|(id, raw)| Device {
                attributes: decode_attributes(client_id, &id, &raw),
                id,
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(ClientActiveDevices {
            is_client_online: !devices.is_empty(),
            devices,
        })
    }

    /// Pings every candidate and gathers the device ids that echo back
    /// before `deadline`.
    async fn collect_validations(
        &self,
        client_id: &str,
        candidates: &[String],
        deadline: Deadline,
    ) -> Result<HashSet<String>> {
        let cancel = CancellationToken::new();
        let _feeds = cancel.clone().drop_guard();

        let topics: Vec<String> = candidates
            .iter()
            .map(|device_id| response_topic(client_id, device_id))
            .collect();
        let mut subscription =
            match time::timeout_at(deadline, self.pubsub.async_subscribe(&topics, &cancel)).await {
                Ok(subscription) => subscription?,
                Err(_) => {
                    warn!(client_id, "validation window closed while subscribing");
                    return Ok(HashSet::new());
                }
            };

        let responded = self
            .ping_and_collect(client_id, candidates, &mut subscription, deadline)
            .await;
        if let Err(err) = self.pubsub.unsubscribe(&subscription).await {
            warn!(client_id, error = %err, "failed to release validation subscription");
        }
        responded
    }

    async fn ping_and_collect(
        &self,
        client_id: &str,
        candidates: &[String],
        subscription: &mut Subscription,
        deadline: Deadline,
    ) -> Result<HashSet<String>> {
        let mut pings = Vec::with_capacity(candidates.len());
        for device_id in candidates {
            pings.push(PublishRequest::new(
                device_channel(client_id, device_id),
                Event::device_validation(device_id).encode()?,
            ));
        }

        let mut responded = HashSet::with_capacity(candidates.len());
        match time::timeout_at(deadline, self.pubsub.publish_bulk(pings)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(client_id, error = %err, "validation pings failed to commit"),
            Err(_) => {
                warn!(client_id, "validation window closed while pinging");
                return Ok(responded);
            }
        }

        while responded.len() < candidates.len() {
            match time::timeout_at(deadline, subscription.events.recv()).await {
                Ok(Some(event)) => match Event::decode(&event.payload) {
                    Ok(echo) => match echo.data.as_str() {
                        Some(device_id) if candidates.iter().any(|c| c == device_id) => {
                            responded.insert(device_id.to_string());
                        }
                        _ => debug!(client_id, topic = %event.topic, "ignoring unexpected validation echo"),
                    },
                    Err(err) => {
                        warn!(client_id, topic = %event.topic, error = %err, "dropping undecodable validation echo")
                    }
                },
                Ok(None) => break,
                Err(_) => {
                    debug!(client_id, answered = responded.len(), expected = candidates.len(), "validation window closed");
                    break;
                }
            }
        }
        Ok(responded)
    }
}

fn decode_attributes(client_id: &str, device_id: &str, raw: &[u8]) -> HashMap<String, String> {
    if raw.is_empty() {
        return HashMap::new();
    }
    match serde_json::from_slice(raw) {
        Ok(attributes) => attributes,
        Err(err) => {
            warn!(client_id, device_id, error = %err, "stored device attributes are not a string map");
            HashMap::new()
        }
    }
}
