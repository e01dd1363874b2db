//! Broker adapters
//!
//! This module owns the physical connection to the backing transport and
//! exposes one contract, [`Broker`], implemented by two families:
//! - low-latency pub/sub (NATS core, Redis PUBLISH/SUBSCRIBE, in-process broadcast)
//! - durable streams/queues (JetStream, Redis Streams, in-process log)
//!
//! Every subscription is a [`SubscriptionHandle`]: one merged event queue fed
//! by one forwarding task per attached channel. Channels can be attached and
//! detached for the lifetime of the handle, so a single consumer reads traffic
//! from many channels through one queue.
//!
//! Concurrency and usage notes:
//! - Adapters are selected once at boot by [`connect`] and fixed for the
//!   process lifetime. Business logic never specializes on the backend.
//! - Forwarding tasks observe a cancellation token that is a child of the
//!   token passed to [`Broker::subscribe`]; cancelling the caller's token
//!   stops every feed of the handle.

pub mod handle;
pub mod memory;
pub mod nats;
pub mod redis;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BrokerKind, BrokerSettings};
use crate::utils::{PushError, Result};

pub use handle::SubscriptionHandle;
pub use memory::{MemoryPubSub, MemoryStreams};
pub use nats::{JetStream, NatsPubSub};
pub use redis::{RedisPubSub, RedisStreams};

/// A payload to fire at a named channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub channel: String,
    pub payload: Bytes,
}

impl PublishRequest {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// What a subscriber receives: the channel the payload arrived on and the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEvent {
    pub topic: String,
    pub payload: Bytes,
}

/// Sending side of a subscription's event and error queues.
///
/// Cloned into every forwarding task of a handle.
#[derive(Debug, Clone)]
pub struct EventSink {
    events: mpsc::UnboundedSender<TopicEvent>,
    errors: mpsc::UnboundedSender<PushError>,
}

impl EventSink {
    /// Creates a sink together with the receiving ends of both queues.
    pub fn channel() -> (
        Self,
        mpsc::UnboundedReceiver<TopicEvent>,
        mpsc::UnboundedReceiver<PushError>,
    ) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (errors, error_rx) = mpsc::unbounded_channel();
        (Self { events, errors }, event_rx, error_rx)
    }

    /// Hands an event to the subscriber. Returns `false` once the subscriber is gone.
    pub fn deliver(&self, event: TopicEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Reports a feed-level error on the subscription's error queue.
    pub fn fail(&self, err: PushError) {
        if self.errors.send(err).is_err() {
            debug!("error queue closed, dropping feed error");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// The adapter contract shared by every backend.
///
/// Implementors provide `publish`, `publish_bulk` and `open_feed`; channel
/// membership of a handle is managed by the provided methods.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Fires a payload at the named channel.
    async fn publish(&self, request: PublishRequest) -> Result<()>;

    /// Publishes a batch through the backend's native pipelining.
    ///
    /// Best effort per item: a failing item is logged and skipped. The call
    /// only fails when the commit step of the batch fails.
    async fn publish_bulk(&self, requests: Vec<PublishRequest>) -> Result<()>;

    /// Opens a live feed for `channel` and spawns its forwarding task.
    ///
    /// The backend subscription must be established before this returns. The
    /// task copies events into `sink` until `cancel` fires.
    async fn open_feed(&self, channel: &str, sink: EventSink, cancel: CancellationToken)
    -> Result<()>;

    /// Opens a new handle fed by every channel in `channels`.
    async fn subscribe(
        &self,
        channels: &[String],
        sink: EventSink,
        parent: &CancellationToken,
    ) -> Result<Arc<SubscriptionHandle>> {
        let handle = Arc::new(SubscriptionHandle::new(sink, parent));
        for channel in channels {
            if let Err(err) = self.add_subscription(channel, &handle).await {
                let _ = handle.close();
                return Err(err);
            }
        }
        Ok(handle)
    }

    /// Feeds `channel` into an existing handle's queue.
    ///
    /// Returns `false` when the channel was already attached and nothing
    /// changed.
    async fn add_subscription(&self, channel: &str, handle: &SubscriptionHandle) -> Result<bool> {
        let Some(token) = handle.attach(channel)? else {
            debug!(broker = self.name(), channel, "channel already attached");
            return Ok(false);
        };
        if let Err(err) = self.open_feed(channel, handle.sink(), token).await {
            handle.detach(channel);
            return Err(err);
        }
        debug!(broker = self.name(), channel, "feed attached");
        Ok(true)
    }

    /// Stops feeding `channel` into the handle's queue.
    async fn remove_subscription(&self, channel: &str, handle: &SubscriptionHandle) -> Result<()> {
        if !handle.detach(channel) {
            return Err(PushError::not_found(format!(
                "channel {channel} is not attached to this subscription"
            )));
        }
        debug!(broker = self.name(), channel, "feed detached");
        Ok(())
    }

    /// Tears down every feed of the handle. A second call errors.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        handle.close()
    }
}

/// Rejects bulk items the backend would refuse anyway.
pub(crate) fn check_bulk_item(request: &PublishRequest) -> Result<()> {
    if request.channel.is_empty() {
        return Err(PushError::invalid_argument("bulk item has an empty channel"));
    }
    Ok(())
}

/// Runs `publish` for every request, logging and skipping failures.
///
/// Returns the number of failed items.
pub(crate) async fn publish_each<F, Fut>(
    backend: &str,
    requests: Vec<PublishRequest>,
    mut publish: F,
) -> usize
where
    F: FnMut(PublishRequest) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failed = 0;
    for (index, request) in requests.into_iter().enumerate() {
        let channel = request.channel.clone();
        let outcome = match check_bulk_item(&request) {
            Ok(()) => publish(request).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            failed += 1;
            warn!(backend, index, channel = %channel, error = %err, "bulk item failed, continuing");
        }
    }
    failed
}

/// Builds the adapter selected by configuration.
pub async fn connect(settings: &BrokerSettings) -> Result<Arc<dyn Broker>> {
    let broker: Arc<dyn Broker> = match (settings.kind, settings.persistence) {
        (BrokerKind::Nats, false) => Arc::new(NatsPubSub::connect(&settings.nats_url).await?),
        (BrokerKind::Nats, true) => Arc::new(JetStream::connect(&settings.nats_url).await?),
        (BrokerKind::Redis, false) => Arc::new(RedisPubSub::connect(&settings.redis_url).await?),
        (BrokerKind::Redis, true) => Arc::new(
            RedisStreams::connect(&settings.redis_url, settings.poll_window()).await?,
        ),
        (BrokerKind::Memory, false) => Arc::new(MemoryPubSub::new()),
        (BrokerKind::Memory, true) => Arc::new(MemoryStreams::new(settings.poll_window())),
    };
    info!(broker = broker.name(), "initialised broker");
    Ok(broker)
}

#[cfg(test)]
mod tests;
