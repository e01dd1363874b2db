//! Pub/sub facade
//!
//! [`PubSub`] is the single entry point the push service talks to. It wraps
//! the broker adapter chosen at boot and keeps the [`Registry`] of handles
//! behind every open [`Subscription`]:
//! - the root handles of a subscription are stored under its id
//! - topics joined mid-session are stored under a topic key scoped to it
//!
//! Unsubscribing removes both kinds of entry, so nothing in the registry
//! outlives the subscription it belongs to.

pub mod registry;
pub mod subscription;

use std::slice;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{self, Broker, EventSink, PublishRequest, SubscriptionHandle};
use crate::config::BrokerSettings;
use crate::utils::{PushError, Result};

pub use registry::{Registry, RegistryKey};
pub use subscription::Subscription;

type Handles = Vec<Arc<SubscriptionHandle>>;

pub struct PubSub {
    broker: Arc<dyn Broker>,
    registry: Registry<Handles>,
}

impl PubSub {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            registry: Registry::new(),
        }
    }

    /// Connects the adapter selected by `settings`.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self> {
        Ok(Self::new(broker::connect(settings).await?))
    }

    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<()> {
        self.broker.publish(request).await
    }

    pub async fn publish_bulk(&self, requests: Vec<PublishRequest>) -> Result<()> {
        self.broker.publish_bulk(requests).await
    }

    /// Opens a subscription fed by every subject, one handle per subject.
    ///
    /// Feeds stop when `parent` is cancelled. With no subjects the
    /// subscription still gets an empty root handle so topics can be
    /// joined later.
    pub async fn async_subscribe(
        &self,
        subjects: &[String],
        parent: &CancellationToken,
    ) -> Result<Subscription> {
        let id = Uuid::new_v4();
        let (sink, events, errors) = EventSink::channel();
        let cancel = parent.child_token();

        let groups: Vec<&[String]> = if subjects.is_empty() {
            vec![&subjects[..0]]
        } else {
            subjects.iter().map(slice::from_ref).collect()
        };

        let mut handles: Handles = Vec::with_capacity(groups.len());
        for channels in groups {
            match self.broker.subscribe(channels, sink.clone(), &cancel).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Tears down the handles opened so far.
                    cancel.cancel();
                    return Err(err);
                }
            }
        }

        self.registry.store(RegistryKey::Subscription(id), handles);
        debug!(subscription = %id, subjects = ?subjects, "subscription opened");
        Ok(Subscription::new(id, events, errors, cancel))
    }

    /// Joins `topic` onto an open subscription's queue.
    ///
    /// Joining a topic twice is a no-op. A channel the subscription was
    /// opened with cannot be joined as a topic, so it can never be left as
    /// one either.
    pub async fn add_subscription(&self, subscription: &Subscription, topic: &str) -> Result<()> {
        let key = RegistryKey::topic(subscription.id, topic);
        if self.registry.contains(&key) {
            return Ok(());
        }
        let handles = self
            .registry
            .load(&RegistryKey::Subscription(subscription.id))?;
        if handles.iter().any(|handle| handle.contains(topic)) {
            return Err(PushError::failed_precondition(format!(
                "{topic} is a root channel of subscription {}",
                subscription.id
            )));
        }
        let root = handles.first().cloned().ok_or_else(|| {
            PushError::not_found(format!("subscription {} has no handle", subscription.id))
        })?;

        if self.broker.add_subscription(topic, &root).await? {
            self.registry.store(key, vec![root]);
        }
        Ok(())
    }

    /// Leaves a topic previously joined with [`PubSub::add_subscription`].
    pub async fn remove_subscription(
        &self,
        subscription: &Subscription,
        topic: &str,
    ) -> Result<()> {
        let handles = self
            .registry
            .load_and_delete(&RegistryKey::topic(subscription.id, topic))?;
        for handle in handles {
            self.broker.remove_subscription(topic, &handle).await?;
        }
        Ok(())
    }

    /// Releases every handle of the subscription and stops its feeds.
    ///
    /// A second call for the same subscription returns `NotFound`.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let handles = self
            .registry
            .load_and_delete(&RegistryKey::Subscription(subscription.id))?;
        for key in self.registry.keys_for(subscription.id) {
            // A racing remove_subscription may have taken it already.
            let _ = self.registry.load_and_delete(&key);
        }

        let mut first_error = None;
        for handle in handles {
            if let Err(err) = self.broker.unsubscribe(&handle).await {
                warn!(subscription = %subscription.id, error = %err, "failed to close handle");
                first_error.get_or_insert(err);
            }
        }
        subscription.cancel_token().cancel();
        debug!(subscription = %subscription.id, "subscription closed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of live registry entries.
    pub fn registered(&self) -> usize {
        self.registry.len()
    }
}
