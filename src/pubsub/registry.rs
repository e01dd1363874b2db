use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use uuid::Uuid;

use crate::utils::{PushError, Result};

/// Key space of the [`Registry`].
///
/// Root handles live under the subscription id; handles joined mid-session
/// live under the topic name scoped to the subscription that joined it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistryKey {
    Subscription(Uuid),
    Topic { subscription: Uuid, topic: String },
}

impl RegistryKey {
    pub fn topic(subscription: Uuid, topic: impl Into<String>) -> Self {
        RegistryKey::Topic {
            subscription,
            topic: topic.into(),
        }
    }

    pub fn subscription_id(&self) -> Uuid {
        match self {
            RegistryKey::Subscription(id) => *id,
            RegistryKey::Topic { subscription, .. } => *subscription,
        }
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryKey::Subscription(id) => write!(f, "subscription {id}"),
            RegistryKey::Topic {
                subscription,
                topic,
            } => write!(f, "topic {topic} of subscription {subscription}"),
        }
    }
}

/// Concurrent map from [`RegistryKey`] to broker handles.
///
/// Safe to share between sessions without external locking. `load_and_delete`
/// is atomic: exactly one caller observes a stored value. Keys are also
/// indexed by owning subscription, so teardown touches only that
/// subscription's keys.
#[derive(Debug)]
pub struct Registry<V> {
    entries: DashMap<RegistryKey, V>,
    owned: DashMap<Uuid, HashSet<RegistryKey>>,
}

impl<V: Clone> Registry<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            owned: DashMap::new(),
        }
    }

    /// Unconditional upsert.
    ///
    /// The index entry stays locked until the value is in place, so a racing
    /// `forget` of the same key sees it.
    pub fn store(&self, key: RegistryKey, value: V) {
        let mut keys = self.owned.entry(key.subscription_id()).or_default();
        keys.insert(key.clone());
        self.entries.insert(key, value);
    }

    pub fn load(&self, key: &RegistryKey) -> Result<V> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PushError::not_found(format!("{key} is not registered")))
    }

    pub fn contains(&self, key: &RegistryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn load_and_delete(&self, key: &RegistryKey) -> Result<V> {
        let (key, value) = self
            .entries
            .remove(key)
            .ok_or_else(|| PushError::not_found(format!("{key} is not registered")))?;
        self.forget(&key);
        Ok(value)
    }

    fn forget(&self, key: &RegistryKey) {
        let subscription = key.subscription_id();
        if let Some(mut keys) = self.owned.get_mut(&subscription) {
            // A concurrent store may have put the key back.
            if !self.entries.contains_key(key) {
                keys.remove(key);
            }
        }
        self.owned
            .remove_if(&subscription, |_, keys| keys.is_empty());
    }

    /// Every key, root or topic, owned by `subscription`.
    pub fn keys_for(&self, subscription: Uuid) -> Vec<RegistryKey> {
        self.owned
            .get(&subscription)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of subscriptions that still own at least one key.
    pub fn subscriptions(&self) -> usize {
        self.owned.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}
