use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Where the push service reports connection and message counts.
pub trait MetricsSink: Send + Sync {
    fn client_connected(&self);
    fn client_disconnected(&self, session: Duration);
    fn message_sent(&self, event_name: &str);
    fn message_received(&self, event_name: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn client_connected(&self) {}
    fn client_disconnected(&self, _session: Duration) {}
    fn message_sent(&self, _event_name: &str) {}
    fn message_received(&self, _event_name: &str) {}
}

/// Process-local counters.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    connected: AtomicI64,
    sessions: AtomicU64,
    session_millis: AtomicU64,
    sent: DashMap<String, u64>,
    received: DashMap<String, u64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the connected-clients gauge.
    pub fn connected_clients(&self) -> i64 {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn completed_sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn total_session_time(&self) -> Duration {
        Duration::from_millis(self.session_millis.load(Ordering::Relaxed))
    }

    pub fn sent(&self, event_name: &str) -> u64 {
        self.sent.get(event_name).map(|count| *count).unwrap_or(0)
    }

    pub fn received(&self, event_name: &str) -> u64 {
        self.received.get(event_name).map(|count| *count).unwrap_or(0)
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.iter().map(|entry| *entry.value()).sum()
    }

    pub fn total_received(&self) -> u64 {
        self.received.iter().map(|entry| *entry.value()).sum()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn client_connected(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    fn client_disconnected(&self, session: Duration) {
        self.connected.fetch_sub(1, Ordering::Relaxed);
        self.sessions.fetch_add(1, Ordering::Relaxed);
        self.session_millis
            .fetch_add(session.as_millis() as u64, Ordering::Relaxed);
    }

    fn message_sent(&self, event_name: &str) {
        *self.sent.entry(event_name.to_string()).or_insert(0) += 1;
    }

    fn message_received(&self, event_name: &str) {
        *self.received.entry(event_name.to_string()).or_insert(0) += 1;
    }
}
