//! In-process adapters used when no external broker is configured, and by
//! the test suite.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::handle::spawn_forwarder;
use super::{Broker, EventSink, PublishRequest, TopicEvent, publish_each};
use crate::utils::{PushError, Result};

const DEFAULT_CAPACITY: usize = 1024;

/// Fire-and-forget fan-out over tokio broadcast channels.
///
/// Payloads published to a channel nobody listens on are dropped.
#[derive(Debug)]
pub struct MemoryPubSub {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn deliver(&self, request: PublishRequest) {
        let sent = match self.channels.get(&request.channel) {
            Some(sender) => sender.send(request.payload).is_ok(),
            None => return,
        };
        if !sent {
            // Last receiver went away; drop the idle sender.
            self.channels
                .remove_if(&request.channel, |_, sender| sender.receiver_count() == 0);
        }
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryPubSub {
    fn name(&self) -> &'static str {
        "memory-pubsub"
    }

    async fn publish(&self, request: PublishRequest) -> Result<()> {
        self.deliver(request);
        Ok(())
    }

    async fn publish_bulk(&self, requests: Vec<PublishRequest>) -> Result<()> {
        publish_each(self.name(), requests, |request| {
            self.deliver(request);
            async { Ok(()) }
        })
        .await;
        Ok(())
    }

    async fn open_feed(
        &self,
        channel: &str,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let topic = channel.to_string();
        let stream = BroadcastStream::new(receiver).map(move |item| match item {
            Ok(payload) => Ok(TopicEvent {
                topic: topic.clone(),
                payload,
            }),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Err(PushError::internal(format!(
                "feed for {topic} lagged, {skipped} events dropped"
            ))),
        });
        spawn_forwarder(channel.to_string(), stream, sink, cancel);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StreamLog {
    records: Mutex<VecDeque<Bytes>>,
    notify: Notify,
}

/// Per-channel append-only log with deliver-then-delete consumption.
///
/// Records published before anyone subscribes are kept and handed to the
/// first feed that opens on the channel.
#[derive(Debug)]
pub struct MemoryStreams {
    logs: DashMap<String, Arc<StreamLog>>,
    poll_window: Duration,
}

impl MemoryStreams {
    pub fn new(poll_window: Duration) -> Self {
        Self {
            logs: DashMap::new(),
            poll_window,
        }
    }

    fn log(&self, channel: &str) -> Arc<StreamLog> {
        self.logs
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(StreamLog::default()))
            .clone()
    }

    fn append(&self, request: PublishRequest) {
        let log = self.log(&request.channel);
        log.records.lock().push_back(request.payload);
        log.notify.notify_waiters();
    }

    /// Number of records waiting on `channel`.
    pub fn pending(&self, channel: &str) -> usize {
        self.logs
            .get(channel)
            .map(|log| log.records.lock().len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryStreams {
    fn name(&self) -> &'static str {
        "memory-streams"
    }

    async fn publish(&self, request: PublishRequest) -> Result<()> {
        self.append(request);
        Ok(())
    }

    async fn publish_bulk(&self, requests: Vec<PublishRequest>) -> Result<()> {
        publish_each(self.name(), requests, |request| {
            self.append(request);
            async { Ok(()) }
        })
        .await;
        Ok(())
    }

    async fn open_feed(
        &self,
        channel: &str,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let log = self.log(channel);
        tokio::spawn(consume_log(
            channel.to_string(),
            log,
            sink,
            cancel,
            self.poll_window,
        ));
        Ok(())
    }
}

async fn consume_log(
    channel: String,
    log: Arc<StreamLog>,
    sink: EventSink,
    cancel: CancellationToken,
    poll_window: Duration,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Register for wakeups before checking the log so an append between
        // the check and the wait is not missed.
        let notified = log.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = log.records.lock().pop_front();
        if let Some(payload) = next {
            let event = TopicEvent {
                topic: channel.clone(),
                payload: payload.clone(),
            };
            if !sink.deliver(event) {
                // Not delivered, so not deleted.
                log.records.lock().push_front(payload);
                debug!(channel = %channel, "subscriber gone, stopping stream feed");
                break;
            }
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut notified => {}
            _ = tokio::time::sleep(poll_window) => {
                trace!(channel = %channel, "poll window elapsed without records");
            }
        }
    }
}
