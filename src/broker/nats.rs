//! NATS adapters: core subjects for live fan-out and JetStream for durable
//! delivery.

use std::fmt::Display;

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashSet;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handle::spawn_forwarder;
use super::{Broker, EventSink, PublishRequest, TopicEvent, publish_each};
use crate::utils::{PushError, Result};

/// Maps an arbitrary channel name onto the character set NATS accepts for
/// stream, consumer and key names.
///
/// The encoding is unpadded base64url, so distinct channels always get
/// distinct names.
pub fn nats_safe_name(channel: &str) -> String {
    URL_SAFE_NO_PAD.encode(channel)
}

pub(crate) fn nats_error(action: &str, err: impl Display) -> PushError {
    PushError::internal(format!("nats {action} failed: {err}"))
}

/// Live pub/sub over NATS subjects.
#[derive(Debug, Clone)]
pub struct NatsPubSub {
    client: async_nats::Client,
}

impl NatsPubSub {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|err| nats_error("connect", err))?;
        debug!(url, "connected to nats");
        Ok(Self { client })
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broker for NatsPubSub {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn publish(&self, request: PublishRequest) -> Result<()> {
        self.client
            .publish(request.channel, request.payload)
            .await
            .map_err(|err| nats_error("publish", err))
    }

    async fn publish_bulk(&self, requests: Vec<PublishRequest>) -> Result<()> {
        publish_each(self.name(), requests, |request| async move {
            self.client
                .publish(request.channel, request.payload)
                .await
                .map_err(|err| nats_error("publish", err))
        })
        .await;
        // Flushing the write buffer commits the batch.
        self.client
            .flush()
            .await
            .map_err(|err| nats_error("flush", err))
    }

    async fn open_feed(
        &self,
        channel: &str,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let subscriber = self
            .client
            .subscribe(channel.to_string())
            .await
            .map_err(|err| nats_error("subscribe", err))?;
        // Make sure the server has seen the SUB before the caller publishes.
        self.client
            .flush()
            .await
            .map_err(|err| nats_error("flush", err))?;

        let stream = subscriber.map(|msg| {
            Ok(TopicEvent {
                topic: msg.subject.to_string(),
                payload: msg.payload,
            })
        });
        spawn_forwarder(channel.to_string(), stream, sink, cancel);
        Ok(())
    }
}

/// Durable delivery over JetStream.
///
/// Each channel gets a stream bound to the channel subject and a durable
/// pull consumer with explicit acks. A message is acked only after it has
/// been handed to the subscriber, so undelivered messages are redelivered.
pub struct JetStream {
    client: async_nats::Client,
    context: jetstream::Context,
    known_streams: DashSet<String>,
}

impl JetStream {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|err| nats_error("connect", err))?;
        debug!(url, "connected to nats jetstream");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            context,
            known_streams: DashSet::new(),
        }
    }

    async fn ensure_stream(&self, channel: &str) -> Result<stream::Stream> {
        let name = nats_safe_name(channel);
        let stream = self
            .context
            .get_or_create_stream(stream::Config {
                name: name.clone(),
                subjects: vec![channel.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|err| nats_error("stream setup", err))?;
        if self.known_streams.insert(name.clone()) {
            debug!(stream = %name, channel, "jetstream stream ready");
        }
        Ok(stream)
    }

    async fn publish_acked(&self, request: PublishRequest) -> Result<()> {
        if !self.known_streams.contains(&nats_safe_name(&request.channel)) {
            self.ensure_stream(&request.channel).await?;
        }
        let ack = self
            .context
            .publish(request.channel, request.payload)
            .await
            .map_err(|err| nats_error("jetstream publish", err))?;
        ack.await
            .map_err(|err| nats_error("jetstream publish ack", err))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for JetStream {
    fn name(&self) -> &'static str {
        "jetstream"
    }

    async fn publish(&self, request: PublishRequest) -> Result<()> {
        self.publish_acked(request).await
    }

    async fn publish_bulk(&self, requests: Vec<PublishRequest>) -> Result<()> {
        publish_each(self.name(), requests, |request| self.publish_acked(request)).await;
        self.client
            .flush()
            .await
            .map_err(|err| nats_error("flush", err))
    }

    async fn open_feed(
        &self,
        channel: &str,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let stream = self.ensure_stream(channel).await?;
        let durable = nats_safe_name(channel);
        let consumer: consumer::PullConsumer = stream
            .get_or_create_consumer(
                &durable,
                consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| nats_error("consumer setup", err))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|err| nats_error("consumer fetch", err))?;

        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = Box::pin(messages);
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = messages.next() => next,
                };
                match next {
                    Some(Ok(message)) => {
                        let event = TopicEvent {
                            topic: message.subject.to_string(),
                            payload: message.payload.clone(),
                        };
                        if !sink.deliver(event) {
                            debug!(channel = %channel, "subscriber gone, message left for redelivery");
                            break;
                        }
                        if let Err(err) = message.ack().await {
                            warn!(channel = %channel, error = %err, "failed to ack delivered message");
                        }
                    }
                    Some(Err(err)) => sink.fail(nats_error("consume", err)),
                    None => {
                        debug!(channel = %channel, "jetstream consumer ended");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}
