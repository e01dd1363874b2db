//! Redis adapters: PUBLISH/SUBSCRIBE for live fan-out and Redis Streams for
//! durable delivery.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handle::spawn_forwarder;
use super::{Broker, EventSink, PublishRequest, TopicEvent, check_bulk_item};
use crate::utils::{PushError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Field under which the payload is stored in every stream entry.
pub const STREAM_DATA_FIELD: &str = "data";

/// Name of the Redis stream backing `channel`.
pub fn stream_key(channel: &str) -> String {
    format!("{channel}-stream")
}

/// Live pub/sub over Redis channels.
///
/// Publishing goes through a shared [`ConnectionManager`]; each feed holds
/// its own subscriber connection, since a connection in subscribe mode
/// cannot issue other commands.
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!(url, "connected to redis for pub/sub");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Broker for RedisPubSub {
    fn name(&self) -> &'static str {
        "redis-pubsub"
    }

    async fn publish(&self, request: PublishRequest) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(&request.channel, request.payload.as_ref())
            .await?;
        Ok(())
    }

    async fn publish_bulk(&self, requests: Vec<PublishRequest>) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut queued = 0usize;
        for (index, request) in requests.iter().enumerate() {
            if let Err(err) = check_bulk_item(request) {
                warn!(backend = self.name(), index, error = %err, "bulk item skipped");
                continue;
            }
            pipe.publish(&request.channel, request.payload.as_ref())
                .ignore();
            queued += 1;
        }
        if queued == 0 {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(|err| {
            PushError::internal(format!("redis pipeline commit failed: {err}"))
        })?;
        Ok(())
    }

    async fn open_feed(
        &self,
        channel: &str,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub.into_on_message().map(|msg| {
            Ok(TopicEvent {
                topic: msg.get_channel_name().to_string(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            })
        });
        spawn_forwarder(channel.to_string(), stream, sink, cancel);
        Ok(())
    }
}

/// Durable delivery over Redis Streams.
///
/// Each channel maps to the stream [`stream_key`]. A feed reads from the
/// start of the stream, hands each entry to the subscriber and deletes it
/// once delivered, so records published while nobody listened are still
/// delivered later.
#[derive(Clone)]
pub struct RedisStreams {
    client: redis::Client,
    conn: ConnectionManager,
    poll_window: Duration,
}

impl RedisStreams {
    pub async fn connect(url: &str, poll_window: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!(url, poll_window_secs = poll_window.as_secs(), "connected to redis for streams");
        Ok(Self {
            client,
            conn,
            poll_window,
        })
    }
}

#[async_trait]
impl Broker for RedisStreams {
    fn name(&self) -> &'static str {
        "redis-streams"
    }

    async fn publish(&self, request: PublishRequest) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(
                stream_key(&request.channel),
                "*",
                &[(STREAM_DATA_FIELD, request.payload.as_ref())],
            )
            .await?;
        Ok(())
    }

    async fn publish_bulk(&self, requests: Vec<PublishRequest>) -> Result<()> {
        let mut pipe = redis::pipe();
        let mut queued = 0usize;
        for (index, request) in requests.iter().enumerate() {
            if let Err(err) = check_bulk_item(request) {
                warn!(backend = self.name(), index, error = %err, "bulk item skipped");
                continue;
            }
            pipe.xadd(
                stream_key(&request.channel),
                "*",
                &[(STREAM_DATA_FIELD, request.payload.as_ref())],
            )
            .ignore();
            queued += 1;
        }
        if queued == 0 {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(|err| {
            PushError::internal(format!("redis pipeline commit failed: {err}"))
        })?;
        Ok(())
    }

    async fn open_feed(
        &self,
        channel: &str,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        // Blocking reads would stall a shared connection, so each feed gets
        // its own with a response timeout past the poll window.
        let conn = self
            .client
            .get_multiplexed_async_connection_with_timeouts(
                self.poll_window + CONNECT_TIMEOUT,
                CONNECT_TIMEOUT,
            )
            .await?;
        tokio::spawn(consume_stream(
            channel.to_string(),
            conn,
            sink,
            cancel,
            self.poll_window,
        ));
        Ok(())
    }
}

async fn read_next(
    conn: &mut MultiplexedConnection,
    key: &str,
    last_id: &str,
    options: &StreamReadOptions,
) -> RedisResult<Option<StreamReadReply>> {
    conn.xread_options(&[key], &[last_id], options).await
}

async fn consume_stream(
    channel: String,
    mut conn: MultiplexedConnection,
    sink: EventSink,
    cancel: CancellationToken,
    poll_window: Duration,
) {
    let key = stream_key(&channel);
    let options = StreamReadOptions::default()
        .block(poll_window.as_millis() as usize)
        .count(1);
    let mut last_id = "0".to_string();

    loop {
        let reply = tokio::select! {
            _ = cancel.cancelled() => break,
            reply = read_next(&mut conn, &key, &last_id, &options) => reply,
        };

        let reply = match reply {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                sink.fail(PushError::internal(format!(
                    "reading stream {key} failed: {err}"
                )));
                break;
            }
        };

        for stream in reply.keys {
            for entry in stream.ids {
                last_id = entry.id.clone();
                let Some(data) = entry.get::<Vec<u8>>(STREAM_DATA_FIELD) else {
                    warn!(stream = %key, id = %entry.id, "stream entry without data field, skipping");
                    continue;
                };
                let event = TopicEvent {
                    topic: channel.clone(),
                    payload: Bytes::from(data),
                };
                if !sink.deliver(event) {
                    debug!(stream = %key, "subscriber gone, leaving entry in place");
                    return;
                }
                let deleted: RedisResult<i64> = conn.xdel(&stream.key, &[&entry.id]).await;
                if let Err(err) = deleted {
                    warn!(stream = %key, id = %entry.id, error = %err, "failed to delete delivered entry");
                }
            }
        }
    }
}
