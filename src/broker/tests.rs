use super::memory::{MemoryPubSub, MemoryStreams};
use super::nats::nats_safe_name;
use super::redis::stream_key;
use super::{Broker, EventSink, PublishRequest, TopicEvent, publish_each};
use crate::utils::{Code, PushError};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn next_event(rx: &mut UnboundedReceiver<TopicEvent>) -> TopicEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event queue closed")
}

async fn assert_quiet(rx: &mut UnboundedReceiver<TopicEvent>) {
    let res = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(res.is_err(), "unexpected event: {:?}", res);
}

#[tokio::test]
async fn test_memory_pubsub_merges_channels_into_one_queue() {
    let broker = MemoryPubSub::new();
    let (sink, mut events, _errors) = EventSink::channel();
    let root = CancellationToken::new();

    let handle = broker
        .subscribe(&["a".to_string(), "b".to_string()], sink, &root)
        .await
        .unwrap();
    assert_eq!(handle.channels().len(), 2);

    broker.publish(PublishRequest::new("a", "one")).await.unwrap();
    broker.publish(PublishRequest::new("b", "two")).await.unwrap();

    let first = next_event(&mut events).await;
    let second = next_event(&mut events).await;
    let mut got = vec![first, second];
    got.sort_by(|x, y| x.topic.cmp(&y.topic));
    assert_eq!(got[0].topic, "a");
    assert_eq!(got[0].payload, Bytes::from("one"));
    assert_eq!(got[1].topic, "b");
    assert_eq!(got[1].payload, Bytes::from("two"));
}

#[tokio::test]
async fn test_publish_without_subscribers_is_dropped() {
    let broker = MemoryPubSub::new();
    broker
        .publish(PublishRequest::new("nobody", "lost"))
        .await
        .unwrap();

    let (sink, mut events, _errors) = EventSink::channel();
    let root = CancellationToken::new();
    let _handle = broker
        .subscribe(&["nobody".to_string()], sink, &root)
        .await
        .unwrap();
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_add_and_remove_subscription() {
    let broker = MemoryPubSub::new();
    let (sink, mut events, _errors) = EventSink::channel();
    let root = CancellationToken::new();
    let handle = broker.subscribe(&[], sink, &root).await.unwrap();

    assert!(broker.add_subscription("news", &handle).await.unwrap());
    assert!(handle.contains("news"));
    broker.publish(PublishRequest::new("news", "hi")).await.unwrap();
    assert_eq!(next_event(&mut events).await.topic, "news");

    broker.remove_subscription("news", &handle).await.unwrap();
    assert!(!handle.contains("news"));
    // give the forwarder a moment to observe cancellation
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.publish(PublishRequest::new("news", "again")).await.unwrap();
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_adding_same_channel_twice_keeps_one_feed() {
    let broker = MemoryPubSub::new();
    let (sink, mut events, _errors) = EventSink::channel();
    let root = CancellationToken::new();
    let handle = broker
        .subscribe(&["dup".to_string()], sink, &root)
        .await
        .unwrap();
    assert!(!broker.add_subscription("dup", &handle).await.unwrap());

    broker.publish(PublishRequest::new("dup", "once")).await.unwrap();
    next_event(&mut events).await;
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_remove_unknown_channel_is_not_found() {
    let broker = MemoryPubSub::new();
    let (sink, _events, _errors) = EventSink::channel();
    let root = CancellationToken::new();
    let handle = broker.subscribe(&[], sink, &root).await.unwrap();

    let err = broker
        .remove_subscription("missing", &handle)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_unsubscribe_twice_fails() {
    let broker = MemoryPubSub::new();
    let (sink, _events, _errors) = EventSink::channel();
    let root = CancellationToken::new();
    let handle = broker
        .subscribe(&["x".to_string()], sink, &root)
        .await
        .unwrap();

    broker.unsubscribe(&handle).await.unwrap();
    assert!(handle.is_closed());
    assert!(handle.channels().is_empty());

    let err = broker.unsubscribe(&handle).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let err = broker.add_subscription("y", &handle).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn test_cancelling_parent_stops_feeds() {
    let broker = MemoryPubSub::new();
    let (sink, mut events, _errors) = EventSink::channel();
    let root = CancellationToken::new();
    let handle = broker
        .subscribe(&["c".to_string()], sink, &root)
        .await
        .unwrap();

    root.cancel();
    assert!(handle.is_closed());
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.publish(PublishRequest::new("c", "late")).await.unwrap();
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_memory_streams_keep_records_until_delivered() {
    let broker = MemoryStreams::new(Duration::from_millis(50));
    broker
        .publish(PublishRequest::new("orders", "first"))
        .await
        .unwrap();
    broker
        .publish(PublishRequest::new("orders", "second"))
        .await
        .unwrap();
    assert_eq!(broker.pending("orders"), 2);

    let (sink, mut events, _errors) = EventSink::channel();
    let root = CancellationToken::new();
    let _handle = broker
        .subscribe(&["orders".to_string()], sink, &root)
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await.payload, Bytes::from("first"));
    assert_eq!(next_event(&mut events).await.payload, Bytes::from("second"));
    assert_eq!(broker.pending("orders"), 0);

    broker
        .publish(PublishRequest::new("orders", "third"))
        .await
        .unwrap();
    let third = next_event(&mut events).await;
    assert_eq!(third.topic, "orders");
    assert_eq!(third.payload, Bytes::from("third"));
}

#[tokio::test]
async fn test_publish_each_continues_past_failures() {
    let requests = vec![
        PublishRequest::new("a", "1"),
        PublishRequest::new("b", "2"),
        PublishRequest::new("c", "3"),
    ];
    let mut attempted = Vec::new();
    let failed = publish_each("test", requests, |request| {
        attempted.push(request.channel.clone());
        let fail = request.channel == "b";
        async move {
            if fail {
                Err(PushError::internal("boom"))
            } else {
                Ok(())
            }
        }
    })
    .await;

    assert_eq!(failed, 1);
    assert_eq!(attempted, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_bulk_skips_invalid_items_and_delivers_the_rest() {
    let broker = MemoryPubSub::new();
    let (sink, mut events, _errors) = EventSink::channel();
    let root = CancellationToken::new();
    let _handle = broker
        .subscribe(&["ok".to_string()], sink, &root)
        .await
        .unwrap();

    broker
        .publish_bulk(vec![
            PublishRequest::new("ok", "1"),
            PublishRequest::new("", "bad"),
            PublishRequest::new("ok", "3"),
        ])
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await.payload, Bytes::from("1"));
    assert_eq!(next_event(&mut events).await.payload, Bytes::from("3"));
}

#[test]
fn test_backend_names() {
    assert_eq!(stream_key("c1--d1"), "c1--d1-stream");
    assert_eq!(nats_safe_name("c1#d1#resp"), "YzEjZDEjcmVzcA");
}

#[test]
fn test_nats_names_are_distinct_and_valid() {
    let inputs = [
        "a@b.c", "a.b@c", "a_b_c", "a-b-c", "c1--d1", "c1#d1#resp", "c1", "c1 ",
        "user.one", "user_one", "ü", "u",
    ];
    let names: Vec<String> = inputs.iter().map(|input| nats_safe_name(input)).collect();
    for (i, name) in names.iter().enumerate() {
        assert!(
            name.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "{name} is not a valid nats name"
        );
        for (j, other) in names.iter().enumerate().skip(i + 1) {
            assert_ne!(name, other, "{} and {} share a name", inputs[i], inputs[j]);
        }
    }
}
