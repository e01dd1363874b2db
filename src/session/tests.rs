use super::{Identity, Session, SessionState};
use crate::broker::{MemoryPubSub, PublishRequest};
use crate::config::PushSettings;
use crate::persistence::{MemoryPresenceStore, PresenceStore};
use crate::pubsub::PubSub;
use crate::push::{Device, Event, InMemoryMetrics, PushService, response_topic};
use crate::transport::local::{self, LocalClient};
use crate::transport::{ChannelRequest, ChannelResponse, ResponseStatus};
use crate::utils::{Code, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Harness {
    service: Arc<PushService>,
    pubsub: Arc<PubSub>,
    presence: Arc<MemoryPresenceStore>,
    metrics: Arc<InMemoryMetrics>,
}

fn harness(settings: PushSettings) -> Harness {
    let pubsub = Arc::new(PubSub::new(Arc::new(MemoryPubSub::new())));
    let presence = Arc::new(MemoryPresenceStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let service = Arc::new(PushService::new(
        pubsub.clone(),
        presence.clone(),
        metrics.clone(),
        settings,
    ));
    Harness {
        service,
        pubsub,
        presence,
        metrics,
    }
}

fn device_settings() -> PushSettings {
    PushSettings {
        enable_device_support: true,
        device_attribute_headers: vec!["os".to_string()],
        device_validation_timeout_ms: 300,
        ..PushSettings::default()
    }
}

fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn start(service: Arc<PushService>, pairs: &[(&str, &str)]) -> (JoinHandle<Result<()>>, LocalClient) {
    let (connection, client) = local::connect(headers(pairs));
    let session = tokio::spawn(Session::new(service).run(connection));
    (session, client)
}

async fn next_response(client: &mut LocalClient) -> ChannelResponse {
    timeout(Duration::from_secs(1), client.responses.recv())
        .await
        .expect("timed out waiting for response")
        .expect("response channel closed")
}

async fn assert_no_response(client: &mut LocalClient) {
    let res = timeout(Duration::from_millis(150), client.responses.recv()).await;
    assert!(res.is_err(), "unexpected response: {:?}", res);
}

async fn expect_connect_ack(client: &mut LocalClient) {
    match next_response(client).await {
        ChannelResponse::ConnectAck { status, .. } => assert!(status.success),
        other => panic!("expected connect_ack, got {other:?}"),
    }
}

#[test]
fn test_identity_from_metadata() {
    let settings = device_settings();
    let metadata: HashMap<String, String> = headers(&[
        ("x-client-id", "c1"),
        ("x-device-id", " d1 "),
        ("os", "android"),
        ("ignored", "x"),
    ])
    .into_iter()
    .collect();

    let identity = Identity::from_metadata(&metadata, &settings).unwrap();
    assert_eq!(identity.client_id, "c1");
    assert_eq!(
        identity.device,
        Some(Device::new("d1").with_attribute("os", "android"))
    );

    let without_device: HashMap<String, String> =
        headers(&[("x-client-id", "c1")]).into_iter().collect();
    let err = Identity::from_metadata(&without_device, &settings).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let plain = PushSettings::default();
    let identity = Identity::from_metadata(&without_device, &plain).unwrap();
    assert_eq!(identity.device, None);

    let blank: HashMap<String, String> = headers(&[("x-client-id", "  ")]).into_iter().collect();
    let err = Identity::from_metadata(&blank, &plain).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_missing_client_header_never_becomes_active() {
    let h = harness(PushSettings::default());
    assert_eq!(Session::new(h.service.clone()).state(), SessionState::Connecting);
    let (session, mut client) = start(h.service.clone(), &[("x-other", "1")]);

    match next_response(&mut client).await {
        ChannelResponse::Error { status } => {
            assert!(!status.success);
            assert_eq!(status.error_code.as_deref(), Some("INVALID_ARGUMENT"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    let err = session.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(h.metrics.connected_clients(), 0);
    assert_eq!(h.pubsub.registered(), 0);
}

#[tokio::test]
async fn test_active_session_forwards_events_and_handles_topics() {
    let h = harness(PushSettings::default());
    let (session, mut client) = start(h.service.clone(), &[("X-Client-Id", "c1")]);

    match next_response(&mut client).await {
        ChannelResponse::ConnectAck {
            status,
            client_id,
            device_id,
            ..
        } => {
            assert_eq!(status, ResponseStatus::ok());
            assert_eq!(client_id, "c1");
            assert_eq!(device_id, None);
        }
        other => panic!("expected connect_ack, got {other:?}"),
    }

    let event = Event::new("promo", json!({"discount": 10}));
    h.service.publish_to_client("c1", &event).await.unwrap();
    match next_response(&mut client).await {
        ChannelResponse::ChannelEvent { topic, event: got } => {
            assert_eq!(topic, "c1");
            assert_eq!(got, event);
        }
        other => panic!("expected channel_event, got {other:?}"),
    }

    client
        .requests
        .send(ChannelRequest::TopicSubscribe {
            topic: "sports".to_string(),
        })
        .unwrap();
    assert_eq!(
        next_response(&mut client).await,
        ChannelResponse::TopicSubscribeAck {
            topic: "sports".to_string(),
            status: ResponseStatus::ok(),
        }
    );

    let goal = Event::new("goal", json!("90'"));
    h.service.publish_to_topic("sports", &goal).await.unwrap();
    match next_response(&mut client).await {
        ChannelResponse::ChannelEvent { topic, .. } => assert_eq!(topic, "sports"),
        other => panic!("expected channel_event, got {other:?}"),
    }

    client
        .requests
        .send(ChannelRequest::TopicUnsubscribe {
            topic: "weather".to_string(),
        })
        .unwrap();
    match next_response(&mut client).await {
        ChannelResponse::TopicUnsubscribeAck { topic, status } => {
            assert_eq!(topic, "weather");
            assert!(!status.success);
            assert_eq!(status.error_code.as_deref(), Some("NOT_FOUND"));
        }
        other => panic!("expected topic_unsubscribe_ack, got {other:?}"),
    }

    assert_eq!(h.metrics.received("promo"), 1);
    assert_eq!(h.metrics.received("goal"), 1);

    drop(client.requests);
    timeout(Duration::from_secs(1), session)
        .await
        .expect("session did not end")
        .unwrap()
        .unwrap();
    assert_eq!(h.pubsub.registered(), 0);
    assert_eq!(h.metrics.connected_clients(), 0);
}

#[tokio::test]
async fn test_undecodable_events_are_dropped() {
    let h = harness(PushSettings::default());
    let (_session, mut client) = start(h.service.clone(), &[("x-client-id", "c1")]);
    expect_connect_ack(&mut client).await;

    h.pubsub
        .publish(PublishRequest::new("c1", "not an event"))
        .await
        .unwrap();
    assert_no_response(&mut client).await;

    let event = Event::new("still-alive", json!(true));
    h.service.publish_to_client("c1", &event).await.unwrap();
    match next_response(&mut client).await {
        ChannelResponse::ChannelEvent { event: got, .. } => assert_eq!(got, event),
        other => panic!("expected channel_event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_device_validation_is_echoed_not_forwarded() {
    let h = harness(device_settings());
    let (_session, mut client) = start(
        h.service.clone(),
        &[("x-client-id", "c1"), ("x-device-id", "d1")],
    );
    expect_connect_ack(&mut client).await;

    let root = CancellationToken::new();
    let mut responses = h
        .pubsub
        .async_subscribe(&[response_topic("c1", "d1")], &root)
        .await
        .unwrap();

    let ping = Event::device_validation("d1");
    h.pubsub
        .publish(PublishRequest::new("c1--d1", ping.encode().unwrap()))
        .await
        .unwrap();

    let echo = timeout(Duration::from_secs(1), responses.events.recv())
        .await
        .expect("no echo")
        .expect("queue closed");
    assert_eq!(echo.topic, "c1#d1#resp");
    let decoded = Event::decode(&echo.payload).unwrap();
    assert_eq!(decoded.name, "c1#d1#resp");
    assert_eq!(decoded.data, json!("d1"));

    assert!(
        timeout(Duration::from_millis(150), responses.events.recv())
            .await
            .is_err(),
        "more than one echo"
    );
    assert_no_response(&mut client).await;
    assert_eq!(h.metrics.total_received(), 0);
}

#[tokio::test]
async fn test_cancelling_the_connection_terminates_the_session() {
    let h = harness(PushSettings::default());
    let (connection, mut client) = local::connect(headers(&[("x-client-id", "c1")]));
    let cancel = connection.cancel.clone();
    let session = tokio::spawn(Session::new(h.service.clone()).run(connection));
    expect_connect_ack(&mut client).await;
    assert_eq!(h.metrics.connected_clients(), 1);

    cancel.cancel();
    timeout(Duration::from_secs(1), session)
        .await
        .expect("session did not end")
        .unwrap()
        .unwrap();
    assert_eq!(h.metrics.connected_clients(), 0);
    assert_eq!(h.metrics.completed_sessions(), 1);
    assert_eq!(h.pubsub.registered(), 0);
}

#[tokio::test]
async fn test_device_presence_follows_the_session() {
    let disabled = harness(PushSettings::default());
    let err = disabled
        .service
        .publish_to_client_with_device("c1", "d1", &Event::new("e", json!(1)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let h = harness(device_settings());
    let (session, mut client) = start(
        h.service.clone(),
        &[("x-client-id", "c1"), ("x-device-id", "d1"), ("os", "android")],
    );
    expect_connect_ack(&mut client).await;

    let active = h.service.get_client_active_devices("c1").await.unwrap();
    assert!(active.is_client_online);
    assert_eq!(
        active.devices,
        vec![Device::new("d1").with_attribute("os", "android")]
    );

    drop(client.requests);
    timeout(Duration::from_secs(1), session)
        .await
        .expect("session did not end")
        .unwrap()
        .unwrap();

    let active = h.service.get_client_active_devices("c1").await.unwrap();
    assert!(!active.is_client_online);
    assert!(active.devices.is_empty());
    assert!(!h.presence.load("c1").await.unwrap().contains_key("d1"));
}
