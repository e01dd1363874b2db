use super::local;
use super::message::{ChannelRequest, ChannelResponse, ResponseStatus};
use super::websocket::start_websocket_server;
use crate::broker::MemoryPubSub;
use crate::config::PushSettings;
use crate::persistence::MemoryPresenceStore;
use crate::pubsub::PubSub;
use crate::push::{Event, InMemoryMetrics, NoopMetrics, PushService};
use crate::utils::PushError;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (SocketAddr, Arc<PushService>, CancellationToken) {
    let pubsub = Arc::new(PubSub::new(Arc::new(MemoryPubSub::new())));
    let service = Arc::new(PushService::new(
        pubsub,
        Arc::new(MemoryPresenceStore::new()),
        Arc::new(NoopMetrics),
        PushSettings::default(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(start_websocket_server(
        listener,
        service.clone(),
        shutdown.clone(),
    ));
    (addr, service, shutdown)
}

async fn connect(addr: SocketAddr, client_id: Option<&'static str>) -> Client {
    let mut request = format!("ws://{addr}").into_client_request().unwrap();
    if let Some(client_id) = client_id {
        request
            .headers_mut()
            .insert("x-client-id", HeaderValue::from_static(client_id));
    }
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

async fn next_response(ws: &mut Client) -> ChannelResponse {
    loop {
        let msg = timeout(Duration::from_secs(1), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read failed");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[test]
fn test_request_wire_format() {
    let req: ChannelRequest =
        serde_json::from_value(json!({"type": "topic_subscribe", "topic": "news"})).unwrap();
    assert_eq!(
        req,
        ChannelRequest::TopicSubscribe {
            topic: "news".to_string()
        }
    );
    assert!(serde_json::from_value::<ChannelRequest>(json!({"type": "publish"})).is_err());
}

#[test]
fn test_response_wire_format() {
    let ack = ChannelResponse::TopicUnsubscribeAck {
        topic: "news".to_string(),
        status: ResponseStatus::ok(),
    };
    assert_eq!(
        serde_json::to_value(&ack).unwrap(),
        json!({"type": "topic_unsubscribe_ack", "topic": "news", "status": {"success": true}})
    );

    let err = ChannelResponse::error(&PushError::not_found("topic news is not registered"));
    assert_eq!(
        serde_json::to_value(&err).unwrap(),
        json!({
            "type": "error",
            "status": {
                "success": false,
                "error_code": "NOT_FOUND",
                "message": "topic news is not registered"
            }
        })
    );
}

#[test]
fn test_connection_metadata_is_case_insensitive() {
    let (connection, _client) = local::connect(vec![(
        "X-Client-Id".to_string(),
        "c1".to_string(),
    )]);
    assert!(connection.metadata.contains_key("x-client-id"));
    assert_eq!(connection.header("X-CLIENT-ID"), Some("c1"));
    assert_eq!(connection.header("x-device-id"), None);
}

#[tokio::test]
async fn test_websocket_session_round_trip() {
    let (addr, service, shutdown) = start_server().await;
    let mut ws = connect(addr, Some("c1")).await;

    match next_response(&mut ws).await {
        ChannelResponse::ConnectAck { client_id, .. } => assert_eq!(client_id, "c1"),
        other => panic!("expected connect_ack, got {other:?}"),
    }

    ws.send(WsMessage::Text(
        json!({"type": "topic_subscribe", "topic": "news"})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    assert_eq!(
        next_response(&mut ws).await,
        ChannelResponse::TopicSubscribeAck {
            topic: "news".to_string(),
            status: ResponseStatus::ok(),
        }
    );

    let event = Event::new("headline", json!({"title": "hello"}));
    service.publish_to_topic("news", &event).await.unwrap();
    match next_response(&mut ws).await {
        ChannelResponse::ChannelEvent { topic, event: got } => {
            assert_eq!(topic, "news");
            assert_eq!(got, event);
        }
        other => panic!("expected channel_event, got {other:?}"),
    }

    ws.close(None).await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn test_websocket_malformed_request_is_reported() {
    let (addr, service, shutdown) = start_server().await;
    let mut ws = connect(addr, Some("c2")).await;
    next_response(&mut ws).await;

    ws.send(WsMessage::Text("{not json".into())).await.unwrap();
    match next_response(&mut ws).await {
        ChannelResponse::Error { status } => {
            assert_eq!(status.error_code.as_deref(), Some("INVALID_ARGUMENT"));
        }
        other => panic!("expected error, got {other:?}"),
    }

    // the session keeps running
    let event = Event::new("ping", json!(1));
    service.publish_to_client("c2", &event).await.unwrap();
    match next_response(&mut ws).await {
        ChannelResponse::ChannelEvent { topic, .. } => assert_eq!(topic, "c2"),
        other => panic!("expected channel_event, got {other:?}"),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_websocket_rejects_missing_identity() {
    let (addr, _service, shutdown) = start_server().await;
    let mut ws = connect(addr, None).await;

    match next_response(&mut ws).await {
        ChannelResponse::Error { status } => {
            assert_eq!(status.error_code.as_deref(), Some("INVALID_ARGUMENT"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    // server closes after the error
    let closed = timeout(Duration::from_secs(1), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    shutdown.cancel();
}

#[tokio::test]
async fn test_websocket_identity_from_query() {
    let (addr, _service, shutdown) = start_server().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/?x-client-id=c9"))
        .await
        .unwrap();
    match next_response(&mut ws).await {
        ChannelResponse::ConnectAck { client_id, .. } => assert_eq!(client_id, "c9"),
        other => panic!("expected connect_ack, got {other:?}"),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_waits_for_session_cleanup() {
    let presence = Arc::new(MemoryPresenceStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let settings = PushSettings {
        enable_device_support: true,
        ..PushSettings::default()
    };
    let service = Arc::new(PushService::new(
        Arc::new(PubSub::new(Arc::new(MemoryPubSub::new()))),
        presence.clone(),
        metrics.clone(),
        settings,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(start_websocket_server(listener, service, shutdown.clone()));

    let mut request = format!("ws://{addr}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-client-id", HeaderValue::from_static("c1"));
    request
        .headers_mut()
        .insert("x-device-id", HeaderValue::from_static("d1"));
    let (mut ws, _) = connect_async(request).await.unwrap();
    match next_response(&mut ws).await {
        ChannelResponse::ConnectAck { client_id, .. } => assert_eq!(client_id, "c1"),
        other => panic!("expected connect_ack, got {other:?}"),
    }
    assert!(presence.contains_client("c1"));
    assert_eq!(metrics.connected_clients(), 1);

    shutdown.cancel();
    timeout(Duration::from_secs(10), server)
        .await
        .expect("server did not stop")
        .unwrap();

    assert!(!presence.contains_client("c1"));
    assert_eq!(metrics.connected_clients(), 0);
    assert_eq!(metrics.completed_sessions(), 1);
}
