//! WebSocket transport
//!
//! Accepts TCP connections, upgrades them with `tokio-tungstenite` and runs
//! one [`Session`] per connection:
//! - identity metadata comes from the handshake headers, with query
//!   parameters as a fallback for clients that cannot set headers
//! - outbound responses go through a channel drained by a writer task, so
//!   the session never waits on the socket
//! - inbound text/binary frames are parsed as JSON [`ChannelRequest`]s
//!
//! A malformed frame is reported to the client and skipped. A read error or
//! close frame ends the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::Message as WsMessage;

use super::{ChannelReceiver, ChannelRequest, ChannelResponse, ChannelSender, Connection};
use crate::push::PushService;
use crate::session::Session;
use crate::utils::{PushError, Result};

/// Time granted to open sessions to finish their cleanup once shutdown fires.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Serves WebSocket clients on `listener` until `shutdown` fires.
///
/// Returns once every connection task has finished its session cleanup, or
/// after [`SHUTDOWN_GRACE`], whichever comes first.
pub async fn start_websocket_server(
    listener: TcpListener,
    service: Arc<PushService>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("websocket server listening on ws://{addr}");
    }

    let mut sessions = JoinSet::new();
    loop {
        while let Some(result) = sessions.try_join_next() {
            if let Err(err) = result {
                warn!(error = %err, "connection task panicked");
            }
        }

        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                sessions.spawn(handle_connection(
                    stream,
                    peer,
                    service.clone(),
                    shutdown.child_token(),
                ));
            }
            Err(err) => warn!(error = %err, "failed to accept connection"),
        }
    }

    let open = sessions.len();
    let drained = timeout(SHUTDOWN_GRACE, async {
        while let Some(result) = sessions.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "connection task panicked");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = sessions.len(), "sessions did not finish in time, aborting");
        sessions.shutdown().await;
    }
    info!(sessions = open, "websocket server stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<PushService>,
    cancel: CancellationToken,
) {
    let mut metadata = Vec::new();
    let capture = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        metadata.extend(handshake_metadata(request));
        Ok(response)
    };
    let ws = match accept_hdr_async(stream, capture).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(%peer, error = %err, "websocket handshake failed");
            return;
        }
    };
    debug!(%peer, "websocket connected");

    let (mut ws_sender, ws_receiver) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(err) = ws_sender.send(msg).await {
                debug!(%peer, error = %err, "failed to write to websocket");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let connection = Connection::new(
        metadata,
        cancel,
        Arc::new(WsSender { outbound: tx }),
        Box::new(WsReceiver {
            inbound: ws_receiver,
        }),
    );
    if let Err(err) = Session::new(service).run(connection).await {
        debug!(%peer, error = %err, "session ended with error");
    }

    // The session dropped the last sender, so the writer drains and closes.
    let _ = writer.await;
    debug!(%peer, "websocket closed");
}

/// Header pairs of the upgrade request, then query parameters not already
/// present as headers.
fn handshake_metadata(request: &Request) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    if let Some(query) = request.uri().query() {
        for (name, value) in query.split('&').filter_map(|pair| pair.split_once('=')) {
            let name = name.to_ascii_lowercase();
            if !pairs.iter().any(|(existing, _)| *existing == name) {
                pairs.push((name, value.to_string()));
            }
        }
    }
    pairs
}

struct WsSender {
    outbound: mpsc::UnboundedSender<WsMessage>,
}

#[async_trait]
impl ChannelSender for WsSender {
    async fn send(&self, response: ChannelResponse) -> Result<()> {
        let text = serde_json::to_string(&response)?;
        self.outbound
            .send(WsMessage::Text(text.into()))
            .map_err(|_| PushError::internal("websocket writer is closed"))
    }
}

struct WsReceiver {
    inbound: SplitStream<WebSocketStream<TcpStream>>,
}

fn parse_request(raw: &[u8]) -> Result<ChannelRequest> {
    serde_json::from_slice(raw)
        .map_err(|err| PushError::invalid_argument(format!("malformed request: {err}")))
}

#[async_trait]
impl ChannelReceiver for WsReceiver {
    async fn recv(&mut self) -> Result<Option<ChannelRequest>> {
        loop {
            match self.inbound.next().await {
                Some(Ok(WsMessage::Text(text))) => return parse_request(text.as_bytes()).map(Some),
                Some(Ok(WsMessage::Binary(bytes))) => return parse_request(&bytes).map(Some),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    return Err(PushError::internal(format!("websocket read failed: {err}")));
                }
            }
        }
    }
}
