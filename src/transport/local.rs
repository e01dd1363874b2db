//! In-process transport over tokio channels.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ChannelReceiver, ChannelRequest, ChannelResponse, ChannelSender, Connection};
use crate::utils::{PushError, Result};
use std::sync::Arc;

struct LocalSender {
    responses: mpsc::UnboundedSender<ChannelResponse>,
}

#[async_trait]
impl ChannelSender for LocalSender {
    async fn send(&self, response: ChannelResponse) -> Result<()> {
        self.responses
            .send(response)
            .map_err(|_| PushError::internal("local client is gone"))
    }
}

struct LocalReceiver {
    requests: mpsc::UnboundedReceiver<ChannelRequest>,
}

#[async_trait]
impl ChannelReceiver for LocalReceiver {
    async fn recv(&mut self) -> Result<Option<ChannelRequest>> {
        Ok(self.requests.recv().await)
    }
}

/// Client side of a local connection. Dropping `requests` closes the stream.
pub struct LocalClient {
    pub requests: mpsc::UnboundedSender<ChannelRequest>,
    pub responses: mpsc::UnboundedReceiver<ChannelResponse>,
}

/// Builds a connected pair: the server-side [`Connection`] and its client.
pub fn connect<I>(metadata: I) -> (Connection, LocalClient)
where
    I: IntoIterator<Item = (String, String)>,
{
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let connection = Connection::new(
        metadata,
        CancellationToken::new(),
        Arc::new(LocalSender {
            responses: response_tx,
        }),
        Box::new(LocalReceiver {
            requests: request_rx,
        }),
    );
    let client = LocalClient {
        requests: request_tx,
        responses: response_rx,
    };
    (connection, client)
}
