//! The `transport` module is the boundary between the network and a
//! session.
//!
//! A transport hands the session a [`Connection`]: the handshake metadata
//! (header names lower-cased), a cancellation token that fires when the
//! client goes away, and the two halves of a duplex message channel. The
//! session never sees frames or sockets.
//!
//! Implementations: [`websocket`] for real clients and [`local`] for
//! in-process use.

pub mod local;
pub mod message;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::utils::Result;

pub use message::{ChannelRequest, ChannelResponse, ResponseStatus};

/// Outbound half of a connection.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, response: ChannelResponse) -> Result<()>;
}

/// Inbound half of a connection.
///
/// `Ok(None)` means the client closed the stream. An `InvalidArgument`
/// error is a malformed message the caller may skip; any other error means
/// the connection is unusable.
#[async_trait]
pub trait ChannelReceiver: Send {
    async fn recv(&mut self) -> Result<Option<ChannelRequest>>;
}

pub struct Connection {
    pub metadata: HashMap<String, String>,
    pub cancel: CancellationToken,
    pub sender: Arc<dyn ChannelSender>,
    pub receiver: Box<dyn ChannelReceiver>,
}

impl Connection {
    pub fn new<I>(
        metadata: I,
        cancel: CancellationToken,
        sender: Arc<dyn ChannelSender>,
        receiver: Box<dyn ChannelReceiver>,
    ) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let metadata = metadata
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self {
            metadata,
            cancel,
            sender,
            receiver,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.metadata
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests;
