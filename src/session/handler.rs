use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::identity::Identity;
use crate::broker::TopicEvent;
use crate::push::{ClientSubscription, Event, PushService};
use crate::transport::{
    ChannelReceiver, ChannelRequest, ChannelResponse, ChannelSender, Connection, ResponseStatus,
};
use crate::utils::{Code, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Terminated,
}

/// One connected client, from handshake to disconnect.
pub struct Session {
    service: Arc<PushService>,
    state: SessionState,
}

impl Session {
    pub fn new(service: Arc<PushService>) -> Self {
        Self {
            service,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the connection until the client goes away.
    ///
    /// Fails only if the session never becomes active; the client is sent
    /// an `error` response first.
    pub async fn run(mut self, connection: Connection) -> Result<()> {
        let Connection {
            metadata,
            cancel,
            sender,
            receiver,
        } = connection;

        let identity = match Identity::from_metadata(&metadata, self.service.settings()) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(error = %err, "rejecting connection");
                let _ = sender.send(ChannelResponse::error(&err)).await;
                self.state = SessionState::Terminated;
                return Err(err);
            }
        };

        let span = info_span!(
            "session",
            client_id = %identity.client_id,
            device_id = identity.device_id().unwrap_or_default(),
        );
        self.drive(identity, cancel, sender, receiver)
            .instrument(span)
            .await
    }

    async fn drive(
        &mut self,
        identity: Identity,
        cancel: CancellationToken,
        sender: Arc<dyn ChannelSender>,
        receiver: Box<dyn ChannelReceiver>,
    ) -> Result<()> {
        let mut client = match self
            .service
            .async_client_subscribe(&identity.client_id, identity.device, &cancel)
            .await
        {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "failed to open client subscription");
                let _ = sender.send(ChannelResponse::error(&err)).await;
                self.state = SessionState::Terminated;
                return Err(err);
            }
        };

        let ack = ChannelResponse::ConnectAck {
            status: ResponseStatus::ok(),
            client_id: client.client_id.clone(),
            device_id: client.device_id().map(str::to_string),
            connected_at: client.connected_at,
        };
        if let Err(err) = sender.send(ack).await {
            warn!(error = %err, "failed to acknowledge connection");
            self.terminate(&client).await;
            return Err(err);
        }

        self.state = SessionState::Active;
        info!("session active");

        let (request_tx, mut requests) = mpsc::unbounded_channel();
        let reader = spawn_receiver(receiver, request_tx, sender.clone(), cancel.clone());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(err) = client.subscription.errors.recv() => {
                    warn!(error = %err, "subscription error");
                }
                Some(event) = client.subscription.events.recv() => {
                    self.on_event(&client, sender.as_ref(), &cancel, event).await;
                }
                Some(request) = requests.recv() => {
                    self.on_request(&client, sender.as_ref(), &cancel, request).await;
                }
            }
        }

        let _ = reader.await;
        self.terminate(&client).await;
        Ok(())
    }

    async fn on_event(
        &self,
        client: &ClientSubscription,
        sender: &dyn ChannelSender,
        cancel: &CancellationToken,
        event: TopicEvent,
    ) {
        let decoded = match Event::decode(&event.payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(topic = %event.topic, error = %err, "dropping undecodable event");
                return;
            }
        };

        if decoded.is_device_validation() {
            // Answered on the device's response topic, never shown to the client.
            if let Err(err) = self
                .service
                .confirm_device_validation(&client.client_id, &decoded)
                .await
            {
                warn!(error = %err, "failed to answer device validation");
            }
            return;
        }

        let name = decoded.name.clone();
        let response = ChannelResponse::ChannelEvent {
            topic: event.topic,
            event: decoded,
        };
        match sender.send(response).await {
            Ok(()) => self.service.record_received(&name),
            Err(err) => {
                warn!(error = %err, "failed to forward event, closing session");
                cancel.cancel();
            }
        }
    }

    async fn on_request(
        &self,
        client: &ClientSubscription,
        sender: &dyn ChannelSender,
        cancel: &CancellationToken,
        request: ChannelRequest,
    ) {
        let response = match request {
            ChannelRequest::TopicSubscribe { topic } => {
                let result = self.service.topic_subscribe(client, &topic).await;
                if let Err(err) = &result {
                    debug!(topic = %topic, error = %err, "topic subscribe failed");
                }
                ChannelResponse::TopicSubscribeAck {
                    status: ResponseStatus::from_result(&result),
                    topic,
                }
            }
            ChannelRequest::TopicUnsubscribe { topic } => {
                let result = self.service.topic_unsubscribe(client, &topic).await;
                if let Err(err) = &result {
                    debug!(topic = %topic, error = %err, "topic unsubscribe failed");
                }
                ChannelResponse::TopicUnsubscribeAck {
                    status: ResponseStatus::from_result(&result),
                    topic,
                }
            }
        };
        if let Err(err) = sender.send(response).await {
            warn!(error = %err, "failed to acknowledge request, closing session");
            cancel.cancel();
        }
    }

    /// Cleanup runs to completion even though the connection is cancelled.
    async fn terminate(&mut self, client: &ClientSubscription) {
        self.state = SessionState::Terminated;
        if let Err(err) = self.service.client_unsubscribe(client).await {
            warn!(error = %err, "failed to release client subscription");
        }
        info!("session terminated");
    }
}

/// Reads client requests into `requests` until EOF, a read error, or
/// cancellation. EOF and read errors cancel the connection.
fn spawn_receiver(
    mut receiver: Box<dyn ChannelReceiver>,
    requests: mpsc::UnboundedSender<ChannelRequest>,
    sender: Arc<dyn ChannelSender>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = receiver.recv() => next,
                };
                match next {
                    Ok(Some(request)) => {
                        if requests.send(request).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("client closed the stream");
                        cancel.cancel();
                        break;
                    }
                    Err(err) if err.code() == Code::InvalidArgument => {
                        warn!(error = %err, "skipping malformed request");
                        let _ = sender.send(ChannelResponse::error(&err)).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "transport read failed");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    )
}
