use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{EventSink, TopicEvent};
use crate::utils::{PushError, Result};

/// A live subscription: one event queue fed by one forwarding task per channel.
///
/// Each attached channel owns a child of the handle's root token, so a single
/// channel can be detached without disturbing the others, and closing the
/// handle stops them all.
#[derive(Debug)]
pub struct SubscriptionHandle {
    sink: EventSink,
    root: CancellationToken,
    feeds: DashMap<String, CancellationToken>,
    closed: AtomicBool,
}

impl SubscriptionHandle {
    pub fn new(sink: EventSink, parent: &CancellationToken) -> Self {
        Self {
            sink,
            root: parent.child_token(),
            feeds: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// A clone of the sink every feed of this handle writes into.
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.root.is_cancelled()
    }

    /// Channels currently attached, in no particular order.
    pub fn channels(&self) -> Vec<String> {
        self.feeds.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.feeds.contains_key(channel)
    }

    /// Reserves `channel` and returns the token its feed must observe.
    ///
    /// `None` means the channel is already attached.
    pub(crate) fn attach(&self, channel: &str) -> Result<Option<CancellationToken>> {
        if self.is_closed() {
            return Err(PushError::failed_precondition("subscription is already closed"));
        }
        match self.feeds.entry(channel.to_string()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let token = self.root.child_token();
                slot.insert(token.clone());
                Ok(Some(token))
            }
        }
    }

    /// Stops the feed for `channel`. Returns `false` if it was not attached.
    pub(crate) fn detach(&self, channel: &str) -> bool {
        match self.feeds.remove(channel) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops every feed. Fails if the handle was already closed.
    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(PushError::failed_precondition("subscription is already closed"));
        }
        self.root.cancel();
        self.feeds.clear();
        Ok(())
    }
}

/// Spawns the task that copies a backend stream into the handle's queues.
///
/// Items that are `Err` go to the error queue; the task keeps running. It
/// exits when `cancel` fires, the stream ends, or the subscriber goes away.
pub(crate) fn spawn_forwarder<S>(channel: String, stream: S, sink: EventSink, cancel: CancellationToken)
where
    S: Stream<Item = Result<TopicEvent>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!(channel = %channel, "feed cancelled");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if !sink.deliver(event) {
                            debug!(channel = %channel, "subscriber gone, stopping feed");
                            break;
                        }
                    }
                    Some(Err(err)) => sink.fail(err),
                    None => {
                        debug!(channel = %channel, "backend feed ended");
                        break;
                    }
                },
            }
        }
    });
}
