use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::TopicEvent;
use crate::utils::PushError;

/// A logical subscription: one merged event queue and one error queue.
///
/// Owned by whoever opened it (a session, or a device validation query).
/// The registry only tracks the broker handles behind it.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub events: UnboundedReceiver<TopicEvent>,
    pub errors: UnboundedReceiver<PushError>,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        id: Uuid,
        events: UnboundedReceiver<TopicEvent>,
        errors: UnboundedReceiver<PushError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            events,
            errors,
            cancel,
        }
    }

    /// Token every feed of this subscription descends from.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
