//! Outbound storage events
//!
//! The store announces expirations and deletions to the daemon's notification
//! bus. The sink is injected at construction as a plain mpsc sender; a store
//! built without one simply stays silent. Explicit `remove` calls announce
//! nothing: only the store's own decisions (expiry, corruption purges,
//! quota-driven drops) are announced.

use caravel_bundle::BundleId;
use tokio::sync::mpsc;
use tracing::trace;

/// Why a bundle was deleted by the store itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    /// The bundle's lifetime elapsed
    LifetimeExpired,
    /// The bundle was dropped to reclaim storage
    DepletedStorage,
    /// The durable record was missing or corrupt and has been purged
    Unrecoverable,
}

impl std::fmt::Display for DeletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletionReason::LifetimeExpired => write!(f, "lifetime expired"),
            DeletionReason::DepletedStorage => write!(f, "depleted storage"),
            DeletionReason::Unrecoverable => write!(f, "unrecoverable"),
        }
    }
}

/// Events raised by the store towards the notification bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A bundle's lifetime elapsed and it was removed
    BundleExpired {
        /// Identity of the expired bundle
        id: BundleId,
    },
    /// The store deleted a bundle on its own initiative
    BundleDeleted {
        /// Identity of the deleted bundle
        id: BundleId,
        /// Why the store deleted it
        reason: DeletionReason,
    },
}

/// Sender half of the notification channel, injected into the store
pub type EventSender = mpsc::UnboundedSender<StoreEvent>;

/// Internal wrapper that tolerates an absent or closed sink
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    sender: Option<EventSender>,
}

impl EventSink {
    pub(crate) fn new(sender: Option<EventSender>) -> Self {
        Self { sender }
    }

    /// Emit an event, dropping it if nobody listens
    pub(crate) fn emit(&self, event: StoreEvent) {
        if let Some(sender) = &self.sender
            && sender.send(event).is_err()
        {
            trace!("Event sink closed, dropping storage event");
        }
    }
}
