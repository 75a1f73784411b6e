//! In-process publish/subscribe hub between the Supervisor and its consumers.
//!
//! Dispatch is synchronous and keyed by the exact [`EventKind`]: a handler
//! subscribed to `MessageReceived` never sees any other event. Handlers of
//! one kind run in subscription order on the publishing task. A panicking
//! handler is logged and skipped; the remaining handlers and the publisher
//! carry on.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use relaywire_proto::frame::MessageKind;

use crate::transfer::TransferUpdate;

/// Discriminant used to route events to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A chat or direct message arrived.
    MessageReceived,
    /// The relay pushed a new user list.
    UserListUpdated,
    /// A transfer moved forward, finished, or failed.
    TransferProgress,
    /// The active connection dropped and a reconnect is scheduled.
    ConnectionLost,
    /// A reconnect succeeded.
    Reconnected,
    /// An inbound envelope could not be opened and was discarded.
    DecryptionFailed,
}

/// Something the Supervisor wants consumers to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A message from a peer.
    MessageReceived {
        /// Sender username.
        from: String,
        /// Message body.
        text: String,
        /// User or system message.
        kind: MessageKind,
        /// `true` if it arrived sealed in an envelope.
        direct: bool,
    },
    /// Current users on the relay, in join order.
    UserListUpdated {
        /// Connected usernames.
        users: Vec<String>,
    },
    /// Transfer state change.
    TransferProgress(TransferUpdate),
    /// The connection dropped.
    ConnectionLost {
        /// Human-readable cause.
        reason: String,
    },
    /// A reconnect attempt succeeded.
    Reconnected {
        /// Number of attempts it took since the connection was lost.
        attempts: u32,
    },
    /// An envelope failed to open.
    DecryptionFailed {
        /// Claimed sender.
        from: String,
        /// Why it failed.
        reason: String,
    },
}

impl Event {
    /// The kind this event is dispatched under.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived { .. } => EventKind::MessageReceived,
            Self::UserListUpdated { .. } => EventKind::UserListUpdated,
            Self::TransferProgress(_) => EventKind::TransferProgress,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
            Self::Reconnected { .. } => EventKind::Reconnected,
            Self::DecryptionFailed { .. } => EventKind::DecryptionFailed,
        }
    }
}

/// Handle returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Exact-kind event dispatch table.
pub struct EventDispatcher {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every handler of its kind.
    ///
    /// The table lock is released before handlers run, so handlers may
    /// subscribe, unsubscribe, or publish. Returns how many handlers ran to
    /// completion.
    pub fn publish(&self, event: &Event) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_ok() {
                delivered += 1;
            } else {
                tracing::error!(kind = ?kind, "event handler panicked");
            }
        }
        delivered
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
