//! Event dispatch to session consumers.
//!
//! Consumers register for one [`EventKind`] or for everything and get a
//! broadcast receiver. A receiver that falls more than `capacity` events
//! behind loses the oldest ones and sees `RecvError::Lagged`.

use crate::event::{EventKind, SessionEvent};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default broadcast capacity per event kind.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fans session events out to registered consumers.
pub struct Dispatcher {
    /// Per-kind senders, created on first registration.
    senders: DashMap<EventKind, broadcast::Sender<Arc<SessionEvent>>>,
    /// Sender for consumers that want every event.
    all: broadcast::Sender<Arc<SessionEvent>>,
    capacity: usize,
}

impl Dispatcher {
    /// Create a dispatcher with the given per-receiver capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            senders: DashMap::new(),
            all,
            capacity,
        }
    }

    /// Register interest in one kind of event.
    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.senders
            .entry(kind)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Register interest in every event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.all.subscribe()
    }

    /// Deliver an event.
    ///
    /// Returns the number of receivers that got it. Events nobody listens
    /// for are dropped.
    pub fn dispatch(&self, event: SessionEvent) -> usize {
        let kind = event.kind();
        let event = Arc::new(event);

        let mut delivered = self.all.send(Arc::clone(&event)).unwrap_or_default();
        if let Some(sender) = self.senders.get(&kind) {
            delivered += sender.send(event).unwrap_or_default();
        }

        trace!(kind = %kind, receivers = delivered, "Dispatched event");
        delivered
    }

    /// Number of live receivers for a kind, not counting catch-all ones.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.senders
            .get(&kind)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Per-receiver capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kinds", &self.senders.len())
            .field("catch_all", &self.all.receiver_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CloseReason;
    use killfeed_protocol::InboundEvent;

    fn kill_count(system_id: u64, count: u64) -> SessionEvent {
        SessionEvent::Inbound(InboundEvent::KillCountUpdate { system_id, count })
    }

    #[tokio::test]
    async fn test_dispatch_by_kind() {
        let dispatcher = Dispatcher::default();
        let mut counts = dispatcher.subscribe(EventKind::KillCountUpdate);
        let mut closed = dispatcher.subscribe(EventKind::Closed);

        assert_eq!(dispatcher.dispatch(kill_count(30000142, 3)), 1);

        let event = counts.recv().await.unwrap();
        assert_eq!(*event, kill_count(30000142, 3));
        assert!(closed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_catch_all_sees_everything() {
        let dispatcher = Dispatcher::default();
        let mut all = dispatcher.subscribe_all();

        dispatcher.dispatch(kill_count(1, 1));
        dispatcher.dispatch(SessionEvent::Closed(CloseReason::Disconnected));

        assert_eq!(all.recv().await.unwrap().kind(), EventKind::KillCountUpdate);
        assert_eq!(all.recv().await.unwrap().kind(), EventKind::Closed);
    }

    #[test]
    fn test_dispatch_without_listeners() {
        let dispatcher = Dispatcher::new(0);
        assert_eq!(dispatcher.capacity(), 1);
        assert_eq!(dispatcher.dispatch(kill_count(1, 1)), 0);
        assert_eq!(dispatcher.listener_count(EventKind::KillCountUpdate), 0);
    }

    #[test]
    fn test_listener_count() {
        let dispatcher = Dispatcher::default();
        let rx1 = dispatcher.subscribe(EventKind::Reply);
        let _rx2 = dispatcher.subscribe(EventKind::Reply);
        assert_eq!(dispatcher.listener_count(EventKind::Reply), 2);

        drop(rx1);
        assert_eq!(dispatcher.listener_count(EventKind::Reply), 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let dispatcher = Dispatcher::new(2);
        let mut rx = dispatcher.subscribe(EventKind::KillCountUpdate);

        for i in 0..4 {
            dispatcher.dispatch(kill_count(i, i));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(*rx.recv().await.unwrap(), kill_count(2, 2));
    }
}
