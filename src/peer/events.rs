use crate::peer::types::{ConnectionStatus, SessionDescription};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

/// Discrete lifecycle events of one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// ICE gathering finished; the committed local description is final.
    DescriptionGathered(SessionDescription),
    ChannelOpened { label: String },
    ChannelClosed { label: String },
    /// Text received on the chat channel.
    Message(String),
    TrackReceived { kind: String, id: String },
    StatusChanged(ConnectionStatus),
}

/// Fan-out of peer events plus the single-writer status cell.
///
/// Clones share the same channels, so callbacks registered on the webrtc
/// objects can hold their own copy.
#[derive(Clone)]
pub struct EventDispatcher {
    events: broadcast::Sender<PeerEvent>,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            events,
            status: Arc::new(status),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn emit(&self, event: PeerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Publishes a status change; repeats of the current value are dropped.
    pub fn set_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(status = %next, "connection status changed");
            self.emit(PeerEvent::StatusChanged(next));
        }
    }
}

/// Dispatcher bound to one connection instance.
///
/// Callbacks of a replaced or closed connection keep firing for a while inside
/// webrtc; once the live generation moves on they are dropped here.
#[derive(Clone)]
pub struct ScopedDispatcher {
    inner: EventDispatcher,
    generation: u64,
    live: Arc<AtomicU64>,
}

impl ScopedDispatcher {
    pub fn new(inner: EventDispatcher, generation: u64, live: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            generation,
            live,
        }
    }

    pub fn is_current(&self) -> bool {
        self.live.load(Ordering::SeqCst) == self.generation
    }

    pub fn emit(&self, event: PeerEvent) {
        if self.is_current() {
            self.inner.emit(event);
        }
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        if self.is_current() {
            self.inner.set_status(status);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_changes_are_broadcast_once() {
        let dispatcher = EventDispatcher::new();
        let mut events = dispatcher.subscribe();
        let status = dispatcher.status();

        dispatcher.set_status(ConnectionStatus::Connecting);
        dispatcher.set_status(ConnectionStatus::Connecting);
        dispatcher.set_status(ConnectionStatus::Connected);

        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::StatusChanged(ConnectionStatus::Connecting)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::StatusChanged(ConnectionStatus::Connected)
        );
        assert!(events.try_recv().is_err());
        assert_eq!(*status.borrow(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn stale_scope_is_muted() {
        let dispatcher = EventDispatcher::new();
        let live = Arc::new(AtomicU64::new(1));
        let old = ScopedDispatcher::new(dispatcher.clone(), 1, live.clone());
        let mut events = dispatcher.subscribe();

        live.store(2, Ordering::SeqCst);
        old.set_status(ConnectionStatus::Failed);
        old.emit(PeerEvent::Message("late".into()));

        assert!(!old.is_current());
        assert!(events.try_recv().is_err());
        assert_eq!(dispatcher.current_status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let dispatcher = EventDispatcher::new();
        dispatcher.emit(PeerEvent::Message("hi".into()));
        assert_eq!(dispatcher.current_status(), ConnectionStatus::Disconnected);
    }
}
