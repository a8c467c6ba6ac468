//! Event bus for fanning deck events out to many listeners.
//!
//! Each listener owns a bounded FIFO queue. `publish` never waits on a
//! listener: a listener whose queue is full is dropped (its stream ends)
//! and the rest keep receiving. Synchronous observers (e.g. logging) are
//! called inline on every publish.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::state::StateChangeEvent;

/// Default per-listener queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeckEvent {
    /// The derived device state changed.
    StateChanged(StateChangeEvent),
    /// The transport failed; the broker is degraded until it reopens.
    TransportLost { reason: String },
    /// The transport was reopened after a failure.
    TransportRestored,
}

impl DeckEvent {
    /// The state change carried by this event, if any.
    pub fn as_state_change(&self) -> Option<&StateChangeEvent> {
        match self {
            DeckEvent::StateChanged(change) => Some(change),
            _ => None,
        }
    }
}

/// Observer trait for receiving deck events synchronously.
///
/// Observers run on the publishing task and must not block.
pub trait DeckObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DeckEvent);
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DeckObserver for TracingObserver {
    fn on_event(&self, event: &DeckEvent) {
        match event {
            DeckEvent::StateChanged(change) => {
                tracing::info!(from = %change.previous, to = %change.current, "State changed");
            }
            DeckEvent::TransportLost { reason } => {
                tracing::warn!(reason = %reason, "Transport lost");
            }
            DeckEvent::TransportRestored => {
                tracing::info!("Transport restored");
            }
        }
    }
}

/// Identifies one listener on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct BusInner {
    next_id: u64,
    listeners: HashMap<SubscriptionId, mpsc::Sender<DeckEvent>>,
}

/// In-process pub/sub with one bounded queue per listener.
pub struct EventBus {
    capacity: usize,
    inner: Mutex<BusInner>,
    observers: Vec<Arc<dyn DeckObserver>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(BusInner {
                next_id: 0,
                listeners: HashMap::new(),
            }),
            observers: Vec::new(),
        }
    }

    /// Attach a synchronous observer. Observers are fixed at construction.
    pub fn with_observer(mut self, observer: Arc<dyn DeckObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Start listening. Only events published after this call are delivered.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.listeners.insert(id, tx);
        debug!(subscription = %id, listeners = inner.listeners.len(), "Listener added");
        Subscription { id, rx }
    }

    /// Stop delivering to a listener. Its stream ends after draining what is queued.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.lock().listeners.remove(&id).is_some();
        if removed {
            debug!(subscription = %id, "Listener removed");
        }
        removed
    }

    /// Deliver an event to every listener. Returns how many received it.
    pub fn publish(&self, event: DeckEvent) -> usize {
        for observer in &self.observers {
            observer.on_event(&event);
        }

        let mut inner = self.inner.lock();
        let mut delivered = 0;
        inner.listeners.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscription = %id, capacity = self.capacity, "Listener queue full, dropping listener");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// One listener's FIFO view of the bus.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<DeckEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once the listener was removed and drained.
    pub async fn recv(&mut self) -> Option<DeckEvent> {
        self.rx.recv().await
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<DeckEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn change(previous: DeviceState, current: DeviceState) -> DeckEvent {
        DeckEvent::StateChanged(StateChangeEvent::new(previous, current))
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(change(DeviceState::Unknown, DeviceState::Ready));
        bus.publish(change(DeviceState::Ready, DeviceState::Stopped));

        for sub in [&mut a, &mut b] {
            let first = sub.recv().await.unwrap();
            let second = sub.recv().await.unwrap();
            assert_eq!(first.as_state_change().unwrap().current, DeviceState::Ready);
            assert_eq!(second.as_state_change().unwrap().current, DeviceState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscriber() {
        let bus = EventBus::new(8);
        bus.publish(DeckEvent::TransportRestored);
        let mut late = bus.subscribe();
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_listener_is_dropped_without_blocking_others() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for _ in 0..2 {
            bus.publish(DeckEvent::TransportRestored);
            assert!(fast.recv().await.is_some());
        }
        // Third publish overflows the slow queue only.
        assert_eq!(bus.publish(DeckEvent::TransportRestored), 1);
        assert_eq!(bus.listener_count(), 1);
        assert!(fast.recv().await.is_some());

        // The slow listener drains what it had, then its stream ends.
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_closed_pruning() {
        let bus = EventBus::new(4);
        let mut kept = bus.subscribe();
        let dropped = bus.subscribe();
        let removed = bus.subscribe();

        assert!(bus.unsubscribe(removed.id()));
        assert!(!bus.unsubscribe(removed.id()));
        drop(dropped);

        assert_eq!(bus.publish(DeckEvent::TransportRestored), 1);
        assert_eq!(bus.listener_count(), 1);
        assert_eq!(kept.recv().await, Some(DeckEvent::TransportRestored));
    }

    struct CountingObserver(AtomicUsize);

    impl DeckObserver for CountingObserver {
        fn on_event(&self, _event: &DeckEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_observers_see_every_publish() {
        let observer = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let bus = EventBus::new(4).with_observer(observer.clone());
        bus.publish(DeckEvent::TransportRestored);
        bus.publish(DeckEvent::TransportLost {
            reason: "unplugged".into(),
        });
        assert_eq!(observer.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(DeckEvent::TransportLost {
            reason: "gone".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "transport_lost");
        assert_eq!(json["reason"], "gone");
    }
}
