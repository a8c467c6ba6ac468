//! State tracker: turns the raw status stream into state-change events.
//!
//! The deck repeats its status in a tight loop, so almost every byte is a
//! repeat and is discarded. Transient statuses (e.g. `Ready` after `Up`)
//! are real observations and are not filtered.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::device::{DeviceState, StateChangeEvent};
use crate::events::{DeckEvent, EventBus, Subscription};
use crate::protocol::Status;

/// Point-in-time view of the tracker, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerDiagnostics {
    pub current: DeviceState,
    /// Last recognized status.
    pub last_status: Option<Status>,
    /// Number of state changes emitted.
    pub transitions: u64,
    pub unrecognized_count: u64,
    pub last_unrecognized: Option<u8>,
}

/// Owner of the current device state.
///
/// Writes come only from the transport read loop. Publishing happens while
/// the state lock is held, so a snapshot taken together with a subscription
/// can never miss an event in between.
pub struct StateTracker {
    inner: Mutex<TrackerDiagnostics>,
    bus: Arc<EventBus>,
}

impl StateTracker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(TrackerDiagnostics::default()),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Feed one raw byte from the transport.
    pub fn observe_byte(&self, byte: u8) -> Option<StateChangeEvent> {
        self.observe(Status::decode(byte))
    }

    /// Feed one decoded status. Returns the event if the state changed.
    pub fn observe(&self, status: Status) -> Option<StateChangeEvent> {
        let mut inner = self.inner.lock();

        let Some(candidate) = DeviceState::from_status(status) else {
            inner.unrecognized_count += 1;
            inner.last_unrecognized = Some(status.as_byte());
            debug!(byte = %format!("0x{:02X}", status.as_byte()), "Unrecognized status");
            return None;
        };

        inner.last_status = Some(status);
        if candidate == inner.current {
            trace!(status = %status, "Repeated status");
            return None;
        }

        let event = StateChangeEvent::new(inner.current, candidate);
        inner.current = candidate;
        inner.transitions += 1;
        self.bus.publish(DeckEvent::StateChanged(event.clone()));
        Some(event)
    }

    /// Forget the current state after the link to the deck is lost.
    pub fn reset(&self) -> Option<StateChangeEvent> {
        let mut inner = self.inner.lock();
        inner.last_status = None;
        if inner.current == DeviceState::Unknown {
            return None;
        }
        let event = StateChangeEvent::new(inner.current, DeviceState::Unknown);
        inner.current = DeviceState::Unknown;
        inner.transitions += 1;
        self.bus.publish(DeckEvent::StateChanged(event.clone()));
        Some(event)
    }

    /// Current state snapshot. Never blocks on I/O.
    pub fn current(&self) -> DeviceState {
        self.inner.lock().current
    }

    /// Current state plus a subscription starting right after it.
    pub fn snapshot_and_subscribe(&self) -> (DeviceState, Subscription) {
        let inner = self.inner.lock();
        let subscription = self.bus.subscribe();
        (inner.current, subscription)
    }

    pub fn diagnostics(&self) -> TrackerDiagnostics {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StateTracker {
        StateTracker::new(Arc::new(EventBus::new(16)))
    }

    #[test]
    fn test_starts_unknown() {
        let t = tracker();
        assert_eq!(t.current(), DeviceState::Unknown);
        assert_eq!(t.diagnostics().transitions, 0);
    }

    #[test]
    fn test_repeats_yield_one_event() {
        let t = tracker();
        let mut sub = t.bus().subscribe();

        let first = t.observe_byte(0x32).expect("first stopped emits");
        assert_eq!(first.previous, DeviceState::Unknown);
        assert_eq!(first.current, DeviceState::Stopped);
        for _ in 0..50 {
            assert!(t.observe_byte(0x32).is_none());
        }

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
        assert_eq!(t.diagnostics().transitions, 1);
    }

    #[test]
    fn test_up_sequence_keeps_transient_ready() {
        let t = tracker();
        let mut sub = t.bus().subscribe();

        for byte in [0x15, 0x15, 0x32, 0x32, 0x32] {
            t.observe_byte(byte);
        }

        let states: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .filter_map(|e| e.as_state_change().map(|c| c.current))
            .collect();
        assert_eq!(states, vec![DeviceState::Ready, DeviceState::Stopped]);
    }

    #[test]
    fn test_unrecognized_changes_nothing() {
        let t = tracker();
        t.observe_byte(0x0A);
        assert!(t.observe_byte(0x99).is_none());
        assert!(t.observe_byte(0x0B).is_none());

        let diag = t.diagnostics();
        assert_eq!(diag.current, DeviceState::PlayingA);
        assert_eq!(diag.unrecognized_count, 2);
        assert_eq!(diag.last_unrecognized, Some(0x0B));
        assert_eq!(diag.last_status, Some(Status::PlayingA));
        // An unrecognized byte between repeats does not break deduplication.
        assert!(t.observe_byte(0x0A).is_none());
    }

    #[test]
    fn test_reset_returns_to_unknown_once() {
        let t = tracker();
        t.observe_byte(0x3C);
        let event = t.reset().unwrap();
        assert_eq!(event.previous, DeviceState::Ejected);
        assert_eq!(event.current, DeviceState::Unknown);
        assert!(t.reset().is_none());
    }

    #[test]
    fn test_snapshot_subscription_sees_following_events() {
        let t = tracker();
        t.observe_byte(0x32);
        let (state, mut sub) = t.snapshot_and_subscribe();
        assert_eq!(state, DeviceState::Stopped);
        assert!(sub.try_recv().is_none());

        t.observe_byte(0x0A);
        let change = sub.try_recv().unwrap();
        assert_eq!(change.as_state_change().unwrap().previous, DeviceState::Stopped);
    }
}
