//! Client sessions.
//!
//! A session is one client's logical connection to the broker. Its
//! lifecycle is explicit: `Connected -> Active -> Disconnected`, where the
//! last step only happens through [`Session::disconnect`]. Disconnecting
//! cancels the session's pending expectations and ends its streams; it
//! never touches other sessions, the command lane or the transport.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatcher::{CommandDispatcher, DispatchError, ExpectError};
use crate::events::{DeckEvent, EventBus, Subscription, SubscriptionId};
use crate::protocol::Command;
use crate::state::DeviceState;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session may not send commands")]
    NotPermitted,

    #[error("Session is disconnected")]
    Disconnected,

    #[error("Cancelled by disconnect")]
    Cancelled,

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Event stream closed")]
    StreamClosed,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl SessionError {
    /// Stable machine-readable name, used over IPC.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotPermitted => "not_permitted",
            SessionError::Disconnected => "disconnected",
            SessionError::Cancelled => "cancelled",
            SessionError::Timeout { .. } => "timeout",
            SessionError::StreamClosed => "stream_closed",
            SessionError::Dispatch(DispatchError::Transport(_)) => "transport",
            SessionError::Dispatch(DispatchError::LaneClosed) => "shutting_down",
        }
    }
}

impl From<ExpectError> for SessionError {
    fn from(e: ExpectError) -> Self {
        match e {
            ExpectError::Timeout { timeout_ms } => SessionError::Timeout { timeout_ms },
            ExpectError::StreamClosed => SessionError::StreamClosed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, no calls made yet.
    Connected,
    /// At least one call made.
    Active,
    /// Terminal.
    Disconnected,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Connected => write!(f, "Connected"),
            SessionPhase::Active => write!(f, "Active"),
            SessionPhase::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Live sessions, so the broker can disconnect them all at shutdown.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    next_id: Mutex<u64>,
    sessions: Mutex<HashMap<SessionId, Weak<Session>>>,
}

impl SessionRegistry {
    pub(crate) fn open(
        self: &Arc<Self>,
        dispatcher: CommandDispatcher,
        may_command: bool,
    ) -> Arc<Session> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            SessionId(*next)
        };
        let session = Arc::new(Session {
            id,
            may_command,
            phase: Mutex::new(SessionPhase::Connected),
            cancel: CancellationToken::new(),
            dispatcher,
            registry: self.clone(),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        });
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, s| s.strong_count() > 0);
        sessions.insert(id, Arc::downgrade(&session));
        drop(sessions);
        info!(session = %id, may_command, "Session connected");
        session
    }

    fn remove(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    /// Sessions still alive. Dropped-without-disconnect sessions are not counted.
    pub(crate) fn len(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    pub(crate) fn live(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().filter_map(Weak::upgrade).collect()
    }
}

/// One client's view of the broker.
pub struct Session {
    id: SessionId,
    may_command: bool,
    phase: Mutex<SessionPhase>,
    cancel: CancellationToken,
    dispatcher: CommandDispatcher,
    registry: Arc<SessionRegistry>,
    subscriptions: Arc<Mutex<Vec<SubscriptionId>>>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn may_command(&self) -> bool {
        self.may_command
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    fn activate(&self) -> Result<(), SessionError> {
        let mut phase = self.phase.lock();
        match *phase {
            SessionPhase::Disconnected => Err(SessionError::Disconnected),
            _ => {
                *phase = SessionPhase::Active;
                Ok(())
            }
        }
    }

    /// Send a command to the deck.
    pub async fn command(&self, command: Command) -> Result<(), SessionError> {
        self.activate()?;
        if !self.may_command {
            return Err(SessionError::NotPermitted);
        }
        debug!(session = %self.id, command = %command, "Command requested");
        self.dispatcher.send(command).await?;
        Ok(())
    }

    /// Current device state. Never blocks.
    pub fn get_state(&self) -> Result<DeviceState, SessionError> {
        self.activate()?;
        Ok(self.dispatcher.tracker().current())
    }

    /// Wait for a state matching `predicate`. Cancelled if the session disconnects.
    /// `None` waits without a deadline.
    pub async fn expect<P>(
        &self,
        predicate: P,
        timeout: Option<Duration>,
    ) -> Result<DeviceState, SessionError>
    where
        P: Fn(DeviceState) -> bool,
    {
        self.activate()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.dispatcher.expect(predicate, timeout) => Ok(result?),
        }
    }

    /// Wait for one specific state.
    pub async fn expect_state(
        &self,
        target: DeviceState,
        timeout: Option<Duration>,
    ) -> Result<DeviceState, SessionError> {
        self.expect(|state| state == target, timeout).await
    }

    /// Open a stream of events from now on. No replay.
    pub fn subscribe(&self) -> Result<EventStream, SessionError> {
        self.activate()?;
        let subscription = self.dispatcher.tracker().bus().subscribe();
        self.subscriptions.lock().push(subscription.id());
        debug!(session = %self.id, subscription = %subscription.id(), "Subscribed");
        Ok(EventStream {
            subscription,
            cancel: self.cancel.clone(),
            bus: self.dispatcher.tracker().bus().clone(),
            owner: self.subscriptions.clone(),
        })
    }

    /// End one of this session's streams.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(pos) = subscriptions.iter().position(|s| *s == id) else {
            return false;
        };
        subscriptions.remove(pos);
        self.dispatcher.tracker().bus().unsubscribe(id);
        true
    }

    /// Terminal transition. Idempotent.
    pub fn disconnect(&self) {
        {
            let mut phase = self.phase.lock();
            if *phase == SessionPhase::Disconnected {
                return;
            }
            *phase = SessionPhase::Disconnected;
        }
        self.cancel.cancel();
        let bus = self.dispatcher.tracker().bus();
        for id in self.subscriptions.lock().drain(..) {
            bus.unsubscribe(id);
        }
        self.registry.remove(self.id);
        info!(session = %self.id, "Session disconnected");
    }
}

/// A session's event stream. Ends on unsubscribe, disconnect, or overflow.
///
/// Dropping the stream unsubscribes it.
pub struct EventStream {
    subscription: Subscription,
    cancel: CancellationToken,
    bus: Arc<EventBus>,
    owner: Arc<Mutex<Vec<SubscriptionId>>>,
}

impl EventStream {
    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    pub async fn next(&mut self) -> Option<DeckEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.subscription.recv() => event,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let id = self.subscription.id();
        self.owner.lock().retain(|s| *s != id);
        self.bus.unsubscribe(id);
    }
}
