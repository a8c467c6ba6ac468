//! Command dispatcher - single-lane writes and wait-for-state.
//!
//! All sends funnel through one queue drained by one task, so command
//! bytes reach the transport one at a time no matter how many callers
//! there are. The deck never acknowledges a command: `send` only says the
//! byte was written. Use `expect` to confirm the deck actually complied.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, SubscriptionId};
use crate::protocol::Command;
use crate::state::{DeviceState, StateTracker};
use crate::transport::{CommandWriter, TransportError};

/// Commands waiting for the write lane beyond this block their senders.
const LANE_DEPTH: usize = 32;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Command lane is closed")]
    LaneClosed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpectError {
    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Event stream closed before the expected state")]
    StreamClosed,
}

enum LaneMessage {
    Write {
        command: Command,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    /// Start writing to a freshly opened link. `link` is cancelled if a write fails.
    Attach {
        writer: CommandWriter,
        link: CancellationToken,
    },
    Detach,
}

/// Serializes commands onto the transport and waits on tracked state.
#[derive(Clone)]
pub struct CommandDispatcher {
    lane: mpsc::Sender<LaneMessage>,
    tracker: Arc<StateTracker>,
}

impl CommandDispatcher {
    /// Create a dispatcher and spawn its write lane. Starts detached:
    /// sends fail with `Disconnected` until a writer is attached.
    pub fn spawn(tracker: Arc<StateTracker>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(LANE_DEPTH);
        let handle = tokio::spawn(run_lane(rx));
        (Self { lane: tx, tracker }, handle)
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    /// Write one command. Success means the byte was written, not obeyed.
    pub async fn send(&self, command: Command) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.lane
            .send(LaneMessage::Write { command, reply })
            .await
            .map_err(|_| DispatchError::LaneClosed)?;
        rx.await.map_err(|_| DispatchError::LaneClosed)??;
        Ok(())
    }

    pub(crate) async fn attach(
        &self,
        writer: CommandWriter,
        link: CancellationToken,
    ) -> Result<(), DispatchError> {
        self.lane
            .send(LaneMessage::Attach { writer, link })
            .await
            .map_err(|_| DispatchError::LaneClosed)
    }

    pub(crate) async fn detach(&self) -> Result<(), DispatchError> {
        self.lane
            .send(LaneMessage::Detach)
            .await
            .map_err(|_| DispatchError::LaneClosed)
    }

    /// Wait until `predicate` holds for the current state.
    ///
    /// The predicate is checked against a snapshot taken atomically with
    /// subscribing, then against `current` of each following change.
    /// `None` waits without a deadline.
    pub async fn expect<P>(
        &self,
        predicate: P,
        timeout: Option<Duration>,
    ) -> Result<DeviceState, ExpectError>
    where
        P: Fn(DeviceState) -> bool,
    {
        let (current, mut subscription) = self.tracker.snapshot_and_subscribe();
        let _guard = Unsubscribe {
            bus: self.tracker.bus(),
            id: subscription.id(),
        };

        if predicate(current) {
            return Ok(current);
        }

        let wait = async {
            while let Some(event) = subscription.recv().await {
                if let Some(change) = event.as_state_change()
                    && predicate(change.current)
                {
                    return Ok(change.current);
                }
            }
            Err(ExpectError::StreamClosed)
        };

        let Some(timeout) = timeout else {
            return wait.await;
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                debug!(timeout_ms, "Expectation timed out");
                Err(ExpectError::Timeout { timeout_ms })
            }
        }
    }

    /// Wait for one specific state.
    pub async fn expect_state(
        &self,
        target: DeviceState,
        timeout: Option<Duration>,
    ) -> Result<DeviceState, ExpectError> {
        self.expect(|state| state == target, timeout).await
    }
}

/// Removes an expectation's listener however the wait ends, including
/// when the waiting future is dropped.
struct Unsubscribe<'a> {
    bus: &'a EventBus,
    id: SubscriptionId,
}

impl Drop for Unsubscribe<'_> {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

async fn write_command(writer: &mut CommandWriter, command: Command) -> Result<(), TransportError> {
    let byte = command.encode();
    writer
        .write_all(&[byte])
        .await
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
    debug!(command = %command, byte = %format!("0x{:02X}", byte), "Command written");
    Ok(())
}

async fn run_lane(mut rx: mpsc::Receiver<LaneMessage>) {
    let mut link: Option<(CommandWriter, CancellationToken)> = None;

    while let Some(message) = rx.recv().await {
        match message {
            LaneMessage::Attach { writer, link: token } => {
                link = Some((writer, token));
            }
            LaneMessage::Detach => {
                link = None;
            }
            LaneMessage::Write { command, reply } => {
                let result = match link.as_mut() {
                    Some((writer, _)) => write_command(writer, command).await,
                    None => Err(TransportError::Disconnected),
                };
                if let Err(e) = &result
                    && let Some((_, token)) = link.take()
                {
                    warn!(command = %command, error = %e, "Write failed, detaching link");
                    token.cancel();
                }
                let _ = reply.send(result);
            }
        }
    }
}
