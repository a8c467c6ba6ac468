//! Transport supervision: the read loop and reconnection.
//!
//! Owns the read half of the link. Every byte read goes to the state
//! tracker. When the link fails the broker goes degraded: listeners get
//! `TransportLost`, the write lane is detached so commands fail fast, and
//! the transport is reopened on a fixed interval until it comes back.
//!
//! A reload takes the same path on purpose: the link is closed, then
//! reopened at once against the transport's new endpoint. If that first
//! attempt fails the reload reports the error and the usual reconnect
//! loop takes over.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::CommandDispatcher;
use crate::events::DeckEvent;
use crate::protocol::Command;
use crate::state::StateTracker;
use crate::transport::{CommandWriter, DeckTransport, StatusReader, TransportError};

const READ_BUFFER: usize = 64;

/// Answered once a reload has reopened the link, or failed to.
pub(crate) type ReloadReply = oneshot::Sender<Result<(), TransportError>>;

type Halves = (StatusReader, CommandWriter);

enum LinkEnd {
    Shutdown,
    Lost(String),
    Reload(ReloadReply),
}

/// Whether the broker currently holds an open link to the deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Connected => write!(f, "Connected"),
            LinkStatus::Disconnected => write!(f, "Disconnected"),
        }
    }
}

pub(crate) struct LinkSupervisor {
    pub(crate) transport: Arc<dyn DeckTransport>,
    pub(crate) tracker: Arc<StateTracker>,
    pub(crate) dispatcher: CommandDispatcher,
    pub(crate) status: watch::Sender<LinkStatus>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) reconnect_interval: Duration,
    pub(crate) enable_reporting: bool,
    pub(crate) reloads: mpsc::Receiver<ReloadReply>,
}

impl LinkSupervisor {
    /// Attach a freshly opened writer and optionally start status reporting.
    pub(crate) async fn bring_up(&self, writer: CommandWriter) -> CancellationToken {
        let link = self.shutdown.child_token();
        if self.dispatcher.attach(writer, link.clone()).await.is_err() {
            link.cancel();
            return link;
        }
        self.status.send_replace(LinkStatus::Connected);
        if self.enable_reporting
            && let Err(e) = self.dispatcher.send(Command::Up).await
        {
            warn!(error = %e, "Failed to enable status reporting");
        }
        link
    }

    pub(crate) async fn run(mut self, mut reader: StatusReader, mut link: CancellationToken) {
        loop {
            let opened = match self.read_until_lost(&mut reader, &link).await {
                LinkEnd::Shutdown => {
                    debug!("Read loop stopped for shutdown");
                    return;
                }
                LinkEnd::Lost(reason) => {
                    self.take_down(&link, reason).await;
                    self.reopen().await
                }
                LinkEnd::Reload(reply) => {
                    info!(transport = %self.transport.describe(), "Reloading transport");
                    self.take_down(&link, "reloading".to_string()).await;
                    match self.transport.open() {
                        Ok(halves) => Some((halves, Some(reply))),
                        Err(e) => {
                            warn!(error = %e, "Reopen after reload failed");
                            let _ = reply.send(Err(e));
                            self.reopen().await
                        }
                    }
                }
            };

            let Some(((next_reader, writer), reply)) = opened else {
                return;
            };
            reader = next_reader;
            link = self.bring_up(writer).await;
            self.tracker.bus().publish(DeckEvent::TransportRestored);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Enter degraded mode.
    async fn take_down(&self, link: &CancellationToken, reason: String) {
        link.cancel();
        let _ = self.dispatcher.detach().await;
        self.status.send_replace(LinkStatus::Disconnected);
        self.tracker
            .bus()
            .publish(DeckEvent::TransportLost { reason });
        self.tracker.reset();
    }

    /// Feed the tracker until the link fails or a reload is requested.
    async fn read_until_lost(&mut self, reader: &mut StatusReader, link: &CancellationToken) -> LinkEnd {
        let mut buf = [0u8; READ_BUFFER];
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return LinkEnd::Shutdown,
                _ = link.cancelled() => return LinkEnd::Lost("write to device failed".to_string()),
                Some(reply) = self.reloads.recv() => return LinkEnd::Reload(reply),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return LinkEnd::Lost("device closed the connection".to_string()),
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            self.tracker.observe_byte(byte);
                        }
                    }
                    Err(e) => return LinkEnd::Lost(e.to_string()),
                },
            }
        }
    }

    /// Retry `open` every `reconnect_interval`. A reload arriving meanwhile
    /// triggers an immediate attempt and is answered with its outcome.
    async fn reopen(&mut self) -> Option<(Halves, Option<ReloadReply>)> {
        let mut attempts: u64 = 0;
        loop {
            let reload = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                Some(reply) = self.reloads.recv() => Some(reply),
                _ = tokio::time::sleep(self.reconnect_interval) => None,
            };
            attempts += 1;
            match self.transport.open() {
                Ok(halves) => {
                    info!(attempts, transport = %self.transport.describe(), "Transport reopened");
                    return Some((halves, reload));
                }
                Err(e) => {
                    debug!(attempts, error = %e, "Reopen failed");
                    if let Some(reply) = reload {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }
}
