//! Client side of the Unix-socket binding.

use std::collections::VecDeque;
use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use super::protocol::{Operation, Reply, Request};
use crate::events::DeckEvent;
use crate::protocol::Command;
use crate::state::DeviceState;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed reply: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{message}")]
    Remote { kind: String, message: String },

    #[error("Broker closed the connection")]
    ConnectionClosed,
}

impl ClientError {
    /// The broker's error kind, for remote failures.
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            ClientError::Remote { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// A connection to a running broker.
pub struct IpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
    events: VecDeque<DeckEvent>,
    /// The broker ended our event stream while a request was in flight.
    stream_closed: bool,
}

impl IpcClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            writer,
            next_id: 0,
            events: VecDeque::new(),
            stream_closed: false,
        })
    }

    /// Send one request and wait for its reply. Events arriving meanwhile are kept.
    pub async fn request(&mut self, op: Operation) -> Result<Option<DeviceState>, ClientError> {
        self.next_id += 1;
        let id = self.next_id;
        let mut line = serde_json::to_string(&Request { id, op })?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            match self.read_reply().await? {
                Reply::Ok { id: got, state } if got == id => return Ok(state),
                Reply::Error {
                    id: Some(got),
                    kind,
                    message,
                } if got == id => return Err(ClientError::Remote { kind, message }),
                Reply::Event { event } => self.events.push_back(event),
                Reply::Error { id: None, kind, .. } if kind == "stream_closed" => {
                    self.stream_closed = true;
                }
                _ => {}
            }
        }
    }

    /// Next pushed event. `None` when the stream or connection ended.
    pub async fn next_event(&mut self) -> Result<Option<DeckEvent>, ClientError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        if self.stream_closed {
            self.stream_closed = false;
            return Ok(None);
        }
        loop {
            match self.read_reply().await {
                Ok(Reply::Event { event }) => return Ok(Some(event)),
                Ok(Reply::Error { id: None, kind, .. }) if kind == "stream_closed" => {
                    return Ok(None);
                }
                Ok(_) => {}
                Err(ClientError::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Err(ClientError::ConnectionClosed);
            };
            if !line.trim().is_empty() {
                return Ok(serde_json::from_str(&line)?);
            }
        }
    }

    pub async fn command(&mut self, command: Command) -> Result<(), ClientError> {
        self.request(Operation::Command { command }).await.map(|_| ())
    }

    pub async fn get_state(&mut self) -> Result<DeviceState, ClientError> {
        let state = self.request(Operation::GetState).await?;
        Ok(state.unwrap_or_default())
    }

    /// Wait for `state`. A `timeout_ms` of 0 waits without a deadline.
    pub async fn expect(&mut self, state: DeviceState, timeout_ms: u64) -> Result<DeviceState, ClientError> {
        let reached = self.request(Operation::Expect { state, timeout_ms }).await?;
        Ok(reached.unwrap_or(state))
    }

    pub async fn subscribe(&mut self) -> Result<(), ClientError> {
        self.request(Operation::Subscribe).await?;
        self.stream_closed = false;
        Ok(())
    }

    pub async fn unsubscribe(&mut self) -> Result<(), ClientError> {
        self.request(Operation::Unsubscribe).await?;
        self.events.clear();
        self.stream_closed = false;
        Ok(())
    }

    /// Ask the broker to re-read its config and reopen the deck.
    pub async fn reload(&mut self) -> Result<(), ClientError> {
        self.request(Operation::Reload).await.map(|_| ())
    }
}
