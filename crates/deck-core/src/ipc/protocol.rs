//! JSON-lines wire format between the broker and its clients.
//!
//! One JSON object per line in each direction. Requests carry a client
//! chosen `id` that is echoed in the matching reply; events are pushed
//! unprompted once a connection subscribes.
//!
//! An `expect` with `timeout_ms: 0` waits without a deadline.

use serde::{Deserialize, Serialize};

use crate::broker::SessionError;
use crate::events::DeckEvent;
use crate::protocol::Command;
use crate::state::DeviceState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Command { command: Command },
    GetState,
    Expect { state: DeviceState, timeout_ms: u64 },
    Subscribe,
    Unsubscribe,
    /// Re-read the broker's config file and reopen the transport.
    Reload,
}

impl Request {
    /// Parse one request line. On failure the error reply carries the
    /// line's `id` when one could be read.
    pub fn parse(line: &str) -> Result<Self, Reply> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| Reply::bad_request(None, e.to_string()))?;
        let id = value.get("id").and_then(serde_json::Value::as_u64);
        serde_json::from_value(value).map_err(|e| Reply::bad_request(id, e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<DeviceState>,
    },
    Error {
        /// `None` when the failure is not tied to a request.
        #[serde(default)]
        id: Option<u64>,
        kind: String,
        message: String,
    },
    Event {
        event: DeckEvent,
    },
}

impl Reply {
    pub(crate) fn from_result(id: u64, result: Result<Option<DeviceState>, SessionError>) -> Self {
        match result {
            Ok(state) => Reply::Ok { id, state },
            Err(e) => Reply::Error {
                id: Some(id),
                kind: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }

    pub(crate) fn bad_request(id: Option<u64>, message: impl Into<String>) -> Self {
        Reply::Error {
            id,
            kind: "bad_request".to_string(),
            message: message.into(),
        }
    }
}
