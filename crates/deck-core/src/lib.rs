//! Deck-Core: protocol engine and session broker for a serial cassette deck.
//!
//! The deck speaks a single-byte protocol: one byte per command going out,
//! and a status byte repeated in a tight loop coming back. This crate turns
//! that stream into typed state and shares the one physical link between
//! many concurrent clients.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Wire constants and the command/status codec
//! - **Transport**: Serial link abstraction (tokio-serial, mock)
//! - **State**: Derived device state and the deduplicating tracker
//! - **Events**: Event bus with bounded per-listener queues
//! - **Dispatcher**: Single-lane command writes and wait-for-state
//! - **Broker**: Transport ownership, reconnection and client sessions
//! - **IPC**: Sessions bound to a Unix socket
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use deck_core::{Broker, BrokerConfig, Command, DeviceState, SerialTransport};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = BrokerConfig::default();
//! let transport = Arc::new(SerialTransport::new(config.port.clone()));
//! let broker = Broker::start(config, transport).await?;
//!
//! let session = broker.open_session(true);
//! session.command(Command::Eject).await?;
//! session.expect_state(DeviceState::Ejected, Some(Duration::from_millis(500))).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod events;
#[cfg(unix)]
pub mod ipc;
pub mod protocol;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use broker::{Broker, EventStream, LinkStatus, Session, SessionError, SessionId, SessionPhase};
pub use config::BrokerConfig;
pub use dispatcher::{CommandDispatcher, DispatchError, ExpectError};
pub use events::{DeckEvent, DeckObserver, EventBus, Subscription, TracingObserver};
pub use protocol::{Command, Status};
pub use state::{DeviceState, StateChangeEvent, StateTracker};
pub use transport::{DeckTransport, MockTransport, SerialTransport, TransportError};
