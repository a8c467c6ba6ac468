//! Serial transport abstraction.
//!
//! Defines the `DeckTransport` trait for the deck's byte link,
//! allowing different implementations (tokio-serial, mock, etc.).

use tokio::io::{AsyncRead, AsyncWrite};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {device}: {message}")]
    OpenFailed { device: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read half of an open link: the deck's status stream.
pub type StatusReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an open link: where command bytes go.
pub type CommandWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Abstract link to the deck.
///
/// This trait enables:
/// - Production implementation over a serial port
/// - Mock implementation for unit testing
///
/// `open` may be called again after a failure to reconnect.
pub trait DeckTransport: Send + Sync {
    /// Open the link and split it into read and write halves.
    fn open(&self) -> Result<(StatusReader, CommandWriter), TransportError>;

    /// Human-readable description of the endpoint, for logs.
    fn describe(&self) -> String;

    /// Point the transport at another endpoint. Takes effect on the next `open`.
    fn reconfigure(&self, _port: &str, _baud_rate: u32) {}
}
