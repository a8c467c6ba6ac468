//! Mock transport for testing.
//!
//! Every `open` creates a fresh in-memory pipe. The far end is handed to
//! the test as a [`MockDevice`], which plays the deck: it emits status
//! bytes and reads the command bytes the broker writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::traits::{CommandWriter, DeckTransport, StatusReader, TransportError};
use crate::protocol::Command;

const PIPE_CAPACITY: usize = 4096;

/// Mock transport for unit testing broker logic.
pub struct MockTransport {
    devices: mpsc::UnboundedSender<MockDevice>,
    available: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
    endpoint: Arc<Mutex<String>>,
}

/// Test-side handle that receives a [`MockDevice`] for every successful open.
pub struct MockHarness {
    devices: mpsc::UnboundedReceiver<MockDevice>,
    available: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
    endpoint: Arc<Mutex<String>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHarness) {
        let (tx, rx) = mpsc::unbounded_channel();
        let available = Arc::new(AtomicBool::new(true));
        let opens = Arc::new(AtomicUsize::new(0));
        let endpoint = Arc::new(Mutex::new("mock".to_string()));
        (
            Self {
                devices: tx,
                available: available.clone(),
                opens: opens.clone(),
                endpoint: endpoint.clone(),
            },
            MockHarness {
                devices: rx,
                available,
                opens,
                endpoint,
            },
        )
    }
}

impl DeckTransport for MockTransport {
    fn open(&self) -> Result<(StatusReader, CommandWriter), TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::OpenFailed {
                device: self.describe(),
                message: "No such device".into(),
            });
        }
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        self.devices
            .send(MockDevice { stream: device })
            .map_err(|_| TransportError::Disconnected)?;
        self.opens.fetch_add(1, Ordering::SeqCst);

        let (reader, writer) = tokio::io::split(host);
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        self.endpoint.lock().clone()
    }

    fn reconfigure(&self, port: &str, baud_rate: u32) {
        *self.endpoint.lock() = format!("mock:{port} @ {baud_rate} baud");
    }
}

impl MockHarness {
    /// Wait for the broker to open the transport.
    pub async fn next_device(&mut self) -> MockDevice {
        tokio::time::timeout(Duration::from_secs(5), self.devices.recv())
            .await
            .expect("transport was not opened in time")
            .expect("mock transport dropped")
    }

    /// Simulate the device being unplugged (future opens fail) or plugged back in.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// What the transport currently points at, as set by `reconfigure`.
    pub fn endpoint(&self) -> String {
        self.endpoint.lock().clone()
    }
}

/// The deck's side of one open link.
pub struct MockDevice {
    stream: DuplexStream,
}

impl MockDevice {
    /// Emit raw status bytes, as the deck would.
    pub async fn emit(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .await
            .expect("host side of mock link closed");
    }

    /// Read the next byte the host wrote.
    pub async fn next_byte(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        match tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await {
            Ok(Ok(1)) => Some(buf[0]),
            _ => None,
        }
    }

    /// Read the next command the host wrote.
    pub async fn next_command(&mut self) -> Option<Command> {
        self.next_byte().await.and_then(Command::from_byte)
    }

    /// Hang up the link. The host sees EOF.
    pub fn unplug(self) {
        drop(self.stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_pipes_bytes_both_ways() {
        let (transport, mut harness) = MockTransport::new();
        let (mut reader, mut writer) = transport.open().unwrap();
        let mut device = harness.next_device().await;

        device.emit(&[0x32, 0x3C]).await;
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x32, 0x3C]);

        writer.write_all(&[Command::Eject.encode()]).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(device.next_command().await, Some(Command::Eject));
        assert_eq!(harness.open_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_unavailable_fails_open() {
        let (transport, harness) = MockTransport::new();
        harness.set_available(false);
        assert!(matches!(
            transport.open(),
            Err(TransportError::OpenFailed { .. })
        ));
        harness.set_available(true);
        assert!(transport.open().is_ok());
    }

    #[tokio::test]
    async fn test_unplug_gives_eof() {
        let (transport, mut harness) = MockTransport::new();
        let (mut reader, _writer) = transport.open().unwrap();
        harness.next_device().await.unplug();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
