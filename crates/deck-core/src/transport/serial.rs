//! tokio-serial based transport implementation.

use parking_lot::Mutex;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::{info, instrument};

use super::traits::{CommandWriter, DeckTransport, StatusReader, TransportError};
use crate::protocol::DEFAULT_BAUD_RATE;

/// Serial-port transport for the physical deck.
pub struct SerialTransport {
    endpoint: Mutex<Endpoint>,
}

#[derive(Clone)]
struct Endpoint {
    path: String,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_baud_rate(path, DEFAULT_BAUD_RATE)
    }

    pub fn with_baud_rate(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            endpoint: Mutex::new(Endpoint {
                path: path.into(),
                baud_rate,
            }),
        }
    }

    pub fn path(&self) -> String {
        self.endpoint.lock().path.clone()
    }
}

impl DeckTransport for SerialTransport {
    #[instrument(level = "info", skip(self))]
    fn open(&self) -> Result<(StatusReader, CommandWriter), TransportError> {
        let Endpoint { path, baud_rate } = self.endpoint.lock().clone();
        let stream = tokio_serial::new(&path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::OpenFailed {
                device: path.clone(),
                message: e.to_string(),
            })?;

        info!(path = %path, baud = baud_rate, "Serial port opened");

        let (reader, writer) = tokio::io::split(stream);
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        let endpoint = self.endpoint.lock();
        format!("{} @ {} baud", endpoint.path, endpoint.baud_rate)
    }

    fn reconfigure(&self, port: &str, baud_rate: u32) {
        *self.endpoint.lock() = Endpoint {
            path: port.to_string(),
            baud_rate,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let t = SerialTransport::new("/dev/ttyUSB0");
        assert_eq!(t.describe(), "/dev/ttyUSB0 @ 9600 baud");
    }

    #[test]
    fn test_reconfigure_changes_endpoint() {
        let t = SerialTransport::new("/dev/ttyUSB0");
        t.reconfigure("/dev/ttyACM1", 19200);
        assert_eq!(t.path(), "/dev/ttyACM1");
        assert_eq!(t.describe(), "/dev/ttyACM1 @ 19200 baud");
    }

    #[tokio::test]
    async fn test_missing_device_fails_to_open() {
        let t = SerialTransport::new("/nonexistent/deck-serial-port");
        match t.open() {
            Err(TransportError::OpenFailed { device, .. }) => {
                assert_eq!(device, "/nonexistent/deck-serial-port");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a device that does not exist"),
        }
    }
}
