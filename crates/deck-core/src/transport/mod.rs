//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod traits;

pub use mock::{MockDevice, MockHarness, MockTransport};
pub use serial::SerialTransport;
pub use traits::{CommandWriter, DeckTransport, StatusReader, TransportError};
