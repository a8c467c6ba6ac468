//! Protocol module - wire bytes and the codec between bytes and typed values.

pub mod command;
pub mod constants;
pub mod status;

use thiserror::Error;

pub use command::Command;
pub use constants::*;
pub use status::Status;

/// Failure to parse a command or state from its text name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Unknown state: {0}")]
    UnknownState(String),
}

/// Encode a command to its wire byte.
pub fn encode(command: Command) -> u8 {
    command.encode()
}

/// Decode a status byte. Never fails.
pub fn decode(byte: u8) -> Status {
    Status::decode(byte)
}
