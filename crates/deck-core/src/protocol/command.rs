//! Outbound commands.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ParseError;
use super::constants::*;

/// A single-byte instruction for the deck. Commands carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    #[serde(rename = "play-a")]
    PlaySideA,
    #[serde(rename = "play-b")]
    PlaySideB,
    FastForward,
    Rewind,
    #[serde(rename = "pause")]
    TogglePause,
    Stop,
    Eject,
    Up,
    Down,
}

impl Command {
    /// Every command, in wire-byte order.
    pub const ALL: [Command; 9] = [
        Command::PlaySideA,
        Command::PlaySideB,
        Command::FastForward,
        Command::Rewind,
        Command::TogglePause,
        Command::Stop,
        Command::Eject,
        Command::Up,
        Command::Down,
    ];

    /// Encode to the wire byte.
    pub const fn encode(self) -> u8 {
        match self {
            Command::PlaySideA => CMD_PLAY_A,
            Command::PlaySideB => CMD_PLAY_B,
            Command::FastForward => CMD_FAST_FORWARD,
            Command::Rewind => CMD_REWIND,
            Command::TogglePause => CMD_TOGGLE_PAUSE,
            Command::Stop => CMD_STOP,
            Command::Eject => CMD_EJECT,
            Command::Up => CMD_UP,
            Command::Down => CMD_DOWN,
        }
    }

    /// Inverse of [`Command::encode`]. `None` for bytes that are not commands.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.encode() == byte)
    }

    /// Name used on the command line and over IPC.
    pub fn name(self) -> &'static str {
        match self {
            Command::PlaySideA => "play-a",
            Command::PlaySideB => "play-b",
            Command::FastForward => "fast-forward",
            Command::Rewind => "rewind",
            Command::TogglePause => "pause",
            Command::Stop => "stop",
            Command::Eject => "eject",
            Command::Up => "up",
            Command::Down => "down",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|c| c.name() == wanted)
            .ok_or_else(|| ParseError::UnknownCommand(s.to_string()))
    }
}
