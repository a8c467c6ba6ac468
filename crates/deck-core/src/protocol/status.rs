//! Inbound status bytes.

use std::fmt;

use super::constants::*;

/// A raw observation reported by the deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    PlayingA,
    PausedA,
    PlayingB,
    Ready,
    PausedB,
    FastForwarding,
    Rewinding,
    Stopped,
    Ejected,
    /// A byte outside the known table.
    Unrecognized(u8),
}

impl Status {
    /// Decode a status byte. Total: unknown bytes become `Unrecognized`.
    ///
    /// This is a literal table lookup. No bit-masking is applied, even though
    /// the known values hint at one.
    pub const fn decode(byte: u8) -> Self {
        match byte {
            STATUS_PLAYING_A => Status::PlayingA,
            STATUS_PAUSED_A => Status::PausedA,
            STATUS_PLAYING_B => Status::PlayingB,
            STATUS_READY => Status::Ready,
            STATUS_PAUSED_B => Status::PausedB,
            STATUS_FAST_FORWARDING => Status::FastForwarding,
            STATUS_REWINDING => Status::Rewinding,
            STATUS_STOPPED => Status::Stopped,
            STATUS_EJECTED => Status::Ejected,
            other => Status::Unrecognized(other),
        }
    }

    /// The byte this status was decoded from.
    pub const fn as_byte(self) -> u8 {
        match self {
            Status::PlayingA => STATUS_PLAYING_A,
            Status::PausedA => STATUS_PAUSED_A,
            Status::PlayingB => STATUS_PLAYING_B,
            Status::Ready => STATUS_READY,
            Status::PausedB => STATUS_PAUSED_B,
            Status::FastForwarding => STATUS_FAST_FORWARDING,
            Status::Rewinding => STATUS_REWINDING,
            Status::Stopped => STATUS_STOPPED,
            Status::Ejected => STATUS_EJECTED,
            Status::Unrecognized(b) => b,
        }
    }

    pub const fn is_recognized(self) -> bool {
        !matches!(self, Status::Unrecognized(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unrecognized(b) => write!(f, "Unrecognized(0x{:02X})", b),
            other => write!(f, "{:?}(0x{:02X})", other, other.as_byte()),
        }
    }
}
