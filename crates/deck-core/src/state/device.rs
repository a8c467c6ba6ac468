//! Derived device state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{ParseError, Status};

/// What the deck is doing now, derived from the most recent recognized status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceState {
    PlayingA,
    PlayingB,
    PausedA,
    PausedB,
    FastForwarding,
    Rewinding,
    Stopped,
    Ejected,
    Ready,
    /// No status observed yet, or the link to the deck was lost.
    #[default]
    Unknown,
}

impl DeviceState {
    pub const ALL: [DeviceState; 10] = [
        DeviceState::PlayingA,
        DeviceState::PlayingB,
        DeviceState::PausedA,
        DeviceState::PausedB,
        DeviceState::FastForwarding,
        DeviceState::Rewinding,
        DeviceState::Stopped,
        DeviceState::Ejected,
        DeviceState::Ready,
        DeviceState::Unknown,
    ];

    /// Fixed status-to-state table. Unrecognized statuses map to nothing.
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::PlayingA => Some(DeviceState::PlayingA),
            Status::PausedA => Some(DeviceState::PausedA),
            Status::PlayingB => Some(DeviceState::PlayingB),
            Status::Ready => Some(DeviceState::Ready),
            Status::PausedB => Some(DeviceState::PausedB),
            Status::FastForwarding => Some(DeviceState::FastForwarding),
            Status::Rewinding => Some(DeviceState::Rewinding),
            Status::Stopped => Some(DeviceState::Stopped),
            Status::Ejected => Some(DeviceState::Ejected),
            Status::Unrecognized(_) => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceState::PlayingA => "playing-a",
            DeviceState::PlayingB => "playing-b",
            DeviceState::PausedA => "paused-a",
            DeviceState::PausedB => "paused-b",
            DeviceState::FastForwarding => "fast-forwarding",
            DeviceState::Rewinding => "rewinding",
            DeviceState::Stopped => "stopped",
            DeviceState::Ejected => "ejected",
            DeviceState::Ready => "ready",
            DeviceState::Unknown => "unknown",
        }
    }

    pub fn is_playing(self) -> bool {
        matches!(self, DeviceState::PlayingA | DeviceState::PlayingB)
    }

    pub fn is_paused(self) -> bool {
        matches!(self, DeviceState::PausedA | DeviceState::PausedB)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DeviceState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|state| state.name() == wanted)
            .ok_or_else(|| ParseError::UnknownState(s.to_string()))
    }
}

/// A transition of the derived state. Never emitted with `previous == current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub previous: DeviceState,
    pub current: DeviceState,
    pub observed_at: DateTime<Utc>,
}

impl StateChangeEvent {
    pub fn new(previous: DeviceState, current: DeviceState) -> Self {
        Self {
            previous,
            current,
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        assert_eq!(
            DeviceState::from_status(Status::decode(0x0A)),
            Some(DeviceState::PlayingA)
        );
        assert_eq!(
            DeviceState::from_status(Status::decode(0x15)),
            Some(DeviceState::Ready)
        );
        assert_eq!(
            DeviceState::from_status(Status::decode(0x3C)),
            Some(DeviceState::Ejected)
        );
        assert_eq!(DeviceState::from_status(Status::decode(0xFF)), None);
    }

    #[test]
    fn test_names_round_trip_through_parse() {
        for state in DeviceState::ALL {
            assert_eq!(state.name().parse::<DeviceState>().unwrap(), state);
        }
        assert_eq!(
            "PLAYING_B".parse::<DeviceState>().unwrap(),
            DeviceState::PlayingB
        );
        assert!("recording".parse::<DeviceState>().is_err());
    }

    #[test]
    fn test_serde_uses_kebab_names() {
        assert_eq!(
            serde_json::to_string(&DeviceState::FastForwarding).unwrap(),
            "\"fast-forwarding\""
        );
    }
}
