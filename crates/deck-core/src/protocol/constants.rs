//! Wire constants for the deck's serial protocol.
//!
//! Every command and status is a single byte. The status table is
//! reverse-engineered and possibly incomplete; bytes outside it are
//! surfaced as unrecognized rather than guessed at.

// ============================================================================
// Serial Line Settings
// ============================================================================

/// The deck only speaks 9600 baud, 8N1.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

// ============================================================================
// Commands (Host -> Deck)
// ============================================================================

/// Play side A
pub const CMD_PLAY_A: u8 = 0x01;
/// Play side B
pub const CMD_PLAY_B: u8 = 0x02;
/// Fast-forward
pub const CMD_FAST_FORWARD: u8 = 0x03;
/// Rewind
pub const CMD_REWIND: u8 = 0x04;
/// Pause if playing, resume if paused
pub const CMD_TOGGLE_PAUSE: u8 = 0x05;
/// Stop the tape
pub const CMD_STOP: u8 = 0x06;
/// Eject the tape
pub const CMD_EJECT: u8 = 0x08;
/// Start status reporting
pub const CMD_UP: u8 = 0x0B;
/// Stop status reporting
pub const CMD_DOWN: u8 = 0x0C;

// ============================================================================
// Statuses (Deck -> Host), emitted repeatedly in a tight loop
// ============================================================================

pub const STATUS_PLAYING_A: u8 = 0x0A;
pub const STATUS_PAUSED_A: u8 = 0x0C;
pub const STATUS_PLAYING_B: u8 = 0x14;
/// Meaning not fully understood; observed right after `Up`.
pub const STATUS_READY: u8 = 0x15;
pub const STATUS_PAUSED_B: u8 = 0x16;
pub const STATUS_FAST_FORWARDING: u8 = 0x1E;
pub const STATUS_REWINDING: u8 = 0x28;
pub const STATUS_STOPPED: u8 = 0x32;
pub const STATUS_EJECTED: u8 = 0x3C;
