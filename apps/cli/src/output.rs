//! Text and JSON rendering for command output.

use clap::ValueEnum;
use deck_core::{DeckEvent, DeviceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    Text,
    Json,
}

pub fn print_state(mode: OutputMode, state: DeviceState) {
    match mode {
        OutputMode::Text => println!("{state}"),
        OutputMode::Json => println!("{}", serde_json::json!({ "state": state })),
    }
}

pub fn print_event(mode: OutputMode, event: &DeckEvent) {
    match mode {
        OutputMode::Text => match event {
            DeckEvent::StateChanged(change) => {
                println!("{} -> {}", change.previous, change.current)
            }
            DeckEvent::TransportLost { reason } => println!("transport lost: {reason}"),
            DeckEvent::TransportRestored => println!("transport restored"),
        },
        OutputMode::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
        },
    }
}
