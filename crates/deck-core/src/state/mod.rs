//! State module - derived device state and the tracker that owns it.

pub mod device;
pub mod tracker;

pub use device::{DeviceState, StateChangeEvent};
pub use tracker::{StateTracker, TrackerDiagnostics};
