//! Per-device state tracking
//!
//! Devices remember which configuration they planned for each point in time
//! so the next diff starts from the right baseline.

mod history;

pub use history::{StateHistory, TimedState};
