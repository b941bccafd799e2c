//! Playout GW - timeline-driven device control
//!
//! Resolves a timeline ahead of time, diffs the resolved state against what
//! each device already got and schedules the minimal command sequence to
//! run at the right moment.

pub mod api;
pub mod command;
pub mod conductor;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod mapping;
pub mod scheduler;
pub mod state;
pub mod time;
pub mod timeline;
pub mod transport;

pub use conductor::{Conductor, ConductorOptions};
pub use config::AppConfig;
pub use devices::{Device, DeviceKind};
pub use events::Event;
pub use time::{Clock, ManualClock, SystemClock};
