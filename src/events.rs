//! Events emitted by devices, the scheduler and the conductor
//!
//! Producers push into an unbounded mpsc [`EventSink`]; the conductor drains
//! it, reacts to replanning requests and rebroadcasts everything to
//! subscribers (API websocket, tests). Nothing here is needed for correctness.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::command::CommandReport;
use crate::devices::DeviceStatus;
use crate::time::Millis;

/// Sender half used by every event producer
pub type EventSink = mpsc::UnboundedSender<Event>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Device connection status changed
    ConnectionChanged {
        device_id: String,
        status: DeviceStatus,
    },
    /// Device asks for the timeline to be resolved again
    ResetResolver { device_id: String },
    /// A command started or finished later than allowed
    SlowCommand { device_id: String, info: String },
    /// The transport rejected a command
    CommandError {
        device_id: String,
        error: String,
        context: String,
        timeline_obj_id: String,
        payload: Value,
    },
    /// Timing report for an executed command
    CommandReport(CommandReport),
    /// A device failed outside command execution (e.g. diff failure)
    Error {
        device_id: String,
        context: String,
        error: String,
    },
    Info { device_id: String, message: String },
    /// The conductor finished a resolve cycle
    Resolved {
        time: Millis,
        next_resolve: Millis,
        states: usize,
    },
}

impl Event {
    /// Device the event relates to, if any
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Event::ConnectionChanged { device_id, .. }
            | Event::ResetResolver { device_id }
            | Event::SlowCommand { device_id, .. }
            | Event::CommandError { device_id, .. }
            | Event::Error { device_id, .. }
            | Event::Info { device_id, .. } => Some(device_id),
            Event::CommandReport(report) => Some(&report.device_id),
            Event::Resolved { .. } => None,
        }
    }
}

/// Push an event, ignoring a closed channel
pub(crate) fn emit(sink: &EventSink, event: Event) {
    let _ = sink.send(event);
}
