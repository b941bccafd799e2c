//! Command types flowing from differs through the scheduler to transports
//!
//! Differs produce typed [`TimedCommand`]s. The device encodes the payload to
//! JSON when enqueuing so the scheduler and transports can handle every device
//! kind uniformly (and so commands can cross a process boundary unchanged).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DiffError;
use crate::time::Millis;

/// Typed command produced by a differ
#[derive(Debug, Clone, PartialEq)]
pub struct TimedCommand<C> {
    /// When the command should be executed
    pub time: Millis,
    /// Commands sharing a queue id supersede each other; `None` never does
    pub queue_id: Option<String>,
    pub command: C,
    /// Human readable reason, e.g. "added: scene0"
    pub context: String,
    /// Timeline object that caused the command
    pub timeline_obj_id: String,
    /// Lower runs first among commands at the same time
    pub priority: i32,
}

impl<C: Serialize> TimedCommand<C> {
    /// Encode the payload and attach the owning device
    pub fn encode(self, device_id: &str) -> Result<Command, DiffError> {
        let payload = serde_json::to_value(&self.command).map_err(|source| DiffError::Encode {
            context: self.context.clone(),
            source,
        })?;
        Ok(Command {
            time: self.time,
            device_id: device_id.to_string(),
            queue_id: self.queue_id,
            payload,
            context: self.context,
            timeline_obj_id: self.timeline_obj_id,
            priority: self.priority,
        })
    }
}

/// Command as held by the scheduler and sent by transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub time: Millis,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    pub payload: Value,
    pub context: String,
    pub timeline_obj_id: String,
    #[serde(default)]
    pub priority: i32,
}

/// Read-only view of a pending scheduler entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingCommand {
    pub id: u64,
    pub device_id: String,
    pub queue_id: Option<String>,
    pub time: Millis,
    pub priority: i32,
    pub payload: Value,
    pub context: String,
}

/// Timing details of one executed command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReport {
    pub device_id: String,
    /// Time the command was planned for
    pub planned_time: Millis,
    /// Time it was put in the queue
    pub queued_time: Millis,
    /// Time execution started
    pub executed_time: Millis,
    /// Time the transport returned
    pub fulfilled_time: Millis,
    pub context: String,
    pub timeline_obj_id: String,
}
