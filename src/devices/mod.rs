//! Devices - state history + differ + scheduler behind one interface
//!
//! Every device kind implements [`Differ`]; [`StatefulDevice`] wraps a differ
//! with its state history, transport and connection tracking and exposes the
//! object-safe [`Device`] trait the conductor works with.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::command::PendingCommand;
use crate::error::DeviceError;
use crate::events::EventSink;
use crate::mapping::Mapping;
use crate::scheduler::DoOnTime;
use crate::time::Millis;
use crate::timeline::ResolvedState;
use crate::transport::Transport;

mod differ;
pub mod lighting;
pub mod mixer;
pub mod ptz;
mod stateful;

pub use differ::{mapped_layers, Differ, MappedLayer};
pub use lighting::LightingDiffer;
pub use mixer::MixerDiffer;
pub use ptz::PtzDiffer;
pub use stateful::{ConnectionState, StatefulDevice};

/// Device kinds known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Scene/timeline lighting controller
    Lighting,
    /// Audio mixer with per-channel faders
    Mixer,
    /// Pan/tilt/zoom camera head
    Ptz,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Lighting => "lighting",
            DeviceKind::Mixer => "mixer",
            DeviceKind::Ptz => "ptz",
        };
        f.write_str(name)
    }
}

/// Severity of a device status, ordered from best to worst after `Unknown`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Unknown,
    Good,
    WarningMinor,
    WarningMajor,
    Bad,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub status_code: StatusCode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
}

impl DeviceStatus {
    pub fn new(status_code: StatusCode) -> Self {
        Self {
            status_code,
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }
}

/// Capability interface used by the conductor
///
/// `handle_state`, `prepare_for_handle_state` and `clear_future` never wait
/// on I/O; only the lifecycle hooks are async.
#[async_trait]
pub trait Device: Send + Sync {
    fn device_id(&self) -> &str;

    /// Transport name, for diagnostics
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Connect the transport. `Ok(false)` means the device exists but the
    /// connection failed; calling again retries.
    async fn init(&self) -> Result<bool, DeviceError>;

    /// Hint that `handle_state` is about to be called for `time` or later
    fn prepare_for_handle_state(&self, time: Millis);

    /// Diff `state` against the last known configuration and schedule the
    /// result. Returns the number of commands enqueued.
    fn handle_state(&self, state: &ResolvedState, mapping: &Mapping) -> Result<usize, DeviceError>;

    /// Cancel commands and drop history after `time`
    fn clear_future(&self, time: Millis);

    /// Pre-broadcast hook; `ok_to_destroy` allows a forced resync
    async fn make_ready(&self, ok_to_destroy: bool) -> Result<(), DeviceError>;

    /// Post-broadcast hook
    async fn stand_down(&self, ok_to_destroy: bool) -> Result<(), DeviceError>;

    /// Disconnect and drop all state; the device is unusable afterwards
    async fn terminate(&self) -> Result<(), DeviceError>;

    fn status(&self) -> DeviceStatus;

    fn connected(&self) -> bool;

    /// Pending commands of this device
    fn queue(&self) -> Vec<PendingCommand>;

    /// Forget every known configuration so the next diff is a full resync
    fn invalidate_states(&self);

    /// Bound history to `[before, after]`
    fn clean_up_states(&self, before: Millis, after: Millis);
}

/// Build a device of `kind` bound to `transport`
pub fn create_device(
    device_id: &str,
    kind: DeviceKind,
    transport: Arc<dyn Transport>,
    scheduler: DoOnTime,
    events: EventSink,
) -> Arc<dyn Device> {
    match kind {
        DeviceKind::Lighting => Arc::new(StatefulDevice::new(
            device_id,
            LightingDiffer,
            transport,
            scheduler,
            events,
        )),
        DeviceKind::Mixer => Arc::new(StatefulDevice::new(
            device_id,
            MixerDiffer,
            transport,
            scheduler,
            events,
        )),
        DeviceKind::Ptz => Arc::new(StatefulDevice::new(
            device_id,
            PtzDiffer,
            transport,
            scheduler,
            events,
        )),
    }
}
