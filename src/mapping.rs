//! Layer → device mapping
//!
//! The mapping binds every timeline layer to one device plus routing data
//! (channel index, priority). It is read-only for devices; only the
//! conductor replaces it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::devices::DeviceKind;

/// Layer identifier as used on the timeline
pub type LayerId = String;

/// Full mapping, ordered by layer id so iteration is deterministic
pub type Mapping = BTreeMap<LayerId, LayerMapping>;

/// Binding of one layer to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerMapping {
    /// Kind of device the layer targets
    pub device: DeviceKind,
    /// Id of the device instance
    pub device_id: String,
    /// Device channel (mixer channel, fader index, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    /// When several layers target one control, the highest priority wins
    #[serde(default)]
    pub layer_priority: i32,
}

impl LayerMapping {
    pub fn new(device: DeviceKind, device_id: impl Into<String>) -> Self {
        Self {
            device,
            device_id: device_id.into(),
            channel: None,
            layer_priority: 0,
        }
    }

    pub fn with_channel(mut self, channel: u16) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.layer_priority = priority;
        self
    }
}

/// Layers of `mapping` routed to `device_id`
pub fn layers_for_device<'a>(
    mapping: &'a Mapping,
    device_id: &'a str,
) -> impl Iterator<Item = (&'a LayerId, &'a LayerMapping)> + 'a {
    mapping
        .iter()
        .filter(move |(_, layer)| layer.device_id == device_id)
}
