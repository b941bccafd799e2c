use serde::Serialize;
use std::fmt::Debug;

use crate::command::TimedCommand;
use crate::error::DiffError;
use crate::mapping::{layers_for_device, LayerId, LayerMapping, Mapping};
use crate::time::Millis;
use crate::timeline::{ResolvedLayer, ResolvedState};

use super::DeviceKind;

/// A layer routed to the device, with its content if something is active
#[derive(Debug, Clone, Copy)]
pub struct MappedLayer<'a> {
    pub layer: &'a LayerId,
    pub mapping: &'a LayerMapping,
    pub resolved: Option<&'a ResolvedLayer>,
}

/// Layers of `mapping` that belong to `device_id`, in layer id order
pub fn mapped_layers<'a>(
    state: &'a ResolvedState,
    mapping: &'a Mapping,
    device_id: &'a str,
) -> Vec<MappedLayer<'a>> {
    layers_for_device(mapping, device_id)
        .map(|(layer, layer_mapping)| MappedLayer {
            layer,
            mapping: layer_mapping,
            resolved: state.layers.get(layer),
        })
        .collect()
}

/// Pure per-kind translation between resolved states and commands
///
/// Implementations must be deterministic, emit nothing for unchanged fields
/// and fully construct a state when diffing against `None`.
pub trait Differ: Send + Sync + 'static {
    /// Device configuration snapshot
    type State: Clone + Debug + PartialEq + Send + Sync;
    /// Typed command, serialized to JSON for the transport
    type Command: Serialize + Debug + Clone + Send;

    fn kind(&self) -> DeviceKind;

    /// Derive the configuration from the layers routed to this device
    fn convert_state(&self, layers: &[MappedLayer<'_>]) -> Result<Self::State, DiffError>;

    /// Commands that move the hardware from `old` to `new`, all planned at `time`
    fn diff_states(
        &self,
        old: Option<&Self::State>,
        new: &Self::State,
        time: Millis,
    ) -> Vec<TimedCommand<Self::Command>>;
}
