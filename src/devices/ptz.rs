//! PTZ camera head (presets, speeds, zoom)
//!
//! Each layer sets one control. Speeds are sent before the move that uses
//! them. A control that stops being set keeps its hardware value, except zoom
//! speed which is reset to 0 so a running zoom stops.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::{DeviceKind, Differ, MappedLayer};
use crate::command::TimedCommand;
use crate::error::DiffError;
use crate::time::Millis;

/// Layer content for a PTZ head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtzContent {
    Preset { value: u16 },
    /// Preset recall speed, 0.0 - 1.0
    Speed { value: f64 },
    /// Continuous zoom, -1.0 (wide) - 1.0 (tele), 0 stops
    ZoomSpeed { value: f64 },
    /// Absolute zoom, 0.0 - 1.0
    Zoom { value: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Setting<T> {
    pub value: T,
    pub object_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PtzState {
    pub speed: Option<Setting<f64>>,
    pub preset: Option<Setting<u16>>,
    pub zoom_speed: Option<Setting<f64>>,
    pub zoom: Option<Setting<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtzCommand {
    SetSpeed { speed: f64 },
    RecallPreset { preset: u16 },
    SetZoomSpeed { speed: f64 },
    SetZoom { zoom: f64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PtzDiffer;

fn check_range(value: f64, min: f64, max: f64) -> Result<f64, String> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{} is outside {}..={}", value, min, max))
    }
}

struct Emitter {
    time: Millis,
    commands: Vec<TimedCommand<PtzCommand>>,
}

impl Emitter {
    fn push(&mut self, name: &str, priority: i32, command: PtzCommand, context: String, object_id: &str) {
        self.commands.push(TimedCommand {
            time: self.time,
            queue_id: Some(name.to_string()),
            command,
            context,
            timeline_obj_id: object_id.to_string(),
            priority,
        });
    }

    fn setting<T: Clone + PartialEq + Display>(
        &mut self,
        name: &str,
        priority: i32,
        old: Option<&Setting<T>>,
        new: Option<&Setting<T>>,
        command: impl FnOnce(T) -> PtzCommand,
    ) {
        let Some(new) = new else {
            return;
        };
        let context = match old {
            Some(old) if old.value == new.value => return,
            Some(old) => format!(
                "changed from {} to {} ({} {} -> {})",
                old.object_id, new.object_id, name, old.value, new.value
            ),
            None => format!("added: {} ({} {})", new.object_id, name, new.value),
        };
        self.push(
            name,
            priority,
            command(new.value.clone()),
            context,
            &new.object_id,
        );
    }
}

impl Differ for PtzDiffer {
    type State = PtzState;
    type Command = PtzCommand;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Ptz
    }

    fn convert_state(&self, layers: &[MappedLayer<'_>]) -> Result<PtzState, DiffError> {
        let mut active: Vec<_> = layers
            .iter()
            .filter_map(|mapped| mapped.resolved.map(|resolved| (mapped, resolved)))
            .collect();
        // lowest priority first so higher priorities overwrite
        active.sort_by(|(a, _), (b, _)| {
            (a.mapping.layer_priority, a.layer).cmp(&(b.mapping.layer_priority, b.layer))
        });

        let mut state = PtzState::default();
        for (mapped, resolved) in active {
            let invalid = |reason: String| DiffError::InvalidContent {
                layer: mapped.layer.clone(),
                object_id: resolved.object_id.clone(),
                reason,
            };
            let content: PtzContent = serde_json::from_value(resolved.content.clone())
                .map_err(|e| invalid(e.to_string()))?;
            let object_id = resolved.object_id.clone();

            match content {
                PtzContent::Preset { value } => {
                    state.preset = Some(Setting { value, object_id });
                }
                PtzContent::Speed { value } => {
                    let value = check_range(value, 0.0, 1.0).map_err(invalid)?;
                    state.speed = Some(Setting { value, object_id });
                }
                PtzContent::ZoomSpeed { value } => {
                    let value = check_range(value, -1.0, 1.0).map_err(invalid)?;
                    state.zoom_speed = Some(Setting { value, object_id });
                }
                PtzContent::Zoom { value } => {
                    let value = check_range(value, 0.0, 1.0).map_err(invalid)?;
                    state.zoom = Some(Setting { value, object_id });
                }
            }
        }
        Ok(state)
    }

    fn diff_states(
        &self,
        old: Option<&PtzState>,
        new: &PtzState,
        time: Millis,
    ) -> Vec<TimedCommand<PtzCommand>> {
        let empty = PtzState::default();
        let old = old.unwrap_or(&empty);
        let mut out = Emitter {
            time,
            commands: Vec::new(),
        };

        out.setting("speed", 0, old.speed.as_ref(), new.speed.as_ref(), |speed| {
            PtzCommand::SetSpeed { speed }
        });
        out.setting("preset", 1, old.preset.as_ref(), new.preset.as_ref(), |preset| {
            PtzCommand::RecallPreset { preset }
        });

        match (&old.zoom_speed, &new.zoom_speed) {
            (Some(removed), None) if removed.value != 0.0 => out.push(
                "zoom_speed",
                0,
                PtzCommand::SetZoomSpeed { speed: 0.0 },
                format!("removed: {} (zoom_speed 0)", removed.object_id),
                &removed.object_id,
            ),
            (old_speed, new_speed) => out.setting(
                "zoom_speed",
                0,
                old_speed.as_ref(),
                new_speed.as_ref(),
                |speed| PtzCommand::SetZoomSpeed { speed },
            ),
        }
        out.setting("zoom", 1, old.zoom.as_ref(), new.zoom.as_ref(), |zoom| {
            PtzCommand::SetZoom { zoom }
        });

        out.commands
    }
}
