//! Audio mixer with per-channel faders
//!
//! Layers are routed to a channel through their mapping. When several layers
//! address one channel, each field is taken from the highest priority layer
//! that sets it; unset fields fall back to channel defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

use super::{DeviceKind, Differ, MappedLayer};
use crate::command::TimedCommand;
use crate::error::DiffError;
use crate::time::Millis;

pub const DEFAULT_FADER_LEVEL: f64 = 0.75;

const PRIORITY_LABEL: i32 = 0;
const PRIORITY_VISIBLE: i32 = 0;
const PRIORITY_FADER: i32 = 1;
const PRIORITY_PGM: i32 = 2;
const PRIORITY_MUTE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixerItemType {
    Channel,
}

/// Layer content for one mixer channel; absent fields are left to other layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerContent {
    #[serde(rename = "type")]
    pub item_type: MixerItemType,
    /// 0 = off, 1 = program, 2 = preview/voice-over
    #[serde(default)]
    pub is_pgm: Option<u8>,
    #[serde(default)]
    pub fader_level: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub visible: Option<bool>,
    #[serde(default)]
    pub mute: Option<bool>,
}

/// A value and the timeline object that set it (`None` = default)
#[derive(Debug, Clone, PartialEq)]
pub struct Field<T> {
    pub value: T,
    pub object_id: Option<String>,
}

impl<T> Field<T> {
    fn default_value(value: T) -> Self {
        Self {
            value,
            object_id: None,
        }
    }

    fn set(&mut self, value: T, object_id: &str) {
        self.value = value;
        self.object_id = Some(object_id.to_string());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    pub pgm: Field<u8>,
    pub fader: Field<f64>,
    pub label: Field<String>,
    pub visible: Field<bool>,
    pub mute: Field<bool>,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            pgm: Field::default_value(0),
            fader: Field::default_value(DEFAULT_FADER_LEVEL),
            label: Field::default_value(String::new()),
            visible: Field::default_value(true),
            mute: Field::default_value(false),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixerState {
    pub channels: BTreeMap<u16, ChannelState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MixerCommand {
    SetPgm { channel: u16, value: u8 },
    SetFader { channel: u16, level: f64 },
    SetLabel { channel: u16, label: String },
    SetVisible { channel: u16, visible: bool },
    SetMute { channel: u16, mute: bool },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MixerDiffer;

/// Context for one changed field, naming the objects involved
fn field_context<T: Display>(
    name: &str,
    channel: u16,
    old: Option<&Field<T>>,
    new: &Field<T>,
) -> String {
    let detail = format!("{} {} on channel {}", name, new.value, channel);
    let old_object = old.and_then(|o| o.object_id.as_deref());
    match (old, old_object, new.object_id.as_deref()) {
        (None, _, Some(added)) | (Some(_), None, Some(added)) => {
            format!("added: {} ({})", added, detail)
        }
        (None, _, None) => format!("added: default ({})", detail),
        (Some(_), Some(removed), None) => format!("removed: {} ({})", removed, detail),
        (Some(o), Some(from), Some(to)) => format!(
            "changed from {} to {} ({} {} -> {} on channel {})",
            from, to, name, o.value, new.value, channel
        ),
        (Some(_), None, None) => format!("changed ({})", detail),
    }
}

struct Emitter {
    time: Millis,
    commands: Vec<TimedCommand<MixerCommand>>,
}

impl Emitter {
    fn field<T: Clone + PartialEq + Display>(
        &mut self,
        name: &str,
        channel: u16,
        priority: i32,
        old: Option<&Field<T>>,
        new: &Field<T>,
        command: impl FnOnce(T) -> MixerCommand,
    ) {
        if old.map_or(false, |o| o.value == new.value) {
            return;
        }
        let timeline_obj_id = new
            .object_id
            .clone()
            .or_else(|| old.and_then(|o| o.object_id.clone()))
            .unwrap_or_default();
        self.commands.push(TimedCommand {
            time: self.time,
            queue_id: Some(format!("{}:{}", name, channel)),
            command: command(new.value.clone()),
            context: field_context(name, channel, old, new),
            timeline_obj_id,
            priority,
        });
    }
}

impl Differ for MixerDiffer {
    type State = MixerState;
    type Command = MixerCommand;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Mixer
    }

    fn convert_state(&self, layers: &[MappedLayer<'_>]) -> Result<MixerState, DiffError> {
        let mut ordered = Vec::with_capacity(layers.len());
        for mapped in layers {
            let channel = mapped.mapping.channel.ok_or_else(|| DiffError::InvalidMapping {
                layer: mapped.layer.clone(),
                reason: "mixer layers need a channel".to_string(),
            })?;
            ordered.push((mapped.mapping.layer_priority, mapped.layer, channel, mapped));
        }
        // lowest priority first so higher priorities overwrite
        ordered.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut state = MixerState::default();
        for (_, layer, channel, mapped) in ordered {
            let channel_state = state.channels.entry(channel).or_default();
            let Some(resolved) = mapped.resolved else {
                continue;
            };
            let invalid = |reason: String| DiffError::InvalidContent {
                layer: layer.clone(),
                object_id: resolved.object_id.clone(),
                reason,
            };

            let content: MixerContent = serde_json::from_value(resolved.content.clone())
                .map_err(|e| invalid(e.to_string()))?;
            let object_id = resolved.object_id.as_str();

            if let Some(pgm) = content.is_pgm {
                if pgm > 2 {
                    return Err(invalid(format!("is_pgm must be 0, 1 or 2, got {}", pgm)));
                }
                channel_state.pgm.set(pgm, object_id);
            }
            if let Some(level) = content.fader_level {
                if !level.is_finite() || level < 0.0 {
                    return Err(invalid(format!("invalid fader level {}", level)));
                }
                channel_state.fader.set(level, object_id);
            }
            if let Some(label) = content.label {
                channel_state.label.set(label, object_id);
            }
            if let Some(visible) = content.visible {
                channel_state.visible.set(visible, object_id);
            }
            if let Some(mute) = content.mute {
                channel_state.mute.set(mute, object_id);
            }
        }
        Ok(state)
    }

    fn diff_states(
        &self,
        old: Option<&MixerState>,
        new: &MixerState,
        time: Millis,
    ) -> Vec<TimedCommand<MixerCommand>> {
        let mut out = Emitter {
            time,
            commands: Vec::new(),
        };

        for (&channel, state) in &new.channels {
            let previous = old.and_then(|o| o.channels.get(&channel));
            out.field(
                "label",
                channel,
                PRIORITY_LABEL,
                previous.map(|p| &p.label),
                &state.label,
                |label| MixerCommand::SetLabel { channel, label },
            );
            out.field(
                "visible",
                channel,
                PRIORITY_VISIBLE,
                previous.map(|p| &p.visible),
                &state.visible,
                |visible| MixerCommand::SetVisible { channel, visible },
            );
            out.field(
                "fader",
                channel,
                PRIORITY_FADER,
                previous.map(|p| &p.fader),
                &state.fader,
                |level| MixerCommand::SetFader { channel, level },
            );
            out.field(
                "pgm",
                channel,
                PRIORITY_PGM,
                previous.map(|p| &p.pgm),
                &state.pgm,
                |value| MixerCommand::SetPgm { channel, value },
            );
            out.field(
                "mute",
                channel,
                PRIORITY_MUTE,
                previous.map(|p| &p.mute),
                &state.mute,
                |mute| MixerCommand::SetMute { channel, mute },
            );
        }

        out.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mapped_layers;
    use crate::mapping::{LayerMapping, Mapping};
    use crate::timeline::{ResolvedLayer, ResolvedState};
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn mapping() -> Mapping {
        let mut mapping = Mapping::new();
        mapping.insert(
            "host".to_string(),
            LayerMapping::new(DeviceKind::Mixer, "mixer0").with_channel(1),
        );
        mapping.insert(
            "host_override".to_string(),
            LayerMapping::new(DeviceKind::Mixer, "mixer0")
                .with_channel(1)
                .with_priority(10),
        );
        mapping.insert(
            "guest".to_string(),
            LayerMapping::new(DeviceKind::Mixer, "mixer0").with_channel(2),
        );
        mapping
    }

    fn resolved(entries: &[(&str, &str, Value)]) -> ResolvedState {
        let mut state = ResolvedState::empty(0);
        for (layer, object, content) in entries {
            state.layers.insert(
                layer.to_string(),
                ResolvedLayer {
                    layer: layer.to_string(),
                    object_id: object.to_string(),
                    content: content.clone(),
                    start: 0,
                    end: None,
                },
            );
        }
        state
    }

    fn convert(entries: &[(&str, &str, Value)]) -> MixerState {
        let mapping = mapping();
        let state = resolved(entries);
        MixerDiffer
            .convert_state(&mapped_layers(&state, &mapping, "mixer0"))
            .unwrap()
    }

    #[test]
    fn test_unset_channels_use_defaults() {
        let state = convert(&[]);
        assert_eq!(state.channels.len(), 2);
        let channel = &state.channels[&2];
        assert_eq!(channel.fader.value, DEFAULT_FADER_LEVEL);
        assert_eq!(channel.pgm.value, 0);
        assert!(channel.visible.value);
        assert!(channel.fader.object_id.is_none());
    }

    #[test]
    fn test_higher_priority_wins_per_field() {
        let state = convert(&[
            (
                "host",
                "base",
                json!({ "type": "channel", "fader_level": 0.5, "is_pgm": 1, "label": "Host" }),
            ),
            (
                "host_override",
                "duck",
                json!({ "type": "channel", "fader_level": 0.2 }),
            ),
        ]);
        let channel = &state.channels[&1];
        assert_eq!(channel.fader.value, 0.2);
        assert_eq!(channel.fader.object_id.as_deref(), Some("duck"));
        // fields the override leaves alone come from the lower layer
        assert_eq!(channel.pgm.value, 1);
        assert_eq!(channel.label.value, "Host");
    }

    #[test]
    fn test_full_construction_and_ordering() {
        let state = convert(&[(
            "guest",
            "g",
            json!({ "type": "channel", "is_pgm": 1, "fader_level": 0.9 }),
        )]);
        let commands = MixerDiffer.diff_states(None, &state, 500);
        // five fields on each of two channels
        assert_eq!(commands.len(), 10);

        let guest: Vec<_> = commands
            .iter()
            .filter(|c| c.queue_id.as_deref().map_or(false, |q| q.ends_with(":2")))
            .collect();
        assert_eq!(
            guest.iter().map(|c| c.priority).collect::<Vec<_>>(),
            vec![0, 0, 1, 2, 2]
        );
        assert_eq!(
            guest[2].command,
            MixerCommand::SetFader {
                channel: 2,
                level: 0.9
            }
        );
        assert_eq!(guest[2].context, "added: g (fader 0.9 on channel 2)");
        assert_eq!(guest[3].queue_id.as_deref(), Some("pgm:2"));
    }

    #[test]
    fn test_minimal_diff_and_contexts() {
        let before = convert(&[(
            "host",
            "a",
            json!({ "type": "channel", "fader_level": 0.5 }),
        )]);
        let after = convert(&[(
            "host",
            "b",
            json!({ "type": "channel", "fader_level": 0.6 }),
        )]);
        let commands = MixerDiffer.diff_states(Some(&before), &after, 0);
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].context,
            "changed from a to b (fader 0.5 -> 0.6 on channel 1)"
        );
        assert_eq!(commands[0].timeline_obj_id, "b");

        let removed = MixerDiffer.diff_states(Some(&after), &convert(&[]), 0);
        assert_eq!(removed.len(), 1);
        assert_eq!(
            removed[0].command,
            MixerCommand::SetFader {
                channel: 1,
                level: DEFAULT_FADER_LEVEL
            }
        );
        assert!(removed[0].context.starts_with("removed: b"));
        assert_eq!(removed[0].timeline_obj_id, "b");
    }

    #[test]
    fn test_missing_channel_is_a_mapping_error() {
        let mut mapping = Mapping::new();
        mapping.insert(
            "nochannel".to_string(),
            LayerMapping::new(DeviceKind::Mixer, "mixer0"),
        );
        let state = ResolvedState::empty(0);
        let err = MixerDiffer
            .convert_state(&mapped_layers(&state, &mapping, "mixer0"))
            .unwrap_err();
        assert!(matches!(err, DiffError::InvalidMapping { .. }));
    }

    #[test]
    fn test_invalid_pgm_rejected() {
        let mapping = mapping();
        let state = resolved(&[("host", "x", json!({ "type": "channel", "is_pgm": 7 }))]);
        assert!(MixerDiffer
            .convert_state(&mapped_layers(&state, &mapping, "mixer0"))
            .is_err());
    }

    fn content_strategy() -> impl Strategy<Value = Value> {
        (
            proptest::option::of(0u8..3),
            proptest::option::of(0u32..100),
            proptest::option::of(any::<bool>()),
            proptest::option::of("[a-z]{0,6}"),
        )
            .prop_map(|(pgm, fader, mute, label)| {
                let mut content = json!({ "type": "channel" });
                if let Some(pgm) = pgm {
                    content["is_pgm"] = json!(pgm);
                }
                if let Some(fader) = fader {
                    content["fader_level"] = json!(fader as f64 / 100.0);
                }
                if let Some(mute) = mute {
                    content["mute"] = json!(mute);
                }
                if let Some(label) = label {
                    content["label"] = json!(label);
                }
                content
            })
    }

    /// Apply commands to a state, the way hardware would
    fn apply(mut state: MixerState, commands: &[TimedCommand<MixerCommand>]) -> MixerState {
        for command in commands {
            match &command.command {
                MixerCommand::SetPgm { channel, value } => {
                    state.channels.entry(*channel).or_default().pgm.value = *value
                }
                MixerCommand::SetFader { channel, level } => {
                    state.channels.entry(*channel).or_default().fader.value = *level
                }
                MixerCommand::SetLabel { channel, label } => {
                    state.channels.entry(*channel).or_default().label.value = label.clone()
                }
                MixerCommand::SetVisible { channel, visible } => {
                    state.channels.entry(*channel).or_default().visible.value = *visible
                }
                MixerCommand::SetMute { channel, mute } => {
                    state.channels.entry(*channel).or_default().mute.value = *mute
                }
            }
        }
        state
    }

    fn values(state: &MixerState) -> Vec<(u16, u8, String, String, bool, bool)> {
        state
            .channels
            .iter()
            .map(|(ch, c)| {
                (
                    *ch,
                    c.pgm.value,
                    format!("{}", c.fader.value),
                    c.label.value.clone(),
                    c.visible.value,
                    c.mute.value,
                )
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_diff_is_idempotent(a in content_strategy(), b in content_strategy()) {
            let state = convert(&[("host", "a", a), ("guest", "b", b)]);
            prop_assert!(MixerDiffer.diff_states(Some(&state), &state, 0).is_empty());
        }

        #[test]
        fn prop_diff_converges(a in content_strategy(), b in content_strategy()) {
            let from = convert(&[("host", "a", a)]);
            let to = convert(&[("host", "b", b)]);
            let commands = MixerDiffer.diff_states(Some(&from), &to, 0);
            prop_assert_eq!(values(&apply(from, &commands)), values(&to));

            let built = apply(MixerState::default(), &MixerDiffer.diff_states(None, &to, 0));
            prop_assert_eq!(values(&built), values(&to));
        }
    }
}
