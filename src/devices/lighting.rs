//! Lighting controller (scenes and timelines)
//!
//! Each layer runs at most one scene or timeline. Items marked `stopped`
//! release their scene/timeline instead of starting it. Commands carry no
//! queue id: two releases of the same scene at one instant are both sent.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{DeviceKind, Differ, MappedLayer};
use crate::command::TimedCommand;
use crate::error::DiffError;
use crate::mapping::LayerId;
use crate::time::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightingItemType {
    Scene,
    Timeline,
}

/// Layer content understood by the lighting device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingContent {
    #[serde(rename = "type")]
    pub item_type: LightingItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<u32>,
    #[serde(default)]
    pub stopped: bool,
    /// Release fade time in ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fade: Option<u32>,
    #[serde(default)]
    pub pause: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

impl LightingContent {
    fn number(&self) -> u32 {
        match self.item_type {
            LightingItemType::Scene => self.scene.unwrap_or_default(),
            LightingItemType::Timeline => self.timeline.unwrap_or_default(),
        }
    }

    /// Same scene/timeline with the same playback settings, except `pause`
    fn only_pause_differs(&self, other: &LightingContent) -> bool {
        self.pause != other.pause
            && LightingContent {
                pause: other.pause,
                ..self.clone()
            } == *other
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LightingItem {
    pub object_id: String,
    pub content: LightingContent,
}

/// Active item per layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightingState {
    pub layers: BTreeMap<LayerId, LightingItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LightingCommand {
    StartScene {
        scene: u32,
    },
    ReleaseScene {
        scene: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fade: Option<u32>,
    },
    StartTimeline {
        timeline: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate: Option<f64>,
    },
    ReleaseTimeline {
        timeline: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fade: Option<u32>,
    },
    PauseTimeline {
        timeline: u32,
    },
    ResumeTimeline {
        timeline: u32,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LightingDiffer;

struct Emitter {
    time: Millis,
    commands: Vec<TimedCommand<LightingCommand>>,
}

impl Emitter {
    fn push(&mut self, command: LightingCommand, context: String, object_id: &str) {
        self.commands.push(TimedCommand {
            time: self.time,
            queue_id: None,
            command,
            context,
            timeline_obj_id: object_id.to_string(),
            priority: 0,
        });
    }

    fn start(&mut self, item: &LightingItem, context: String) {
        let content = &item.content;
        match content.item_type {
            LightingItemType::Scene => self.push(
                LightingCommand::StartScene {
                    scene: content.number(),
                },
                context,
                &item.object_id,
            ),
            LightingItemType::Timeline => {
                self.push(
                    LightingCommand::StartTimeline {
                        timeline: content.number(),
                        rate: content.rate,
                    },
                    context.clone(),
                    &item.object_id,
                );
                if content.pause {
                    self.push(
                        LightingCommand::PauseTimeline {
                            timeline: content.number(),
                        },
                        context,
                        &item.object_id,
                    );
                }
            }
        }
    }

    fn release(&mut self, item: &LightingItem, context: String) {
        let content = &item.content;
        let command = match content.item_type {
            LightingItemType::Scene => LightingCommand::ReleaseScene {
                scene: content.number(),
                fade: content.fade,
            },
            LightingItemType::Timeline => LightingCommand::ReleaseTimeline {
                timeline: content.number(),
                fade: content.fade,
            },
        };
        self.push(command, context, &item.object_id);
    }

    /// Bring `item` up from nothing
    fn add(&mut self, item: &LightingItem) {
        if item.content.stopped {
            self.release(item, format!("removed: {}", item.object_id));
        } else {
            self.start(item, format!("added: {}", item.object_id));
        }
    }
}

impl Differ for LightingDiffer {
    type State = LightingState;
    type Command = LightingCommand;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Lighting
    }

    fn convert_state(&self, layers: &[MappedLayer<'_>]) -> Result<LightingState, DiffError> {
        let mut state = LightingState::default();
        for mapped in layers {
            let Some(resolved) = mapped.resolved else {
                continue;
            };
            let invalid = |reason: String| DiffError::InvalidContent {
                layer: mapped.layer.clone(),
                object_id: resolved.object_id.clone(),
                reason,
            };

            let content: LightingContent =
                serde_json::from_value(resolved.content.clone()).map_err(|e| invalid(e.to_string()))?;
            match content.item_type {
                LightingItemType::Scene if content.scene.is_none() => {
                    return Err(invalid("scene item without 'scene'".to_string()))
                }
                LightingItemType::Timeline if content.timeline.is_none() => {
                    return Err(invalid("timeline item without 'timeline'".to_string()))
                }
                _ => {}
            }

            state.layers.insert(
                mapped.layer.clone(),
                LightingItem {
                    object_id: resolved.object_id.clone(),
                    content,
                },
            );
        }
        Ok(state)
    }

    fn diff_states(
        &self,
        old: Option<&LightingState>,
        new: &LightingState,
        time: Millis,
    ) -> Vec<TimedCommand<LightingCommand>> {
        let empty = LightingState::default();
        let old = old.unwrap_or(&empty);
        let mut out = Emitter {
            time,
            commands: Vec::new(),
        };

        let layers: BTreeSet<&LayerId> = old.layers.keys().chain(new.layers.keys()).collect();
        for layer in layers {
            match (old.layers.get(layer), new.layers.get(layer)) {
                (Some(o), None) => {
                    if !o.content.stopped {
                        out.release(o, format!("removed: {}", o.object_id));
                    }
                }
                (None, Some(n)) => out.add(n),
                (Some(o), Some(n)) if o.content == n.content => {}
                (Some(o), Some(n)) => {
                    if o.content.stopped {
                        out.add(n);
                    } else if n.content.stopped {
                        out.release(o, format!("removed: {}", o.object_id));
                        out.release(n, format!("removed: {}", n.object_id));
                    } else if o.content.item_type == LightingItemType::Timeline
                        && o.content.only_pause_differs(&n.content)
                    {
                        let timeline = n.content.number();
                        let command = if n.content.pause {
                            LightingCommand::PauseTimeline { timeline }
                        } else {
                            LightingCommand::ResumeTimeline { timeline }
                        };
                        out.push(command, format!("changed to {}", n.object_id), &n.object_id);
                    } else {
                        out.release(o, format!("changed from {}", o.object_id));
                        out.start(n, format!("changed to {}", n.object_id));
                    }
                }
                (None, None) => {}
            }
        }

        out.commands
    }
}
