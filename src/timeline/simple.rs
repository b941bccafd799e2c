//! Minimal reference timeline
//!
//! Objects have an absolute or relative start (`#other.start + 1000`,
//! `#other.end - 200`), an optional duration and a layer. On each layer the
//! most recently started active object wins; ties go to the object declared
//! last. Used by the binary and by tests; production resolution is external.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::{Resolution, ResolvedLayer, ResolvedState, Resolver};
use crate::error::ResolveError;
use crate::mapping::LayerId;
use crate::time::Millis;

/// Start of a timeline object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartExpr {
    Absolute(Millis),
    /// `#<id>.start|end [+|- <ms>]`
    Relative(String),
}

/// One object of the reference timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineObject {
    pub id: String,
    pub layer: LayerId,
    pub start: StartExpr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Millis>,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone)]
struct Instance {
    index: usize,
    id: String,
    layer: LayerId,
    start: Millis,
    end: Option<Millis>,
    content: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Start,
    End,
}

/// Timeline with every object resolved to an absolute window
#[derive(Debug, Clone, Default)]
pub struct SimpleTimeline {
    instances: Vec<Instance>,
}

impl SimpleTimeline {
    pub fn new(objects: Vec<TimelineObject>) -> Result<Self, ResolveError> {
        let mut by_id: HashMap<&str, &TimelineObject> = HashMap::new();
        for object in &objects {
            if by_id.insert(object.id.as_str(), object).is_some() {
                return Err(ResolveError::DuplicateId(object.id.clone()));
            }
        }

        let mut windows: HashMap<String, (Millis, Option<Millis>)> = HashMap::new();
        for object in &objects {
            let mut visiting = HashSet::new();
            resolve_window(object, &by_id, &mut windows, &mut visiting)?;
        }

        let instances = objects
            .iter()
            .enumerate()
            .map(|(index, object)| {
                let (start, end) = windows[&object.id];
                Instance {
                    index,
                    id: object.id.clone(),
                    layer: object.layer.clone(),
                    start,
                    end,
                    content: object.content.clone(),
                }
            })
            .collect();

        Ok(Self { instances })
    }

    /// Number of objects on the timeline
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Resolver for SimpleTimeline {
    fn resolve(&self, time: Millis) -> Result<Resolution, ResolveError> {
        let mut winners: BTreeMap<&str, &Instance> = BTreeMap::new();
        for instance in &self.instances {
            let active = instance.start <= time && instance.end.map_or(true, |end| time < end);
            if !active {
                continue;
            }
            let replace = match winners.get(instance.layer.as_str()) {
                None => true,
                Some(current) => {
                    (instance.start, instance.index) > (current.start, current.index)
                }
            };
            if replace {
                winners.insert(instance.layer.as_str(), instance);
            }
        }

        let layers = winners
            .into_iter()
            .map(|(layer, instance)| {
                (
                    layer.to_string(),
                    ResolvedLayer {
                        layer: layer.to_string(),
                        object_id: instance.id.clone(),
                        content: instance.content.clone(),
                        start: instance.start,
                        end: instance.end,
                    },
                )
            })
            .collect();

        let next_change = self
            .instances
            .iter()
            .flat_map(|i| std::iter::once(i.start).chain(i.end))
            .filter(|t| *t > time)
            .min();

        Ok(Resolution {
            state: ResolvedState { time, layers },
            next_change,
        })
    }
}

fn resolve_window(
    object: &TimelineObject,
    by_id: &HashMap<&str, &TimelineObject>,
    windows: &mut HashMap<String, (Millis, Option<Millis>)>,
    visiting: &mut HashSet<String>,
) -> Result<(Millis, Option<Millis>), ResolveError> {
    if let Some(window) = windows.get(&object.id) {
        return Ok(*window);
    }
    if !visiting.insert(object.id.clone()) {
        return Err(ResolveError::CircularReference(object.id.clone()));
    }

    let start = match &object.start {
        StartExpr::Absolute(t) => *t,
        StartExpr::Relative(expr) => {
            let (target, anchor, offset) = parse_relative(&object.id, expr)?;
            let referenced = by_id.get(target.as_str()).ok_or_else(|| {
                ResolveError::UnknownReference(object.id.clone(), target.clone())
            })?;
            let (ref_start, ref_end) = resolve_window(referenced, by_id, windows, visiting)?;
            let base = match anchor {
                Anchor::Start => ref_start,
                Anchor::End => ref_end.ok_or_else(|| {
                    ResolveError::InvalidExpression(object.id.clone(), expr.clone())
                })?,
            };
            // negative results clamp to 0
            if offset >= 0 {
                base.checked_add(offset.unsigned_abs())
                    .ok_or_else(|| ResolveError::OutOfRange(object.id.clone()))?
            } else {
                base.saturating_sub(offset.unsigned_abs())
            }
        }
    };

    let end = match object.duration {
        Some(duration) => Some(
            start
                .checked_add(duration)
                .ok_or_else(|| ResolveError::OutOfRange(object.id.clone()))?,
        ),
        None => None,
    };
    let window = (start, end);
    visiting.remove(&object.id);
    windows.insert(object.id.clone(), window);
    Ok(window)
}

/// Parse `#id.start + 1000` into (id, anchor, signed offset)
fn parse_relative(owner: &str, expr: &str) -> Result<(String, Anchor, i64), ResolveError> {
    let invalid = || ResolveError::InvalidExpression(owner.to_string(), expr.to_string());

    let body = expr.trim().strip_prefix('#').ok_or_else(invalid)?;
    let (target, rest) = body.split_once('.').ok_or_else(invalid)?;
    let field_len = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    let anchor = match &rest[..field_len] {
        "start" => Anchor::Start,
        "end" => Anchor::End,
        _ => return Err(invalid()),
    };

    let tail: String = rest[field_len..].chars().filter(|c| !c.is_whitespace()).collect();
    let offset = if tail.is_empty() {
        0
    } else {
        let (sign, digits) = match tail.split_at(1) {
            ("+", digits) => (1, digits),
            ("-", digits) => (-1, digits),
            _ => return Err(invalid()),
        };
        sign * digits.parse::<i64>().map_err(|_| invalid())?
    };

    if target.is_empty() {
        return Err(invalid());
    }
    Ok((target.to_string(), anchor, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(id: &str, start: StartExpr, duration: Option<Millis>) -> TimelineObject {
        TimelineObject {
            id: id.to_string(),
            layer: "layer0".to_string(),
            start,
            duration,
            content: json!({ "id": id }),
        }
    }

    fn scenes() -> SimpleTimeline {
        SimpleTimeline::new(vec![
            object("scene0", StartExpr::Absolute(1000), Some(5000)),
            object(
                "scene1",
                StartExpr::Relative("#scene0.start + 1000".to_string()),
                Some(5000),
            ),
            object(
                "scene2",
                StartExpr::Relative("#scene1.start+1000".to_string()),
                Some(1000),
            ),
        ])
        .unwrap()
    }

    fn active(timeline: &SimpleTimeline, time: Millis) -> Option<String> {
        timeline
            .resolve(time)
            .unwrap()
            .state
            .layers
            .get("layer0")
            .map(|l| l.object_id.clone())
    }

    #[test]
    fn test_latest_started_object_wins() {
        let timeline = scenes();
        assert_eq!(active(&timeline, 999), None);
        assert_eq!(active(&timeline, 1000).as_deref(), Some("scene0"));
        assert_eq!(active(&timeline, 2000).as_deref(), Some("scene1"));
        assert_eq!(active(&timeline, 3000).as_deref(), Some("scene2"));
        // scene2 ended, scene1 still running
        assert_eq!(active(&timeline, 4000).as_deref(), Some("scene1"));
        assert_eq!(active(&timeline, 7000), None);
    }

    #[test]
    fn test_next_change() {
        let timeline = scenes();
        assert_eq!(timeline.resolve(0).unwrap().next_change, Some(1000));
        assert_eq!(timeline.resolve(1000).unwrap().next_change, Some(2000));
        assert_eq!(timeline.resolve(4000).unwrap().next_change, Some(6000));
        assert_eq!(timeline.resolve(7000).unwrap().next_change, None);
    }

    #[test]
    fn test_end_anchor_and_negative_offset() {
        let timeline = SimpleTimeline::new(vec![
            object("a", StartExpr::Absolute(100), Some(400)),
            object("b", StartExpr::Relative("#a.end - 50".to_string()), None),
        ])
        .unwrap();
        assert_eq!(active(&timeline, 450).as_deref(), Some("b"));
        // open ended
        assert_eq!(timeline.resolve(450).unwrap().next_change, Some(500));
    }

    #[test]
    fn test_reference_errors() {
        let unknown = SimpleTimeline::new(vec![object(
            "a",
            StartExpr::Relative("#nope.start".to_string()),
            None,
        )]);
        assert!(matches!(unknown, Err(ResolveError::UnknownReference(_, _))));

        let cycle = SimpleTimeline::new(vec![
            object("a", StartExpr::Relative("#b.start".to_string()), None),
            object("b", StartExpr::Relative("#a.start".to_string()), None),
        ]);
        assert!(matches!(cycle, Err(ResolveError::CircularReference(_))));

        let garbage = SimpleTimeline::new(vec![object(
            "a",
            StartExpr::Relative("a.start * 2".to_string()),
            None,
        )]);
        assert!(matches!(garbage, Err(ResolveError::InvalidExpression(_, _))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut late = object("x", StartExpr::Absolute(5000), None);
        late.layer = "layer1".to_string();
        let duplicate = SimpleTimeline::new(vec![
            object("x", StartExpr::Absolute(100), None),
            late,
        ]);
        assert!(matches!(duplicate, Err(ResolveError::DuplicateId(id)) if id == "x"));
    }

    #[test]
    fn test_window_overflow_is_an_error() {
        let too_long = SimpleTimeline::new(vec![object(
            "a",
            StartExpr::Absolute(Millis::MAX - 1),
            Some(10),
        )]);
        assert!(matches!(too_long, Err(ResolveError::OutOfRange(id)) if id == "a"));

        let too_late = SimpleTimeline::new(vec![
            object("a", StartExpr::Absolute(Millis::MAX - 1), None),
            object("b", StartExpr::Relative("#a.start + 10".to_string()), None),
        ]);
        assert!(matches!(too_late, Err(ResolveError::OutOfRange(id)) if id == "b"));

        // an open-ended object at the far end is fine
        let timeline =
            SimpleTimeline::new(vec![object("a", StartExpr::Absolute(Millis::MAX - 1), None)])
                .unwrap();
        assert_eq!(active(&timeline, Millis::MAX - 1).as_deref(), Some("a"));
    }

    #[test]
    fn test_negative_offset_clamps_to_zero() {
        let timeline = SimpleTimeline::new(vec![
            object("a", StartExpr::Absolute(100), None),
            object("b", StartExpr::Relative("#a.start - 500".to_string()), Some(50)),
        ])
        .unwrap();
        assert_eq!(active(&timeline, 0).as_deref(), Some("b"));
        assert_eq!(active(&timeline, 50), None);
    }
}
