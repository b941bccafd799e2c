//! Resolved timeline states and the resolver contract
//!
//! The conductor never interprets layer content: it asks a [`Resolver`] what
//! is active at a point in time and hands the answer to the devices.

mod simple;

pub use simple::{SimpleTimeline, StartExpr, TimelineObject};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ResolveError;
use crate::mapping::LayerId;
use crate::time::Millis;

/// Content active on one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLayer {
    pub layer: LayerId,
    /// Timeline object the content comes from
    pub object_id: String,
    /// Device-specific payload, interpreted only by the differ
    pub content: Value,
    /// Activation window start
    pub start: Millis,
    /// Activation window end (`None` = open ended)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Millis>,
}

/// What is active on each layer at `time`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedState {
    pub time: Millis,
    pub layers: BTreeMap<LayerId, ResolvedLayer>,
}

impl ResolvedState {
    pub fn empty(time: Millis) -> Self {
        Self {
            time,
            layers: BTreeMap::new(),
        }
    }
}

/// Answer of a resolver for one query time
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub state: ResolvedState,
    /// Next time at which the state would differ, if any
    pub next_change: Option<Millis>,
}

/// External timeline resolution
pub trait Resolver: Send + Sync {
    fn resolve(&self, time: Millis) -> Result<Resolution, ResolveError>;
}

/// Resolver for an empty timeline
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyTimeline;

impl Resolver for EmptyTimeline {
    fn resolve(&self, time: Millis) -> Result<Resolution, ResolveError> {
        Ok(Resolution {
            state: ResolvedState::empty(time),
            next_change: None,
        })
    }
}
