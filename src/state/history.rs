//! StateHistory - time-indexed history of device configurations
//!
//! Each device owns one history. Entries are kept in a `BTreeMap` keyed by
//! time; writing at `t` drops every entry after `t` because later entries were
//! computed from a past that no longer holds.

use std::collections::BTreeMap;

use crate::time::Millis;

/// A stored configuration and the time it applies from
#[derive(Debug, Clone, PartialEq)]
pub struct TimedState<T> {
    pub time: Millis,
    pub state: T,
}

/// Ordered history of configurations for one device
#[derive(Debug, Clone)]
pub struct StateHistory<T> {
    states: BTreeMap<Millis, T>,
}

impl<T: Clone> StateHistory<T> {
    pub fn new() -> Self {
        Self {
            states: BTreeMap::new(),
        }
    }

    /// Store `state` at `time`, replacing an entry at the same time and
    /// removing every entry after it
    pub fn set_state(&mut self, state: T, time: Millis) {
        if let Some(after) = time.checked_add(1) {
            // split_off keeps [.., time] in self and returns the provisional tail
            drop(self.states.split_off(&after));
        }
        self.states.insert(time, state);
    }

    /// Latest entry strictly before `time`
    pub fn get_state_before(&self, time: Millis) -> Option<TimedState<T>> {
        self.states
            .range(..time)
            .next_back()
            .map(|(t, s)| TimedState {
                time: *t,
                state: s.clone(),
            })
    }

    /// Latest entry at or before `time`
    pub fn get_state(&self, time: Millis) -> Option<TimedState<T>> {
        self.states
            .range(..=time)
            .next_back()
            .map(|(t, s)| TimedState {
                time: *t,
                state: s.clone(),
            })
    }

    /// Drop entries outside `[before, after]`
    ///
    /// The newest entry before `before` is kept as the baseline for the next
    /// diff inside the window.
    pub fn clean_up_states(&mut self, before: Millis, after: Millis) {
        if let Some(past_end) = after.checked_add(1) {
            drop(self.states.split_off(&past_end));
        }

        let baseline = self.states.range(..before).next_back().map(|(t, _)| *t);
        if let Some(baseline) = baseline {
            // keep [baseline, ..]
            self.states = self.states.split_off(&baseline);
        }
    }

    /// Remove every entry after `time`
    pub fn clear_after(&mut self, time: Millis) {
        if let Some(after) = time.checked_add(1) {
            drop(self.states.split_off(&after));
        }
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Times of all stored entries, ascending
    pub fn times(&self) -> Vec<Millis> {
        self.states.keys().copied().collect()
    }
}

impl<T: Clone> Default for StateHistory<T> {
    fn default() -> Self {
        Self::new()
    }
}
