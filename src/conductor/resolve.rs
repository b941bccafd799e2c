//! Resolve cycle
//!
//! Asks the resolver for the state at now and at every change inside the
//! lookahead window, and pushes each state into the mapped devices. Future
//! work planned by earlier cycles is cleared first, so each cycle replans
//! everything not yet executed from the last committed state.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::devices::Device;
use crate::events::Event;
use crate::mapping::Mapping;
use crate::time::Millis;
use crate::timeline::ResolvedState;

impl super::Conductor {
    pub(super) fn resolve_cycle(&self, now: Millis) {
        let resolver = self.resolver.read().clone();
        let mapping = self.mapping.read().clone();
        let devices = self.mapped_devices(&mapping);
        let start = self.replan_from(now);

        for device in &devices {
            device.prepare_for_handle_state(start);
            device.clear_future(start.saturating_sub(1));
        }

        let horizon = now.saturating_add(self.options.lookahead_ms);
        let max_states = self.options.max_lookahead_states.max(1);
        let mut time = start;
        let mut states = 0;

        let (next_change, capped) = loop {
            let resolution = match resolver.resolve(time) {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!("⚠️  Timeline resolve failed at {}: {}", time, e);
                    self.publish(Event::Error {
                        device_id: "conductor".to_string(),
                        context: format!("resolve at {}", time),
                        error: e.to_string(),
                    });
                    *self.next_resolve.lock() =
                        Some(now.saturating_add(self.options.poll_interval_ms));
                    return;
                }
            };

            let mut state = resolution.state;
            state.time = time;
            for device in &devices {
                self.handle_device_state(device, &state, &mapping);
            }
            states += 1;

            match resolution.next_change.filter(|next| *next > time) {
                Some(next) if next <= horizon && states < max_states => time = next,
                Some(next) => break (Some(next), next <= horizon),
                None => break (None, false),
            }
        };

        let next_resolve = match next_change {
            // out of budget inside the window: continue right after the last handled state
            Some(_) if capped => time.max(now + 1),
            Some(next) => next.saturating_sub(self.options.lookahead_ms).max(now),
            None => now.saturating_add(self.options.poll_interval_ms),
        };
        *self.next_resolve.lock() = Some(next_resolve);

        let retain_from = now.saturating_sub(self.options.state_retention_ms);
        for device in &devices {
            device.clean_up_states(retain_from, Millis::MAX);
        }

        debug!(
            now,
            states,
            devices = devices.len(),
            next_resolve,
            "Resolve cycle done"
        );
        self.publish(Event::Resolved {
            time: now,
            next_resolve,
            states,
        });
    }

    /// First time that may still be planned. Commands at `now` are already
    /// sent once the scheduler has drained `now`, so replanning starts after it.
    pub(super) fn replan_from(&self, now: Millis) -> Millis {
        match self.scheduler.executed_through() {
            Some(executed) if executed >= now => executed.saturating_add(1),
            _ => now,
        }
    }

    fn handle_device_state(&self, device: &Arc<dyn Device>, state: &ResolvedState, mapping: &Mapping) {
        if let Err(e) = device.handle_state(state, mapping) {
            warn!("⚠️  {}", e);
            self.publish(Event::Error {
                device_id: device.device_id().to_string(),
                context: format!("handle_state at {}", state.time),
                error: e.to_string(),
            });
        }
    }

    /// Registered devices referenced by `mapping`, ordered by id
    fn mapped_devices(&self, mapping: &Mapping) -> Vec<Arc<dyn Device>> {
        let ids: BTreeSet<&str> = mapping.values().map(|m| m.device_id.as_str()).collect();
        ids.into_iter()
            .filter_map(|id| match self.devices.get(id) {
                Some(device) => Some(device.value().clone()),
                None => {
                    debug!(device_id = id, "Mapped device is not registered");
                    None
                }
            })
            .collect()
    }
}
