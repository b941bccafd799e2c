//! Conductor - feeds resolved timeline states to devices
//!
//! The conductor owns the device registry, the current mapping and the
//! resolver. Each `poll` drains device events, runs a resolve cycle when one is
//! due and executes every command whose time has come:
//!
//! ```text
//!   poll ─► drain events ─► resolve cycle (now + lookahead) ─► execute_due
//!              │                    │                              │
//!     reset/connection        prepare + handle_state        DoOnTime → Transport
//!     → immediate resolve     on every mapped device
//! ```
//!
//! `run` calls `poll` in a loop, sleeping until the next resolve or command.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info};

use crate::devices::Device;
use crate::error::ResolveError;
use crate::events::{Event, EventSink};
use crate::mapping::Mapping;
use crate::scheduler::{DoOnTime, SchedulerOptions};
use crate::time::{Clock, Millis};
use crate::timeline::{EmptyTimeline, Resolver, SimpleTimeline, TimelineObject};

mod devices;
mod resolve;


pub use devices::DeviceInfo;

pub const DEFAULT_LOOKAHEAD_MS: u64 = 1_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_STATE_RETENTION_MS: u64 = 60_000;
pub const DEFAULT_MAX_LOOKAHEAD_STATES: usize = 16;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ConductorOptions {
    /// How far ahead of now states are resolved and commands scheduled
    pub lookahead_ms: u64,
    /// Resolve interval when the resolver reports no upcoming change
    pub poll_interval_ms: u64,
    /// How much past history each device keeps
    pub state_retention_ms: u64,
    /// Upper bound of states handled in one cycle
    pub max_lookahead_states: usize,
    pub scheduler: SchedulerOptions,
}

impl Default for ConductorOptions {
    fn default() -> Self {
        Self {
            lookahead_ms: DEFAULT_LOOKAHEAD_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            state_retention_ms: DEFAULT_STATE_RETENTION_MS,
            max_lookahead_states: DEFAULT_MAX_LOOKAHEAD_STATES,
            scheduler: SchedulerOptions::default(),
        }
    }
}

pub struct Conductor {
    clock: Arc<dyn Clock>,
    options: ConductorOptions,
    scheduler: DoOnTime,
    devices: DashMap<String, Arc<dyn Device>>,
    mapping: RwLock<Mapping>,
    resolver: RwLock<Arc<dyn Resolver>>,
    /// Time of the next resolve cycle; `None` resolves on the next poll
    next_resolve: Mutex<Option<Millis>>,
    event_tx: EventSink,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    broadcast: broadcast::Sender<Event>,
    wake: Notify,
}

impl Conductor {
    pub fn new(clock: Arc<dyn Clock>, options: ConductorOptions) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = DoOnTime::new(clock.clone(), options.scheduler.clone(), event_tx.clone());

        Self {
            clock,
            options,
            scheduler,
            devices: DashMap::new(),
            mapping: RwLock::new(Mapping::new()),
            resolver: RwLock::new(Arc::new(EmptyTimeline)),
            next_resolve: Mutex::new(None),
            event_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
            broadcast,
            wake: Notify::new(),
        }
    }

    pub fn now(&self) -> Millis {
        self.clock.now()
    }

    pub fn options(&self) -> &ConductorOptions {
        &self.options
    }

    /// Receive every event (device, scheduler and resolve events)
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    pub fn mapping(&self) -> Mapping {
        self.mapping.read().clone()
    }

    /// Replace the mapping; every device resyncs from scratch
    pub fn set_mapping(&self, mapping: Mapping) {
        let start = self.replan_from(self.clock.now());
        let layers = mapping.len();
        *self.mapping.write() = mapping;
        for device in self.device_list() {
            device.invalidate_states();
            device.clear_future(start.saturating_sub(1));
        }
        info!("🗺️  Mapping updated ({} layers)", layers);
        self.reset_resolver();
    }

    pub fn set_resolver(&self, resolver: Arc<dyn Resolver>) {
        *self.resolver.write() = resolver;
        self.reset_resolver();
    }

    /// Use the built-in timeline resolver on `objects`
    pub fn set_timeline(&self, objects: Vec<TimelineObject>) -> Result<(), ResolveError> {
        let timeline = SimpleTimeline::new(objects)?;
        info!("🎬 Timeline loaded ({} objects)", timeline.len());
        self.set_resolver(Arc::new(timeline));
        Ok(())
    }

    /// Resolve on the next poll, superseding the scheduled resolve
    pub fn reset_resolver(&self) {
        *self.next_resolve.lock() = None;
        self.wake.notify_one();
    }

    /// Time of the next planned resolve; `None` if one is pending right away
    pub fn next_resolve_time(&self) -> Option<Millis> {
        *self.next_resolve.lock()
    }

    /// Earliest time at which `poll` has work to do
    pub fn next_wakeup(&self) -> Millis {
        let now = self.clock.now();
        let resolve = self.next_resolve.lock().unwrap_or(now);
        match self.scheduler.next_due_time() {
            Some(due) => resolve.min(due),
            None => resolve,
        }
    }

    /// One step: handle events, resolve if due, execute due commands
    pub async fn poll(&self) {
        self.drain_events();

        let now = self.clock.now();
        let due = self.next_resolve.lock().map_or(true, |at| now >= at);
        if due {
            self.resolve_cycle(now);
        }

        self.scheduler.execute_due().await;
        self.drain_events();
    }

    /// Poll forever, sleeping until there is work
    pub async fn run(&self) {
        info!("▶️  Conductor running");
        loop {
            self.poll().await;

            let delay = self.next_wakeup().saturating_sub(self.clock.now());
            if delay == 0 {
                tokio::task::yield_now().await;
                continue;
            }

            let mut rx = self.event_rx.lock().await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = self.wake.notified() => {}
                _ = self.scheduler.changed() => {}
                event = rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
            }
        }
    }

    fn drain_events(&self) {
        let Ok(mut rx) = self.event_rx.try_lock() else {
            return;
        };
        while let Ok(event) = rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: Event) {
        match &event {
            Event::ResetResolver { device_id } => {
                debug!(device_id, "Device requested a replan");
                self.reset_resolver();
            }
            Event::ConnectionChanged { device_id, status } => {
                info!(
                    "🔌 Device '{}' status: {:?}",
                    device_id, status.status_code
                );
                self.reset_resolver();
            }
            _ => {}
        }
        self.publish(event);
    }

    fn publish(&self, event: Event) {
        // no subscribers is fine
        let _ = self.broadcast.send(event);
    }
}
