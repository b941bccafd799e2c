//! DoOnTime - time-ordered command scheduler
//!
//! Holds every not-yet-executed command of every device in one ordered map
//! keyed by `(time, priority, sequence)`, so equal-time commands execute by
//! priority and then in enqueue order. Execution is driven from outside
//! (`execute_due`), always against the injected [`Clock`].
//!
//! ```text
//!   enqueue ──► BTreeMap<(time, priority, seq), Entry> ──► execute_due(now)
//!                  ▲            │                              │
//!   clear_future ──┘            └─ inspect()                   ▼
//!                                              per-device batch → Transport::send
//! ```

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::command::{Command, CommandReport, PendingCommand};
use crate::events::{emit, Event, EventSink};
use crate::time::{Clock, Millis};
use crate::transport::Transport;

/// Default allowed delay between planned and actual execution (ms)
pub const DEFAULT_LATE_THRESHOLD_MS: u64 = 40;
/// Default allowed duration of one transport send (ms)
pub const DEFAULT_SLOW_FULFILLED_THRESHOLD_MS: u64 = 100;

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub late_threshold_ms: u64,
    pub slow_fulfilled_threshold_ms: u64,
    /// Emit a [`CommandReport`] for every executed command
    pub report_all_commands: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            late_threshold_ms: DEFAULT_LATE_THRESHOLD_MS,
            slow_fulfilled_threshold_ms: DEFAULT_SLOW_FULFILLED_THRESHOLD_MS,
            report_all_commands: false,
        }
    }
}

/// A command waiting in the queue
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub id: u64,
    pub command: Command,
    pub enqueued_at: Millis,
}

type EntryKey = (Millis, i32, u64);

struct Queue {
    entries: BTreeMap<EntryKey, ScheduledEntry>,
    next_id: u64,
    /// Everything planned at or before this time has been taken for execution
    executed_through: Option<Millis>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
    queue: Mutex<Queue>,
    transports: DashMap<String, Arc<dyn Transport>>,
    events: EventSink,
    /// Woken whenever the earliest due time may have changed
    changed: Notify,
}

/// Shared handle to the scheduler; clones refer to the same queue
#[derive(Clone)]
pub struct DoOnTime {
    inner: Arc<Inner>,
}

impl DoOnTime {
    pub fn new(clock: Arc<dyn Clock>, options: SchedulerOptions, events: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                options,
                queue: Mutex::new(Queue {
                    entries: BTreeMap::new(),
                    next_id: 0,
                    executed_through: None,
                }),
                transports: DashMap::new(),
                events,
                changed: Notify::new(),
            }),
        }
    }

    /// Route execution of `device_id`'s commands to `transport`
    pub fn register_transport(&self, device_id: &str, transport: Arc<dyn Transport>) {
        self.inner.transports.insert(device_id.to_string(), transport);
    }

    pub fn unregister_transport(&self, device_id: &str) {
        self.inner.transports.remove(device_id);
    }

    pub fn now(&self) -> Millis {
        self.inner.clock.now()
    }

    /// Insert commands, superseding pending ones with the same device and
    /// queue id at an equal or later time. Returns the ids assigned.
    pub fn enqueue(&self, commands: Vec<Command>) -> Vec<u64> {
        if commands.is_empty() {
            return Vec::new();
        }
        let now = self.inner.clock.now();
        let mut ids = Vec::with_capacity(commands.len());
        {
            let mut queue = self.inner.queue.lock();
            for command in commands {
                if let Some(queue_id) = command.queue_id.as_deref() {
                    let before = queue.entries.len();
                    queue.entries.retain(|(time, _, _), entry| {
                        !(entry.command.device_id == command.device_id
                            && entry.command.queue_id.as_deref() == Some(queue_id)
                            && *time >= command.time)
                    });
                    let superseded = before - queue.entries.len();
                    if superseded > 0 {
                        trace!(
                            device_id = command.device_id,
                            queue_id,
                            superseded,
                            "Superseded pending commands"
                        );
                    }
                }

                let id = queue.next_id;
                queue.next_id += 1;
                let key = (command.time, command.priority, id);
                queue.entries.insert(
                    key,
                    ScheduledEntry {
                        id,
                        command,
                        enqueued_at: now,
                    },
                );
                ids.push(id);
            }
        }
        self.inner.changed.notify_one();
        ids
    }

    /// Drop every pending command of `device_id` planned after `time`
    pub fn clear_future(&self, device_id: &str, time: Millis) -> usize {
        let removed = {
            let mut queue = self.inner.queue.lock();
            let before = queue.entries.len();
            queue.entries.retain(|(t, _, _), entry| {
                !(entry.command.device_id == device_id && *t > time)
            });
            before - queue.entries.len()
        };
        if removed > 0 {
            debug!(device_id, after = time, removed, "Cleared future commands");
            self.inner.changed.notify_one();
        }
        removed
    }

    /// Drop every pending command of `device_id`
    pub fn clear_device(&self, device_id: &str) -> usize {
        let mut queue = self.inner.queue.lock();
        let before = queue.entries.len();
        queue
            .entries
            .retain(|_, entry| entry.command.device_id != device_id);
        before - queue.entries.len()
    }

    /// Pending commands in execution order, optionally for one device
    pub fn inspect(&self, device_id: Option<&str>) -> Vec<PendingCommand> {
        let queue = self.inner.queue.lock();
        queue
            .entries
            .values()
            .filter(|entry| device_id.map_or(true, |id| entry.command.device_id == id))
            .map(|entry| PendingCommand {
                id: entry.id,
                device_id: entry.command.device_id.clone(),
                queue_id: entry.command.queue_id.clone(),
                time: entry.command.time,
                priority: entry.command.priority,
                payload: entry.command.payload.clone(),
                context: entry.command.context.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Planned time of the earliest pending command
    pub fn next_due_time(&self) -> Option<Millis> {
        self.inner
            .queue
            .lock()
            .entries
            .keys()
            .next()
            .map(|(time, _, _)| *time)
    }

    /// Latest time up to which `execute_due` has run. Commands planned at or
    /// before it already went out (or failed) and must not be planned again.
    pub fn executed_through(&self) -> Option<Millis> {
        self.inner.queue.lock().executed_through
    }

    /// Resolves when the queue changed (enqueue or cancellation)
    pub async fn changed(&self) {
        self.inner.changed.notified().await
    }

    /// Remove and return every entry due at `now`, in execution order
    fn take_due(&self, now: Millis) -> Vec<ScheduledEntry> {
        let mut queue = self.inner.queue.lock();
        queue.executed_through = Some(queue.executed_through.map_or(now, |t| t.max(now)));
        let mut due = Vec::new();
        while let Some(entry) = queue.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// Execute everything due now. Devices run concurrently; commands of one
    /// device run one after another in queue order. Returns the number of
    /// commands attempted.
    pub async fn execute_due(&self) -> usize {
        let due = self.take_due(self.inner.clock.now());
        if due.is_empty() {
            return 0;
        }
        let count = due.len();

        let mut batches: Vec<(String, Vec<ScheduledEntry>)> = Vec::new();
        for entry in due {
            match batches
                .iter_mut()
                .find(|(device_id, _)| *device_id == entry.command.device_id)
            {
                Some((_, batch)) => batch.push(entry),
                None => batches.push((entry.command.device_id.clone(), vec![entry])),
            }
        }

        join_all(
            batches
                .into_iter()
                .map(|(device_id, batch)| self.run_batch(device_id, batch)),
        )
        .await;

        count
    }

    async fn run_batch(&self, device_id: String, batch: Vec<ScheduledEntry>) {
        let transport = self
            .inner
            .transports
            .get(&device_id)
            .map(|t| t.value().clone());
        for entry in batch {
            self.execute_entry(transport.as_ref(), entry).await;
        }
    }

    async fn execute_entry(&self, transport: Option<&Arc<dyn Transport>>, entry: ScheduledEntry) {
        let options = &self.inner.options;
        let command = entry.command;
        let started = self.inner.clock.now();

        let delay = started.saturating_sub(command.time);
        if delay > options.late_threshold_ms {
            let info = format!(
                "Command sent {}ms late (planned {}, sent {}): {}",
                delay, command.time, started, command.context
            );
            warn!(device_id = command.device_id, delay, "{}", info);
            emit(
                &self.inner.events,
                Event::SlowCommand {
                    device_id: command.device_id.clone(),
                    info,
                },
            );
        }

        let result = match transport {
            Some(transport) => transport.send(&command).await,
            None => Err(anyhow::anyhow!(
                "no transport registered for device '{}'",
                command.device_id
            )),
        };

        let fulfilled = self.inner.clock.now();
        let took = fulfilled.saturating_sub(started);
        if took > options.slow_fulfilled_threshold_ms {
            let info = format!(
                "Command fulfilled {}ms after it was sent: {}",
                took, command.context
            );
            warn!(device_id = command.device_id, took, "{}", info);
            emit(
                &self.inner.events,
                Event::SlowCommand {
                    device_id: command.device_id.clone(),
                    info,
                },
            );
        }

        match result {
            Ok(()) => {
                trace!(
                    device_id = command.device_id,
                    context = command.context,
                    "Command executed"
                );
                if options.report_all_commands {
                    emit(
                        &self.inner.events,
                        Event::CommandReport(CommandReport {
                            device_id: command.device_id.clone(),
                            planned_time: command.time,
                            queued_time: entry.enqueued_at,
                            executed_time: started,
                            fulfilled_time: fulfilled,
                            context: command.context.clone(),
                            timeline_obj_id: command.timeline_obj_id.clone(),
                        }),
                    );
                }
            }
            Err(e) => {
                warn!(
                    device_id = command.device_id,
                    context = command.context,
                    "Command failed: {:#}",
                    e
                );
                emit(
                    &self.inner.events,
                    Event::CommandError {
                        device_id: command.device_id,
                        error: format!("{:#}", e),
                        context: command.context,
                        timeline_obj_id: command.timeline_obj_id,
                        payload: command.payload,
                    },
                );
            }
        }
    }
}
