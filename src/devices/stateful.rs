//! StatefulDevice - generic device built from a differ
//!
//! Owns the state history of one device and tracks the transport connection.
//! A transport coming back after a disconnection invalidates the history and
//! asks the conductor for a replan, so the hardware gets a full resync.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{mapped_layers, Device, DeviceKind, DeviceStatus, Differ, StatusCode};
use crate::command::PendingCommand;
use crate::error::DeviceError;
use crate::events::{emit, Event, EventSink};
use crate::mapping::Mapping;
use crate::scheduler::DoOnTime;
use crate::state::{StateHistory, TimedState};
use crate::time::Millis;
use crate::timeline::ResolvedState;
use crate::transport::{ConnectionStatus, Transport};

/// Device lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
    Terminated,
}

/// State shared with the transport status callback
struct Shared<S> {
    device_id: String,
    connection: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
    history: Mutex<StateHistory<S>>,
    events: EventSink,
}

impl<S: Clone> Shared<S> {
    /// Move to `next`; returns the previous state, or `None` if nothing changed
    fn transition(&self, next: ConnectionState) -> Option<ConnectionState> {
        let previous = {
            let mut connection = self.connection.write();
            let previous = *connection;
            if previous == next || previous == ConnectionState::Terminated {
                return None;
            }
            *connection = next;
            previous
        };

        if next == ConnectionState::Connected {
            *self.last_error.write() = None;
        }

        if previous == ConnectionState::Disconnected && next == ConnectionState::Connected {
            info!("🔄 Device '{}' reconnected, resyncing", self.device_id);
            self.history.lock().clear();
            emit(
                &self.events,
                Event::ResetResolver {
                    device_id: self.device_id.clone(),
                },
            );
        }

        emit(
            &self.events,
            Event::ConnectionChanged {
                device_id: self.device_id.clone(),
                status: self.status(),
            },
        );
        Some(previous)
    }

    fn status(&self) -> DeviceStatus {
        match *self.connection.read() {
            ConnectionState::Uninitialized => DeviceStatus::new(StatusCode::Unknown),
            ConnectionState::Connecting => {
                DeviceStatus::new(StatusCode::WarningMinor).with_message("Connecting")
            }
            ConnectionState::Connected => DeviceStatus::new(StatusCode::Good),
            ConnectionState::Disconnected => {
                let status = DeviceStatus::new(StatusCode::Bad).with_message("Disconnected");
                match self.last_error.read().as_ref() {
                    Some(error) => status.with_message(error.clone()),
                    None => status,
                }
            }
            ConnectionState::Terminated => {
                DeviceStatus::new(StatusCode::Bad).with_message("Terminated")
            }
        }
    }
}

/// Device combining a differ, a state history and a transport
pub struct StatefulDevice<D: Differ> {
    device_id: String,
    differ: D,
    transport: Arc<dyn Transport>,
    scheduler: DoOnTime,
    shared: Arc<Shared<D::State>>,
    /// Time announced by the last `prepare_for_handle_state`
    prepared_time: RwLock<Option<Millis>>,
}

impl<D: Differ> StatefulDevice<D>
where
    D::State: 'static,
{
    pub fn new(
        device_id: &str,
        differ: D,
        transport: Arc<dyn Transport>,
        scheduler: DoOnTime,
        events: EventSink,
    ) -> Self {
        let shared = Arc::new(Shared {
            device_id: device_id.to_string(),
            connection: RwLock::new(ConnectionState::Uninitialized),
            last_error: RwLock::new(None),
            history: Mutex::new(StateHistory::new()),
            events,
        });

        let callback_shared = shared.clone();
        transport.subscribe_connection_status(Arc::new(move |status| {
            let next = match status {
                ConnectionStatus::Connected => ConnectionState::Connected,
                ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting { .. } => {
                    ConnectionState::Disconnected
                }
            };
            // only track changes once init has started
            if *callback_shared.connection.read() != ConnectionState::Uninitialized {
                callback_shared.transition(next);
            }
        }));

        scheduler.register_transport(device_id, transport.clone());

        Self {
            device_id: device_id.to_string(),
            differ,
            transport,
            scheduler,
            shared,
            prepared_time: RwLock::new(None),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.read()
    }

    /// Latest known configuration at or before `time`
    pub fn state_at(&self, time: Millis) -> Option<TimedState<D::State>> {
        self.shared.history.lock().get_state(time)
    }

    pub fn history_len(&self) -> usize {
        self.shared.history.lock().len()
    }

    pub fn prepared_time(&self) -> Option<Millis> {
        *self.prepared_time.read()
    }

    fn ensure_active(&self) -> Result<(), DeviceError> {
        if self.connection_state() == ConnectionState::Terminated {
            return Err(DeviceError::Terminated(self.device_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl<D: Differ> Device for StatefulDevice<D>
where
    D::State: 'static,
{
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn name(&self) -> &str {
        self.transport.name()
    }

    fn kind(&self) -> DeviceKind {
        self.differ.kind()
    }

    async fn init(&self) -> Result<bool, DeviceError> {
        self.ensure_active()?;
        if self.connection_state() == ConnectionState::Connected {
            return Ok(true);
        }

        let retry = {
            let mut connection = self.shared.connection.write();
            let retry = *connection == ConnectionState::Disconnected;
            *connection = ConnectionState::Connecting;
            retry
        };
        debug!(device_id = self.device_id, retry, "Connecting transport");

        match self.transport.init().await {
            Ok(()) => {
                self.shared.transition(ConnectionState::Connected);
                if retry {
                    // anything planned while disconnected never reached the hardware
                    self.shared.history.lock().clear();
                    emit(
                        &self.shared.events,
                        Event::ResetResolver {
                            device_id: self.device_id.clone(),
                        },
                    );
                }
                info!(
                    "✅ Device '{}' ({}) connected via {}",
                    self.device_id,
                    self.kind(),
                    self.transport.name()
                );
                Ok(true)
            }
            Err(e) => {
                let error = format!("{:#}", e);
                warn!("⚠️  Device '{}' failed to connect: {}", self.device_id, error);
                *self.shared.last_error.write() = Some(error.clone());
                self.shared.transition(ConnectionState::Disconnected);
                emit(
                    &self.shared.events,
                    Event::Error {
                        device_id: self.device_id.clone(),
                        context: "init".to_string(),
                        error,
                    },
                );
                Ok(false)
            }
        }
    }

    fn prepare_for_handle_state(&self, time: Millis) {
        *self.prepared_time.write() = Some(time);
    }

    fn handle_state(&self, state: &ResolvedState, mapping: &Mapping) -> Result<usize, DeviceError> {
        self.ensure_active()?;

        let diff_error = |source| DeviceError::Diff {
            device_id: self.device_id.clone(),
            time: state.time,
            source,
        };

        let layers = mapped_layers(state, mapping, &self.device_id);
        let new_state = self.differ.convert_state(&layers).map_err(diff_error)?;

        let mut history = self.shared.history.lock();
        let old = history.get_state_before(state.time);
        let commands = self
            .differ
            .diff_states(old.as_ref().map(|o| &o.state), &new_state, state.time);

        // encode everything first so a failure leaves history and queue untouched
        let encoded = commands
            .into_iter()
            .map(|command| command.encode(&self.device_id))
            .collect::<Result<Vec<_>, _>>()
            .map_err(diff_error)?;

        let count = encoded.len();
        if count > 0 {
            debug!(
                device_id = self.device_id,
                time = state.time,
                count,
                "Scheduled commands"
            );
        }
        self.scheduler.enqueue(encoded);
        history.set_state(new_state, state.time);
        Ok(count)
    }

    fn clear_future(&self, time: Millis) {
        self.scheduler.clear_future(&self.device_id, time);
        self.shared.history.lock().clear_after(time);
    }

    async fn make_ready(&self, ok_to_destroy: bool) -> Result<(), DeviceError> {
        self.ensure_active()?;
        if ok_to_destroy {
            info!("🔄 Device '{}' forced resync", self.device_id);
            self.shared.history.lock().clear();
            emit(
                &self.shared.events,
                Event::ResetResolver {
                    device_id: self.device_id.clone(),
                },
            );
        }
        Ok(())
    }

    async fn stand_down(&self, _ok_to_destroy: bool) -> Result<(), DeviceError> {
        self.ensure_active()?;
        debug!(device_id = self.device_id, "Stand down");
        emit(
            &self.shared.events,
            Event::Info {
                device_id: self.device_id.clone(),
                message: "Standing down".to_string(),
            },
        );
        Ok(())
    }

    async fn terminate(&self) -> Result<(), DeviceError> {
        if self.shared.transition(ConnectionState::Terminated).is_none() {
            return Ok(());
        }

        if let Err(e) = self.transport.shutdown().await {
            warn!(
                "⚠️  Device '{}' transport shutdown failed: {:#}",
                self.device_id, e
            );
        }
        self.shared.history.lock().clear();
        let dropped = self.scheduler.clear_device(&self.device_id);
        self.scheduler.unregister_transport(&self.device_id);
        info!(
            "🛑 Device '{}' terminated ({} pending commands dropped)",
            self.device_id, dropped
        );
        Ok(())
    }

    fn status(&self) -> DeviceStatus {
        self.shared.status()
    }

    fn connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn queue(&self) -> Vec<PendingCommand> {
        self.scheduler.inspect(Some(&self.device_id))
    }

    fn invalidate_states(&self) {
        self.shared.history.lock().clear();
    }

    fn clean_up_states(&self, before: Millis, after: Millis) {
        self.shared.history.lock().clean_up_states(before, after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::LightingDiffer;
    use crate::mapping::LayerMapping;
    use crate::scheduler::SchedulerOptions;
    use crate::time::ManualClock;
    use crate::timeline::ResolvedLayer;
    use crate::transport::testing::RecordingTransport;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct Fixture {
        device: StatefulDevice<LightingDiffer>,
        transport: Arc<RecordingTransport>,
        scheduler: DoOnTime,
        events: mpsc::UnboundedReceiver<Event>,
        mapping: Mapping,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1000));
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = DoOnTime::new(clock, SchedulerOptions::default(), tx.clone());
        let transport = RecordingTransport::new("recording");
        let device = StatefulDevice::new(
            "light0",
            LightingDiffer,
            transport.clone(),
            scheduler.clone(),
            tx,
        );
        let mut mapping = Mapping::new();
        mapping.insert(
            "layer0".to_string(),
            LayerMapping::new(DeviceKind::Lighting, "light0"),
        );
        Fixture {
            device,
            transport,
            scheduler,
            events: rx,
            mapping,
        }
    }

    fn state(time: Millis, object: &str, content: Value) -> ResolvedState {
        let mut state = ResolvedState::empty(time);
        state.layers.insert(
            "layer0".to_string(),
            ResolvedLayer {
                layer: "layer0".to_string(),
                object_id: object.to_string(),
                content,
                start: time,
                end: None,
            },
        );
        state
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_init_and_status() {
        let mut f = fixture();
        assert_eq!(f.device.status().status_code, StatusCode::Unknown);

        assert!(f.device.init().await.unwrap());
        assert!(f.device.connected());
        assert_eq!(f.device.status().status_code, StatusCode::Good);
        assert_eq!(f.device.name(), "recording");

        let events = drain(&mut f.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ConnectionChanged { .. })));
        // first connection is not a resync
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::ResetResolver { .. })));
    }

    #[tokio::test]
    async fn test_init_failure_is_retryable() {
        let f = fixture();
        f.transport.set_fail_init(true);
        assert!(!f.device.init().await.unwrap());
        assert_eq!(f.device.connection_state(), ConnectionState::Disconnected);
        let status = f.device.status();
        assert_eq!(status.status_code, StatusCode::Bad);
        assert!(status.messages.iter().any(|m| m.contains("connection refused")));

        f.transport.set_fail_init(false);
        assert!(f.device.init().await.unwrap());
        assert!(f.device.connected());
        assert!(f.device.status().messages.is_empty());
    }

    #[tokio::test]
    async fn test_handle_state_commits_and_enqueues() {
        let f = fixture();
        f.device.init().await.unwrap();

        let count = f
            .device
            .handle_state(
                &state(2000, "scene0", json!({ "type": "scene", "scene": 1 })),
                &f.mapping,
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(f.device.queue().len(), 1);
        assert_eq!(f.device.queue()[0].time, 2000);
        assert!(f.device.state_at(2000).is_some());

        // same state again: nothing new
        let count = f
            .device
            .handle_state(
                &state(2500, "scene0", json!({ "type": "scene", "scene": 1 })),
                &f.mapping,
            )
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(f.device.history_len(), 2);
    }

    #[tokio::test]
    async fn test_diff_failure_leaves_state_untouched() {
        let mut f = fixture();
        f.device.init().await.unwrap();
        f.device
            .handle_state(
                &state(2000, "scene0", json!({ "type": "scene", "scene": 1 })),
                &f.mapping,
            )
            .unwrap();
        drain(&mut f.events);

        let result = f.device.handle_state(
            &state(3000, "broken", json!({ "type": "laser" })),
            &f.mapping,
        );
        assert!(matches!(result, Err(DeviceError::Diff { time: 3000, .. })));
        assert_eq!(f.device.history_len(), 1);
        assert_eq!(f.scheduler.len(), 1);

        // retry from the same baseline
        let count = f
            .device
            .handle_state(&ResolvedState::empty(3000), &f.mapping)
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(f.device.queue()[1].context, "removed: scene0");
    }

    #[tokio::test]
    async fn test_clear_future_drops_commands_and_history() {
        let f = fixture();
        f.device.init().await.unwrap();
        f.device
            .handle_state(
                &state(2000, "scene0", json!({ "type": "scene", "scene": 1 })),
                &f.mapping,
            )
            .unwrap();
        f.device
            .handle_state(&ResolvedState::empty(3000), &f.mapping)
            .unwrap();
        assert_eq!(f.device.queue().len(), 2);

        f.device.prepare_for_handle_state(2500);
        assert_eq!(f.device.prepared_time(), Some(2500));
        // the hint alone changes nothing
        assert_eq!(f.device.history_len(), 2);

        f.device.clear_future(2500);
        assert_eq!(f.device.queue().len(), 1);
        assert_eq!(f.device.history_len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_triggers_resync() {
        let mut f = fixture();
        f.device.init().await.unwrap();
        f.device
            .handle_state(
                &state(2000, "scene0", json!({ "type": "scene", "scene": 1 })),
                &f.mapping,
            )
            .unwrap();
        drain(&mut f.events);

        f.transport.set_status(ConnectionStatus::Disconnected);
        assert!(!f.device.connected());
        f.transport.set_status(ConnectionStatus::Connected);
        assert!(f.device.connected());
        assert_eq!(f.device.history_len(), 0);

        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ResetResolver { device_id } if device_id == "light0"
        )));
    }

    #[tokio::test]
    async fn test_make_ready_forced_resync() {
        let mut f = fixture();
        f.device.init().await.unwrap();
        f.device
            .handle_state(
                &state(2000, "scene0", json!({ "type": "scene", "scene": 1 })),
                &f.mapping,
            )
            .unwrap();
        drain(&mut f.events);

        f.device.make_ready(false).await.unwrap();
        assert_eq!(f.device.history_len(), 1);
        assert!(drain(&mut f.events).is_empty());

        f.device.make_ready(true).await.unwrap();
        assert_eq!(f.device.history_len(), 0);
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [Event::ResetResolver { .. }]
        ));
        f.device.stand_down(true).await.unwrap();
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [Event::Info { .. }]
        ));
    }

    #[tokio::test]
    async fn test_terminate_is_final() {
        let f = fixture();
        f.device.init().await.unwrap();
        f.device
            .handle_state(
                &state(2000, "scene0", json!({ "type": "scene", "scene": 1 })),
                &f.mapping,
            )
            .unwrap();

        f.device.terminate().await.unwrap();
        assert_eq!(f.device.connection_state(), ConnectionState::Terminated);
        assert!(f.scheduler.is_empty());
        assert_eq!(f.device.history_len(), 0);

        // status callbacks after terminate are ignored
        f.transport.set_status(ConnectionStatus::Connected);
        assert_eq!(f.device.connection_state(), ConnectionState::Terminated);

        assert!(matches!(
            f.device.handle_state(&ResolvedState::empty(3000), &f.mapping),
            Err(DeviceError::Terminated(_))
        ));
        assert!(f.device.init().await.is_err());
        // terminating twice is harmless
        f.device.terminate().await.unwrap();
    }
}
