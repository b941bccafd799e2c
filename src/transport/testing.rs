//! Recording transport for tests

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::{ConnectionStatus, StatusCallback, Transport};
use crate::command::Command;
use crate::time::Clock;

/// A command as received by the recording transport
#[derive(Debug, Clone)]
pub(crate) struct SentCommand {
    pub command: Command,
    /// Clock time when `send` was called
    pub at: u64,
}

/// Records every command; can be told to fail
pub(crate) struct RecordingTransport {
    name: String,
    clock: Option<Arc<dyn Clock>>,
    sent: Mutex<Vec<SentCommand>>,
    /// Zero-based call indexes that fail
    fail_calls: Mutex<HashSet<usize>>,
    calls: Mutex<usize>,
    fail_init: Mutex<bool>,
    /// Wall-clock time each init and send takes
    delay: Mutex<Option<Duration>>,
    status: RwLock<ConnectionStatus>,
    status_callbacks: RwLock<Vec<StatusCallback>>,
}

impl RecordingTransport {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, None))
    }

    pub fn with_clock(name: &str, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::build(name, Some(clock)))
    }

    fn build(name: &str, clock: Option<Arc<dyn Clock>>) -> Self {
        Self {
            name: name.to_string(),
            clock,
            sent: Mutex::new(Vec::new()),
            fail_calls: Mutex::new(HashSet::new()),
            calls: Mutex::new(0),
            fail_init: Mutex::new(false),
            delay: Mutex::new(None),
            status: RwLock::new(ConnectionStatus::Disconnected),
            status_callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn fail_call(&self, index: usize) {
        self.fail_calls.lock().insert(index);
    }

    pub fn set_fail_init(&self, fail: bool) {
        *self.fail_init.lock() = fail;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.sent.lock().iter().map(|s| s.command.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    async fn wait(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Simulate a connection change coming from the wire
    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status.clone();
        for callback in self.status_callbacks.read().iter() {
            callback(status.clone());
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> Result<()> {
        self.wait().await;
        if *self.fail_init.lock() {
            self.set_status(ConnectionStatus::Disconnected);
            bail!("connection refused");
        }
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn send(&self, command: &Command) -> Result<()> {
        let call = {
            let mut calls = self.calls.lock();
            let call = *calls;
            *calls += 1;
            call
        };
        if self.fail_calls.lock().contains(&call) {
            bail!("forced failure on call {}", call);
        }
        self.wait().await;
        let at = self.clock.as_ref().map(|c| c.now()).unwrap_or_default();
        self.sent.lock().push(SentCommand {
            command: command.clone(),
            at,
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.set_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    fn subscribe_connection_status(&self, callback: StatusCallback) {
        self.status_callbacks.write().push(callback);
    }
}
