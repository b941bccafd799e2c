//! Console transport - logs every command instead of sending it
//!
//! Useful for:
//! - Dry-running a timeline without hardware
//! - Checking diff output and timing from the logs
//! - Development without device dependencies

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ConnectionStatus, StatusCallback, Transport};
use crate::command::Command;

pub struct ConsoleTransport {
    name: String,
    /// Track if transport is initialized
    initialized: Arc<RwLock<bool>>,
    /// Sent command counter for debugging
    sent_count: Arc<RwLock<u64>>,
    status_callbacks: Arc<RwLock<Vec<StatusCallback>>>,
}

impl ConsoleTransport {
    /// Create a new ConsoleTransport with a given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initialized: Arc::new(RwLock::new(false)),
            sent_count: Arc::new(RwLock::new(0)),
            status_callbacks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Number of commands logged since init
    pub fn sent_count(&self) -> u64 {
        *self.sent_count.read()
    }

    fn emit_status(&self, status: ConnectionStatus) {
        for callback in self.status_callbacks.read().iter() {
            callback(status.clone());
        }
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> Result<()> {
        *self.initialized.write() = true;
        *self.sent_count.write() = 0;
        info!("✅ ConsoleTransport '{}' initialized", self.name);
        self.emit_status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn send(&self, command: &Command) -> Result<()> {
        if !*self.initialized.read() {
            bail!("ConsoleTransport '{}' is not initialized", self.name);
        }

        let exec_num = {
            let mut count = self.sent_count.write();
            *count += 1;
            *count
        };

        info!(
            "🎛️  [{}] '{}' → {} ({}) [planned {}] [cmd #{}]",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            command.device_id,
            command.payload,
            command.context,
            command.time,
            exec_num
        );

        debug!(
            transport = self.name,
            device_id = command.device_id,
            queue_id = ?command.queue_id,
            timeline_obj_id = command.timeline_obj_id,
            "ConsoleTransport send"
        );

        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let was_initialized = *self.initialized.read();
        if was_initialized {
            info!(
                "🛑 ConsoleTransport '{}' shutting down (sent {} commands)",
                self.name,
                self.sent_count()
            );
        }

        *self.initialized.write() = false;
        self.emit_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        if *self.initialized.read() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    fn subscribe_connection_status(&self, callback: StatusCallback) {
        self.status_callbacks.write().push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_command(context: &str) -> Command {
        Command {
            time: 1000,
            device_id: "light0".to_string(),
            queue_id: None,
            payload: json!({ "type": "start_scene", "scene": 1 }),
            context: context.to_string(),
            timeline_obj_id: "obj0".to_string(),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn test_console_transport_lifecycle() {
        let transport = ConsoleTransport::new("test");
        assert_eq!(transport.name(), "test");
        assert_eq!(transport.connection_status(), ConnectionStatus::Disconnected);

        transport.init().await.unwrap();
        assert_eq!(transport.connection_status(), ConnectionStatus::Connected);

        transport.send(&make_command("added: obj0")).await.unwrap();
        transport.send(&make_command("removed: obj0")).await.unwrap();
        assert_eq!(transport.sent_count(), 2);

        transport.shutdown().await.unwrap();
        assert_eq!(transport.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_console_transport_rejects_before_init() {
        let transport = ConsoleTransport::new("uninit_test");
        assert!(transport.send(&make_command("added: obj0")).await.is_err());
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_console_transport_status_callbacks() {
        let transport = ConsoleTransport::new("status_test");
        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen_clone = seen.clone();
        transport.subscribe_connection_status(Arc::new(move |status| {
            seen_clone.write().push(status);
        }));

        transport.init().await.unwrap();
        transport.shutdown().await.unwrap();

        assert_eq!(
            *seen.read(),
            vec![ConnectionStatus::Connected, ConnectionStatus::Disconnected]
        );
    }
}
