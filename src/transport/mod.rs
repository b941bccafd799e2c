//! Transports deliver encoded commands to hardware
//!
//! Wire protocols live outside the crate; a transport only has to accept a
//! [`Command`] and report success or failure. Failures are returned, never
//! panicked, so the scheduler can isolate them.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::command::Command;

pub mod console;

#[cfg(test)]
pub(crate) mod testing;

pub use console::ConsoleTransport;

/// Connection status of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Transport is connected and operational
    Connected,
    /// Transport is disconnected
    Disconnected,
    /// Transport is attempting to reconnect
    Reconnecting { attempt: usize },
}

/// Type alias for connection status callbacks
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Transport trait - every device talks to its hardware through one
///
/// All methods take `&self`; implementations use interior mutability.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs (e.g., "console", "osc")
    fn name(&self) -> &str;

    /// Open the connection
    async fn init(&self) -> Result<()>;

    /// Deliver one command
    async fn send(&self, command: &Command) -> Result<()>;

    /// Close the connection
    async fn shutdown(&self) -> Result<()>;

    /// Current connection state
    ///
    /// Default: always connected (for transports without a real connection)
    fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }

    /// Subscribe to connection status changes
    ///
    /// Default: no-op (transport doesn't track connection status)
    fn subscribe_connection_status(&self, _callback: StatusCallback) {}
}
