//! Device registry operations

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::command::PendingCommand;
use crate::devices::{create_device, Device, DeviceKind, DeviceStatus};
use crate::error::DeviceError;
use crate::transport::Transport;

/// Snapshot of one registered device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub transport: String,
    pub connected: bool,
    pub status: DeviceStatus,
    pub queued: usize,
}

impl super::Conductor {
    /// Register and connect a device. Returns whether the connection came up;
    /// a device that failed to connect stays registered.
    pub async fn add_device(
        &self,
        device_id: &str,
        kind: DeviceKind,
        transport: Arc<dyn Transport>,
    ) -> Result<bool, DeviceError> {
        if self.devices.contains_key(device_id) {
            self.remove_device(device_id).await?;
        }

        let device = create_device(
            device_id,
            kind,
            transport,
            self.scheduler.clone(),
            self.event_tx.clone(),
        );
        let connected = device.init().await?;
        self.devices.insert(device_id.to_string(), device);

        info!("➕ Device '{}' added ({})", device_id, kind);
        self.reset_resolver();
        Ok(connected)
    }

    /// Terminate and unregister a device. Returns false if it was unknown.
    pub async fn remove_device(&self, device_id: &str) -> Result<bool, DeviceError> {
        let Some((_, device)) = self.devices.remove(device_id) else {
            return Ok(false);
        };
        device.terminate().await?;
        info!("➖ Device '{}' removed", device_id);
        self.reset_resolver();
        Ok(true)
    }

    pub fn device(&self, device_id: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(device_id).map(|d| d.value().clone())
    }

    /// Registered device ids, sorted
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn device_info(&self, device_id: &str) -> Option<DeviceInfo> {
        self.device(device_id).map(|device| DeviceInfo {
            device_id: device.device_id().to_string(),
            kind: device.kind(),
            transport: device.name().to_string(),
            connected: device.connected(),
            status: device.status(),
            queued: device.queue().len(),
        })
    }

    pub fn device_infos(&self) -> Vec<DeviceInfo> {
        self.device_ids()
            .iter()
            .filter_map(|id| self.device_info(id))
            .collect()
    }

    /// Pending commands, for one device or all of them
    pub fn queue(&self, device_id: Option<&str>) -> Vec<PendingCommand> {
        self.scheduler.inspect(device_id)
    }

    /// Force every device to resend its full state
    pub async fn resync(&self) -> usize {
        let devices = self.device_list();
        let mut count = 0;
        for device in devices {
            match device.make_ready(true).await {
                Ok(()) => count += 1,
                Err(e) => warn!("⚠️  Resync of '{}' failed: {}", device.device_id(), e),
            }
        }
        self.reset_resolver();
        count
    }

    /// Terminate every device
    pub async fn terminate(&self) {
        for id in self.device_ids() {
            if let Err(e) = self.remove_device(&id).await {
                warn!("⚠️  Failed to terminate '{}': {}", id, e);
            }
        }
    }

    /// Snapshot of the registry; never hold DashMap refs across an await
    pub(super) fn device_list(&self) -> Vec<Arc<dyn Device>> {
        self.devices.iter().map(|d| d.value().clone()).collect()
    }
}
