//! Configuration management for playout-gw
//!
//! Handles loading, validation and hot-reloading of the YAML configuration:
//! conductor timing, devices, layer mappings and the reference timeline.

pub mod watcher;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::fs;

use crate::conductor::{
    ConductorOptions, DEFAULT_LOOKAHEAD_MS, DEFAULT_MAX_LOOKAHEAD_STATES,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_STATE_RETENTION_MS,
};
use crate::devices::DeviceKind;
use crate::mapping::Mapping;
use crate::scheduler::{
    SchedulerOptions, DEFAULT_LATE_THRESHOLD_MS, DEFAULT_SLOW_FULFILLED_THRESHOLD_MS,
};
use crate::timeline::{SimpleTimeline, TimelineObject};
use crate::transport::{ConsoleTransport, Transport};

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub conductor: ConductorConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Layer id → device routing
    #[serde(default)]
    pub mappings: Mapping,
    /// Objects for the built-in timeline resolver
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timeline: Vec<TimelineObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiConfig>,
}

/// Conductor and scheduler timing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConductorConfig {
    #[serde(default = "default_lookahead")]
    pub lookahead_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_late_threshold")]
    pub late_threshold_ms: u64,
    #[serde(default = "default_slow_fulfilled_threshold")]
    pub slow_fulfilled_threshold_ms: u64,
    #[serde(default = "default_state_retention")]
    pub state_retention_ms: u64,
    #[serde(default)]
    pub report_all_commands: bool,
    #[serde(default = "default_max_lookahead_states")]
    pub max_lookahead_states: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: default_lookahead(),
            poll_interval_ms: default_poll_interval(),
            late_threshold_ms: default_late_threshold(),
            slow_fulfilled_threshold_ms: default_slow_fulfilled_threshold(),
            state_retention_ms: default_state_retention(),
            report_all_commands: false,
            max_lookahead_states: default_max_lookahead_states(),
        }
    }
}

impl ConductorConfig {
    pub fn to_options(&self) -> ConductorOptions {
        ConductorOptions {
            lookahead_ms: self.lookahead_ms,
            poll_interval_ms: self.poll_interval_ms,
            state_retention_ms: self.state_retention_ms,
            max_lookahead_states: self.max_lookahead_states,
            scheduler: SchedulerOptions {
                late_threshold_ms: self.late_threshold_ms,
                slow_fulfilled_threshold_ms: self.slow_fulfilled_threshold_ms,
                report_all_commands: self.report_all_commands,
            },
        }
    }
}

/// One device instance
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub id: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

/// How commands leave the process
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Log commands instead of sending them
    #[default]
    Console,
}

impl TransportConfig {
    pub fn build(&self, device_id: &str) -> Arc<dyn Transport> {
        match self {
            TransportConfig::Console => Arc::new(ConsoleTransport::new(device_id)),
        }
    }
}

/// HTTP/WebSocket diagnostics API
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Devices that should be running
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter().filter(|d| !d.disabled)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        let conductor = &self.conductor;
        if conductor.lookahead_ms == 0 {
            bail!("conductor.lookahead_ms must be greater than 0");
        }
        if conductor.poll_interval_ms == 0 {
            bail!("conductor.poll_interval_ms must be greater than 0");
        }
        if conductor.max_lookahead_states == 0 {
            bail!("conductor.max_lookahead_states must be at least 1");
        }
        if conductor.state_retention_ms < conductor.lookahead_ms {
            bail!(
                "conductor.state_retention_ms ({}) must not be shorter than lookahead_ms ({})",
                conductor.state_retention_ms,
                conductor.lookahead_ms
            );
        }

        let mut kinds: HashMap<&str, DeviceKind> = HashMap::new();
        for (idx, device) in self.devices.iter().enumerate() {
            if device.id.is_empty() {
                bail!("Device {} id cannot be empty", idx);
            }
            if kinds.insert(device.id.as_str(), device.kind).is_some() {
                bail!("Duplicate device id '{}'", device.id);
            }
        }

        for (layer, mapping) in &self.mappings {
            let Some(kind) = kinds.get(mapping.device_id.as_str()) else {
                bail!(
                    "Mapping '{}' references unknown device '{}'",
                    layer,
                    mapping.device_id
                );
            };
            if *kind != mapping.device {
                bail!(
                    "Mapping '{}' expects a {} device but '{}' is a {} device",
                    layer,
                    mapping.device,
                    mapping.device_id,
                    kind
                );
            }
            if mapping.device == DeviceKind::Mixer && mapping.channel.is_none() {
                bail!("Mapping '{}' targets a mixer and needs a channel", layer);
            }
        }

        SimpleTimeline::new(self.timeline.clone()).context("Invalid timeline")?;

        Ok(())
    }
}

// Default value functions
fn default_lookahead() -> u64 { DEFAULT_LOOKAHEAD_MS }
fn default_poll_interval() -> u64 { DEFAULT_POLL_INTERVAL_MS }
fn default_late_threshold() -> u64 { DEFAULT_LATE_THRESHOLD_MS }
fn default_slow_fulfilled_threshold() -> u64 { DEFAULT_SLOW_FULFILLED_THRESHOLD_MS }
fn default_state_retention() -> u64 { DEFAULT_STATE_RETENTION_MS }
fn default_max_lookahead_states() -> usize { DEFAULT_MAX_LOOKAHEAD_STATES }
fn default_true() -> bool { true }
fn default_api_port() -> u16 { 8125 }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXAMPLE: &str = r##"
conductor:
  lookahead_ms: 500
  report_all_commands: true

devices:
  - id: light0
    kind: lighting
  - id: mixer0
    kind: mixer
    transport:
      type: console
  - id: cam0
    kind: ptz
    disabled: true

mappings:
  stage:
    device: lighting
    device_id: light0
  host:
    device: mixer
    device_id: mixer0
    channel: 1
    layer_priority: 2

timeline:
  - id: scene0
    layer: stage
    start: 1000
    duration: 5000
    content:
      type: scene
      scene: 1
  - id: scene1
    layer: stage
    start: "#scene0.start + 1000"
    content:
      type: scene
      scene: 2

api:
  port: 9000
"##;

    #[tokio::test]
    async fn test_load_example() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, EXAMPLE)?;

        let config = AppConfig::load(&path.to_string_lossy()).await?;
        assert_eq!(config.conductor.lookahead_ms, 500);
        assert_eq!(config.conductor.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert!(config.conductor.report_all_commands);
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.devices[1].transport, TransportConfig::Console);
        assert_eq!(
            config.enabled_devices().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["light0", "mixer0"]
        );
        assert_eq!(config.mappings["host"].channel, Some(1));
        assert_eq!(config.mappings["host"].layer_priority, 2);
        assert_eq!(config.timeline.len(), 2);

        let api = config.api.as_ref().unwrap();
        assert!(api.enabled);
        assert_eq!(api.port, 9000);

        let options = config.conductor.to_options();
        assert_eq!(options.lookahead_ms, 500);
        assert!(options.scheduler.report_all_commands);
        Ok(())
    }

    #[tokio::test]
    async fn test_save_and_reload() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.yaml");
        let config: AppConfig = serde_yaml::from_str(EXAMPLE)?;
        config.save(&path.to_string_lossy()).await?;

        let reloaded = AppConfig::load(&path.to_string_lossy()).await?;
        assert_eq!(reloaded, config);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = AppConfig::load("/nonexistent/playout.yaml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.conductor, ConductorConfig::default());
    }

    fn invalid(yaml: &str) -> String {
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        format!("{:#}", config.validate().unwrap_err())
    }

    #[test]
    fn test_validation_errors() {
        assert!(invalid(
            "devices: [{ id: a, kind: mixer }, { id: a, kind: ptz }]"
        )
        .contains("Duplicate device id"));

        assert!(invalid("mappings: { l: { device: ptz, device_id: ghost } }")
            .contains("unknown device 'ghost'"));

        assert!(invalid(
            "devices: [{ id: a, kind: mixer }]\nmappings: { l: { device: lighting, device_id: a } }"
        )
        .contains("is a mixer device"));

        assert!(invalid(
            "devices: [{ id: a, kind: mixer }]\nmappings: { l: { device: mixer, device_id: a } }"
        )
        .contains("needs a channel"));

        assert!(invalid("conductor: { lookahead_ms: 0 }").contains("lookahead_ms"));

        assert!(invalid(
            "timeline: [{ id: x, layer: l, start: '#nope.start + 1' }]"
        )
        .contains("unknown object 'nope'"));

        assert!(invalid(
            "timeline: [{ id: x, layer: a, start: 100 }, { id: x, layer: b, start: 5000 }]"
        )
        .contains("duplicate timeline object id 'x'"));

        assert!(invalid(
            "timeline: [{ id: x, layer: a, start: 18446744073709551614, duration: 10 }]"
        )
        .contains("beyond the end of time"));
    }
}
