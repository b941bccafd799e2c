//! Configuration file watcher for hot-reload support
//!
//! Editors often save through several filesystem events (truncate, write,
//! rename). Each event bumps a generation counter; a reload only goes
//! through if no newer event arrived during the debounce delay.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches the config file and yields every successfully reloaded config
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Load `config_path` and start watching it
    pub async fn new(config_path: String) -> Result<(Self, AppConfig)> {
        let (tx, rx) = mpsc::channel(8);

        let initial = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;

        let path = PathBuf::from(&config_path);
        let file_name = path.file_name().map(|n| n.to_os_string());
        // watch the directory so rename-on-save editors keep working
        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        // notify callbacks run on their own OS thread, outside the runtime
        let runtime = tokio::runtime::Handle::current();
        let generation = Arc::new(AtomicU64::new(0));

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!("Config watch error: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let concerns_config = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if !concerns_config {
                return;
            }
            debug!("Config file changed: {:?}", event.paths);

            let current = generation.fetch_add(1, Ordering::SeqCst) + 1;
            let generation = generation.clone();
            let config_path = config_path.clone();
            let tx = tx.clone();
            runtime.spawn(async move {
                tokio::time::sleep(DEBOUNCE).await;
                if generation.load(Ordering::SeqCst) != current {
                    return;
                }
                match AppConfig::load(&config_path).await {
                    Ok(config) => {
                        info!("🔄 Configuration reloaded");
                        if tx.send(config).await.is_err() {
                            debug!("Config receiver dropped");
                        }
                    }
                    Err(e) => warn!("⚠️  Config reload failed (keeping current): {:#}", e),
                }
            });
        })?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config directory: {}", watch_dir.display()))?;

        info!("👀 Watching {} for changes", path.display());

        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            initial,
        ))
    }

    /// Wait for the next valid config; `None` once the watcher is gone
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}
