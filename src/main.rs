//! Playout GW - Rust implementation
//!
//! Plays a timeline out to lighting desks, mixers and PTZ cameras.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playout_gw::api::{self, ApiState};
use playout_gw::config::{watcher::ConfigWatcher, AppConfig};
use playout_gw::{Conductor, SystemClock};

/// Playout GW - timeline-driven device control
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write daily-rotated logs to this directory
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Override the diagnostics API port
    #[arg(long)]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    if args.check {
        return check_config(&args.config).await;
    }

    let _log_guard = init_logging(&args.log_level, args.log_dir.as_deref())?;

    info!("🚀 Starting Playout GW v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let (config_watcher, config) = ConfigWatcher::new(args.config.clone()).await?;
    info!("Configuration loaded successfully with hot-reload enabled");

    let conductor = Arc::new(Conductor::new(
        Arc::new(SystemClock),
        config.conductor.to_options(),
    ));

    for device in config.enabled_devices() {
        let transport = device.transport.build(&device.id);
        match conductor.add_device(&device.id, device.kind, transport).await {
            Ok(true) => {}
            Ok(false) => warn!("⚠️  Device '{}' is not connected yet", device.id),
            Err(e) => warn!("⚠️  Failed to add device '{}': {}", device.id, e),
        }
    }
    conductor.set_mapping(config.mappings.clone());
    conductor
        .set_timeline(config.timeline.clone())
        .context("Failed to load timeline")?;

    let api_port = match (&config.api, args.api_port) {
        (_, Some(port)) => Some(port),
        (Some(api), None) if api.enabled => Some(api.port),
        _ => None,
    };
    if let Some(port) = api_port {
        let state = Arc::new(ApiState {
            conductor: conductor.clone(),
        });
        tokio::spawn(async move {
            if let Err(e) = api::start_server(state, port).await {
                warn!("⚠️  Diagnostics API stopped: {:#}", e);
            }
        });
    }

    run_app(conductor.clone(), config, config_watcher, shutdown_signal()).await;

    info!("Shutting down...");
    conductor.terminate().await;
    info!("Playout GW shutdown complete");
    Ok(())
}

async fn run_app(
    conductor: Arc<Conductor>,
    mut config: AppConfig,
    mut config_watcher: ConfigWatcher,
    shutdown: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    // own task so a slow reload (device init/terminate) never delays due commands
    let runner = conductor.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    loop {
        tokio::select! {
            result = &mut run => {
                if let Err(e) = result {
                    warn!("⚠️  Conductor task failed: {}", e);
                } else {
                    warn!("Conductor loop exited");
                }
                return;
            }

            Some(new_config) = config_watcher.next_config() => {
                info!("📝 Configuration file changed, applying...");
                apply_config(&conductor, &config, &new_config).await;
                config = new_config;
                info!("✅ Configuration applied");
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping conductor");
                break;
            }
        }
    }

    run.abort();
}

/// Apply the parts of a reloaded config that changed
async fn apply_config(conductor: &Conductor, old: &AppConfig, new: &AppConfig) {
    if old.conductor != new.conductor {
        warn!("⚠️  Conductor timing changes take effect after a restart");
    }

    for device in old.enabled_devices() {
        if !new.enabled_devices().any(|d| d.id == device.id) {
            if let Err(e) = conductor.remove_device(&device.id).await {
                warn!("⚠️  Failed to remove device '{}': {}", device.id, e);
            }
        }
    }

    for device in new.enabled_devices() {
        if old.enabled_devices().any(|d| d == device) {
            continue;
        }
        let transport = device.transport.build(&device.id);
        if let Err(e) = conductor.add_device(&device.id, device.kind, transport).await {
            warn!("⚠️  Failed to add device '{}': {}", device.id, e);
        }
    }

    if old.mappings != new.mappings {
        conductor.set_mapping(new.mappings.clone());
    }

    if old.timeline != new.timeline {
        // validated on load, so this only fails on a race with another edit
        if let Err(e) = conductor.set_timeline(new.timeline.clone()) {
            warn!("⚠️  Failed to load timeline (keeping old one): {}", e);
        }
    }
}

/// Validate the configuration file and print a summary
async fn check_config(path: &str) -> Result<()> {
    use colored::*;

    println!("\n{}", "=== Checking configuration ===".bold().cyan());
    println!("  File: {}", path.yellow());

    let config = match AppConfig::load(path).await {
        Ok(config) => config,
        Err(e) => {
            println!("\n{} {:#}", "❌ Invalid configuration:".red().bold(), e);
            return Err(e);
        }
    };

    println!("\n{}", "Devices:".bold());
    for device in &config.devices {
        let state = if device.disabled {
            "disabled".dimmed()
        } else {
            "enabled".green()
        };
        println!("  {} ({}) {}", device.id.yellow(), device.kind, state);
    }

    println!("\n{}", "Mappings:".bold());
    for (layer, mapping) in &config.mappings {
        let channel = mapping
            .channel
            .map(|c| format!(" channel {}", c))
            .unwrap_or_default();
        println!(
            "  {} → {}{}",
            layer.yellow(),
            mapping.device_id.green(),
            channel
        );
    }

    println!(
        "\n  Timeline objects: {}",
        config.timeline.len().to_string().green()
    );
    println!(
        "  Lookahead: {} ms, poll interval: {} ms",
        config.conductor.lookahead_ms, config.conductor.poll_interval_ms
    );

    println!("\n{}", "✅ Configuration is valid!".green().bold());
    Ok(())
}

fn init_logging(
    level: &str,
    log_dir: Option<&str>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "playout-gw.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
}
