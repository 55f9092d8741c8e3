//! Cycle counter - edge process counting production cycles from a camera feed
//!
//! Watches a conveyor region for motion, classifies each cycle by color
//! intensity, stores it locally and reports it over MQTT.
//!
//! Module structure:
//! - `domain/` - Core types (Frame, SignalSample, CycleEvent)
//! - `io/` - External interfaces (camera, SQLite, MQTT, snapshots)
//! - `services/` - Analyzer, CycleDetector, Orchestrator
//! - `infra/` - Infrastructure (Config, ConfigWatcher, Logging, Metrics)

use anyhow::Result;
use clap::Parser;
use cycle_counter::infra::logging::init_logging;
use cycle_counter::infra::{Config, ConfigWatcher, Metrics};
use cycle_counter::io::ffmpeg::redact_credentials;
use cycle_counter::io::{FfmpegOpener, FrameSource, FrameSourceSettings, MqttLink};
use cycle_counter::services::{Orchestrator, RegionAnalyzer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Cycle counter - camera-based production cycle counting
#[derive(Parser, Debug)]
#[command(name = "cycle-counter", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/counter.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config.as_deref());

    let watcher = ConfigWatcher::open(&config_path);
    let config = watcher.snapshot();

    // Guard flushes the file writer on drop; keep it for the whole run
    let _log_guard = match init_logging(config.logging()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("cycle-counter: logging unavailable: {e:#}");
            None
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "cycle-counter starting");
    if watcher.using_defaults() {
        // The load error itself is reported by the first poll of the control loop
        warn!(config_file = %config_path, "config_using_defaults");
    }
    info!(
        config_file = %config.config_file(),
        camera = %redact_credentials(&config.camera().url),
        width = %config.camera().width,
        height = %config.camera().height,
        database = %config.storage().path,
        table = %config.storage().table,
        broker_host = %config.broker().host,
        broker_port = %config.broker().port,
        cell = %config.identity().cell_name,
        device = %config.identity().device_name,
        setup_mode = %config.setup_mode(),
        video_preview = %config.runtime().video_preview,
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let camera = config.camera();
    let opener = Arc::new(FfmpegOpener::new(camera.url.clone(), camera.width, camera.height));
    let frames = FrameSource::new(
        opener,
        FrameSourceSettings { frame_timeout: camera.frame_timeout(), restart_delay: camera.restart_delay() },
    );

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.runtime().metrics_interval_secs.max(1);
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = metrics_shutdown.changed() => break,
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let mut orchestrator = Orchestrator::new(watcher, frames, RegionAnalyzer::new(), MqttLink::new(), metrics.clone());
    orchestrator.run(shutdown_rx).await;

    metrics.report().log();
    info!("cycle-counter shutdown complete");
    Ok(())
}
