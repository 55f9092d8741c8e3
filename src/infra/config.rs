//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/counter.toml
//!
//! Every key has a default, so a partial file is valid. The parsed file is
//! validated as a whole; a `Config` value is only ever produced from a file
//! that passed validation, which is what makes hot reload all-or-nothing.

use crate::domain::{HsvBounds, Rect};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default config path when neither flag nor environment names one
pub const DEFAULT_CONFIG_PATH: &str = "config/counter.toml";

/// Upper bound for every timing key given in seconds (one day)
pub const MAX_DURATION_SECS: f64 = 86_400.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub setup_mode: bool,
    /// Carried for operators; rendering is not part of this daemon
    pub video_preview: bool,
    /// Cooperative stop flag, sampled once per tick
    pub stop_running: bool,
    pub metrics_interval_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self { setup_mode: false, video_preview: false, stop_running: false, metrics_interval_secs: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// RTSP (or any ffmpeg-readable) source URL
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub frame_timeout_secs: f64,
    pub restart_delay_secs: f64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            width: 640,
            height: 360,
            frame_timeout_secs: 5.0,
            restart_delay_secs: 5.0,
        }
    }
}

impl CameraSettings {
    pub fn frame_timeout(&self) -> Duration {
        secs_to_duration(self.frame_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        secs_to_duration(self.restart_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RegionSettings {
    pub flow: Rect,
    pub conveyor: Rect,
    pub color_1: Rect,
    pub color_2: Rect,
}

impl Default for RegionSettings {
    fn default() -> Self {
        Self {
            flow: Rect::new(90, 180, 540, 240),
            conveyor: Rect::new(600, 340, 630, 360),
            color_1: Rect::new(222, 204, 240, 270),
            color_2: Rect::new(222, 204, 240, 270),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ColorSettings {
    pub bounds_1: HsvBounds,
    pub bounds_2: HsvBounds,
    pub brightness_threshold: u8,
}

impl Default for ColorSettings {
    fn default() -> Self {
        Self {
            bounds_1: HsvBounds::new([0, 0, 0], [179, 255, 255]),
            bounds_2: HsvBounds::new([13, 23, 244], [35, 255, 255]),
            brightness_threshold: 245,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub smoothing_window: usize,
    pub hysteresis_threshold: f64,
    pub ceiling: f64,
    pub classification_threshold: f64,
    pub cooldown_seconds: f64,
    pub box_window: usize,
    pub box_threshold: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            smoothing_window: 5,
            hysteresis_threshold: 0.25,
            ceiling: 300.0,
            classification_threshold: 10.0,
            cooldown_seconds: 300.0,
            box_window: 30,
            box_threshold: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub path: String,
    pub table: String,
    /// Directory for per-cycle JPEG snapshots (empty to disable)
    pub snapshot_dir: String,
    /// Directory for setup-mode signal logs (empty to disable)
    pub signal_log_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: "disa3.db".to_string(),
            table: "counts".to_string(),
            snapshot_dir: "images".to_string(),
            signal_log_dir: "signals".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Broker host (empty to disable telemetry)
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub reconnect_min_secs: f64,
    pub reconnect_max_secs: f64,
    pub topic_prefix: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 60,
            reconnect_min_secs: 1.0,
            reconnect_max_secs: 120.0,
            topic_prefix: "tdg/tdf/".to_string(),
        }
    }
}

impl BrokerSettings {
    pub fn enabled(&self) -> bool {
        !self.host.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub cell_name: String,
    pub device_name: String,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self { cell_name: "disa3".to_string(), device_name: "optical_counter".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Directory for a daily rolling log file (empty logs to stdout)
    pub dir: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false, dir: String::new() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TomlConfig {
    pub runtime: RuntimeSettings,
    pub camera: CameraSettings,
    pub regions: RegionSettings,
    pub color: ColorSettings,
    pub detector: DetectorSettings,
    pub storage: StorageSettings,
    pub broker: BrokerSettings,
    pub identity: IdentitySettings,
    pub logging: LoggingSettings,
}

/// Main configuration struct used throughout the application
///
/// Immutable once built; hot reload replaces the whole value.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    runtime: RuntimeSettings,
    camera: CameraSettings,
    regions: RegionSettings,
    color: ColorSettings,
    detector: DetectorSettings,
    storage: StorageSettings,
    broker: BrokerSettings,
    identity: IdentitySettings,
    logging: LoggingSettings,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content =
            fs::read_to_string(path).map_err(|source| ConfigError::Io { path: display.clone(), source })?;
        Self::from_toml_str(&content, &display)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let toml_config: TomlConfig = toml::from_str(content)
            .map_err(|source| ConfigError::Parse { path: origin.to_string(), source })?;
        let config = Self::from_toml(toml_config, origin);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    fn from_toml(toml_config: TomlConfig, origin: &str) -> Self {
        Self {
            runtime: toml_config.runtime,
            camera: toml_config.camera,
            regions: toml_config.regions,
            color: toml_config.color,
            detector: toml_config.detector,
            storage: toml_config.storage,
            broker: toml_config.broker,
            identity: toml_config.identity,
            logging: toml_config.logging,
            config_file: origin.to_string(),
        }
    }

    /// Check cross-field constraints. Any violation rejects the whole file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if d.smoothing_window == 0 {
            return Err(invalid("detector.smoothing_window must be at least 1"));
        }
        if d.box_window == 0 {
            return Err(invalid("detector.box_window must be at least 1"));
        }
        for (name, value) in [
            ("detector.hysteresis_threshold", d.hysteresis_threshold),
            ("detector.ceiling", d.ceiling),
            ("detector.classification_threshold", d.classification_threshold),
            ("detector.cooldown_seconds", d.cooldown_seconds),
            ("detector.box_threshold", d.box_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(&format!("{name} must be a finite non-negative number")));
            }
        }
        if d.ceiling <= 0.0 {
            return Err(invalid("detector.ceiling must be greater than zero"));
        }

        for (name, rect) in [
            ("regions.flow", &self.regions.flow),
            ("regions.conveyor", &self.regions.conveyor),
            ("regions.color_1", &self.regions.color_1),
            ("regions.color_2", &self.regions.color_2),
        ] {
            if rect.is_empty() {
                return Err(invalid(&format!("{name} lower_right must lie beyond upper_left")));
            }
        }

        for (name, bounds) in [("color.bounds_1", &self.color.bounds_1), ("color.bounds_2", &self.color.bounds_2)]
        {
            if bounds.lower[0] > 179 || bounds.upper[0] > 179 {
                return Err(invalid(&format!("{name} hue must be within 0-179")));
            }
        }

        let c = &self.camera;
        let b = &self.broker;
        for (name, value) in [
            ("camera.frame_timeout_secs", c.frame_timeout_secs),
            ("camera.restart_delay_secs", c.restart_delay_secs),
            ("broker.reconnect_min_secs", b.reconnect_min_secs),
            ("broker.reconnect_max_secs", b.reconnect_max_secs),
        ] {
            if value > MAX_DURATION_SECS {
                return Err(invalid(&format!("{name} must not exceed {MAX_DURATION_SECS} seconds")));
            }
        }
        if c.width == 0 || c.height == 0 {
            return Err(invalid("camera width and height must be non-zero"));
        }
        if !(c.frame_timeout_secs.is_finite() && c.frame_timeout_secs > 0.0) {
            return Err(invalid("camera.frame_timeout_secs must be greater than zero"));
        }
        if !(c.restart_delay_secs.is_finite() && c.restart_delay_secs >= 0.0) {
            return Err(invalid("camera.restart_delay_secs must be non-negative"));
        }

        if !(b.reconnect_min_secs.is_finite() && b.reconnect_min_secs > 0.0) {
            return Err(invalid("broker.reconnect_min_secs must be greater than zero"));
        }
        if !b.reconnect_max_secs.is_finite() || b.reconnect_max_secs < b.reconnect_min_secs {
            return Err(invalid("broker.reconnect_max_secs must be at least reconnect_min_secs"));
        }

        if !is_sql_identifier(&self.storage.table) {
            return Err(invalid("storage.table must be a plain identifier ([A-Za-z_][A-Za-z0-9_]*)"));
        }
        if self.storage.path.trim().is_empty() {
            return Err(invalid("storage.path must not be empty"));
        }
        if self.identity.cell_name.is_empty() || self.identity.device_name.is_empty() {
            return Err(invalid("identity cell_name and device_name must not be empty"));
        }
        for (name, value) in [("identity.cell_name", &self.identity.cell_name), ("identity.device_name", &self.identity.device_name)] {
            if value.contains(['/', '+', '#']) {
                return Err(invalid(&format!("{name} must not contain MQTT topic separators or wildcards")));
            }
        }

        Ok(())
    }

    // Section getters
    pub fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub fn camera(&self) -> &CameraSettings {
        &self.camera
    }

    pub fn regions(&self) -> &RegionSettings {
        &self.regions
    }

    pub fn color(&self) -> &ColorSettings {
        &self.color
    }

    pub fn detector(&self) -> &DetectorSettings {
        &self.detector
    }

    pub fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub fn broker(&self) -> &BrokerSettings {
        &self.broker
    }

    pub fn identity(&self) -> &IdentitySettings {
        &self.identity
    }

    pub fn logging(&self) -> &LoggingSettings {
        &self.logging
    }

    // Frequently used flags
    pub fn stop_running(&self) -> bool {
        self.runtime.stop_running
    }

    pub fn setup_mode(&self) -> bool {
        self.runtime.setup_mode
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

/// Seconds to `Duration`, clamped to `0..=MAX_DURATION_SECS`; NaN maps to zero
pub fn secs_to_duration(secs: f64) -> Duration {
    let clamped = if secs.is_nan() { 0.0 } else { secs.clamp(0.0, MAX_DURATION_SECS) };
    Duration::try_from_secs_f64(clamped).unwrap_or(Duration::ZERO)
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

/// Table names are interpolated into SQL, so only plain identifiers pass
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
