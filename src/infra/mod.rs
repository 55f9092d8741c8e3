//! Infrastructure - configuration, hot reload, metrics, and logging
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults, validation)
//! - `config_watcher` - Modification-marker driven all-or-nothing reload
//! - `metrics` - Lock-free metrics collection
//! - `logging` - Tracing subscriber setup

pub mod config;
pub mod config_watcher;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use config_watcher::{ConfigWatcher, ReloadOutcome};
pub use metrics::Metrics;
