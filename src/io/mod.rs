//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `frame_source` - Watchdog-supervised frame acquisition with a latest-wins slot
//! - `ffmpeg` - Camera sensor read through an ffmpeg subprocess
//! - `event_store` - Durable cycle table (SQLite)
//! - `telemetry` - Status and cycle messages, reconnect policy
//! - `mqtt_link` - MQTT transport for telemetry
//! - `snapshot` - Per-cycle JPEG snapshots
//! - `signal_log` - Setup-mode JSONL signal recorder

pub mod event_store;
pub mod ffmpeg;
pub mod frame_source;
pub mod mqtt_link;
pub mod signal_log;
pub mod snapshot;
pub mod telemetry;

// Re-export commonly used types
pub use event_store::{EventStore, PersistenceError};
pub use ffmpeg::FfmpegOpener;
pub use frame_source::{AcquisitionError, FrameSensor, FrameSource, FrameSourceSettings, SensorOpener};
pub use mqtt_link::MqttLink;
pub use signal_log::SignalRecorder;
pub use snapshot::SnapshotWriter;
pub use telemetry::{BrokerLink, ConnectionState, Delivery, LinkOptions, TelemetryError, TelemetryPublisher};
