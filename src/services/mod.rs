//! Services - signal reduction and the control loop
//!
//! This module contains the core logic:
//! - `analyzer` - Frame pair to per-tick signals (injected capability + region analyzer)
//! - `cycle_detector` - Hysteresis state machine producing cycle events
//! - `orchestrator` - Per-tick loop wiring acquisition, detection, storage and telemetry

pub mod analyzer;
pub mod cycle_detector;
pub mod orchestrator;

// Re-export commonly used types
pub use analyzer::{AnalyzerError, AnalyzerParams, FrameAnalyzer, RegionAnalyzer};
pub use cycle_detector::{CycleDetector, DetectorSnapshot, DetectorState};
pub use orchestrator::{Orchestrator, TickOutcome};
