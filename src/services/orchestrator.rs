//! Per-tick control loop
//!
//! One tick per frame:
//! 1. drive telemetry reconnects
//! 2. poll the config file and take this tick's snapshot
//! 3. stop if the snapshot's stop flag is set
//! 4. wait (bounded) for the newest frame
//! 5. analyze the previous/current pair and feed the detector
//! 6. on a closed cycle: store, publish, snapshot
//!
//! No failure ends the loop; each one degrades a single subsystem.

use crate::domain::{CycleEvent, Frame};
use crate::infra::config::Config;
use crate::infra::{ConfigWatcher, Metrics, ReloadOutcome};
use crate::io::{
    AcquisitionError, BrokerLink, EventStore, FrameSource, SignalRecorder, SnapshotWriter, TelemetryPublisher,
};
use crate::services::analyzer::{AnalyzerParams, FrameAnalyzer};
use crate::services::cycle_detector::CycleDetector;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a single tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Stop flag set; the loop should end
    Stop,
    /// No usable frame this tick
    NoFrame,
    /// First frame after (re)start; kept as the reference for the next tick
    Primed,
    /// Frame pair could not be analyzed
    AnalysisFailed,
    /// Detector ran; carries the event if a cycle closed
    Sampled(Option<CycleEvent>),
}

pub struct Orchestrator<A: FrameAnalyzer, L: BrokerLink> {
    /// Source of the active config snapshot and the stop flag
    pub(crate) config: ConfigWatcher,
    /// Config the components were last configured from
    pub(crate) applied: Arc<Config>,
    pub(crate) frames: FrameSource,
    pub(crate) analyzer: A,
    pub(crate) detector: CycleDetector,
    pub(crate) store: EventStore,
    pub(crate) publisher: TelemetryPublisher<L>,
    /// Per-cycle JPEG writer (None when disabled)
    pub(crate) snapshots: Option<SnapshotWriter>,
    /// Setup-mode trace writer (None unless setup mode is on)
    pub(crate) signals: Option<SignalRecorder>,
    pub(crate) metrics: Arc<Metrics>,
    /// Reference frame for the next analysis
    pub(crate) previous: Option<Frame>,
    superseded_seen: u64,
}

impl<A: FrameAnalyzer, L: BrokerLink> Orchestrator<A, L> {
    pub fn new(config: ConfigWatcher, frames: FrameSource, analyzer: A, link: L, metrics: Arc<Metrics>) -> Self {
        let applied = config.snapshot();
        let publisher = TelemetryPublisher::new(link, applied.broker(), applied.identity(), metrics.clone());
        Self {
            detector: CycleDetector::new(applied.detector()),
            store: EventStore::new(applied.storage()),
            snapshots: SnapshotWriter::from_setting(&applied.storage().snapshot_dir),
            signals: signal_recorder_for(&applied, None),
            publisher,
            frames,
            analyzer,
            config,
            applied,
            metrics,
            previous: None,
            superseded_seen: 0,
        }
    }

    pub fn publisher(&self) -> &TelemetryPublisher<L> {
        &self.publisher
    }

    pub fn store_mut(&mut self) -> &mut EventStore {
        &mut self.store
    }

    /// Run ticks until the stop flag is set or `shutdown` fires, then tear down
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(config_file = %self.config.path().display(), "control_loop_started");
        loop {
            if *shutdown.borrow() {
                info!("control_loop_shutdown_signal");
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("control_loop_shutdown_signal");
                        break;
                    }
                }
                outcome = self.tick() => {
                    if outcome == TickOutcome::Stop {
                        info!("control_loop_stop_flag");
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// One pass of the control loop
    pub async fn tick(&mut self) -> TickOutcome {
        self.metrics.record_tick();
        self.publisher.tick(Instant::now());

        match self.config.poll() {
            ReloadOutcome::Reloaded => {
                self.metrics.record_config_reload(true);
                self.apply_config().await;
            }
            ReloadOutcome::Rejected => self.metrics.record_config_reload(false),
            ReloadOutcome::Unchanged | ReloadOutcome::Unavailable => {}
        }
        if self.config.stop_requested() {
            return TickOutcome::Stop;
        }
        let config = self.config.snapshot();

        let frame = match self.frames.get_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                if matches!(e, AcquisitionError::Timeout(_)) {
                    self.metrics.record_acquisition_timeout();
                }
                if e.triggers_restart() {
                    self.metrics.record_worker_restart();
                    // The next frame comes from a fresh worker; do not diff across the gap
                    self.previous = None;
                }
                debug!(error = %e, "tick_without_frame");
                return TickOutcome::NoFrame;
            }
        };
        let started = Instant::now();
        self.metrics.record_frame();
        let superseded = self.frames.superseded();
        self.metrics.record_frames_superseded(superseded.saturating_sub(self.superseded_seen));
        self.superseded_seen = superseded;

        let Some(previous) = self.previous.replace(frame.clone()) else {
            return TickOutcome::Primed;
        };

        let params = AnalyzerParams::from_config(&config);
        let sample = match self.analyzer.analyze(&previous, &frame, &params) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "frame_analysis_failed");
                return TickOutcome::AnalysisFailed;
            }
        };

        let event = self.detector.update(&sample);
        if let Some(recorder) = self.signals.as_mut() {
            recorder.record(&sample, &self.detector.snapshot());
        }
        if let Some(event) = &event {
            self.handle_cycle(event, &frame);
        }

        self.metrics.record_tick_latency(started.elapsed().as_micros() as u64);
        TickOutcome::Sampled(event)
    }

    /// Persist, publish and snapshot one closed cycle
    fn handle_cycle(&mut self, event: &CycleEvent, frame: &Frame) {
        info!(
            id = %event.id,
            part = %event.part_label(),
            cycle_length = ?event.cycle_length,
            inter_cycle_time = ?event.inter_cycle_time,
            box_present = %event.box_present,
            "cycle_emitted"
        );
        self.metrics.record_cycle(event.part_1, event.part_2);

        if let Err(e) = self.store.record(event) {
            self.metrics.record_persist_failure();
            error!(id = %event.id, error = %e, retryable = %e.is_retryable(), "cycle_persist_failed");
        }

        self.publisher.publish_cycle(event);

        if let Some(writer) = &self.snapshots {
            if let Err(e) = writer.save(frame, event.id) {
                warn!(id = %event.id, error = %e, "cycle_snapshot_failed");
            }
        }
    }

    /// Push a freshly reloaded snapshot into the components that follow it live
    async fn apply_config(&mut self) {
        let next = self.config.snapshot();
        self.detector.apply_settings(next.detector());
        self.store.apply_settings(next.storage());
        self.publisher.apply_settings(next.broker(), next.identity()).await;
        if next.storage().snapshot_dir != self.applied.storage().snapshot_dir {
            self.snapshots = SnapshotWriter::from_setting(&next.storage().snapshot_dir);
        }
        self.signals = signal_recorder_for(&next, self.signals.take());
        self.applied = next;
    }

    /// Stop acquisition and announce offline
    pub async fn shutdown(&mut self) {
        self.frames.shutdown().await;
        self.publisher.shutdown().await;
        info!("control_loop_stopped");
    }
}

/// Keep, create or drop the setup-mode recorder to match `config`
fn signal_recorder_for(config: &Config, current: Option<SignalRecorder>) -> Option<SignalRecorder> {
    let dir = &config.storage().signal_log_dir;
    if !config.setup_mode() || dir.trim().is_empty() {
        if current.is_some() {
            info!("signal_recording_stopped");
        }
        return None;
    }
    match current {
        Some(recorder) if recorder.log_dir() == Path::new(dir) => Some(recorder),
        _ => Some(SignalRecorder::new(dir, &config.identity().device_name)),
    }
}
