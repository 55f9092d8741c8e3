//! Watchdog-supervised frame acquisition
//!
//! A dedicated OS thread owns the sensor handle and writes every frame into a
//! single-slot `watch` channel, so an unread frame is simply overwritten by the
//! next one. The control loop only ever sees the newest frame.
//!
//! The watchdog measures time since the last frame handed to the control loop.
//! Once that exceeds the frame timeout the worker is torn down, and a fresh one
//! (which reopens the sensor from scratch) is started after the restart delay.
//! Open failures and worker exits follow the same path, forever.

use crate::domain::Frame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long `shutdown` waits for the worker thread before detaching it
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AcquisitionError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("failed to open sensor: {0}")]
    OpenFailed(String),
    #[error("acquisition worker exited: {0}")]
    WorkerExited(String),
    #[error("newest frame is {0:?} old")]
    StaleFrame(Duration),
}

impl AcquisitionError {
    /// Whether this error tore down the worker and scheduled a restart
    pub fn triggers_restart(&self) -> bool {
        !matches!(self, AcquisitionError::StaleFrame(_))
    }
}

/// Unblocks a sensor read that is in progress on the worker thread
pub type InterruptHandle = Arc<dyn Fn() + Send + Sync>;

/// An open sensor. Owned exclusively by one acquisition worker.
pub trait FrameSensor: Send {
    /// Block until the next frame is available
    fn read_frame(&mut self) -> anyhow::Result<Frame>;

    /// Handle that makes a pending `read_frame` return promptly
    fn interrupt_handle(&self) -> Option<InterruptHandle> {
        None
    }
}

/// Opens the sensor from scratch; called once per worker lifetime
pub trait SensorOpener: Send + Sync {
    fn open(&self) -> anyhow::Result<Box<dyn FrameSensor>>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Frame source timing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSourceSettings {
    pub frame_timeout: Duration,
    pub restart_delay: Duration,
}

/// One acquisition worker lifetime
struct Worker {
    rx: watch::Receiver<Option<Frame>>,
    stop: Arc<AtomicBool>,
    interrupt: Arc<Mutex<Option<InterruptHandle>>>,
    thread: Option<JoinHandle<AcquisitionError>>,
    generation: u64,
}

impl Worker {
    fn spawn(opener: Arc<dyn SensorOpener>, generation: u64) -> std::io::Result<Self> {
        let (tx, rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));
        let interrupt: Arc<Mutex<Option<InterruptHandle>>> = Arc::new(Mutex::new(None));

        let thread_stop = stop.clone();
        let thread_interrupt = interrupt.clone();
        let thread = thread::Builder::new()
            .name(format!("frame-acquisition-{generation}"))
            .spawn(move || acquisition_loop(opener.as_ref(), tx, &thread_stop, &thread_interrupt))?;

        Ok(Self { rx, stop, interrupt, thread: Some(thread), generation })
    }

    /// Signal the thread to stop and unblock any pending read
    fn signal_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(interrupt) = self.interrupt.lock().take() {
            interrupt();
        }
    }

    /// Exit reason of a thread that has finished (or is about to)
    fn exit_reason(&mut self) -> AcquisitionError {
        match self.thread.take().map(|t| t.join()) {
            Some(Ok(reason)) => reason,
            Some(Err(_)) => AcquisitionError::WorkerExited("acquisition thread panicked".to_string()),
            None => AcquisitionError::WorkerExited("acquisition thread already joined".to_string()),
        }
    }
}

/// Body of the acquisition thread. Returns why it stopped.
fn acquisition_loop(
    opener: &dyn SensorOpener,
    tx: watch::Sender<Option<Frame>>,
    stop: &AtomicBool,
    interrupt: &Mutex<Option<InterruptHandle>>,
) -> AcquisitionError {
    let mut sensor = match opener.open() {
        Ok(sensor) => sensor,
        Err(e) => return AcquisitionError::OpenFailed(format!("{e:#}")),
    };
    *interrupt.lock() = sensor.interrupt_handle();

    let mut seq = 0u64;
    loop {
        if stop.load(Ordering::Relaxed) {
            return AcquisitionError::WorkerExited("stop requested".to_string());
        }
        match sensor.read_frame() {
            Ok(mut frame) => {
                frame.seq = seq;
                seq += 1;
                tx.send_replace(Some(frame));
                if tx.is_closed() {
                    return AcquisitionError::WorkerExited("consumer detached".to_string());
                }
            }
            Err(e) => return AcquisitionError::WorkerExited(format!("{e:#}")),
        }
    }
}

/// Resilient supplier of the newest sensor frame
pub struct FrameSource {
    opener: Arc<dyn SensorOpener>,
    settings: FrameSourceSettings,
    worker: Option<Worker>,
    /// Watchdog reference point: last frame delivered, or worker start
    last_delivery: Instant,
    /// Earliest time the next worker may be started
    restart_at: Option<tokio::time::Instant>,
    last_seq: Option<u64>,
    generation: u64,
    restarts: u64,
    superseded: u64,
}

impl FrameSource {
    /// Create a source. The first worker starts on the first `get_frame` call.
    pub fn new(opener: Arc<dyn SensorOpener>, settings: FrameSourceSettings) -> Self {
        info!(
            sensor = %opener.describe(),
            frame_timeout_ms = %settings.frame_timeout.as_millis(),
            restart_delay_ms = %settings.restart_delay.as_millis(),
            "frame_source_created"
        );
        Self {
            opener,
            settings,
            worker: None,
            last_delivery: Instant::now(),
            restart_at: None,
            last_seq: None,
            generation: 0,
            restarts: 0,
            superseded: 0,
        }
    }

    /// Number of teardown/recreate cycles so far
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Frames overwritten in the slot before the control loop read them
    pub fn superseded(&self) -> u64 {
        self.superseded
    }

    /// Wait for the newest frame, at most one frame timeout past the last delivery
    ///
    /// Never returns a frame older than the frame timeout. On a stall, an open
    /// failure, or a worker exit the worker is torn down and an error returned;
    /// the next call starts a new worker once the restart delay has passed.
    pub async fn get_frame(&mut self) -> Result<Frame, AcquisitionError> {
        if self.worker.is_none() {
            self.start_worker().await?;
        }
        let timeout = self.settings.frame_timeout;
        let Some(worker) = self.worker.as_mut() else {
            return Err(AcquisitionError::WorkerExited("no acquisition worker".to_string()));
        };

        let pending = worker.rx.has_changed();
        let received = match pending {
            Ok(true) => Ok(Ok(())),
            Ok(false) => {
                let remaining = timeout.saturating_sub(self.last_delivery.elapsed());
                tokio::time::timeout(remaining, worker.rx.changed()).await
            }
            Err(e) => Ok(Err(e)),
        };

        match received {
            Ok(Ok(())) => {
                let Some(frame) = worker.rx.borrow_and_update().clone() else {
                    return Err(AcquisitionError::WorkerExited("empty frame slot".to_string()));
                };
                let age = frame.captured_at.elapsed();
                if age > timeout {
                    debug!(age_ms = %age.as_millis(), "frame_rejected_stale");
                    return Err(AcquisitionError::StaleFrame(age));
                }
                if let Some(last) = self.last_seq {
                    self.superseded += frame.seq.saturating_sub(last + 1);
                }
                self.last_seq = Some(frame.seq);
                self.last_delivery = Instant::now();
                Ok(frame)
            }
            Ok(Err(_)) => {
                // Sender dropped: the thread returned its exit reason
                let reason = worker.exit_reason();
                warn!(generation = %worker.generation, reason = %reason, "frame_source_worker_exited");
                self.schedule_restart();
                Err(reason)
            }
            Err(_) => {
                let stalled_for = self.last_delivery.elapsed();
                warn!(stalled_ms = %stalled_for.as_millis(), "frame_source_timeout");
                self.schedule_restart();
                Err(AcquisitionError::Timeout(timeout))
            }
        }
    }

    /// Stop the worker and wait a bounded time for its thread to finish
    pub async fn shutdown(&mut self) {
        self.restart_at = None;
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        worker.signal_stop();
        let deadline = Instant::now() + SHUTDOWN_JOIN_TIMEOUT;
        while worker.thread.as_ref().is_some_and(|t| !t.is_finished()) {
            if Instant::now() >= deadline {
                warn!(generation = %worker.generation, "frame_source_shutdown_detached");
                return;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
        let reason = worker.exit_reason();
        info!(generation = %worker.generation, reason = %reason, "frame_source_stopped");
    }

    async fn start_worker(&mut self) -> Result<(), AcquisitionError> {
        if let Some(restart_at) = self.restart_at.take() {
            tokio::time::sleep_until(restart_at).await;
        }
        self.generation += 1;
        let worker = Worker::spawn(self.opener.clone(), self.generation).map_err(|e| {
            // Thread could not be created; retry after the usual delay
            self.schedule_restart_at(tokio::time::Instant::now());
            AcquisitionError::OpenFailed(format!("failed to spawn acquisition thread: {e}"))
        })?;
        info!(generation = %self.generation, "frame_source_worker_started");
        self.worker = Some(worker);
        self.last_delivery = Instant::now();
        self.last_seq = None;
        Ok(())
    }

    /// Tear down the current worker and arm the restart delay
    fn schedule_restart(&mut self) {
        if let Some(worker) = self.worker.take() {
            // A thread stuck in a blocking read is detached; it exits on its next send
            worker.signal_stop();
        }
        self.schedule_restart_at(tokio::time::Instant::now());
    }

    fn schedule_restart_at(&mut self, now: tokio::time::Instant) {
        self.restarts += 1;
        self.restart_at = Some(now + self.settings.restart_delay);
        info!(
            restarts = %self.restarts,
            restart_delay_ms = %self.settings.restart_delay.as_millis(),
            "frame_source_restart"
        );
    }
}
