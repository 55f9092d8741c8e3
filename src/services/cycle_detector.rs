//! Cycle detector - hysteresis state machine over the conveyor signal
//!
//! Turns the per-tick signals into discrete cycle events:
//! - `Idle -> Cycling` when the trailing mean of conveyor velocity rises above
//!   `+hysteresis_threshold`; accumulators reset and the start time is taken
//!   from the sample
//! - while `Cycling`, both intensities are added to saturating accumulators
//! - `Cycling -> Idle` when the trailing mean falls below `-hysteresis_threshold`;
//!   exactly one `CycleEvent` is emitted
//!
//! All times are the samples' wall-clock timestamps. A clock regression only
//! omits the affected duration; nothing here divides by a time difference.
//!
//! State is in memory only. A restart mid-cycle starts over in `Idle` and the
//! partial cycle is lost. The part_1 cooldown is anchored at the first sample,
//! so part_2 stays suppressed for one cooldown after every start.

use crate::domain::cycle::cycle_id;
use crate::domain::{CycleEvent, RollingWindow, SignalSample};
use crate::infra::config::DetectorSettings;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorState {
    Idle,
    Cycling,
}

/// Detector internals for setup-mode traces
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectorSnapshot {
    pub state: DetectorState,
    pub moving_average: f64,
    pub accumulated_1: f64,
    pub accumulated_2: f64,
    pub box_sum: f64,
    pub box_present: bool,
}

pub struct CycleDetector {
    settings: DetectorSettings,
    state: DetectorState,
    velocity: RollingWindow,
    box_indicator: RollingWindow,
    accumulated_1: f64,
    accumulated_2: f64,
    /// Box evidence seen since the current cycle started
    box_latched: bool,
    cycle_start: f64,
    previous_cycle_start: Option<f64>,
    /// End of the last part_1 cycle; seeded with the first sample's time
    last_part_1_time: Option<f64>,
}

/// Add `value` to `acc`, keeping the result within [0, ceiling]. Non-finite input is ignored.
#[inline]
fn saturating_accumulate(acc: f64, value: f64, ceiling: f64) -> f64 {
    if !value.is_finite() {
        return acc;
    }
    (acc + value).clamp(0.0, ceiling)
}

impl CycleDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            velocity: RollingWindow::new(settings.smoothing_window),
            box_indicator: RollingWindow::new(settings.box_window),
            settings: settings.clone(),
            state: DetectorState::Idle,
            accumulated_1: 0.0,
            accumulated_2: 0.0,
            box_latched: false,
            cycle_start: 0.0,
            previous_cycle_start: None,
            last_part_1_time: None,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn snapshot(&self) -> DetectorSnapshot {
        DetectorSnapshot {
            state: self.state,
            moving_average: self.velocity.mean(),
            accumulated_1: self.accumulated_1,
            accumulated_2: self.accumulated_2,
            box_sum: self.box_indicator.sum(),
            box_present: self.box_latched,
        }
    }

    /// Adopt reloaded thresholds. Changed window sizes rebuild (and clear) their windows.
    pub fn apply_settings(&mut self, settings: &DetectorSettings) {
        if *settings == self.settings {
            return;
        }
        if settings.smoothing_window != self.velocity.capacity() {
            self.velocity = RollingWindow::new(settings.smoothing_window);
            info!(smoothing_window = %settings.smoothing_window, "detector_velocity_window_resized");
        }
        if settings.box_window != self.box_indicator.capacity() {
            self.box_indicator = RollingWindow::new(settings.box_window);
            info!(box_window = %settings.box_window, "detector_box_window_resized");
        }
        self.settings = settings.clone();
    }

    /// Consume one tick's sample; returns the event when a cycle closes
    pub fn update(&mut self, sample: &SignalSample) -> Option<CycleEvent> {
        if self.last_part_1_time.is_none() && sample.timestamp.is_finite() {
            self.last_part_1_time = Some(sample.timestamp);
        }
        let ceiling = self.settings.ceiling;
        if self.state == DetectorState::Cycling {
            self.accumulated_1 = saturating_accumulate(self.accumulated_1, sample.intensity_1, ceiling);
            self.accumulated_2 = saturating_accumulate(self.accumulated_2, sample.intensity_2, ceiling);
        }

        self.velocity.push(sample.conveyor_velocity);
        self.box_indicator.push(sample.velocity_x);
        let box_now = self.box_indicator.sum() > self.settings.box_threshold;
        let moving_average = self.velocity.mean();
        let threshold = self.settings.hysteresis_threshold;

        match self.state {
            DetectorState::Idle => {
                if moving_average > threshold {
                    self.state = DetectorState::Cycling;
                    self.cycle_start = sample.timestamp;
                    self.accumulated_1 = 0.0;
                    self.accumulated_2 = 0.0;
                    self.box_latched = box_now;
                    debug!(start = %sample.timestamp, moving_average = %moving_average, "cycle_started");
                }
                None
            }
            DetectorState::Cycling => {
                self.box_latched |= box_now;
                if moving_average < -threshold {
                    self.state = DetectorState::Idle;
                    self.finish_cycle(sample.timestamp)
                } else {
                    None
                }
            }
        }
    }

    fn finish_cycle(&mut self, now: f64) -> Option<CycleEvent> {
        let start = self.cycle_start;
        let duration = now - start;
        let cycle_length = (duration.is_finite() && duration >= 0.0).then_some(duration);

        let threshold = self.settings.classification_threshold;
        let part_1 = self.accumulated_1 > threshold;
        let cooldown_elapsed = match self.last_part_1_time {
            None => true,
            Some(last) => {
                let since = now - last;
                since.is_finite() && since >= self.settings.cooldown_seconds
            }
        };
        let part_2 = self.accumulated_2 > threshold && !part_1 && cooldown_elapsed;
        if part_1 {
            self.last_part_1_time = Some(now);
        }

        let inter_cycle_time = self.previous_cycle_start.filter(|prev| *prev < start).map(|prev| start - prev);
        self.previous_cycle_start = Some(start);

        let box_present = self.box_latched;
        self.accumulated_1 = 0.0;
        self.accumulated_2 = 0.0;
        self.box_latched = false;

        if cycle_length.is_none() {
            warn!(start = %start, end = %now, "cycle_clock_regression");
        }
        let Some(id) = cycle_id(start) else {
            warn!(start = %start, "cycle_dropped_invalid_start");
            return None;
        };

        Some(CycleEvent { id, start_ts: start, cycle_length, part_1, part_2, box_present, inter_cycle_time })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DetectorSettings {
        DetectorSettings::default()
    }

    fn sample(ts: f64, velocity: f64) -> SignalSample {
        SignalSample::at(ts, velocity)
    }

    fn with_intensity(ts: f64, velocity: f64, i1: f64, i2: f64) -> SignalSample {
        SignalSample { intensity_1: i1, intensity_2: i2, ..SignalSample::at(ts, velocity) }
    }

    /// Drive one full cycle: 5 positive ticks in, `body` ticks, 5 negative ticks out
    fn run_cycle(det: &mut CycleDetector, start: f64, i1: f64, i2: f64) -> CycleEvent {
        let mut ts = start;
        for _ in 0..5 {
            assert!(det.update(&sample(ts, 0.3)).is_none());
            ts += 0.1;
        }
        assert_eq!(det.state(), DetectorState::Cycling);
        for _ in 0..4 {
            assert!(det.update(&with_intensity(ts, -0.3, i1, i2)).is_none());
            ts += 0.1;
        }
        det.update(&with_intensity(ts, -0.3, i1, i2)).expect("cycle should close")
    }

    #[test]
    fn test_scenario_a_transition_timing() {
        let mut det = CycleDetector::new(&settings());
        let velocities = [0.0, 0.0, 0.0, 0.0, 0.0, 0.3, 0.3, 0.3, 0.3, 0.3];
        let mut entered_at = None;
        for (i, v) in velocities.iter().enumerate() {
            assert!(det.update(&sample(1000.0 + i as f64, *v)).is_none());
            if entered_at.is_none() && det.state() == DetectorState::Cycling {
                entered_at = Some(i);
            }
        }
        // Mean first exceeds 0.25 once the window holds five 0.3 samples
        assert_eq!(entered_at, Some(9));

        let mut events = Vec::new();
        for i in 0..5 {
            if let Some(event) = det.update(&sample(1010.0 + i as f64, -0.3)) {
                events.push((i, event));
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 4);
        let event = &events[0].1;
        assert_eq!(event.id, 1009);
        assert_eq!(event.start_ts, 1009.0);
        assert_eq!(event.cycle_length, Some(5.0));
        assert_eq!(event.inter_cycle_time, None);
        assert_eq!(det.state(), DetectorState::Idle);
    }

    #[test]
    fn test_scenario_b_part_1_classification() {
        let mut det = CycleDetector::new(&settings());
        // 5 ticks of intensity_1 = 3 while cycling: 15 > 10
        let event = run_cycle(&mut det, 2000.0, 3.0, 0.0);
        assert!(event.part_1);
        assert!(!event.part_2);
    }

    #[test]
    fn test_entry_tick_intensity_not_counted() {
        let mut det = CycleDetector::new(&settings());
        for i in 0..4 {
            det.update(&sample(i as f64, 0.3));
        }
        // Entry tick carries a huge reading; only the 5 exit ticks (2 each) count
        det.update(&with_intensity(4.0, 0.3, 500.0, 0.0));
        assert_eq!(det.state(), DetectorState::Cycling);
        let mut event = None;
        for i in 0..5 {
            event = det.update(&with_intensity(5.0 + i as f64, -0.3, 2.0, 0.0));
        }
        assert!(!event.unwrap().part_1);
    }

    #[test]
    fn test_accumulators_saturate_at_ceiling() {
        let mut det = CycleDetector::new(&DetectorSettings { ceiling: 300.0, ..settings() });
        for i in 0..5 {
            det.update(&sample(i as f64, 1.0));
        }
        for i in 0..10_000 {
            det.update(&with_intensity(5.0 + i as f64, 1.0, 1e12, f64::MAX));
            let snap = det.snapshot();
            assert!(snap.accumulated_1 <= 300.0);
            assert!(snap.accumulated_2 <= 300.0);
        }
        assert_eq!(det.snapshot().accumulated_1, 300.0);
    }

    #[test]
    fn test_non_finite_inputs_are_ignored() {
        let mut det = CycleDetector::new(&settings());
        for i in 0..5 {
            det.update(&sample(i as f64, 0.3));
        }
        det.update(&with_intensity(5.0, f64::NAN, f64::NAN, f64::INFINITY));
        let snap = det.snapshot();
        assert_eq!(snap.accumulated_1, 0.0);
        assert_eq!(snap.accumulated_2, 0.0);
        assert!(snap.moving_average.is_finite());
    }

    #[test]
    fn test_parts_are_mutually_exclusive() {
        let mut det = CycleDetector::new(&settings());
        let event = run_cycle(&mut det, 3000.0, 50.0, 50.0);
        assert!(event.part_1);
        assert!(!event.part_2);
    }

    #[test]
    fn test_part_2_suppressed_for_one_cooldown_after_start() {
        let mut det = CycleDetector::new(&DetectorSettings { cooldown_seconds: 300.0, ..settings() });
        // First sample anchors the cooldown, as if a part_1 had just closed
        assert!(det.update(&sample(3000.0, 0.0)).is_none());
        let early = run_cycle(&mut det, 3100.0, 0.0, 50.0);
        assert!(!early.part_1);
        assert!(!early.part_2);

        let later = run_cycle(&mut det, 3400.0, 0.0, 50.0);
        assert!(later.part_2);
    }

    #[test]
    fn test_part_2_without_cooldown() {
        let mut det = CycleDetector::new(&DetectorSettings { cooldown_seconds: 0.0, ..settings() });
        let event = run_cycle(&mut det, 3000.0, 0.0, 50.0);
        assert!(!event.part_1);
        assert!(event.part_2);
    }

    #[test]
    fn test_part_2_suppressed_within_cooldown() {
        let mut det = CycleDetector::new(&DetectorSettings { cooldown_seconds: 300.0, ..settings() });
        let first = run_cycle(&mut det, 10_000.0, 50.0, 0.0);
        assert!(first.part_1);

        // Ends ~100 s after the part_1 cycle ended
        let second = run_cycle(&mut det, 10_100.0, 0.0, 50.0);
        assert!(!second.part_1);
        assert!(!second.part_2);

        // Ends well past the cooldown
        let third = run_cycle(&mut det, 10_400.0, 0.0, 50.0);
        assert!(third.part_2);
    }

    #[test]
    fn test_inter_cycle_time_between_starts() {
        let mut det = CycleDetector::new(&settings());
        let first = run_cycle(&mut det, 500.0, 0.0, 0.0);
        assert_eq!(first.inter_cycle_time, None);
        let second = run_cycle(&mut det, 560.0, 0.0, 0.0);
        let inter = second.inter_cycle_time.unwrap();
        assert!((inter - 60.0).abs() < 1e-9);
        assert_eq!(second.id, 560);
    }

    #[test]
    fn test_clock_regression_omits_durations() {
        let mut det = CycleDetector::new(&settings());
        run_cycle(&mut det, 5000.0, 0.0, 0.0);

        // Next cycle starts before the previous one and ends before it starts
        for i in 0..5 {
            det.update(&sample(4000.0 + i as f64 * 0.1, 0.3));
        }
        let mut event = None;
        for i in 0..5 {
            event = det.update(&sample(3000.0 + i as f64, -0.3));
        }
        let event = event.unwrap();
        assert_eq!(event.cycle_length, None);
        assert_eq!(event.inter_cycle_time, None);
    }

    #[test]
    fn test_no_event_without_round_trip() {
        let mut det = CycleDetector::new(&settings());
        for i in 0..50 {
            assert!(det.update(&sample(i as f64, -1.0)).is_none());
        }
        assert_eq!(det.state(), DetectorState::Idle);
    }

    #[test]
    fn test_hovering_between_thresholds_does_not_chatter() {
        let mut det = CycleDetector::new(&settings());
        for i in 0..5 {
            det.update(&sample(i as f64, 0.3));
        }
        for i in 0..100 {
            let v = if i % 2 == 0 { 0.2 } else { -0.2 };
            assert!(det.update(&sample(5.0 + i as f64, v)).is_none());
        }
        assert_eq!(det.state(), DetectorState::Cycling);
    }

    #[test]
    fn test_box_evidence_latches_for_the_cycle() {
        let mut det = CycleDetector::new(&settings());
        // Strong box signal right at the start of the cycle
        for i in 0..5 {
            det.update(&SignalSample { velocity_x: 5.0, ..sample(i as f64, 0.3) });
        }
        // Long quiet stretch flushes the 30-tick box window
        for i in 0..60 {
            det.update(&sample(5.0 + i as f64, 0.0));
        }
        assert_eq!(det.snapshot().box_sum, 0.0);
        let mut event = None;
        for i in 0..5 {
            event = det.update(&sample(70.0 + i as f64, -0.3));
        }
        assert!(event.unwrap().box_present);

        let quiet = run_cycle(&mut det, 200.0, 0.0, 0.0);
        assert!(!quiet.box_present);
    }

    #[test]
    fn test_window_resize_on_settings_change() {
        let mut det = CycleDetector::new(&settings());
        for i in 0..4 {
            det.update(&sample(i as f64, 0.3));
        }
        det.apply_settings(&DetectorSettings { smoothing_window: 2, ..settings() });
        det.update(&sample(4.0, 0.3));
        assert_eq!(det.state(), DetectorState::Idle);
        det.update(&sample(5.0, 0.3));
        assert_eq!(det.state(), DetectorState::Cycling);
    }
}
