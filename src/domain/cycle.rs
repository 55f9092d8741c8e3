//! Cycle event data model - one full conveyor pass

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch seconds (fractional)
#[inline]
pub fn epoch_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Derive a cycle id from its start time (whole epoch seconds)
///
/// Returns None for non-finite or out-of-range timestamps.
pub fn cycle_id(start_ts: f64) -> Option<i64> {
    if !start_ts.is_finite() || start_ts < i64::MIN as f64 || start_ts > i64::MAX as f64 {
        return None;
    }
    Some(start_ts.floor() as i64)
}

/// A completed cycle, emitted once per Cycling -> Idle transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleEvent {
    /// Whole epoch seconds of `start_ts`; primary key in the event table
    pub id: i64,
    /// Cycle start (epoch seconds)
    #[serde(rename = "timestamp")]
    pub start_ts: f64,
    /// Seconds from start to end; omitted if the clock went backwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_length: Option<f64>,
    pub part_1: bool,
    pub part_2: bool,
    pub box_present: bool,
    /// Seconds since the previous cycle start; omitted for the first cycle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inter_cycle_time: Option<f64>,
}

impl CycleEvent {
    /// Human readable product classification for logs
    pub fn part_label(&self) -> &'static str {
        match (self.part_1, self.part_2) {
            (true, _) => "part_1",
            (false, true) => "part_2",
            (false, false) => "none",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_id_floors_seconds() {
        assert_eq!(cycle_id(1_767_630_090.999), Some(1_767_630_090));
        assert_eq!(cycle_id(0.5), Some(0));
        assert_eq!(cycle_id(f64::NAN), None);
        assert_eq!(cycle_id(f64::INFINITY), None);
    }

    #[test]
    fn test_serialize_omits_undefined_durations() {
        let event = CycleEvent {
            id: 100,
            start_ts: 100.25,
            cycle_length: None,
            part_1: true,
            part_2: false,
            box_present: false,
            inter_cycle_time: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["timestamp"], 100.25);
        assert!(json.get("cycle_length").is_none());
        assert!(json.get("inter_cycle_time").is_none());
        assert_eq!(event.part_label(), "part_1");
    }
}
