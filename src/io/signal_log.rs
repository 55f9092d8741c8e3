//! Setup-mode signal recorder - JSONL with daily rotation
//!
//! While `setup_mode` is on, every tick's signals and detector state are
//! appended to `{dir}/{device}-YYYYMMDD.jsonl` so thresholds and regions can
//! be tuned offline against real traces.

use crate::domain::SignalSample;
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One line of the signal log
#[derive(Debug, Serialize)]
struct SignalRecord<'a, D: Serialize> {
    /// Write time (RFC 3339)
    ts_recv: &'a str,
    #[serde(flatten)]
    sample: &'a SignalSample,
    detector: &'a D,
}

struct TrackedWriter {
    writer: BufWriter<File>,
    file_path: PathBuf,
}

/// Appends per-tick signal records, one file per device per UTC day
pub struct SignalRecorder {
    log_dir: PathBuf,
    name_base: String,
    writer: Option<TrackedWriter>,
    current_date: String,
    failed: bool,
}

impl SignalRecorder {
    pub fn new(log_dir: impl AsRef<Path>, device_name: &str) -> Self {
        let log_dir = log_dir.as_ref().to_path_buf();
        info!(log_dir = %log_dir.display(), device = %device_name, "signal_recorder_initialized");
        Self {
            log_dir,
            name_base: sanitize_name(device_name),
            writer: None,
            current_date: Utc::now().format("%Y%m%d").to_string(),
            failed: false,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Append one record. IO errors are logged once per failure streak.
    pub fn record<D: Serialize>(&mut self, sample: &SignalSample, detector: &D) {
        let ts_recv = Utc::now().to_rfc3339();
        let record = SignalRecord { ts_recv: &ts_recv, sample, detector };
        match self.write_record(&record) {
            Ok(()) => self.failed = false,
            Err(e) => {
                if !self.failed {
                    warn!(error = %e, "signal_log_failed");
                }
                self.failed = true;
                self.writer = None;
            }
        }
    }

    fn write_record<T: Serialize>(&mut self, record: &T) -> std::io::Result<()> {
        let json =
            serde_json::to_string(record).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tracked = self.get_writer()?;
        writeln!(tracked.writer, "{}", json)?;
        tracked.writer.flush()
    }

    fn get_writer(&mut self) -> std::io::Result<&mut TrackedWriter> {
        let now_date = Utc::now().format("%Y%m%d").to_string();
        if now_date != self.current_date {
            info!(old_date = %self.current_date, new_date = %now_date, "signal_log_rotated");
            self.writer = None;
            self.current_date = now_date;
        }

        if self.writer.is_none() {
            fs::create_dir_all(&self.log_dir)?;
            let file_path = self.log_dir.join(format!("{}-{}.jsonl", self.name_base, self.current_date));
            let file = OpenOptions::new().create(true).append(true).open(&file_path)?;
            info!(path = %file_path.display(), "signal_log_opened");
            self.writer = Some(TrackedWriter { writer: BufWriter::new(file), file_path });
        }
        match self.writer.as_mut() {
            Some(tracked) => Ok(tracked),
            None => Err(std::io::Error::other("signal log writer unavailable")),
        }
    }

    /// Path of the file currently being written, if any
    pub fn current_file(&self) -> Option<&Path> {
        self.writer.as_ref().map(|t| t.file_path.as_path())
    }
}

/// Keep file names to alphanumerics, '-' and '_'
fn sanitize_name(name: &str) -> String {
    let cleaned: String =
        name.replace('/', "-").chars().filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_').collect();
    if cleaned.is_empty() {
        "signals".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("optical_counter"), "optical_counter");
        assert_eq!(sanitize_name("line/2"), "line-2");
        assert_eq!(sanitize_name("///"), "---");
        assert_eq!(sanitize_name(""), "signals");
    }

    #[test]
    fn test_appends_jsonl_records() {
        let dir = tempdir().unwrap();
        let mut recorder = SignalRecorder::new(dir.path(), "optical_counter");
        let sample = SignalSample::at(1_700_000_000.0, 0.4);
        recorder.record(&sample, &json!({"state": "idle"}));
        recorder.record(&sample, &json!({"state": "cycling"}));

        let path = recorder.current_file().unwrap().to_path_buf();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("optical_counter-"));
        let content = fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["conveyor_velocity"], 0.4);
        assert_eq!(lines[1]["detector"]["state"], "cycling");
        assert!(lines[0]["ts_recv"].is_string());
    }
}
