//! Camera sensor backed by an ffmpeg subprocess
//!
//! ffmpeg decodes the stream, scales it to the configured size and writes raw
//! BGR24 frames to stdout. Each worker lifetime spawns its own process, and the
//! process is killed when the sensor is dropped or interrupted.

use crate::domain::{epoch_secs, Frame};
use crate::io::frame_source::{FrameSensor, InterruptHandle, SensorOpener};
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info};

/// Opens an ffmpeg reader for one source URL
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    url: String,
    width: u32,
    height: u32,
}

impl FfmpegOpener {
    pub fn new(url: impl Into<String>, width: u32, height: u32) -> Self {
        Self { url: url.into(), width, height }
    }
}

impl SensorOpener for FfmpegOpener {
    fn open(&self) -> Result<Box<dyn FrameSensor>> {
        if self.url.trim().is_empty() {
            bail!("camera.url is not configured");
        }
        let mut cmd = Command::new("ffmpeg");
        cmd.args(ffmpeg_args(&self.url, self.width, self.height))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().context("failed to spawn ffmpeg")?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("failed to capture ffmpeg stdout"));
            }
        };
        info!(pid = %child.id(), width = %self.width, height = %self.height, "ffmpeg_started");

        Ok(Box::new(FfmpegSensor {
            stdout,
            child: Arc::new(Mutex::new(child)),
            width: self.width,
            height: self.height,
        }))
    }

    fn describe(&self) -> String {
        format!("ffmpeg:{}", redact_credentials(&self.url))
    }
}

/// Command line for a low-latency raw BGR24 reader
fn ffmpeg_args(url: &str, width: u32, height: u32) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"].iter().map(|s| s.to_string()).collect();

    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        args.extend(
            ["-rtsp_transport", "tcp", "-fflags", "nobuffer", "-flags", "low_delay"]
                .iter()
                .map(|s| s.to_string()),
        );
    } else if url.starts_with("/dev/video") {
        args.extend(["-f", "video4linux2"].iter().map(|s| s.to_string()));
    }

    let scale = format!("scale={width}:{height}");
    args.push("-i".to_string());
    args.push(url.to_string());
    args.extend(
        ["-an", "-vf", scale.as_str(), "-pix_fmt", "bgr24", "-f", "rawvideo", "-"].iter().map(|s| s.to_string()),
    );
    args
}

/// Strip `user:password@` from a URL before logging it
pub fn redact_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// A running ffmpeg reader
pub struct FfmpegSensor {
    stdout: ChildStdout,
    child: Arc<Mutex<Child>>,
    width: u32,
    height: u32,
}

impl FrameSensor for FfmpegSensor {
    fn read_frame(&mut self) -> Result<Frame> {
        let mut data = vec![0u8; Frame::expected_len(self.width, self.height)];
        self.stdout.read_exact(&mut data).context("ffmpeg stream ended")?;
        Ok(Frame::new(data, self.width, self.height, epoch_secs()))
    }

    fn interrupt_handle(&self) -> Option<InterruptHandle> {
        let child = self.child.clone();
        Some(Arc::new(move || {
            let _ = child.lock().kill();
        }))
    }
}

impl Drop for FfmpegSensor {
    fn drop(&mut self) {
        let mut child = self.child.lock();
        let _ = child.kill();
        let status = child.wait();
        debug!(status = ?status.ok(), "ffmpeg_stopped");
    }
}
