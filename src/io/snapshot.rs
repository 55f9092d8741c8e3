//! Per-cycle JPEG snapshot of the frame that closed the cycle
//!
//! Written as `{dir}/{id}.jpg`. The file is encoded to a temporary name and
//! renamed into place so readers never see a partial image.

use crate::domain::Frame;
use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    /// `None` when the directory setting is empty (snapshots disabled)
    pub fn from_setting(dir: &str) -> Option<Self> {
        if dir.trim().is_empty() {
            None
        } else {
            Some(Self { dir: PathBuf::from(dir) })
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Encode `frame` and store it under the cycle id
    pub fn save(&self, frame: &Frame, id: i64) -> Result<PathBuf> {
        if !frame.is_well_formed() {
            return Err(anyhow!("frame buffer does not match {}x{}", frame.width, frame.height));
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create snapshot directory {}", self.dir.display()))?;

        let rgb: Vec<u8> = frame.data.chunks_exact(3).flat_map(|bgr| [bgr[2], bgr[1], bgr[0]]).collect();
        let image = RgbImage::from_raw(frame.width, frame.height, rgb)
            .ok_or_else(|| anyhow!("frame buffer too small for {}x{}", frame.width, frame.height))?;

        let path = self.dir.join(format!("{id}.jpg"));
        let tmp = self.dir.join(format!(".{id}.jpg.tmp"));
        {
            let file = fs::File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
                .encode_image(&image)
                .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
        }
        fs::rename(&tmp, &path).with_context(|| format!("failed to move snapshot into {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_disabled_when_empty() {
        assert!(SnapshotWriter::from_setting("").is_none());
        assert!(SnapshotWriter::from_setting("images").is_some());
    }

    #[test]
    fn test_writes_jpeg_named_by_id() {
        let dir = tempdir().unwrap();
        let writer = SnapshotWriter::from_setting(dir.path().join("images").to_str().unwrap()).unwrap();
        let frame = Frame::new(vec![128u8; 16 * 8 * 3], 16, 8, 0.0);

        let path = writer.save(&frame, 1_700_000_000).unwrap();
        assert_eq!(path.file_name().unwrap(), "1700000000.jpg");
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_rejects_malformed_frame() {
        let dir = tempdir().unwrap();
        let writer = SnapshotWriter::from_setting(dir.path().to_str().unwrap()).unwrap();
        let frame = Frame::new(vec![0u8; 10], 16, 8, 0.0);
        assert!(writer.save(&frame, 1).is_err());
    }
}
