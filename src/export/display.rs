use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::element::Export;
use crate::error::ConfigError;
use crate::frame::Frame;
use crate::graph::NodeContext;

use super::{overlay, RateLimiter};

const JPEG_QUALITY: u8 = 85;

/// Keeps the latest annotated frame on disk for a local viewer.
pub struct DisplayExport {
    node: String,
    path: PathBuf,
    limiter: RateLimiter,
    written: u64,
}

impl DisplayExport {
    pub fn new(node: &str, path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            node: node.to_string(),
            path: path.into(),
            limiter: RateLimiter::new(interval),
            written: 0,
        }
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let params = ctx.params();
        let path = params
            .string("path")
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConfigError::InvalidParameter {
                node: ctx.id().to_string(),
                key: "path".to_string(),
                reason: "display path is required".to_string(),
            })?;
        let interval_ms = params.u64_or("interval_ms", 200)?;
        Ok(Self::new(ctx.id(), path, Duration::from_millis(interval_ms)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn write(&self, frame: &Frame) -> Result<()> {
        let canvas = overlay::annotate(&frame.image, &frame.insights.objects)?;
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
            .encode_image(&canvas)
            .context("encode display frame")?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create display directory {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

impl Export for DisplayExport {
    fn process(&mut self, frame: Frame) -> Result<()> {
        if !self.limiter.allow() {
            return Ok(());
        }
        match self.write(&frame) {
            Ok(()) => self.written += 1,
            Err(err) => log::debug!("{}: display write failed: {:#}", self.node, err),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Bbox, Image, ObjectMeta};

    #[test]
    fn writes_latest_frame_as_jpeg() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("view").join("latest.jpg");
        let mut display = DisplayExport::new("show", &target, Duration::ZERO);
        let mut frame = Frame::new(Image::synthetic(16, 16, 1), 0);
        frame
            .insights
            .objects
            .push(ObjectMeta::new("person", 0.9, Bbox::new(0.1, 0.1, 0.5, 0.5)));
        display.process(frame).expect("process");

        let bytes = std::fs::read(&target).expect("read");
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert!(!target.with_extension("tmp").exists());
        assert_eq!(display.written(), 1);
    }

    #[test]
    fn write_errors_are_swallowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory where the file should be makes the rename fail.
        let target = dir.path().join("occupied");
        std::fs::create_dir_all(target.join("child")).expect("mkdir");
        let mut display = DisplayExport::new("show", &target, Duration::ZERO);
        assert!(display
            .process(Frame::new(Image::synthetic(4, 4, 0), 0))
            .is_ok());
        assert_eq!(display.written(), 0);
    }
}
