//! Deterministic synthetic source.

use anyhow::Result;
use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::cascade::Identity;
use crate::element::Source;
use crate::error::ConfigError;
use crate::frame::{Bbox, Frame, Image, ObjectMeta};
use crate::graph::NodeContext;

/// Top-left corner of the synthetic object.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct Corner {
    pub l: f64,
    pub t: f64,
}

/// One object moved linearly from `start` to `end` over the run.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SyntheticObject {
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    pub start: Corner,
    pub end: Corner,
    pub w: f64,
    pub h: f64,
}

fn default_label() -> String {
    "person".to_string()
}

fn default_confidence() -> f64 {
    0.9
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    /// 0 means unbounded.
    pub frames: u64,
    /// 0 means as fast as the pipeline accepts.
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub object: Option<SyntheticObject>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            frames: 100,
            fps: 0.0,
            width: 64,
            height: 48,
            object: None,
        }
    }
}

/// Frames over which an unbounded source repeats its object path.
const UNBOUNDED_PERIOD: u64 = 100;

pub struct SyntheticSource {
    config: SyntheticConfig,
    identity: Identity,
    next_id: u64,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig, identity: Identity) -> Self {
        Self {
            config,
            identity,
            next_id: 0,
            next_due: None,
        }
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let params = ctx.params();
        let defaults = SyntheticConfig::default();
        let fps = params.f64_or("fps", defaults.fps)?;
        if fps < 0.0 {
            return Err(ConfigError::InvalidParameter {
                node: ctx.id().to_string(),
                key: "fps".to_string(),
                reason: "must not be negative".to_string(),
            }
            .into());
        }
        let config = SyntheticConfig {
            frames: params.u64_or("frames", defaults.frames)?,
            fps,
            width: params.u32_or("width", defaults.width)?.max(1),
            height: params.u32_or("height", defaults.height)?.max(1),
            object: params.object("object")?,
        };
        Ok(Self::new(config, ctx.identity.clone()))
    }

    fn object_at(&self, frame_id: u64) -> Option<ObjectMeta> {
        let object = self.config.object.as_ref()?;
        let period = if self.config.frames > 1 {
            self.config.frames
        } else {
            UNBOUNDED_PERIOD
        };
        let progress = (frame_id % period) as f64 / (period - 1) as f64;
        let l = object.start.l + (object.end.l - object.start.l) * progress;
        let t = object.start.t + (object.end.t - object.start.t) * progress;
        Some(ObjectMeta::new(
            object.label.clone(),
            object.confidence,
            Bbox::new(l, t, object.w, object.h),
        ))
    }

    fn pace(&mut self) {
        if self.config.fps <= 0.0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.config.fps);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + interval);
    }
}

impl Source for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.config.frames > 0 && self.next_id >= self.config.frames {
            return Ok(None);
        }
        self.pace();
        let frame_id = self.next_id;
        self.next_id += 1;

        let image = Image::synthetic(self.config.width, self.config.height, frame_id);
        let mut frame = Frame::new(image, frame_id);
        super::stamp(&mut frame, &self.identity);
        if let Some(object) = self.object_at(frame_id) {
            frame.insights.objects.push(object);
        }
        Ok(Some(frame))
    }
}
