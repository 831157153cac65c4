//! RTSP frame source.
//!
//! `RtspSource` pulls decoded frames from an IP camera stream.
//!
//! Responsible for:
//! - Connecting to camera streams, lazily on the first read
//! - Decoding video frames to packed RGB
//! - Decimating to the configured fps upper bound
//! - Rebuilding the capture after repeated read failures
//!
//! MUST NOT:
//! - Block forever on a stalled stream; reads time out and surface as errors

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use crate::cascade::Identity;
use crate::element::Source;
use crate::error::ConfigError;
#[cfg(feature = "rtsp-gstreamer")]
use crate::frame::ColorFormat;
use crate::frame::{Frame, Image};
use crate::graph::NodeContext;

/// Consecutive failed reads tolerated before the capture pipeline is rebuilt.
const MAX_FAILED_READS: u32 = 10;
const FPS_REPORT_EVERY: Duration = Duration::from_secs(5);
/// Native rate of the `stub://` camera.
const STUB_CAMERA_FPS: f64 = 30.0;

/// Camera endpoint and output shape.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// `rtsp://host:port/path`, or `stub://name` for generated pixels.
    pub url: String,
    /// Upper bound on emitted frames per second.
    pub target_fps: f64,
    /// Width of `stub://` frames.
    pub width: u32,
    /// Height of `stub://` frames.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            target_fps: 30.0,
            width: 640,
            height: 480,
        }
    }
}

/// Moving average of the accepted frame interval, 7/8 old plus 1/8 new.
#[derive(Clone, Debug)]
struct FpsMeter {
    interval: f64,
    last_accept: Option<Instant>,
    last_report: Option<Instant>,
}

impl FpsMeter {
    fn new(target_fps: f64) -> Self {
        Self {
            interval: 1.0 / target_fps,
            last_accept: None,
            last_report: None,
        }
    }

    /// Whether a frame read at `now` passes the upper bound. Updates the average when it does.
    fn accept(&mut self, now: Instant, min_interval: f64) -> bool {
        let Some(last) = self.last_accept else {
            self.last_accept = Some(now);
            return true;
        };
        let elapsed = now.duration_since(last).as_secs_f64();
        if elapsed <= min_interval {
            return false;
        }
        self.interval = self.interval * 7.0 / 8.0 + elapsed / 8.0;
        self.last_accept = Some(now);
        true
    }

    fn fps(&self) -> f64 {
        1.0 / self.interval
    }

    fn due_report(&mut self, now: Instant) -> bool {
        match self.last_report {
            Some(last) if now.duration_since(last) < FPS_REPORT_EVERY => false,
            _ => {
                self.last_report = Some(now);
                true
            }
        }
    }
}

/// Opens its backend on the first read and reopens it after a run of failures.
pub struct RtspSource {
    config: RtspConfig,
    identity: Identity,
    node: String,
    backend: Option<RtspBackend>,
    failed_reads: u32,
    frame_id: u64,
    meter: FpsMeter,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspBackend {
    fn open(config: &RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            return Ok(RtspBackend::Synthetic(SyntheticRtspSource::new(config.clone())));
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            let mut source = GstreamerRtspSource::new(config.clone())?;
            source.connect()?;
            Ok(RtspBackend::Gstreamer(source))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(anyhow!("RTSP requires the rtsp-gstreamer feature"))
        }
    }

    fn read(&mut self) -> Result<Image> {
        match self {
            RtspBackend::Synthetic(source) => source.read(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.read(),
        }
    }

    fn close(&mut self) {
        match self {
            RtspBackend::Synthetic(_) => {}
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.close(),
        }
    }
}

impl RtspSource {
    pub fn new(config: RtspConfig, identity: Identity, node: &str) -> Result<Self> {
        if config.target_fps <= 0.0 || !config.target_fps.is_finite() {
            return Err(anyhow!("fps upper bound must be positive, got {}", config.target_fps));
        }
        if !config.url.starts_with("stub://") && !cfg!(feature = "rtsp-gstreamer") {
            return Err(anyhow!(
                "{} needs the rtsp-gstreamer feature; only stub:// URLs are built in",
                config.url
            ));
        }
        let meter = FpsMeter::new(config.target_fps);
        Ok(Self {
            config,
            identity,
            node: node.to_string(),
            backend: None,
            failed_reads: 0,
            frame_id: 0,
            meter,
        })
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let params = ctx.params();
        let defaults = RtspConfig::default();
        let url = params
            .string("url")
            .or_else(|| params.string("ip"))
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigError::InvalidParameter {
                node: ctx.id().to_string(),
                key: "url".to_string(),
                reason: "an RTSP url is required".to_string(),
            })?;
        let config = RtspConfig {
            url,
            target_fps: params.f64_or("fps", defaults.target_fps)?,
            width: params.u32_or("width", defaults.width)?.max(1),
            height: params.u32_or("height", defaults.height)?.max(1),
        };
        Self::new(config, ctx.identity.clone(), ctx.id()).map_err(|err| {
            ConfigError::InvalidParameter {
                node: ctx.id().to_string(),
                key: "url".to_string(),
                reason: err.to_string(),
            }
            .into()
        })
    }

    fn read_one(&mut self) -> Result<Image> {
        if self.backend.is_none() {
            self.backend = Some(RtspBackend::open(&self.config)?);
            log::info!("{}: connected to {}", self.node, self.config.url);
        }
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| anyhow!("capture not open"))?;
        backend.read()
    }

    fn note_failure(&mut self) {
        self.failed_reads += 1;
        if self.failed_reads > MAX_FAILED_READS {
            log::warn!(
                "{}: {} consecutive read failures; rebuilding capture for {}",
                self.node,
                self.failed_reads,
                self.config.url
            );
            if let Some(mut backend) = self.backend.take() {
                backend.close();
            }
            self.failed_reads = 0;
        }
    }
}

impl Source for RtspSource {
    /// Reads until a frame passes the fps upper bound. Read failures are
    /// returned to the element loop, which backs off before calling again.
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let min_interval = 1.0 / self.config.target_fps;
        loop {
            let image = match self.read_one() {
                Ok(image) => image,
                Err(err) => {
                    self.note_failure();
                    return Err(err);
                }
            };
            self.failed_reads = 0;
            let now = Instant::now();
            if !self.meter.accept(now, min_interval) {
                continue;
            }
            if self.meter.due_report(now) {
                log::info!("{}: {:.1} fps from {}", self.node, self.meter.fps(), self.config.url);
            }
            let mut frame = Frame::new(image, self.frame_id);
            self.frame_id += 1;
            super::stamp(&mut frame, &self.identity);
            return Ok(Some(frame));
        }
    }

    fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
    }
}

// stub:// backend

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
    next_due: Instant,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            next_due: Instant::now(),
        }
    }

    /// Paces itself like a camera running at `STUB_CAMERA_FPS`.
    fn read(&mut self) -> Result<Image> {
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = self.next_due.max(now) + Duration::from_secs_f64(1.0 / STUB_CAMERA_FPS);
        self.frame_count += 1;
        Ok(Image::synthetic(self.config.width, self.config.height, self.frame_count))
    }
}

// gstreamer backend

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Build `rtspsrc ! decodebin ! videoconvert ! appsink` with RGB caps.
    fn new(config: RtspConfig) -> Result<Self> {
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        use gstreamer::prelude::*;

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        Ok(())
    }

    fn read(&mut self) -> Result<Image> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            return Err(anyhow!(err));
        }

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(self.frame_timeout_ms()))
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Image::new(pixels, width, height, ColorFormat::Rgb)
    }

    fn close(&mut self) {
        use gstreamer::prelude::*;

        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }

    fn frame_timeout_ms(&self) -> u64 {
        let base_ms = (4000.0 / self.config.target_fps) as u64;
        base_ms.max(500)
    }

    fn poll_bus(&mut self) {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("short RTSP buffer")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
