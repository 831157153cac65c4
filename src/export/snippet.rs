//! Video snippet recorder.
//!
//! State machine: `Waiting -> Recording -> Exporting -> Waiting`.
//!
//! - Waiting: once the cooldown since the last recording start has passed, the
//!   first frame with a detection starts a recording and is its first frame.
//! - Recording: frames are buffered until `recording_duration` has elapsed. The
//!   frame that finds the duration elapsed moves the state to Exporting and is
//!   not recorded.
//! - Exporting: encode and upload run on a detached thread; frames are ignored
//!   until that thread puts the state back to Waiting, which it always does.

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::cascade::Identity;
use crate::element::Export;
use crate::frame::{Frame, Image};
use crate::graph::NodeContext;

use super::encode::{default_encoder, MjpegEncoder, SnippetEncoder};
use super::{overlay, seconds_param, BlobStore};

/// 2100-01-01T00:00:00Z. Snippet ids count down from here so newer sorts first.
const ID_EPOCH_SECS: f64 = 4_102_416_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SnippetState {
    Waiting = 0,
    Recording = 1,
    Exporting = 2,
}

impl SnippetState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SnippetState::Recording,
            2 => SnippetState::Exporting,
            _ => SnippetState::Waiting,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnippetSettings {
    pub filename_prefix: String,
    pub recording_duration: Duration,
    /// Minimum time between two recording starts.
    pub cooldown: Duration,
    pub insights_overlay: bool,
    pub instance_name: String,
    pub skill_name: String,
    pub device_name: String,
}

impl SnippetSettings {
    pub fn new(filename_prefix: &str, identity: &Identity) -> Self {
        Self {
            filename_prefix: filename_prefix.to_string(),
            recording_duration: Duration::from_secs(10),
            cooldown: Duration::from_secs(60),
            insights_overlay: true,
            instance_name: identity.instance_name.clone(),
            skill_name: identity.skill_name.clone(),
            device_name: identity.device_name.clone(),
        }
    }
}

/// Restores `Waiting` when the export job ends, however it ends.
struct ReturnToWaiting(Arc<AtomicU8>);

impl Drop for ReturnToWaiting {
    fn drop(&mut self) {
        self.0.store(SnippetState::Waiting as u8, Ordering::SeqCst);
    }
}

fn path_component(value: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid path regex"));
    let cleaned = re.replace_all(value.trim(), "_");
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Milliseconds until 2100-01-01 at `now`.
pub fn snippet_id(now: SystemTime) -> i64 {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    ((ID_EPOCH_SECS - secs) * 1000.0) as i64
}

pub struct VideoSnippetExport {
    node: String,
    settings: SnippetSettings,
    state: Arc<AtomicU8>,
    last_start: Option<Instant>,
    frames: Vec<Image>,
    store: Arc<dyn BlobStore>,
    encoder: Arc<dyn SnippetEncoder>,
    job: Option<JoinHandle<()>>,
}

impl VideoSnippetExport {
    pub fn new(
        node: &str,
        settings: SnippetSettings,
        store: Arc<dyn BlobStore>,
        encoder: Arc<dyn SnippetEncoder>,
    ) -> Self {
        Self {
            node: node.to_string(),
            settings,
            state: Arc::new(AtomicU8::new(SnippetState::Waiting as u8)),
            last_start: None,
            frames: Vec::new(),
            store,
            encoder,
            job: None,
        }
    }

    pub fn from_node(ctx: &NodeContext<'_>) -> Result<Self> {
        let params = ctx.params();
        let prefix = params.string_or("filename_prefix", "snippet");
        let mut settings = SnippetSettings::new(&prefix, ctx.identity);
        settings.recording_duration = seconds_param(ctx, "recording_duration", 10.0)?;
        // delay_buffer is in minutes for this sink.
        settings.cooldown = seconds_param(ctx, "delay_buffer", 1.0)? * 60;
        settings.insights_overlay = params.bool_or("insights_overlay", true)?;
        settings.instance_name = params.string_or("instance_displayname", &settings.instance_name);
        settings.skill_name = params.string_or("skill_displayname", &settings.skill_name);
        settings.device_name = params.string_or("device_displayname", &settings.device_name);

        let store = ctx
            .runtime
            .blob_store
            .clone()
            .ok_or_else(|| ctx.missing("blob store"))?;
        let encoder: Arc<dyn SnippetEncoder> = match params.string("encoder").as_deref() {
            Some("mjpeg") => Arc::new(MjpegEncoder::default()),
            _ => Arc::from(default_encoder()),
        };
        Ok(Self::new(ctx.id(), settings, store, encoder))
    }

    pub fn state(&self) -> SnippetState {
        SnippetState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn buffered(&self) -> usize {
        self.frames.len()
    }

    /// Blob path for a snippet recorded at `now`.
    pub fn blob_path(&self, now: SystemTime) -> String {
        let stamp = chrono::DateTime::<Utc>::from(now).format("%Y%m%dT%H%M%SZ");
        format!(
            "video-snippet/{}/{}/{}/{}-{}-{}.{}",
            path_component(&self.settings.instance_name),
            path_component(&self.settings.skill_name),
            path_component(&self.settings.device_name),
            path_component(&self.settings.filename_prefix),
            snippet_id(now),
            stamp,
            self.encoder.extension()
        )
    }

    fn record(&mut self, frame: &Frame) {
        if !self.settings.insights_overlay {
            self.frames.push(frame.image.clone());
            return;
        }
        match overlay::annotate(&frame.image, &frame.insights.objects) {
            Ok(annotated) => self.frames.push(Image::from_rgb_image(annotated)),
            Err(err) => {
                log::debug!("{}: overlay failed: {:#}", self.node, err);
                self.frames.push(frame.image.clone());
            }
        }
    }

    /// Advance the state machine for a frame observed at `now`.
    pub fn process_at(&mut self, frame: &Frame, now: Instant) -> Result<()> {
        match self.state() {
            SnippetState::Waiting => {
                let cooldown = self.settings.cooldown;
                let cooled = self
                    .last_start
                    .map_or(true, |start| now.saturating_duration_since(start) > cooldown);
                if cooled && frame.has_objects() {
                    log::info!("{}: recording snippet (frame {})", self.node, frame.frame_id);
                    self.state
                        .store(SnippetState::Recording as u8, Ordering::SeqCst);
                    self.last_start = Some(now);
                    self.frames.clear();
                    self.record(frame);
                }
            }
            SnippetState::Recording => {
                let started = self.last_start.unwrap_or(now);
                if now.saturating_duration_since(started) > self.settings.recording_duration {
                    self.state
                        .store(SnippetState::Exporting as u8, Ordering::SeqCst);
                    self.spawn_export()?;
                } else {
                    self.record(frame);
                }
            }
            SnippetState::Exporting => {}
        }
        Ok(())
    }

    fn spawn_export(&mut self) -> Result<()> {
        let frames = std::mem::take(&mut self.frames);
        let path = self.blob_path(SystemTime::now());
        let duration = self.settings.recording_duration.as_secs_f64().max(f64::EPSILON);
        let store = self.store.clone();
        let encoder = self.encoder.clone();
        let node = self.node.clone();
        let guard = ReturnToWaiting(self.state.clone());

        let spawned = std::thread::Builder::new()
            .name(format!("snippet-{}", self.node))
            .spawn(move || {
                let _guard = guard;
                let fps = frames.len() as f64 / duration;
                let outcome = encoder
                    .encode(&frames, fps)
                    .context("encode snippet")
                    .and_then(|bytes| {
                        store
                            .put(&path, encoder.content_type(), &bytes)
                            .context("upload snippet")
                    });
                match outcome {
                    Ok(location) => log::info!(
                        "{}: uploaded {}-frame snippet to {}",
                        node,
                        frames.len(),
                        location
                    ),
                    Err(err) => log::warn!("{}: snippet export failed: {:#}", node, err),
                }
            });
        match spawned {
            Ok(handle) => {
                self.job = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.state
                    .store(SnippetState::Waiting as u8, Ordering::SeqCst);
                Err(err).context("spawn snippet export thread")
            }
        }
    }

    /// Wait for an in-flight export. Used by tests; the element loop never waits.
    pub fn wait_for_export(&mut self) {
        if let Some(handle) = self.job.take() {
            let _ = handle.join();
        }
    }
}

impl Export for VideoSnippetExport {
    fn process(&mut self, frame: Frame) -> Result<()> {
        self.process_at(&frame, Instant::now())
    }
}
