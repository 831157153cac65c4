//! Frame and detection model.
//!
//! - `Image`: pixel buffer plus shape. Opaque to every stage except models and
//!   exports that need pixels.
//! - `ObjectMeta` / `Attribute` / `Bbox`: one detection, normalized coordinates.
//! - `InsightsMeta`: the accumulated detection metadata for a frame.
//! - `Frame`: the unit of work handed between elements.
//!
//! A `Frame` is owned by exactly one element at a time. Hand-off is a move when
//! there is a single child and a full `Clone` (pixels included) otherwise, so two
//! children never observe each other's mutations.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;

/// Bytes per pixel for the packed 8-bit formats carried in `Image`.
pub const CHANNELS: usize = 3;

const DEFAULT_JPEG_QUALITY: u8 = 85;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFormat {
    #[default]
    Rgb,
    Bgr,
}

/// Wire encodings a frame image can be converted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEncoding {
    Raw,
    Bmp,
    Jpeg,
}

impl ImageEncoding {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" | "numpy" => Some(ImageEncoding::Raw),
            "bmp" => Some(ImageEncoding::Bmp),
            "jpeg" | "jpg" => Some(ImageEncoding::Jpeg),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageEncoding::Raw => "application/octet-stream",
            ImageEncoding::Bmp => "image/bmp",
            ImageEncoding::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub color_format: ColorFormat,
}

impl Image {
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        color_format: ColorFormat,
    ) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * CHANNELS;
        if pixels.len() != expected {
            return Err(anyhow!(
                "pixel buffer is {} bytes, expected {} for {}x{}",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            color_format,
        })
    }

    /// Deterministic gradient pattern, shifted by `seed` so consecutive frames differ.
    pub fn synthetic(width: u32, height: u32, seed: u64) -> Self {
        let mut pixels = Vec::with_capacity((width as usize) * (height as usize) * CHANNELS);
        let shift = (seed % 256) as u32;
        for y in 0..height {
            for x in 0..width {
                pixels.push(((x + shift) % 256) as u8);
                pixels.push(((y + shift) % 256) as u8);
                pixels.push(((x + y) % 256) as u8);
            }
        }
        Self {
            pixels,
            width,
            height,
            color_format: ColorFormat::Rgb,
        }
    }

    pub fn from_rgb_image(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            pixels: img.into_raw(),
            width,
            height,
            color_format: ColorFormat::Rgb,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Copy into an RGB `image` buffer, swapping channels when stored as BGR.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        let mut pixels = self.pixels.clone();
        if self.color_format == ColorFormat::Bgr {
            for px in pixels.chunks_exact_mut(CHANNELS) {
                px.swap(0, 2);
            }
        }
        RgbImage::from_raw(self.width, self.height, pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", self.width, self.height))
    }

    pub fn encode(&self, encoding: ImageEncoding) -> Result<Vec<u8>> {
        match encoding {
            ImageEncoding::Raw => Ok(self.pixels.clone()),
            ImageEncoding::Jpeg => self.encode_jpeg(DEFAULT_JPEG_QUALITY),
            ImageEncoding::Bmp => {
                let rgb = self.to_rgb_image()?;
                let mut out = Cursor::new(Vec::new());
                rgb.write_to(&mut out, ImageFormat::Bmp)
                    .context("encode frame as bmp")?;
                Ok(out.into_inner())
            }
        }
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let rgb = self.to_rgb_image()?;
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(rgb.as_raw(), self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode frame as jpeg")?;
        Ok(out)
    }

    /// Crop to a normalized bbox. Returns `None` when the region is empty.
    pub fn crop(&self, bbox: &Bbox) -> Option<Image> {
        let b = bbox.clamped();
        let x0 = (b.l * self.width as f64).round() as u32;
        let y0 = (b.t * self.height as f64).round() as u32;
        let x1 = (b.right() * self.width as f64).round().min(self.width as f64) as u32;
        let y1 = (b.bottom() * self.height as f64).round().min(self.height as f64) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        let (cw, ch) = (x1 - x0, y1 - y0);
        let stride = self.width as usize * CHANNELS;
        let mut pixels = Vec::with_capacity(cw as usize * ch as usize * CHANNELS);
        for row in y0..y1 {
            let start = row as usize * stride + x0 as usize * CHANNELS;
            let end = start + cw as usize * CHANNELS;
            pixels.extend_from_slice(self.pixels.get(start..end)?);
        }
        Some(Image {
            pixels,
            width: cw,
            height: ch,
            color_format: self.color_format,
        })
    }
}

/// Normalized left/top/width/height box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    #[serde(alias = "left")]
    pub l: f64,
    #[serde(alias = "top")]
    pub t: f64,
    #[serde(alias = "width")]
    pub w: f64,
    #[serde(alias = "height")]
    pub h: f64,
}

impl Bbox {
    pub fn new(l: f64, t: f64, w: f64, h: f64) -> Self {
        Self { l, t, w, h }
    }

    /// Build from corner coordinates.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            l: x1.min(x2),
            t: y1.min(y2),
            w: (x2 - x1).abs(),
            h: (y2 - y1).abs(),
        }
    }

    pub fn right(&self) -> f64 {
        self.l + self.w
    }

    pub fn bottom(&self) -> f64 {
        self.t + self.h
    }

    pub fn center(&self) -> (f64, f64) {
        (self.l + self.w / 2.0, self.t + self.h / 2.0)
    }

    /// Corners in winding order, starting top-left.
    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.l, self.t),
            (self.right(), self.t),
            (self.right(), self.bottom()),
            (self.l, self.bottom()),
        ]
    }

    /// Clamp every edge into `[0, 1]`.
    pub fn clamped(&self) -> Bbox {
        let x1 = self.l.clamp(0.0, 1.0);
        let y1 = self.t.clamp(0.0, 1.0);
        let x2 = self.right().clamp(0.0, 1.0);
        let y2 = self.bottom().clamp(0.0, 1.0);
        Bbox::from_corners(x1, y1, x2, y2)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub label: String,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub label: String,
    pub confidence: f64,
    pub bbox: Bbox,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,
}

impl ObjectMeta {
    pub fn new(label: impl Into<String>, confidence: f64, bbox: Bbox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
            attributes: Vec::new(),
        }
    }
}

/// One discrete business event raised by a scenario on this frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioEvent {
    pub kind: String,
    /// Line or zone id the event belongs to.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Scenario state attached by a scenario transform.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioInsight {
    pub scenario: String,
    pub counters: BTreeMap<String, i64>,
    pub new_event: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ScenarioEvent>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightsMeta {
    pub objects: Vec<ObjectMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ScenarioInsight>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub image: Image,
    pub insights: InsightsMeta,
    pub timestamp: DateTime<Utc>,
    pub frame_id: u64,
    pub skill_id: String,
    pub device_id: String,
    pub instance_id: String,
}

impl Frame {
    pub fn new(image: Image, frame_id: u64) -> Self {
        Self {
            image,
            insights: InsightsMeta::default(),
            timestamp: Utc::now(),
            frame_id,
            skill_id: String::new(),
            device_id: String::new(),
            instance_id: String::new(),
        }
    }

    pub fn has_objects(&self) -> bool {
        !self.insights.objects.is_empty()
    }
}
