//! Snippet encoders.
//!
//! MJPEG (concatenated JPEG frames) is always available. The `snippet-ffmpeg`
//! feature adds an MPEG-4 encoder in an MP4 container.

use anyhow::{anyhow, Result};

use crate::frame::Image;

const MJPEG_QUALITY: u8 = 80;

pub trait SnippetEncoder: Send + Sync {
    fn extension(&self) -> &'static str;

    fn content_type(&self) -> &'static str;

    fn encode(&self, frames: &[Image], fps: f64) -> Result<Vec<u8>>;
}

#[derive(Clone, Copy, Debug)]
pub struct MjpegEncoder {
    quality: u8,
}

impl Default for MjpegEncoder {
    fn default() -> Self {
        Self {
            quality: MJPEG_QUALITY,
        }
    }
}

impl MjpegEncoder {
    pub fn with_quality(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl SnippetEncoder for MjpegEncoder {
    fn extension(&self) -> &'static str {
        "mjpeg"
    }

    fn content_type(&self) -> &'static str {
        "video/x-motion-jpeg"
    }

    fn encode(&self, frames: &[Image], _fps: f64) -> Result<Vec<u8>> {
        if frames.is_empty() {
            return Err(anyhow!("no frames to encode"));
        }
        let mut out = Vec::new();
        for frame in frames {
            out.extend_from_slice(&frame.encode_jpeg(self.quality)?);
        }
        Ok(out)
    }
}

/// Encoder used when a node does not choose one.
pub fn default_encoder() -> Box<dyn SnippetEncoder> {
    #[cfg(feature = "snippet-ffmpeg")]
    {
        Box::new(ffmpeg_mp4::Mp4Encoder)
    }
    #[cfg(not(feature = "snippet-ffmpeg"))]
    {
        Box::new(MjpegEncoder::default())
    }
}

#[cfg(feature = "snippet-ffmpeg")]
pub mod ffmpeg_mp4 {
    use anyhow::{anyhow, Context, Result};
    use ffmpeg_next as ffmpeg;

    use super::SnippetEncoder;
    use crate::frame::Image;

    pub struct Mp4Encoder;

    impl SnippetEncoder for Mp4Encoder {
        fn extension(&self) -> &'static str {
            "mp4"
        }

        fn content_type(&self) -> &'static str {
            "video/mp4"
        }

        fn encode(&self, frames: &[Image], fps: f64) -> Result<Vec<u8>> {
            let first = frames.first().ok_or_else(|| anyhow!("no frames to encode"))?;
            let name = format!("snippet-{:016x}.mp4", rand::random::<u64>());
            let path = std::env::temp_dir().join(name);
            let result = encode_to(&path, first.width, first.height, frames, fps)
                .and_then(|()| std::fs::read(&path).context("read encoded snippet"));
            let _ = std::fs::remove_file(&path);
            result
        }
    }

    fn encode_to(
        path: &std::path::Path,
        width: u32,
        height: u32,
        frames: &[Image],
        fps: f64,
    ) -> Result<()> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let rate = fps.round().max(1.0) as i32;
        let mut octx = ffmpeg::format::output(&path).context("open mp4 output")?;
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("ffmpeg has no MPEG-4 encoder"))?;
        let mut stream = octx.add_stream(codec).context("add video stream")?;
        let mut setup = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create video encoder")?;
        setup.set_width(width);
        setup.set_height(height);
        setup.set_format(ffmpeg::format::Pixel::YUV420P);
        setup.set_time_base((1, rate));
        setup.set_frame_rate(Some((rate, 1)));
        if global_header {
            setup.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let mut encoder = setup.open_as(codec).context("open video encoder")?;
        stream.set_parameters(&encoder);
        let stream_index = stream.index();
        octx.write_header().context("write mp4 header")?;
        let stream_tb = octx
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("video stream vanished"))?;
        let encoder_tb = ffmpeg::Rational::new(1, rate);

        let mut scaler = ffmpeg::software::scaling::Context::get(
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        for (index, image) in frames.iter().enumerate() {
            if image.width != width || image.height != height {
                log::warn!("skipping snippet frame {} with a different size", index);
                continue;
            }
            let rgb = image.to_rgb_image()?;
            let mut input = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGB24, width, height);
            let stride = input.stride(0);
            let row = width as usize * 3;
            let data = input.data_mut(0);
            for (y, src) in rgb.as_raw().chunks_exact(row).enumerate() {
                data[y * stride..y * stride + row].copy_from_slice(src);
            }
            let mut yuv = ffmpeg::frame::Video::empty();
            scaler.run(&input, &mut yuv).context("convert frame to yuv")?;
            yuv.set_pts(Some(index as i64));
            encoder.send_frame(&yuv).context("send frame to encoder")?;
            drain(&mut encoder, &mut octx, stream_index, encoder_tb, stream_tb)?;
        }
        encoder.send_eof().context("flush encoder")?;
        drain(&mut encoder, &mut octx, stream_index, encoder_tb, stream_tb)?;
        octx.write_trailer().context("write mp4 trailer")?;
        Ok(())
    }

    fn drain(
        encoder: &mut ffmpeg::encoder::video::Encoder,
        octx: &mut ffmpeg::format::context::Output,
        stream_index: usize,
        encoder_tb: ffmpeg::Rational,
        stream_tb: ffmpeg::Rational,
    ) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(stream_index);
            packet.rescale_ts(encoder_tb, stream_tb);
            packet
                .write_interleaved(octx)
                .context("write encoded packet")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_concatenates_one_jpeg_per_frame() {
        let frames: Vec<Image> = (0..3).map(|i| Image::synthetic(8, 8, i)).collect();
        let bytes = MjpegEncoder::default().encode(&frames, 3.0).expect("encode");
        let starts = bytes
            .windows(3)
            .filter(|w| w[0] == 0xFF && w[1] == 0xD8 && w[2] == 0xFF)
            .count();
        assert_eq!(starts, 3);
    }

    #[test]
    fn empty_snippet_is_an_error() {
        assert!(MjpegEncoder::default().encode(&[], 1.0).is_err());
    }
}
