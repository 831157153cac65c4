use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::frame::{Image, ObjectMeta};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const ATTRIBUTE_COLOR: Rgb<u8> = Rgb([255, 160, 0]);

/// Frame pixels as RGB with a rectangle around every detection.
pub(crate) fn annotate(image: &Image, objects: &[ObjectMeta]) -> anyhow::Result<RgbImage> {
    let mut canvas = image.to_rgb_image()?;
    let (width, height) = canvas.dimensions();
    for object in objects {
        let b = object.bbox.clamped();
        let x = (b.l * width as f64).round() as i32;
        let y = (b.t * height as f64).round() as i32;
        let w = (b.w * width as f64).round() as u32;
        let h = (b.h * height as f64).round() as u32;
        if w == 0 || h == 0 {
            continue;
        }
        let color = if object.attributes.is_empty() {
            BOX_COLOR
        } else {
            ATTRIBUTE_COLOR
        };
        draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(w, h), color);
    }
    Ok(canvas)
}
