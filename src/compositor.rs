//! Places a background-free portrait on a fixed-size white canvas

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbaImage, RgbImage};

const CANVAS_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Compose the foreground onto an opaque canvas of exactly `width` x `height`.
///
/// The foreground is shrunk to fit (never enlarged), centered, and blended through
/// its alpha channel. The result carries no transparency.
pub fn compose(foreground: &RgbaImage, width: u32, height: u32) -> RgbImage {
    let mut canvas = RgbaImage::from_pixel(width, height, CANVAS_COLOR);

    let (fit_width, fit_height) = fit_within(foreground.dimensions(), (width, height));
    if fit_width > 0 && fit_height > 0 {
        let scaled = if (fit_width, fit_height) == foreground.dimensions() {
            foreground.clone()
        } else {
            imageops::resize(foreground, fit_width, fit_height, FilterType::Lanczos3)
        };

        let offset_x = i64::from((width - fit_width) / 2);
        let offset_y = i64::from((height - fit_height) / 2);
        imageops::overlay(&mut canvas, &scaled, offset_x, offset_y);
    }

    DynamicImage::ImageRgba8(canvas).to_rgb8()
}

/// Largest size with the source aspect ratio that fits inside `bounds`, capped at the source size
fn fit_within(source: (u32, u32), bounds: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let (max_w, max_h) = bounds;
    if src_w == 0 || src_h == 0 || max_w == 0 || max_h == 0 {
        return (0, 0);
    }
    if src_w <= max_w && src_h <= max_h {
        return source;
    }

    let scale = f64::min(
        f64::from(max_w) / f64::from(src_w),
        f64::from(max_h) / f64::from(src_h),
    );
    let w = (f64::from(src_w) * scale).round() as u32;
    let h = (f64::from(src_h) * scale).round() as u32;
    (w.clamp(1, max_w), h.clamp(1, max_h))
}
