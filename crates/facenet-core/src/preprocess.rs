//! Input size normalization before detection.

use image::imageops::{self, FilterType};
use image::RgbImage;

/// Longest side accepted by the detector before downscaling kicks in.
pub const DEFAULT_MAX_SIDE: u32 = 720;

/// Downscale `image` so its longest side is at most `max_len`.
///
/// Aspect ratio is preserved (the short side is truncated) and Lanczos3 is
/// used for resampling. Images already within bounds are returned as-is;
/// this never upsamples.
pub fn resize_if_needed(image: RgbImage, max_len: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if max_len == 0 || longest <= max_len {
        return image;
    }

    let scale = max_len as f64 / longest as f64;
    let scaled = |side: u32| -> u32 {
        if side == longest {
            max_len
        } else {
            ((side as f64 * scale) as u32).max(1)
        }
    };
    let (new_width, new_height) = (scaled(width), scaled(height));

    tracing::debug!(width, height, new_width, new_height, "downscaling input image");
    imageops::resize(&image, new_width, new_height, FilterType::Lanczos3)
}
