//! Pixel-level geometry: rotated views and resampling helpers.
//!
//! Rotation follows the usual image-library convention: positive angles turn
//! the picture counter-clockwise about its center, and the canvas grows so no
//! corner is clipped. Uncovered pixels are black.

use std::borrow::Cow;

use image::{Rgb, RgbImage};
use ndarray::{Array3, ArrayView3};

/// Bicubic kernel coefficient (Catmull-Rom style, a = -0.5).
const BICUBIC_A: f64 = -0.5;

/// View of `image` rotated by `degrees`. A zero angle borrows the input.
pub fn angle_view(image: &RgbImage, degrees: f32) -> Cow<'_, RgbImage> {
    if degrees == 0.0 {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(rotate_expanded(image, degrees))
    }
}

/// Inverse affine map (output pixel → input pixel) as `[a, b, c, d, e, f]`:
/// ```text
/// x_in = a * x + b * y + c
/// y_in = d * x + e * y + f
/// ```
/// together with the expanded canvas size.
fn rotation_map(width: u32, height: u32, degrees: f32) -> ([f64; 6], u32, u32) {
    let theta = -(degrees as f64).to_radians();
    let (sin, cos) = theta.sin_cos();
    let (a, b, d, e) = (cos, sin, -sin, cos);

    let w = width as f64;
    let h = height as f64;
    let (cx, cy) = (w / 2.0, h / 2.0);

    let mut c = a * -cx + b * -cy + cx;
    let mut f = d * -cx + e * -cy + cy;

    let corners = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
    let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
    for (x, y) in corners {
        let tx = a * x + b * y + c;
        let ty = d * x + e * y + f;
        min_x = min_x.min(tx);
        max_x = max_x.max(tx);
        min_y = min_y.min(ty);
        max_y = max_y.max(ty);
    }
    let new_w = (max_x.ceil() - min_x.floor()).max(1.0);
    let new_h = (max_y.ceil() - min_y.floor()).max(1.0);

    // Re-center the original image in the enlarged canvas.
    let px = -(new_w - w) / 2.0;
    let py = -(new_h - h) / 2.0;
    let (c0, f0) = (c, f);
    c = a * px + b * py + c0;
    f = d * px + e * py + f0;

    ([a, b, c, d, e, f], new_w as u32, new_h as u32)
}

/// Rotate `image` counter-clockwise by `degrees` with bicubic resampling,
/// expanding the canvas to fit the whole rotated picture.
pub fn rotate_expanded(image: &RgbImage, degrees: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let ([a, b, c, d, e, f], out_w, out_h) = rotation_map(width, height, degrees);

    RgbImage::from_fn(out_w, out_h, |ox, oy| {
        let x = ox as f64 + 0.5;
        let y = oy as f64 + 0.5;
        let sx = a * x + b * y + c;
        let sy = d * x + e * y + f;
        if sx < 0.0 || sy < 0.0 || sx >= width as f64 || sy >= height as f64 {
            return Rgb([0, 0, 0]);
        }
        sample_bicubic(image, sx - 0.5, sy - 0.5)
    })
}

fn cubic_weight(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        ((BICUBIC_A + 2.0) * t - (BICUBIC_A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        (((t - 5.0) * t + 8.0) * t - 4.0) * BICUBIC_A
    } else {
        0.0
    }
}

/// Bicubic sample at fractional pixel coordinates; neighbors clamp to the edge.
fn sample_bicubic(image: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let wx: [f64; 4] = std::array::from_fn(|i| cubic_weight(fx - (i as f64 - 1.0)));
    let wy: [f64; 4] = std::array::from_fn(|j| cubic_weight(fy - (j as f64 - 1.0)));

    let mut acc = [0.0f64; 3];
    for (j, wy_j) in wy.iter().enumerate() {
        let py = (y0 as i64 + j as i64 - 1).clamp(0, height as i64 - 1) as u32;
        for (i, wx_i) in wx.iter().enumerate() {
            let px = (x0 as i64 + i as i64 - 1).clamp(0, width as i64 - 1) as u32;
            let w = wx_i * wy_j;
            let p = image.get_pixel(px, py);
            for (ch, value) in acc.iter_mut().enumerate() {
                *value += w * p[ch] as f64;
            }
        }
    }

    Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
}

/// Convert an RGB image to a channel-major float tensor `(3, rows, columns)`
/// holding raw 0–255 values.
pub fn to_channel_major(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        image.get_pixel(x as u32, y as u32)[c] as f32
    })
}

/// Area (adaptive average pooling) resampling of a channel-major tensor.
///
/// Each output cell averages the input window
/// `[floor(i * in / out), ceil((i + 1) * in / out))` on both axes.
pub fn area_resize(src: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (channels, in_h, in_w) = src.dim();
    let mut out = Array3::<f32>::zeros((channels, out_h, out_w));
    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 {
        return out;
    }

    let window = |i: usize, input: usize, output: usize| -> (usize, usize) {
        let start = i * input / output;
        let end = ((i + 1) * input).div_ceil(output);
        (start, end.max(start + 1).min(input))
    };

    for oy in 0..out_h {
        let (y0, y1) = window(oy, in_h, out_h);
        for ox in 0..out_w {
            let (x0, x1) = window(ox, in_w, out_w);
            let count = ((y1 - y0) * (x1 - x0)) as f32;
            for c in 0..channels {
                let mut sum = 0.0f32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        sum += src[[c, y, x]];
                    }
                }
                out[[c, oy, ox]] = sum / count;
            }
        }
    }

    out
}
