//! Greyscale conversion and denoising for raw camera frames.
//!
//! Images keep the row pitch of the frame they were converted from, so a
//! device that pads its rows yields a [`GreyImage`] whose `stride` exceeds
//! its `width`. Nothing here repacks rows; callers decide whether a strided
//! image is acceptable.

use crate::error::{Error, Result};
use crate::traits::{Format, FourCC};

/// Single-channel 8-bit image with an explicit row pitch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreyImage {
    /// Visible pixels per row.
    pub width: u32,
    /// Number of rows.
    pub height: u32,
    /// Pixels per row in `data`, including padding.
    pub stride: u32,
    /// Row-major pixel data, `stride * height` bytes.
    pub data: Vec<u8>,
}

impl GreyImage {
    /// True when rows follow each other with no gap.
    #[must_use]
    pub const fn is_contiguous(&self) -> bool {
        self.stride == self.width
    }

    fn row(&self, y: u32) -> &[u8] {
        let start = (y * self.stride) as usize;
        self.data
            .get(start..start + self.width as usize)
            .unwrap_or_default()
    }
}

/// Luma of an RGB triple, ITU-R BT.601 weights.
#[must_use]
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    let y = 0.114f32.mul_add(
        f32::from(b),
        0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
    );
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        y.round().clamp(0.0, 255.0) as u8
    }
}

/// Convert a raw frame in `format` to greyscale.
///
/// Only whole rows present in `raw` are converted, so a short buffer shows up
/// as a shorter image rather than as garbage.
pub fn to_grey(raw: &[u8], format: &Format) -> Result<GreyImage> {
    let bpp = format
        .fourcc
        .bytes_per_pixel()
        .ok_or(Error::UnsupportedPixelFormat(format.fourcc))?;
    let pitch = format.stride / bpp;
    if pitch == 0 {
        return Err(Error::DimensionMismatch {
            expected: (format.width, format.height),
            actual: (0, 0),
        });
    }

    let width = format.width.min(pitch);
    #[allow(clippy::cast_possible_truncation)]
    let height = (raw.len() / format.stride as usize).min(format.height as usize) as u32;

    let mut data = vec![0u8; (pitch * height) as usize];
    for (src, dst) in raw
        .chunks_exact(format.stride as usize)
        .zip(data.chunks_exact_mut(pitch as usize))
    {
        if let Some(visible) = dst.get_mut(..width as usize) {
            convert_row(src, visible, format.fourcc);
        }
    }

    Ok(GreyImage {
        width,
        height,
        stride: pitch,
        data,
    })
}

fn convert_row(src: &[u8], dst: &mut [u8], fourcc: FourCC) {
    match fourcc {
        // Y0 U Y1 V: luma sits on every even byte.
        FourCC::YUYV => {
            for (out, y) in dst.iter_mut().zip(src.iter().step_by(2)) {
                *out = *y;
            }
        }
        FourCC::BGR3 => {
            for (out, px) in dst.iter_mut().zip(src.chunks_exact(3)) {
                if let &[b, g, r] = px {
                    *out = luma(r, g, b);
                }
            }
        }
        FourCC::RGB3 => {
            for (out, px) in dst.iter_mut().zip(src.chunks_exact(3)) {
                if let &[r, g, b] = px {
                    *out = luma(r, g, b);
                }
            }
        }
        _ => {
            for (out, y) in dst.iter_mut().zip(src) {
                *out = *y;
            }
        }
    }
}

/// 3x3 median filter with replicated borders. Padding columns are carried
/// over untouched.
#[must_use]
pub fn median_3x3(image: &GreyImage) -> GreyImage {
    let mut out = image.clone();
    if image.width == 0 || image.height == 0 {
        return out;
    }

    let last_x = image.width - 1;
    let last_y = image.height - 1;
    for y in 0..image.height {
        let rows = [
            image.row(y.saturating_sub(1)),
            image.row(y),
            image.row((y + 1).min(last_y)),
        ];
        let start = (y * image.stride) as usize;
        let Some(dst) = out.data.get_mut(start..start + image.width as usize) else {
            continue;
        };
        for (x, out) in (0..image.width).zip(dst.iter_mut()) {
            let cols = [x.saturating_sub(1), x, (x + 1).min(last_x)];
            let mut window = [0u8; 9];
            for (slot, (row, col)) in window
                .iter_mut()
                .zip(rows.iter().flat_map(|row| cols.iter().map(move |col| (row, col))))
            {
                *slot = row.get(*col as usize).copied().unwrap_or_default();
            }
            window.sort_unstable();
            let [_, _, _, _, median, ..] = window;
            *out = median;
        }
    }
    out
}
