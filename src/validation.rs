//! Frame validation utilities for test pattern verification.
//!
//! These work on the greyscale frames the capture pipeline delivers and are
//! used both by unit tests against the mock camera and by integration tests
//! against virtual (vivid) cameras.

use crate::traits::{CameraError, Result};

/// Minimum luma rise expected across a gradient frame.
const MIN_GRADIENT_RISE: i32 = 50;

/// Validates that a greyscale frame holds a horizontal gradient.
///
/// Samples the centre row every 10 pixels and checks that luma never drops
/// by more than one step and that it rises noticeably overall.
///
/// # Errors
///
/// Returns `StreamError` if:
/// - The buffer does not hold `width * height` pixels
/// - The luminance decreases along the row
/// - The total luminance change is too small (solid color)
pub fn validate_gradient(data: &[u8], width: u32, height: u32) -> Result<()> {
    check_len(data, width, height)?;
    let row_start = (height / 2 * width) as usize;
    let row = data
        .get(row_start..row_start + width as usize)
        .ok_or_else(|| CameraError::StreamError("centre row out of range".to_owned()))?;

    let mut prev: Option<i32> = None;
    for (x, &px) in row.iter().enumerate().step_by(10) {
        let luminance = i32::from(px);
        if let Some(prev) = prev {
            // Allow small decreases due to rounding
            if luminance < prev - 1 {
                return Err(CameraError::StreamError(format!(
                    "Gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }
        prev = Some(luminance);
    }

    let first = row.first().copied().map_or(0, i32::from);
    let last = row.last().copied().map_or(0, i32::from);
    if last - first < MIN_GRADIENT_RISE {
        return Err(CameraError::StreamError(format!(
            "Insufficient luminance change for gradient: {} (expected at least {})",
            last - first,
            MIN_GRADIENT_RISE
        )));
    }

    Ok(())
}

/// Validates that every pixel is within `tolerance` of `value`.
pub fn validate_solid(data: &[u8], value: u8, tolerance: u8) -> Result<()> {
    if let Some((index, px)) = data
        .iter()
        .enumerate()
        .find(|(_, px)| px.abs_diff(value) > tolerance)
    {
        return Err(CameraError::StreamError(format!(
            "Pixel {index} is {px}, expected {value} +/- {tolerance}"
        )));
    }
    Ok(())
}

fn check_len(data: &[u8], width: u32, height: u32) -> Result<()> {
    let expected = width as usize * height as usize;
    if data.len() == expected {
        Ok(())
    } else {
        Err(CameraError::StreamError(format!(
            "Frame holds {} bytes, expected {expected} for {width}x{height}",
            data.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_gradient_success() {
        let data: Vec<u8> = (0..4).flat_map(|_| (0..=255u8).step_by(4)).collect();
        assert!(validate_gradient(&data, 64, 4).is_ok());
    }

    #[test]
    fn test_validate_gradient_rejects_solid() {
        let data = vec![128u8; 64 * 4];
        assert!(validate_gradient(&data, 64, 4).is_err());
    }

    #[test]
    fn test_validate_gradient_rejects_wrong_size() {
        assert!(validate_gradient(&[0; 10], 4, 4).is_err());
    }

    #[test]
    fn test_validate_solid() {
        assert!(validate_solid(&[100, 101, 99], 100, 1).is_ok());
        assert!(validate_solid(&[100, 120], 100, 1).is_err());
    }
}
