//! Planar-frame validation utilities for test pattern verification.
//!
//! Used by unit tests against the mock engine and by the vivid
//! integration tests to check that converted frames carry the expected
//! pattern.

use crate::convert::i420_frame_size;
use crate::traits::{CameraError, Result};

/// Allowed per-sample dip in an otherwise rising luma row.
const MONOTONIC_TOLERANCE: i16 = 1;

/// Minimum left-to-right luminance change for a gradient to count.
const MIN_GRADIENT_RANGE: i16 = 50;

/// Expect `bytes` to be exactly the planar 4:2:0 size for the geometry.
pub fn validate_planar_layout(bytes: usize, width: u32, height: u32) -> Result<()> {
    let expected = i420_frame_size(width, height);
    if bytes != expected {
        return Err(CameraError::ValidationFailed(format!(
            "planar frame is {bytes} bytes, expected {expected} for {width}x{height}"
        )));
    }
    Ok(())
}

fn luma_plane(frame: &[u8], width: u32, height: u32) -> Result<&[u8]> {
    let len = (width as usize) * (height as usize);
    frame.get(..len).ok_or_else(|| {
        CameraError::ValidationFailed(format!(
            "frame too short for a {width}x{height} luma plane"
        ))
    })
}

fn chroma_planes(frame: &[u8], width: u32, height: u32) -> Result<(&[u8], &[u8])> {
    let luma_size = (width as usize) * (height as usize);
    let chroma_size = (width as usize / 2) * (height as usize / 2);
    let u_plane = frame.get(luma_size..luma_size + chroma_size);
    let v_plane = frame.get(luma_size + chroma_size..luma_size + 2 * chroma_size);
    match (u_plane, v_plane) {
        (Some(u), Some(v)) => Ok((u, v)),
        _ => Err(CameraError::ValidationFailed(format!(
            "frame too short for {width}x{height} chroma planes"
        ))),
    }
}

/// Validate that the luma plane is an x-coordinate ramp (mod 256).
pub fn validate_luma_ramp(frame: &[u8], width: u32, height: u32) -> Result<()> {
    let luma = luma_plane(frame, width, height)?;
    let w = width as usize;
    for (i, &value) in luma.iter().enumerate() {
        let x = i % w;
        let expected = (x % 256) as u8;
        if value != expected {
            let y = i / w;
            return Err(CameraError::ValidationFailed(format!(
                "luma at ({x}, {y}) is {value}, expected {expected}"
            )));
        }
    }
    Ok(())
}

/// Validate that both chroma planes are uniform at the expected values.
pub fn validate_uniform_chroma(
    frame: &[u8],
    width: u32,
    height: u32,
    expected_u: u8,
    expected_v: u8,
) -> Result<()> {
    let (u_plane, v_plane) = chroma_planes(frame, width, height)?;
    if let Some(pos) = u_plane.iter().position(|&b| b != expected_u) {
        return Err(CameraError::ValidationFailed(format!(
            "U plane sample {pos} is {}, expected {expected_u}",
            u_plane[pos]
        )));
    }
    if let Some(pos) = v_plane.iter().position(|&b| b != expected_v) {
        return Err(CameraError::ValidationFailed(format!(
            "V plane sample {pos} is {}, expected {expected_v}",
            v_plane[pos]
        )));
    }
    Ok(())
}

/// Validate that the centre luma row rises from left to right with a
/// significant overall change. Matches gradient and ramp-style patterns;
/// rejects solid frames.
pub fn validate_luma_monotonic(frame: &[u8], width: u32, height: u32) -> Result<()> {
    let luma = luma_plane(frame, width, height)?;
    let w = width as usize;
    let center_start = (height as usize / 2) * w;
    let row = luma.get(center_start..center_start + w).ok_or_else(|| {
        CameraError::ValidationFailed("frame too short for the centre row".to_owned())
    })?;

    let mut first: Option<i16> = None;
    let mut prev: Option<i16> = None;
    for (x, &value) in row.iter().enumerate().step_by(10) {
        let value = i16::from(value);
        if first.is_none() {
            first = Some(value);
        }
        if let Some(prev) = prev {
            if value < prev - MONOTONIC_TOLERANCE {
                return Err(CameraError::ValidationFailed(format!(
                    "luma not monotonic at x={x}: {value} after {prev}"
                )));
            }
        }
        prev = Some(value);
    }

    if let (Some(first), Some(last)) = (first, prev) {
        if last - first < MIN_GRADIENT_RANGE {
            return Err(CameraError::ValidationFailed(format!(
                "luminance change {} too small for a gradient",
                last - first
            )));
        }
    }
    Ok(())
}
