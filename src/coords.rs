//! Normalized `[0, 1000]` boxes to screen pixels.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scale of the grounding model's normalized coordinate space.
pub const NORMALIZED_SCALE: u64 = 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinateError {
    #[error("expected a box of 4 components, got {0}")]
    WrongArity(usize),
    #[error("image size must be positive, got {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

/// Pixel-space `[x1, y1, x2, y2]`. Only produced by [`map_box`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbsoluteBox([i64; 4]);

impl AbsoluteBox {
    pub fn coords(&self) -> [i64; 4] {
        self.0
    }

    /// Integer midpoint, rounding toward negative infinity.
    pub fn midpoint(&self) -> (i64, i64) {
        let [x1, y1, x2, y2] = self.0;
        ((x1 + x2).div_euclid(2), (y1 + y2).div_euclid(2))
    }
}

/// `abs_i = floor(box_i * dimension / 1000)`, width for x and height for y.
///
/// Components outside `[0, 1000]` are scaled as-is.
pub fn map_box(normalized: &[u32], size: (u32, u32)) -> Result<AbsoluteBox, CoordinateError> {
    if normalized.len() != 4 {
        return Err(CoordinateError::WrongArity(normalized.len()));
    }
    let (width, height) = size;
    if width == 0 || height == 0 {
        return Err(CoordinateError::InvalidSize { width, height });
    }

    let scale = |value: u32, dimension: u32| -> i64 {
        (u64::from(value) * u64::from(dimension) / NORMALIZED_SCALE) as i64
    };
    Ok(AbsoluteBox([
        scale(normalized[0], width),
        scale(normalized[1], height),
        scale(normalized[2], width),
        scale(normalized[3], height),
    ]))
}
