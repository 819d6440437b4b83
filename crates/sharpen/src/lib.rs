//! Sharpening by 3x3 high-pass convolution
//!
//! The kernel is the identity plus `strength` times the negated 4-neighbour
//! Laplacian; at the default strength of 1.0 it is
//!
//! ```text
//!  0 -1  0
//! -1  5 -1
//!  0 -1  0
//! ```
//!
//! Borders replicate the edge pixel. Bit depth is preserved.

pub mod plugin;

use image::DynamicImage;
use imageproc::filter::filter3x3;
use micrograph_common::image_io::BitDepth;
use micrograph_common::ProcessingError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharpenError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<SharpenError> for ProcessingError {
    fn from(err: SharpenError) -> Self {
        ProcessingError::Other(err.to_string())
    }
}

/// The `sharpen` config section
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharpenConfig {
    pub strength: f32,
}

impl Default for SharpenConfig {
    fn default() -> Self {
        Self { strength: 1.0 }
    }
}

impl SharpenConfig {
    pub fn validate(&self) -> Result<(), SharpenError> {
        if !self.strength.is_finite() || self.strength < 0.0 {
            return Err(SharpenError::InvalidConfig(format!(
                "strength must be a non-negative number, got {}",
                self.strength
            )));
        }
        Ok(())
    }

    /// Row-major 3x3 kernel
    #[must_use]
    pub fn kernel(&self) -> [f32; 9] {
        let s = self.strength;
        [0.0, -s, 0.0, -s, 1.0 + 4.0 * s, -s, 0.0, -s, 0.0]
    }
}

/// Sharpen an image, keeping its bit depth
///
/// Channels are convolved in `f32` and clamped back into the integer range.
#[must_use]
pub fn sharpen(img: &DynamicImage, config: &SharpenConfig) -> DynamicImage {
    let kernel = config.kernel();
    match BitDepth::of(img) {
        BitDepth::Eight => {
            DynamicImage::ImageRgb8(filter3x3::<_, f32, u8>(&img.to_rgb8(), &kernel))
        }
        BitDepth::Sixteen => {
            DynamicImage::ImageRgb16(filter3x3::<_, f32, u16>(&img.to_rgb16(), &kernel))
        }
    }
}
