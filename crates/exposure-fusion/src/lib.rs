//! Exposure fusion of bracketed captures into one well-exposed tile
//!
//! Each input pixel is weighted by its local contrast, colour saturation and
//! closeness to mid-grey, then the inputs are blended with the normalized
//! weights (Mertens-style, single scale). Alternatively the work is handed to
//! `enfuse` when a tool is configured.
//!
//! # Example
//! ```no_run
//! use micrograph_exposure_fusion::{fuse_exposures, ExposureFusionConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dark = image::open("c000_r000_h00.tif")?;
//! let bright = image::open("c000_r000_h01.tif")?;
//! let fused = fuse_exposures(&[&dark, &bright], &ExposureFusionConfig::default())?;
//! fused.save("exposure_fused/c000_r000.tif")?;
//! # Ok(())
//! # }
//! ```

pub mod plugin;

use image::{DynamicImage, GrayImage, Rgb32FImage};
use imageproc::filter::laplacian_filter;
use micrograph_common::image_io::{from_rgb_f32, to_rgb_f32, BitDepth};
use micrograph_common::tool::ExternalTool;
use micrograph_common::ProcessingError;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Keeps all-zero weights from dividing by zero
const WEIGHT_EPSILON: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("No exposures to fuse")]
    NoInputs,

    #[error("Exposure {index} is {actual:?}, expected {expected:?}")]
    DimensionMismatch {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

impl From<FusionError> for ProcessingError {
    fn from(err: FusionError) -> Self {
        match err {
            FusionError::DimensionMismatch {
                expected, actual, ..
            } => ProcessingError::DimensionMismatch { expected, actual },
            FusionError::Processing(e) => e,
            other => ProcessingError::Other(other.to_string()),
        }
    }
}

/// How closeness to mid-grey is scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    /// `exp(-(v - 0.5)^2 / 2 sigma^2)`
    #[default]
    Gaussian,
    /// `1 - 2 |v - 0.5|`
    Linear,
    /// Every exposure level counts the same
    Uniform,
}

/// The `exposure_fusion` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureFusionConfig {
    pub contrast_weight: f32,
    pub saturation_weight: f32,
    pub exposure_weight: f32,
    /// Width of the gaussian well-exposedness curve
    pub exposure_sigma: f32,
    pub weighting: Weighting,
    /// Fuse with this tool (e.g. `enfuse`) instead of in-process
    pub enfuse: Option<ExternalTool>,
}

impl Default for ExposureFusionConfig {
    fn default() -> Self {
        Self {
            contrast_weight: 1.0,
            saturation_weight: 1.0,
            exposure_weight: 1.0,
            exposure_sigma: 0.2,
            weighting: Weighting::Gaussian,
            enfuse: None,
        }
    }
}

impl ExposureFusionConfig {
    pub fn validate(&self) -> Result<(), FusionError> {
        let exponents = [
            self.contrast_weight,
            self.saturation_weight,
            self.exposure_weight,
        ];
        if exponents.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(FusionError::InvalidConfig(
                "weights must be non-negative numbers".to_string(),
            ));
        }
        if self.exposure_sigma.is_nan() || self.exposure_sigma <= 0.0 {
            return Err(FusionError::InvalidConfig(format!(
                "exposure_sigma must be positive, got {}",
                self.exposure_sigma
            )));
        }
        Ok(())
    }

    fn well_exposed(&self, v: f32) -> f32 {
        match self.weighting {
            Weighting::Gaussian => {
                let d = v - 0.5;
                (-(d * d) / (2.0 * self.exposure_sigma * self.exposure_sigma)).exp()
            }
            Weighting::Linear => (1.0 - 2.0 * (v - 0.5).abs()).max(0.0),
            Weighting::Uniform => 1.0,
        }
    }
}

/// Per-pixel quality weight of one exposure
fn weight_map(img: &Rgb32FImage, luma: &GrayImage, config: &ExposureFusionConfig) -> Vec<f32> {
    let contrast = laplacian_filter(luma);
    img.enumerate_pixels()
        .map(|(x, y, px)| {
            let [r, g, b] = px.0;
            let c = f32::from(contrast.get_pixel(x, y).0[0].unsigned_abs()) / 255.0;
            let mean = (r + g + b) / 3.0;
            let s = (((r - mean).powi(2) + (g - mean).powi(2) + (b - mean).powi(2)) / 3.0).sqrt();
            let e = config.well_exposed(r) * config.well_exposed(g) * config.well_exposed(b);

            c.powf(config.contrast_weight) * s.powf(config.saturation_weight)
                * e.powf(config.exposure_weight)
                + WEIGHT_EPSILON
        })
        .collect()
}

/// Blend bracketed exposures in-process
///
/// The result is 16-bit only if every input is.
pub fn fuse_exposures(
    exposures: &[&DynamicImage],
    config: &ExposureFusionConfig,
) -> Result<DynamicImage, FusionError> {
    config.validate()?;
    let first = exposures.first().ok_or(FusionError::NoInputs)?;
    let expected = (first.width(), first.height());
    for (index, img) in exposures.iter().enumerate() {
        let actual = (img.width(), img.height());
        if actual != expected {
            return Err(FusionError::DimensionMismatch {
                index,
                expected,
                actual,
            });
        }
    }

    let depth = if exposures.iter().all(|img| BitDepth::of(img) == BitDepth::Sixteen) {
        BitDepth::Sixteen
    } else {
        BitDepth::Eight
    };

    let pixels: Vec<Rgb32FImage> = exposures.iter().map(|img| to_rgb_f32(img)).collect();
    let weights: Vec<Vec<f32>> = exposures
        .iter()
        .zip(&pixels)
        .map(|(img, px)| weight_map(px, &img.to_luma8(), config))
        .collect();

    let (width, height) = expected;
    let mut fused = Rgb32FImage::new(width, height);
    for (i, out) in fused.pixels_mut().enumerate() {
        let total: f32 = weights.iter().map(|w| w[i]).sum();
        let mut acc = [0.0f32; 3];
        for (img, w) in pixels.iter().zip(&weights) {
            let x = i as u32 % width;
            let y = i as u32 / width;
            let px = img.get_pixel(x, y).0;
            for c in 0..3 {
                acc[c] += px[c] * w[i] / total;
            }
        }
        out.0 = acc.map(|v| v.clamp(0.0, 1.0));
    }

    debug!("Fused {} exposure(s) at {}x{}", exposures.len(), width, height);
    Ok(from_rgb_f32(fused, depth))
}

/// Fuse files with an external `enfuse`-compatible tool
pub fn fuse_with_tool(
    tool: &ExternalTool,
    inputs: &[&Path],
    output: &Path,
) -> Result<(), FusionError> {
    if inputs.is_empty() {
        return Err(FusionError::NoInputs);
    }
    let mut args = vec![OsStr::new("-o"), output.as_os_str()];
    args.extend(inputs.iter().map(|p| p.as_os_str()));
    tool.run(args)?;
    Ok(())
}
