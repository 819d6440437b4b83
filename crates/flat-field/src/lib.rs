//! Flat-field correction against a calibration image
//!
//! The calibration image is a capture of an evenly illuminated, empty field.
//! Its per-channel brightness range is measured robustly (low and high
//! percentiles rather than true extremes, so dust and hot pixels do not
//! dominate) and each input pixel is scaled by
//!
//! ```text
//! out = clamp(in * high[c] / max(calibration[x, y, c], low[c]))
//! ```
//!
//! which lifts the vignetted corners up to the level of the bright centre.
//!
//! # Example
//! ```no_run
//! use micrograph_flat_field::{Calibration, FlatFieldConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let calibration = Calibration::load(&FlatFieldConfig::new("calibration/flat.tif"))?;
//! let tile = image::open("stacked/c000_r000.tif")?;
//! let corrected = calibration.apply(&tile)?;
//! corrected.save("flat_field/c000_r000.tif")?;
//! # Ok(())
//! # }
//! ```

pub mod plugin;

use image::{DynamicImage, Rgb32FImage};
use micrograph_common::image_io::{from_rgb_f32, load_image, to_rgb_f32, BitDepth};
use micrograph_common::ProcessingError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum FlatFieldError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Calibration is {expected:?} but the image is {actual:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

impl From<FlatFieldError> for ProcessingError {
    fn from(err: FlatFieldError) -> Self {
        match err {
            FlatFieldError::DimensionMismatch { expected, actual } => {
                ProcessingError::DimensionMismatch { expected, actual }
            }
            FlatFieldError::Processing(e) => e,
            other => ProcessingError::Other(other.to_string()),
        }
    }
}

/// Flat-field settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatFieldConfig {
    /// Calibration capture of an evenly illuminated field
    pub calibration: PathBuf,

    /// Percentile taken as the channel floor (default 1)
    #[serde(default = "default_low")]
    pub low_percentile: f32,

    /// Percentile taken as the channel maximum (default 99)
    #[serde(default = "default_high")]
    pub high_percentile: f32,
}

fn default_low() -> f32 {
    1.0
}

fn default_high() -> f32 {
    99.0
}

impl FlatFieldConfig {
    pub fn new(calibration: impl Into<PathBuf>) -> Self {
        Self {
            calibration: calibration.into(),
            low_percentile: default_low(),
            high_percentile: default_high(),
        }
    }

    pub fn validate(&self) -> Result<(), FlatFieldError> {
        let valid = (0.0..=100.0).contains(&self.low_percentile)
            && (0.0..=100.0).contains(&self.high_percentile)
            && self.low_percentile < self.high_percentile;
        if !valid {
            return Err(FlatFieldError::InvalidConfig(format!(
                "percentiles must satisfy 0 <= low < high <= 100, got {} and {}",
                self.low_percentile, self.high_percentile
            )));
        }
        Ok(())
    }
}

/// A measured calibration image, ready to correct tiles of the same size
#[derive(Debug, Clone)]
pub struct Calibration {
    image: Rgb32FImage,
    floor: [f32; 3],
    ceiling: [f32; 3],
}

impl Calibration {
    /// Load and measure the configured calibration image
    pub fn load(config: &FlatFieldConfig) -> Result<Self, FlatFieldError> {
        config.validate()?;
        let img = load_image(&config.calibration)?;
        let calibration = Self::from_image(&img, config.low_percentile, config.high_percentile);
        info!(
            "Loaded flat-field calibration {} ({}x{}, ceiling {:?})",
            config.calibration.display(),
            img.width(),
            img.height(),
            calibration.ceiling
        );
        Ok(calibration)
    }

    #[must_use]
    pub fn from_image(img: &DynamicImage, low_percentile: f32, high_percentile: f32) -> Self {
        let image = to_rgb_f32(img);
        let mut floor = [0.0; 3];
        let mut ceiling = [0.0; 3];
        for c in 0..3 {
            let mut samples: Vec<f32> = image.pixels().map(|p| p.0[c]).collect();
            floor[c] = percentile(&mut samples, low_percentile);
            ceiling[c] = percentile(&mut samples, high_percentile);
        }
        Self {
            image,
            floor,
            ceiling,
        }
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Per-channel (low, high) percentile brightness
    #[must_use]
    pub fn range(&self) -> ([f32; 3], [f32; 3]) {
        (self.floor, self.ceiling)
    }

    /// Correct `img`, which must have the calibration's dimensions
    pub fn apply(&self, img: &DynamicImage) -> Result<DynamicImage, FlatFieldError> {
        let expected = self.dimensions();
        let actual = (img.width(), img.height());
        if expected != actual {
            return Err(FlatFieldError::DimensionMismatch { expected, actual });
        }

        let mut pixels = to_rgb_f32(img);
        for (x, y, px) in pixels.enumerate_pixels_mut() {
            let cal = self.image.get_pixel(x, y).0;
            for c in 0..3 {
                let denominator = cal[c].max(self.floor[c]);
                if denominator > 0.0 {
                    px.0[c] = (px.0[c] * self.ceiling[c] / denominator).clamp(0.0, 1.0);
                }
            }
        }
        Ok(from_rgb_f32(pixels, BitDepth::of(img)))
    }
}

/// Nearest-rank percentile; reorders `samples`
fn percentile(samples: &mut [f32], pct: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * (samples.len() - 1) as f32).round() as usize;
    let rank = rank.min(samples.len() - 1);
    let (_, value, _) = samples.select_nth_unstable_by(rank, f32::total_cmp);
    *value
}
