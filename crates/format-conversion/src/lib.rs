//! Format conversion for finished tiles
//!
//! Re-encodes a flat result into the format the upload collaborator accepts
//! (JPEG). 16-bit TIFF input is reduced to 8 bits per channel on the way.
//!
//! # Example
//! ```no_run
//! use format_conversion::{convert_format, ConversionConfig};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let result = convert_format(
//!     Path::new("stacked/c000_r000.tif"),
//!     Path::new("stacked/upload_jpg/c000_r000.jpg"),
//!     &ConversionConfig { jpeg_quality: 90 },
//! )?;
//! println!("{:.1}% of the original size", result.compression_ratio * 100.0);
//! # Ok(())
//! # }
//! ```

pub mod plugin;

use micrograph_common::image_io::{load_image, save_image_with_quality, DEFAULT_JPEG_QUALITY};
use micrograph_common::{ImageFormat, ProcessingError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors specific to format conversion
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<ConversionError> for ProcessingError {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::Processing(e) => e,
            ConversionError::IoError(e) => ProcessingError::IoError(e),
            other => ProcessingError::Other(other.to_string()),
        }
    }
}

/// Conversion settings, the `format_conversion` config section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl ConversionConfig {
    pub fn validate(&self) -> Result<(), ConversionError> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConversionError::InvalidConfig(format!(
                "jpeg_quality must be 1-100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

/// Conversion result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub input_size: u64,
    pub output_size: u64,
    /// Output size / input size
    pub compression_ratio: f64,
    pub format: ImageFormat,
}

/// Re-encode `input` into the format implied by `output`'s extension
pub fn convert_format(
    input: &Path,
    output: &Path,
    config: &ConversionConfig,
) -> Result<ConversionResult, ConversionError> {
    config.validate()?;
    let format = ImageFormat::of_path(output).ok_or_else(|| {
        ConversionError::UnsupportedFormat(output.display().to_string())
    })?;

    let img = load_image(input)?;
    save_image_with_quality(&img, output, format, config.jpeg_quality)?;

    let input_size = std::fs::metadata(input)?.len();
    let output_size = std::fs::metadata(output)?.len();
    let compression_ratio = if input_size > 0 {
        output_size as f64 / input_size as f64
    } else {
        0.0
    };
    debug!(
        "Converted {} -> {} ({} -> {} bytes)",
        input.display(),
        output.display(),
        input_size,
        output_size
    );

    Ok(ConversionResult {
        input_size,
        output_size,
        compression_ratio,
        format,
    })
}
