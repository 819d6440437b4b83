//! Image I/O utilities shared by the plugins and the engine
//!
//! Tiles arrive as 8-bit JPEG or 8/16-bit TIFF. Plugins work in normalized
//! `f32` and hand results back at the bit depth of their inputs, so a 16-bit
//! capture survives the whole pipeline until the final JPEG conversion.
//!
//! Writes are atomic: the encoded image lands in a hidden sibling file which is
//! renamed over the target only once encoding has succeeded.

use crate::{ImageFormat, ProcessingError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb32FImage};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default JPEG quality used when nothing else is configured
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Sample depth of an image, used to round-trip through `f32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Eight,
    Sixteen,
}

impl BitDepth {
    /// Depth of a decoded image (float images are written back as 16-bit)
    #[must_use]
    pub fn of(img: &DynamicImage) -> Self {
        match img {
            DynamicImage::ImageLuma8(_)
            | DynamicImage::ImageLumaA8(_)
            | DynamicImage::ImageRgb8(_)
            | DynamicImage::ImageRgba8(_) => Self::Eight,
            _ => Self::Sixteen,
        }
    }

    /// Lowest common depth of a set of images
    #[must_use]
    pub fn common(images: &[DynamicImage]) -> Self {
        if images.iter().all(|img| Self::of(img) == Self::Sixteen) {
            Self::Sixteen
        } else {
            Self::Eight
        }
    }
}

/// Load an image from disk
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();
    image::open(path).map_err(|e| {
        ProcessingError::ImageError(format!("Failed to load {}: {e}", path.display()))
    })
}

/// Read only the header of an image to get its dimensions
pub fn image_dimensions<P: AsRef<Path>>(path: P) -> Result<(u32, u32)> {
    let path = path.as_ref();
    image::image_dimensions(path).map_err(|e| {
        ProcessingError::ImageError(format!("Failed to read header of {}: {e}", path.display()))
    })
}

/// Convert to normalized RGB `f32` (0.0..=1.0)
#[must_use]
pub fn to_rgb_f32(img: &DynamicImage) -> Rgb32FImage {
    img.to_rgb32f()
}

/// Convert normalized RGB `f32` back to an integer image of the given depth
#[must_use]
pub fn from_rgb_f32(img: Rgb32FImage, depth: BitDepth) -> DynamicImage {
    let float = DynamicImage::ImageRgb32F(img);
    match depth {
        BitDepth::Eight => DynamicImage::ImageRgb8(float.to_rgb8()),
        BitDepth::Sixteen => DynamicImage::ImageRgb16(float.to_rgb16()),
    }
}

/// Fail unless `actual` matches `expected`
pub fn ensure_dimensions(expected: (u32, u32), actual: (u32, u32)) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ProcessingError::DimensionMismatch { expected, actual })
    }
}

/// Hidden sibling used while an atomic write is in progress
///
/// The extension is kept last so external tools that pick their encoder from
/// the file name still write the right format.
#[must_use]
pub fn partial_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    match target.extension() {
        Some(ext) => target.with_file_name(format!(".{stem}.partial.{}", ext.to_string_lossy())),
        None => target.with_file_name(format!(".{stem}.partial")),
    }
}

/// Encode `img` in `format` and atomically place it at `target`
pub fn save_image_atomic(img: &DynamicImage, target: &Path, format: ImageFormat) -> Result<()> {
    save_image_with_quality(img, target, format, DEFAULT_JPEG_QUALITY)
}

/// Like [`save_image_atomic`] with an explicit JPEG quality
pub fn save_image_with_quality(
    img: &DynamicImage,
    target: &Path,
    format: ImageFormat,
    jpeg_quality: u8,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let partial = partial_path(target);
    let written = write_encoded(img, &partial, format, jpeg_quality);
    if let Err(e) = written {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    fs::rename(&partial, target)?;
    debug!("Wrote {} ({})", target.display(), format);
    Ok(())
}

fn write_encoded(img: &DynamicImage, path: &Path, format: ImageFormat, quality: u8) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    match format {
        ImageFormat::Jpg => {
            // JPEG is 8-bit only
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
            rgb.write_with_encoder(encoder)?;
        }
        ImageFormat::Tif => match img {
            DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
                DynamicImage::ImageRgb16(img.to_rgb16()).write_to(&mut writer, format.codec())?;
            }
            _ => img.write_to(&mut writer, format.codec())?,
        },
    }
    // BufWriter swallows flush errors on drop
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}
