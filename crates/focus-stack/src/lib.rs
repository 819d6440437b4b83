//! Focus stacking: combine captures at several focus heights into one sharp tile
//!
//! The native backend measures sharpness as the magnitude of the Laplacian of
//! a lightly blurred luminance image and takes every output pixel from the
//! input that is sharpest there. Captures can first be aligned to the middle
//! one by an integer translation search, which absorbs stage drift between
//! focus steps.
//!
//! With `enfuse` configured the stack is fused externally (optionally after
//! `align_image_stack`).

pub mod plugin;

use image::{DynamicImage, GrayImage, Rgb32FImage};
use imageproc::filter::{gaussian_blur_f32, laplacian_filter};
use micrograph_common::image_io::{from_rgb_f32, to_rgb_f32, BitDepth};
use micrograph_common::tool::ExternalTool;
use micrograph_common::ProcessingError;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Arguments that turn `enfuse` into a focus stacker
const ENFUSE_FOCUS_ARGS: [&str; 4] = [
    "--exposure-weight=0",
    "--saturation-weight=0",
    "--contrast-weight=1",
    "--hard-mask",
];

const ALIGNED_PREFIX: &str = "aligned_";

#[derive(Error, Debug)]
pub enum FocusStackError {
    #[error("No images to stack")]
    NoInputs,

    #[error("Image {index} is {actual:?}, expected {expected:?}")]
    DimensionMismatch {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} produced no aligned images")]
    AlignmentFailed(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FocusStackError> for ProcessingError {
    fn from(err: FocusStackError) -> Self {
        match err {
            FocusStackError::DimensionMismatch {
                expected, actual, ..
            } => ProcessingError::DimensionMismatch { expected, actual },
            FocusStackError::Processing(e) => e,
            FocusStackError::Io(e) => ProcessingError::IoError(e),
            other => ProcessingError::Other(other.to_string()),
        }
    }
}

/// The `focus_stack` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusStackConfig {
    /// Gaussian blur applied before the Laplacian, suppresses sensor noise
    pub blur_sigma: f32,

    /// Align every capture to the middle one before stacking
    pub align: bool,

    /// Largest translation (pixels) tried by the alignment search
    pub max_shift: u32,

    /// Stack with this tool instead of in-process
    pub enfuse: Option<ExternalTool>,

    /// Run before `enfuse` when `align` is set
    pub align_image_stack: Option<ExternalTool>,
}

impl Default for FocusStackConfig {
    fn default() -> Self {
        Self {
            blur_sigma: 1.0,
            align: false,
            max_shift: 8,
            enfuse: None,
            align_image_stack: None,
        }
    }
}

impl FocusStackConfig {
    pub fn validate(&self) -> Result<(), FocusStackError> {
        if self.blur_sigma.is_nan() || self.blur_sigma <= 0.0 {
            return Err(FocusStackError::InvalidConfig(format!(
                "blur_sigma must be positive, got {}",
                self.blur_sigma
            )));
        }
        if self.align_image_stack.is_some() && self.enfuse.is_none() {
            return Err(FocusStackError::InvalidConfig(
                "align_image_stack is only used together with enfuse".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-pixel sharpness: |Laplacian| of the blurred luminance
#[must_use]
pub fn sharpness_map(img: &DynamicImage, blur_sigma: f32) -> Vec<u16> {
    let blurred = gaussian_blur_f32(&img.to_luma8(), blur_sigma);
    laplacian_filter(&blurred)
        .pixels()
        .map(|p| p.0[0].unsigned_abs())
        .collect()
}

/// Integer translation `(dx, dy)` that best maps `moving` onto `reference`
///
/// Sampling `moving` at `(x + dx, y + dy)` reproduces `reference` at `(x, y)`.
#[must_use]
pub fn estimate_shift(reference: &GrayImage, moving: &GrayImage, max_shift: u32) -> (i32, i32) {
    let (width, height) = reference.dimensions();
    let max = max_shift as i32;
    let mut shifts: Vec<(i32, i32)> = (-max..=max)
        .flat_map(|dy| (-max..=max).map(move |dx| (dx, dy)))
        .collect();
    // on equal scores the smallest shift wins
    shifts.sort_by_key(|(dx, dy)| dx.abs() + dy.abs());

    let mut best = (0, 0);
    let mut best_score = f64::MAX;
    for (dx, dy) in shifts {
        let x0 = (-dx).max(0) as u32;
        let y0 = (-dy).max(0) as u32;
        let x1 = (width as i32 - dx.max(0)).max(0) as u32;
        let y1 = (height as i32 - dy.max(0)).max(0) as u32;
        if x1 <= x0 || y1 <= y0 {
            continue;
        }

        let mut sum = 0u64;
        for y in y0..y1 {
            for x in x0..x1 {
                let a = reference.get_pixel(x, y).0[0];
                let b = moving
                    .get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)
                    .0[0];
                sum += u64::from(a.abs_diff(b));
            }
        }
        let area = u64::from(x1 - x0) * u64::from(y1 - y0);
        let score = sum as f64 / area as f64;
        if score < best_score {
            best_score = score;
            best = (dx, dy);
        }
    }
    best
}

/// Resample `img` by an integer translation, replicating edge pixels
#[must_use]
pub fn translate(img: &Rgb32FImage, shift: (i32, i32)) -> Rgb32FImage {
    let (width, height) = img.dimensions();
    let max_x = width as i32 - 1;
    let max_y = height as i32 - 1;
    Rgb32FImage::from_fn(width, height, |x, y| {
        let sx = (x as i32 + shift.0).clamp(0, max_x) as u32;
        let sy = (y as i32 + shift.1).clamp(0, max_y) as u32;
        *img.get_pixel(sx, sy)
    })
}

/// Stack in-process
///
/// The result is 16-bit only if every input is.
pub fn focus_stack(
    images: &[&DynamicImage],
    config: &FocusStackConfig,
) -> Result<DynamicImage, FocusStackError> {
    config.validate()?;
    let first = images.first().ok_or(FocusStackError::NoInputs)?;
    let expected = (first.width(), first.height());
    for (index, img) in images.iter().enumerate() {
        let actual = (img.width(), img.height());
        if actual != expected {
            return Err(FocusStackError::DimensionMismatch {
                index,
                expected,
                actual,
            });
        }
    }
    let depth = if images.iter().all(|img| BitDepth::of(img) == BitDepth::Sixteen) {
        BitDepth::Sixteen
    } else {
        BitDepth::Eight
    };

    let mut pixels: Vec<Rgb32FImage> = images.iter().map(|img| to_rgb_f32(img)).collect();
    let mut sharpness: Vec<Vec<u16>> = Vec::with_capacity(images.len());

    if config.align && images.len() > 1 {
        let reference_index = images.len() / 2;
        let reference = images[reference_index].to_luma8();
        for (index, img) in images.iter().enumerate() {
            if index == reference_index {
                sharpness.push(sharpness_map(img, config.blur_sigma));
                continue;
            }
            let shift = estimate_shift(&reference, &img.to_luma8(), config.max_shift);
            if shift != (0, 0) {
                debug!("Aligning image {} by {:?}", index, shift);
                pixels[index] = translate(&pixels[index], shift);
            }
            let aligned = DynamicImage::ImageRgb32F(pixels[index].clone());
            sharpness.push(sharpness_map(&aligned, config.blur_sigma));
        }
    } else {
        sharpness.extend(images.iter().map(|img| sharpness_map(img, config.blur_sigma)));
    }

    let (width, _) = expected;
    let mut stacked = Rgb32FImage::new(expected.0, expected.1);
    for (i, out) in stacked.pixels_mut().enumerate() {
        // first maximum wins, so equal sharpness resolves to the lowest depth
        let mut chosen = 0;
        for (index, map) in sharpness.iter().enumerate().skip(1) {
            if map[i] > sharpness[chosen][i] {
                chosen = index;
            }
        }
        let x = i as u32 % width;
        let y = i as u32 / width;
        *out = *pixels[chosen].get_pixel(x, y);
    }

    Ok(from_rgb_f32(stacked, depth))
}

/// Stack files with external tools, writing the result to `output`
///
/// Intermediate aligned images are written into `scratch`.
pub fn focus_stack_with_tools(
    config: &FocusStackConfig,
    inputs: &[&Path],
    output: &Path,
    scratch: &Path,
) -> Result<(), FocusStackError> {
    let enfuse = config.enfuse.as_ref().ok_or_else(|| {
        FocusStackError::InvalidConfig("no enfuse tool configured".to_string())
    })?;
    if inputs.is_empty() {
        return Err(FocusStackError::NoInputs);
    }

    let mut sources: Vec<PathBuf> = inputs.iter().map(|p| p.to_path_buf()).collect();
    if config.align {
        if let Some(aligner) = &config.align_image_stack {
            sources = align_with_tool(aligner, inputs, scratch)?;
        }
    }

    let mut args: Vec<OsString> = ENFUSE_FOCUS_ARGS.iter().map(OsString::from).collect();
    args.push("-o".into());
    args.push(output.as_os_str().to_owned());
    args.extend(sources.into_iter().map(PathBuf::into_os_string));
    enfuse.run(args)?;
    info!("Focus stacked {} image(s) into {}", inputs.len(), output.display());
    Ok(())
}

fn align_with_tool(
    aligner: &ExternalTool,
    inputs: &[&Path],
    scratch: &Path,
) -> Result<Vec<PathBuf>, FocusStackError> {
    fs::create_dir_all(scratch)?;
    let prefix = scratch.join(ALIGNED_PREFIX);
    let mut args: Vec<OsString> = vec!["-m".into(), "-a".into(), prefix.into_os_string()];
    args.extend(inputs.iter().map(|p| p.as_os_str().to_owned()));
    aligner.run(args)?;

    let mut aligned: Vec<PathBuf> = fs::read_dir(scratch)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(ALIGNED_PREFIX))
        })
        .collect();
    aligned.sort();
    if aligned.is_empty() {
        return Err(FocusStackError::AlignmentFailed(aligner.program.clone()));
    }
    Ok(aligned)
}
