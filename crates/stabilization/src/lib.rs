//! Noise stabilization across repeated captures of one tile
//!
//! Every output sample is the median of the corresponding samples of the
//! inputs, computed on the integer values so the result is bitwise identical
//! for identical inputs. With an even number of frames the two middle values
//! are averaged and rounded down.

pub mod plugin;

use image::{DynamicImage, ImageBuffer, Pixel, Rgb};
use micrograph_common::image_io::BitDepth;
use micrograph_common::ProcessingError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StabilizationError {
    #[error("No frames to stabilize")]
    NoFrames,

    #[error("Frame {index} is {actual:?}, expected {expected:?}")]
    DimensionMismatch {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

impl From<StabilizationError> for ProcessingError {
    fn from(err: StabilizationError) -> Self {
        match err {
            StabilizationError::DimensionMismatch {
                expected, actual, ..
            } => ProcessingError::DimensionMismatch { expected, actual },
            other => ProcessingError::Other(other.to_string()),
        }
    }
}

/// Per-sample estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimator {
    /// Robust against transient artifacts (dust, cosmic hits)
    #[default]
    Median,
    /// Plain average, rounded down
    Mean,
}

/// The `stabilization` config section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    pub estimator: Estimator,
}

/// Combine repeated frames into one
///
/// The output is 16-bit only if every frame is.
pub fn stabilize(
    frames: &[&DynamicImage],
    config: &StabilizationConfig,
) -> Result<DynamicImage, StabilizationError> {
    let first = frames.first().ok_or(StabilizationError::NoFrames)?;
    let expected = (first.width(), first.height());
    for (index, frame) in frames.iter().enumerate() {
        let actual = (frame.width(), frame.height());
        if actual != expected {
            return Err(StabilizationError::DimensionMismatch {
                index,
                expected,
                actual,
            });
        }
    }

    let all_sixteen = frames.iter().all(|f| BitDepth::of(f) == BitDepth::Sixteen);
    if all_sixteen {
        let buffers: Vec<_> = frames.iter().map(|f| f.to_rgb16()).collect();
        Ok(DynamicImage::ImageRgb16(combine(&buffers, config.estimator)))
    } else {
        let buffers: Vec<_> = frames.iter().map(|f| f.to_rgb8()).collect();
        Ok(DynamicImage::ImageRgb8(combine(&buffers, config.estimator)))
    }
}

fn combine<T>(buffers: &[ImageBuffer<Rgb<T>, Vec<T>>], estimator: Estimator) -> ImageBuffer<Rgb<T>, Vec<T>>
where
    T: image::Primitive + Into<u32> + TryFrom<u32>,
    Rgb<T>: Pixel<Subpixel = T>,
{
    let (width, height) = buffers[0].dimensions();
    let mut samples: Vec<u32> = Vec::with_capacity(buffers.len());

    ImageBuffer::from_fn(width, height, |x, y| {
        let mut out = [T::DEFAULT_MIN_VALUE; 3];
        for (c, slot) in out.iter_mut().enumerate() {
            samples.clear();
            samples.extend(buffers.iter().map(|b| b.get_pixel(x, y).0[c].into()));
            let value = match estimator {
                Estimator::Median => median(&mut samples),
                Estimator::Mean => mean(&samples),
            };
            // a median or mean never exceeds the largest input sample
            *slot = T::try_from(value).unwrap_or(T::DEFAULT_MAX_VALUE);
        }
        Rgb(out)
    })
}

/// Integer median, flooring the mean of the middle pair for even counts
fn median(samples: &mut [u32]) -> u32 {
    samples.sort_unstable();
    let n = samples.len();
    if n == 0 {
        return 0;
    }
    if n % 2 == 1 {
        samples[n / 2]
    } else {
        (samples[n / 2 - 1] + samples[n / 2]) / 2
    }
}

fn mean(samples: &[u32]) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    let sum: u64 = samples.iter().map(|&v| u64::from(v)).sum();
    (sum / samples.len() as u64) as u32
}
