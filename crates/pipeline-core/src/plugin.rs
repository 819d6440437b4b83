//! Plugin trait and related types

use crate::error::PluginError;
use crate::image_ref::{ImageRead, ImageWrite};
use crate::Context;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names the engine uses to look up the built-in stages
pub mod names {
    pub const EXPOSURE_FUSION: &str = "exposure_fusion";
    pub const FOCUS_STACK: &str = "focus_stack";
    pub const STABILIZATION: &str = "stabilization";
    pub const FLAT_FIELD: &str = "flat_field";
    pub const SHARPEN: &str = "sharpen";
    pub const FORMAT_CONVERSION: &str = "format_conversion";
}

/// How many images a plugin consumes per output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arity {
    /// N images in, one out
    Fusion,
    /// One image in, one out
    Correction,
}

impl Arity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Arity::Fusion => "N→1",
            Arity::Correction => "1→1",
        }
    }

    /// Whether `count` inputs are acceptable
    #[must_use]
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Fusion => count >= 1,
            Arity::Correction => count == 1,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single image transform
///
/// An instance is only ever driven by one worker at a time, so `run` takes
/// `&mut self` and implementations need not be `Sync`. Each worker builds its
/// own instances through the plugin's [`PluginFactory`].
pub trait Plugin: Send {
    /// Unique plugin identifier
    fn name(&self) -> &str;

    fn arity(&self) -> Arity;

    /// Whether the worker should provide a private scratch directory
    ///
    /// The directory is emptied before and after every call and passed as
    /// [`Context::scratch_dir`].
    fn needs_scratch(&self) -> bool {
        false
    }

    /// Execute the transform, writing exactly one image to `output`
    fn run(
        &mut self,
        ctx: &Context,
        inputs: &[ImageRead],
        output: &ImageWrite,
    ) -> Result<(), PluginError>;
}

/// Builds plugin instances from an immutable configuration
pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &str;

    /// One-line description shown by `micrograph-process plugins`
    fn description(&self) -> &str;

    fn arity(&self) -> Arity;

    /// A fresh instance for one worker
    fn create(&self) -> Box<dyn Plugin>;
}

/// Validate inputs shared by every plugin: at least one image, matching sizes
///
/// Returns the common dimensions.
pub fn check_inputs(inputs: &[ImageRead]) -> Result<(u32, u32), PluginError> {
    let first = inputs
        .first()
        .ok_or_else(|| PluginError::InvalidInput("no input images".to_string()))?;
    let expected = first.dimensions()?;

    for input in &inputs[1..] {
        let actual = input.dimensions()?;
        if actual != expected {
            return Err(PluginError::DimensionMismatch { expected, actual });
        }
    }

    Ok(expected)
}

/// Like [`check_inputs`] but also enforces the plugin's arity
pub fn check_arity(arity: Arity, inputs: &[ImageRead]) -> Result<(u32, u32), PluginError> {
    if inputs.is_empty() {
        return Err(PluginError::InvalidInput("no input images".to_string()));
    }
    if !arity.accepts(inputs.len()) {
        return Err(PluginError::InvalidInput(format!(
            "{arity} plugin given {} inputs",
            inputs.len()
        )));
    }
    check_inputs(inputs)
}
