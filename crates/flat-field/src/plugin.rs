//! Plugin wrapper for flat-field correction

use crate::{Calibration, FlatFieldConfig, FlatFieldError};
use micrograph_common::ProcessingError;
use micrograph_pipeline_core::plugin::names;
use micrograph_pipeline_core::{
    check_arity, Arity, Context, ImageRead, ImageWrite, Plugin, PluginError, PluginFactory,
};
use std::sync::Arc;
use tracing::debug;

/// Corrects one tile against a shared calibration
pub struct FlatFieldPlugin {
    calibration: Arc<Calibration>,
}

impl FlatFieldPlugin {
    pub fn new(calibration: Arc<Calibration>) -> Self {
        Self { calibration }
    }
}

impl Plugin for FlatFieldPlugin {
    fn name(&self) -> &str {
        names::FLAT_FIELD
    }

    fn arity(&self) -> Arity {
        Arity::Correction
    }

    fn run(
        &mut self,
        _ctx: &Context,
        inputs: &[ImageRead],
        output: &ImageWrite,
    ) -> Result<(), PluginError> {
        let actual = check_arity(Arity::Correction, inputs)?;
        // checked from the header, before any pixel is decoded or written
        let expected = self.calibration.dimensions();
        if actual != expected {
            return Err(PluginError::DimensionMismatch { expected, actual });
        }

        let img = inputs[0].load()?;
        let corrected = self
            .calibration
            .apply(&img)
            .map_err(|e| PluginError::from(ProcessingError::from(e)))?;
        debug!("Flat-field corrected {}", inputs[0].label());
        output.store(corrected)?;
        Ok(())
    }
}

/// Loads the calibration image once and shares it across workers
pub struct FlatFieldFactory {
    calibration: Arc<Calibration>,
}

impl FlatFieldFactory {
    pub fn new(config: &FlatFieldConfig) -> Result<Self, PluginError> {
        let calibration = Calibration::load(config).map_err(|e| match e {
            FlatFieldError::InvalidConfig(msg) => PluginError::InvalidInput(msg),
            other => PluginError::from(ProcessingError::from(other)),
        })?;
        Ok(Self::from_calibration(calibration))
    }

    pub fn from_calibration(calibration: Calibration) -> Self {
        Self {
            calibration: Arc::new(calibration),
        }
    }
}

impl PluginFactory for FlatFieldFactory {
    fn name(&self) -> &str {
        names::FLAT_FIELD
    }

    fn description(&self) -> &str {
        "Divide out uneven illumination using a calibration image"
    }

    fn arity(&self) -> Arity {
        Arity::Correction
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(FlatFieldPlugin::new(Arc::clone(&self.calibration)))
    }
}
