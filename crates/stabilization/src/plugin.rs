//! Plugin wrapper for noise stabilization

use crate::{stabilize, StabilizationConfig};
use image::DynamicImage;
use micrograph_common::ProcessingError;
use micrograph_pipeline_core::plugin::names;
use micrograph_pipeline_core::{
    check_arity, Arity, Context, ImageRead, ImageWrite, Plugin, PluginError, PluginFactory,
};
use std::sync::Arc;
use tracing::debug;

pub struct StabilizationPlugin {
    config: StabilizationConfig,
}

impl StabilizationPlugin {
    pub fn new(config: StabilizationConfig) -> Self {
        Self { config }
    }
}

impl Plugin for StabilizationPlugin {
    fn name(&self) -> &str {
        names::STABILIZATION
    }

    fn arity(&self) -> Arity {
        Arity::Fusion
    }

    fn run(
        &mut self,
        _ctx: &Context,
        inputs: &[ImageRead],
        output: &ImageWrite,
    ) -> Result<(), PluginError> {
        check_arity(Arity::Fusion, inputs)?;
        let frames = inputs
            .iter()
            .map(ImageRead::load)
            .collect::<Result<Vec<Arc<DynamicImage>>, _>>()?;
        let refs: Vec<&DynamicImage> = frames.iter().map(|f| f.as_ref()).collect();

        let result = stabilize(&refs, &self.config).map_err(ProcessingError::from)?;
        debug!(
            "Stabilized {} frame(s) into {}",
            inputs.len(),
            output.label()
        );
        output.store(result)?;
        Ok(())
    }
}

pub struct StabilizationFactory {
    config: StabilizationConfig,
}

impl StabilizationFactory {
    pub fn new(config: StabilizationConfig) -> Self {
        Self { config }
    }
}

impl PluginFactory for StabilizationFactory {
    fn name(&self) -> &str {
        names::STABILIZATION
    }

    fn description(&self) -> &str {
        "Per-pixel median of repeated captures"
    }

    fn arity(&self) -> Arity {
        Arity::Fusion
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(StabilizationPlugin::new(self.config))
    }
}
