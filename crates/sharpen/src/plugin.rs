//! Plugin wrapper for sharpening

use crate::{sharpen, SharpenConfig};
use micrograph_pipeline_core::plugin::names;
use micrograph_pipeline_core::{
    check_arity, Arity, Context, ImageRead, ImageWrite, Plugin, PluginError, PluginFactory,
};
use tracing::debug;

pub struct SharpenPlugin {
    config: SharpenConfig,
}

impl SharpenPlugin {
    pub fn new(config: SharpenConfig) -> Self {
        Self { config }
    }
}

impl Plugin for SharpenPlugin {
    fn name(&self) -> &str {
        names::SHARPEN
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
        check_arity(Arity::Correction, inputs)?;
        let img = inputs[0].load()?;
        debug!("Sharpening {} -> {}", inputs[0].label(), output.label());
        output.store(sharpen(&img, &self.config))?;
        Ok(())
    }
}

pub struct SharpenFactory {
    config: SharpenConfig,
}

impl SharpenFactory {
    pub fn new(config: SharpenConfig) -> Result<Self, PluginError> {
        config
            .validate()
            .map_err(|e| PluginError::InvalidInput(e.to_string()))?;
        Ok(Self { config })
    }
}

impl PluginFactory for SharpenFactory {
    fn name(&self) -> &str {
        names::SHARPEN
    }

    fn description(&self) -> &str {
        "3x3 high-pass sharpening"
    }

    fn arity(&self) -> Arity {
        Arity::Correction
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(SharpenPlugin::new(self.config))
    }
}
