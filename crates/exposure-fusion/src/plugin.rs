//! Plugin wrapper for exposure fusion

use crate::{fuse_exposures, fuse_with_tool, ExposureFusionConfig};
use image::DynamicImage;
use micrograph_common::tool::ExternalTool;
use micrograph_common::ProcessingError;
use micrograph_pipeline_core::plugin::names;
use micrograph_pipeline_core::{
    check_arity, Arity, Context, ImageRead, ImageWrite, Plugin, PluginError, PluginFactory,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub struct ExposureFusionPlugin {
    config: Arc<ExposureFusionConfig>,
}

impl ExposureFusionPlugin {
    pub fn new(config: Arc<ExposureFusionConfig>) -> Self {
        Self { config }
    }

    fn run_native(&self, inputs: &[ImageRead], output: &ImageWrite) -> Result<(), PluginError> {
        let loaded = inputs
            .iter()
            .map(ImageRead::load)
            .collect::<Result<Vec<Arc<DynamicImage>>, _>>()?;
        let refs: Vec<&DynamicImage> = loaded.iter().map(|img| img.as_ref()).collect();
        let fused = fuse_exposures(&refs, &self.config).map_err(ProcessingError::from)?;
        output.store(fused)?;
        Ok(())
    }

    fn run_external(
        tool: &ExternalTool,
        ctx: &Context,
        inputs: &[ImageRead],
        output: &ImageWrite,
    ) -> Result<(), PluginError> {
        let scratch = ctx.scratch_dir.as_deref().ok_or_else(|| {
            PluginError::ExecutionFailed("external fusion needs a scratch directory".to_string())
        })?;

        let paths = inputs
            .iter()
            .map(|input| input.path(scratch))
            .collect::<Result<Vec<PathBuf>, _>>()?;
        let refs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        let target = output.external_path(scratch)?;

        fuse_with_tool(tool, &refs, &target).map_err(ProcessingError::from)?;
        output.finish_external(&target)?;
        Ok(())
    }
}

impl Plugin for ExposureFusionPlugin {
    fn name(&self) -> &str {
        names::EXPOSURE_FUSION
    }

    fn arity(&self) -> Arity {
        Arity::Fusion
    }

    fn needs_scratch(&self) -> bool {
        self.config.enfuse.is_some()
    }

    fn run(
        &mut self,
        ctx: &Context,
        inputs: &[ImageRead],
        output: &ImageWrite,
    ) -> Result<(), PluginError> {
        check_arity(Arity::Fusion, inputs)?;
        debug!(
            "Exposure fusion of {} input(s) into {}",
            inputs.len(),
            output.label()
        );
        match &self.config.enfuse {
            Some(tool) => Self::run_external(tool, ctx, inputs, output),
            None => self.run_native(inputs, output),
        }
    }
}

pub struct ExposureFusionFactory {
    config: Arc<ExposureFusionConfig>,
}

impl ExposureFusionFactory {
    pub fn new(config: ExposureFusionConfig) -> Result<Self, PluginError> {
        config
            .validate()
            .map_err(|e| PluginError::InvalidInput(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
        })
    }
}

impl PluginFactory for ExposureFusionFactory {
    fn name(&self) -> &str {
        names::EXPOSURE_FUSION
    }

    fn description(&self) -> &str {
        "Blend bracketed exposures into one well-exposed tile"
    }

    fn arity(&self) -> Arity {
        Arity::Fusion
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(ExposureFusionPlugin::new(Arc::clone(&self.config)))
    }
}
