//! Plugin wrapper for focus stacking

use crate::{focus_stack, focus_stack_with_tools, FocusStackConfig};
use image::DynamicImage;
use micrograph_common::ProcessingError;
use micrograph_pipeline_core::plugin::names;
use micrograph_pipeline_core::{
    check_arity, Arity, Context, ImageRead, ImageWrite, Plugin, PluginError, PluginFactory,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub struct FocusStackPlugin {
    config: Arc<FocusStackConfig>,
}

impl FocusStackPlugin {
    pub fn new(config: Arc<FocusStackConfig>) -> Self {
        Self { config }
    }

    fn uses_tools(&self) -> bool {
        self.config.enfuse.is_some()
    }
}

impl Plugin for FocusStackPlugin {
    fn name(&self) -> &str {
        names::FOCUS_STACK
    }

    fn arity(&self) -> Arity {
        Arity::Fusion
    }

    fn needs_scratch(&self) -> bool {
        self.uses_tools()
    }

    fn run(
        &mut self,
        ctx: &Context,
        inputs: &[ImageRead],
        output: &ImageWrite,
    ) -> Result<(), PluginError> {
        check_arity(Arity::Fusion, inputs)?;
        debug!("Focus stacking {} image(s) into {}", inputs.len(), output.label());

        if self.uses_tools() {
            let scratch = ctx.scratch_dir.as_deref().ok_or_else(|| {
                PluginError::ExecutionFailed("external stacking needs a scratch directory".to_string())
            })?;
            let paths = inputs
                .iter()
                .map(|input| input.path(scratch))
                .collect::<Result<Vec<PathBuf>, _>>()?;
            let refs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
            let target = output.external_path(scratch)?;

            focus_stack_with_tools(&self.config, &refs, &target, scratch)
                .map_err(ProcessingError::from)?;
            output.finish_external(&target)?;
            return Ok(());
        }

        let loaded = inputs
            .iter()
            .map(ImageRead::load)
            .collect::<Result<Vec<Arc<DynamicImage>>, _>>()?;
        let refs: Vec<&DynamicImage> = loaded.iter().map(|img| img.as_ref()).collect();
        let stacked = focus_stack(&refs, &self.config).map_err(ProcessingError::from)?;
        output.store(stacked)?;
        Ok(())
    }
}

pub struct FocusStackFactory {
    config: Arc<FocusStackConfig>,
}

impl FocusStackFactory {
    pub fn new(config: FocusStackConfig) -> Result<Self, PluginError> {
        config
            .validate()
            .map_err(|e| PluginError::InvalidInput(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
        })
    }
}

impl PluginFactory for FocusStackFactory {
    fn name(&self) -> &str {
        names::FOCUS_STACK
    }

    fn description(&self) -> &str {
        "Merge focus heights into one sharp tile"
    }

    fn arity(&self) -> Arity {
        Arity::Fusion
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(FocusStackPlugin::new(Arc::clone(&self.config)))
    }
}
