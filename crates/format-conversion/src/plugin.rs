//! Plugin wrapper for format conversion module

use crate::{convert_format, ConversionConfig};
use micrograph_pipeline_core::plugin::names;
use micrograph_pipeline_core::{
    check_arity, Arity, Context, ImageRead, ImageWrite, Plugin, PluginError, PluginFactory,
};
use tracing::info;

/// Format conversion plugin implementation
pub struct FormatConversionPlugin {
    config: ConversionConfig,
}

impl FormatConversionPlugin {
    pub fn new(config: ConversionConfig) -> Self {
        Self { config }
    }
}

impl Plugin for FormatConversionPlugin {
    fn name(&self) -> &str {
        names::FORMAT_CONVERSION
    }

    fn arity(&self) -> Arity {
        Arity::Correction
    }

    fn run(
        &mut self,
        ctx: &Context,
        inputs: &[ImageRead],
        output: &ImageWrite,
    ) -> Result<(), PluginError> {
        check_arity(Arity::Correction, inputs)?;
        let input = &inputs[0];

        // file to file: convert directly so the size ratio can be reported
        if let (Some(src), Some(dst)) = (input.source_path(), output.target_path()) {
            let result = convert_format(src, dst, &self.config)
                .map_err(|e| PluginError::ExecutionFailed(format!("Format conversion failed: {e}")))?;
            if ctx.verbose {
                info!(
                    "Converted {} to {} ({:.1}% size)",
                    input.label(),
                    result.format,
                    result.compression_ratio * 100.0
                );
            }
            return Ok(());
        }

        let img = input.load()?;
        output.store_with_quality((*img).clone(), self.config.jpeg_quality)?;
        Ok(())
    }
}

/// Builds [`FormatConversionPlugin`]s
pub struct FormatConversionFactory {
    config: ConversionConfig,
}

impl FormatConversionFactory {
    pub fn new(config: ConversionConfig) -> Result<Self, PluginError> {
        config
            .validate()
            .map_err(|e| PluginError::InvalidInput(e.to_string()))?;
        Ok(Self { config })
    }
}

impl PluginFactory for FormatConversionFactory {
    fn name(&self) -> &str {
        names::FORMAT_CONVERSION
    }

    fn description(&self) -> &str {
        "Re-encode a tile into the upload format"
    }

    fn arity(&self) -> Arity {
        Arity::Correction
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(FormatConversionPlugin::new(self.config))
    }
}
