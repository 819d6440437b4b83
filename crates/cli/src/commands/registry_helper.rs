//! Shared helper to register every built-in plugin

use crate::settings::Settings;
use anyhow::{Context, Result};
use format_conversion::plugin::FormatConversionFactory;
use micrograph_exposure_fusion::plugin::ExposureFusionFactory;
use micrograph_flat_field::plugin::FlatFieldFactory;
use micrograph_flat_field::FlatFieldConfig;
use micrograph_focus_stack::plugin::FocusStackFactory;
use micrograph_pipeline_core::Registry;
use micrograph_sharpen::plugin::SharpenFactory;
use micrograph_stabilization::plugin::StabilizationFactory;
use std::sync::Arc;
use tracing::debug;

/// Register the plugins configured by `settings`
///
/// Flat-field correction is only registered when a calibration image is
/// configured, since it cannot be built without one.
pub fn register_all_plugins(registry: &mut Registry, settings: &Settings) -> Result<()> {
    registry.register(Arc::new(
        ExposureFusionFactory::new(settings.exposure_fusion.clone())
            .context("Invalid exposure_fusion settings")?,
    ))?;
    registry.register(Arc::new(
        FocusStackFactory::new(settings.focus_stack.clone())
            .context("Invalid focus_stack settings")?,
    ))?;
    registry.register(Arc::new(StabilizationFactory::new(settings.stabilization)))?;
    registry.register(Arc::new(
        SharpenFactory::new(settings.sharpen).context("Invalid sharpen settings")?,
    ))?;
    registry.register(Arc::new(
        FormatConversionFactory::new(settings.format_conversion)
            .context("Invalid format_conversion settings")?,
    ))?;

    if let Some(calibration) = &settings.pipeline.flat_field {
        let config = FlatFieldConfig {
            calibration: calibration.clone(),
            low_percentile: settings.flat_field.low_percentile,
            high_percentile: settings.flat_field.high_percentile,
        };
        registry.register(Arc::new(FlatFieldFactory::new(&config).with_context(|| {
            format!("Failed to load flat-field calibration {}", calibration.display())
        })?))?;
    }

    debug!("Registered plugins: {:?}", registry.plugin_names());
    Ok(())
}
