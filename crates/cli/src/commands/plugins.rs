//! Plugins listing command

use super::registry_helper::register_all_plugins;
use crate::settings::Settings;
use anyhow::Result;
use micrograph_pipeline_core::Registry;
use std::path::Path;

pub fn list_plugins(config: Option<&Path>) -> Result<()> {
    let settings = Settings::load(config)?;
    let mut registry = Registry::new();
    register_all_plugins(&mut registry, &settings)?;

    println!("Available plugins:");
    for info in registry.describe() {
        println!("\n{}", info.name);
        println!("  Description: {}", info.description);
        println!("  Arity: {}", info.arity);
    }

    if settings.pipeline.flat_field.is_none() {
        println!("\n(flat_field is available once pipeline.flat_field names a calibration image)");
    }

    Ok(())
}
