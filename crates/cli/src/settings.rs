//! The `micrograph.yaml` configuration file

use anyhow::{Context as _, Result};
use format_conversion::ConversionConfig;
use micrograph_exposure_fusion::ExposureFusionConfig;
use micrograph_focus_stack::FocusStackConfig;
use micrograph_pipeline_core::PipelineConfig;
use micrograph_sharpen::SharpenConfig;
use micrograph_stabilization::StabilizationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Looked up in the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "micrograph.yaml";

/// Flat-field percentiles; the calibration image itself is `pipeline.flat_field`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatFieldSection {
    pub low_percentile: f32,
    pub high_percentile: f32,
}

impl Default for FlatFieldSection {
    fn default() -> Self {
        Self {
            low_percentile: 1.0,
            high_percentile: 99.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Searched for unprocessed scans when no directories are given
    pub scan_root: Option<PathBuf>,
    /// Pause between successive uploads, in seconds
    pub upload_delay_secs: u64,
    pub pipeline: PipelineConfig,
    pub exposure_fusion: ExposureFusionConfig,
    pub focus_stack: FocusStackConfig,
    pub stabilization: StabilizationConfig,
    pub flat_field: FlatFieldSection,
    pub sharpen: SharpenConfig,
    pub format_conversion: ConversionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_root: None,
            upload_delay_secs: 30,
            pipeline: PipelineConfig::default(),
            exposure_fusion: ExposureFusionConfig::default(),
            focus_stack: FocusStackConfig::default(),
            stabilization: StabilizationConfig::default(),
            flat_field: FlatFieldSection::default(),
            sharpen: SharpenConfig::default(),
            format_conversion: ConversionConfig::default(),
        }
    }
}

impl Settings {
    /// Read `path`, else `micrograph.yaml` if present, else built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.is_file() {
                    debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(contents)?;
        Ok(settings)
    }
}
