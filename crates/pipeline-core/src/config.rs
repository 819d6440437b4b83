//! Pipeline configuration

use crate::error::PipelineError;
use micrograph_common::tool::ExternalTool;
use micrograph_common::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a failed task does to the rest of a directory run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the directory after the stage that failed
    #[default]
    FailFast,
    /// Log failures and carry on with whatever was produced
    BestEffort,
}

/// Where flat-field correction sits relative to the post-corrections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionOrder {
    /// Post-corrections first, flat-field on their output
    #[default]
    FlatFieldLast,
    /// Flat-field first, so post-corrections see corrected pixels
    FlatFieldFirst,
}

/// Upload hand-off settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Whether to hand finished scans to the uploader at all
    pub enabled: bool,
    /// Format the upload collaborator accepts
    pub format: ImageFormat,
    /// Command run with the directory to upload appended
    pub command: Option<ExternalTool>,
    /// Credentials file; uploads are skipped while it is absent
    pub credentials: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: ImageFormat::Jpg,
            command: None,
            credentials: None,
        }
    }
}

/// Engine configuration, the `pipeline` section of the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Format of intermediate stage outputs
    pub working_format: ImageFormat,
    /// Worker threads; `None` uses available parallelism
    pub workers: Option<usize>,
    /// Per-stage barrier deadline in seconds; `None` waits forever
    pub barrier_timeout_secs: Option<u64>,
    /// Skip buckets whose output already exists
    pub lazy: bool,
    /// Patch missing grid cells from the raw scan
    pub repair: bool,
    pub policy: FailurePolicy,
    /// 1→1 plugins run on every raw image before any fusion
    pub pre_corrections: Vec<String>,
    /// 1→1 plugins run on every fused image
    pub post_corrections: Vec<String>,
    /// Calibration image enabling flat-field correction
    pub flat_field: Option<PathBuf>,
    pub correction_order: CorrectionOrder,
    pub upload: UploadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            working_format: ImageFormat::Tif,
            workers: None,
            barrier_timeout_secs: None,
            lazy: true,
            repair: false,
            policy: FailurePolicy::FailFast,
            pre_corrections: Vec::new(),
            post_corrections: Vec::new(),
            flat_field: None,
            correction_order: CorrectionOrder::FlatFieldLast,
            upload: UploadConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a YAML file holding just this section
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn barrier_timeout(&self) -> Option<Duration> {
        self.barrier_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.workers == Some(0) {
            return Err(PipelineError::Config("workers must be at least 1".to_string()));
        }
        if self.upload.enabled && self.upload.format != ImageFormat::Jpg {
            return Err(PipelineError::Config(format!(
                "the uploader only accepts jpg, not {}",
                self.upload.format
            )));
        }
        if let Some(path) = &self.flat_field {
            if !path.is_file() {
                return Err(PipelineError::Config(format!(
                    "flat-field calibration image {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.working_format, ImageFormat::Tif);
        assert_eq!(config.upload.format, ImageFormat::Jpg);
        assert!(config.lazy);
        assert!(!config.repair);
        assert_eq!(config.policy, FailurePolicy::FailFast);
        assert_eq!(config.correction_order, CorrectionOrder::FlatFieldLast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
working_format: jpg
policy: best_effort
post_corrections: [sharpen]
correction_order: flat_field_first
barrier_timeout_secs: 600
upload:
  command:
    program: upload-scan
    args: [--bucket, scans]
  credentials: /etc/micrograph/upload.key
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.working_format, ImageFormat::Jpg);
        assert_eq!(config.policy, FailurePolicy::BestEffort);
        assert_eq!(config.post_corrections, vec!["sharpen".to_string()]);
        assert_eq!(config.correction_order, CorrectionOrder::FlatFieldFirst);
        assert_eq!(config.barrier_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(
            config.upload.command,
            Some(ExternalTool {
                program: "upload-scan".to_string(),
                args: vec!["--bucket".to_string(), "scans".to_string()],
            })
        );
        assert_eq!(config.upload.format, ImageFormat::Jpg);
        assert!(config.upload.enabled);
        assert!(config.lazy);
    }

    #[test]
    fn test_validation() {
        let config = PipelineConfig {
            workers: Some(0),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        let config = PipelineConfig {
            flat_field: Some(PathBuf::from("/nonexistent/calibration.tif")),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
