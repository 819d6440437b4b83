//! Hand-off to the upload collaborator

use crate::config::UploadConfig;
use crate::error::PipelineError;
use crate::scan::UPLOAD_MARKER;
use chrono::{DateTime, Utc};
use micrograph_common::tool::ExternalTool;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Receives finished, flat, JPEG scan directories
pub trait Uploader: Send + Sync {
    /// Whether an upload could be attempted at all
    fn has_credentials(&self) -> bool;

    fn upload(&self, directory: &Path) -> Result<(), PipelineError>;
}

/// Uploads by running a configured command with the directory appended
#[derive(Debug, Clone)]
pub struct CommandUploader {
    tool: ExternalTool,
    credentials: Option<PathBuf>,
}

impl CommandUploader {
    pub fn new(tool: ExternalTool, credentials: Option<PathBuf>) -> Self {
        Self { tool, credentials }
    }

    /// Build from the `upload` config section, `None` if no command is set
    pub fn from_config(config: &UploadConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|tool| Self::new(tool.clone(), config.credentials.clone()))
    }
}

impl Uploader for CommandUploader {
    fn has_credentials(&self) -> bool {
        match &self.credentials {
            Some(path) => path.is_file(),
            None => true,
        }
    }

    fn upload(&self, directory: &Path) -> Result<(), PipelineError> {
        info!("Uploading {} via {}", directory.display(), self.tool.program);
        self.tool
            .run([directory.as_os_str()])
            .map_err(|e| PipelineError::Upload(e.to_string()))
    }
}

/// Contents of the upload marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMarker {
    pub uploaded_at: DateTime<Utc>,
    pub directory: PathBuf,
}

/// Record that `directory` has been uploaded
pub fn write_upload_marker(directory: &Path) -> Result<(), PipelineError> {
    let marker = UploadMarker {
        uploaded_at: Utc::now(),
        directory: directory.to_path_buf(),
    };
    fs::write(
        directory.join(UPLOAD_MARKER),
        serde_json::to_string_pretty(&marker)?,
    )?;
    debug!("Wrote upload marker in {}", directory.display());
    Ok(())
}

/// Whether `directory` or any stage directory below it carries an upload marker
#[must_use]
pub fn is_uploaded(directory: &Path) -> bool {
    if directory.join(UPLOAD_MARKER).is_file() {
        return true;
    }
    let Ok(entries) = fs::read_dir(directory) else {
        return false;
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .any(|e| is_uploaded(&e.path()))
}
