//! Error types for the plugin system and the pipeline engine

use micrograph_common::ProcessingError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Image dimensions differ: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Plugin execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Plugin panicked: {0}")]
    Panicked(String),

    #[error("Task cancelled before it started")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Processing(ProcessingError),
}

impl From<ProcessingError> for PluginError {
    fn from(err: ProcessingError) -> Self {
        match err {
            ProcessingError::DimensionMismatch { expected, actual } => {
                PluginError::DimensionMismatch { expected, actual }
            }
            ProcessingError::IoError(e) => PluginError::Io(e),
            other => PluginError::Processing(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No plugin registered under the name '{0}'")]
    UnknownPlugin(String),

    #[error("A plugin named '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("Plugin '{name}' is {actual}, but this stage needs {expected}")]
    ArityMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("File name does not follow the tile grammar: {0}")]
    MalformedFilename(String),

    #[error("Scan mixes tile variants: {first} and {other} vary in different axes")]
    Inhomogeneous { first: String, other: String },

    #[error("Two files describe the same tile: {0} and {1}")]
    DuplicateTile(String, String),

    #[error("No tiles found in {0}")]
    Empty(PathBuf),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A task that did not produce its output
#[derive(Debug)]
pub struct TaskFailure {
    pub plugin: String,
    pub target: String,
    pub error: PluginError,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}: {}", self.plugin, self.target, self.error)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Timed out after {timeout:?} waiting for tasks ({completed}/{allocated} done)")]
    BarrierTimeout {
        timeout: Duration,
        allocated: usize,
        completed: usize,
    },

    #[error("Stage '{stage}' failed for {} task(s); first: {}", .failures.len(), first_failure(.failures))]
    StageFailed {
        stage: String,
        failures: Vec<TaskFailure>,
    },

    #[error("Output grid is missing {} cell(s): {missing:?}", .missing.len())]
    Unhealthy { missing: Vec<(u32, u32)> },

    #[error("Expected a flat scan in {0}, but tiles still vary in stack/exposure/stabilization")]
    NotFlat(PathBuf),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Worker pool has stopped")]
    PoolStopped,

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

fn first_failure(failures: &[TaskFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}

impl PipelineError {
    /// True for the barrier deadline case, as opposed to a plugin failure
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::BarrierTimeout { .. })
    }
}
