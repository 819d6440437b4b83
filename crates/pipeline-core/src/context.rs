//! Execution context for plugin operations

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How images reach the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// A complete scan directory already on disk
    Batch,

    /// Images appended while the capture is still running
    Streaming,

    /// A handful of in-memory images, result returned to the caller
    Snapshot,
}

/// Context passed to plugins during execution
#[derive(Debug, Clone)]
pub struct Context {
    /// Execution mode
    pub mode: ExecutionMode,

    /// Whether verbose logging is enabled
    pub verbose: bool,

    /// Private scratch directory of the running worker, if the plugin asked for one
    pub scratch_dir: Option<PathBuf>,
}

impl Context {
    /// Create a context for directory runs
    pub fn batch() -> Self {
        Self {
            mode: ExecutionMode::Batch,
            verbose: false,
            scratch_dir: None,
        }
    }

    /// Create a context for streaming runs
    pub fn streaming() -> Self {
        Self {
            mode: ExecutionMode::Streaming,
            verbose: false,
            scratch_dir: None,
        }
    }

    /// Create a context for snapshot requests
    pub fn snapshot() -> Self {
        Self {
            mode: ExecutionMode::Snapshot,
            verbose: false,
            scratch_dir: None,
        }
    }

    /// Create a context for a mode
    pub fn new(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Batch => Self::batch(),
            ExecutionMode::Streaming => Self::streaming(),
            ExecutionMode::Snapshot => Self::snapshot(),
        }
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Copy of this context bound to a worker's scratch directory
    #[must_use]
    pub fn with_scratch_dir(&self, dir: &Path) -> Self {
        let mut ctx = self.clone();
        ctx.scratch_dir = Some(dir.to_path_buf());
        ctx
    }
}
