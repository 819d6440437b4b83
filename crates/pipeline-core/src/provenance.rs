//! `processing.json`: what a finished run did

use crate::error::PipelineError;
use crate::scan::PROCESSING_SENTINEL;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Counters for one stage of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub stage: String,
    pub plugin: String,
    /// Tasks handed to the worker pool
    pub submitted: usize,
    /// Outputs that already existed (lazy mode)
    pub skipped: usize,
    pub failed: usize,
    /// Buckets that never became full
    pub incomplete: usize,
}

impl StageStats {
    pub fn new(stage: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            plugin: plugin.into(),
            ..Self::default()
        }
    }
}

/// Provenance sentinel written into a scan directory after a successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// Version of the engine that produced the result
    pub version: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub source: PathBuf,
    pub final_directory: PathBuf,
    pub stages: Vec<StageStats>,
    /// Cells substituted by repair
    pub repaired: Vec<(u32, u32)>,
    pub uploaded: bool,
}

impl ProcessingRecord {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        let source = source.into();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started: now,
            finished: now,
            final_directory: source.clone(),
            source,
            stages: Vec::new(),
            repaired: Vec::new(),
            uploaded: false,
        }
    }

    /// Total tasks submitted across stages
    #[must_use]
    pub fn submitted(&self) -> usize {
        self.stages.iter().map(|s| s.submitted).sum()
    }

    /// Write `processing.json` into `dir`
    pub fn write(&self, dir: &Path) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(self)?;
        let target = dir.join(PROCESSING_SENTINEL);
        let partial = dir.join(format!(".{PROCESSING_SENTINEL}.partial"));
        fs::write(&partial, json)?;
        fs::rename(&partial, &target)?;
        Ok(())
    }

    /// Read `processing.json` from `dir`
    pub fn read(dir: &Path) -> Result<Self, PipelineError> {
        let contents = fs::read_to_string(dir.join(PROCESSING_SENTINEL))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = ProcessingRecord::new(dir.path());
        record.final_directory = dir.path().join("stacked");
        let mut stats = StageStats::new("stacked", "focus_stack");
        stats.submitted = 4;
        record.stages.push(stats);
        record.repaired.push((1, 1));

        record.write(dir.path()).unwrap();
        let back = ProcessingRecord::read(dir.path()).unwrap();

        assert_eq!(back, record);
        assert_eq!(back.submitted(), 4);
        assert!(!dir.path().join(".processing.json.partial").exists());
    }

    #[test]
    fn test_read_missing_record() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ProcessingRecord::read(dir.path()),
            Err(PipelineError::Io(_))
        ));
    }
}
