//! Pipeline orchestrators
//!
//! - [`DirectoryOrchestrator`]: a complete scan already on disk
//! - [`StreamingOrchestrator`]: tiles appended while the capture runs
//! - [`SnapshotOrchestrator`]: a few in-memory images, result returned directly
//!
//! All three submit through a [`Dispatcher`] and share the tail of a run
//! (health inspection, repair, conversion, upload, provenance).

pub mod directory;
pub mod snapshot;
pub mod streaming;

pub use directory::DirectoryOrchestrator;
pub use snapshot::SnapshotOrchestrator;
pub use streaming::StreamingOrchestrator;

use crate::config::{FailurePolicy, PipelineConfig};
use crate::context::Context;
use crate::dispatcher::{Dispatcher, TaskRequest};
use crate::error::{PipelineError, TaskFailure};
use crate::health;
use crate::image_ref::{ImageRead, ImageWrite};
use crate::plugin::{names, Arity};
use crate::provenance::{ProcessingRecord, StageStats};
use crate::scan::{bucket, index_directory, Axis, ScanIndex, ScanShape, UPLOAD_MARKER};
use crate::stage::{Stage, StageKind};
use crate::barrier::TaskBarrier;
use crate::upload::{write_upload_marker, Uploader};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// State shared by every orchestrator
#[derive(Clone)]
pub(crate) struct Engine {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) uploader: Option<Arc<dyn Uploader>>,
}

impl Engine {
    /// Validate the configuration against the registry
    ///
    /// Every correction named in the config must exist before anything runs.
    pub(crate) fn new(
        dispatcher: Dispatcher,
        config: PipelineConfig,
        uploader: Option<Arc<dyn Uploader>>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let registry = dispatcher.registry();
        registry.require(
            config.pre_corrections.iter().map(String::as_str),
            Arity::Correction,
        )?;
        registry.require(
            config.post_corrections.iter().map(String::as_str),
            Arity::Correction,
        )?;
        if config.flat_field.is_some() {
            registry.require([names::FLAT_FIELD], Arity::Correction)?;
        }
        if config.upload.enabled && config.working_format != config.upload.format {
            registry.require([names::FORMAT_CONVERSION], Arity::Correction)?;
        }

        Ok(Self {
            dispatcher,
            config: Arc::new(config),
            uploader,
        })
    }

    /// Create the output directory of a stage
    ///
    /// A lazy run keeps earlier outputs but drops earlier repair substitutes.
    /// Otherwise the directory, with every later stage nested in it, starts empty.
    pub(crate) fn prepare_stage_dir(&self, out_dir: &Path) -> Result<(), PipelineError> {
        if self.config.lazy {
            fs::create_dir_all(out_dir)?;
            health::discard_repairs(out_dir)?;
            return Ok(());
        }
        match fs::remove_dir_all(out_dir) {
            Ok(()) => debug!("Cleared previous outputs in {}", out_dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(out_dir)?;
        Ok(())
    }

    /// Run one stage over a complete input index and wait for it
    pub(crate) fn run_stage(
        &self,
        stage: &Stage,
        input: &ScanIndex,
        out_dir: &Path,
        ctx: &Context,
    ) -> Result<StageStats, PipelineError> {
        info!(
            "Stage {}: {} images from {}",
            stage,
            input.len(),
            input.directory().display()
        );
        self.prepare_stage_dir(out_dir)?;

        let mut stats = StageStats::new(&stage.directory, &stage.plugin);
        let jobs: Vec<(Vec<PathBuf>, String)> = match stage.kind {
            StageKind::Correction => input
                .images()
                .values()
                .map(|t| (vec![t.path.clone()], stage.output_name(&t.tile)))
                .collect(),
            StageKind::Fusion(axis) => {
                let buckets = bucket(input, axis);
                for (key, members) in buckets.partial_buckets() {
                    warn!(
                        "Bucket {} has {}/{} {} variants, skipping",
                        key,
                        members.len(),
                        buckets.expected(),
                        axis
                    );
                    stats.incomplete += 1;
                }
                buckets
                    .full_buckets()
                    .map(|(key, members)| {
                        let paths = members.values().map(|t| t.path.clone()).collect();
                        (paths, stage.output_name(key))
                    })
                    .collect()
            }
        };

        let barrier = TaskBarrier::new();
        let failures: Arc<Mutex<Vec<TaskFailure>>> = Arc::new(Mutex::new(Vec::new()));

        for (inputs, name) in jobs {
            let target = out_dir.join(&name);
            if self.config.lazy && target.exists() {
                debug!("Lazy skip: {} already exists", target.display());
                stats.skipped += 1;
                continue;
            }

            let sink = Arc::clone(&failures);
            let request = TaskRequest::new(
                stage.plugin.as_str(),
                inputs.into_iter().map(ImageRead::from_path).collect(),
                Arc::new(ImageWrite::to_path(target)),
            )
            .with_context(ctx.clone())
            .with_barrier(&barrier)
            .on_complete(move |report| {
                if let Some(failure) = report.into_failure() {
                    sink.lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(failure);
                }
            });
            self.dispatcher.submit(request)?;
            stats.submitted += 1;
        }

        info!(
            "Stage {}: submitted {}, lazily skipped {}",
            stage.directory, stats.submitted, stats.skipped
        );
        barrier.wait(self.config.barrier_timeout())?;

        let failures = std::mem::take(
            &mut *failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        stats.failed = failures.len();
        self.apply_policy(&stage.directory, failures)?;
        Ok(stats)
    }

    /// Abort or log, depending on the failure policy
    pub(crate) fn apply_policy(
        &self,
        stage: &str,
        failures: Vec<TaskFailure>,
    ) -> Result<(), PipelineError> {
        if failures.is_empty() {
            return Ok(());
        }
        match self.config.policy {
            FailurePolicy::FailFast => Err(PipelineError::StageFailed {
                stage: stage.to_string(),
                failures,
            }),
            FailurePolicy::BestEffort => {
                for failure in &failures {
                    error!("Stage {}: {}", stage, failure);
                }
                warn!(
                    "Stage {}: continuing past {} failure(s)",
                    stage,
                    failures.len()
                );
                Ok(())
            }
        }
    }

    /// Health, repair, upload and provenance for a finished stage chain
    pub(crate) fn finish(
        &self,
        source: &Path,
        final_dir: &Path,
        expected: ScanShape,
        repair_from: Option<(PathBuf, Axis)>,
        ctx: &Context,
        mut record: ProcessingRecord,
    ) -> Result<ProcessingRecord, PipelineError> {
        record.final_directory = final_dir.to_path_buf();

        let index = index_directory(final_dir)?;
        let mut missing = health::inspect(&index, expected.cols, expected.rows)?;

        if missing.is_empty() {
            info!(
                "Health check passed: {}x{} grid complete",
                expected.cols, expected.rows
            );
        } else {
            warn!("Health check: {} missing cell(s): {:?}", missing.len(), missing);
            if self.config.repair {
                match &repair_from {
                    Some((dir, axis)) => {
                        let source_index = index_directory(dir)?;
                        record.repaired = health::repair(
                            &missing,
                            &source_index,
                            *axis,
                            final_dir,
                            self.config.working_format,
                        )?;
                    }
                    None => warn!("Nothing to repair from: the scan had no fused axis"),
                }
                let index = index_directory(final_dir)?;
                missing = health::inspect(&index, expected.cols, expected.rows)?;
            }
            if !missing.is_empty() {
                return Err(PipelineError::Unhealthy { missing });
            }
        }

        if self.config.upload.enabled {
            record.uploaded = self.hand_off(final_dir, expected, ctx)?;
        } else {
            info!("Upload not requested");
        }

        record.finished = chrono::Utc::now();
        record.write(source)?;
        info!(
            "Finished {}: result in {}",
            source.display(),
            final_dir.display()
        );
        Ok(record)
    }

    /// Convert if needed and upload; `Ok(false)` when skipped
    fn hand_off(
        &self,
        final_dir: &Path,
        expected: ScanShape,
        ctx: &Context,
    ) -> Result<bool, PipelineError> {
        if final_dir.join(UPLOAD_MARKER).is_file() {
            info!("{} already uploaded", final_dir.display());
            return Ok(true);
        }
        let Some(uploader) = &self.uploader else {
            warn!("No uploader configured, skipping upload");
            return Ok(false);
        };
        if !uploader.has_credentials() {
            warn!("Upload credentials missing, skipping upload");
            return Ok(false);
        }

        let format = self.config.upload.format;
        let index = index_directory(final_dir)?;
        let needs_conversion = index.formats() != [format];

        let upload_dir = if needs_conversion {
            let stage = Stage::conversion(format);
            let dir = final_dir.join(&stage.directory);
            if let Err(e) = self.run_stage(&stage, &index, &dir, ctx) {
                remove_temporary(&dir);
                return Err(e);
            }
            dir
        } else {
            final_dir.to_path_buf()
        };

        let result = self.upload_checked(uploader.as_ref(), &upload_dir, expected);
        if needs_conversion {
            remove_temporary(&upload_dir);
        }
        result?;

        write_upload_marker(final_dir)?;
        Ok(true)
    }

    fn upload_checked(
        &self,
        uploader: &dyn Uploader,
        dir: &Path,
        expected: ScanShape,
    ) -> Result<(), PipelineError> {
        let index = index_directory(dir)?;
        let missing = health::inspect(&index, expected.cols, expected.rows)?;
        if !missing.is_empty() {
            return Err(PipelineError::Unhealthy { missing });
        }
        uploader.upload(dir)
    }
}

fn remove_temporary(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!("Failed to remove {}: {}", dir.display(), e);
    }
}
