//! Process command: run the directory pipeline over one or more scans

use super::registry_helper::register_all_plugins;
use crate::settings::Settings;
use anyhow::{bail, Context as _, Result};
use clap::Args;
use micrograph_pipeline_core::{
    is_uploaded, CommandUploader, DirectoryOrchestrator, FailurePolicy, PipelineConfig,
    ProcessingRecord, Registry, Uploader, WorkerPool,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Args)]
pub struct ProcessCommand {
    /// Scan directories (default: every not-yet-uploaded scan under scan_root)
    #[arg(value_name = "DIRS")]
    dirs: Vec<PathBuf>,

    /// Root searched for scans when no directories are given
    #[arg(long)]
    scan_root: Option<PathBuf>,

    /// Convert and upload finished scans
    #[arg(long, overrides_with = "no_upload")]
    upload: bool,
    #[arg(long, overrides_with = "upload")]
    no_upload: bool,

    /// Skip outputs that already exist
    #[arg(long, overrides_with = "no_lazy")]
    lazy: bool,
    #[arg(long, overrides_with = "lazy")]
    no_lazy: bool,

    /// Patch missing grid cells from the middle focus depth
    #[arg(long, overrides_with = "no_fix")]
    fix: bool,
    #[arg(long, overrides_with = "fix")]
    no_fix: bool,

    /// Keep going past failed tasks and failed directories
    #[arg(long, overrides_with = "no_best_effort")]
    best_effort: bool,
    #[arg(long, overrides_with = "best_effort")]
    no_best_effort: bool,

    /// Worker threads (default: available parallelism)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Seconds to wait after an upload before starting the next scan
    #[arg(long, value_name = "SECS")]
    upload_delay: Option<u64>,

    /// Output format: text (default) or jsonl (JSON lines)
    #[arg(long, default_value = "text")]
    format: String,
}

/// `--flag` / `--no-flag` pair; `None` when neither was given
fn switch(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl ProcessCommand {
    pub fn execute(self, config: Option<&Path>) -> Result<()> {
        if self.format != "text" && self.format != "jsonl" {
            bail!("Unknown output format '{}', expected text or jsonl", self.format);
        }
        let settings = Settings::load(config)?;
        let pipeline = self.pipeline_config(&settings.pipeline);
        pipeline.validate().context("Invalid pipeline settings")?;

        let dirs = if self.dirs.is_empty() {
            let root = self
                .scan_root
                .clone()
                .or_else(|| settings.scan_root.clone())
                .context("No scan directories given and no scan_root configured")?;
            discover_scans(&root)?
        } else {
            self.dirs.clone()
        };
        if dirs.is_empty() {
            info!("Nothing to process");
            return Ok(());
        }

        let mut registry = Registry::new();
        register_all_plugins(&mut registry, &settings)?;

        let scratch = tempfile::Builder::new()
            .prefix("micrograph-")
            .tempdir()
            .context("Failed to create scratch directory")?;
        let mut pool = WorkerPool::new(Arc::new(registry), pipeline.workers, scratch.path())
            .context("Failed to start worker pool")?;

        let uploader = self.uploader(&pipeline);
        let policy = pipeline.policy;
        let upload_delay =
            Duration::from_secs(self.upload_delay.unwrap_or(settings.upload_delay_secs));
        let orchestrator = DirectoryOrchestrator::new(pool.dispatcher(), pipeline, uploader)
            .context("Failed to build pipeline")?;

        info!("=== Micrograph Process ===");
        info!("Scans: {}", dirs.len());
        info!("Workers: {}", pool.worker_count());

        let start_time = Instant::now();
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut previous_uploaded = false;

        for (i, dir) in dirs.iter().enumerate() {
            if previous_uploaded && !upload_delay.is_zero() {
                info!("Waiting {}s before the next scan", upload_delay.as_secs());
                thread::sleep(upload_delay);
            }

            let started = Instant::now();
            match orchestrator.run(dir) {
                Ok(record) => {
                    completed += 1;
                    previous_uploaded = record.uploaded;
                    self.report_success(i + 1, dirs.len(), &record, started.elapsed());
                }
                Err(e) => {
                    failed += 1;
                    previous_uploaded = false;
                    self.report_failure(i + 1, dirs.len(), dir, &e.to_string());
                    if policy == FailurePolicy::FailFast {
                        pool.stop();
                        return Err(e).with_context(|| format!("Failed to process {}", dir.display()));
                    }
                }
            }
        }
        pool.stop();

        let total_time = start_time.elapsed();
        if self.format == "jsonl" {
            println!(
                "{}",
                serde_json::json!({
                    "type": "summary",
                    "total_scans": dirs.len(),
                    "completed": completed,
                    "failed": failed,
                    "total_time_s": total_time.as_secs_f64(),
                })
            );
        } else {
            info!("=== Processing Complete ===");
            info!("Completed: {}", completed);
            info!("Failed: {}", failed);
            info!("Total time: {:.2}s", total_time.as_secs_f64());
        }
        Ok(())
    }

    /// File settings with command-line overrides applied
    fn pipeline_config(&self, base: &PipelineConfig) -> PipelineConfig {
        let mut config = base.clone();
        if let Some(upload) = switch(self.upload, self.no_upload) {
            config.upload.enabled = upload;
        }
        if let Some(lazy) = switch(self.lazy, self.no_lazy) {
            config.lazy = lazy;
        }
        if let Some(fix) = switch(self.fix, self.no_fix) {
            config.repair = fix;
        }
        if let Some(best_effort) = switch(self.best_effort, self.no_best_effort) {
            config.policy = if best_effort {
                FailurePolicy::BestEffort
            } else {
                FailurePolicy::FailFast
            };
        }
        if self.workers.is_some() {
            config.workers = self.workers;
        }
        config
    }

    fn uploader(&self, pipeline: &PipelineConfig) -> Option<Arc<dyn Uploader>> {
        if !pipeline.upload.enabled {
            return None;
        }
        match CommandUploader::from_config(&pipeline.upload) {
            Some(uploader) => Some(Arc::new(uploader) as Arc<dyn Uploader>),
            None => {
                warn!("Upload enabled but pipeline.upload.command is not set");
                None
            }
        }
    }

    fn report_success(&self, n: usize, total: usize, record: &ProcessingRecord, elapsed: Duration) {
        if self.format == "jsonl" {
            println!(
                "{}",
                serde_json::json!({
                    "type": "success",
                    "scan": record.source.display().to_string(),
                    "final_directory": record.final_directory.display().to_string(),
                    "tasks": record.submitted(),
                    "repaired": record.repaired,
                    "uploaded": record.uploaded,
                    "processing_time_ms": elapsed.as_millis(),
                })
            );
        } else {
            info!(
                "✓ [{}/{}] {} -> {} ({} task(s), {:.2}s{})",
                n,
                total,
                record.source.display(),
                record.final_directory.display(),
                record.submitted(),
                elapsed.as_secs_f64(),
                if record.uploaded { ", uploaded" } else { "" }
            );
        }
    }

    fn report_failure(&self, n: usize, total: usize, dir: &Path, message: &str) {
        if self.format == "jsonl" {
            println!(
                "{}",
                serde_json::json!({
                    "type": "error",
                    "scan": dir.display().to_string(),
                    "error": message,
                })
            );
        } else {
            error!("✗ [{}/{}] {} - FAILED: {}", n, total, dir.display(), message);
        }
    }
}

/// Immediate subdirectories of `root` that have not been uploaded, by name
pub fn discover_scans(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("Failed to list scan root {}", root.display()))?;

    let mut scans = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list scan root {}", root.display()))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !path.is_dir() {
            continue;
        }
        if is_uploaded(&path) {
            info!("Skipping {} (already uploaded)", path.display());
            continue;
        }
        scans.push(path);
    }
    scans.sort();
    Ok(scans)
}
