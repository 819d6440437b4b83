//! Snapshot orchestrator: fuse and correct a few in-memory images
//!
//! Nothing touches the scan tree. Every step writes to an in-memory
//! [`ImageWrite`] and the final image is returned to the caller.

use super::Engine;
use crate::barrier::TaskBarrier;
use crate::config::PipelineConfig;
use crate::context::Context;
use crate::dispatcher::{Dispatcher, TaskRequest};
use crate::error::{PipelineError, PluginError, TaskFailure};
use crate::image_ref::{ImageRead, ImageWrite};
use crate::plugin::Arity;
use crate::scan::Axis;
use crate::stage::{Stage, StagePlan};
use image::DynamicImage;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub struct SnapshotOrchestrator {
    engine: Engine,
    corrections: StagePlan,
}

impl SnapshotOrchestrator {
    pub fn new(dispatcher: Dispatcher, mut config: PipelineConfig) -> Result<Self, PipelineError> {
        // snapshots are returned to the caller, never uploaded
        config.upload.enabled = false;
        let engine = Engine::new(dispatcher, config, None)?;
        let corrections = StagePlan::corrections_only(&engine.config);
        corrections.validate(engine.dispatcher.registry())?;
        Ok(Self {
            engine,
            corrections,
        })
    }

    /// Fuse `images` along `axis` (if more than one) and apply the post-fusion corrections
    pub fn process(
        &self,
        images: Vec<DynamicImage>,
        axis: Axis,
    ) -> Result<DynamicImage, PipelineError> {
        if images.is_empty() {
            return Err(PluginError::InvalidInput("snapshot needs at least one image".to_string()).into());
        }
        info!("Snapshot: {} image(s), {} correction(s)", images.len(), self.corrections.stages().len());

        let mut current = if images.len() == 1 {
            images.into_iter().next().ok_or_else(|| {
                PluginError::InvalidInput("snapshot needs at least one image".to_string())
            })?
        } else {
            let fusion = Stage::fusion(axis, self.engine.config.working_format);
            self.engine
                .dispatcher
                .registry()
                .require([fusion.plugin.as_str()], Arity::Fusion)?;
            self.run_one(&fusion.plugin, images)?
        };

        for stage in self.corrections.stages() {
            current = self.run_one(&stage.plugin, vec![current])?;
        }
        Ok(current)
    }

    /// Fuse a focus stack and correct it
    pub fn process_stack(&self, images: Vec<DynamicImage>) -> Result<DynamicImage, PipelineError> {
        self.process(images, Axis::Stack)
    }

    fn run_one(&self, plugin: &str, images: Vec<DynamicImage>) -> Result<DynamicImage, PipelineError> {
        debug!("Snapshot: running {} on {} image(s)", plugin, images.len());
        let output = Arc::new(ImageWrite::in_memory());
        let barrier = TaskBarrier::new();
        let failure: Arc<Mutex<Option<TaskFailure>>> = Arc::new(Mutex::new(None));

        let sink = Arc::clone(&failure);
        let request = TaskRequest::new(
            plugin,
            images.into_iter().map(ImageRead::from_image).collect(),
            Arc::clone(&output),
        )
        .with_context(Context::snapshot())
        .with_barrier(&barrier)
        .on_complete(move |report| {
            *sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = report.into_failure();
        });
        self.engine.dispatcher.submit(request)?;
        barrier.wait(self.engine.config.barrier_timeout())?;

        let failed = failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(failure) = failed {
            return Err(PipelineError::StageFailed {
                stage: plugin.to_string(),
                failures: vec![failure],
            });
        }

        output.take().ok_or_else(|| {
            PluginError::ExecutionFailed(format!("{plugin} did not produce an image")).into()
        })
    }
}
