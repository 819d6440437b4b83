//! Directory orchestrator: process a complete scan already on disk
//!
//! Each stage reads the index of the previous stage's output directory, writes
//! into a fresh subdirectory, and is fully waited for before that subdirectory
//! is indexed for the next stage. A failed run leaves every stage directory in
//! place.

use super::Engine;
use crate::config::PipelineConfig;
use crate::context::Context;
use crate::dispatcher::Dispatcher;
use crate::error::{PipelineError, ScanError};
use crate::provenance::ProcessingRecord;
use crate::scan::{index_directory, Axis, ScanShape};
use crate::stage::{StageKind, StagePlan};
use crate::upload::Uploader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct DirectoryOrchestrator {
    engine: Engine,
}

impl DirectoryOrchestrator {
    pub fn new(
        dispatcher: Dispatcher,
        config: PipelineConfig,
        uploader: Option<Arc<dyn Uploader>>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            engine: Engine::new(dispatcher, config, uploader)?,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.engine.config
    }

    /// Run the whole pipeline on one scan directory
    pub fn run(&self, directory: &Path) -> Result<ProcessingRecord, PipelineError> {
        info!("Processing scan directory {}", directory.display());
        let mut record = ProcessingRecord::new(directory);

        let raw = index_directory(directory)?;
        if raw.is_empty() {
            return Err(ScanError::Empty(directory.to_path_buf()).into());
        }
        let expected = raw.shape();
        let plan = StagePlan::for_shape(&expected, &self.engine.config);
        plan.validate(self.engine.dispatcher.registry())?;
        self.log_skipped(&expected);

        let ctx = Context::batch();
        let last_fusion = plan.last_fusion();
        let mut repair_from = None;
        let mut current = raw;

        for (i, stage) in plan.stages().iter().enumerate() {
            if let StageKind::Fusion(axis) = stage.kind {
                if Some(i) == last_fusion {
                    repair_from = Some((current.directory().to_path_buf(), axis));
                }
            }

            let out_dir = current.directory().join(&stage.directory);
            let stats = self.engine.run_stage(stage, &current, &out_dir, &ctx)?;
            record.stages.push(stats);
            current = index_directory(&out_dir)?;
        }

        if !current.is_flat() {
            return Err(PipelineError::NotFlat(current.directory().to_path_buf()));
        }

        let final_dir = current.directory().to_path_buf();
        self.engine
            .finish(directory, &final_dir, expected, repair_from, &ctx, record)
    }

    fn log_skipped(&self, shape: &ScanShape) {
        for axis in [Axis::Stabilization, Axis::Hdr, Axis::Stack] {
            if shape.count(axis) == 0 {
                info!("Skipping {} fusion: scan does not vary in {}", axis, axis);
            }
        }
        if self.engine.config.flat_field.is_none() {
            info!("Skipping flat-field correction: no calibration image configured");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::dispatcher::WorkerPool;
    use crate::plugin::{names, Arity};
    use crate::scan::UPLOAD_MARKER;
    use crate::testing::{registry_with, write_stack_scan, write_tile, MockFactory};
    use crate::upload::is_uploaded;
    use micrograph_common::image_io::load_image;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        stack: Arc<MockFactory>,
        hdr: Arc<MockFactory>,
        sharpen: Arc<MockFactory>,
        convert: Arc<MockFactory>,
        pool: WorkerPool,
        _scratch: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let stack = MockFactory::new(names::FOCUS_STACK, Arity::Fusion);
        let hdr = MockFactory::new(names::EXPOSURE_FUSION, Arity::Fusion);
        let sharpen = MockFactory::new(names::SHARPEN, Arity::Correction);
        let convert = MockFactory::new(names::FORMAT_CONVERSION, Arity::Correction);
        let registry = registry_with(&[
            Arc::clone(&stack),
            Arc::clone(&hdr),
            Arc::clone(&sharpen),
            Arc::clone(&convert),
        ]);
        let scratch = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(registry, Some(3), scratch.path()).unwrap();
        Fixture {
            stack,
            hdr,
            sharpen,
            convert,
            pool,
            _scratch: scratch,
        }
    }

    fn no_upload() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.upload.enabled = false;
        config
    }

    struct RecordingUploader {
        calls: AtomicUsize,
        credentials: bool,
    }

    impl Uploader for RecordingUploader {
        fn has_credentials(&self) -> bool {
            self.credentials
        }

        fn upload(&self, directory: &Path) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let index = index_directory(directory)?;
            assert_eq!(index.formats(), vec![micrograph_common::ImageFormat::Jpg]);
            Ok(())
        }
    }

    #[test]
    fn test_stack_scan_becomes_flat() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 2, 2, 3);

        let orchestrator = DirectoryOrchestrator::new(fx.pool.dispatcher(), no_upload(), None).unwrap();
        let record = orchestrator.run(scan.path()).unwrap();

        let stacked = scan.path().join("stacked");
        assert_eq!(record.final_directory, stacked);
        let index = index_directory(&stacked).unwrap();
        assert!(index.is_flat());
        let names: Vec<&String> = index.images().keys().collect();
        assert_eq!(
            names,
            vec!["c000_r000.tif", "c000_r001.tif", "c001_r000.tif", "c001_r001.tif"]
        );
        assert_eq!(fx.stack.runs(), 4);
        assert_eq!(fx.hdr.runs(), 0);
        assert!(scan.path().join(crate::scan::PROCESSING_SENTINEL).exists());
    }

    #[test]
    fn test_lazy_rerun_does_no_work() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 2, 2, 3);
        let config = PipelineConfig {
            post_corrections: vec![names::SHARPEN.to_string()],
            ..no_upload()
        };
        let orchestrator = DirectoryOrchestrator::new(fx.pool.dispatcher(), config, None).unwrap();

        orchestrator.run(scan.path()).unwrap();
        let final_file = scan.path().join("stacked/post_sharpen/c001_r001.tif");
        let first = fs::read(&final_file).unwrap();
        let runs = fx.stack.runs() + fx.sharpen.runs();

        let record = orchestrator.run(scan.path()).unwrap();
        assert_eq!(fx.stack.runs() + fx.sharpen.runs(), runs);
        assert_eq!(record.submitted(), 0);
        assert_eq!(record.stages[0].skipped, 4);
        assert_eq!(fs::read(&final_file).unwrap(), first);
    }

    #[test]
    fn test_missing_cell_is_repaired_from_middle_depth() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 2, 2, 3);
        fs::remove_file(scan.path().join("c001_r001_z02.tif")).unwrap();

        let unrepaired = DirectoryOrchestrator::new(fx.pool.dispatcher(), no_upload(), None).unwrap();
        match unrepaired.run(scan.path()) {
            Err(PipelineError::Unhealthy { missing }) => assert_eq!(missing, vec![(1, 1)]),
            other => panic!("Expected Unhealthy, got {other:?}"),
        }

        let config = PipelineConfig {
            repair: true,
            ..no_upload()
        };
        let repairing = DirectoryOrchestrator::new(fx.pool.dispatcher(), config, None).unwrap();
        let record = repairing.run(scan.path()).unwrap();

        assert_eq!(record.repaired, vec![(1, 1)]);
        let repaired = load_image(scan.path().join("stacked/c001_r001.tif")).unwrap();
        // z01 was written with value 20
        assert_eq!(repaired.to_rgb8().get_pixel(0, 0).0, [20, 20, 20]);
    }

    #[test]
    fn test_full_rerun_does_not_trust_earlier_repair() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 2, 2, 3);
        fs::remove_file(scan.path().join("c001_r001_z02.tif")).unwrap();

        let config = PipelineConfig {
            repair: true,
            ..no_upload()
        };
        let repairing = DirectoryOrchestrator::new(fx.pool.dispatcher(), config, None).unwrap();
        assert_eq!(repairing.run(scan.path()).unwrap().repaired, vec![(1, 1)]);

        let config = PipelineConfig {
            lazy: false,
            ..no_upload()
        };
        let full = DirectoryOrchestrator::new(fx.pool.dispatcher(), config, None).unwrap();
        match full.run(scan.path()) {
            Err(PipelineError::Unhealthy { missing }) => assert_eq!(missing, vec![(1, 1)]),
            other => panic!("Expected Unhealthy, got {other:?}"),
        }
        assert_eq!(fx.stack.runs(), 6);
    }

    #[test]
    fn test_full_rerun_drops_outputs_of_vanished_inputs() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 2, 1, 2);
        let config = PipelineConfig {
            lazy: false,
            post_corrections: vec![names::SHARPEN.to_string()],
            ..no_upload()
        };
        let orchestrator = DirectoryOrchestrator::new(fx.pool.dispatcher(), config, None).unwrap();
        orchestrator.run(scan.path()).unwrap();

        fs::remove_file(scan.path().join("c001_r000_z00.tif")).unwrap();
        assert!(matches!(
            orchestrator.run(scan.path()),
            Err(PipelineError::Unhealthy { .. })
        ));
        assert!(!scan.path().join("stacked/c001_r000.tif").exists());
        assert!(!scan.path().join("stacked/post_sharpen/c001_r000.tif").exists());
    }

    #[test]
    fn test_lazy_rerun_rebuilds_repaired_cell() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 2, 2, 3);
        let late = scan.path().join("c001_r001_z02.tif");
        fs::remove_file(&late).unwrap();

        let config = PipelineConfig {
            repair: true,
            ..no_upload()
        };
        let repairing = DirectoryOrchestrator::new(fx.pool.dispatcher(), config, None).unwrap();
        repairing.run(scan.path()).unwrap();
        assert_eq!(fx.stack.runs(), 3);

        // the missing depth turns up after all
        write_tile(scan.path(), "c001_r001_z02.tif", 30);
        let lazy = DirectoryOrchestrator::new(fx.pool.dispatcher(), no_upload(), None).unwrap();
        let record = lazy.run(scan.path()).unwrap();

        assert!(record.repaired.is_empty());
        assert_eq!(record.stages[0].submitted, 1);
        assert_eq!(record.stages[0].skipped, 3);
        assert_eq!(fx.stack.runs(), 4);
        assert!(!scan.path().join("stacked").join(crate::health::REPAIR_LEDGER).exists());
    }

    #[test]
    fn test_fail_fast_aborts_and_keeps_intermediates() {
        let fx = fixture();
        fx.stack.fail_on("c000_r001.tif");
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 2, 2, 3);
        let config = PipelineConfig {
            post_corrections: vec![names::SHARPEN.to_string()],
            ..no_upload()
        };

        let orchestrator = DirectoryOrchestrator::new(fx.pool.dispatcher(), config, None).unwrap();
        match orchestrator.run(scan.path()) {
            Err(PipelineError::StageFailed { stage, failures }) => {
                assert_eq!(stage, "stacked");
                assert_eq!(failures.len(), 1);
            }
            other => panic!("Expected StageFailed, got {other:?}"),
        }
        assert_eq!(fx.sharpen.runs(), 0);
        assert!(scan.path().join("stacked/c000_r000.tif").exists());
        assert!(!scan.path().join(crate::scan::PROCESSING_SENTINEL).exists());
    }

    #[test]
    fn test_best_effort_continues_past_failures() {
        let fx = fixture();
        fx.stack.fail_on("c000_r001.tif");
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 2, 2, 3);
        let config = PipelineConfig {
            policy: FailurePolicy::BestEffort,
            repair: true,
            ..no_upload()
        };

        let orchestrator = DirectoryOrchestrator::new(fx.pool.dispatcher(), config, None).unwrap();
        let record = orchestrator.run(scan.path()).unwrap();

        assert_eq!(record.stages[0].failed, 1);
        assert_eq!(record.repaired, vec![(0, 1)]);
    }

    #[test]
    fn test_hdr_and_stack_nest_directories() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        for h in 0..2 {
            for z in 0..2 {
                write_tile(scan.path(), &format!("c000_r000_z{z:02}_h{h:02}.tif"), 50);
            }
        }

        let orchestrator = DirectoryOrchestrator::new(fx.pool.dispatcher(), no_upload(), None).unwrap();
        let record = orchestrator.run(scan.path()).unwrap();

        assert_eq!(record.final_directory, scan.path().join("exposure_fused/stacked"));
        assert_eq!(fx.hdr.runs(), 2);
        assert_eq!(fx.stack.runs(), 1);
        assert!(scan.path().join("exposure_fused/c000_r000_z01.tif").exists());
        assert!(scan.path().join("exposure_fused/stacked/c000_r000.tif").exists());
    }

    #[test]
    fn test_upload_converts_and_cleans_up() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 1, 2, 2);
        let uploader = Arc::new(RecordingUploader {
            calls: AtomicUsize::new(0),
            credentials: true,
        });

        let orchestrator = DirectoryOrchestrator::new(
            fx.pool.dispatcher(),
            PipelineConfig::default(),
            Some(Arc::clone(&uploader) as Arc<dyn Uploader>),
        )
        .unwrap();
        let record = orchestrator.run(scan.path()).unwrap();

        assert!(record.uploaded);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.convert.runs(), 2);
        let stacked = scan.path().join("stacked");
        assert!(!stacked.join("upload_jpg").exists());
        assert!(stacked.join(UPLOAD_MARKER).exists());
        assert!(is_uploaded(scan.path()));

        // a second run sees the marker and does not upload again
        orchestrator.run(scan.path()).unwrap();
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upload_skipped_without_credentials() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 1, 1, 2);
        let uploader = Arc::new(RecordingUploader {
            calls: AtomicUsize::new(0),
            credentials: false,
        });

        let orchestrator = DirectoryOrchestrator::new(
            fx.pool.dispatcher(),
            PipelineConfig::default(),
            Some(Arc::clone(&uploader) as Arc<dyn Uploader>),
        )
        .unwrap();
        let record = orchestrator.run(scan.path()).unwrap();

        assert!(!record.uploaded);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.convert.runs(), 0);
    }

    #[test]
    fn test_unknown_correction_rejected_up_front() {
        let fx = fixture();
        let config = PipelineConfig {
            post_corrections: vec!["vignette".to_string()],
            ..no_upload()
        };
        assert!(matches!(
            DirectoryOrchestrator::new(fx.pool.dispatcher(), config, None),
            Err(PipelineError::Registry(_))
        ));
    }

    #[test]
    fn test_malformed_scan_fails_before_any_work() {
        let fx = fixture();
        let scan = tempfile::tempdir().unwrap();
        write_stack_scan(scan.path(), 1, 1, 2);
        fs::write(scan.path().join("notes.txt"), b"focus was off").unwrap();

        let orchestrator = DirectoryOrchestrator::new(fx.pool.dispatcher(), no_upload(), None).unwrap();
        assert!(matches!(
            orchestrator.run(scan.path()),
            Err(PipelineError::Scan(ScanError::MalformedFilename(_)))
        ));
        assert_eq!(fx.stack.runs(), 0);
    }
}
