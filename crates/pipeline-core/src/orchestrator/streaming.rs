//! Streaming orchestrator: process tiles while the capture is still running
//!
//! Tiles are appended one at a time. Each lands in the first stage; a fusion
//! stage submits a bucket the moment it is full, and a finished task feeds its
//! output into the next stage from its completion callback. The next stage's
//! barrier ticket is taken inside that callback, before the finishing task
//! completes its own ticket, so waiting on the stage barriers in order is
//! enough to know everything downstream has been submitted.
//!
//! Under fail-fast the first failed task stops all further submissions; work
//! already queued still runs.

use super::Engine;
use crate::barrier::TaskBarrier;
use crate::config::{FailurePolicy, PipelineConfig};
use crate::context::Context;
use crate::dispatcher::{Dispatcher, TaskRequest};
use crate::error::{PipelineError, PluginError, ScanError, TaskFailure};
use crate::image_ref::{ImageRead, ImageWrite};
use crate::provenance::{ProcessingRecord, StageStats};
use crate::scan::{Axis, Bucket, IndexedTile, ScanShape, TileRef};
use crate::stage::{StageKind, StagePlan};
use crate::upload::Uploader;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mutable state of one stage
struct StageState {
    bucket: Option<Bucket>,
    submitted: BTreeSet<TileRef>,
    stats: StageStats,
    failures: Vec<TaskFailure>,
}

struct Shared {
    engine: Engine,
    source: PathBuf,
    shape: ScanShape,
    plan: StagePlan,
    dirs: Vec<PathBuf>,
    stages: Vec<Mutex<StageState>>,
    barriers: Vec<TaskBarrier>,
    capture_done: AtomicBool,
    /// Set by the first failure under fail-fast
    aborted: AtomicBool,
    ctx: Context,
}

pub struct StreamingOrchestrator {
    shared: Arc<Shared>,
    record: ProcessingRecord,
}

impl StreamingOrchestrator {
    /// Prepare stage directories for a capture of the declared `shape` into `directory`
    pub fn start(
        dispatcher: Dispatcher,
        config: PipelineConfig,
        uploader: Option<Arc<dyn Uploader>>,
        directory: impl Into<PathBuf>,
        shape: ScanShape,
    ) -> Result<Self, PipelineError> {
        let source = directory.into();
        let engine = Engine::new(dispatcher, config, uploader)?;
        let plan = StagePlan::for_shape(&shape, &engine.config);
        plan.validate(engine.dispatcher.registry())?;

        fs::create_dir_all(&source)?;
        let mut dirs = Vec::with_capacity(plan.stages().len());
        let mut parent = source.clone();
        for stage in plan.stages() {
            let dir = parent.join(&stage.directory);
            engine.prepare_stage_dir(&dir)?;
            dirs.push(dir.clone());
            parent = dir;
        }

        let stages = plan
            .stages()
            .iter()
            .map(|stage| {
                let bucket = match stage.kind {
                    StageKind::Fusion(axis) => Some(Bucket::new(axis, shape.count(axis) as usize)),
                    StageKind::Correction => None,
                };
                Mutex::new(StageState {
                    bucket,
                    submitted: BTreeSet::new(),
                    stats: StageStats::new(&stage.directory, &stage.plugin),
                    failures: Vec::new(),
                })
            })
            .collect();
        let barriers = plan.stages().iter().map(|_| TaskBarrier::new()).collect();

        info!(
            "Streaming into {}: {}x{} grid, {} stage(s)",
            source.display(),
            shape.cols,
            shape.rows,
            plan.stages().len()
        );

        Ok(Self {
            record: ProcessingRecord::new(&source),
            shared: Arc::new(Shared {
                engine,
                source,
                shape,
                plan,
                dirs,
                stages,
                barriers,
                capture_done: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                ctx: Context::streaming(),
            }),
        })
    }

    /// Accept one newly captured tile file
    pub fn append(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let path = path.as_ref();
        if self.shared.capture_done.load(Ordering::Acquire) {
            return Err(PipelineError::Config(format!(
                "capture already reported done, cannot append {}",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (tile, format) = TileRef::parse(&name)?;
        self.check_shape(&tile, &name)?;

        debug!("Appended {}", name);
        feed(
            &self.shared,
            0,
            IndexedTile {
                tile,
                format,
                path: path.to_path_buf(),
            },
        );
        Ok(())
    }

    fn check_shape(&self, tile: &TileRef, name: &str) -> Result<(), PipelineError> {
        let shape = &self.shared.shape;
        for axis in [Axis::Stack, Axis::Hdr, Axis::Stabilization] {
            let declared = shape.count(axis) > 0;
            let present = tile.axis(axis);
            let fits = match present {
                Some(i) => declared && i < shape.count(axis),
                None => !declared,
            };
            if !fits {
                return Err(ScanError::Inhomogeneous {
                    first: format!("declared shape {shape:?}"),
                    other: name.to_string(),
                }
                .into());
            }
        }
        if tile.col >= shape.cols || tile.row >= shape.rows {
            return Err(PipelineError::Config(format!(
                "{name} lies outside the declared {}x{} grid",
                shape.cols, shape.rows
            )));
        }
        Ok(())
    }

    /// The capture has delivered its last tile
    pub fn capture_done(&self) {
        self.shared.capture_done.store(true, Ordering::Release);
    }

    /// Capture done and every stage barrier idle
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.shared.capture_done.load(Ordering::Acquire)
            && self.shared.barriers.iter().all(TaskBarrier::idle)
    }

    /// Wait for all stages, then run health, repair and upload
    ///
    /// `timeout` applies to each stage barrier; `None` uses the configured one.
    pub fn finish(self, timeout: Option<Duration>) -> Result<ProcessingRecord, PipelineError> {
        self.capture_done();
        let shared = &self.shared;
        let timeout = timeout.or_else(|| shared.engine.config.barrier_timeout());
        let mut record = self.record.clone();

        for (i, barrier) in shared.barriers.iter().enumerate() {
            barrier.wait(timeout)?;

            let (stats, failures) = {
                let mut state = lock(&shared.stages[i]);
                if let Some(bucket) = &state.bucket {
                    let partial: Vec<(TileRef, usize)> = bucket
                        .partial_buckets()
                        .map(|(key, members)| (*key, members.len()))
                        .collect();
                    for (key, count) in &partial {
                        warn!(
                            "Bucket {} has {}/{} {} variants, skipping",
                            key,
                            count,
                            bucket.expected(),
                            bucket.axis()
                        );
                    }
                    state.stats.incomplete = partial.len();
                }
                state.stats.failed = state.failures.len();
                (state.stats.clone(), std::mem::take(&mut state.failures))
            };
            info!(
                "Stage {}: submitted {}, lazily skipped {}",
                stats.stage, stats.submitted, stats.skipped
            );
            shared.engine.apply_policy(&stats.stage, failures)?;
            record.stages.push(stats);
        }

        let final_dir = shared
            .dirs
            .last()
            .cloned()
            .unwrap_or_else(|| shared.source.clone());
        let repair_from = shared.plan.last_fusion().and_then(|i| {
            let input = if i == 0 {
                shared.source.clone()
            } else {
                shared.dirs[i - 1].clone()
            };
            match shared.plan.stages()[i].kind {
                StageKind::Fusion(axis) => Some((input, axis)),
                StageKind::Correction => None,
            }
        });

        shared.engine.finish(
            &shared.source,
            &final_dir,
            shared.shape,
            repair_from,
            &shared.ctx,
            record,
        )
    }
}

/// Place a tile into stage `index`, submitting whatever became ready
fn feed(shared: &Arc<Shared>, index: usize, tile: IndexedTile) {
    let Some(stage) = shared.plan.stages().get(index) else {
        return;
    };

    let ready = {
        let mut state = lock(&shared.stages[index]);
        let (key, inputs) = match stage.kind {
            StageKind::Correction => (tile.tile, vec![tile.path]),
            StageKind::Fusion(_) => {
                let Some(bucket) = state.bucket.as_mut() else {
                    return;
                };
                match bucket.insert(tile) {
                    Some((key, true)) => {
                        let paths = bucket
                            .members(&key)
                            .map(|m| m.values().map(|t| t.path.clone()).collect())
                            .unwrap_or_default();
                        (key, paths)
                    }
                    Some((_, false)) => return,
                    None => {
                        warn!("Tile does not vary in {}, ignored by {}", stage.directory, stage.plugin);
                        return;
                    }
                }
            }
        };
        if state.submitted.insert(key) {
            Some((key, inputs))
        } else {
            debug!("{} already handled by {}", key, stage.directory);
            None
        }
    };

    if let Some((key, inputs)) = ready {
        submit(shared, index, key, inputs);
    }
}

fn submit(shared: &Arc<Shared>, index: usize, key: TileRef, inputs: Vec<PathBuf>) {
    let stage = &shared.plan.stages()[index];
    let out_key = stage.output_key(&key);
    let target = shared.dirs[index].join(stage.output_name(&out_key));
    let next = IndexedTile {
        tile: out_key,
        format: stage.format,
        path: target.clone(),
    };

    if shared.aborted.load(Ordering::Acquire) {
        debug!("Not submitting {}: an earlier task failed", target.display());
        return;
    }
    if shared.engine.config.lazy && target.exists() {
        debug!("Lazy skip: {} already exists", target.display());
        lock(&shared.stages[index]).stats.skipped += 1;
        feed(shared, index + 1, next);
        return;
    }

    let downstream = Arc::clone(shared);
    let request = TaskRequest::new(
        stage.plugin.as_str(),
        inputs.into_iter().map(ImageRead::from_path).collect(),
        Arc::new(ImageWrite::to_path(&target)),
    )
    .with_context(shared.ctx.clone())
    .with_barrier(&shared.barriers[index])
    .on_complete(move |report| match report.into_failure() {
        None => feed(&downstream, index + 1, next),
        Some(failure) => {
            error!("Stage {}: {}", downstream.plan.stages()[index].directory, failure);
            record_failure(&downstream, index, failure);
        }
    });

    match shared.engine.dispatcher.submit(request) {
        Ok(()) => lock(&shared.stages[index]).stats.submitted += 1,
        Err(e) => record_failure(
            shared,
            index,
            TaskFailure {
                plugin: stage.plugin.clone(),
                target: target.display().to_string(),
                error: PluginError::ExecutionFailed(e.to_string()),
            },
        ),
    }
}

fn record_failure(shared: &Shared, index: usize, failure: TaskFailure) {
    if shared.engine.config.policy == FailurePolicy::FailFast
        && !shared.aborted.swap(true, Ordering::AcqRel)
    {
        warn!("Fail-fast: no further tasks will be submitted");
    }
    lock(&shared.stages[index]).failures.push(failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::WorkerPool;
    use crate::plugin::{names, Arity};
    use crate::scan::index_directory;
    use crate::testing::{registry_with, write_tile, MockFactory};

    fn stack_shape() -> ScanShape {
        ScanShape {
            cols: 2,
            rows: 2,
            stack_count: 3,
            ..ScanShape::default()
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig {
            post_corrections: vec![names::SHARPEN.to_string()],
            ..PipelineConfig::default()
        };
        config.upload.enabled = false;
        config
    }

    fn stack_and_sharpen() -> (Arc<MockFactory>, Arc<MockFactory>) {
        (
            MockFactory::new(names::FOCUS_STACK, Arity::Fusion),
            MockFactory::new(names::SHARPEN, Arity::Correction),
        )
    }

    /// Write and append every depth of `cells`
    fn capture(stream: &StreamingOrchestrator, dir: &Path, cells: &[(u32, u32)], depths: u32) {
        for &(col, row) in cells {
            for z in 0..depths {
                let name = format!("c{col:03}_r{row:03}_z{z:02}.tif");
                write_tile(dir, &name, (10 * (z + 1)) as u8);
                stream.append(dir.join(name)).unwrap();
            }
        }
    }

    const GRID: [(u32, u32); 4] = [(0, 0), (0, 1), (1, 0), (1, 1)];

    fn pool(factories: &[Arc<MockFactory>]) -> (WorkerPool, tempfile::TempDir) {
        let scratch = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(registry_with(factories), Some(2), scratch.path()).unwrap();
        (pool, scratch)
    }

    #[test]
    fn test_buckets_submit_when_full() {
        let stack = MockFactory::new(names::FOCUS_STACK, Arity::Fusion);
        let sharpen = MockFactory::new(names::SHARPEN, Arity::Correction);
        let (pool, _scratch) = pool(&[Arc::clone(&stack), Arc::clone(&sharpen)]);
        let scan = tempfile::tempdir().unwrap();

        let stream =
            StreamingOrchestrator::start(pool.dispatcher(), config(), None, scan.path(), stack_shape())
                .unwrap();

        // first two depths of every cell: nothing is full yet
        for z in 0..2 {
            for col in 0..2 {
                for row in 0..2 {
                    let name = format!("c{col:03}_r{row:03}_z{z:02}.tif");
                    write_tile(scan.path(), &name, 10);
                    stream.append(scan.path().join(name)).unwrap();
                }
            }
        }
        assert!(!stream.is_complete());
        assert_eq!(stack.runs(), 0);

        for col in 0..2 {
            for row in 0..2 {
                let name = format!("c{col:03}_r{row:03}_z02.tif");
                write_tile(scan.path(), &name, 30);
                stream.append(scan.path().join(name)).unwrap();
            }
        }

        let record = stream.finish(Some(Duration::from_secs(30))).unwrap();
        assert_eq!(stack.runs(), 4);
        assert_eq!(sharpen.runs(), 4);
        assert_eq!(record.final_directory, scan.path().join("stacked/post_sharpen"));

        let index = index_directory(scan.path().join("stacked/post_sharpen")).unwrap();
        assert!(index.is_flat());
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_incomplete_capture_is_unhealthy() {
        let stack = MockFactory::new(names::FOCUS_STACK, Arity::Fusion);
        let sharpen = MockFactory::new(names::SHARPEN, Arity::Correction);
        let (pool, _scratch) = pool(&[Arc::clone(&stack), sharpen]);
        let scan = tempfile::tempdir().unwrap();
        let stream =
            StreamingOrchestrator::start(pool.dispatcher(), config(), None, scan.path(), stack_shape())
                .unwrap();

        for (col, row) in [(0, 0), (0, 1), (1, 0)] {
            for z in 0..3 {
                let name = format!("c{col:03}_r{row:03}_z{z:02}.tif");
                write_tile(scan.path(), &name, 10);
                stream.append(scan.path().join(name)).unwrap();
            }
        }
        stream.capture_done();

        match stream.finish(Some(Duration::from_secs(30))) {
            Err(PipelineError::Unhealthy { missing }) => assert_eq!(missing, vec![(1, 1)]),
            other => panic!("Expected Unhealthy, got {other:?}"),
        }
        assert_eq!(stack.runs(), 3);
    }

    #[test]
    fn test_append_rejects_tiles_outside_shape() {
        let stack = MockFactory::new(names::FOCUS_STACK, Arity::Fusion);
        let sharpen = MockFactory::new(names::SHARPEN, Arity::Correction);
        let (pool, _scratch) = pool(&[stack, sharpen]);
        let scan = tempfile::tempdir().unwrap();
        let stream =
            StreamingOrchestrator::start(pool.dispatcher(), config(), None, scan.path(), stack_shape())
                .unwrap();

        assert!(stream.append(scan.path().join("c000_r000.tif")).is_err());
        assert!(stream.append(scan.path().join("c000_r000_z03.tif")).is_err());
        assert!(stream.append(scan.path().join("c005_r000_z00.tif")).is_err());
        assert!(stream.append(scan.path().join("stage.log")).is_err());

        stream.capture_done();
        assert!(stream.is_complete());
        assert!(stream.append(scan.path().join("c000_r000_z00.tif")).is_err());
    }

    #[test]
    fn test_duplicate_append_submits_once() {
        let stack = MockFactory::new(names::FOCUS_STACK, Arity::Fusion);
        let sharpen = MockFactory::new(names::SHARPEN, Arity::Correction);
        let (pool, _scratch) = pool(&[Arc::clone(&stack), sharpen]);
        let scan = tempfile::tempdir().unwrap();
        let shape = ScanShape {
            cols: 1,
            rows: 1,
            stack_count: 2,
            ..ScanShape::default()
        };
        let stream =
            StreamingOrchestrator::start(pool.dispatcher(), config(), None, scan.path(), shape).unwrap();

        for name in ["c000_r000_z00.tif", "c000_r000_z01.tif", "c000_r000_z01.tif"] {
            write_tile(scan.path(), name, 10);
            stream.append(scan.path().join(name)).unwrap();
        }

        stream.finish(Some(Duration::from_secs(30))).unwrap();
        assert_eq!(stack.runs(), 1);
    }

    #[test]
    fn test_hdr_outputs_feed_the_stack() {
        let hdr = MockFactory::new(names::EXPOSURE_FUSION, Arity::Fusion);
        let (stack, sharpen) = stack_and_sharpen();
        let (pool, _scratch) = pool(&[Arc::clone(&hdr), Arc::clone(&stack), Arc::clone(&sharpen)]);
        let scan = tempfile::tempdir().unwrap();
        let shape = ScanShape {
            cols: 1,
            rows: 2,
            hdr_count: 2,
            stack_count: 2,
            ..ScanShape::default()
        };
        let stream =
            StreamingOrchestrator::start(pool.dispatcher(), config(), None, scan.path(), shape).unwrap();

        for row in 0..2 {
            for z in 0..2 {
                for h in 0..2 {
                    let name = format!("c000_r{row:03}_z{z:02}_h{h:02}.tif");
                    write_tile(scan.path(), &name, 40);
                    stream.append(scan.path().join(name)).unwrap();
                }
            }
        }

        let record = stream.finish(Some(Duration::from_secs(30))).unwrap();
        assert_eq!(hdr.runs(), 4);
        assert_eq!(stack.runs(), 2);
        assert_eq!(sharpen.runs(), 2);
        assert_eq!(
            record.final_directory,
            scan.path().join("exposure_fused/stacked/post_sharpen")
        );
        assert!(scan.path().join("exposure_fused/c000_r001_z01.tif").exists());
        assert!(scan.path().join("exposure_fused/stacked/c000_r001.tif").exists());
    }

    #[test]
    fn test_fail_fast_stops_submitting_after_a_failure() {
        let (stack, sharpen) = stack_and_sharpen();
        stack.fail_on("c000_r000.tif");
        let (pool, _scratch) = pool(&[Arc::clone(&stack), Arc::clone(&sharpen)]);
        let scan = tempfile::tempdir().unwrap();
        let stream =
            StreamingOrchestrator::start(pool.dispatcher(), config(), None, scan.path(), stack_shape())
                .unwrap();

        capture(&stream, scan.path(), &GRID[..1], 3);
        stream.shared.barriers[0]
            .wait(Some(Duration::from_secs(30)))
            .unwrap();
        capture(&stream, scan.path(), &GRID[1..], 3);

        match stream.finish(Some(Duration::from_secs(30))) {
            Err(PipelineError::StageFailed { stage, failures }) => {
                assert_eq!(stage, "stacked");
                assert_eq!(failures.len(), 1);
            }
            other => panic!("Expected StageFailed, got {other:?}"),
        }
        assert_eq!(stack.runs(), 1);
        assert_eq!(sharpen.runs(), 0);
        assert!(!scan.path().join(crate::scan::PROCESSING_SENTINEL).exists());
    }

    #[test]
    fn test_best_effort_streams_past_a_failure() {
        let (stack, sharpen) = stack_and_sharpen();
        stack.fail_on("c000_r001.tif");
        let (pool, _scratch) = pool(&[Arc::clone(&stack), Arc::clone(&sharpen)]);
        let scan = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            policy: FailurePolicy::BestEffort,
            repair: true,
            ..config()
        };
        let stream =
            StreamingOrchestrator::start(pool.dispatcher(), config, None, scan.path(), stack_shape())
                .unwrap();

        capture(&stream, scan.path(), &GRID, 3);

        let record = stream.finish(Some(Duration::from_secs(30))).unwrap();
        assert_eq!(stack.runs(), 4);
        assert_eq!(sharpen.runs(), 3);
        assert_eq!(record.stages[0].failed, 1);
        assert_eq!(record.repaired, vec![(0, 1)]);
    }

    #[test]
    fn test_lazy_restream_reuses_outputs() {
        let (stack, sharpen) = stack_and_sharpen();
        let (pool, _scratch) = pool(&[Arc::clone(&stack), Arc::clone(&sharpen)]);
        let scan = tempfile::tempdir().unwrap();

        let first =
            StreamingOrchestrator::start(pool.dispatcher(), config(), None, scan.path(), stack_shape())
                .unwrap();
        capture(&first, scan.path(), &GRID, 3);
        first.finish(Some(Duration::from_secs(30))).unwrap();
        assert_eq!(stack.runs(), 4);

        let second =
            StreamingOrchestrator::start(pool.dispatcher(), config(), None, scan.path(), stack_shape())
                .unwrap();
        capture(&second, scan.path(), &GRID, 3);
        let record = second.finish(Some(Duration::from_secs(30))).unwrap();

        assert_eq!(stack.runs(), 4);
        assert_eq!(sharpen.runs(), 4);
        assert_eq!(record.submitted(), 0);
        assert_eq!(record.stages[0].skipped, 4);
        assert_eq!(record.stages[1].skipped, 4);
    }

    #[test]
    fn test_full_restream_starts_from_empty_stage_dirs() {
        let (stack, sharpen) = stack_and_sharpen();
        let (pool, _scratch) = pool(&[Arc::clone(&stack), Arc::clone(&sharpen)]);
        let scan = tempfile::tempdir().unwrap();

        let repairing = PipelineConfig {
            repair: true,
            ..config()
        };
        let first =
            StreamingOrchestrator::start(pool.dispatcher(), repairing, None, scan.path(), stack_shape())
                .unwrap();
        capture(&first, scan.path(), &GRID[..3], 3);
        assert_eq!(first.finish(Some(Duration::from_secs(30))).unwrap().repaired, vec![(1, 1)]);

        let full = PipelineConfig {
            lazy: false,
            ..config()
        };
        let second =
            StreamingOrchestrator::start(pool.dispatcher(), full, None, scan.path(), stack_shape())
                .unwrap();
        assert!(index_directory(scan.path().join("stacked/post_sharpen")).unwrap().is_empty());
        capture(&second, scan.path(), &GRID[..3], 3);

        match second.finish(Some(Duration::from_secs(30))) {
            Err(PipelineError::Unhealthy { missing }) => assert_eq!(missing, vec![(1, 1)]),
            other => panic!("Expected Unhealthy, got {other:?}"),
        }
        assert_eq!(stack.runs(), 6);
    }
}
