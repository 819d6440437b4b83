//! Worker pool and dispatcher
//!
//! A fixed set of OS threads pull [`TaskRequest`]s from one shared queue. Every
//! worker owns its own plugin instances, so a plugin runs at most once at a
//! time per instance while N workers run the same plugin N-way in parallel.
//!
//! Whatever the plugin does (succeed, fail, panic) the worker invokes the
//! request's completion callback with a [`TaskReport`] and then completes the
//! request's barrier ticket.

use crate::barrier::{BarrierTicket, TaskBarrier};
use crate::context::Context;
use crate::error::{PipelineError, PluginError, TaskFailure};
use crate::image_ref::{ImageRead, ImageWrite};
use crate::plugin::Plugin;
use crate::registry::Registry;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long an idle worker blocks on the queue before rechecking for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Invoked on the worker thread once a task has finished
pub type CompletionCallback = Box<dyn FnOnce(TaskReport) + Send + 'static>;

/// One plugin invocation, consumed by exactly one worker
pub struct TaskRequest {
    plugin: String,
    inputs: Vec<ImageRead>,
    output: Arc<ImageWrite>,
    context: Context,
    on_complete: Option<CompletionCallback>,
    barrier: Option<BarrierTicket>,
}

impl TaskRequest {
    pub fn new(plugin: impl Into<String>, inputs: Vec<ImageRead>, output: Arc<ImageWrite>) -> Self {
        Self {
            plugin: plugin.into(),
            inputs,
            output,
            context: Context::batch(),
            on_complete: None,
            barrier: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(TaskReport) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Allocate a completion on `barrier` for this task
    #[must_use]
    pub fn with_barrier(self, barrier: &TaskBarrier) -> Self {
        self.with_ticket(barrier.allocate_callback())
    }

    #[must_use]
    pub fn with_ticket(mut self, ticket: BarrierTicket) -> Self {
        self.barrier = Some(ticket);
        self
    }

    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    #[must_use]
    pub fn output(&self) -> &Arc<ImageWrite> {
        &self.output
    }

    /// Deliver `result` without running anything
    fn finish(self, result: Result<(), PluginError>, duration: Duration) {
        let TaskRequest {
            plugin,
            inputs,
            output,
            on_complete,
            barrier,
            ..
        } = self;
        // temporaries owned by the inputs go before anyone is told we are done
        drop(inputs);

        let report = TaskReport {
            plugin,
            output,
            duration,
            result,
        };
        if let Some(callback) = on_complete {
            if catch_unwind(AssertUnwindSafe(|| callback(report))).is_err() {
                error!("Task completion callback panicked");
            }
        }
        if let Some(ticket) = barrier {
            ticket.complete();
        }
    }
}

/// Outcome of one task, handed to its completion callback
#[derive(Debug)]
pub struct TaskReport {
    pub plugin: String,
    pub output: Arc<ImageWrite>,
    pub duration: Duration,
    pub result: Result<(), PluginError>,
}

impl TaskReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// The failure this report carries, if any
    #[must_use]
    pub fn into_failure(self) -> Option<TaskFailure> {
        let target = self.output.label();
        match self.result {
            Ok(()) => None,
            Err(error) => Some(TaskFailure {
                plugin: self.plugin,
                target,
                error,
            }),
        }
    }
}

/// Clonable submission handle to a [`WorkerPool`]
#[derive(Clone)]
pub struct Dispatcher {
    sender: Sender<TaskRequest>,
    /// Cleared by `stop`; held for reading across each send so nothing is
    /// queued after the final drain
    accepting: Arc<RwLock<bool>>,
    shutdown: Arc<AtomicBool>,
    registry: Arc<Registry>,
}

impl Dispatcher {
    /// Queue a task
    ///
    /// Unknown plugin names are rejected here instead of on a worker.
    pub fn submit(&self, request: TaskRequest) -> Result<(), PipelineError> {
        let accepting = self
            .accepting
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if !*accepting {
            return Err(PipelineError::PoolStopped);
        }
        if !self.registry.contains(request.plugin()) {
            return Err(crate::error::RegistryError::UnknownPlugin(request.plugin.clone()).into());
        }

        debug!(
            "Submitting {} -> {}",
            request.plugin,
            request.output.label()
        );
        self.sender
            .send(request)
            .map_err(|_| PipelineError::PoolStopped)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// Fixed-size pool of plugin workers
pub struct WorkerPool {
    dispatcher: Dispatcher,
    receiver: Receiver<TaskRequest>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` threads (default: available parallelism)
    ///
    /// Each worker keeps its private scratch directories under `scratch_root`.
    pub fn new(
        registry: Arc<Registry>,
        workers: Option<usize>,
        scratch_root: impl Into<PathBuf>,
    ) -> Result<Self, PipelineError> {
        let count = workers.unwrap_or_else(num_cpus::get).max(1);
        let scratch_root = scratch_root.into();
        fs::create_dir_all(&scratch_root)?;

        let (sender, receiver) = unbounded::<TaskRequest>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let worker = Worker {
                id,
                receiver: receiver.clone(),
                shutdown: Arc::clone(&shutdown),
                registry: Arc::clone(&registry),
                scratch: scratch_root.join(format!("worker-{id}")),
                instances: HashMap::new(),
            };
            let handle = thread::Builder::new()
                .name(format!("micrograph-worker-{id}"))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }

        info!("Started worker pool with {} workers", count);

        Ok(Self {
            dispatcher: Dispatcher {
                sender,
                accepting: Arc::new(RwLock::new(true)),
                shutdown,
                registry,
            },
            receiver,
            workers: handles,
        })
    }

    /// Queue a task
    pub fn submit(&self, request: TaskRequest) -> Result<(), PipelineError> {
        self.dispatcher.submit(request)
    }

    /// A handle other threads (and completion callbacks) can submit through
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.dispatcher.registry
    }

    /// Stop all workers
    ///
    /// Tasks already running finish normally; tasks still queued are reported
    /// as cancelled so that no barrier waits on them.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        // waits out any submit that is mid-send
        *self
            .dispatcher
            .accepting
            .write()
            .unwrap_or_else(PoisonError::into_inner) = false;
        self.dispatcher.shutdown.store(true, Ordering::Release);

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread exited abnormally");
            }
        }

        let mut cancelled = 0usize;
        while let Ok(request) = self.receiver.try_recv() {
            request.finish(Err(PluginError::Cancelled), Duration::ZERO);
            cancelled += 1;
        }
        if cancelled > 0 {
            warn!("Cancelled {} queued task(s) on shutdown", cancelled);
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    id: usize,
    receiver: Receiver<TaskRequest>,
    shutdown: Arc<AtomicBool>,
    registry: Arc<Registry>,
    scratch: PathBuf,
    instances: HashMap<String, Box<dyn Plugin>>,
}

impl Worker {
    fn run(mut self) {
        debug!("Worker {} ready", self.id);
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(request) => self.execute(request),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let _ = fs::remove_dir_all(&self.scratch);
        debug!("Worker {} exiting", self.id);
    }

    fn execute(&mut self, request: TaskRequest) {
        let start = Instant::now();
        let result = self.invoke(&request);
        let duration = start.elapsed();

        match &result {
            Ok(()) => debug!(
                "Worker {}: {} -> {} done in {:.2?}",
                self.id,
                request.plugin,
                request.output.label(),
                duration
            ),
            Err(e) => warn!(
                "Worker {}: {} -> {} failed: {}",
                self.id,
                request.plugin,
                request.output.label(),
                e
            ),
        }

        request.finish(result, duration);
    }

    fn invoke(&mut self, request: &TaskRequest) -> Result<(), PluginError> {
        let name = request.plugin.as_str();
        if !self.instances.contains_key(name) {
            let plugin = self
                .registry
                .create(name)
                .map_err(|e| PluginError::ExecutionFailed(e.to_string()))?;
            self.instances.insert(name.to_string(), plugin);
        }

        let outcome = {
            let Some(plugin) = self.instances.get_mut(name) else {
                return Err(PluginError::ExecutionFailed(format!(
                    "no instance of {name}"
                )));
            };

            let scratch = if plugin.needs_scratch() {
                let dir = self.scratch.join(name);
                reset_dir(&dir)?;
                Some(dir)
            } else {
                None
            };
            let ctx = match &scratch {
                Some(dir) => request.context.with_scratch_dir(dir),
                None => request.context.clone(),
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                plugin.run(&ctx, &request.inputs, &request.output)
            }));

            if let Some(dir) = &scratch {
                if let Err(e) = fs::remove_dir_all(dir) {
                    warn!("Failed to clear scratch {}: {}", dir.display(), e);
                }
            }
            outcome
        };

        match outcome {
            Ok(result) => result,
            Err(payload) => {
                // the instance may be left half-updated; build a fresh one next time
                self.instances.remove(name);
                Err(PluginError::Panicked(panic_message(payload.as_ref())))
            }
        }
    }
}

fn reset_dir(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
