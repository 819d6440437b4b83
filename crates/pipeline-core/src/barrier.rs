//! Task barrier: block until every submitted task has reported back
//!
//! Each submission takes a [`BarrierTicket`] from the barrier before it is
//! queued. A ticket completes exactly once: explicitly through
//! [`BarrierTicket::complete`], or when it is dropped, so a task that is lost
//! (cancelled, or its worker unwound) still releases the waiter.

use crate::error::PipelineError;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counts {
    allocated: usize,
    completed: usize,
}

#[derive(Debug, Default)]
struct Inner {
    counts: Mutex<Counts>,
    changed: Condvar,
}

impl Inner {
    fn counts(&self) -> MutexGuard<'_, Counts> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Counts allocated versus completed tasks
#[derive(Clone, Default)]
pub struct TaskBarrier {
    inner: Arc<Inner>,
}

impl TaskBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one completion; call before submitting the task
    pub fn allocate_callback(&self) -> BarrierTicket {
        self.inner.counts().allocated += 1;
        BarrierTicket {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Every allocated ticket has completed
    #[must_use]
    pub fn idle(&self) -> bool {
        let counts = self.inner.counts();
        counts.completed >= counts.allocated
    }

    /// `(allocated, completed)`
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let counts = self.inner.counts();
        (counts.allocated, counts.completed)
    }

    /// Block until idle, or until `timeout` elapses
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), PipelineError> {
        let mut counts = self.inner.counts();
        let deadline = timeout.map(|t| (t, Instant::now() + t));

        while counts.completed < counts.allocated {
            match deadline {
                None => {
                    counts = self
                        .inner
                        .changed
                        .wait(counts)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some((timeout, deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PipelineError::BarrierTimeout {
                            timeout,
                            allocated: counts.allocated,
                            completed: counts.completed,
                        });
                    }
                    counts = self
                        .inner
                        .changed
                        .wait_timeout(counts, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for TaskBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (allocated, completed) = self.counts();
        f.debug_struct("TaskBarrier")
            .field("allocated", &allocated)
            .field("completed", &completed)
            .finish()
    }
}

/// One pending completion of a [`TaskBarrier`]
#[must_use = "a ticket completes its barrier when dropped"]
#[derive(Debug)]
pub struct BarrierTicket {
    inner: Option<Arc<Inner>>,
}

impl BarrierTicket {
    /// Mark the task as finished
    pub fn complete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.counts().completed += 1;
            inner.changed.notify_all();
        }
    }
}

impl Drop for BarrierTicket {
    fn drop(&mut self) {
        self.release();
    }
}
