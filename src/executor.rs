//! Task executor interface and a local reference backend.
//!
//! Queues hand their work to an executor as [`Submission`]s: ordered lists of
//! [`Task`]s, each carrying a semaphore wait-list and a work closure. The
//! production backend is expected to be an external work-stealing scheduler;
//! [`LocalExecutor`] is a deliberately simple stand-in that runs each flushed
//! task on its own thread.
//!
//! # Design
//!
//! A task's work closure receives the *resolution* of its wait-list instead of
//! being skipped when a dependency failed. Cleanup tasks (retirement, arena
//! release) must run on the failure path too; they inspect the resolution and
//! propagate.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::Result;
use crate::scope::Scope;
use crate::sync::{Deadline, Semaphore, SemaphoreWait, WaitMode, wait_semaphores};

type Work = Box<dyn FnOnce(Result<()>) -> Result<()> + Send + 'static>;

/// One schedulable unit: a wait-list gating a work closure, accounted against
/// a scope from submission to completion.
pub struct Task {
    scope: Arc<Scope>,
    waits: SmallVec<[SemaphoreWait; 4]>,
    work: Work,
}

impl Task {
    pub fn new(scope: Arc<Scope>, work: impl FnOnce(Result<()>) -> Result<()> + Send + 'static) -> Self {
        Self { scope, waits: SmallVec::new(), work: Box::new(work) }
    }

    /// Gate this task on `semaphore` reaching `value`.
    pub fn wait_on(mut self, semaphore: Arc<dyn Semaphore>, value: u64) -> Self {
        self.waits.push(SemaphoreWait { semaphore, value });
        self
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Block until the wait-list resolves, then run the work closure with the
    /// outcome. The scope sees the task retire whatever happens.
    fn run(self) {
        let resolution = {
            let waits: SmallVec<[(&dyn Semaphore, u64); 4]> =
                self.waits.iter().map(|wait| (wait.semaphore.as_ref(), wait.value)).collect();
            wait_semaphores(WaitMode::All, &waits, Deadline::Forever)
        };
        if let Err(error) = (self.work)(resolution) {
            self.scope.fail(error);
        }
        self.scope.end();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("scope", &self.scope.name())
            .field("waits", &self.waits.len())
            .finish()
    }
}

/// An ordered list of tasks handed to the executor as one unit.
#[derive(Debug, Default)]
pub struct Submission {
    tasks: SmallVec<[Task; 4]>,
}

impl Submission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Backend contract: accept submissions, start execution on flush.
///
/// `submit` only enqueues; nothing runs until `flush`. Scope accounting
/// happens at submit time so an idle-wait issued between the two observes the
/// queued tasks.
pub trait Executor: Send + Sync {
    fn submit(&self, submission: Submission);
    fn flush(&self);
}

/// Thread-per-task reference backend.
///
/// Tasks may block for arbitrarily long in their wait-lists, so they each get
/// a dedicated thread; a fixed-size pool could deadlock with every worker
/// parked on a semaphore that only an unscheduled task would signal.
#[derive(Default)]
pub struct LocalExecutor {
    pending: Mutex<Vec<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Executor for LocalExecutor {
    fn submit(&self, submission: Submission) {
        trace!(tasks = submission.len(), "submission enqueued");
        let mut pending = self.pending.lock();
        for task in submission.tasks {
            task.scope.begin();
            pending.push(task);
        }
    }

    fn flush(&self) {
        let ready = std::mem::take(&mut *self.pending.lock());
        if ready.is_empty() {
            return;
        }
        debug!(tasks = ready.len(), "flushing tasks");
        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.is_finished());
        for task in ready {
            workers.push(std::thread::spawn(move || task.run()));
        }
    }
}

impl Drop for LocalExecutor {
    fn drop(&mut self) {
        // Unflushed tasks never ran; retire them from their scopes so an
        // idle-wait elsewhere cannot hang on work that will never start.
        for task in self.pending.get_mut().drain(..) {
            task.scope.end();
        }
        for worker in self.workers.get_mut().drain(..) {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
