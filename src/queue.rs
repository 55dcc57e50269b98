//! Per-queue submission pipeline.
//!
//! Each submitted batch becomes a two-task pipeline on the shared executor:
//!
//! - an **issue** task gated on the batch's wait semaphores that executes the
//!   command buffers in order, and
//! - a **retire** task that signals (or fails) the batch's output semaphores
//!   and releases the batch's arena as its very last action.
//!
//! # Design
//!
//! Submission state lives in a bump arena fed by the device's small block
//! pool: the command buffer list is copied into it at submit time and the
//! retire task owns the arena, so a batch's bookkeeping is freed in O(blocks)
//! exactly once, after everything that reads it has run.
//!
//! Two internal semaphores stitch the pipeline together. A per-queue *order*
//! timeline assigns each batch a ticket; batch `i`'s issue task waits for
//! ticket `i` and publishes ticket `i + 1` whatever the outcome, so batches
//! issue strictly in submission order and a failed batch cannot wedge the
//! ones behind it. A per-batch *completion* timeline carries the issue
//! outcome to the retire task: signaled to 1 on success, failed with the
//! issue error otherwise. The retire task runs in both cases since the arena
//! must be released; on failure it propagates by failing every output
//! semaphore instead of signaling it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::arena::{Arena, BlockPool};
use crate::command_buffer::CommandBuffer;
use crate::error::Result;
use crate::executor::{Executor, Submission, Task};
use crate::scope::Scope;
use crate::sync::{Deadline, Semaphore, SemaphoreSignal, SemaphoreWait, TimelineSemaphore};

/// One unit of queue work: command buffers gated by wait semaphores, with
/// signal semaphores advanced on completion.
///
/// Any part may be empty; a batch with no command buffers still orders its
/// signals after its waits, which is how bare semaphore chaining is expressed.
#[derive(Default)]
pub struct SubmissionBatch {
    pub waits: SmallVec<[SemaphoreWait; 4]>,
    pub signals: SmallVec<[SemaphoreSignal; 4]>,
    pub command_buffers: SmallVec<[Arc<CommandBuffer>; 4]>,
}

impl SubmissionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(mut self, semaphore: Arc<dyn Semaphore>, value: u64) -> Self {
        self.waits.push(SemaphoreWait { semaphore, value });
        self
    }

    pub fn signal(mut self, semaphore: Arc<dyn Semaphore>, value: u64) -> Self {
        self.signals.push(SemaphoreSignal { semaphore, value });
        self
    }

    pub fn execute(mut self, command_buffer: Arc<CommandBuffer>) -> Self {
        self.command_buffers.push(command_buffer);
        self
    }
}

impl fmt::Debug for SubmissionBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionBatch")
            .field("waits", &self.waits.len())
            .field("signals", &self.signals.len())
            .field("command_buffers", &self.command_buffers.len())
            .finish()
    }
}

struct QueueState {
    next_ticket: u64,
}

/// A single hardware-queue analogue: orders batches, owns a scope, feeds the
/// shared executor.
pub struct Queue {
    ordinal: usize,
    scope: Arc<Scope>,
    small_pool: Arc<BlockPool>,
    executor: Arc<dyn Executor>,
    order: Arc<TimelineSemaphore>,
    state: Mutex<QueueState>,
}

impl Queue {
    pub(crate) fn new(
        ordinal: usize,
        small_pool: Arc<BlockPool>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        Ok(Self {
            ordinal,
            scope: Scope::new(format!("queue[{ordinal}]")),
            small_pool,
            executor,
            order: TimelineSemaphore::new(0)?,
            state: Mutex::new(QueueState { next_ticket: 0 }),
        })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Enqueue `batches` and flush the executor once.
    ///
    /// Errors returned here are submission-time failures (arena exhaustion);
    /// execution failures surface asynchronously through the batch's signal
    /// semaphores and the queue scope.
    pub fn submit(&self, batches: Vec<SubmissionBatch>) -> Result<()> {
        for batch in batches {
            self.submit_batch(batch)?;
        }
        self.executor.flush();
        Ok(())
    }

    fn submit_batch(&self, batch: SubmissionBatch) -> Result<()> {
        debug!(queue = self.ordinal, batch = ?batch, "submitting batch");

        // All batch bookkeeping lives in one arena owned by the retire task.
        let mut arena = Arena::new(Arc::clone(&self.small_pool));
        let command_buffers = arena.alloc_slice(&batch.command_buffers)?;

        let done = TimelineSemaphore::new(0)?;
        let ticket = {
            let mut state = self.state.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            ticket
        };

        let issue = {
            let order = Arc::clone(&self.order);
            let done = Arc::clone(&done);
            let ordinal = self.ordinal;
            let mut task = Task::new(Arc::clone(&self.scope), move |resolution| {
                trace!(queue = ordinal, ticket, "issuing batch");
                let outcome = resolution.and_then(|()| {
                    // SAFETY: the handle points into the arena owned by the
                    // retire task; the completion semaphore signaled below
                    // orders this read before the arena is dropped.
                    for command_buffer in command_buffers.iter() {
                        command_buffer.execute()?;
                    }
                    Ok(())
                });
                match &outcome {
                    Ok(()) => done.signal(1)?,
                    Err(error) => done.fail(error.clone()),
                }
                // The next batch must issue even when this one failed.
                order.signal(ticket + 1)?;
                outcome
            });
            task = task.wait_on(Arc::clone(&self.order) as Arc<dyn Semaphore>, ticket);
            for wait in &batch.waits {
                task = task.wait_on(Arc::clone(&wait.semaphore), wait.value);
            }
            task
        };

        let retire = {
            let signals = batch.signals;
            let ordinal = self.ordinal;
            Task::new(Arc::clone(&self.scope), move |resolution| {
                trace!(queue = ordinal, ticket, "retiring batch");
                let result = match resolution {
                    Ok(()) => {
                        // Attempt every signal; keep the first error.
                        let mut first_error = None;
                        for signal in &signals {
                            if let Err(error) = signal.semaphore.signal(signal.value) {
                                first_error.get_or_insert(error);
                            }
                        }
                        first_error.map_or(Ok(()), Err)
                    }
                    Err(error) => {
                        for signal in &signals {
                            signal.semaphore.fail(error.clone());
                        }
                        Err(error)
                    }
                };
                // Freed last: nothing may touch the batch's arena after this.
                drop(arena);
                result
            })
            .wait_on(done as Arc<dyn Semaphore>, 1)
        };

        let mut submission = Submission::new();
        submission.push(issue);
        submission.push(retire);
        self.executor.submit(submission);
        Ok(())
    }

    /// Block until every batch submitted so far has retired; surfaces the
    /// scope's captured failure if one occurred.
    pub fn wait_idle(&self, deadline: Deadline) -> Result<()> {
        self.scope.wait_idle(deadline)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("ordinal", &self.ordinal)
            .field("scope", &self.scope)
            .finish()
    }
}
