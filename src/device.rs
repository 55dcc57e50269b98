//! Device orchestration: queues, block pools, loaders, and the shared
//! executor behind one handle.

use std::fmt;
use std::sync::Arc;

use snafu::ensure;
use tracing::debug;

use crate::arena::{BlockPool, MIN_BLOCK_SIZE};
use crate::buffer::{Allocator, HeapAllocator};
use crate::command_buffer::{CommandBuffer, CommandCategories, ExecutionMode};
use crate::error::{InvalidArgumentSnafu, Result};
use crate::executor::Executor;
use crate::loader::{Executable, ExecutableLoader, load_executable};
use crate::queue::{Queue, SubmissionBatch};
use crate::sync::{Deadline, Semaphore, SemaphoreWait, TimelineSemaphore, WaitMode, wait_semaphores};

/// Block size of the small pool backing per-batch submission arenas.
const SMALL_BLOCK_SIZE: usize = 1024;

/// Device creation parameters.
#[derive(Clone, Copy, Debug)]
pub struct DeviceParams {
    /// Number of independent submission queues.
    pub queue_count: usize,
    /// Block size of the large pool backing command buffer payloads.
    pub arena_block_size: usize,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self { queue_count: 8, arena_block_size: 32 * 1024 }
    }
}

/// A local device: N queues over one shared executor, with pooled arenas for
/// transient submission state.
pub struct Device {
    name: String,
    // Field order is teardown order: queues drain first, then the loader set
    // and executor go, and the pools outlive everything that allocates from
    // them. The allocator goes last so buffers it vended stay coherent
    // through queue teardown.
    queues: Box<[Queue]>,
    loaders: Box<[Arc<dyn ExecutableLoader>]>,
    executor: Arc<dyn Executor>,
    small_pool: Arc<BlockPool>,
    large_pool: Arc<BlockPool>,
    allocator: Arc<dyn Allocator>,
}

impl Device {
    pub fn create(
        name: impl Into<String>,
        params: DeviceParams,
        loaders: Vec<Arc<dyn ExecutableLoader>>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(
            params.queue_count > 0,
            InvalidArgumentSnafu { reason: "queue count must be at least 1" }
        );
        ensure!(
            params.arena_block_size >= MIN_BLOCK_SIZE,
            InvalidArgumentSnafu {
                reason: format!(
                    "arena block size {} is below the minimum of {MIN_BLOCK_SIZE}",
                    params.arena_block_size
                ),
            }
        );

        let small_pool = Arc::new(BlockPool::new(SMALL_BLOCK_SIZE)?);
        let large_pool = Arc::new(BlockPool::new(params.arena_block_size)?);
        let queues = (0..params.queue_count)
            .map(|ordinal| Queue::new(ordinal, Arc::clone(&small_pool), Arc::clone(&executor)))
            .collect::<Result<Box<[_]>>>()?;

        debug!(
            name = %name,
            queues = params.queue_count,
            arena_block_size = params.arena_block_size,
            "device created"
        );
        Ok(Self {
            name,
            queues,
            loaders: loaders.into_boxed_slice(),
            executor,
            small_pool,
            large_pool,
            allocator: HeapAllocator::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Map a caller-supplied affinity onto a queue. Deterministic, and every
    /// queue is reachable. Every queue accepts every command category, so
    /// `categories` does not influence routing.
    pub fn select_queue(&self, _categories: CommandCategories, affinity: u64) -> &Queue {
        &self.queues[(affinity % self.queues.len() as u64) as usize]
    }

    /// Create a timeline semaphore usable with any queue of this device.
    pub fn create_semaphore(&self, initial_value: u64) -> Result<Arc<TimelineSemaphore>> {
        TimelineSemaphore::new(initial_value)
    }

    /// Create a command buffer declaring `categories`, with inlined payloads
    /// drawing from the device's large block pool.
    pub fn create_command_buffer(&self, mode: ExecutionMode, categories: CommandCategories) -> CommandBuffer {
        // Recording is not queue-specific; bind the first queue's scope.
        CommandBuffer::new(Arc::clone(self.queues[0].scope()), &self.large_pool, mode, categories)
    }

    /// Load an executable with the first registered loader supporting its
    /// format.
    pub fn load_executable(&self, format: &str, contents: &[u8]) -> Result<Arc<dyn Executable>> {
        load_executable(&self.loaders, format, contents)
    }

    /// Submit `batches` to the queue selected by `categories` and `affinity`,
    /// then flush the executor once for the whole call.
    pub fn submit(
        &self,
        categories: CommandCategories,
        affinity: u64,
        batches: Vec<SubmissionBatch>,
    ) -> Result<()> {
        self.select_queue(categories, affinity).submit(batches)
    }

    /// Block until every queue is idle, visiting them in order and
    /// short-circuiting on the first error.
    pub fn wait_idle(&self, deadline: Deadline) -> Result<()> {
        for queue in &self.queues {
            queue.wait_idle(deadline)?;
        }
        Ok(())
    }

    /// Block on a semaphore list under `mode` (see
    /// [`wait_semaphores`](crate::sync::wait_semaphores)).
    pub fn wait_semaphores(&self, mode: WaitMode, waits: &[SemaphoreWait], deadline: Deadline) -> Result<()> {
        let waits: Vec<(&dyn Semaphore, u64)> =
            waits.iter().map(|wait| (wait.semaphore.as_ref(), wait.value)).collect();
        wait_semaphores(mode, &waits, deadline)
    }

    /// Return pooled free blocks to the system allocator.
    pub fn trim(&self) {
        self.small_pool.trim();
        self.large_pool.trim();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("queues", &self.queues.len())
            .field("loaders", &self.loaders.len())
            .finish()
    }
}
