//! Device-side submission scheduling.
//!
//! This crate models a local execution device: a set of ordered submission
//! queues over a shared task executor, with timeline semaphores for
//! synchronization and pooled bump arenas for transient per-submission state.
//!
//! The main entry points:
//!
//! - [`Device`]: owns the queues, block pools, loaders, and executor handle.
//! - [`SubmissionBatch`]: waits + command buffers + signals, submitted to a
//!   queue chosen by affinity.
//! - [`TimelineSemaphore`]: monotonically increasing 64-bit timeline with
//!   terminal failure; [`wait_semaphores`] aggregates several with ALL/ANY
//!   semantics.
//! - [`Arena`]/[`BlockPool`]: pooled bump allocation released in O(blocks).
//!
//! Submission is asynchronous: `submit` returns once the batch is enqueued,
//! and execution outcomes travel through the batch's signal semaphores. A
//! failed batch *fails* its output semaphores with a retained status rather
//! than signaling them, so downstream waiters observe the root cause.

pub mod arena;
pub mod buffer;
pub mod command_buffer;
pub mod device;
pub mod error;
pub mod executor;
pub mod loader;
pub mod queue;
pub mod scope;
pub mod sync;

pub use arena::{Arena, ArenaBox, BlockPool};
pub use buffer::{Allocator, HeapAllocator, HostBuffer};
pub use command_buffer::{CommandBuffer, CommandCategories, ExecutionMode};
pub use device::{Device, DeviceParams};
pub use error::{Error, Result};
pub use executor::{Executor, LocalExecutor, Submission, Task};
pub use loader::{Executable, ExecutableLoader};
pub use queue::{Queue, SubmissionBatch};
pub use scope::Scope;
pub use sync::{
    Deadline, FAILURE_VALUE, Semaphore, SemaphoreSignal, SemaphoreWait, TimelineSemaphore,
    WaitMode, wait_semaphores,
};
