//! Host-memory buffers and the device memory allocator seam.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use snafu::ensure;
use tracing::trace;

use crate::error::{InvalidArgumentSnafu, Result};

/// A host-visible buffer with interior mutability.
///
/// Commands recorded against a buffer execute on worker threads, so access
/// goes through a lock rather than `&mut`.
pub struct HostBuffer {
    data: Mutex<Box<[u8]>>,
    len: usize,
}

impl HostBuffer {
    fn new(len: usize) -> Self {
        Self { data: Mutex::new(vec![0u8; len].into_boxed_slice()), len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `bytes` into the buffer at `offset`. Out-of-range writes are
    /// rejected without touching the buffer.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset.checked_add(bytes.len());
        ensure!(
            end.is_some_and(|end| end <= self.len),
            InvalidArgumentSnafu {
                reason: format!(
                    "write of {} byte(s) at offset {offset} exceeds buffer length {}",
                    bytes.len(),
                    self.len
                ),
            }
        );
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `len` bytes out of the buffer starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let end = offset.checked_add(len);
        ensure!(
            end.is_some_and(|end| end <= self.len),
            InvalidArgumentSnafu {
                reason: format!("read of {len} byte(s) at offset {offset} exceeds buffer length {}", self.len),
            }
        );
        Ok(self.data.lock()[offset..offset + len].to_vec())
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len).finish()
    }
}

/// Device memory allocator seam; the device owns one for its whole lifetime.
pub trait Allocator: Send + Sync + fmt::Debug {
    fn allocate(&self, size: usize) -> Result<Arc<HostBuffer>>;
}

/// Default allocator backed by the process heap.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    allocated_bytes: AtomicUsize,
}

impl HeapAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total bytes handed out over the allocator's lifetime.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }
}

impl Allocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<Arc<HostBuffer>> {
        self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        trace!(size, "heap buffer allocated");
        Ok(Arc::new(HostBuffer::new(size)))
    }
}
