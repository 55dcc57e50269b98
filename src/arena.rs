//! Pooled block allocation for submission-scoped memory.
//!
//! A [`BlockPool`] hands out fixed-size blocks; an [`Arena`] bump-allocates
//! values into blocks acquired from a pool and releases everything together
//! when dropped, in O(blocks) time. There is no per-allocation free: data with
//! submission lifetime is reclaimed as one unit when the submission retires,
//! which removes piecemeal use-after-free bugs at the cost of holding memory
//! until the whole submission is done.
//!
//! # Handle validity
//!
//! [`ArenaBox`] is a raw handle into arena storage and carries no lifetime.
//! Holders must be ordered happens-before the arena's drop; the submission
//! pipeline guarantees this by moving the arena into the retire task, which
//! runs strictly after every task that reads from it.

use std::mem::{self, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;
use std::{fmt, slice};

use parking_lot::Mutex;
use snafu::ensure;

use crate::error::{InvalidArgumentSnafu, ResourceExhaustedSnafu, Result};

/// Smallest permitted block size, matching the device parameter floor.
pub const MIN_BLOCK_SIZE: usize = 512;

struct Block {
    storage: Box<[MaybeUninit<u8>]>,
    used: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        Self { storage: Box::new_uninit_slice(size), used: 0 }
    }
}

#[derive(Default)]
struct PoolState {
    free: Vec<Block>,
    outstanding: usize,
}

/// Thread-safe pool of fixed-size memory blocks.
///
/// Shared by all queues of one device; arenas acquire blocks from it and
/// return them on drop so steady-state submission traffic recycles a small
/// working set instead of hitting the system allocator.
pub struct BlockPool {
    block_size: usize,
    capacity: Option<usize>,
    state: Mutex<PoolState>,
}

impl BlockPool {
    /// Create a pool with unbounded outstanding blocks.
    pub fn new(block_size: usize) -> Result<Self> {
        Self::with_capacity(block_size, None)
    }

    /// Create a pool that refuses to hand out more than `capacity` blocks at
    /// a time, turning exhaustion into a recoverable `ResourceExhausted`.
    pub fn with_capacity(block_size: usize, capacity: Option<usize>) -> Result<Self> {
        ensure!(
            block_size >= MIN_BLOCK_SIZE,
            InvalidArgumentSnafu { reason: format!("block size {block_size} below minimum {MIN_BLOCK_SIZE}") }
        );
        Ok(Self { block_size, capacity, state: Mutex::new(PoolState::default()) })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks sitting in the free list.
    pub fn free_blocks(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Drop all pooled free blocks, returning their memory to the system.
    pub fn trim(&self) {
        self.state.lock().free.clear();
    }

    fn acquire(&self) -> Result<Block> {
        let mut state = self.state.lock();
        if let Some(block) = state.free.pop() {
            state.outstanding += 1;
            return Ok(block);
        }
        if let Some(capacity) = self.capacity
            && state.outstanding >= capacity
        {
            return ResourceExhaustedSnafu {
                reason: format!("block pool capacity of {capacity} blocks reached"),
            }
            .fail();
        }
        state.outstanding += 1;
        Ok(Block::new(self.block_size))
    }

    fn release(&self, mut block: Block) {
        block.used = 0;
        let mut state = self.state.lock();
        state.outstanding -= 1;
        state.free.push(block);
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockPool")
            .field("block_size", &self.block_size)
            .field("free", &state.free.len())
            .field("outstanding", &state.outstanding)
            .finish()
    }
}

type DropFn = unsafe fn(*mut u8, usize);

struct Dropper {
    ptr: *mut u8,
    len: usize,
    drop_fn: DropFn,
}

unsafe fn drop_slice<T>(ptr: *mut u8, len: usize) {
    // SAFETY: caller passes the pointer and length recorded at allocation time
    // for a fully initialized run of `T` values.
    unsafe { std::ptr::drop_in_place(slice::from_raw_parts_mut(ptr as *mut T, len)) }
}

/// Bump allocator over pooled blocks, owning everything allocated from it.
///
/// All values placed in the arena are dropped, and all blocks returned to the
/// pool, when the arena itself is dropped. Allocation is single-threaded by
/// design (`&mut self`); the pool underneath is internally synchronized.
pub struct Arena {
    pool: Arc<BlockPool>,
    blocks: Vec<Block>,
    droppers: Vec<Dropper>,
}

// SAFETY: blocks are heap storage reachable only through this arena, and
// `alloc`/`alloc_slice` require the stored values to be `Send`.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(pool: Arc<BlockPool>) -> Self {
        Self { pool, blocks: Vec::new(), droppers: Vec::new() }
    }

    /// Number of blocks currently backing this arena.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn alloc_raw(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        ensure!(
            size + align <= self.pool.block_size(),
            ResourceExhaustedSnafu {
                reason: format!(
                    "allocation of {size} bytes exceeds arena block size {}",
                    self.pool.block_size()
                ),
            }
        );
        if let Some(block) = self.blocks.last_mut() {
            let base = block.storage.as_mut_ptr() as usize;
            let aligned = (base + block.used).next_multiple_of(align);
            let offset = aligned - base;
            if offset + size <= block.storage.len() {
                block.used = offset + size;
                // SAFETY: `aligned` points into live block storage.
                return Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) });
            }
        }
        let mut block = self.pool.acquire()?;
        let base = block.storage.as_mut_ptr() as usize;
        let aligned = base.next_multiple_of(align);
        let offset = aligned - base;
        debug_assert!(offset + size <= block.storage.len());
        block.used = offset + size;
        self.blocks.push(block);
        // SAFETY: as above; the block was just pushed and its storage is stable
        // on the heap regardless of how `self.blocks` reallocates.
        Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    /// Move `value` into the arena.
    pub fn alloc<T: Send>(&mut self, value: T) -> Result<ArenaBox<T>> {
        let ptr = self.alloc_raw(mem::size_of::<T>(), mem::align_of::<T>())?.cast::<T>();
        // SAFETY: `alloc_raw` returned properly aligned storage for a `T`.
        unsafe { ptr.as_ptr().write(value) };
        if mem::needs_drop::<T>() {
            self.droppers.push(Dropper { ptr: ptr.as_ptr() as *mut u8, len: 1, drop_fn: drop_slice::<T> });
        }
        Ok(ArenaBox { ptr })
    }

    /// Clone `items` into a contiguous arena-backed slice.
    pub fn alloc_slice<T: Clone + Send>(&mut self, items: &[T]) -> Result<ArenaBox<[T]>> {
        if items.is_empty() {
            return Ok(ArenaBox { ptr: NonNull::slice_from_raw_parts(NonNull::dangling(), 0) });
        }
        let size = mem::size_of::<T>()
            .checked_mul(items.len())
            .ok_or_else(|| {
                ResourceExhaustedSnafu { reason: format!("slice of {} items overflows", items.len()) }.build()
            })?;
        let base = self.alloc_raw(size, mem::align_of::<T>())?.cast::<T>();
        for (i, item) in items.iter().enumerate() {
            // SAFETY: `alloc_raw` reserved room for `items.len()` values of `T`.
            unsafe { base.as_ptr().add(i).write(item.clone()) };
        }
        if mem::needs_drop::<T>() {
            self.droppers.push(Dropper { ptr: base.as_ptr() as *mut u8, len: items.len(), drop_fn: drop_slice::<T> });
        }
        Ok(ArenaBox { ptr: NonNull::slice_from_raw_parts(base, items.len()) })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for dropper in self.droppers.drain(..).rev() {
            // SAFETY: each dropper records a live, initialized allocation made
            // by this arena; nothing reads from the arena after this point.
            unsafe { (dropper.drop_fn)(dropper.ptr, dropper.len) };
        }
        for block in self.blocks.drain(..) {
            self.pool.release(block);
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena").field("blocks", &self.blocks.len()).field("block_size", &self.pool.block_size()).finish()
    }
}

/// Raw handle to a value owned by an [`Arena`].
///
/// The handle itself never frees anything; the arena drops the value when it
/// is released. Holders must not outlive the arena (see module docs).
pub struct ArenaBox<T: ?Sized> {
    ptr: NonNull<T>,
}

// SAFETY: the handle is a plain pointer to arena storage; cross-thread access
// is as safe as the pointee allows.
unsafe impl<T: ?Sized + Send> Send for ArenaBox<T> {}
unsafe impl<T: ?Sized + Sync> Sync for ArenaBox<T> {}

impl<T: ?Sized> Deref for ArenaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the owning arena outlives every handle per the module-level
        // ordering contract.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ?Sized> DerefMut for ArenaBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`; the handle is unique for mutation.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ArenaBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}
