use std::alloc::Layout;
use std::error::Error;
use std::fmt;
use std::ptr;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

/// The `AllocError` error indicates an allocation failure
/// that may be due to resource exhaustion or to
/// something wrong when combining the given input arguments with this
/// allocator.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl Error for AllocError {}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

/// Memory allocation.
///
/// # Safety
///
/// A block returned by `allocate` must stay valid until it is passed to `deallocate`
/// with the same layout, and must not overlap any other live block.
pub unsafe trait Allocator {
    /// Attempts to allocate a block of memory.
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError>;

    /// Deallocates the memory referenced by `ptr`.
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator for `layout`, and not already deallocated.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Attempts to extend the memory block.
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator for `old_layout`.
    /// On success the old block has been deallocated.
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(
            new_layout.size() >= old_layout.size(),
            "`new_layout.size()` must be greater than or equal to `old_layout.size()`"
        );

        let new_ptr = self.allocate(new_layout)?;

        let len = old_layout.size();

        ptr::copy_nonoverlapping(
            ptr.as_ptr().cast::<u8>(),
            new_ptr.as_ptr().cast::<u8>(),
            len,
        );
        self.deallocate(ptr, old_layout);

        Ok(new_ptr)
    }
}

unsafe impl<A> Allocator for &A
where
    A: Allocator + ?Sized,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the safety contract must be upheld by the caller
        unsafe { (**self).deallocate(ptr, layout) }
    }

    #[inline]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        // SAFETY: the safety contract must be upheld by the caller
        unsafe { (**self).grow(ptr, old_layout, new_layout) }
    }
}

/// Default implementation of Allocator.
#[derive(Clone, Copy, Default, Debug)]
pub struct Global;

unsafe impl Allocator for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        match layout.size() {
            0 => Ok(NonNull::slice_from_raw_parts(NonNull::dangling(), 0)),
            size => unsafe {
                let raw_ptr = std::alloc::alloc(layout);
                let ptr = NonNull::new(raw_ptr).ok_or(AllocError)?;
                Ok(NonNull::slice_from_raw_parts(ptr, size))
            },
        }
    }
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// Default number of released blocks a [`Pool`] keeps before handing them back.
pub const DEFAULT_POOL_LIMIT: usize = 64;

/// A released block waiting on the free list.
struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Blocks are plain memory owned by the pool, only touched under its lock.
unsafe impl Send for Block {}

struct Shared<A: Allocator> {
    alloc: A,
    limit: usize,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    free: Vec<Block>,
    hits: u64,
    misses: u64,
}

impl<A: Allocator> Drop for Shared<A> {
    fn drop(&mut self) {
        for b in self.state.get_mut().free.drain(..) {
            unsafe { self.alloc.deallocate(b.ptr, b.layout) };
        }
    }
}

/// Counters describing how a [`Pool`] has served requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests satisfied from the free list.
    pub hits: u64,
    /// Requests passed through to the wrapped allocator.
    pub misses: u64,
}

/// Allocator that recycles released node buffers through a lock-guarded free list.
///
/// Clones share one free list, so several trees ( possibly on different threads )
/// can hand storage back and forth without going to the wrapped allocator.
/// A request is served from the free list only when a block with the identical
/// [`Layout`] is available.
///
/// # Example
///
/// ```
/// use redblack::{alloc::Pool, collections::RBTree};
/// let pool = Pool::new();
/// {
///     let mut t = RBTree::new_in(pool.clone());
///     t.insert(1, "one");
/// }
/// // The dropped tree's node buffer is now cached.
/// assert_eq!(pool.cached(), 1);
/// let mut t = RBTree::<i32, &str, _, _>::new_in(pool.clone());
/// t.insert(2, "two");
/// assert_eq!(pool.stats().hits, 1);
/// ```
pub struct Pool<A: Allocator = Global> {
    shared: Arc<Shared<A>>,
}

impl<A: Allocator> Clone for Pool<A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// New pool over the global allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::new_in(Global)
    }

    /// New pool over the global allocator keeping at most `limit` released blocks.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self::with_limit_in(limit, Global)
    }
}

impl<A: Allocator> Pool<A> {
    /// New pool that obtains fresh blocks from `alloc`.
    pub fn new_in(alloc: A) -> Self {
        Self::with_limit_in(DEFAULT_POOL_LIMIT, alloc)
    }

    /// New pool over `alloc` keeping at most `limit` released blocks.
    pub fn with_limit_in(limit: usize, alloc: A) -> Self {
        Self {
            shared: Arc::new(Shared {
                alloc,
                limit,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Number of released blocks currently held.
    pub fn cached(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    /// Snapshot of the hit/miss counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            hits: state.hits,
            misses: state.misses,
        }
    }

    fn take(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut state = self.shared.state.lock();
        match state.free.iter().rposition(|b| b.layout == layout) {
            Some(i) => {
                state.hits += 1;
                Some(state.free.swap_remove(i).ptr)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }
}

unsafe impl<A: Allocator> Allocator for Pool<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if let Some(ptr) = self.take(layout) {
            trace_log!(size = layout.size(), "pool hit");
            return Ok(NonNull::slice_from_raw_parts(ptr, layout.size()));
        }
        trace_log!(size = layout.size(), "pool miss");
        self.shared.alloc.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            if state.free.len() < self.shared.limit {
                state.free.push(Block { ptr, layout });
                return;
            }
        }
        self.shared.alloc.deallocate(ptr, layout);
    }
}
