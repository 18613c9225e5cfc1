//! Per-owner allocation scope over a block allocator.
//!
//! A `MemoryContext` names the owner of a set of allocations and keeps
//! cumulative allocated/freed byte totals, charged with the rounded
//! power-of-two block size so the two counters balance exactly when every
//! allocation has been returned. A context whose counters differ at
//! teardown has leaked.

use core::sync::atomic::{AtomicU64, Ordering};

use flowplane_lib::{Name64, RelPtr};

use crate::block_alloc::{BlockAllocator, block_size_for};

#[repr(C)]
pub struct MemoryContext {
    name: Name64,
    alloc: RelPtr<BlockAllocator>,
    balloc_size: AtomicU64,
    bfree_size: AtomicU64,
}

impl MemoryContext {
    /// Initialise the context in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory inside the same mapped segment
    /// as `alloc`, which must be an initialised allocator.
    pub unsafe fn init(this: *mut Self, name: &str, alloc: *mut BlockAllocator) {
        let ctx = &mut *this;
        ctx.name = Name64::new(name).unwrap_or(Name64::empty());
        ctx.alloc = RelPtr::null();
        ctx.balloc_size = AtomicU64::new(0);
        ctx.bfree_size = AtomicU64::new(0);
        ctx.alloc.store(alloc);
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    fn allocator(&self) -> &BlockAllocator {
        unsafe { &*self.alloc.load() }
    }

    /// Allocate `size` bytes; NULL on failure (per-thread error indicator
    /// set by the allocator).
    pub fn alloc(&self, size: u64) -> *mut u8 {
        let ptr = self.allocator().alloc(size);
        if !ptr.is_null() {
            // block_size_for succeeded inside the allocator.
            let charged = block_size_for(size).unwrap_or(0);
            self.balloc_size.fetch_add(charged, Ordering::Relaxed);
        }
        ptr
    }

    /// Allocate and zero `size` bytes. The arena recycles blocks, so callers
    /// that rely on zero-initialised state must use this instead of
    /// [`alloc`](Self::alloc).
    pub fn alloc_zeroed(&self, size: u64) -> *mut u8 {
        let ptr = self.alloc(size);
        if !ptr.is_null() {
            unsafe { core::ptr::write_bytes(ptr, 0, size as usize) };
        }
        ptr
    }

    /// Return an allocation of `size` bytes.
    ///
    /// # Safety
    ///
    /// `ptr`/`size` must match a prior `alloc` on this context.
    pub unsafe fn free(&self, ptr: *mut u8, size: u64) {
        self.allocator().free(ptr, size);
        let charged = block_size_for(size).unwrap_or(0);
        self.bfree_size.fetch_add(charged, Ordering::Relaxed);
    }

    #[inline]
    pub fn balloc_size(&self) -> u64 {
        self.balloc_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bfree_size(&self) -> u64 {
        self.bfree_size.load(Ordering::Relaxed)
    }

    /// True when every allocated byte has been freed.
    #[inline]
    pub fn is_balanced(&self) -> bool {
        self.balloc_size() == self.bfree_size()
    }
}
