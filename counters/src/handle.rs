//! Resolved counter handles: the increment fast path.
//!
//! A handle caches the block page base and in-page line for one counter, so
//! the per-packet increment is pointer arithmetic plus a plain (non-atomic)
//! read-modify-write. Instances are write-partitioned — each DP worker
//! owns one instance index — so no atomics are needed on the hot path;
//! cross-instance reads are eventually consistent.

use crate::registry::{COUNTER_PAGE_SIZE, CounterRegistry};
use crate::storage::{CounterBlock, CounterStorage};

#[derive(Clone, Copy, Debug)]
pub struct CounterHandle {
    pages: *mut u8,
    line: u64,
    size: u64,
}

impl CounterHandle {
    /// Resolve counter `id` against a registry and a storage snapshot.
    /// Returns `None` while the counter is registered but not yet linked,
    /// or when the id is unknown.
    ///
    /// # Safety
    ///
    /// `storage` must be a live snapshot spawned against `registry` (or a
    /// successor that preserved its offsets).
    pub unsafe fn resolve(
        storage: *const CounterStorage,
        registry: &CounterRegistry,
        id: u64,
    ) -> Option<CounterHandle> {
        let entry = registry.entry(id)?;
        if !entry.is_linked() {
            return None;
        }
        let block_idx = entry.offset() / COUNTER_PAGE_SIZE;
        let line = entry.offset() % COUNTER_PAGE_SIZE;
        let block = (*storage).block(entry.pool(), block_idx)?;
        Some(CounterHandle {
            pages: CounterBlock::pages(block),
            line,
            size: entry.size(),
        })
    }

    /// Number of 64-bit slots this counter spans.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    unsafe fn slot_ptr(&self, instance: u64, slot: u64) -> *mut u64 {
        let page = self.pages.add((instance * COUNTER_PAGE_SIZE + self.line) as usize);
        (page as *mut u64).add(slot as usize)
    }

    /// Add `delta` to one slot of one instance. No synchronisation: the
    /// instance must be owned by the calling worker.
    ///
    /// # Safety
    ///
    /// `instance` must be below the snapshot's instance count and `slot`
    /// below [`size`](Self::size); the backing snapshot must be live.
    #[inline]
    pub unsafe fn add(&self, instance: u64, slot: u64, delta: u64) {
        let p = self.slot_ptr(instance, slot);
        *p = (*p).wrapping_add(delta);
    }

    /// Read one slot of one instance.
    ///
    /// # Safety
    ///
    /// Same bounds requirements as [`add`](Self::add).
    #[inline]
    pub unsafe fn value(&self, instance: u64, slot: u64) -> u64 {
        *self.slot_ptr(instance, slot)
    }

    /// Element-wise sum of this counter across `instance_count` instances
    /// into `accum` (clamped to the counter's slot count).
    ///
    /// # Safety
    ///
    /// `instance_count` must not exceed the snapshot's instance count.
    pub unsafe fn accumulate(&self, accum: &mut [u64], instance_count: u64) {
        let slots = self.size.min(accum.len() as u64);
        for instance in 0..instance_count {
            for slot in 0..slots {
                accum[slot as usize] = accum[slot as usize]
                    .wrapping_add(self.value(instance, slot));
            }
        }
    }
}
