//! Shared segment layout.
//!
//! The segment begins with a page-sized header, followed by `zone_count`
//! consecutive zones of `storage_size` bytes each. Zone `k` sits at
//! `base + zones_offset + k * storage_size`; a bitmap in the header records
//! which zones have been populated with a dataplane configuration. Every
//! field is fixed-width and every in-segment link is a self-relative
//! offset, so the layout is bit-exact across processes mapping the segment
//! at different addresses.

use core::sync::atomic::{AtomicU32, Ordering};

pub const SEGMENT_MAGIC: u64 = 0x454e_4c50_574f_4c46; // "FLOWPLNE"

/// The header occupies one page so zone 0 starts page-aligned.
pub const SEGMENT_HEADER_SIZE: u64 = 4096;

/// The populated-zone bitmap is 32 bits wide.
pub const MAX_ZONES: u32 = 32;

#[repr(C)]
pub struct SegmentHeader {
    magic: u64,
    storage_size: u64,
    zone_count: u32,
    numa_map: AtomicU32,
    zones_offset: u64,
}

impl SegmentHeader {
    /// Write a fresh header.
    ///
    /// # Safety
    ///
    /// `this` must point to the base of a writable mapping of at least
    /// [`segment_len`] bytes, not yet visible to other processes.
    pub unsafe fn init(this: *mut Self, storage_size: u64, zone_count: u32) {
        let h = &mut *this;
        h.magic = SEGMENT_MAGIC;
        h.storage_size = storage_size;
        h.zone_count = zone_count;
        h.numa_map = AtomicU32::new(0);
        h.zones_offset = SEGMENT_HEADER_SIZE;
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC
    }

    #[inline]
    pub fn storage_size(&self) -> u64 {
        self.storage_size
    }

    #[inline]
    pub fn zone_count(&self) -> u32 {
        self.zone_count
    }

    /// Bitmap of populated zones.
    #[inline]
    pub fn numa_map(&self) -> u32 {
        self.numa_map.load(Ordering::Acquire)
    }

    #[inline]
    pub fn zone_is_populated(&self, idx: u32) -> bool {
        idx < self.zone_count && self.numa_map() & (1 << idx) != 0
    }

    /// Mark a zone populated; called after its dataplane configuration is
    /// fully initialised.
    pub fn mark_zone(&self, idx: u32) {
        self.numa_map.fetch_or(1 << idx, Ordering::Release);
    }

    /// Base address of zone `idx` within this mapping.
    ///
    /// # Safety
    ///
    /// `idx` must be below [`zone_count`](Self::zone_count).
    #[inline]
    pub unsafe fn zone_base(&self, idx: u32) -> *mut u8 {
        (self as *const Self as *mut u8)
            .add((self.zones_offset + idx as u64 * self.storage_size) as usize)
    }
}

/// Total segment length for the given geometry.
pub const fn segment_len(storage_size: u64, zone_count: u32) -> u64 {
    SEGMENT_HEADER_SIZE + zone_count as u64 * storage_size
}
