//! Self-relative pointers for position-independent shared-memory structures.
//!
//! The segment is mapped at a different base address in every attached
//! process, so no absolute pointer may ever be stored inside it. Every
//! cross-object link is instead a signed 64-bit byte offset **relative to
//! the field holding it**: a field at address `A` containing offset `o`
//! refers to address `A + o`. An offset of 0 means NULL by convention (a
//! field can never usefully point at itself).
//!
//! The offset is held in an `AtomicI64` so a single `RelPtr` store doubles
//! as an atomic publication point (the current-generation pointer relies on
//! this): `store` uses release ordering, `load` acquire ordering.
//!
//! Both field and target must live inside the same mapped segment for the
//! encoded offset to be meaningful in other processes; this is an invariant
//! of the callers, not checked here.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicI64, Ordering};

#[repr(transparent)]
pub struct RelPtr<T> {
    off: AtomicI64,
    _marker: PhantomData<*mut T>,
}

impl<T> RelPtr<T> {
    pub const fn null() -> Self {
        Self {
            off: AtomicI64::new(0),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.off.load(Ordering::Relaxed) == 0
    }

    /// Raw stored offset; for diagnostics only.
    #[inline]
    pub fn raw_offset(&self) -> i64 {
        self.off.load(Ordering::Relaxed)
    }

    /// Decode the target address, or NULL when the offset is 0.
    #[inline]
    pub fn load(&self) -> *mut T {
        let off = self.off.load(Ordering::Acquire);
        if off == 0 {
            core::ptr::null_mut()
        } else {
            ((self as *const Self as usize).wrapping_add_signed(off as isize)) as *mut T
        }
    }

    /// Encode `target` relative to this field. Storing NULL writes offset 0.
    #[inline]
    pub fn store(&self, target: *mut T) {
        let off = if target.is_null() {
            0
        } else {
            (target as usize as i64).wrapping_sub(self as *const Self as usize as i64)
        };
        self.off.store(off, Ordering::Release);
    }
}

// SAFETY: the offset word is atomic; the pointed-to data's synchronization
// is the responsibility of the surrounding protocol (lock or generation).
unsafe impl<T> Send for RelPtr<T> {}
unsafe impl<T> Sync for RelPtr<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_round_trip() {
        let p: RelPtr<u64> = RelPtr::null();
        assert!(p.is_null());
        assert!(p.load().is_null());
    }

    #[test]
    fn store_load_round_trip() {
        // Simulate two objects inside one region.
        let mut region = [0u8; 256];
        let base = region.as_mut_ptr();
        let field = base as *mut RelPtr<u64>;
        let target = unsafe { base.add(128) } as *mut u64;
        unsafe {
            field.write(RelPtr::null());
            (*field).store(target);
            assert_eq!((*field).load(), target);
            (*field).store(core::ptr::null_mut());
            assert!((*field).load().is_null());
        }
    }

    #[test]
    fn negative_offsets_work() {
        let mut region = [0u8; 256];
        let base = region.as_mut_ptr();
        let field = unsafe { base.add(192) } as *mut RelPtr<u32>;
        let target = base as *mut u32;
        unsafe {
            field.write(RelPtr::null());
            (*field).store(target);
            assert!((*field).raw_offset() < 0);
            assert_eq!((*field).load(), target);
        }
    }
}
