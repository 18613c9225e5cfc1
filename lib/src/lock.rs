//! PID-valued spinlock living inside the shared segment.
//!
//! The lock word stores the PID of the current holder (0 when free), so any
//! attached process can tell who owns a zone and a crashed holder can be
//! detected. Acquisition is a plain compare-and-set loop with proportional
//! backoff; fairness is adequate because writers on the configuration plane
//! are rare and short.
//!
//! The lock is **not** reentrant: two threads of the same process contend
//! like any other pair of callers, and a single thread must not lock twice.
//!
//! # Dead-holder recovery
//!
//! A holder that exits without unlocking would wedge every writer. The spin
//! loop periodically probes the holder with `kill(pid, 0)`; once the PID no
//! longer exists the lock is reclaimed in place with a compare-and-set from
//! the dead PID, and a warning is logged. The protected state may be mid
//! update when this happens, so reclamation is logged loudly rather than
//! silently.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

use log::warn;

const UNLOCKED: u32 = 0;

/// Probe the holder's liveness once per this many failed CAS attempts.
const LIVENESS_PROBE_INTERVAL: u32 = 4096;

#[repr(C)]
pub struct PidLock {
    owner: AtomicU32,
}

pub struct PidLockGuard<'a> {
    lock: &'a PidLock,
}

impl PidLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(UNLOCKED),
        }
    }

    /// Reset the lock word. Only valid while initialising a freshly mapped
    /// region, before any other process can observe it.
    pub fn init(&self) {
        self.owner.store(UNLOCKED, Ordering::Release);
    }

    /// PID of the current holder, or 0 when free.
    #[inline]
    pub fn holder(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.holder() != UNLOCKED
    }

    /// Acquire the lock, spinning until it is free. Blocks indefinitely
    /// while the holder is alive; reclaims the lock if the holder dies.
    pub fn lock(&self) -> PidLockGuard<'_> {
        let pid = std::process::id();
        let mut attempts = 0u32;
        loop {
            match self.owner.compare_exchange_weak(
                UNLOCKED,
                pid,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return PidLockGuard { lock: self },
                Err(held) => {
                    attempts = attempts.wrapping_add(1);
                    if held != UNLOCKED
                        && attempts % LIVENESS_PROBE_INTERVAL == 0
                        && !holder_alive(held)
                    {
                        warn!("lock holder pid {held} is gone, reclaiming lock");
                        if self
                            .owner
                            .compare_exchange(held, pid, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                        {
                            return PidLockGuard { lock: self };
                        }
                    }
                    // Proportional backoff, capped; reduces cache-line
                    // traffic while another process holds the lock.
                    for _ in 0..(attempts % 64) {
                        spin_loop();
                    }
                }
            }
        }
    }

    /// Acquire the lock without waiting.
    pub fn try_lock(&self) -> Option<PidLockGuard<'_>> {
        let pid = std::process::id();
        self.owner
            .compare_exchange(UNLOCKED, pid, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| PidLockGuard { lock: self })
    }

    /// Force-release the lock without a guard.
    ///
    /// # Safety
    ///
    /// Only valid when the caller knows no live process holds the lock
    /// (supervisor recovery after a crash). The protected data may be in an
    /// inconsistent state.
    pub unsafe fn force_unlock(&self) {
        self.owner.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for PidLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PidLockGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        // Release ordering hands our writes to the next acquirer.
        self.lock.owner.store(UNLOCKED, Ordering::Release);
    }
}

fn holder_alive(pid: u32) -> bool {
    // pid_t is signed; anything that does not fit is not a real process,
    // and a negative argument to kill() would address a process group.
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but we may not signal it.
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_cycle() {
        let lock = PidLock::new();
        assert!(!lock.is_locked());
        {
            let _g = lock.lock();
            assert!(lock.is_locked());
            assert_eq!(lock.holder(), std::process::id());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = PidLock::new();
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn dead_holder_is_reclaimed() {
        let lock = PidLock::new();
        // Fake a holder that cannot exist: far beyond pid_max on any sane
        // configuration, but still a valid pid_t.
        lock.owner.store(0x7fff_fff0, Ordering::Release);
        let g = lock.lock();
        assert_eq!(lock.holder(), std::process::id());
        drop(g);
    }

    #[test]
    fn contention_between_threads() {
        let lock = std::sync::Arc::new(PidLock::new());
        let counter = std::sync::Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
