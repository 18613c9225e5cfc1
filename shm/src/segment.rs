//! Attaching and creating the shared segment.
//!
//! The segment is a single file (conventionally hugepages-backed, e.g.
//! under `/dev/hugepages`) mapped MAP_SHARED into every participating
//! process. The dataplane creates and truncates it at startup; controlplane
//! agents attach to the existing file. Nothing persists across a dataplane
//! restart.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::info;

use crate::dp::DpConfig;
use crate::error::{ShmError, ShmResult};
use crate::layout::{MAX_ZONES, SEGMENT_HEADER_SIZE, SegmentHeader, segment_len};

#[derive(Debug)]
pub struct SharedMemory {
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is immutable process-local state (base/len); all
// shared mutation inside the segment is synchronised by its own locks and
// atomics.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create (truncating) and map a fresh segment. Zones are left blank;
    /// the dataplane initialises and marks them afterwards.
    pub fn create(path: &Path, storage_size: u64, zone_count: u32) -> ShmResult<SharedMemory> {
        if storage_size == 0
            || storage_size % 4096 != 0
            || zone_count == 0
            || zone_count > MAX_ZONES
        {
            return Err(ShmError::InvalidArgument);
        }
        let len = segment_len(storage_size, zone_count);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(file_err)?;
        file.set_len(len).map_err(file_err)?;

        let base = map_shared(file.as_raw_fd(), len as usize)?;
        unsafe { SegmentHeader::init(base as *mut SegmentHeader, storage_size, zone_count) };
        info!(
            "created segment {} ({} zones, {} KiB each)",
            path.display(),
            zone_count,
            storage_size >> 10
        );
        Ok(SharedMemory {
            base,
            len: len as usize,
        })
    }

    /// Map an existing segment created by a running dataplane.
    pub fn attach(path: &Path) -> ShmResult<SharedMemory> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(file_err)?;
        let len = file.metadata().map_err(file_err)?.len();
        if len < SEGMENT_HEADER_SIZE {
            return Err(ShmError::BadSegment);
        }

        let base = map_shared(file.as_raw_fd(), len as usize)?;
        let shm = SharedMemory {
            base,
            len: len as usize,
        };
        let header = shm.header();
        if !header.is_valid()
            || segment_len(header.storage_size(), header.zone_count()) != len
        {
            return Err(ShmError::BadSegment);
        }
        info!("attached segment {} (numa map {:#x})", path.display(), header.numa_map());
        Ok(shm)
    }

    #[inline]
    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    /// Bitmap of populated zones.
    #[inline]
    pub fn numa_map(&self) -> u32 {
        self.header().numa_map()
    }

    /// Dataplane configuration of a populated zone.
    pub fn dp_config(&self, numa_idx: u32) -> ShmResult<*mut DpConfig> {
        let header = self.header();
        if !header.zone_is_populated(numa_idx) {
            return Err(ShmError::ZoneEmpty { numa_idx });
        }
        Ok(unsafe { header.zone_base(numa_idx) } as *mut DpConfig)
    }

    /// Raw base of a zone, populated or not.
    pub fn zone_base(&self, idx: u32) -> ShmResult<*mut u8> {
        let header = self.header();
        if idx >= header.zone_count() {
            return Err(ShmError::InvalidArgument);
        }
        Ok(unsafe { header.zone_base(idx) })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

fn map_shared(fd: i32, len: usize) -> ShmResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::MapFailed {
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        });
    }
    Ok(ptr as *mut u8)
}

fn file_err(e: std::io::Error) -> ShmError {
    ShmError::FileFailed {
        errno: e.raw_os_error().unwrap_or(-1),
    }
}
