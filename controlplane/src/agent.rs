//! Controlplane agents.
//!
//! An `Agent` is the process-local handle for one (process, NUMA zone)
//! attachment. Attaching carves a `memory_limit`-byte sub-arena out of the
//! zone's controlplane allocator, initialises the agent's own block
//! allocator and memory context over it, and links the shared record into
//! the zone agent list. Module configuration objects are allocated from the
//! agent's arena and handed to the publisher; superseded records come back
//! on the agent's free list after quiescence and are reclaimed by
//! [`collect`](Agent::collect), the only place free handlers run (function
//! pointers are meaningless outside the owning process).
//!
//! Detach first publishes a generation with all of the agent's modules
//! removed, reclaims the free list, then returns the sub-arena to the zone
//! allocator. A crashed agent's lock can be recovered; its record is
//! reported by introspection until a supervisor cleans up.

use core::mem::size_of;
use std::sync::Arc;

use flowplane_lib::Name80;
use flowplane_mem::block_size_for;
use flowplane_shm::cp::CpConfig;
use flowplane_shm::dp::DpConfig;
use flowplane_shm::module::{AgentRecord, ModuleData};
use flowplane_shm::segment::SharedMemory;
use log::{error, info};

use crate::error::{CpError, CpResult};
use crate::publish::{self, PublishOptions};

/// Destructor for a module data record's payload, invoked by the owning
/// process during [`Agent::collect`]. The record itself is freed by the
/// agent afterwards.
pub type ModuleFreeFn = unsafe fn(*mut ModuleData);

/// One pipeline: an ordered list of `(module type, instance name)` pairs.
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub modules: Vec<(String, String)>,
}

/// Pipeline selection map for one device id: `(pipeline index, weight)`.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub device_id: u32,
    pub pipelines: Vec<(u64, u64)>,
}

#[derive(Debug)]
pub struct Agent {
    _shm: Arc<SharedMemory>,
    dp: *mut DpConfig,
    cp: *mut CpConfig,
    rec: *mut AgentRecord,
    numa_idx: u32,
    opts: PublishOptions,
}

// SAFETY: the raw pointers reference the pinned shared mapping kept alive
// by the Arc; all shared mutation goes through the zone lock.
unsafe impl Send for Agent {}

impl Agent {
    /// Attach to a populated zone, carving a `memory_limit`-byte arena.
    pub fn attach(
        shm: Arc<SharedMemory>,
        numa_idx: u32,
        name: &str,
        memory_limit: u64,
    ) -> CpResult<Agent> {
        let name80 = Name80::new(name).ok_or(CpError::InvalidArgument)?;
        if memory_limit == 0 {
            return Err(CpError::InvalidArgument);
        }
        let dp = shm.dp_config(numa_idx)?;
        let cp = unsafe { (*dp).cp_config() };
        let pid = std::process::id();

        unsafe {
            let cpr = &*cp;
            let _guard = cpr.lock().lock();
            if !cpr.find_agent(&name80, pid).is_null() {
                return Err(CpError::Exists);
            }

            let arena_size = block_size_for(memory_limit).ok_or(CpError::InvalidArgument)?;
            let rec = cpr.mctx().alloc_zeroed(size_of::<AgentRecord>() as u64) as *mut AgentRecord;
            if rec.is_null() {
                return Err(CpError::OutOfMemory);
            }
            let arena = cpr.mctx().alloc(arena_size);
            if arena.is_null() {
                cpr.mctx().free(rec as *mut u8, size_of::<AgentRecord>() as u64);
                return Err(CpError::OutOfMemory);
            }

            AgentRecord::init(rec, name80, pid, memory_limit, arena, arena_size);
            cpr.link_agent(rec);
            info!("agent {name} attached to zone {numa_idx} ({arena_size} byte arena)");

            Ok(Agent {
                _shm: shm,
                dp,
                cp,
                rec,
                numa_idx,
                opts: PublishOptions::default(),
            })
        }
    }

    /// Configure publication behaviour (quiescence deadline) for this
    /// agent's updates. Detach always blocks regardless.
    pub fn set_publish_options(&mut self, opts: PublishOptions) {
        self.opts = opts;
    }

    #[inline]
    pub fn numa_idx(&self) -> u32 {
        self.numa_idx
    }

    pub fn name(&self) -> &str {
        unsafe { (*self.rec).name() }
    }

    /// Cumulative bytes allocated from the agent arena.
    pub fn allocated(&self) -> u64 {
        unsafe { (*self.rec).mctx().balloc_size() }
    }

    /// Cumulative bytes returned to the agent arena.
    pub fn freed(&self) -> u64 {
        unsafe { (*self.rec).mctx().bfree_size() }
    }

    /// Modules of this agent referenced by the current generation.
    pub fn loaded_module_count(&self) -> u64 {
        unsafe { (*self.rec).loaded_module_count() }
    }

    /// Allocate a module data record in the agent arena for the module
    /// kind `kind` (resolved through the immutable dataplane table), with
    /// `payload_size` bytes of kind-specific payload following the header.
    pub fn alloc_module_data(
        &self,
        kind: &str,
        name: &str,
        payload_size: u64,
        free_handler: Option<ModuleFreeFn>,
    ) -> CpResult<*mut ModuleData> {
        let dp = unsafe { &*self.dp };
        let index = dp.lookup_module(kind).ok_or(CpError::NotFound)?;
        let name80 = Name80::new(name).ok_or(CpError::InvalidArgument)?;
        let size = ModuleData::payload_offset() + payload_size;

        let rec = unsafe { &*self.rec };
        let ptr = rec.mctx().alloc_zeroed(size);
        if ptr.is_null() {
            return Err(CpError::OutOfMemory);
        }
        let m = ptr as *mut ModuleData;
        let handler = free_handler.map(|f| f as usize as u64).unwrap_or(0);
        unsafe { ModuleData::init(m, index, name80, size, self.rec, handler) };
        Ok(m)
    }

    /// Free a module data record that was never published (error paths).
    ///
    /// # Safety
    ///
    /// `m` must come from [`alloc_module_data`](Self::alloc_module_data) on
    /// this agent and must not be referenced by any generation.
    pub unsafe fn free_module_data(&self, m: *mut ModuleData) {
        let size = (*m).size();
        (*self.rec).mctx().free(m as *mut u8, size);
    }

    /// Publish a batch of module data records: replacements for matching
    /// `(kind, name)` slots, appends otherwise.
    pub fn update_modules(&self, modules: &[*mut ModuleData]) -> CpResult<()> {
        unsafe { publish::update_modules(&*self.dp, &*self.cp, modules, &self.opts) }
    }

    /// Replace the pipeline registry.
    pub fn update_pipelines(&self, pipelines: &[PipelineConfig]) -> CpResult<()> {
        unsafe { publish::update_pipelines(&*self.dp, &*self.cp, pipelines, &self.opts) }
    }

    /// Assign pipeline selection maps per device id; unnamed ids keep their
    /// current descriptors.
    pub fn update_devices(&self, devices: &[DeviceConfig]) -> CpResult<()> {
        unsafe { publish::update_devices(&*self.dp, &*self.cp, devices, &self.opts) }
    }

    /// Register a counter in the zone registry. The id is stable; storage
    /// is linked at the next publication.
    pub fn register_counter(&self, name: &str, size: u64) -> CpResult<u64> {
        unsafe {
            let cp = &*self.cp;
            let _guard = cp.lock().lock();
            cp.counters()
                .register(cp.mctx(), name, size, cp.gen_counter())
                .map_err(|e| match e {
                    flowplane_counters::CounterError::OutOfMemory => CpError::OutOfMemory,
                    _ => CpError::InvalidArgument,
                })
        }
    }

    /// Reclaim retired module data: drains the agent free list, invoking
    /// free handlers and returning the records to the agent arena. Returns
    /// the number reclaimed.
    pub fn collect(&self) -> u64 {
        unsafe {
            let rec = &*self.rec;
            // The publisher splices onto the free list under the zone lock;
            // detaching the whole list under the same lock makes the rest
            // of the walk exclusively ours.
            let cur = {
                let _guard = (*self.cp).lock().lock();
                rec.take_free()
            };
            let mut cur = cur;
            let mut reclaimed = 0u64;
            while !cur.is_null() {
                let next = (*cur).link_ptr();
                let handler = (*cur).free_handler();
                if handler != 0 {
                    let f: ModuleFreeFn = core::mem::transmute(handler as usize);
                    f(cur);
                }
                let size = (*cur).size();
                rec.mctx().free(cur as *mut u8, size);
                cur = next;
                reclaimed += 1;
            }
            reclaimed
        }
    }

    /// Detach from the zone: unpublish this agent's modules (blocking for
    /// quiescence), reclaim the free list, and return the sub-arena. The
    /// zone memory context balances again once this returns.
    pub fn detach(self) -> CpResult<()> {
        unsafe {
            publish::remove_agent_modules(&*self.dp, &*self.cp, self.rec)?;
            self.collect();

            let cp = &*self.cp;
            let rec = &*self.rec;
            let name = rec.name().to_string();
            let _guard = cp.lock().lock();
            if !rec.mctx().is_balanced() {
                // Quality surface, not fatal: report the leak and proceed.
                error!(
                    "agent {name} leaked arena memory ({} allocated, {} freed)",
                    rec.mctx().balloc_size(),
                    rec.mctx().bfree_size()
                );
            }
            let arena = rec.arena_ptr();
            let arena_size = rec.arena_size();
            cp.unlink_agent(self.rec);
            cp.mctx().free(arena, arena_size);
            cp.mctx()
                .free(self.rec as *mut u8, size_of::<AgentRecord>() as u64);
            info!("agent {name} detached");
            Ok(())
        }
    }
}
