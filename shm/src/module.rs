//! Agent records and module data headers.
//!
//! A **module data** record is the controlplane-side description of one
//! configured module instance. It lives in the owning agent's sub-arena and
//! starts with the common header defined here; a kind-specific payload
//! follows. The record is linked three ways: back to its owning agent, to
//! the version it superseded (`prev`, kept only until reclamation) and into
//! the agent's free list once retired.
//!
//! An **agent record** is the shared-memory half of an attached agent: its
//! identity, byte budget, the block allocator and memory context over its
//! own sub-arena, and the free list of retired module data waiting for the
//! owning process to reclaim them.

use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

use flowplane_lib::{Name80, RelPtr};
use flowplane_mem::{BlockAllocator, MemoryContext};

#[repr(C)]
pub struct ModuleData {
    index: u32,
    _pad0: u32,
    generation: AtomicU64,
    size: u64,
    free_handler: u64,
    name: Name80,
    agent: RelPtr<AgentRecord>,
    prev: RelPtr<ModuleData>,
    link: RelPtr<ModuleData>,
    _pad1: u64,
}

impl ModuleData {
    /// Byte offset of the kind-specific payload (16-byte aligned).
    pub const fn payload_offset() -> u64 {
        size_of::<ModuleData>() as u64
    }

    /// Initialise a freshly allocated record.
    ///
    /// # Safety
    ///
    /// `this` must point to `size >= payload_offset()` writable bytes in
    /// the same segment as `agent`.
    pub unsafe fn init(
        this: *mut Self,
        index: u32,
        name: Name80,
        size: u64,
        agent: *mut AgentRecord,
        free_handler: u64,
    ) {
        let m = &mut *this;
        m.index = index;
        m._pad0 = 0;
        m.generation = AtomicU64::new(0);
        m.size = size;
        m.free_handler = free_handler;
        m.name = name;
        m.agent = RelPtr::null();
        m.prev = RelPtr::null();
        m.link = RelPtr::null();
        m._pad1 = 0;
        m.agent.store(agent);
    }

    /// Dataplane module kind this record configures.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation in which this record became current.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Full allocation size (header + payload), needed to free the record.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    pub fn name_raw(&self) -> &Name80 {
        &self.name
    }

    /// Raw free handler, meaningful only inside the owning process.
    #[inline]
    pub fn free_handler(&self) -> u64 {
        self.free_handler
    }

    #[inline]
    pub fn matches(&self, index: u32, name: &Name80) -> bool {
        self.index == index && self.name == *name
    }

    #[inline]
    pub fn agent_ptr(&self) -> *mut AgentRecord {
        self.agent.load()
    }

    #[inline]
    pub fn prev_ptr(&self) -> *mut ModuleData {
        self.prev.load()
    }

    #[inline]
    pub fn set_prev(&self, prev: *mut ModuleData) {
        self.prev.store(prev);
    }

    #[inline]
    pub fn link_ptr(&self) -> *mut ModuleData {
        self.link.load()
    }

    #[inline]
    pub fn set_link(&self, link: *mut ModuleData) {
        self.link.store(link);
    }

    /// Base of the kind-specific payload.
    ///
    /// # Safety
    ///
    /// The record must have been allocated with at least
    /// [`payload_offset`](Self::payload_offset) + payload bytes.
    #[inline]
    pub unsafe fn payload(&self) -> *mut u8 {
        (self as *const Self as *mut u8).add(Self::payload_offset() as usize)
    }

    #[inline]
    pub fn payload_size(&self) -> u64 {
        self.size - Self::payload_offset()
    }
}

#[repr(C)]
pub struct AgentRecord {
    name: Name80,
    pid: u32,
    _pad0: u32,
    memory_limit: u64,
    arena_size: u64,
    loaded_module_count: AtomicU64,
    next: RelPtr<AgentRecord>,
    arena: RelPtr<u8>,
    free_list: RelPtr<ModuleData>,
    balloc: BlockAllocator,
    mctx: MemoryContext,
}

impl AgentRecord {
    /// Initialise an agent record over its freshly carved sub-arena.
    ///
    /// # Safety
    ///
    /// `this` and `arena..arena+arena_size` must be valid, exclusively
    /// owned regions inside the same segment.
    pub unsafe fn init(
        this: *mut Self,
        name: Name80,
        pid: u32,
        memory_limit: u64,
        arena: *mut u8,
        arena_size: u64,
    ) {
        let a = &mut *this;
        a.name = name;
        a.pid = pid;
        a._pad0 = 0;
        a.memory_limit = memory_limit;
        a.arena_size = arena_size;
        a.loaded_module_count = AtomicU64::new(0);
        a.next = RelPtr::null();
        a.arena = RelPtr::null();
        a.free_list = RelPtr::null();
        a.arena.store(arena);
        BlockAllocator::init(&mut a.balloc as *mut _, arena, arena_size);
        MemoryContext::init(&mut a.mctx as *mut _, name.as_str(), &mut a.balloc as *mut _);
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    pub fn name_raw(&self) -> &Name80 {
        &self.name
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[inline]
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    #[inline]
    pub fn arena_ptr(&self) -> *mut u8 {
        self.arena.load()
    }

    #[inline]
    pub fn arena_size(&self) -> u64 {
        self.arena_size
    }

    #[inline]
    pub fn mctx(&self) -> &MemoryContext {
        &self.mctx
    }

    #[inline]
    pub fn loaded_module_count(&self) -> u64 {
        self.loaded_module_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn inc_loaded(&self) {
        self.loaded_module_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_loaded(&self) {
        self.loaded_module_count.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn next_ptr(&self) -> *mut AgentRecord {
        self.next.load()
    }

    #[inline]
    pub fn set_next(&self, next: *mut AgentRecord) {
        self.next.store(next);
    }

    #[inline]
    pub(crate) fn next_slot(&self) -> &RelPtr<AgentRecord> {
        &self.next
    }

    /// Push a retired module data record onto this agent's free list.
    ///
    /// # Safety
    ///
    /// Caller holds the zone configuration lock; `m` must be unreachable
    /// from any published generation.
    pub unsafe fn push_free(&self, m: *mut ModuleData) {
        (*m).set_link(self.free_list.load());
        self.free_list.store(m);
    }

    /// Detach the whole free list for reclamation by the owning process.
    ///
    /// # Safety
    ///
    /// Caller must be the owning process (free handlers are about to run).
    pub unsafe fn take_free(&self) -> *mut ModuleData {
        let head = self.free_list.load();
        self.free_list.store(core::ptr::null_mut());
        head
    }
}
