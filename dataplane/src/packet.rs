//! Packets, intrusive packet lists and the packet front.
//!
//! A packet front threads four lists through a pipeline: modules consume
//! `input` and sort packets into `output` (continue), `drops` (release) and
//! `bypass` (skip the remaining modules of this pipeline). Between module
//! invocations the driver swaps `output` back into `input`.
//!
//! Packets are plain records owned by the worker that dequeued them; the
//! lists are intrusive and never allocate. Payload access and NIC I/O live
//! outside this crate.

use core::ptr;

#[repr(C)]
#[derive(Debug)]
pub struct Packet {
    next: *mut Packet,
    pub rx_device: u32,
    pub tx_device: u32,
    pub hash: u32,
    pub len: u32,
}

impl Packet {
    pub fn new(rx_device: u32, hash: u32) -> Packet {
        Packet {
            next: ptr::null_mut(),
            rx_device,
            tx_device: 0,
            hash,
            len: 0,
        }
    }
}

/// Intrusive singly-linked packet list with O(1) push, pop and concat.
#[derive(Debug)]
pub struct PacketList {
    head: *mut Packet,
    tail: *mut Packet,
    len: u64,
}

impl PacketList {
    pub const fn new() -> PacketList {
        PacketList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Append one packet.
    ///
    /// # Safety
    ///
    /// `pkt` must be a live packet not currently on any list.
    pub unsafe fn push(&mut self, pkt: *mut Packet) {
        (*pkt).next = ptr::null_mut();
        if self.tail.is_null() {
            self.head = pkt;
        } else {
            (*self.tail).next = pkt;
        }
        self.tail = pkt;
        self.len += 1;
    }

    /// Detach and return the first packet, or null when empty.
    pub fn pop(&mut self) -> *mut Packet {
        let pkt = self.head;
        if pkt.is_null() {
            return pkt;
        }
        self.head = unsafe { (*pkt).next };
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        unsafe { (*pkt).next = ptr::null_mut() };
        self.len -= 1;
        pkt
    }

    /// Move every packet of `other` to the tail of `self`.
    pub fn append(&mut self, other: &mut PacketList) {
        if other.head.is_null() {
            return;
        }
        if self.tail.is_null() {
            self.head = other.head;
        } else {
            unsafe { (*self.tail).next = other.head };
        }
        self.tail = other.tail;
        self.len += other.len;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.len = 0;
    }
}

impl Default for PacketList {
    fn default() -> Self {
        Self::new()
    }
}

/// The four-list structure threaded through a pipeline's modules.
#[derive(Debug, Default)]
pub struct PacketFront {
    pub input: PacketList,
    pub output: PacketList,
    pub drops: PacketList,
    pub bypass: PacketList,
}

impl PacketFront {
    pub const fn new() -> PacketFront {
        PacketFront {
            input: PacketList::new(),
            output: PacketList::new(),
            drops: PacketList::new(),
            bypass: PacketList::new(),
        }
    }

    /// Module API: keep the packet, next module will see it.
    ///
    /// # Safety
    ///
    /// `pkt` must have been popped from this front's input.
    #[inline]
    pub unsafe fn output(&mut self, pkt: *mut Packet) {
        self.output.push(pkt);
    }

    /// Module API: release the packet.
    ///
    /// # Safety
    ///
    /// `pkt` must have been popped from this front's input.
    #[inline]
    pub unsafe fn drop_packet(&mut self, pkt: *mut Packet) {
        self.drops.push(pkt);
    }

    /// Module API: skip the remaining modules of this pipeline.
    ///
    /// # Safety
    ///
    /// `pkt` must have been popped from this front's input.
    #[inline]
    pub unsafe fn bypass(&mut self, pkt: *mut Packet) {
        self.bypass.push(pkt);
    }

    /// Driver API: make the previous module's output the next module's
    /// input. The module contract is to consume its whole input, so the
    /// outgoing input list is empty here.
    #[inline]
    pub fn switch(&mut self) {
        core::mem::swap(&mut self.input, &mut self.output);
    }
}
