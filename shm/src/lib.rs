#![allow(unsafe_op_in_unsafe_fn)]

pub mod cp;
pub mod dp;
pub mod error;
pub mod layout;
pub mod module;
pub mod segment;

pub use cp::{ConfigGen, CpConfig, Device, DevicePipelineRef, DeviceRegistry, ModuleRegistry,
    Pipeline, PipelineRegistry};
pub use dp::{DpConfig, DpModuleEntry, DpWorker};
pub use error::{ShmError, ShmResult};
pub use layout::{MAX_ZONES, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, SegmentHeader, segment_len};
pub use module::{AgentRecord, ModuleData};
pub use segment::SharedMemory;
