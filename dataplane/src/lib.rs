#![allow(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod module;
pub mod packet;
pub mod worker;

pub use error::{DpError, DpResult};
pub use module::{ModuleDataView, ModuleDef, ModuleHandler};
pub use packet::{Packet, PacketFront, PacketList};
pub use worker::{DpInstance, DpOptions, Worker};
