#![allow(unsafe_op_in_unsafe_fn)]

pub mod block_alloc;
pub mod context;
pub mod error;

#[cfg(test)]
mod tests;

pub use block_alloc::{
    BLOCK_MIN_SIZE, BLOCK_NUM_ORDERS, BlockAllocStats, BlockAllocator, block_size_for,
    order_for_size, order_size,
};
pub use context::MemoryContext;
pub use error::{MemError, MemResult, last_error, set_last_error, take_last_error};
