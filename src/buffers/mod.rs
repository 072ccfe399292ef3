//! Buffer management for the channel
//!
//! - `block`: pooled memory blocks, shared codec buffers, client buffers
//! - `pool`: block pools and pool identity
//! - `input`: input buffer set variants and extra-slot copies
//! - `output`: output buffer set with its reorder stash
//! - `stash`: ordering of completed output

pub mod block;
pub mod input;
pub mod output;
pub mod pool;
pub mod stash;

pub use block::{
    BufferData, BufferInfo, ClientBuffer, CodecBuffer, ConstGraphicBlock, ConstLinearBlock,
    GraphicBlock, LinearBlock, PixelFormat, Rect, SecureHandle, SharedMemory,
};
pub use input::{ExtraBuffers, InputAllocation, InputBuffers};
pub use output::{BufferAction, OutputBuffers};
pub use pool::{AllocatorId, BasicBlockPool, BlockPool, MemoryUsage, PoolId};
pub use stash::{ReorderStash, StashEntry};
