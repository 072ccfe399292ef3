//! Block pools.
//!
//! A pool hands out [`LinearBlock`]s and [`GraphicBlock`]s and takes their
//! memory back when the last shared reference drops. Every pool carries a
//! generation: blocks fetched before [`BlockPool::bump_generation`] are
//! stale and are never recycled into the new generation.

use crate::buffers::block::{BlockStorage, GraphicBlock, LinearBlock, PixelFormat};
use crate::error::{Result, Status};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Opaque identity of a block pool.
pub type PoolId = u64;

/// Pools every component understands without creating them.
pub const BASIC_LINEAR_POOL: PoolId = 0;
pub const BASIC_GRAPHIC_POOL: PoolId = 1;
/// First id handed out for component-created pools.
pub const PLATFORM_POOL_START: PoolId = 16;
/// Id carried by blocks allocated outside any pool.
pub const DETACHED_POOL: PoolId = PoolId::MAX;

/// Number of freed allocations kept for reuse.
const MAX_FREE_BLOCKS: usize = 16;

/// Allocator backing a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorId {
    /// Plain linear memory.
    Linear,
    /// Plain graphic memory.
    Graphic,
    /// Protected linear memory.
    SecureLinear,
    /// Graphic memory dequeued from an output surface.
    BufferQueue,
}

impl AllocatorId {
    pub fn is_graphic(&self) -> bool {
        matches!(self, AllocatorId::Graphic | AllocatorId::BufferQueue)
    }
}

impl std::fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocatorId::Linear => write!(f, "linear"),
            AllocatorId::Graphic => write!(f, "graphic"),
            AllocatorId::SecureLinear => write!(f, "secure-linear"),
            AllocatorId::BufferQueue => write!(f, "buffer-queue"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub cpu_read: bool,
    pub cpu_write: bool,
    pub protected: bool,
}

impl MemoryUsage {
    pub const CPU_READ_WRITE: MemoryUsage = MemoryUsage {
        cpu_read: true,
        cpu_write: true,
        protected: false,
    };

    pub const PROTECTED: MemoryUsage = MemoryUsage {
        cpu_read: false,
        cpu_write: false,
        protected: true,
    };
}

/// Allocator abstraction producing linear or graphic memory blocks.
pub trait BlockPool: Send + Sync {
    fn local_id(&self) -> PoolId;

    fn allocator(&self) -> AllocatorId;

    fn generation(&self) -> u32;

    /// Start a new generation; blocks from older generations are dropped
    /// instead of recycled.
    fn bump_generation(&self) -> u32;

    fn fetch_linear_block(&self, capacity: usize, usage: MemoryUsage) -> Result<LinearBlock>;

    fn fetch_graphic_block(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: MemoryUsage,
    ) -> Result<GraphicBlock>;
}

/// State shared between a pool and the blocks it handed out.
pub(crate) struct PoolShared {
    free: Mutex<VecDeque<Vec<u8>>>,
    outstanding: AtomicUsize,
    generation: AtomicU32,
}

impl PoolShared {
    pub(crate) fn recycle(&self, data: Vec<u8>, generation: u32) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        let mut free = self.free.lock();
        // Only keep allocations while the free list isn't too large
        if free.len() < MAX_FREE_BLOCKS {
            free.push_back(data);
        }
    }
}

/// In-process pool backed by heap memory, optionally bounded in the number
/// of blocks outstanding at once.
pub struct BasicBlockPool {
    id: PoolId,
    allocator: AllocatorId,
    limit: Option<usize>,
    shared: Arc<PoolShared>,
}

impl BasicBlockPool {
    pub fn new(id: PoolId, allocator: AllocatorId) -> Self {
        Self {
            id,
            allocator,
            limit: None,
            shared: Arc::new(PoolShared {
                free: Mutex::new(VecDeque::new()),
                outstanding: AtomicUsize::new(0),
                generation: AtomicU32::new(0),
            }),
        }
    }

    /// Fail allocations with `NoMemory` once `limit` blocks are outstanding.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Continue numbering generations from `generation`, so blocks of a
    /// pool this one replaces never match it.
    pub fn with_generation(self, generation: u32) -> Self {
        self.shared.generation.store(generation, Ordering::Release);
        self
    }

    /// Blocks fetched and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    fn allocate(&self, size: usize, usage: MemoryUsage) -> Result<BlockStorage> {
        if self.allocator == AllocatorId::SecureLinear && !usage.protected {
            warn!("BlockPool {}: secure pool asked for CPU-mappable memory", self.id);
            return Err(Status::BadValue);
        }
        let outstanding = self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.limit.is_some_and(|limit| outstanding >= limit) {
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(Status::NoMemory);
        }

        let reused = {
            let mut free = self.shared.free.lock();
            let position = free.iter().position(|data| data.capacity() >= size);
            position.and_then(|i| free.remove(i))
        };
        let data = match reused {
            Some(mut data) => {
                data.clear();
                data.resize(size, 0);
                data
            }
            None => vec![0; size],
        };

        Ok(BlockStorage::new(
            data,
            self.id,
            self.shared.generation.load(Ordering::Acquire),
            usage.protected || self.allocator == AllocatorId::SecureLinear,
            Arc::downgrade(&self.shared),
        ))
    }
}

impl BlockPool for BasicBlockPool {
    fn local_id(&self) -> PoolId {
        self.id
    }

    fn allocator(&self) -> AllocatorId {
        self.allocator
    }

    fn generation(&self) -> u32 {
        self.shared.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) -> u32 {
        self.shared.free.lock().clear();
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("BlockPool {}: generation {}", self.id, generation);
        generation
    }

    fn fetch_linear_block(&self, capacity: usize, usage: MemoryUsage) -> Result<LinearBlock> {
        if self.allocator.is_graphic() {
            return Err(Status::BadValue);
        }
        Ok(LinearBlock::from_storage(self.allocate(capacity, usage)?))
    }

    fn fetch_graphic_block(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: MemoryUsage,
    ) -> Result<GraphicBlock> {
        if !self.allocator.is_graphic() {
            return Err(Status::BadValue);
        }
        if width == 0 || height == 0 {
            return Err(Status::BadValue);
        }
        let storage = self.allocate(format.frame_size(width, height), usage)?;
        Ok(GraphicBlock::from_storage(storage, width, height, format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_returns_to_pool() {
        let pool = BasicBlockPool::new(PLATFORM_POOL_START, AllocatorId::Linear);
        let block = pool
            .fetch_linear_block(128, MemoryUsage::CPU_READ_WRITE)
            .unwrap();
        assert_eq!(pool.outstanding(), 1);
        let shared = block.share(0, 64).unwrap();
        let copy = shared.clone();
        drop(shared);
        assert_eq!(pool.outstanding(), 1);
        drop(copy);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.shared.free.lock().len(), 1);
    }

    #[test]
    fn test_limit_maps_to_no_memory() {
        let pool = BasicBlockPool::new(PLATFORM_POOL_START, AllocatorId::Linear).with_limit(1);
        let first = pool.fetch_linear_block(8, MemoryUsage::CPU_READ_WRITE);
        assert!(first.is_ok());
        let second = pool.fetch_linear_block(8, MemoryUsage::CPU_READ_WRITE);
        assert_eq!(second.err(), Some(Status::NoMemory));
        drop(first);
        assert!(pool.fetch_linear_block(8, MemoryUsage::CPU_READ_WRITE).is_ok());
    }

    #[test]
    fn test_stale_generation_not_recycled() {
        let pool = BasicBlockPool::new(PLATFORM_POOL_START, AllocatorId::Linear);
        let block = pool.fetch_linear_block(8, MemoryUsage::CPU_READ_WRITE).unwrap();
        assert_eq!(block.generation(), 0);
        assert_eq!(pool.bump_generation(), 1);
        drop(block);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.shared.free.lock().is_empty());
        let fresh = pool.fetch_linear_block(8, MemoryUsage::CPU_READ_WRITE).unwrap();
        assert_eq!(fresh.generation(), 1);

        let replacement = BasicBlockPool::new(PLATFORM_POOL_START, AllocatorId::Linear)
            .with_generation(pool.bump_generation());
        assert_eq!(replacement.generation(), 2);
        let block = replacement.fetch_linear_block(8, MemoryUsage::CPU_READ_WRITE).unwrap();
        assert_eq!(block.generation(), 2);
    }

    #[test]
    fn test_allocator_kind_checked() {
        let linear = BasicBlockPool::new(BASIC_LINEAR_POOL, AllocatorId::Linear);
        assert!(
            linear
                .fetch_graphic_block(4, 4, PixelFormat::Rgba8888, MemoryUsage::CPU_READ_WRITE)
                .is_err()
        );
        let graphic = BasicBlockPool::new(BASIC_GRAPHIC_POOL, AllocatorId::Graphic);
        let block = graphic
            .fetch_graphic_block(4, 2, PixelFormat::Rgba8888, MemoryUsage::CPU_READ_WRITE)
            .unwrap();
        assert_eq!((block.width(), block.height()), (4, 2));
    }

    #[test]
    fn test_secure_pool_blocks_are_protected() {
        let pool = BasicBlockPool::new(PLATFORM_POOL_START, AllocatorId::SecureLinear);
        assert!(pool.fetch_linear_block(8, MemoryUsage::CPU_READ_WRITE).is_err());
        let mut block = pool.fetch_linear_block(8, MemoryUsage::PROTECTED).unwrap();
        assert!(block.is_protected());
        assert!(block.map().is_err());
    }
}
