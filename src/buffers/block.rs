//! Memory blocks, shared codec buffers and client-visible buffers.
//!
//! Ownership follows three layers:
//! - a [`LinearBlock`] / [`GraphicBlock`] is an exclusive, writable block
//!   fetched from a pool;
//! - sharing a block freezes it into a [`CodecBuffer`], the reference-counted
//!   representation carried by work items to the component;
//! - a [`ClientBuffer`] is the handle the client writes into (input) or reads
//!   from (output), mapped to a slot index by a buffer set.
//!
//! The backing allocation goes back to its pool when the last reference to
//! the frozen storage drops.

use crate::buffers::pool::{DETACHED_POOL, PoolId, PoolShared};
use crate::error::{Result, Status};
use crate::pipeline::types::{AccessUnitInfo, BufferMeta, HdrMetadata, MediaFormat};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

/// Backing allocation of a block.
pub(crate) struct BlockStorage {
    data: Vec<u8>,
    pool_id: PoolId,
    generation: u32,
    protected: bool,
    recycler: Weak<PoolShared>,
}

impl BlockStorage {
    pub(crate) fn new(
        data: Vec<u8>,
        pool_id: PoolId,
        generation: u32,
        protected: bool,
        recycler: Weak<PoolShared>,
    ) -> Self {
        Self {
            data,
            pool_id,
            generation,
            protected,
            recycler,
        }
    }

    fn detached(capacity: usize) -> Self {
        Self::new(vec![0; capacity], DETACHED_POOL, 0, false, Weak::new())
    }
}

impl Drop for BlockStorage {
    fn drop(&mut self) {
        if let Some(pool) = self.recycler.upgrade() {
            pool.recycle(std::mem::take(&mut self.data), self.generation);
        }
    }
}

/// Write access to a block for a backend (decryptor, descrambler).
///
/// Protected blocks cannot be mapped by the CPU, but backends still write
/// into them through their handle.
pub struct SecureHandle<'a> {
    bytes: &'a mut [u8],
}

impl SecureHandle<'_> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.bytes
    }
}

/// Exclusive, writable linear block.
pub struct LinearBlock {
    storage: BlockStorage,
}

impl LinearBlock {
    pub(crate) fn from_storage(storage: BlockStorage) -> Self {
        Self { storage }
    }

    /// Block that does not belong to any pool.
    pub fn detached(capacity: usize) -> Self {
        Self::from_storage(BlockStorage::detached(capacity))
    }

    pub fn capacity(&self) -> usize {
        self.storage.data.len()
    }

    pub fn pool_id(&self) -> PoolId {
        self.storage.pool_id
    }

    pub fn generation(&self) -> u32 {
        self.storage.generation
    }

    pub fn is_protected(&self) -> bool {
        self.storage.protected
    }

    /// CPU mapping of the whole block.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        if self.storage.protected {
            return Err(Status::InvalidOperation);
        }
        Ok(&mut self.storage.data)
    }

    pub fn handle(&mut self) -> SecureHandle<'_> {
        SecureHandle {
            bytes: &mut self.storage.data,
        }
    }

    /// Handle over the block starting at `offset`.
    pub fn handle_from(&mut self, offset: usize) -> Result<SecureHandle<'_>> {
        if offset > self.storage.data.len() {
            return Err(Status::BadValue);
        }
        Ok(SecureHandle {
            bytes: &mut self.storage.data[offset..],
        })
    }

    /// Freeze `[offset, offset + size)` of the block into a shared view.
    pub fn share(self, offset: usize, size: usize) -> Result<ConstLinearBlock> {
        if offset.checked_add(size).is_none_or(|end| end > self.capacity()) {
            return Err(Status::BadValue);
        }
        Ok(ConstLinearBlock {
            storage: Arc::new(self.storage),
            offset,
            size,
        })
    }
}

/// Read-only view of a frozen linear block.
#[derive(Clone)]
pub struct ConstLinearBlock {
    storage: Arc<BlockStorage>,
    offset: usize,
    size: usize,
}

impl ConstLinearBlock {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.storage.data.len()
    }

    pub fn pool_id(&self) -> PoolId {
        self.storage.pool_id
    }

    pub fn generation(&self) -> u32 {
        self.storage.generation
    }

    pub fn is_protected(&self) -> bool {
        self.storage.protected
    }

    /// CPU mapping of the shared range.
    pub fn map(&self) -> Result<&[u8]> {
        if self.storage.protected {
            return Err(Status::InvalidOperation);
        }
        Ok(&self.storage.data[self.offset..self.offset + self.size])
    }
}

impl std::fmt::Debug for ConstLinearBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstLinearBlock")
            .field("pool", &self.storage.pool_id)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Rectangle in pixels, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }

    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit 4:2:0 YUV, any layout.
    Yuv420Flexible,
    Rgba8888,
}

impl PixelFormat {
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuv420Flexible => pixels * 3 / 2,
            PixelFormat::Rgba8888 => pixels * 4,
        }
    }
}

/// Exclusive, writable graphic block.
pub struct GraphicBlock {
    storage: BlockStorage,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl GraphicBlock {
    pub(crate) fn from_storage(
        storage: BlockStorage,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            storage,
            width,
            height,
            format,
        }
    }

    pub fn detached(width: u32, height: u32, format: PixelFormat) -> Self {
        let storage = BlockStorage::detached(format.frame_size(width, height));
        Self::from_storage(storage, width, height, format)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pool_id(&self) -> PoolId {
        self.storage.pool_id
    }

    pub fn map(&mut self) -> Result<&mut [u8]> {
        if self.storage.protected {
            return Err(Status::InvalidOperation);
        }
        Ok(&mut self.storage.data)
    }

    pub fn share(self, crop: Rect) -> Result<ConstGraphicBlock> {
        if crop.right as u32 > self.width || crop.bottom as u32 > self.height {
            return Err(Status::BadValue);
        }
        Ok(ConstGraphicBlock {
            storage: Arc::new(self.storage),
            width: self.width,
            height: self.height,
            format: self.format,
            crop,
        })
    }
}

/// Read-only view of a frozen graphic block.
#[derive(Clone)]
pub struct ConstGraphicBlock {
    storage: Arc<BlockStorage>,
    width: u32,
    height: u32,
    format: PixelFormat,
    crop: Rect,
}

impl ConstGraphicBlock {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn crop(&self) -> Rect {
        self.crop
    }

    pub fn pool_id(&self) -> PoolId {
        self.storage.pool_id
    }

    pub fn generation(&self) -> u32 {
        self.storage.generation
    }

    pub fn map(&self) -> Result<&[u8]> {
        if self.storage.protected {
            return Err(Status::InvalidOperation);
        }
        Ok(&self.storage.data)
    }
}

/// Side information attached to a [`CodecBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub enum BufferInfo {
    /// Several access units batched into one buffer.
    AccessUnits(Vec<AccessUnitInfo>),
    /// Picture type of a decoded or encoded frame.
    PictureType { sync: bool },
    Rotation { degrees: i32, flip: bool },
    Hdr(HdrMetadata),
}

impl BufferInfo {
    fn same_kind(&self, other: &BufferInfo) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

pub enum BufferData {
    Linear(ConstLinearBlock),
    Graphic(ConstGraphicBlock),
}

/// Shared buffer exchanged with the component.
pub struct CodecBuffer {
    data: BufferData,
    infos: RwLock<Vec<BufferInfo>>,
}

impl CodecBuffer {
    pub fn linear(block: ConstLinearBlock) -> Self {
        Self {
            data: BufferData::Linear(block),
            infos: RwLock::new(Vec::new()),
        }
    }

    pub fn graphic(block: ConstGraphicBlock) -> Self {
        Self {
            data: BufferData::Graphic(block),
            infos: RwLock::new(Vec::new()),
        }
    }

    pub fn data(&self) -> &BufferData {
        &self.data
    }

    pub fn as_linear(&self) -> Option<&ConstLinearBlock> {
        match &self.data {
            BufferData::Linear(block) => Some(block),
            BufferData::Graphic(_) => None,
        }
    }

    pub fn as_graphic(&self) -> Option<&ConstGraphicBlock> {
        match &self.data {
            BufferData::Graphic(block) => Some(block),
            BufferData::Linear(_) => None,
        }
    }

    pub fn is_graphic(&self) -> bool {
        matches!(self.data, BufferData::Graphic(_))
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        match &self.data {
            BufferData::Linear(block) => block.size(),
            BufferData::Graphic(block) => block.format().frame_size(block.width(), block.height()),
        }
    }

    pub fn pool_id(&self) -> PoolId {
        match &self.data {
            BufferData::Linear(block) => block.pool_id(),
            BufferData::Graphic(block) => block.pool_id(),
        }
    }

    pub fn generation(&self) -> u32 {
        match &self.data {
            BufferData::Linear(block) => block.generation(),
            BufferData::Graphic(block) => block.generation(),
        }
    }

    /// Attach an info, replacing any previous info of the same kind.
    pub fn set_info(&self, info: BufferInfo) {
        let mut infos = self.infos.write();
        infos.retain(|existing| !existing.same_kind(&info));
        infos.push(info);
    }

    pub fn infos(&self) -> Vec<BufferInfo> {
        self.infos.read().clone()
    }

    pub fn access_units(&self) -> Option<Vec<AccessUnitInfo>> {
        self.infos.read().iter().find_map(|info| match info {
            BufferInfo::AccessUnits(units) => Some(units.clone()),
            _ => None,
        })
    }

    pub fn picture_sync(&self) -> Option<bool> {
        self.infos.read().iter().find_map(|info| match info {
            BufferInfo::PictureType { sync } => Some(*sync),
            _ => None,
        })
    }

    pub fn rotation(&self) -> Option<(i32, bool)> {
        self.infos.read().iter().find_map(|info| match info {
            BufferInfo::Rotation { degrees, flip } => Some((*degrees, *flip)),
            _ => None,
        })
    }

    pub fn hdr(&self) -> Option<HdrMetadata> {
        self.infos.read().iter().find_map(|info| match info {
            BufferInfo::Hdr(hdr) => Some(hdr.clone()),
            _ => None,
        })
    }
}

impl std::fmt::Debug for CodecBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            BufferData::Linear(block) => write!(f, "CodecBuffer(linear, {} bytes)", block.size()),
            BufferData::Graphic(block) => {
                write!(f, "CodecBuffer(graphic, {}x{})", block.width(), block.height())
            }
        }
    }
}

/// Shared memory region used as the source of encrypted input.
pub struct SharedMemory {
    data: Mutex<Vec<u8>>,
}

impl SharedMemory {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; size]),
        })
    }

    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let end = offset.checked_add(bytes.len()).ok_or(Status::BadValue)?;
        if end > data.len() {
            return Err(Status::BadValue);
        }
        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        let data = self.data.lock();
        let end = offset.checked_add(size).ok_or(Status::BadValue)?;
        if end > data.len() {
            return Err(Status::BadValue);
        }
        Ok(data[offset..end].to_vec())
    }
}

/// Memory behind a client buffer.
enum Backing {
    /// Pool block written in place by the client.
    Block(LinearBlock),
    /// Local memory, copied into a pool block on submission.
    Heap(Vec<u8>),
    /// Ciphertext in shared memory plus the destination block.
    Encrypted {
        memory: Arc<SharedMemory>,
        block: Option<LinearBlock>,
    },
    /// Output buffer wrapping the component's buffer.
    Codec(Arc<CodecBuffer>),
    /// Consumed.
    Empty,
}

struct ClientState {
    backing: Backing,
    capacity: usize,
    offset: usize,
    size: usize,
    meta: BufferMeta,
    format: Option<Arc<MediaFormat>>,
    /// Component buffer attached to an input buffer (`attach_buffer`) or
    /// copied into an array-mode output buffer.
    attached: Option<Arc<CodecBuffer>>,
}

/// Buffer handed to the client, identified by pointer identity of its `Arc`.
pub struct ClientBuffer {
    state: Mutex<ClientState>,
}

impl ClientBuffer {
    fn with_backing(backing: Backing, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ClientState {
                backing,
                capacity,
                offset: 0,
                size: 0,
                meta: BufferMeta::default(),
                format: None,
                attached: None,
            }),
        })
    }

    pub(crate) fn from_block(block: LinearBlock) -> Arc<Self> {
        let capacity = block.capacity();
        Self::with_backing(Backing::Block(block), capacity)
    }

    pub(crate) fn from_heap(capacity: usize) -> Arc<Self> {
        Self::with_backing(Backing::Heap(vec![0; capacity]), capacity)
    }

    pub(crate) fn from_encrypted(memory: Arc<SharedMemory>, block: LinearBlock) -> Arc<Self> {
        let capacity = memory.size().min(block.capacity());
        Self::with_backing(
            Backing::Encrypted {
                memory,
                block: Some(block),
            },
            capacity,
        )
    }

    /// Output buffer wrapping a component buffer.
    pub(crate) fn wrap(buffer: Arc<CodecBuffer>, format: Option<Arc<MediaFormat>>) -> Arc<Self> {
        let (offset, size, capacity) = match buffer.as_linear() {
            Some(block) => (0, block.size(), block.size()),
            None => (0, buffer.size(), buffer.size()),
        };
        let client = Self::with_backing(Backing::Codec(buffer), capacity);
        {
            let mut state = client.state.lock();
            state.offset = offset;
            state.size = size;
            state.format = format;
        }
        client
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn offset(&self) -> usize {
        self.state.lock().offset
    }

    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    pub fn set_range(&self, offset: usize, size: usize) -> Result<()> {
        let mut state = self.state.lock();
        if offset.checked_add(size).is_none_or(|end| end > state.capacity) {
            return Err(Status::BadValue);
        }
        state.offset = offset;
        state.size = size;
        Ok(())
    }

    /// Copy `bytes` to the start of the buffer and set the range to cover them.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if bytes.len() > state.capacity {
            return Err(Status::BadValue);
        }
        match &mut state.backing {
            Backing::Block(block) => block.map()?[..bytes.len()].copy_from_slice(bytes),
            Backing::Heap(data) => data[..bytes.len()].copy_from_slice(bytes),
            Backing::Encrypted { memory, .. } => memory.write(0, bytes)?,
            Backing::Codec(_) | Backing::Empty => return Err(Status::InvalidOperation),
        }
        state.offset = 0;
        state.size = bytes.len();
        Ok(())
    }

    /// Run `f` over the valid range of the buffer.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let mut state = self.state.lock();
        let (offset, size) = (state.offset, state.size);
        match &mut state.backing {
            Backing::Block(block) => Ok(f(&block.map()?[offset..offset + size])),
            Backing::Heap(data) => Ok(f(&data[offset..offset + size])),
            Backing::Encrypted { memory, .. } => Ok(f(&memory.read(offset, size)?)),
            Backing::Codec(buffer) => {
                let block = buffer.as_linear().ok_or(Status::InvalidOperation)?;
                let data = block.map()?;
                Ok(f(&data[offset.min(data.len())..(offset + size).min(data.len())]))
            }
            Backing::Empty => Err(Status::InvalidOperation),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_data(|data| data.to_vec())
    }

    pub fn meta(&self) -> BufferMeta {
        self.state.lock().meta.clone()
    }

    pub fn update_meta(&self, f: impl FnOnce(&mut BufferMeta)) {
        f(&mut self.state.lock().meta)
    }

    pub fn format(&self) -> Option<Arc<MediaFormat>> {
        self.state.lock().format.clone()
    }

    pub fn set_format(&self, format: Option<Arc<MediaFormat>>) {
        self.state.lock().format = format;
    }

    /// Component buffer currently backing this client buffer, if any.
    pub fn codec_buffer(&self) -> Option<Arc<CodecBuffer>> {
        let state = self.state.lock();
        match &state.backing {
            Backing::Codec(buffer) => Some(buffer.clone()),
            _ => state.attached.clone(),
        }
    }

    pub(crate) fn attach(&self, buffer: Arc<CodecBuffer>) {
        let mut state = self.state.lock();
        if let Some(block) = buffer.as_linear() {
            state.offset = 0;
            state.size = block.size();
        }
        state.attached = Some(buffer);
    }

    pub(crate) fn take_attached(&self) -> Option<Arc<CodecBuffer>> {
        self.state.lock().attached.take()
    }

    /// Detach the backing block, leaving the buffer consumed.
    pub(crate) fn take_block(&self) -> Option<(LinearBlock, usize, usize)> {
        let mut state = self.state.lock();
        let (offset, size) = (state.offset, state.size);
        match std::mem::replace(&mut state.backing, Backing::Empty) {
            Backing::Block(block) => Some((block, offset, size)),
            other => {
                state.backing = other;
                None
            }
        }
    }

    /// Detach the decrypt destination block of an encrypted buffer.
    pub(crate) fn take_encrypted_block(&self) -> Option<LinearBlock> {
        let mut state = self.state.lock();
        match &mut state.backing {
            Backing::Encrypted { block, .. } => block.take(),
            _ => None,
        }
    }

    /// Give an encrypted buffer a new destination block if its previous one
    /// was submitted.
    pub(crate) fn ensure_encrypted_block(
        &self,
        fetch: impl FnOnce() -> Result<LinearBlock>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Backing::Encrypted { block, .. } = &mut state.backing
            && block.is_none()
        {
            *block = Some(fetch()?);
        }
        Ok(())
    }

    pub(crate) fn with_encrypted_block<R>(
        &self,
        f: impl FnOnce(&mut LinearBlock) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        match &mut state.backing {
            Backing::Encrypted {
                block: Some(block), ..
            } => Some(f(block)),
            _ => None,
        }
    }

    pub(crate) fn encrypted_memory(&self) -> Option<Arc<SharedMemory>> {
        match &self.state.lock().backing {
            Backing::Encrypted { memory, .. } => Some(memory.clone()),
            _ => None,
        }
    }

    /// Pool id and generation of the block the client writes into, if the
    /// buffer still owns one.
    pub(crate) fn pool_origin(&self) -> Option<(PoolId, u32)> {
        match &self.state.lock().backing {
            Backing::Block(block)
            | Backing::Encrypted {
                block: Some(block), ..
            } => Some((block.pool_id(), block.generation())),
            _ => None,
        }
    }

    /// Copy a component buffer into local memory. Fails with
    /// `NoMemory` when it does not fit.
    pub(crate) fn copy_from(&self, buffer: &Arc<CodecBuffer>) -> Result<()> {
        let data = match buffer.data() {
            BufferData::Linear(block) => block.map()?,
            BufferData::Graphic(block) => block.map()?,
        };
        let mut state = self.state.lock();
        if data.len() > state.capacity {
            return Err(Status::NoMemory);
        }
        match &mut state.backing {
            Backing::Heap(local) => local[..data.len()].copy_from_slice(data),
            _ => return Err(Status::InvalidOperation),
        }
        state.offset = 0;
        state.size = data.len();
        state.attached = Some(buffer.clone());
        Ok(())
    }

    /// Reset range and metadata before the buffer is handed out again.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.offset = 0;
        state.size = 0;
        state.meta = BufferMeta::default();
        state.attached = None;
    }
}

impl std::fmt::Debug for ClientBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClientBuffer")
            .field("capacity", &state.capacity)
            .field("offset", &state.offset)
            .field("size", &state.size)
            .finish()
    }
}
