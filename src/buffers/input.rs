//! Input buffer sets.
//!
//! [`InputBuffers`] is the closed set of input buffer containers:
//! - `Dummy` before configuration and after reset, every request fails;
//! - `Slot` allocates client buffers on demand, one per slot index, backed by
//!   linear blocks, raw graphic frames or shared memory for encrypted input;
//! - `Array` pins a fixed set of buffers whose identity never changes.
//!
//! A slot is busy while the client holds its buffer or while the component
//! still references the buffer converted from it.

use crate::buffers::block::{ClientBuffer, CodecBuffer, PixelFormat, Rect, SharedMemory};
use crate::buffers::pool::{BlockPool, MemoryUsage};
use crate::error::{Result, Status};
use log::{debug, trace, warn};
use std::sync::{Arc, Weak};

/// How a slot-mode set allocates client buffers.
#[derive(Clone)]
pub enum InputAllocation {
    Linear {
        pool: Arc<dyn BlockPool>,
        capacity: usize,
    },
    Graphic {
        pool: Arc<dyn BlockPool>,
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    EncryptedLinear {
        pool: Arc<dyn BlockPool>,
        capacity: usize,
        secure: bool,
    },
}

impl InputAllocation {
    fn kind(&self) -> &'static str {
        match self {
            InputAllocation::Linear { .. } => "linear",
            InputAllocation::Graphic { .. } => "graphic",
            InputAllocation::EncryptedLinear { .. } => "encrypted",
        }
    }

    fn allocate(&self) -> Result<Arc<ClientBuffer>> {
        match self {
            InputAllocation::Linear { pool, capacity } => {
                let block = pool.fetch_linear_block(*capacity, MemoryUsage::CPU_READ_WRITE)?;
                Ok(ClientBuffer::from_block(block))
            }
            InputAllocation::Graphic {
                width,
                height,
                format,
                ..
            } => Ok(ClientBuffer::from_heap(format.frame_size(*width, *height))),
            InputAllocation::EncryptedLinear {
                pool,
                capacity,
                secure,
            } => {
                let block = pool.fetch_linear_block(*capacity, Self::usage(*secure))?;
                Ok(ClientBuffer::from_encrypted(SharedMemory::new(*capacity), block))
            }
        }
    }

    /// Array-mode buffer: local memory that survives every submission.
    fn allocate_pinned(&self) -> Result<Arc<ClientBuffer>> {
        match self {
            InputAllocation::Linear { capacity, .. } => Ok(ClientBuffer::from_heap(*capacity)),
            InputAllocation::Graphic { .. } | InputAllocation::EncryptedLinear { .. } => {
                self.allocate()
            }
        }
    }

    fn usage(secure: bool) -> MemoryUsage {
        if secure {
            MemoryUsage::PROTECTED
        } else {
            MemoryUsage::CPU_READ_WRITE
        }
    }

    /// Turn a client buffer into the buffer submitted to the component.
    fn convert(&self, buffer: &ClientBuffer) -> Result<Arc<CodecBuffer>> {
        if let Some(attached) = buffer.take_attached() {
            return Ok(attached);
        }
        self.convert_data(buffer).map(Arc::new)
    }

    fn convert_data(&self, buffer: &ClientBuffer) -> Result<CodecBuffer> {
        match self {
            InputAllocation::Linear { pool, .. } => match buffer.take_block() {
                Some((block, offset, size)) => Ok(CodecBuffer::linear(block.share(offset, size)?)),
                None => {
                    let data = buffer.to_vec()?;
                    let mut block =
                        pool.fetch_linear_block(data.len(), MemoryUsage::CPU_READ_WRITE)?;
                    block.map()?.copy_from_slice(&data);
                    Ok(CodecBuffer::linear(block.share(0, data.len())?))
                }
            },
            InputAllocation::Graphic {
                pool,
                width,
                height,
                format,
            } => {
                let mut block =
                    pool.fetch_graphic_block(*width, *height, *format, MemoryUsage::CPU_READ_WRITE)?;
                let target = block.map()?;
                buffer.with_data(|data| {
                    let len = data.len().min(target.len());
                    target[..len].copy_from_slice(&data[..len]);
                })?;
                let crop = buffer.meta().crop.unwrap_or_else(|| Rect::new(*width, *height));
                Ok(CodecBuffer::graphic(block.share(crop)?))
            }
            InputAllocation::EncryptedLinear { pool, secure, .. } => {
                let (offset, size) = (buffer.offset(), buffer.size());
                match buffer.take_encrypted_block() {
                    Some(block) => Ok(CodecBuffer::linear(block.share(offset, size)?)),
                    None if !*secure => {
                        let data = buffer.to_vec()?;
                        let mut block =
                            pool.fetch_linear_block(data.len(), MemoryUsage::CPU_READ_WRITE)?;
                        block.map()?.copy_from_slice(&data);
                        Ok(CodecBuffer::linear(block.share(0, data.len())?))
                    }
                    None => Err(Status::InvalidOperation),
                }
            }
        }
    }
}

struct Slot {
    client: Option<Arc<ClientBuffer>>,
    component: Weak<CodecBuffer>,
}

impl Slot {
    fn is_free(&self) -> bool {
        self.client.is_none() && self.component.strong_count() == 0
    }
}

/// Slot-mode input buffers.
pub struct SlotBuffers {
    name: String,
    allocation: InputAllocation,
    slots: Vec<Slot>,
}

impl SlotBuffers {
    pub fn new(name: &str, allocation: InputAllocation) -> Self {
        Self {
            name: format!("{}#{}-input", name, allocation.kind()),
            allocation,
            slots: Vec::new(),
        }
    }

    fn request_new_buffer(&mut self) -> Result<(usize, Arc<ClientBuffer>)> {
        let buffer = self.allocation.allocate()?;
        let index = match self.slots.iter().position(Slot::is_free) {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    client: None,
                    component: Weak::new(),
                });
                self.slots.len() - 1
            }
        };
        self.slots[index].client = Some(buffer.clone());
        trace!("[{}] requestNewBuffer: slot #{}", self.name, index);
        Ok((index, buffer))
    }

    fn position(&self, buffer: &Arc<ClientBuffer>) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.client
                .as_ref()
                .is_some_and(|client| Arc::ptr_eq(client, buffer))
        })
    }

    fn release_buffer(&mut self, buffer: &Arc<ClientBuffer>) -> Result<Arc<CodecBuffer>> {
        let index = self.position(buffer).ok_or(Status::NotFound)?;
        let converted = self.allocation.convert(buffer)?;
        self.slots[index].component = Arc::downgrade(&converted);
        trace!("[{}] releaseBuffer: slot #{}", self.name, index);
        Ok(converted)
    }

    fn return_client_slot(&mut self, buffer: &Arc<ClientBuffer>) -> bool {
        match self.position(buffer) {
            Some(index) => {
                self.slots[index].client = None;
                true
            }
            None => false,
        }
    }

    fn expire_component_buffer(&mut self, buffer: &Arc<CodecBuffer>) -> bool {
        for slot in self.slots.iter_mut() {
            if slot
                .component
                .upgrade()
                .is_some_and(|held| Arc::ptr_eq(&held, buffer))
            {
                slot.component = Weak::new();
                return true;
            }
        }
        false
    }

    /// Copy `buffer` into a fresh block and free its slot.
    fn clone_and_release(&mut self, buffer: &Arc<ClientBuffer>) -> Result<Arc<ClientBuffer>> {
        let InputAllocation::Linear { pool, .. } = &self.allocation else {
            return Err(Status::NotSupported);
        };
        let index = self.position(buffer).ok_or(Status::NotFound)?;
        let copy = copy_to_block(pool.as_ref(), buffer)?;
        self.slots[index].client = None;
        Ok(copy)
    }

    fn num_active_slots(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_free()).count()
    }

    fn num_client_buffers(&self) -> usize {
        self.slots.iter().filter(|slot| slot.client.is_some()).count()
    }

    fn flush(&mut self) {
        debug!("[{}] flush: {} slots", self.name, self.slots.len());
        self.slots.clear();
    }
}

/// Deep copy of a client buffer into a fresh pool block, metadata included.
fn copy_to_block(pool: &dyn BlockPool, buffer: &ClientBuffer) -> Result<Arc<ClientBuffer>> {
    let data = buffer.to_vec()?;
    let mut block = pool.fetch_linear_block(data.len().max(1), MemoryUsage::CPU_READ_WRITE)?;
    block.map()?[..data.len()].copy_from_slice(&data);
    let copy = ClientBuffer::from_block(block);
    copy.set_range(0, data.len())?;
    let meta = buffer.meta();
    copy.update_meta(|m| *m = meta);
    Ok(copy)
}

struct ArrayEntry {
    client: Arc<ClientBuffer>,
    client_owned: bool,
    component: Weak<CodecBuffer>,
}

impl ArrayEntry {
    fn is_free(&self) -> bool {
        !self.client_owned && self.component.strong_count() == 0
    }
}

/// Fixed array of pinned input buffers.
pub struct ArrayBuffers {
    name: String,
    allocation: InputAllocation,
    entries: Vec<ArrayEntry>,
}

impl ArrayBuffers {
    pub fn new(name: &str, allocation: InputAllocation, size: usize) -> Result<Self> {
        let mut entries = Vec::with_capacity(size);
        for _ in 0..size {
            entries.push(ArrayEntry {
                client: allocation.allocate_pinned()?,
                client_owned: false,
                component: Weak::new(),
            });
        }
        Ok(Self {
            name: format!("{}#{}-input[]", name, allocation.kind()),
            allocation,
            entries,
        })
    }

    fn request_new_buffer(&mut self) -> Result<(usize, Arc<ClientBuffer>)> {
        let index = self
            .entries
            .iter()
            .position(ArrayEntry::is_free)
            .ok_or(Status::WouldBlock)?;
        if let InputAllocation::EncryptedLinear {
            pool,
            capacity,
            secure,
        } = &self.allocation
        {
            let usage = InputAllocation::usage(*secure);
            self.entries[index]
                .client
                .ensure_encrypted_block(|| pool.fetch_linear_block(*capacity, usage))?;
        }
        let entry = &mut self.entries[index];
        entry.client.clear();
        entry.client_owned = true;
        trace!("[{}] requestNewBuffer: #{}", self.name, index);
        Ok((index, entry.client.clone()))
    }

    fn position(&self, buffer: &Arc<ClientBuffer>) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.client_owned && Arc::ptr_eq(&entry.client, buffer))
    }

    fn release_buffer(&mut self, buffer: &Arc<ClientBuffer>) -> Result<Arc<CodecBuffer>> {
        let index = self.position(buffer).ok_or(Status::NotFound)?;
        let converted = match (&self.allocation, buffer.take_attached()) {
            (_, Some(attached)) => attached,
            (InputAllocation::Linear { pool, .. }, None) => {
                let data = buffer.to_vec()?;
                let mut block =
                    pool.fetch_linear_block(data.len().max(1), MemoryUsage::CPU_READ_WRITE)?;
                block.map()?[..data.len()].copy_from_slice(&data);
                Arc::new(CodecBuffer::linear(block.share(0, data.len())?))
            }
            (allocation, None) => allocation.convert(buffer)?,
        };
        self.entries[index].component = Arc::downgrade(&converted);
        Ok(converted)
    }

    fn return_client_slot(&mut self, buffer: &Arc<ClientBuffer>) -> bool {
        match self.position(buffer) {
            Some(index) => {
                self.entries[index].client_owned = false;
                true
            }
            None => false,
        }
    }

    fn expire_component_buffer(&mut self, buffer: &Arc<CodecBuffer>) -> bool {
        for entry in self.entries.iter_mut() {
            if entry
                .component
                .upgrade()
                .is_some_and(|held| Arc::ptr_eq(&held, buffer))
            {
                entry.component = Weak::new();
                return true;
            }
        }
        false
    }

    /// Copy `buffer` into a pool block and hand its entry back right away.
    fn clone_and_release(&mut self, buffer: &Arc<ClientBuffer>) -> Result<Arc<ClientBuffer>> {
        let InputAllocation::Linear { pool, .. } = &self.allocation else {
            return Err(Status::NotSupported);
        };
        let index = self.position(buffer).ok_or(Status::NotFound)?;
        let copy = copy_to_block(pool.as_ref(), buffer)?;
        let entry = &mut self.entries[index];
        entry.client_owned = false;
        entry.component = Weak::new();
        Ok(copy)
    }

    fn flush(&mut self) {
        debug!("[{}] flush", self.name);
        for entry in self.entries.iter_mut() {
            entry.client_owned = false;
            entry.component = Weak::new();
        }
    }

    fn num_active_slots(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_free()).count()
    }

    fn num_client_buffers(&self) -> usize {
        self.entries.iter().filter(|entry| entry.client_owned).count()
    }

    fn array(&self) -> Vec<Arc<ClientBuffer>> {
        self.entries.iter().map(|entry| entry.client.clone()).collect()
    }
}

/// Input buffer set in one of its configurations.
#[derive(Default)]
pub enum InputBuffers {
    #[default]
    Dummy,
    Slot(SlotBuffers),
    Array(ArrayBuffers),
}

impl InputBuffers {
    pub fn slots(name: &str, allocation: InputAllocation) -> Self {
        InputBuffers::Slot(SlotBuffers::new(name, allocation))
    }

    pub fn is_array_mode(&self) -> bool {
        matches!(self, InputBuffers::Array(_))
    }

    /// Hand out a free buffer. Fails when nothing is available; callers
    /// treat any error as "try again later".
    pub fn request_new_buffer(&mut self) -> Result<(usize, Arc<ClientBuffer>)> {
        match self {
            InputBuffers::Dummy => Err(Status::NotSupported),
            InputBuffers::Slot(slots) => slots.request_new_buffer(),
            InputBuffers::Array(array) => array.request_new_buffer(),
        }
    }

    /// Convert a client buffer into the buffer submitted to the component.
    /// The slot stays busy until the component drops the returned buffer.
    pub fn release_buffer(&mut self, buffer: &Arc<ClientBuffer>) -> Result<Arc<CodecBuffer>> {
        match self {
            InputBuffers::Dummy => Err(Status::NotFound),
            InputBuffers::Slot(slots) => slots.release_buffer(buffer),
            InputBuffers::Array(array) => array.release_buffer(buffer),
        }
    }

    /// Take a buffer back from the client without submitting it.
    pub fn return_client_slot(&mut self, buffer: &Arc<ClientBuffer>) -> bool {
        match self {
            InputBuffers::Dummy => false,
            InputBuffers::Slot(slots) => slots.return_client_slot(buffer),
            InputBuffers::Array(array) => array.return_client_slot(buffer),
        }
    }

    /// The component gave `buffer` back ahead of completing its work.
    pub fn expire_component_buffer(&mut self, buffer: &Arc<CodecBuffer>) -> bool {
        match self {
            InputBuffers::Dummy => false,
            InputBuffers::Slot(slots) => slots.expire_component_buffer(buffer),
            InputBuffers::Array(array) => array.expire_component_buffer(buffer),
        }
    }

    /// Deep-copy a linear client buffer and free its slot. The copy is
    /// submitted through [`ExtraBuffers`].
    pub fn clone_and_release(&mut self, buffer: &Arc<ClientBuffer>) -> Result<Arc<ClientBuffer>> {
        match self {
            InputBuffers::Dummy => Err(Status::NotFound),
            InputBuffers::Slot(slots) => slots.clone_and_release(buffer),
            InputBuffers::Array(array) => array.clone_and_release(buffer),
        }
    }

    pub fn flush(&mut self) {
        match self {
            InputBuffers::Dummy => {}
            InputBuffers::Slot(slots) => slots.flush(),
            InputBuffers::Array(array) => array.flush(),
        }
    }

    /// Slots held by the client or by the component.
    pub fn num_active_slots(&self) -> usize {
        match self {
            InputBuffers::Dummy => 0,
            InputBuffers::Slot(slots) => slots.num_active_slots(),
            InputBuffers::Array(array) => array.num_active_slots(),
        }
    }

    pub fn num_client_buffers(&self) -> usize {
        match self {
            InputBuffers::Dummy => 0,
            InputBuffers::Slot(slots) => slots.num_client_buffers(),
            InputBuffers::Array(array) => array.num_client_buffers(),
        }
    }

    /// Switch to a fixed array of `size` pinned buffers.
    pub fn to_array_mode(self, name: &str, size: usize) -> Result<InputBuffers> {
        match self {
            InputBuffers::Dummy => Err(Status::InvalidOperation),
            InputBuffers::Array(array) => Ok(InputBuffers::Array(array)),
            InputBuffers::Slot(slots) => {
                if slots.num_client_buffers() > 0 {
                    warn!("[{}] toArrayMode: client still holds buffers", slots.name);
                }
                Ok(InputBuffers::Array(ArrayBuffers::new(
                    name,
                    slots.allocation,
                    size,
                )?))
            }
        }
    }

    /// Pinned buffers in index order; empty outside array mode.
    pub fn array(&self) -> Vec<Arc<ClientBuffer>> {
        match self {
            InputBuffers::Array(array) => array.array(),
            _ => Vec::new(),
        }
    }
}

struct ExtraSlot {
    buffer: Option<Arc<ClientBuffer>>,
    component: Weak<CodecBuffer>,
}

/// Slots holding deep copies of client buffers, so the client's own slot
/// can be reused before the component returns the data.
#[derive(Default)]
pub struct ExtraBuffers {
    slots: Vec<ExtraSlot>,
}

impl ExtraBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_slot(&mut self, buffer: Arc<ClientBuffer>) -> usize {
        let free = self
            .slots
            .iter()
            .position(|slot| slot.buffer.is_none() && slot.component.strong_count() == 0);
        let slot = ExtraSlot {
            buffer: Some(buffer),
            component: Weak::new(),
        };
        match free {
            Some(index) => {
                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    pub fn release_slot(&mut self, index: usize) -> Result<Arc<CodecBuffer>> {
        let slot = self.slots.get_mut(index).ok_or(Status::NotFound)?;
        let buffer = slot.buffer.take().ok_or(Status::NotFound)?;
        let (block, offset, size) = buffer.take_block().ok_or(Status::InvalidOperation)?;
        let converted = Arc::new(CodecBuffer::linear(block.share(offset, size)?));
        slot.component = Arc::downgrade(&converted);
        Ok(converted)
    }

    pub fn expire_component_buffer(&mut self, buffer: &Arc<CodecBuffer>) -> bool {
        for slot in self.slots.iter_mut() {
            if slot
                .component
                .upgrade()
                .is_some_and(|held| Arc::ptr_eq(&held, buffer))
            {
                slot.component = Weak::new();
                return true;
            }
        }
        false
    }

    /// Copies the component still references.
    pub fn num_component_buffers(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.component.strong_count() > 0)
            .count()
    }

    pub fn flush(&mut self) {
        self.slots.clear();
    }
}
