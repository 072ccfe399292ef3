//! Output buffer set.
//!
//! Completed output first goes through the [`ReorderStash`]; entries released
//! from it are registered into a client-visible slot and delivered. Slot mode
//! wraps the component's buffer directly, array mode copies it into one of a
//! fixed set of client buffers and may need reallocating when the component
//! starts producing larger buffers.

use crate::buffers::block::{BufferData, ClientBuffer, CodecBuffer};
use crate::buffers::stash::{ReorderStash, StashEntry};
use crate::error::{Result, Status};
use crate::pipeline::types::{BufferFlags, BufferKind, MediaFormat, Ordinal, ReorderKey};
use log::{debug, trace, warn};
use std::sync::Arc;

/// Outcome of [`OutputBuffers::pop_from_stash_and_register`].
pub enum BufferAction {
    /// Nothing is ready.
    Skip,
    /// A buffer was registered at `index` and must be delivered.
    NotifyClient {
        index: usize,
        buffer: Arc<ClientBuffer>,
    },
    /// An entry was dropped after bookkeeping.
    Discard,
    /// The buffer does not fit the array; reallocate and try again.
    Reallocate(Arc<CodecBuffer>),
    /// No free slot right now.
    Retry,
}

impl std::fmt::Debug for BufferAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferAction::Skip => write!(f, "Skip"),
            BufferAction::NotifyClient { index, .. } => write!(f, "NotifyClient(#{})", index),
            BufferAction::Discard => write!(f, "Discard"),
            BufferAction::Reallocate(_) => write!(f, "Reallocate"),
            BufferAction::Retry => write!(f, "Retry"),
        }
    }
}

/// Audio trimming of encoder delay and padding, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SkipCut {
    skip_remaining: usize,
    cut: usize,
}

impl SkipCut {
    fn from_format(format: &MediaFormat) -> Option<Self> {
        if !format.is_audio() || (format.encoder_delay == 0 && format.encoder_padding == 0) {
            return None;
        }
        let frame = format.audio_frame_size();
        Some(Self {
            skip_remaining: format.encoder_delay * frame,
            cut: format.encoder_padding * frame,
        })
    }

    /// Trim the range `(offset, size)` of the next output buffer.
    fn apply(&mut self, offset: usize, size: usize, eos: bool) -> (usize, usize) {
        let skip = self.skip_remaining.min(size);
        self.skip_remaining -= skip;
        let (offset, mut size) = (offset + skip, size - skip);
        if eos {
            size -= self.cut.min(size);
        }
        (offset, size)
    }
}

struct ArrayEntry {
    client: Arc<ClientBuffer>,
    client_owned: bool,
}

enum Slots {
    /// Wraps the component's buffer, one slot per delivered buffer.
    Flexible(Vec<Option<Arc<ClientBuffer>>>),
    /// Fixed client buffers that output is copied into.
    Array {
        entries: Vec<ArrayEntry>,
        capacity: usize,
    },
}

pub struct OutputBuffers {
    name: String,
    kind: BufferKind,
    slots: Slots,
    stash: ReorderStash,
    format: Option<Arc<MediaFormat>>,
    skip_cut: Option<SkipCut>,
}

impl OutputBuffers {
    pub fn new(name: &str, kind: BufferKind, format: Option<Arc<MediaFormat>>) -> Self {
        let mut buffers = Self {
            name: format!("{}#{:?}-output", name, kind).to_lowercase(),
            kind,
            slots: Slots::Flexible(Vec::new()),
            stash: ReorderStash::new(),
            format: None,
            skip_cut: None,
        };
        if let Some(format) = format {
            buffers.update_skip_cut_buffer(&format);
            buffers.format = Some(format);
        }
        buffers
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn is_array_mode(&self) -> bool {
        matches!(self.slots, Slots::Array { .. })
    }

    pub fn format(&self) -> Option<Arc<MediaFormat>> {
        self.format.clone()
    }

    pub fn set_format(&mut self, format: Option<Arc<MediaFormat>>) {
        self.format = format;
    }

    pub fn set_reorder_depth(&mut self, depth: usize) {
        self.stash.set_depth(depth);
    }

    pub fn set_reorder_key(&mut self, key: ReorderKey) {
        self.stash.set_key(key);
    }

    pub fn reorder_depth(&self) -> usize {
        self.stash.depth()
    }

    pub fn has_pending(&self) -> bool {
        self.stash.has_pending()
    }

    pub fn push_to_stash(
        &mut self,
        buffer: Option<Arc<CodecBuffer>>,
        notify: bool,
        timestamp: i64,
        flags: BufferFlags,
        format: Option<Arc<MediaFormat>>,
        ordinal: Ordinal,
    ) {
        trace!(
            "[{}] pushToStash: #{} ts={} notify={}",
            self.name, ordinal.frame_index, timestamp, notify
        );
        self.stash.push(StashEntry {
            buffer,
            notify,
            timestamp,
            flags,
            format,
            ordinal,
        });
    }

    /// Release the next pending stash entry and register it for delivery.
    pub fn pop_from_stash_and_register(&mut self) -> BufferAction {
        let Some(entry) = self.stash.front_pending().cloned() else {
            return BufferAction::Skip;
        };

        if entry.notify && entry.format.is_some() && entry.format != self.format {
            if let Some(format) = &entry.format {
                debug!("[{}] output format changed", self.name);
                self.update_skip_cut_buffer(format);
            }
            self.format = entry.format.clone();
        }

        if !entry.notify {
            self.stash.pop_pending();
            return BufferAction::Discard;
        }

        let registered = match &entry.buffer {
            Some(buffer) => self.register_buffer(buffer.clone(), &entry),
            None => self.register_empty(),
        };
        let (index, client) = match registered {
            Ok(registered) => registered,
            Err(Status::WouldBlock) => return BufferAction::Retry,
            Err(err) => {
                debug!("[{}] registerBuffer failed: {}", self.name, err);
                return match entry.buffer {
                    Some(buffer) => BufferAction::Reallocate(buffer),
                    None => BufferAction::Retry,
                };
            }
        };

        client.update_meta(|meta| {
            meta.time_us = entry.timestamp;
            meta.flags = entry.flags;
            meta.frame_index = Some(entry.ordinal.frame_index);
        });
        self.stash.pop_pending();
        BufferAction::NotifyClient {
            index,
            buffer: client,
        }
    }

    fn trim(&mut self, client: &ClientBuffer, flags: BufferFlags) -> Result<()> {
        if let Some(skip_cut) = self.skip_cut.as_mut() {
            let eos = flags.contains(BufferFlags::END_OF_STREAM);
            let (offset, size) = skip_cut.apply(client.offset(), client.size(), eos);
            client.set_range(offset, size)?;
        }
        Ok(())
    }

    fn register_buffer(
        &mut self,
        buffer: Arc<CodecBuffer>,
        entry: &StashEntry,
    ) -> Result<(usize, Arc<ClientBuffer>)> {
        let format = self.format.clone();
        let registered = match &mut self.slots {
            Slots::Flexible(slots) => {
                let client = ClientBuffer::wrap(buffer, format);
                let index = insert_flexible(slots, client.clone());
                (index, client)
            }
            Slots::Array { entries, .. } => {
                let index = entries
                    .iter()
                    .position(|e| !e.client_owned)
                    .ok_or(Status::WouldBlock)?;
                let client = entries[index].client.clone();
                client.clear();
                client.copy_from(&buffer)?;
                client.set_format(format);
                entries[index].client_owned = true;
                (index, client)
            }
        };
        if matches!(buffer_kind(&registered.1), Some(BufferKind::Linear)) {
            self.trim(&registered.1, entry.flags)?;
        }
        Ok(registered)
    }

    /// Slot for an entry without data, such as a bare end-of-stream.
    fn register_empty(&mut self) -> Result<(usize, Arc<ClientBuffer>)> {
        let format = self.format.clone();
        match &mut self.slots {
            Slots::Flexible(slots) => {
                let client = ClientBuffer::from_heap(0);
                client.set_format(format);
                let index = insert_flexible(slots, client.clone());
                Ok((index, client))
            }
            Slots::Array { entries, .. } => {
                let index = entries
                    .iter()
                    .position(|e| !e.client_owned)
                    .ok_or(Status::WouldBlock)?;
                let client = entries[index].client.clone();
                client.clear();
                client.set_format(format);
                entries[index].client_owned = true;
                Ok((index, client))
            }
        }
    }

    /// Deliver codec-specific data produced by the component ahead of any
    /// stashed output.
    pub fn register_csd(&mut self, data: &[u8]) -> Result<(usize, Arc<ClientBuffer>)> {
        let format = self.format.clone();
        match &mut self.slots {
            Slots::Flexible(slots) => {
                let client = ClientBuffer::from_heap(data.len());
                client.write(data)?;
                client.set_format(format);
                let index = insert_flexible(slots, client.clone());
                Ok((index, client))
            }
            Slots::Array { entries, .. } => {
                let index = entries
                    .iter()
                    .position(|e| !e.client_owned)
                    .ok_or(Status::WouldBlock)?;
                let client = entries[index].client.clone();
                client.clear();
                client.write(data)?;
                client.set_format(format);
                entries[index].client_owned = true;
                Ok((index, client))
            }
        }
    }

    /// Take a delivered buffer back from the client. Returns the component
    /// buffer it carried, if any.
    pub fn release_buffer(&mut self, buffer: &Arc<ClientBuffer>) -> Option<Arc<CodecBuffer>> {
        match &mut self.slots {
            Slots::Flexible(slots) => {
                let slot = slots.iter_mut().find(|slot| {
                    slot.as_ref()
                        .is_some_and(|client| Arc::ptr_eq(client, buffer))
                })?;
                let client = slot.take()?;
                client.codec_buffer()
            }
            Slots::Array { entries, .. } => {
                let entry = entries
                    .iter_mut()
                    .find(|e| e.client_owned && Arc::ptr_eq(&e.client, buffer))?;
                entry.client_owned = false;
                entry.client.take_attached()
            }
        }
    }

    /// True when `buffer` is currently delivered to the client.
    pub fn is_client_owned(&self, buffer: &Arc<ClientBuffer>) -> bool {
        match &self.slots {
            Slots::Flexible(slots) => slots
                .iter()
                .flatten()
                .any(|client| Arc::ptr_eq(client, buffer)),
            Slots::Array { entries, .. } => entries
                .iter()
                .any(|e| e.client_owned && Arc::ptr_eq(&e.client, buffer)),
        }
    }

    pub fn num_active_slots(&self) -> usize {
        match &self.slots {
            Slots::Flexible(slots) => slots.iter().flatten().count(),
            Slots::Array { entries, .. } => entries.iter().filter(|e| e.client_owned).count(),
        }
    }

    /// Drop every delivered buffer and reset audio trimming.
    pub fn flush(&mut self) {
        debug!("[{}] flush", self.name);
        match &mut self.slots {
            Slots::Flexible(slots) => slots.clear(),
            Slots::Array { entries, .. } => {
                for entry in entries.iter_mut() {
                    entry.client_owned = false;
                    entry.client.clear();
                }
            }
        }
        if let Some(format) = self.format.clone() {
            self.update_skip_cut_buffer(&format);
        }
    }

    /// Stop delivering anything still waiting in the stash.
    pub fn flush_stash(&mut self) {
        self.stash.flush();
    }

    pub fn clear_stash(&mut self) {
        self.stash.clear();
    }

    pub fn update_skip_cut_buffer(&mut self, format: &MediaFormat) {
        let skip_cut = SkipCut::from_format(format);
        if skip_cut != self.skip_cut {
            debug!("[{}] skip/cut {:?}", self.name, skip_cut);
        }
        self.skip_cut = skip_cut;
    }

    /// Switch to `size` fixed client buffers of `capacity` bytes.
    pub fn to_array_mode(&mut self, size: usize, capacity: usize) {
        if self.is_array_mode() {
            return;
        }
        if self.num_active_slots() > 0 {
            warn!("[{}] toArrayMode: client still holds buffers", self.name);
        }
        let entries = (0..size)
            .map(|_| ArrayEntry {
                client: ClientBuffer::from_heap(capacity),
                client_owned: false,
            })
            .collect();
        self.slots = Slots::Array { entries, capacity };
    }

    /// Grow the array to `size` buffers. No-op outside array mode.
    pub fn grow(&mut self, size: usize) {
        if let Slots::Array { entries, capacity } = &mut self.slots {
            while entries.len() < size {
                entries.push(ArrayEntry {
                    client: ClientBuffer::from_heap(*capacity),
                    client_owned: false,
                });
            }
        }
    }

    /// Make every buffer not held by the client large enough for `buffer`.
    pub fn realloc(&mut self, buffer: &CodecBuffer) {
        let Slots::Array { entries, capacity } = &mut self.slots else {
            return;
        };
        let needed = match buffer.data() {
            BufferData::Linear(block) => block.size(),
            BufferData::Graphic(_) => buffer.size(),
        };
        *capacity = (*capacity).max(needed);
        for entry in entries.iter_mut().filter(|e| !e.client_owned) {
            entry.client = ClientBuffer::from_heap(*capacity);
        }
        debug!("[{}] realloc: capacity {}", self.name, capacity);
    }

    /// Array buffers in index order; empty outside array mode.
    pub fn array(&self) -> Vec<Arc<ClientBuffer>> {
        match &self.slots {
            Slots::Array { entries, .. } => entries.iter().map(|e| e.client.clone()).collect(),
            Slots::Flexible(_) => Vec::new(),
        }
    }
}

fn insert_flexible(slots: &mut Vec<Option<Arc<ClientBuffer>>>, client: Arc<ClientBuffer>) -> usize {
    match slots.iter().position(Option::is_none) {
        Some(index) => {
            slots[index] = Some(client);
            index
        }
        None => {
            slots.push(Some(client));
            slots.len() - 1
        }
    }
}

fn buffer_kind(client: &ClientBuffer) -> Option<BufferKind> {
    match client.codec_buffer() {
        Some(buffer) if buffer.is_graphic() => Some(BufferKind::Graphic),
        Some(_) => Some(BufferKind::Linear),
        None => None,
    }
}
