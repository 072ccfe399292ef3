//! Output reorder stash.
//!
//! Completed output waits here until it can be released in order. Entries are
//! kept sorted by the configured [`ReorderKey`]; once more than `depth`
//! entries are waiting, the oldest moves to the pending queue, from which the
//! output buffer set registers and delivers it.

use crate::buffers::block::CodecBuffer;
use crate::pipeline::types::{BufferFlags, MediaFormat, Ordinal, ReorderKey};
use std::collections::VecDeque;
use std::sync::Arc;

/// Output result waiting for release.
#[derive(Debug, Clone)]
pub struct StashEntry {
    pub buffer: Option<Arc<CodecBuffer>>,
    /// False when the entry only carries bookkeeping and must not reach the
    /// client.
    pub notify: bool,
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub format: Option<Arc<MediaFormat>>,
    pub ordinal: Ordinal,
}

#[derive(Default)]
pub struct ReorderStash {
    /// Sorted by `key`.
    stash: VecDeque<StashEntry>,
    /// Released from the stash, in delivery order.
    pending: VecDeque<StashEntry>,
    depth: usize,
    key: ReorderKey,
}

impl ReorderStash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
        self.release_overflow();
    }

    pub fn set_key(&mut self, key: ReorderKey) {
        self.key = key;
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn key(&self) -> ReorderKey {
        self.key
    }

    pub fn push(&mut self, mut entry: StashEntry) {
        let eos = entry.flags.contains(BufferFlags::END_OF_STREAM);

        // Codec-config data can't be reordered.
        if entry.flags.contains(BufferFlags::CODEC_CONFIG) {
            self.pending.push_back(entry);
            return;
        }

        if entry.buffer.is_none() && eos {
            // Nothing follows an empty EOS, so the order of the tail is moot.
            self.stash.push_back(entry);
        } else {
            entry.flags.remove(BufferFlags::END_OF_STREAM);
            let position = self
                .stash
                .iter()
                .position(|queued| self.key.less(&entry.ordinal, &queued.ordinal));
            match position {
                Some(i) => self.stash.insert(i, entry),
                None => self.stash.push_back(entry),
            }
            if eos && let Some(last) = self.stash.back_mut() {
                last.flags.insert(BufferFlags::END_OF_STREAM);
            }
        }

        if eos {
            self.pending.extend(self.stash.drain(..));
        } else {
            self.release_overflow();
        }
    }

    fn release_overflow(&mut self) {
        while self.stash.len() > self.depth {
            if let Some(entry) = self.stash.pop_front() {
                self.pending.push_back(entry);
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn front_pending(&self) -> Option<&StashEntry> {
        self.pending.front()
    }

    pub fn pop_pending(&mut self) -> Option<StashEntry> {
        self.pending.pop_front()
    }

    /// Entries still held back for reordering.
    pub fn stashed(&self) -> usize {
        self.stash.len()
    }

    /// Mark every waiting entry as bookkeeping-only.
    pub fn flush(&mut self) {
        for entry in self.pending.iter_mut().chain(self.stash.iter_mut()) {
            entry.notify = false;
        }
    }

    /// Drop every entry and restore the default depth and key.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.stash.clear();
        self.depth = 0;
        self.key = ReorderKey::default();
    }
}
