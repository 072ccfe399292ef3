//! Tracks frames in flight in the component and decides when feeding more
//! input would overrun the component's delay budget.

use crate::buffers::block::CodecBuffer;
use log::trace;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Frame {
    /// Input buffers the component still holds; `None` once released early.
    buffers: Vec<Option<Arc<CodecBuffer>>>,
    queued_at: Instant,
}

/// In-flight frame accounting.
///
/// Capacity is `input_delay + pipeline_delay + output_delay + smoothness_factor`.
#[derive(Default)]
pub struct PipelineWatcher {
    input_delay: usize,
    pipeline_delay: usize,
    output_delay: usize,
    smoothness_factor: usize,
    frames: BTreeMap<u64, Frame>,
}

impl PipelineWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_delay(&mut self, value: usize) -> &mut Self {
        self.input_delay = value;
        self
    }

    pub fn pipeline_delay(&mut self, value: usize) -> &mut Self {
        self.pipeline_delay = value;
        self
    }

    pub fn output_delay(&mut self, value: usize) -> &mut Self {
        self.output_delay = value;
        self
    }

    pub fn smoothness_factor(&mut self, value: usize) -> &mut Self {
        self.smoothness_factor = value;
        self
    }

    pub fn capacity(&self) -> usize {
        self.input_delay + self.pipeline_delay + self.output_delay + self.smoothness_factor
    }

    pub fn in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, frame_index: u64) -> bool {
        self.frames.contains_key(&frame_index)
    }

    pub fn on_work_queued(
        &mut self,
        frame_index: u64,
        buffers: Vec<Arc<CodecBuffer>>,
        queued_at: Instant,
    ) {
        trace!("PipelineWatcher: queued #{}", frame_index);
        let buffers = buffers.into_iter().map(Some).collect();
        self.frames.insert(frame_index, Frame { buffers, queued_at });
    }

    /// The component returned input buffer `array_index` of a frame ahead of
    /// completing the work. Returns the released buffer.
    pub fn on_input_buffer_released(
        &mut self,
        frame_index: u64,
        array_index: usize,
    ) -> Option<Arc<CodecBuffer>> {
        let frame = self.frames.get_mut(&frame_index)?;
        let released = frame.buffers.get_mut(array_index)?.take();
        trace!(
            "PipelineWatcher: input buffer #{}[{}] released ({})",
            frame_index,
            array_index,
            released.is_some()
        );
        released
    }

    pub fn on_work_done(&mut self, frame_index: u64) {
        trace!("PipelineWatcher: done #{}", frame_index);
        self.frames.remove(&frame_index);
    }

    pub fn flush(&mut self) {
        self.frames.clear();
    }

    /// Frames whose input the component has given back entirely.
    fn frames_with_input_released(&self) -> usize {
        self.frames
            .values()
            .filter(|frame| frame.buffers.iter().all(Option::is_none))
            .count()
    }

    /// True when no further frame should be queued.
    pub fn pipeline_full(&self) -> bool {
        self.pipeline_room() == 0
    }

    /// Number of frames that may still be queued before the pipeline is full.
    pub fn pipeline_room(&self) -> usize {
        let total = self.capacity().saturating_sub(self.frames.len());
        let after_input = (self.pipeline_delay + self.output_delay + self.smoothness_factor)
            .saturating_sub(self.frames_with_input_released());
        total.min(after_input)
    }

    /// Age of the `(n + 1)`-th oldest frame in flight, or zero when fewer
    /// than `n + 1` frames are in flight.
    pub fn elapsed(&self, now: Instant, n: usize) -> Duration {
        if self.frames.len() <= n {
            return Duration::ZERO;
        }
        let mut ages: Vec<Duration> = self
            .frames
            .values()
            .map(|frame| now.saturating_duration_since(frame.queued_at))
            .collect();
        ages.sort_unstable_by(|a, b| b.cmp(a));
        ages[n]
    }
}
