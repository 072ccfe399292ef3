//! Seams between the buffer channel and the world around it.
//!
//! - [`Component`]: the codec the channel feeds work into.
//! - [`WorkListener`]: how the component hands completed work back.
//! - [`ClientCallback`]: buffers offered to the client.
//! - [`SessionCallback`]: session-level notifications, errors included.

use crate::buffers::block::ClientBuffer;
use crate::buffers::pool::{AllocatorId, BlockPool, PoolId};
use crate::error::{ErrorAction, Result, Status};
use crate::pipeline::types::{Param, ParamKey, Work};
use crate::surface::{FrameEvent, OutputSurface, RenderedFrame};
use std::sync::{Arc, Weak};

/// Codec component driven by the channel.
///
/// Calls come from client threads and from the channel's completion path,
/// never while the channel holds one of its own locks.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Current values of `keys`. Unknown keys are left out of the result.
    fn query(&self, keys: &[ParamKey]) -> Result<Vec<Param>>;

    fn config(&self, params: &[Param]) -> Result<()>;

    /// Take ownership of `works`; each completes later through the
    /// registered [`WorkListener`].
    fn queue(&self, works: Vec<Work>) -> Result<()>;

    /// Return every work not yet completed.
    fn flush(&self) -> Result<Vec<Work>> {
        Ok(Vec::new())
    }

    fn set_listener(&self, listener: Weak<dyn WorkListener>);

    fn create_block_pool(&self, allocator: AllocatorId) -> Result<Arc<dyn BlockPool>>;

    fn destroy_block_pool(&self, id: PoolId) -> Result<()>;

    fn set_output_surface(
        &self,
        _pool_id: PoolId,
        _surface: Arc<dyn OutputSurface>,
        _generation: u32,
        _max_dequeue_count: usize,
    ) -> Result<()> {
        Err(Status::NotSupported)
    }

    fn set_output_surface_max_dequeue_count(&self, _count: usize) -> Result<()> {
        Ok(())
    }

    fn stop_using_output_surface(&self, _pool_id: PoolId) {}

    /// Frame events the output surface reported since the last poll.
    fn poll_for_rendered_frames(&self) -> Vec<FrameEvent> {
        Vec::new()
    }

    fn on_buffer_released_from_output_surface(&self, _generation: u32) {}

    fn on_buffer_attached_to_output_surface(&self, _generation: u32) {}
}

/// Completion path from the component back to the channel.
pub trait WorkListener: Send + Sync {
    fn on_work_done(&self, works: Vec<Work>);

    /// Input buffer `array_index` of frame `frame_index` is no longer used,
    /// though the work itself is still in progress.
    fn on_input_buffer_done(&self, frame_index: u64, array_index: usize);
}

/// Buffers offered to the client.
pub trait ClientCallback: Send + Sync {
    /// Called without the buffer locks held, possibly from inside
    /// `queue_input_buffer`. The client may queue `buffer` from here but
    /// must not stop the channel.
    fn on_input_buffer_available(&self, index: usize, buffer: Arc<ClientBuffer>);

    /// Called while the channel holds its output lock. Implementations must
    /// not call `discard_buffer`, `render_output_buffer` or any other
    /// output operation of the channel from here, or the calling thread
    /// deadlocks. Hand the buffer to another thread and return it from
    /// there.
    fn on_output_buffer_available(&self, index: usize, buffer: Arc<ClientBuffer>);
}

/// Session-level notifications.
pub trait SessionCallback: Send + Sync {
    fn on_error(&self, status: Status, action: ErrorAction);

    fn on_output_frames_rendered(&self, _frames: &[RenderedFrame]) {}

    fn on_first_tunnel_frame_ready(&self) {}

    /// Array-mode output buffers were grown or reallocated.
    fn on_output_buffers_changed(&self) {}

    fn on_work_queued(&self, _eos: bool) {}
}
