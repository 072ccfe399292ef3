//! Pipeline bookkeeping for the buffer channel
//!
//! This module holds the pieces that decide when work may flow and what it
//! looks like, separate from the buffers themselves:
//! - `types`: work items, ordinals, flags, formats and parameters
//! - `state`: channel lifecycle state machine
//! - `sync`: start/stop admission gate for queueing operations
//! - `watcher`: frames in flight against the component's delay budget
//! - `health`: counters and an async monitor raising alerts

pub mod health;
pub mod state;
pub mod sync;
pub mod types;
pub mod watcher;

pub use health::{ChannelHealth, HealthAlert, HealthMonitor, HealthSummary};
pub use state::ChannelState;
pub use sync::{QueueGuard, QueueSync};
pub use types::{
    AccessUnitInfo, BufferFlags, BufferKind, BufferMeta, FrameData, FrameFlags, HdrMetadata,
    InfoBuffer, MediaFormat, Ordinal, Param, ParamKey, ReorderKey, Work, WorkResult, Worklet,
};
pub use watcher::PipelineWatcher;
