//! Buffer channel between a codec client and an asynchronous codec component.
//!
//! The client fills input buffers and drains output buffers; the component
//! consumes work items and completes them on its own threads. The
//! [`BufferChannel`] in between converts buffers, bounds the work in flight,
//! restores output order and handles protected input and output surfaces.

pub mod buffers;
pub mod channel;
pub mod component;
pub mod config;
pub mod crypto;
pub mod error;
pub mod loopback;
pub mod pipeline;
pub mod surface;

pub use buffers::{BlockPool, ClientBuffer, CodecBuffer};
pub use channel::{BufferChannel, ChannelSnapshot};
pub use component::{ClientCallback, Component, SessionCallback, WorkListener};
pub use config::{ChannelConfig, ExtraSlotPolicy};
pub use crypto::{CryptoBackend, CryptoInfo, Descrambler};
pub use error::{ErrorAction, Result, Status};
pub use loopback::{LoopbackComponent, LoopbackOptions};
pub use pipeline::{BufferFlags, ChannelHealth, ChannelState, MediaFormat, Param, Work};
pub use surface::{OutputSurface, RenderedFrame};
