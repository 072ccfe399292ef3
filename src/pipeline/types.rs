//! Core types exchanged between the channel and the component

use crate::buffers::block::{CodecBuffer, ConstLinearBlock, Rect};
use crate::buffers::pool::{AllocatorId, PoolId};
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::Arc;

bitflags! {
    /// Flags on a work item's input or a worklet's output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        /// The component may skip producing output for this frame.
        const DROP_FRAME = 1 << 0;
        const END_OF_STREAM = 1 << 1;
        /// Output must not be displayed.
        const DISCARD_FRAME = 1 << 2;
        /// More output for the same frame will follow.
        const INCOMPLETE = 1 << 3;
        const CORRECTED = 1 << 4;
        const CODEC_CONFIG = 1 << 31;
    }
}

bitflags! {
    /// Flags the client sees on buffer metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        const KEY_FRAME = 1 << 0;
        const CODEC_CONFIG = 1 << 1;
        const END_OF_STREAM = 1 << 2;
        const PARTIAL_FRAME = 1 << 3;
        const MUXER_DATA = 1 << 4;
        const DECODE_ONLY = 1 << 5;
    }
}

impl BufferFlags {
    /// Work flags for an input buffer carrying these client flags.
    pub fn to_frame_flags(self) -> FrameFlags {
        let mut flags = FrameFlags::empty();
        if self.contains(BufferFlags::END_OF_STREAM) {
            flags |= FrameFlags::END_OF_STREAM;
        }
        if self.contains(BufferFlags::CODEC_CONFIG) {
            flags |= FrameFlags::CODEC_CONFIG;
        }
        if self.contains(BufferFlags::DECODE_ONLY) {
            flags |= FrameFlags::DROP_FRAME;
        }
        flags
    }

    /// Client flags for output produced with `flags`.
    pub fn from_frame_flags(flags: FrameFlags) -> BufferFlags {
        let mut out = BufferFlags::empty();
        if flags.contains(FrameFlags::END_OF_STREAM) {
            out |= BufferFlags::END_OF_STREAM;
        }
        if flags.contains(FrameFlags::CODEC_CONFIG) {
            out |= BufferFlags::CODEC_CONFIG;
        }
        if flags.contains(FrameFlags::INCOMPLETE) {
            out |= BufferFlags::PARTIAL_FRAME;
        }
        out
    }
}

/// Position of a frame in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ordinal {
    /// Timestamp in microseconds.
    pub timestamp: i64,
    pub frame_index: u64,
    /// Client timestamp carried across component reordering.
    pub custom_ordinal: i64,
}

/// Ordering criterion of the output reorder stash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReorderKey {
    #[default]
    FrameIndex,
    Timestamp,
    Custom,
}

impl ReorderKey {
    pub fn less(&self, a: &Ordinal, b: &Ordinal) -> bool {
        match self {
            ReorderKey::FrameIndex => a.frame_index < b.frame_index,
            ReorderKey::Timestamp => a.timestamp < b.timestamp,
            ReorderKey::Custom => a.custom_ordinal < b.custom_ordinal,
        }
    }
}

/// One access unit inside a batched buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessUnitInfo {
    pub flags: BufferFlags,
    pub size: usize,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HdrMetadata {
    pub max_content_light_level: u32,
    pub max_frame_average_light_level: u32,
    pub hdr10_plus: Option<Bytes>,
}

/// Subset of a media format the channel acts on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channel_count: u32,
    /// Upper bound of an input access unit in bytes.
    pub max_input_size: Option<usize>,
    /// Leading frames to drop from decoded audio.
    pub encoder_delay: usize,
    /// Trailing frames to drop from decoded audio.
    pub encoder_padding: usize,
    /// Output is rendered by the component without passing buffers back.
    pub tunneled: bool,
}

impl MediaFormat {
    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        Self {
            mime: mime.to_string(),
            width,
            height,
            ..Default::default()
        }
    }

    pub fn audio(mime: &str, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.to_string(),
            sample_rate,
            channel_count,
            ..Default::default()
        }
    }

    pub fn is_audio(&self) -> bool {
        self.mime.starts_with("audio/")
    }

    /// Bytes per audio frame assuming 16-bit PCM.
    pub fn audio_frame_size(&self) -> usize {
        self.channel_count.max(1) as usize * 2
    }
}

/// Metadata carried by a client buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BufferMeta {
    pub time_us: i64,
    pub flags: BufferFlags,
    /// Frame index of the work that produced an output buffer.
    pub frame_index: Option<u64>,
    pub access_units: Option<Vec<AccessUnitInfo>>,
    /// Ask the component to report the first tunneled frame.
    pub tunnel_first_frame: bool,
    pub crop: Option<Rect>,
    pub hdr: Option<HdrMetadata>,
}

/// Buffer kind a component accepts or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferKind {
    #[default]
    Linear,
    Graphic,
}

/// Parameter keys understood by [`Component::query`](crate::component::Component::query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    InputDelay,
    PipelineDelay,
    OutputDelay,
    ReorderDepth,
    ReorderKey,
    InputBufferKind,
    OutputBufferKind,
    OutputAllocator,
    OutputPoolId,
}

/// Configuration parameter exchanged with the component, either through
/// `query`/`config` or as a config update on a work or worklet.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    InputDelay(usize),
    PipelineDelay(usize),
    OutputDelay(usize),
    ReorderDepth(usize),
    ReorderKey(ReorderKey),
    InputBufferKind(BufferKind),
    OutputBufferKind(BufferKind),
    OutputAllocator(AllocatorId),
    OutputPoolId(PoolId),
    /// Render time reported by a tunneled component: (media time µs, system time ns).
    TunnelSystemTime { media_time_us: i64, render_time_ns: i64 },
    /// The first tunneled frame is ready to render.
    TunnelHoldRender(bool),
    TunnelStartRender,
    /// Codec-specific data produced by the component.
    InitData(Bytes),
    /// Output format changed starting with this worklet.
    OutputFormat(Arc<MediaFormat>),
    /// Opaque parameter passed through from the client.
    Vendor { index: u32, value: i64 },
}

impl Param {
    pub fn key(&self) -> Option<ParamKey> {
        match self {
            Param::InputDelay(_) => Some(ParamKey::InputDelay),
            Param::PipelineDelay(_) => Some(ParamKey::PipelineDelay),
            Param::OutputDelay(_) => Some(ParamKey::OutputDelay),
            Param::ReorderDepth(_) => Some(ParamKey::ReorderDepth),
            Param::ReorderKey(_) => Some(ParamKey::ReorderKey),
            Param::InputBufferKind(_) => Some(ParamKey::InputBufferKind),
            Param::OutputBufferKind(_) => Some(ParamKey::OutputBufferKind),
            Param::OutputAllocator(_) => Some(ParamKey::OutputAllocator),
            Param::OutputPoolId(_) => Some(ParamKey::OutputPoolId),
            _ => None,
        }
    }
}

/// Buffer attached to a work outside of its input list.
#[derive(Debug, Clone)]
pub struct InfoBuffer {
    pub index: u32,
    pub block: ConstLinearBlock,
}

/// Input or output half of a work item.
#[derive(Debug, Clone, Default)]
pub struct FrameData {
    pub flags: FrameFlags,
    pub ordinal: Ordinal,
    pub buffers: Vec<Arc<CodecBuffer>>,
    pub config_update: Vec<Param>,
    pub info_buffers: Vec<InfoBuffer>,
}

#[derive(Debug, Clone, Default)]
pub struct Worklet {
    pub output: FrameData,
}

/// Completion status reported by the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkResult {
    #[default]
    Ok,
    /// The component chose not to process the work.
    Omitted,
    /// The work was flushed before it was processed.
    NotFound,
    Error(i32),
}

/// One submission unit to the component.
#[derive(Debug, Clone, Default)]
pub struct Work {
    pub input: FrameData,
    pub worklets: Vec<Worklet>,
    pub result: WorkResult,
}

impl Work {
    pub fn new(ordinal: Ordinal, flags: FrameFlags) -> Self {
        Self {
            input: FrameData {
                flags,
                ordinal,
                ..Default::default()
            },
            worklets: vec![Worklet::default()],
            result: WorkResult::Ok,
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.input.ordinal.frame_index
    }
}
