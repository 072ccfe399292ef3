//! The buffer channel.
//!
//! [`BufferChannel`] sits between a client that fills input buffers and drains
//! output buffers, and a [`Component`] that consumes work items. It owns:
//! - the input buffer set and the extra-slot copies;
//! - the output buffer set with its reorder stash;
//! - the pipeline watcher deciding when more input may be offered;
//! - block pools, the output surface and the crypto adapter.
//!
//! Every resource sits behind its own lock. No lock is held while calling
//! into the component, except that client output callbacks run under the
//! output lock so delivery order matches stash order.

use crate::buffers::block::{BufferInfo, ClientBuffer, CodecBuffer, PixelFormat, SharedMemory};
use crate::buffers::input::{ExtraBuffers, InputAllocation, InputBuffers};
use crate::buffers::output::{BufferAction, OutputBuffers};
use crate::buffers::pool::{
    AllocatorId, BASIC_GRAPHIC_POOL, BASIC_LINEAR_POOL, BasicBlockPool, BlockPool, MemoryUsage,
    PLATFORM_POOL_START, PoolId,
};
use crate::component::{ClientCallback, Component, SessionCallback, WorkListener};
use crate::config::{ChannelConfig, DEFAULT_LINEAR_BUFFER_SIZE, ExtraSlotPolicy};
use crate::crypto::{CryptoAdapter, CryptoBackend, CryptoInfo, Descrambler, access_units_for};
use crate::error::{ErrorAction, Result, Status};
use crate::pipeline::health::ChannelHealth;
use crate::pipeline::state::ChannelState;
use crate::pipeline::sync::QueueSync;
use crate::pipeline::types::{
    AccessUnitInfo, BufferFlags, BufferKind, FrameFlags, InfoBuffer, MediaFormat, Ordinal, Param,
    ParamKey, ReorderKey, Work, WorkResult,
};
use crate::pipeline::watcher::PipelineWatcher;
use crate::surface::{
    OutputSurface, QueueBufferInput, RenderTracker, RenderedFrame, ScalingMode,
    SurfaceCallbackHandler, SurfaceEvent, Transform,
};
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Delay and buffer parameters reported by the component at start.
#[derive(Debug, Default)]
struct ComponentParams {
    input_delay: usize,
    pipeline_delay: usize,
    output_delay: usize,
    reorder_depth: usize,
    reorder_key: ReorderKey,
    input_kind: BufferKind,
    output_kind: BufferKind,
    output_allocator: Option<AllocatorId>,
    output_pool_id: Option<PoolId>,
}

impl ComponentParams {
    const KEYS: [ParamKey; 9] = [
        ParamKey::InputDelay,
        ParamKey::PipelineDelay,
        ParamKey::OutputDelay,
        ParamKey::ReorderDepth,
        ParamKey::ReorderKey,
        ParamKey::InputBufferKind,
        ParamKey::OutputBufferKind,
        ParamKey::OutputAllocator,
        ParamKey::OutputPoolId,
    ];

    fn from_params(params: &[Param]) -> Self {
        let mut out = Self::default();
        for param in params {
            match param {
                Param::InputDelay(delay) => out.input_delay = *delay,
                Param::PipelineDelay(delay) => out.pipeline_delay = *delay,
                Param::OutputDelay(delay) => out.output_delay = *delay,
                Param::ReorderDepth(depth) => out.reorder_depth = *depth,
                Param::ReorderKey(key) => out.reorder_key = *key,
                Param::InputBufferKind(kind) => out.input_kind = *kind,
                Param::OutputBufferKind(kind) => out.output_kind = *kind,
                Param::OutputAllocator(allocator) => out.output_allocator = Some(*allocator),
                Param::OutputPoolId(id) => out.output_pool_id = Some(*id),
                _ => {}
            }
        }
        out
    }
}

struct Input {
    buffers: InputBuffers,
    extra: ExtraBuffers,
    num_slots: usize,
    num_extra_slots: usize,
    input_delay: usize,
    pipeline_delay: usize,
    /// Frame index at the last start or flush. Early returns of older
    /// input buffers are stale.
    last_flush_index: u64,
}

struct Output {
    buffers: Option<OutputBuffers>,
    num_slots: usize,
    output_delay: usize,
    realloc_tries: usize,
}

#[derive(Default)]
struct Pools {
    input: Option<Arc<dyn BlockPool>>,
    /// Generation for the next input pool; bumped on reset.
    input_generation: u32,
    output: Option<Arc<dyn BlockPool>>,
    output_pool_id: Option<PoolId>,
    /// CPU-visible pool for encrypted info buffers.
    info: Option<Arc<dyn BlockPool>>,
}

#[derive(Default)]
struct SurfaceState {
    surface: Option<Arc<dyn OutputSurface>>,
    generation: u32,
    max_dequeue: usize,
    tracker: RenderTracker,
}

/// Side effects of a worklet's config updates that the delivery path needs.
#[derive(Default)]
struct ConfigUpdates {
    init_data: Option<Bytes>,
    format: Option<Arc<MediaFormat>>,
}

/// Point-in-time view of the channel's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub state: &'static str,
    pub next_frame_index: u64,
    pub frames_in_flight: usize,
    pub pipeline_capacity: usize,
    pub input_slots: usize,
    pub active_input_slots: usize,
    pub client_input_buffers: usize,
    pub output_slots: usize,
    pub active_output_slots: usize,
    pub reorder_depth: usize,
    pub max_dequeue_count: usize,
}

pub struct BufferChannel {
    name: String,
    config: ChannelConfig,
    component: Mutex<Option<Arc<dyn Component>>>,
    client: Mutex<Option<Arc<dyn ClientCallback>>>,
    session: Arc<dyn SessionCallback>,
    sync: QueueSync,
    state: Mutex<ChannelState>,
    input: Mutex<Input>,
    output: Mutex<Output>,
    watcher: Mutex<PipelineWatcher>,
    pools: Mutex<Pools>,
    surface: Mutex<SurfaceState>,
    crypto: Mutex<CryptoAdapter>,
    frame_index: AtomicU64,
    first_valid_frame_index: AtomicU64,
    /// Codec-config works retired by a flush, re-queued on the next start.
    flushed_configs: Mutex<Vec<Work>>,
    pending_params: Mutex<Vec<Param>>,
    info_buffers: Mutex<Vec<InfoBuffer>>,
    input_met_eos: AtomicBool,
    tunneled: AtomicBool,
    last_keepalive: Mutex<Option<Instant>>,
    health: Arc<ChannelHealth>,
    surface_handler: SurfaceCallbackHandler,
}

impl BufferChannel {
    /// Create a channel driving `component` and register it as the
    /// component's work listener.
    pub fn new(
        component: Arc<dyn Component>,
        session: Arc<dyn SessionCallback>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let name = component.name().to_string();
        let surface_handler = SurfaceCallbackHandler::new(&name, Arc::downgrade(&component));
        let channel = Arc::new(Self {
            crypto: Mutex::new(CryptoAdapter::new(&name)),
            name,
            config,
            component: Mutex::new(Some(component.clone())),
            client: Mutex::new(None),
            session,
            sync: QueueSync::new(),
            state: Mutex::new(ChannelState::Idle),
            input: Mutex::new(Input {
                buffers: InputBuffers::Dummy,
                extra: ExtraBuffers::new(),
                num_slots: 0,
                num_extra_slots: 0,
                input_delay: 0,
                pipeline_delay: 0,
                last_flush_index: 0,
            }),
            output: Mutex::new(Output {
                buffers: None,
                num_slots: 0,
                output_delay: 0,
                realloc_tries: 0,
            }),
            watcher: Mutex::new(PipelineWatcher::new()),
            pools: Mutex::new(Pools::default()),
            surface: Mutex::new(SurfaceState::default()),
            frame_index: AtomicU64::new(0),
            first_valid_frame_index: AtomicU64::new(0),
            flushed_configs: Mutex::new(Vec::new()),
            pending_params: Mutex::new(Vec::new()),
            info_buffers: Mutex::new(Vec::new()),
            input_met_eos: AtomicBool::new(false),
            tunneled: AtomicBool::new(false),
            last_keepalive: Mutex::new(None),
            health: Arc::new(ChannelHealth::new()),
            surface_handler,
        });
        let listener: Arc<dyn WorkListener> = channel.clone();
        component.set_listener(Arc::downgrade(&listener));
        channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_client(&self, client: Arc<dyn ClientCallback>) {
        *self.client.lock() = Some(client);
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn health(&self) -> Arc<ChannelHealth> {
        self.health.clone()
    }

    fn component(&self) -> Option<Arc<dyn Component>> {
        self.component.lock().clone()
    }

    fn client(&self) -> Option<Arc<dyn ClientCallback>> {
        self.client.lock().clone()
    }

    fn transition(&self, target: ChannelState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(&target) {
            debug!("[{}] ignoring transition {} -> {}", self.name, *state, target);
            return false;
        }
        if state.description() != target.description() {
            debug!("[{}] {} -> {}", self.name, *state, target);
        }
        *state = target;
        true
    }

    fn check_not_errored(&self) -> Result<()> {
        if self.state.lock().is_errored() {
            return Err(Status::InvalidOperation);
        }
        Ok(())
    }

    /// Surface `status` to the session once; the channel stops making
    /// progress until it is stopped or reset.
    fn report_fatal(&self, status: Status) {
        {
            let mut state = self.state.lock();
            if state.is_errored() || state.is_released() {
                debug!("[{}] already errored; dropping {}", self.name, status);
                return;
            }
            *state = ChannelState::Errored;
        }
        error!("[{}] fatal error: {}", self.name, status);
        self.health.record_fatal_error();
        self.session.on_error(status, ErrorAction::Fatal);
    }

    // ---- configuration ----

    /// Size the buffer sets from the component's reported delays and open
    /// the channel for queueing.
    pub fn start(
        &self,
        input_format: Option<Arc<MediaFormat>>,
        output_format: Option<Arc<MediaFormat>>,
        buffers_bound_to_codec: bool,
    ) -> Result<()> {
        let component = self.component().ok_or(Status::InvalidOperation)?;
        let now = Instant::now();
        let current = self.state();
        if !current.can_transition_to(&ChannelState::Running { started_at: now }) {
            warn!("[{}] start: invalid in state {}", self.name, current);
            return Err(Status::InvalidOperation);
        }

        let params = ComponentParams::from_params(&component.query(&ComponentParams::KEYS)?);
        let smoothness = self.config.smoothness_factor;
        let num_input_slots = params.input_delay + params.pipeline_delay + smoothness;
        let num_output_slots = params.output_delay + smoothness;
        debug!("[{}] component params: {:?}", self.name, params);

        let input_buffers =
            self.create_input_buffers(&params, input_format.as_deref(), num_input_slots)?;
        {
            let mut input = self.input.lock();
            input.buffers = input_buffers;
            input.extra.flush();
            input.num_slots = num_input_slots;
            input.num_extra_slots = 0;
            input.input_delay = params.input_delay;
            input.pipeline_delay = params.pipeline_delay;
            input.last_flush_index = self.frame_index.load(Ordering::Acquire);
        }

        let tunneled = output_format.as_ref().is_some_and(|format| format.tunneled);
        self.tunneled.store(tunneled, Ordering::Release);
        let graphic_output = params.output_kind == BufferKind::Graphic;
        let max_dequeue = num_output_slots + params.reorder_depth + self.config.rendering_depth;
        let (surface, generation) = {
            let mut surface = self.surface.lock();
            surface.max_dequeue = max_dequeue;
            (surface.surface.clone(), surface.generation)
        };
        let buffer_queue = graphic_output && surface.is_some() && !tunneled;
        let pool_id = self.configure_output_pool(&component, &params, buffer_queue)?;

        let mut output_buffers =
            OutputBuffers::new(&self.name, params.output_kind, output_format.clone());
        output_buffers.clear_stash();
        output_buffers.set_reorder_depth(params.reorder_depth);
        output_buffers.set_reorder_key(params.reorder_key);
        if !graphic_output && buffers_bound_to_codec {
            output_buffers.to_array_mode(num_output_slots, linear_capacity(output_format.as_deref()));
        }
        {
            let mut output = self.output.lock();
            output.buffers = Some(output_buffers);
            output.num_slots = num_output_slots;
            output.output_delay = params.output_delay;
            output.realloc_tries = 0;
        }

        if let Some(surface) = surface.filter(|_| graphic_output) {
            if let Err(err) = surface.set_max_dequeued_buffer_count(max_dequeue) {
                warn!("[{}] setMaxDequeuedBufferCount({}) failed: {}", self.name, max_dequeue, err);
            }
            if let Err(err) = component.set_output_surface(pool_id, surface, generation, max_dequeue)
            {
                warn!("[{}] setOutputSurface failed: {}", self.name, err);
            }
        }

        self.watcher
            .lock()
            .input_delay(params.input_delay)
            .pipeline_delay(params.pipeline_delay)
            .output_delay(params.output_delay)
            .smoothness_factor(smoothness)
            .flush();
        self.input_met_eos.store(false, Ordering::Release);
        *self.last_keepalive.lock() = None;
        self.sync.start();
        self.transition(ChannelState::Running { started_at: now });
        info!(
            "[{}] started: {} input slots, {} output slots, reorder depth {}",
            self.name, num_input_slots, num_output_slots, params.reorder_depth
        );
        Ok(())
    }

    fn create_input_buffers(
        &self,
        params: &ComponentParams,
        format: Option<&MediaFormat>,
        num_slots: usize,
    ) -> Result<InputBuffers> {
        let graphic = params.input_kind == BufferKind::Graphic;
        let has_crypto = self.crypto.lock().has_backend();
        let secure = has_crypto && self.name.contains(".secure");
        let allocator = if graphic {
            AllocatorId::Graphic
        } else if secure {
            AllocatorId::SecureLinear
        } else {
            AllocatorId::Linear
        };
        let pool_id = if graphic { BASIC_GRAPHIC_POOL } else { BASIC_LINEAR_POOL };
        let pool: Arc<dyn BlockPool> = {
            let mut pools = self.pools.lock();
            let pool: Arc<dyn BlockPool> = Arc::new(
                BasicBlockPool::new(pool_id, allocator).with_generation(pools.input_generation),
            );
            pools.input = Some(pool.clone());
            pools.info = (has_crypto && self.config.send_encrypted_info_buffer).then(|| {
                Arc::new(BasicBlockPool::new(BASIC_LINEAR_POOL, AllocatorId::Linear))
                    as Arc<dyn BlockPool>
            });
            pool
        };
        debug!("[{}] input pool: {} ({} slots)", self.name, allocator, num_slots);

        let capacity = linear_capacity(format);
        if graphic {
            let (width, height) = format.map_or((0, 0), |f| (f.width, f.height));
            if width == 0 || height == 0 {
                warn!("[{}] graphic input without dimensions", self.name);
                return Err(Status::BadValue);
            }
            let allocation = InputAllocation::Graphic {
                pool,
                width,
                height,
                format: PixelFormat::Yuv420Flexible,
            };
            Ok(InputBuffers::slots(&self.name, allocation))
        } else if has_crypto {
            let allocation = InputAllocation::EncryptedLinear {
                pool,
                capacity,
                secure,
            };
            InputBuffers::slots(&self.name, allocation).to_array_mode(&self.name, num_slots)
        } else {
            Ok(InputBuffers::slots(
                &self.name,
                InputAllocation::Linear { pool, capacity },
            ))
        }
    }

    fn configure_output_pool(
        &self,
        component: &Arc<dyn Component>,
        params: &ComponentParams,
        buffer_queue: bool,
    ) -> Result<PoolId> {
        let previous = self.pools.lock().output.take();
        if let Some(previous) = previous
            && previous.local_id() >= PLATFORM_POOL_START
            && let Err(err) = component.destroy_block_pool(previous.local_id())
        {
            debug!("[{}] destroyBlockPool({}) failed: {}", self.name, previous.local_id(), err);
        }

        if let Some(id) = params.output_pool_id {
            debug!("[{}] component supplies output pool #{}", self.name, id);
            self.pools.lock().output_pool_id = Some(id);
            return Ok(id);
        }

        let allocator = if buffer_queue {
            AllocatorId::BufferQueue
        } else {
            params.output_allocator.unwrap_or(match params.output_kind {
                BufferKind::Graphic => AllocatorId::Graphic,
                BufferKind::Linear => AllocatorId::Linear,
            })
        };
        let pool = component.create_block_pool(allocator).map_err(|err| {
            warn!("[{}] createBlockPool({}) failed: {}", self.name, allocator, err);
            err
        })?;
        let id = pool.local_id();
        if let Err(err) = component.config(&[Param::OutputPoolId(id)]) {
            warn!("[{}] configuring output pool #{} failed: {}", self.name, id, err);
        }
        let mut pools = self.pools.lock();
        pools.output = Some(pool);
        pools.output_pool_id = Some(id);
        debug!("[{}] output pool #{} ({})", self.name, id, allocator);
        Ok(id)
    }

    /// Allocate the first batch of input buffers. Retries once after a
    /// short wait before giving up.
    pub fn prepare_initial_input_buffers(&self) -> Result<Vec<(usize, Arc<ClientBuffer>)>> {
        for attempt in 0..2 {
            let buffers = self.take_available_input();
            if !buffers.is_empty() {
                return Ok(buffers);
            }
            if attempt == 0 {
                debug!("[{}] no initial input buffer yet; retrying", self.name);
                std::thread::sleep(self.config.initial_buffer_retry());
            }
        }
        warn!("[{}] no input buffers available", self.name);
        Err(Status::NoMemory)
    }

    fn take_available_input(&self) -> Vec<(usize, Arc<ClientBuffer>)> {
        let mut input = self.input.lock();
        let mut buffers = Vec::new();
        while input.buffers.num_active_slots() < input.num_slots {
            match input.buffers.request_new_buffer() {
                Ok(requested) => buffers.push(requested),
                Err(err) => {
                    trace!("[{}] input buffer request stopped: {}", self.name, err);
                    break;
                }
            }
        }
        buffers
    }

    /// Re-queue codec config retired by the last flush, then offer the
    /// prepared buffers to the client.
    pub fn request_initial_input_buffers(
        &self,
        buffers: Vec<(usize, Arc<ClientBuffer>)>,
    ) -> Result<()> {
        let component = self.component().ok_or(Status::InvalidOperation)?;
        let configs = std::mem::take(&mut *self.flushed_configs.lock());
        if !configs.is_empty() {
            let indices: Vec<u64> = configs.iter().map(Work::frame_index).collect();
            let now = Instant::now();
            {
                let mut watcher = self.watcher.lock();
                for work in &configs {
                    watcher.on_work_queued(work.frame_index(), work.input.buffers.clone(), now);
                }
            }
            debug!("[{}] re-queueing {} codec config works", self.name, indices.len());
            if let Err(err) = component.queue(configs) {
                let mut watcher = self.watcher.lock();
                for index in &indices {
                    watcher.on_work_done(*index);
                }
                drop(watcher);
                self.report_fatal(err);
                return Err(err);
            }
            for _ in &indices {
                self.health.record_work_queued(0);
            }
        }

        let Some(client) = self.client() else {
            debug!("[{}] no client for initial input buffers", self.name);
            return Ok(());
        };
        for (index, buffer) in buffers {
            self.health.record_input_offered();
            client.on_input_buffer_available(index, buffer);
        }
        Ok(())
    }

    // ---- input ----

    /// Submit a filled client input buffer to the component.
    pub fn queue_input_buffer(&self, buffer: &Arc<ClientBuffer>) -> Result<()> {
        let guard = self.sync.guard();
        if !guard.is_running() {
            debug!("[{}] queue_input_buffer: not running", self.name);
            return Err(Status::NotSupported);
        }
        self.check_not_errored()?;
        self.check_pool_origin(buffer)?;
        self.queue_input_buffer_internal(buffer, None)
    }

    /// Decrypt (or descramble) an encrypted client buffer in place and
    /// submit the result. `infos` holds one entry per access unit.
    pub fn queue_secure_input_buffer(
        &self,
        buffer: &Arc<ClientBuffer>,
        secure: bool,
        infos: &[CryptoInfo],
    ) -> Result<()> {
        let guard = self.sync.guard();
        if !guard.is_running() {
            debug!("[{}] queue_secure_input_buffer: not running", self.name);
            return Err(Status::NotSupported);
        }
        self.check_not_errored()?;
        self.check_pool_origin(buffer)?;
        if infos.is_empty() {
            return Err(Status::BadValue);
        }

        let encrypted_info = if self.config.send_encrypted_info_buffer {
            self.copy_encrypted_info(buffer)?
        } else {
            None
        };

        let decrypted = self
            .crypto
            .lock()
            .decrypt_client_buffer(buffer, secure, infos)
            .inspect_err(|err| {
                self.health.record_decrypt_failure();
                warn!("[{}] decrypt failed: {}", self.name, err);
            })?;
        buffer.set_range(decrypted.codec_data_offset, decrypted.size)?;

        if infos.len() > 1 {
            let meta = buffer.meta();
            let mut units = meta.access_units.unwrap_or_default();
            units.resize(
                infos.len(),
                AccessUnitInfo {
                    flags: BufferFlags::empty(),
                    size: 0,
                    timestamp: meta.time_us,
                },
            );
            let units = access_units_for(infos, &units);
            buffer.update_meta(|meta| meta.access_units = Some(units));
        }

        self.queue_input_buffer_internal(buffer, encrypted_info)
    }

    fn copy_encrypted_info(&self, buffer: &ClientBuffer) -> Result<Option<InfoBuffer>> {
        let Some(memory) = buffer.encrypted_memory() else {
            return Ok(None);
        };
        let Some(pool) = self.pools.lock().info.clone() else {
            return Ok(None);
        };
        let size = buffer.size();
        if size == 0 {
            return Ok(None);
        }
        let data = memory.read(buffer.offset(), size)?;
        let mut block = pool.fetch_linear_block(
            self.config.encrypted_alloc_size(size),
            MemoryUsage::CPU_READ_WRITE,
        )?;
        block.map()?[..size].copy_from_slice(&data);
        Ok(Some(InfoBuffer {
            index: 0,
            block: block.share(0, size)?,
        }))
    }

    /// Use `buffer` as the payload of `client` on its next submission.
    pub fn attach_buffer(&self, buffer: &Arc<CodecBuffer>, client: &Arc<ClientBuffer>) -> Result<()> {
        client.attach(buffer.clone());
        Ok(())
    }

    /// Decrypt `info`'s subsamples of `memory` at `offset` into a pool block
    /// and attach it to `client`.
    pub fn attach_encrypted_buffer(
        &self,
        memory: &Arc<SharedMemory>,
        secure: bool,
        info: &CryptoInfo,
        offset: usize,
        client: &Arc<ClientBuffer>,
    ) -> Result<()> {
        let pool = self.pools.lock().input.clone().ok_or(Status::InvalidOperation)?;
        let attached = self
            .crypto
            .lock()
            .attach_encrypted_buffer(pool.as_ref(), memory, secure, info, offset)
            .inspect_err(|err| {
                self.health.record_decrypt_failure();
                warn!("[{}] attach_encrypted_buffer failed: {}", self.name, err);
            })?;
        match attached {
            Some((block, written)) => {
                client.attach(Arc::new(CodecBuffer::linear(block.share(0, written)?)));
            }
            None => client.set_range(0, 0)?,
        }
        Ok(())
    }

    /// Reject a client buffer whose block came from another input pool or
    /// from an earlier generation of the current one.
    fn check_pool_origin(&self, buffer: &ClientBuffer) -> Result<()> {
        let Some((pool_id, generation)) = buffer.pool_origin() else {
            return Ok(());
        };
        let Some(pool) = self.pools.lock().input.clone() else {
            return Ok(());
        };
        if pool_id != pool.local_id() || generation != pool.generation() {
            warn!(
                "[{}] buffer from pool {} gen {} (current: {} gen {})",
                self.name,
                pool_id,
                generation,
                pool.local_id(),
                pool.generation()
            );
            return Err(Status::BadValue);
        }
        Ok(())
    }

    fn queue_input_buffer_internal(
        &self,
        buffer: &Arc<ClientBuffer>,
        encrypted_info: Option<InfoBuffer>,
    ) -> Result<()> {
        let component = self.component().ok_or(Status::InvalidOperation)?;
        let meta = buffer.meta();
        if self.input_met_eos.load(Ordering::Acquire) {
            debug!("[{}] buffer after EOS ignored (ts={})", self.name, meta.time_us);
            self.input.lock().buffers.return_client_slot(buffer);
            return Ok(());
        }

        let flags = meta.flags.to_frame_flags();
        let eos = flags.contains(FrameFlags::END_OF_STREAM);
        let size = buffer.size();

        let mut input_buffers = Vec::new();
        if size > 0 {
            let converted = self.release_input(buffer)?;
            if let Some(units) = &meta.access_units {
                converted.set_info(BufferInfo::AccessUnits(units.clone()));
            }
            input_buffers.push(converted);
        } else if !self.input.lock().buffers.return_client_slot(buffer) {
            debug!("[{}] unknown empty input buffer", self.name);
            return Err(Status::NotFound);
        }

        if eos {
            self.input_met_eos.store(true, Ordering::Release);
        }
        let split_eos = eos && !input_buffers.is_empty();
        let frame_index = self
            .frame_index
            .fetch_add(if split_eos { 2 } else { 1 }, Ordering::AcqRel);
        let ordinal = Ordinal {
            timestamp: meta.time_us,
            frame_index,
            custom_ordinal: meta.time_us,
        };

        let work_flags = if split_eos {
            flags.difference(FrameFlags::END_OF_STREAM)
        } else {
            flags
        };
        let mut work = Work::new(ordinal, work_flags);
        work.input.buffers = input_buffers;
        work.input.config_update = std::mem::take(&mut *self.pending_params.lock());
        if meta.tunnel_first_frame {
            work.input.config_update.push(Param::TunnelHoldRender(true));
        }
        work.input.info_buffers = std::mem::take(&mut *self.info_buffers.lock());
        work.input.info_buffers.extend(encrypted_info);

        let mut works = vec![work];
        if split_eos {
            let eos_ordinal = Ordinal {
                frame_index: frame_index + 1,
                ..ordinal
            };
            works.push(Work::new(eos_ordinal, FrameFlags::END_OF_STREAM));
        }
        trace!(
            "[{}] queue: #{} ts={} size={} flags={:?}",
            self.name, frame_index, meta.time_us, size, flags
        );

        let now = Instant::now();
        {
            let mut watcher = self.watcher.lock();
            for work in &works {
                watcher.on_work_queued(work.frame_index(), work.input.buffers.clone(), now);
            }
        }
        let count = works.len() as u64;
        if let Err(err) = component.queue(works) {
            warn!("[{}] queue failed: {}", self.name, err);
            {
                let mut watcher = self.watcher.lock();
                for index in frame_index..frame_index + count {
                    watcher.on_work_done(index);
                }
            }
            self.report_fatal(err);
            return Err(err);
        }

        self.health.record_work_queued(size);
        if split_eos {
            self.health.record_work_queued(0);
        }
        self.session.on_work_queued(eos);
        self.feed_input_buffer_if_available();
        Ok(())
    }

    /// Convert a client buffer for submission and release its slot. A deep
    /// copy through an extra slot is used while the policy allows it.
    fn release_input(&self, buffer: &Arc<ClientBuffer>) -> Result<Arc<CodecBuffer>> {
        let mut input = self.input.lock();
        let limit = match self.config.extra_slot_policy {
            ExtraSlotPolicy::Disabled => 0,
            ExtraSlotPolicy::Auto => input.num_extra_slots,
            ExtraSlotPolicy::Fixed(n) => n,
        };
        if input.extra.num_component_buffers() < limit {
            match input.buffers.clone_and_release(buffer) {
                Ok(copy) => {
                    let index = input.extra.assign_slot(copy);
                    trace!("[{}] input copied to extra slot #{}", self.name, index);
                    return input.extra.release_slot(index);
                }
                Err(Status::NotFound) => return Err(Status::NotFound),
                Err(err) => trace!("[{}] extra slot copy unavailable: {}", self.name, err),
            }
        }
        let converted = input.buffers.release_buffer(buffer).inspect_err(|err| {
            debug!("[{}] input buffer release failed: {}", self.name, err);
        })?;
        input.buffers.return_client_slot(buffer);
        Ok(converted)
    }

    /// Offer free input buffers to the client while the pipeline has room.
    fn feed_input_buffer_if_available(&self) {
        if self.input_met_eos.load(Ordering::Acquire) || !self.sync.is_running() {
            return;
        }
        {
            let output = self.output.lock();
            let Some(buffers) = output.buffers.as_ref() else {
                return;
            };
            if buffers.has_pending() || buffers.num_active_slots() >= output.num_slots {
                return;
            }
        }
        let Some(client) = self.client() else {
            return;
        };
        loop {
            let room = {
                let watcher = self.watcher.lock();
                if watcher.pipeline_full() {
                    drop(watcher);
                    self.queue_keepalive_if_paused();
                    return;
                }
                watcher.pipeline_room()
            };
            let (index, buffer) = {
                let mut input = self.input.lock();
                if input.buffers.num_active_slots() >= input.num_slots {
                    return;
                }
                // Buffers already offered count against the room.
                if input.buffers.num_client_buffers() >= room {
                    return;
                }
                match input.buffers.request_new_buffer() {
                    Ok(requested) => requested,
                    Err(err) => {
                        trace!("[{}] no input buffer: {}", self.name, err);
                        return;
                    }
                }
            };
            self.health.record_input_offered();
            client.on_input_buffer_available(index, buffer);
        }
    }

    /// Queue an empty drop-frame work when the pipeline has been full for
    /// longer than the paused timeout.
    fn queue_keepalive_if_paused(&self) {
        if !self.config.paused_keepalive {
            return;
        }
        let timeout = self.config.pipeline_paused_timeout();
        let now = Instant::now();
        if self.watcher.lock().elapsed(now, 0) <= timeout {
            return;
        }
        {
            let mut last = self.last_keepalive.lock();
            if last.is_some_and(|at| now.duration_since(at) < timeout) {
                return;
            }
            *last = Some(now);
        }
        let Some(component) = self.component() else {
            return;
        };
        let frame_index = self.frame_index.fetch_add(1, Ordering::AcqRel);
        let ordinal = Ordinal {
            frame_index,
            ..Ordinal::default()
        };
        info!("[{}] pipeline paused, queueing keepalive #{}", self.name, frame_index);
        match component.queue(vec![Work::new(ordinal, FrameFlags::DROP_FRAME)]) {
            Ok(()) => self.health.record_keepalive(),
            Err(err) => warn!("[{}] keepalive queue failed: {}", self.name, err),
        }
    }

    /// Return a buffer without submitting or rendering it.
    pub fn discard_buffer(&self, buffer: &Arc<ClientBuffer>) -> Result<()> {
        self.check_pool_origin(buffer)?;
        let mut released = self.input.lock().buffers.return_client_slot(buffer);
        if !released {
            let mut output = self.output.lock();
            if let Some(buffers) = output.buffers.as_mut()
                && buffers.is_client_owned(buffer)
            {
                buffers.release_buffer(buffer);
                released = true;
            }
        }
        if !released {
            debug!("[{}] discard_buffer: unknown buffer", self.name);
            return Err(Status::NotFound);
        }
        self.send_output_buffers();
        self.feed_input_buffer_if_available();
        Ok(())
    }

    pub fn set_parameters(&self, params: Vec<Param>) -> Result<()> {
        let guard = self.sync.guard();
        if !guard.is_running() {
            return Err(Status::NotSupported);
        }
        let (immediate, deferred): (Vec<Param>, Vec<Param>) = params
            .into_iter()
            .partition(|param| matches!(param, Param::TunnelStartRender));
        if !immediate.is_empty() {
            let component = self.component().ok_or(Status::InvalidOperation)?;
            component.config(&immediate)?;
        }
        self.pending_params.lock().extend(deferred);
        Ok(())
    }

    /// Attach `info` to the next submitted work.
    pub fn set_info_buffer(&self, info: InfoBuffer) {
        self.info_buffers.lock().push(info);
    }

    pub fn set_crypto(&self, crypto: Option<Arc<dyn CryptoBackend>>) {
        self.crypto.lock().set_crypto(crypto);
    }

    pub fn set_descrambler(&self, descrambler: Option<Arc<dyn Descrambler>>) {
        self.crypto.lock().set_descrambler(descrambler);
    }

    /// Pin the input buffers and return them in index order.
    pub fn get_input_buffer_array(&self) -> Result<Vec<Arc<ClientBuffer>>> {
        let mut input = self.input.lock();
        if !input.buffers.is_array_mode() {
            let size = input.num_slots;
            let buffers = std::mem::take(&mut input.buffers);
            input.buffers = buffers.to_array_mode(&self.name, size).inspect_err(|err| {
                warn!("[{}] input array mode failed: {}", self.name, err);
            })?;
        }
        Ok(input.buffers.array())
    }

    /// Pin the output buffers and return them in index order.
    pub fn get_output_buffer_array(&self) -> Result<Vec<Arc<ClientBuffer>>> {
        let mut output = self.output.lock();
        let size = output.num_slots;
        let buffers = output.buffers.as_mut().ok_or(Status::InvalidOperation)?;
        if buffers.kind() == BufferKind::Graphic {
            return Err(Status::InvalidOperation);
        }
        if !buffers.is_array_mode() {
            let capacity = linear_capacity(buffers.format().as_deref());
            buffers.to_array_mode(size, capacity);
        }
        Ok(buffers.array())
    }

    // ---- output ----

    fn release_output(&self, buffer: &Arc<ClientBuffer>) -> Result<Option<Arc<CodecBuffer>>> {
        let mut output = self.output.lock();
        let buffers = output.buffers.as_mut().ok_or(Status::InvalidOperation)?;
        if !buffers.is_client_owned(buffer) {
            debug!("[{}] output buffer not owned by the client", self.name);
            return Err(Status::NotFound);
        }
        Ok(buffers.release_buffer(buffer))
    }

    /// Hand a delivered output buffer to the output surface.
    pub fn render_output_buffer(
        &self,
        buffer: &Arc<ClientBuffer>,
        render_time_ns: Option<i64>,
    ) -> Result<()> {
        let meta = buffer.meta();
        let released = self.release_output(buffer)?;
        self.send_output_buffers();
        self.feed_input_buffer_if_available();

        if self.tunneled.load(Ordering::Acquire) {
            trace!("[{}] render: tunneled output is rendered by the component", self.name);
            return Ok(());
        }
        let Some(codec) = released else {
            debug!("[{}] render: no data (ts={})", self.name, meta.time_us);
            return Ok(());
        };
        let Some(block) = codec.as_graphic() else {
            debug!("[{}] render: not a graphic buffer", self.name);
            return Err(Status::InvalidOperation);
        };
        let Some(surface) = self.surface.lock().surface.clone() else {
            info!("[{}] render: no output surface", self.name);
            return Ok(());
        };

        let (degrees, flip) = codec.rotation().unwrap_or((0, false));
        let input = QueueBufferInput {
            timestamp_ns: render_time_ns.unwrap_or(meta.time_us.saturating_mul(1000)),
            crop: block.crop(),
            scaling_mode: ScalingMode::ScaleToWindow,
            transform: Transform::from_rotation(degrees, flip),
            hdr: codec.hdr(),
            damage: None,
        };
        let queued = surface.queue_buffer(&codec, &input).inspect_err(|err| {
            warn!("[{}] queueBuffer failed: {}", self.name, err);
        })?;
        trace!("[{}] rendered ts={} as frame {}", self.name, meta.time_us, queued.frame_number);

        let rendered = {
            let mut surface = self.surface.lock();
            surface.tracker.track(queued.frame_number, meta.time_us);
            surface.tracker.process(&queued.events)
        };
        if !rendered.is_empty() {
            self.session.on_output_frames_rendered(&rendered);
        }
        Ok(())
    }

    /// Report frames the component's surface has presented since the last
    /// poll.
    pub fn poll_for_rendered_buffers(&self) {
        let Some(component) = self.component() else {
            return;
        };
        let events = component.poll_for_rendered_frames();
        if events.is_empty() {
            return;
        }
        let rendered = self.surface.lock().tracker.process(&events);
        if !rendered.is_empty() {
            self.session.on_output_frames_rendered(&rendered);
        }
    }

    /// Swap the output surface.
    pub fn set_surface(&self, surface: Arc<dyn OutputSurface>, generation: u32) -> Result<()> {
        let max_dequeue = self.surface.lock().max_dequeue;
        if let Err(err) = surface.set_max_dequeued_buffer_count(max_dequeue) {
            warn!("[{}] setMaxDequeuedBufferCount({}) failed: {}", self.name, max_dequeue, err);
        }
        let pool_id = self.pools.lock().output_pool_id;
        if let (Some(component), Some(pool_id)) = (self.component(), pool_id) {
            component
                .set_output_surface(pool_id, surface.clone(), generation, max_dequeue)
                .map_err(|err| {
                    warn!("[{}] setOutputSurface failed: {}", self.name, err);
                    Status::InvalidOperation
                })?;
        }
        let mut state = self.surface.lock();
        state.surface = Some(surface);
        state.generation = generation;
        state.tracker.clear();
        info!("[{}] output surface set (generation {})", self.name, generation);
        Ok(())
    }

    pub fn stop_use_output_surface(&self) {
        let had_surface = {
            let mut state = self.surface.lock();
            state.tracker.clear();
            state.surface.take().is_some()
        };
        let pool_id = self.pools.lock().output_pool_id;
        if let (Some(component), Some(pool_id)) = (self.component(), pool_id) {
            component.stop_using_output_surface(pool_id);
        }
        debug!("[{}] stopped using output surface ({})", self.name, had_surface);
    }

    /// Called from the surface's producer thread.
    pub fn on_surface_buffer_released(&self, generation: u32) {
        self.surface_handler
            .post(SurfaceEvent::BufferReleased { generation });
    }

    /// Called from the surface's producer thread.
    pub fn on_surface_buffer_attached(&self, generation: u32) {
        self.surface_handler
            .post(SurfaceEvent::BufferAttached { generation });
    }

    fn handle_work(&self, mut work: Work) -> bool {
        if self.state.lock().is_released() {
            return false;
        }
        let frame_index = work.frame_index();
        self.health.record_work_completed();

        let mut notify = match work.result {
            WorkResult::Ok => true,
            WorkResult::NotFound => {
                debug!("[{}] flushed work #{}; not delivered", self.name, frame_index);
                false
            }
            WorkResult::Omitted => {
                trace!("[{}] work #{} omitted", self.name, frame_index);
                self.watcher.lock().on_work_done(frame_index);
                self.health.record_work_discarded();
                return false;
            }
            WorkResult::Error(code) => {
                let status = Status::from_code(code);
                warn!("[{}] work #{} failed: {}", self.name, frame_index, status);
                self.watcher.lock().on_work_done(frame_index);
                self.report_fatal(status);
                return false;
            }
        };
        if frame_index < self.first_valid_frame_index.load(Ordering::Acquire) {
            notify = false;
        }

        if work.worklets.len() != 1 {
            warn!(
                "[{}] work #{}: {} worklets",
                self.name,
                frame_index,
                work.worklets.len()
            );
            self.watcher.lock().on_work_done(frame_index);
            self.report_fatal(Status::Unknown);
            return false;
        }
        let Some(worklet) = work.worklets.pop() else {
            return false;
        };
        let mut output = worklet.output;
        if !output.flags.contains(FrameFlags::INCOMPLETE) {
            self.watcher.lock().on_work_done(frame_index);
        }
        if output.buffers.len() > 1 {
            warn!("[{}] work #{}: {} output buffers", self.name, frame_index, output.buffers.len());
            self.report_fatal(Status::Unknown);
            return false;
        }

        let updates = self.apply_config_updates(
            std::mem::take(&mut output.config_update),
            output.flags,
        );
        let buffer = output.buffers.pop();
        let shift = work
            .input
            .ordinal
            .custom_ordinal
            .wrapping_sub(work.input.ordinal.timestamp);
        let timestamp = output.ordinal.timestamp.wrapping_add(shift);

        if let Some(csd) = updates.init_data
            && !self.deliver_csd(&csd, timestamp, updates.format.clone(), notify)
        {
            return false;
        }

        if output.flags.contains(FrameFlags::DROP_FRAME)
            && !output.flags.contains(FrameFlags::END_OF_STREAM)
        {
            notify = false;
        }
        let mut flags = BufferFlags::from_frame_flags(output.flags);
        if buffer.is_none() && flags.is_empty() {
            trace!("[{}] work #{}: nothing to report", self.name, frame_index);
            return true;
        }
        if buffer.as_ref().and_then(|b| b.picture_sync()) == Some(true) {
            flags |= BufferFlags::KEY_FRAME;
        }

        {
            let mut out = self.output.lock();
            let Some(buffers) = out.buffers.as_mut() else {
                return false;
            };
            buffers.push_to_stash(buffer, notify, timestamp, flags, updates.format, output.ordinal);
        }
        self.send_output_buffers();
        true
    }

    fn apply_config_updates(&self, updates: Vec<Param>, flags: FrameFlags) -> ConfigUpdates {
        let mut result = ConfigUpdates::default();
        let mut delays_changed = false;
        let mut max_dequeue_changed = false;
        let mut buffers_changed = false;
        for param in updates {
            match param {
                Param::ReorderDepth(depth) => {
                    if let Some(buffers) = self.output.lock().buffers.as_mut() {
                        buffers.set_reorder_depth(depth);
                    }
                    debug!("[{}] reorder depth -> {}", self.name, depth);
                    max_dequeue_changed = true;
                }
                Param::ReorderKey(key) => {
                    if let Some(buffers) = self.output.lock().buffers.as_mut() {
                        buffers.set_reorder_key(key);
                    }
                    debug!("[{}] reorder key -> {:?}", self.name, key);
                }
                Param::InputDelay(delay) => {
                    self.set_input_delays(Some(delay), None);
                    delays_changed = true;
                }
                Param::PipelineDelay(delay) => {
                    self.set_input_delays(None, Some(delay));
                    delays_changed = true;
                }
                Param::OutputDelay(delay) => {
                    let mut output = self.output.lock();
                    output.output_delay = delay;
                    let slots = delay + self.config.smoothness_factor;
                    if slots > output.num_slots {
                        output.num_slots = slots;
                        if let Some(buffers) = output.buffers.as_mut()
                            && buffers.is_array_mode()
                        {
                            buffers.grow(slots);
                            buffers_changed = true;
                        }
                    }
                    debug!("[{}] output delay -> {} ({} slots)", self.name, delay, output.num_slots);
                    delays_changed = true;
                    max_dequeue_changed = true;
                }
                Param::TunnelSystemTime {
                    media_time_us,
                    render_time_ns,
                } => self.session.on_output_frames_rendered(&[RenderedFrame {
                    media_time_us,
                    render_time_ns,
                }]),
                Param::TunnelHoldRender(true) if flags.contains(FrameFlags::INCOMPLETE) => {
                    self.session.on_first_tunnel_frame_ready()
                }
                Param::InitData(data) => result.init_data = Some(data),
                Param::OutputFormat(format) => result.format = Some(format),
                other => trace!("[{}] config update {:?} ignored", self.name, other),
            }
        }
        if delays_changed {
            self.sync_watcher_delays();
        }
        if max_dequeue_changed {
            self.update_max_dequeue_count();
        }
        if buffers_changed {
            self.session.on_output_buffers_changed();
        }
        result
    }

    fn set_input_delays(&self, input_delay: Option<usize>, pipeline_delay: Option<usize>) {
        let mut input = self.input.lock();
        if let Some(delay) = input_delay {
            input.input_delay = delay;
        }
        if let Some(delay) = pipeline_delay {
            input.pipeline_delay = delay;
        }
        let slots = input.input_delay + input.pipeline_delay + self.config.smoothness_factor;
        if input.buffers.is_array_mode() {
            if slots > input.num_slots {
                input.num_extra_slots = slots - input.num_slots;
                debug!("[{}] {} extra input slots", self.name, input.num_extra_slots);
            }
        } else {
            input.num_slots = slots;
        }
    }

    fn sync_watcher_delays(&self) {
        let (input_delay, pipeline_delay) = {
            let input = self.input.lock();
            (input.input_delay, input.pipeline_delay)
        };
        let output_delay = self.output.lock().output_delay;
        self.watcher
            .lock()
            .input_delay(input_delay)
            .pipeline_delay(pipeline_delay)
            .output_delay(output_delay);
    }

    fn update_max_dequeue_count(&self) {
        let count = {
            let output = self.output.lock();
            output.num_slots + output.buffers.as_ref().map_or(0, OutputBuffers::reorder_depth)
        } + self.config.rendering_depth;
        let surface = {
            let mut state = self.surface.lock();
            state.max_dequeue = count;
            state.surface.clone()
        };
        let Some(surface) = surface else {
            return;
        };
        if let Err(err) = surface.set_max_dequeued_buffer_count(count) {
            warn!("[{}] setMaxDequeuedBufferCount({}) failed: {}", self.name, count, err);
        }
        if let Some(component) = self.component()
            && let Err(err) = component.set_output_surface_max_dequeue_count(count)
        {
            warn!("[{}] component max dequeue update failed: {}", self.name, err);
        }
    }

    /// Register codec-specific data and deliver it ahead of stashed output.
    /// Returns false when delivery failed fatally.
    fn deliver_csd(
        &self,
        data: &[u8],
        timestamp: i64,
        format: Option<Arc<MediaFormat>>,
        notify: bool,
    ) -> bool {
        let client = self.client();
        let mut output = self.output.lock();
        let Some(buffers) = output.buffers.as_mut() else {
            return false;
        };
        if let Some(format) = &format {
            buffers.update_skip_cut_buffer(format);
            buffers.set_format(Some(format.clone()));
        }
        if !notify {
            return true;
        }
        match buffers.register_csd(data) {
            Ok((index, buffer)) => {
                buffer.update_meta(|meta| {
                    meta.time_us = timestamp;
                    meta.flags = BufferFlags::CODEC_CONFIG;
                });
                self.health.record_output_delivered();
                if let Some(client) = client {
                    client.on_output_buffer_available(index, buffer);
                }
                true
            }
            Err(err) => {
                drop(output);
                warn!("[{}] codec config registration failed: {}", self.name, err);
                self.report_fatal(Status::Unknown);
                false
            }
        }
    }

    /// Drain released stash entries to the client.
    fn send_output_buffers(&self) {
        let client = self.client();
        loop {
            let mut output = self.output.lock();
            let Output {
                buffers,
                num_slots,
                realloc_tries,
                ..
            } = &mut *output;
            let Some(buffers) = buffers.as_mut() else {
                return;
            };
            let action = buffers.pop_from_stash_and_register();
            if !matches!(action, BufferAction::Reallocate(_)) {
                *realloc_tries = 0;
            }
            match action {
                BufferAction::Skip => return,
                BufferAction::Discard => self.health.record_work_discarded(),
                BufferAction::Retry => {
                    trace!("[{}] no free output slot; retrying later", self.name);
                    return;
                }
                BufferAction::NotifyClient { index, buffer } => {
                    self.health.record_output_delivered();
                    if let Some(client) = &client {
                        client.on_output_buffer_available(index, buffer);
                    }
                }
                BufferAction::Reallocate(buffer) => {
                    *realloc_tries += 1;
                    if *realloc_tries > self.config.max_realloc_tries {
                        let tries = *realloc_tries - 1;
                        drop(output);
                        warn!(
                            "[{}] output buffer still unusable after {} reallocations",
                            self.name, tries
                        );
                        self.report_fatal(Status::Unknown);
                        return;
                    }
                    if !buffers.is_array_mode() {
                        let capacity = linear_capacity(buffers.format().as_deref());
                        buffers.to_array_mode(*num_slots, capacity);
                    }
                    buffers.realloc(&buffer);
                    drop(output);
                    self.session.on_output_buffers_changed();
                }
            }
        }
    }

    // ---- lifecycle ----

    /// Retire flushed work. Codec-config works are kept as drop-frame
    /// copies and re-queued on the next start.
    pub fn flush(&self, flushed: Vec<Work>) {
        let next = self.frame_index.load(Ordering::Acquire);
        self.input.lock().last_flush_index = next;
        debug!("[{}] flush: {} works, last flush index {}", self.name, flushed.len(), next);

        let mut configs = Vec::new();
        {
            let mut watcher = self.watcher.lock();
            for work in flushed {
                let frame_index = work.frame_index();
                if work.input.flags.contains(FrameFlags::CODEC_CONFIG) {
                    let buffers: Vec<Arc<CodecBuffer>> = (0..work.input.buffers.len().max(1))
                        .filter_map(|i| {
                            watcher
                                .on_input_buffer_released(frame_index, i)
                                .or_else(|| work.input.buffers.get(i).cloned())
                        })
                        .collect();
                    if buffers.first().is_some_and(|b| b.as_linear().is_some()) {
                        let ordinal = Ordinal {
                            frame_index: self.frame_index.fetch_add(1, Ordering::AcqRel),
                            ..work.input.ordinal
                        };
                        let mut copy =
                            Work::new(ordinal, work.input.flags | FrameFlags::DROP_FRAME);
                        copy.input.buffers = buffers;
                        copy.input.config_update = work.input.config_update.clone();
                        copy.input.info_buffers = work.input.info_buffers.clone();
                        configs.push(copy);
                    } else {
                        debug!("[{}] flushed codec config #{} has no data", self.name, frame_index);
                    }
                }
                watcher.on_work_done(frame_index);
            }
        }
        if !configs.is_empty() {
            debug!("[{}] kept {} codec config works", self.name, configs.len());
            self.flushed_configs.lock().extend(configs);
        }

        {
            let mut input = self.input.lock();
            input.buffers.flush();
            input.extra.flush();
        }
        {
            let mut output = self.output.lock();
            output.realloc_tries = 0;
            if let Some(buffers) = output.buffers.as_mut() {
                buffers.flush();
                buffers.flush_stash();
            }
        }
        self.info_buffers.lock().clear();
    }

    /// Close admission. Completions of work queued so far are still
    /// processed but never delivered.
    pub fn stop(&self) {
        self.sync.stop();
        self.first_valid_frame_index
            .store(self.frame_index.load(Ordering::Acquire), Ordering::Release);
        self.info_buffers.lock().clear();
        self.transition(ChannelState::Stopped);
        info!("[{}] stopped", self.name);
    }

    /// Stop and drop the buffer sets; a new start is required.
    pub fn reset(&self) {
        self.stop();
        self.watcher.lock().flush();
        {
            let mut input = self.input.lock();
            input.buffers = InputBuffers::Dummy;
            input.extra.flush();
        }
        {
            let mut output = self.output.lock();
            output.buffers = None;
            output.realloc_tries = 0;
        }
        {
            let mut pools = self.pools.lock();
            pools.input_generation = match pools.input.as_ref() {
                Some(pool) => pool.bump_generation(),
                None => pools.input_generation.wrapping_add(1),
            };
        }
        self.surface.lock().tracker.clear();
        self.flushed_configs.lock().clear();
        self.pending_params.lock().clear();
    }

    /// Tear down component, pools, surface and crypto.
    pub fn release(&self) {
        self.sync.stop();
        let component = self.component.lock().take();
        let output_pool = {
            let mut pools = self.pools.lock();
            pools.input = None;
            pools.info = None;
            pools.output = None;
            pools.output_pool_id.take()
        };
        if let (Some(component), Some(id)) = (&component, output_pool)
            && id >= PLATFORM_POOL_START
            && let Err(err) = component.destroy_block_pool(id)
        {
            debug!("[{}] destroyBlockPool({}) failed: {}", self.name, id, err);
        }
        {
            let mut surface = self.surface.lock();
            surface.surface = None;
            surface.tracker.clear();
        }
        self.crypto.lock().release();
        {
            let mut input = self.input.lock();
            input.buffers = InputBuffers::Dummy;
            input.extra.flush();
        }
        self.output.lock().buffers = None;
        self.client.lock().take();
        self.transition(ChannelState::Released);
        info!("[{}] released", self.name);
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let state = self.state.lock().description();
        let (frames_in_flight, pipeline_capacity) = {
            let watcher = self.watcher.lock();
            (watcher.in_flight(), watcher.capacity())
        };
        let (input_slots, active_input_slots, client_input_buffers) = {
            let input = self.input.lock();
            (
                input.num_slots,
                input.buffers.num_active_slots(),
                input.buffers.num_client_buffers(),
            )
        };
        let (output_slots, active_output_slots, reorder_depth) = {
            let output = self.output.lock();
            let buffers = output.buffers.as_ref();
            (
                output.num_slots,
                buffers.map_or(0, OutputBuffers::num_active_slots),
                buffers.map_or(0, OutputBuffers::reorder_depth),
            )
        };
        ChannelSnapshot {
            state,
            next_frame_index: self.frame_index.load(Ordering::Acquire),
            frames_in_flight,
            pipeline_capacity,
            input_slots,
            active_input_slots,
            client_input_buffers,
            output_slots,
            active_output_slots,
            reorder_depth,
            max_dequeue_count: self.surface.lock().max_dequeue,
        }
    }
}

impl WorkListener for BufferChannel {
    fn on_work_done(&self, works: Vec<Work>) {
        for work in works {
            if !self.handle_work(work) {
                trace!("[{}] work not delivered", self.name);
            }
        }
        self.feed_input_buffer_if_available();
    }

    fn on_input_buffer_done(&self, frame_index: u64, array_index: usize) {
        if frame_index < self.input.lock().last_flush_index {
            debug!("[{}] stale input buffer return for #{}", self.name, frame_index);
            return;
        }
        let Some(released) = self
            .watcher
            .lock()
            .on_input_buffer_released(frame_index, array_index)
        else {
            return;
        };
        let expired = {
            let mut input = self.input.lock();
            input.buffers.expire_component_buffer(&released)
                || input.extra.expire_component_buffer(&released)
        };
        drop(released);
        if expired {
            self.feed_input_buffer_if_available();
        }
    }
}

fn linear_capacity(format: Option<&MediaFormat>) -> usize {
    format
        .and_then(|format| format.max_input_size)
        .unwrap_or(DEFAULT_LINEAR_BUFFER_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::block::{GraphicBlock, LinearBlock, Rect};
    use crate::crypto::testing::{XorCrypto, plain};
    use crate::crypto::{CryptoMode, SubSample};
    use crate::loopback::{LoopbackComponent, LoopbackOptions};
    use crate::surface::{FrameEvent, QueueBufferOutput};
    use std::sync::Weak;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    type Offered = (usize, Arc<ClientBuffer>);

    struct TestClient {
        inputs: Mutex<Sender<Offered>>,
        outputs: Mutex<Sender<Offered>>,
    }

    impl ClientCallback for TestClient {
        fn on_input_buffer_available(&self, index: usize, buffer: Arc<ClientBuffer>) {
            let _ = self.inputs.lock().send((index, buffer));
        }

        fn on_output_buffer_available(&self, index: usize, buffer: Arc<ClientBuffer>) {
            let _ = self.outputs.lock().send((index, buffer));
        }
    }

    #[derive(Default)]
    struct TestSession {
        errors: Mutex<Vec<(Status, ErrorAction)>>,
        rendered: Mutex<Vec<RenderedFrame>>,
        buffers_changed: AtomicUsize,
        works_queued: AtomicUsize,
    }

    impl SessionCallback for TestSession {
        fn on_error(&self, status: Status, action: ErrorAction) {
            self.errors.lock().push((status, action));
        }

        fn on_output_frames_rendered(&self, frames: &[RenderedFrame]) {
            self.rendered.lock().extend_from_slice(frames);
        }

        fn on_output_buffers_changed(&self) {
            self.buffers_changed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_work_queued(&self, _eos: bool) {
            self.works_queued.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Component that keeps queued work until the test completes it.
    #[derive(Default)]
    struct RecordingComponent {
        params: Vec<Param>,
        queued: Mutex<Vec<Work>>,
        listener: Mutex<Option<Weak<dyn WorkListener>>>,
        fail_queue: AtomicBool,
        surfaces: Mutex<Vec<(PoolId, u32, usize)>>,
    }

    impl RecordingComponent {
        fn new(params: Vec<Param>) -> Arc<Self> {
            Arc::new(Self {
                params,
                ..Default::default()
            })
        }

        fn listener(&self) -> Arc<dyn WorkListener> {
            self.listener
                .lock()
                .as_ref()
                .and_then(Weak::upgrade)
                .unwrap()
        }

        fn frames(&self) -> Vec<u64> {
            self.queued.lock().iter().map(Work::frame_index).collect()
        }

        fn take(&self, frame_index: u64) -> Work {
            let mut queued = self.queued.lock();
            let position = queued
                .iter()
                .position(|work| work.frame_index() == frame_index)
                .unwrap();
            queued.remove(position)
        }

        /// Complete a queued work with `output` and `updates`, echoing the
        /// input ordinal.
        fn complete(&self, frame_index: u64, output: Option<Arc<CodecBuffer>>, updates: Vec<Param>) {
            let mut work = self.take(frame_index);
            let worklet = &mut work.worklets[0];
            worklet.output.ordinal = work.input.ordinal;
            worklet.output.flags =
                work.input.flags & (FrameFlags::END_OF_STREAM | FrameFlags::CODEC_CONFIG);
            worklet.output.buffers.extend(output);
            worklet.output.config_update = updates;
            work.input.buffers.clear();
            self.listener().on_work_done(vec![work]);
        }
    }

    impl Component for RecordingComponent {
        fn name(&self) -> &str {
            "c2.test.decoder"
        }

        fn query(&self, keys: &[ParamKey]) -> Result<Vec<Param>> {
            Ok(self
                .params
                .iter()
                .filter(|param| param.key().is_some_and(|key| keys.contains(&key)))
                .cloned()
                .collect())
        }

        fn config(&self, _params: &[Param]) -> Result<()> {
            Ok(())
        }

        fn queue(&self, works: Vec<Work>) -> Result<()> {
            if self.fail_queue.load(Ordering::SeqCst) {
                return Err(Status::NoMemory);
            }
            self.queued.lock().extend(works);
            Ok(())
        }

        fn set_listener(&self, listener: Weak<dyn WorkListener>) {
            *self.listener.lock() = Some(listener);
        }

        fn create_block_pool(&self, allocator: AllocatorId) -> Result<Arc<dyn BlockPool>> {
            Ok(Arc::new(BasicBlockPool::new(PLATFORM_POOL_START, allocator)))
        }

        fn destroy_block_pool(&self, _id: PoolId) -> Result<()> {
            Ok(())
        }

        fn set_output_surface(
            &self,
            pool_id: PoolId,
            _surface: Arc<dyn OutputSurface>,
            generation: u32,
            max_dequeue_count: usize,
        ) -> Result<()> {
            self.surfaces
                .lock()
                .push((pool_id, generation, max_dequeue_count));
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestSurface {
        queued: Mutex<Vec<QueueBufferInput>>,
        max_dequeue: Mutex<Vec<usize>>,
        frames: AtomicU64,
    }

    impl OutputSurface for TestSurface {
        fn queue_buffer(
            &self,
            _buffer: &Arc<CodecBuffer>,
            input: &QueueBufferInput,
        ) -> Result<QueueBufferOutput> {
            self.queued.lock().push(input.clone());
            let frame_number = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(QueueBufferOutput {
                frame_number,
                events: vec![FrameEvent {
                    frame_number,
                    present_time_ns: Some(42),
                }],
            })
        }

        fn set_max_dequeued_buffer_count(&self, count: usize) -> Result<()> {
            self.max_dequeue.lock().push(count);
            Ok(())
        }
    }

    struct Harness {
        channel: Arc<BufferChannel>,
        session: Arc<TestSession>,
        inputs: Receiver<Offered>,
        outputs: Receiver<Offered>,
    }

    fn harness(component: Arc<dyn Component>, config: ChannelConfig) -> Harness {
        let session = Arc::new(TestSession::default());
        let channel = BufferChannel::new(component, session.clone(), config);
        let (input_tx, inputs) = mpsc::channel();
        let (output_tx, outputs) = mpsc::channel();
        channel.set_client(Arc::new(TestClient {
            inputs: Mutex::new(input_tx),
            outputs: Mutex::new(output_tx),
        }));
        Harness {
            channel,
            session,
            inputs,
            outputs,
        }
    }

    impl Harness {
        fn start(&self, input: Option<MediaFormat>, output: Option<MediaFormat>, bound: bool) {
            self.channel
                .start(input.map(Arc::new), output.map(Arc::new), bound)
                .unwrap();
            let buffers = self.channel.prepare_initial_input_buffers().unwrap();
            self.channel.request_initial_input_buffers(buffers).unwrap();
        }

        fn input(&self) -> Arc<ClientBuffer> {
            self.inputs.recv_timeout(TIMEOUT).unwrap().1
        }

        fn output(&self) -> Arc<ClientBuffer> {
            self.outputs.recv_timeout(TIMEOUT).unwrap().1
        }

        fn queue(&self, data: &[u8], time_us: i64, flags: BufferFlags) -> Result<()> {
            let buffer = self.input();
            if !data.is_empty() {
                buffer.write(data).unwrap();
            }
            buffer.update_meta(|meta| {
                meta.time_us = time_us;
                meta.flags = flags;
            });
            self.channel.queue_input_buffer(&buffer)
        }
    }

    fn video() -> MediaFormat {
        MediaFormat {
            max_input_size: Some(256),
            ..MediaFormat::video("video/avc", 64, 48)
        }
    }

    fn linear(data: &[u8]) -> Arc<CodecBuffer> {
        let mut block = LinearBlock::detached(data.len());
        block.map().unwrap()[..data.len()].copy_from_slice(data);
        Arc::new(CodecBuffer::linear(block.share(0, data.len()).unwrap()))
    }

    #[test]
    fn test_frame_indices_and_custom_ordinals() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);

        for time_us in [0, 1000, 2000] {
            h.queue(&[1, 2, 3], time_us, BufferFlags::empty()).unwrap();
        }

        let works = component.queued.lock();
        let ordinals: Vec<(u64, i64)> = works
            .iter()
            .map(|work| (work.frame_index(), work.input.ordinal.custom_ordinal))
            .collect();
        assert_eq!(ordinals, vec![(0, 0), (1, 1000), (2, 2000)]);
        assert!(works.iter().all(|work| work.input.buffers.len() == 1));
        assert_eq!(h.session.works_queued.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_timestamp_near_max_is_kept() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        let time_us = i64::MAX - 10;
        h.queue(&[1], time_us, BufferFlags::empty()).unwrap();

        component.complete(0, Some(linear(&[2])), vec![]);
        assert_eq!(h.output().meta().time_us, time_us);
    }

    /// Client queueing straight from the input callback.
    struct QueueingClient {
        channel: Mutex<Weak<BufferChannel>>,
        remaining: AtomicUsize,
    }

    impl ClientCallback for QueueingClient {
        fn on_input_buffer_available(&self, index: usize, buffer: Arc<ClientBuffer>) {
            let Some(channel) = self.channel.lock().upgrade() else {
                return;
            };
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            buffer.write(&[index as u8]).unwrap();
            channel.queue_input_buffer(&buffer).unwrap();
        }

        fn on_output_buffer_available(&self, _index: usize, _buffer: Arc<ClientBuffer>) {}
    }

    #[test]
    fn test_client_queues_from_input_callback() {
        let component = RecordingComponent::new(vec![]);
        let channel = BufferChannel::new(
            component.clone(),
            Arc::new(TestSession::default()),
            ChannelConfig::default(),
        );
        let client = Arc::new(QueueingClient {
            channel: Mutex::new(Arc::downgrade(&channel)),
            remaining: AtomicUsize::new(3),
        });
        channel.set_client(client.clone());
        channel.start(Some(Arc::new(video())), None, false).unwrap();
        let buffers = channel.prepare_initial_input_buffers().unwrap();
        channel.request_initial_input_buffers(buffers).unwrap();

        assert_eq!(component.frames(), vec![0, 1, 2]);
        assert_eq!(client.remaining.load(Ordering::SeqCst), 0);
        assert_eq!(channel.snapshot().frames_in_flight, 3);
    }

    #[test]
    fn test_info_buffer_goes_with_next_work() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        h.channel.set_info_buffer(InfoBuffer {
            index: 3,
            block: LinearBlock::detached(2).share(0, 2).unwrap(),
        });
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();
        h.queue(&[2], 1000, BufferFlags::empty()).unwrap();

        let works = component.queued.lock();
        assert_eq!(works[0].input.info_buffers.len(), 1);
        assert_eq!(works[0].input.info_buffers[0].index, 3);
        assert!(works[1].input.info_buffers.is_empty());
    }

    #[test]
    fn test_slot_exclusive_between_client_and_component() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);

        let buffer = h.input();
        buffer.write(&[7]).unwrap();
        h.channel.queue_input_buffer(&buffer).unwrap();

        assert_eq!(h.channel.queue_input_buffer(&buffer), Err(Status::NotFound));
        assert_eq!(h.channel.discard_buffer(&buffer), Err(Status::NotFound));
        let snapshot = h.channel.snapshot();
        assert_eq!(snapshot.active_input_slots, 4);
        assert_eq!(snapshot.client_input_buffers, 3);
        assert_eq!(snapshot.next_frame_index, 1);
        assert_eq!(component.frames(), vec![0]);
    }

    #[test]
    fn test_queue_after_stop_is_rejected() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        let buffer = h.input();
        buffer.write(&[1]).unwrap();

        h.channel.stop();

        assert_eq!(h.channel.queue_input_buffer(&buffer), Err(Status::NotSupported));
        assert_eq!(
            h.channel.set_parameters(vec![Param::Vendor { index: 1, value: 2 }]),
            Err(Status::NotSupported)
        );
        assert!(component.frames().is_empty());
        assert_eq!(h.channel.state(), ChannelState::Stopped);
    }

    #[test]
    fn test_stop_mid_stream_accounts_for_every_work() {
        let component = LoopbackComponent::new(
            "c2.loopback.decoder",
            LoopbackOptions {
                reorder_window: 2,
                ..Default::default()
            },
        );
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);

        for i in 0..5u8 {
            h.queue(&[i; 4], i64::from(i) * 1000, BufferFlags::empty())
                .unwrap();
        }
        h.channel.stop();
        assert_eq!(
            h.queue(&[9], 9000, BufferFlags::empty()),
            Err(Status::NotSupported)
        );

        // the worker handles commands in order, so every completion has
        // been processed once the flush returns
        let flushed = component.flush().unwrap();
        let health = h.channel.health();
        assert_eq!(flushed.len(), 2);
        assert_eq!(health.works_queued(), 5);
        assert_eq!(health.works_completed() + flushed.len() as u64, 5);

        h.channel.flush(flushed);
        assert_eq!(h.channel.snapshot().frames_in_flight, 0);
    }

    #[test]
    fn test_reorder_depth_restores_order() {
        let component = RecordingComponent::new(vec![Param::ReorderDepth(2)]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);

        for i in 0..3u8 {
            h.queue(&[i + 1], i64::from(i) * 1000, BufferFlags::empty())
                .unwrap();
        }
        h.queue(&[], 3000, BufferFlags::END_OF_STREAM).unwrap();

        for index in [2u64, 0, 1] {
            component.complete(index, Some(linear(&[index as u8])), vec![]);
        }
        component.complete(3, None, vec![]);

        let delivered: Vec<(Option<u64>, i64, bool)> = (0..4)
            .map(|_| {
                let meta = h.output().meta();
                (
                    meta.frame_index,
                    meta.time_us,
                    meta.flags.contains(BufferFlags::END_OF_STREAM),
                )
            })
            .collect();
        assert_eq!(
            delivered,
            vec![
                (Some(0), 0, false),
                (Some(1), 1000, false),
                (Some(2), 2000, false),
                (Some(3), 3000, true),
            ]
        );
    }

    #[test]
    fn test_secure_input_decrypted_before_queue() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        let crypto = Arc::new(XorCrypto::default());
        h.channel.set_crypto(Some(crypto.clone()));
        h.start(Some(video()), None, false);

        let buffer = h.input();
        let mut data = vec![3u8; 10];
        data.extend(vec![0x0f; 20]);
        buffer.write(&data).unwrap();
        let info = CryptoInfo {
            mode: CryptoMode::AesCtr,
            subsamples: vec![SubSample::new(10, 20)],
            ..Default::default()
        };
        h.channel
            .queue_secure_input_buffer(&buffer, false, &[info])
            .unwrap();

        let calls = crypto.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].offset, 0);
        assert_eq!(calls[0].subsamples, vec![SubSample::new(10, 20)]);
        assert!(!calls[0].secure);

        let works = component.queued.lock();
        let block = works[0].input.buffers[0].as_linear().unwrap();
        assert_eq!(block.size(), 30);
        assert_eq!(
            block.map().unwrap(),
            plain(&data, &[SubSample::new(10, 20)]).as_slice()
        );
    }

    #[test]
    fn test_decrypt_failure_is_returned() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        let crypto = Arc::new(XorCrypto::default());
        *crypto.fail_with.lock() = Some(-2004);
        h.channel.set_crypto(Some(crypto.clone()));
        h.start(Some(video()), None, false);

        let buffer = h.input();
        buffer.write(&[1; 8]).unwrap();
        let info = CryptoInfo {
            mode: CryptoMode::AesCtr,
            subsamples: vec![SubSample::new(0, 8)],
            ..Default::default()
        };
        assert_eq!(
            h.channel.queue_secure_input_buffer(&buffer, false, &[info]),
            Err(Status::Backend(-2004))
        );
        assert!(component.frames().is_empty());
        assert_eq!(h.channel.health().decrypt_failures(), 1);
        assert!(h.session.errors.lock().is_empty());
    }

    #[test]
    fn test_attach_encrypted_buffer_then_queue() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.channel.set_crypto(Some(Arc::new(XorCrypto::default())));
        h.start(Some(video()), None, false);

        let memory = SharedMemory::new(64);
        let data = [5u8; 12];
        memory.write(8, &data).unwrap();
        let info = CryptoInfo {
            mode: CryptoMode::AesCtr,
            subsamples: vec![SubSample::new(4, 8)],
            ..Default::default()
        };
        let buffer = h.input();
        h.channel
            .attach_encrypted_buffer(&memory, false, &info, 8, &buffer)
            .unwrap();
        h.channel.queue_input_buffer(&buffer).unwrap();

        let works = component.queued.lock();
        let block = works[0].input.buffers[0].as_linear().unwrap();
        assert_eq!(
            block.map().unwrap(),
            plain(&data, &[SubSample::new(4, 8)]).as_slice()
        );
    }

    #[test]
    fn test_flush_twice_and_requeue_codec_config() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);

        h.queue(&[0, 0, 1], 0, BufferFlags::CODEC_CONFIG).unwrap();
        h.queue(&[5], 1000, BufferFlags::empty()).unwrap();
        h.channel.stop();
        let flushed = std::mem::take(&mut *component.queued.lock());
        h.channel.flush(flushed);
        let first = h.channel.snapshot();
        h.channel.flush(Vec::new());
        assert_eq!(h.channel.snapshot(), first);
        assert_eq!(first.frames_in_flight, 0);
        assert_eq!(first.active_input_slots, 0);
        assert_eq!(first.next_frame_index, 3);

        h.start(Some(video()), None, false);
        let works = component.queued.lock();
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].frame_index(), 2);
        assert!(
            works[0]
                .input
                .flags
                .contains(FrameFlags::CODEC_CONFIG | FrameFlags::DROP_FRAME)
        );
        let block = works[0].input.buffers[0].as_linear().unwrap();
        assert_eq!(block.map().unwrap(), &[0, 0, 1]);
    }

    #[test]
    fn test_queue_failure_is_fatal_once() {
        let component = RecordingComponent::new(vec![]);
        component.fail_queue.store(true, Ordering::SeqCst);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);

        assert_eq!(h.queue(&[1], 0, BufferFlags::empty()), Err(Status::NoMemory));
        assert_eq!(
            h.queue(&[2], 1000, BufferFlags::empty()),
            Err(Status::InvalidOperation)
        );
        assert_eq!(
            *h.session.errors.lock(),
            vec![(Status::NoMemory, ErrorAction::Fatal)]
        );
        assert_eq!(h.channel.state(), ChannelState::Errored);
        assert_eq!(h.channel.snapshot().frames_in_flight, 0);

        h.channel.reset();
        assert_eq!(h.channel.state(), ChannelState::Stopped);
    }

    #[test]
    fn test_stale_input_buffer_rejected_after_reset() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        let stale = h.input();
        stale.write(&[1, 2]).unwrap();

        h.channel.reset();
        while h.inputs.try_recv().is_ok() {}
        h.start(Some(video()), None, false);

        assert_eq!(h.channel.queue_input_buffer(&stale), Err(Status::BadValue));
        assert_eq!(h.channel.discard_buffer(&stale), Err(Status::BadValue));
        assert!(component.frames().is_empty());

        let foreign = BasicBlockPool::new(PLATFORM_POOL_START, AllocatorId::Linear)
            .fetch_linear_block(4, MemoryUsage::CPU_READ_WRITE)
            .map(ClientBuffer::from_block)
            .unwrap();
        foreign.write(&[3]).unwrap();
        assert_eq!(h.channel.queue_input_buffer(&foreign), Err(Status::BadValue));

        h.queue(&[4], 0, BufferFlags::empty()).unwrap();
        assert_eq!(component.frames(), vec![0]);
        assert!(h.session.errors.lock().is_empty());
    }

    #[test]
    fn test_malformed_work_is_fatal() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();

        let mut work = component.take(0);
        work.worklets.clear();
        component.listener().on_work_done(vec![work]);

        assert_eq!(
            *h.session.errors.lock(),
            vec![(Status::Unknown, ErrorAction::Fatal)]
        );
        assert_eq!(h.channel.snapshot().frames_in_flight, 0);
    }

    #[test]
    fn test_work_error_maps_status() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();

        let mut work = component.take(0);
        work.result = WorkResult::Error(Status::BadValue.code());
        component.listener().on_work_done(vec![work]);

        assert_eq!(
            *h.session.errors.lock(),
            vec![(Status::BadValue, ErrorAction::Fatal)]
        );
    }

    #[test]
    fn test_completion_after_stop_is_not_delivered() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();

        h.channel.stop();
        component.complete(0, Some(linear(&[1])), vec![]);

        assert!(h.outputs.try_recv().is_err());
        assert_eq!(h.channel.snapshot().frames_in_flight, 0);
        assert_eq!(h.channel.health().works_completed(), 1);
    }

    #[test]
    fn test_eos_with_data_is_split() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);

        h.queue(&[9, 9], 500, BufferFlags::END_OF_STREAM).unwrap();
        // ignored once EOS was queued
        h.queue(&[1], 600, BufferFlags::empty()).unwrap();

        let works = component.queued.lock();
        assert_eq!(works.len(), 2);
        assert!(!works[0].input.flags.contains(FrameFlags::END_OF_STREAM));
        assert_eq!(works[0].input.buffers.len(), 1);
        assert!(works[1].input.flags.contains(FrameFlags::END_OF_STREAM));
        assert!(works[1].input.buffers.is_empty());
        assert_eq!(works[1].frame_index(), 1);
        assert_eq!(works[1].input.ordinal.timestamp, 500);
        assert_eq!(h.channel.snapshot().client_input_buffers, 2);
    }

    #[test]
    fn test_parameters_and_tunnel_flag_ride_on_next_work() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);

        h.channel
            .set_parameters(vec![Param::Vendor { index: 7, value: 1 }])
            .unwrap();
        let buffer = h.input();
        buffer.write(&[1]).unwrap();
        buffer.update_meta(|meta| meta.tunnel_first_frame = true);
        h.channel.queue_input_buffer(&buffer).unwrap();
        h.queue(&[2], 1000, BufferFlags::empty()).unwrap();

        let works = component.queued.lock();
        assert_eq!(
            works[0].input.config_update,
            vec![
                Param::Vendor { index: 7, value: 1 },
                Param::TunnelHoldRender(true)
            ]
        );
        assert!(works[1].input.config_update.is_empty());
    }

    #[test]
    fn test_init_data_delivered_ahead_of_output() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();

        let buffer = linear(&[4, 4]);
        buffer.set_info(BufferInfo::PictureType { sync: true });
        component.complete(
            0,
            Some(buffer),
            vec![Param::InitData(Bytes::from_static(&[0, 0, 1]))],
        );

        let csd = h.output();
        assert_eq!(csd.to_vec().unwrap(), vec![0, 0, 1]);
        assert_eq!(csd.meta().flags, BufferFlags::CODEC_CONFIG);
        let frame = h.output();
        assert_eq!(frame.to_vec().unwrap(), vec![4, 4]);
        assert!(frame.meta().flags.contains(BufferFlags::KEY_FRAME));
    }

    #[test]
    fn test_delay_updates_resize_slots() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();

        component.complete(
            0,
            Some(linear(&[1])),
            vec![
                Param::OutputDelay(3),
                Param::PipelineDelay(2),
                Param::ReorderDepth(1),
            ],
        );

        let snapshot = h.channel.snapshot();
        assert_eq!(snapshot.output_slots, 7);
        assert_eq!(snapshot.input_slots, 6);
        assert_eq!(snapshot.reorder_depth, 1);
        assert_eq!(snapshot.pipeline_capacity, 9);
        assert_eq!(snapshot.max_dequeue_count, 7 + 1 + 3);
    }

    #[test]
    fn test_array_output_reallocates() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        let input = MediaFormat {
            max_input_size: Some(64),
            ..MediaFormat::audio("audio/mp4a-latm", 48000, 2)
        };
        let output = MediaFormat {
            max_input_size: Some(2),
            ..MediaFormat::audio("audio/raw", 48000, 2)
        };
        h.start(Some(input), Some(output), true);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();

        component.complete(0, Some(linear(&[1, 2, 3, 4])), vec![]);

        let delivered = h.output();
        assert_eq!(delivered.to_vec().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(h.session.buffers_changed.load(Ordering::SeqCst), 1);
        let array = h.channel.get_output_buffer_array().unwrap();
        assert_eq!(array.len(), 4);
        assert!(array.iter().any(|buffer| Arc::ptr_eq(buffer, &delivered)));
    }

    #[test]
    fn test_realloc_exhaustion_is_fatal() {
        let component = RecordingComponent::new(vec![]);
        let config = ChannelConfig {
            max_realloc_tries: 2,
            ..ChannelConfig::default()
        };
        let h = harness(component.clone(), config);
        let input = MediaFormat {
            max_input_size: Some(64),
            ..MediaFormat::audio("audio/mp4a-latm", 48000, 2)
        };
        let output = MediaFormat::audio("audio/raw", 48000, 2);
        h.start(Some(input), Some(output), true);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();

        // protected output cannot be copied into the client's array buffers
        let pool = BasicBlockPool::new(PLATFORM_POOL_START, AllocatorId::SecureLinear);
        let block = pool.fetch_linear_block(4, MemoryUsage::PROTECTED).unwrap();
        let buffer = Arc::new(CodecBuffer::linear(block.share(0, 4).unwrap()));
        component.complete(0, Some(buffer), vec![]);

        assert_eq!(h.session.buffers_changed.load(Ordering::SeqCst), 2);
        assert_eq!(
            *h.session.errors.lock(),
            vec![(Status::Unknown, ErrorAction::Fatal)]
        );
        assert!(h.outputs.try_recv().is_err());
        assert_eq!(h.channel.state(), ChannelState::Errored);
    }

    #[test]
    fn test_render_graphic_output() {
        let component =
            RecordingComponent::new(vec![Param::OutputBufferKind(BufferKind::Graphic)]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), Some(video()), false);
        let surface = Arc::new(TestSurface::default());
        h.channel.set_surface(surface.clone(), 1).unwrap();
        assert_eq!(
            *component.surfaces.lock(),
            vec![(PLATFORM_POOL_START, 1, 4 + 3)]
        );
        assert_eq!(*surface.max_dequeue.lock(), vec![7]);

        h.queue(&[1], 33, BufferFlags::empty()).unwrap();
        let frame = GraphicBlock::detached(4, 4, PixelFormat::Rgba8888)
            .share(Rect::new(4, 2))
            .unwrap();
        let buffer = Arc::new(CodecBuffer::graphic(frame));
        buffer.set_info(BufferInfo::Rotation {
            degrees: 90,
            flip: false,
        });
        component.complete(0, Some(buffer), vec![]);

        let delivered = h.output();
        h.channel
            .render_output_buffer(&delivered, Some(7_000))
            .unwrap();
        let queued = surface.queued.lock().clone();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].timestamp_ns, 7_000);
        assert_eq!(queued[0].transform, Transform::ROT_90);
        assert_eq!(queued[0].crop, Rect::new(4, 2));
        assert_eq!(
            *h.session.rendered.lock(),
            vec![RenderedFrame {
                media_time_us: 33,
                render_time_ns: 42
            }]
        );
        assert_eq!(
            h.channel.render_output_buffer(&delivered, None),
            Err(Status::NotFound)
        );
    }

    #[test]
    fn test_render_linear_output_is_invalid() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();
        component.complete(0, Some(linear(&[8])), vec![]);

        let delivered = h.output();
        assert_eq!(
            h.channel.render_output_buffer(&delivered, None),
            Err(Status::InvalidOperation)
        );
        assert_eq!(h.channel.snapshot().active_output_slots, 0);
    }

    #[test]
    fn test_input_buffer_done_frees_slot() {
        // one output slot of headroom past the input slots
        let component = RecordingComponent::new(vec![Param::OutputDelay(1)]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();
        assert_eq!(h.channel.health().input_buffers_offered(), 4);

        // the component drops its reference before reporting the return
        component.queued.lock()[0].input.buffers.clear();
        component.listener().on_input_buffer_done(0, 0);

        assert_eq!(h.channel.health().input_buffers_offered(), 5);
        assert_eq!(h.channel.snapshot().frames_in_flight, 1);
    }

    #[test]
    fn test_early_input_release_stays_within_capacity() {
        let component = RecordingComponent::new(vec![Param::PipelineDelay(2)]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.start(Some(video()), None, false);
        for i in 0..6 {
            h.queue(&[i as u8], i * 1000, BufferFlags::empty()).unwrap();
        }
        assert_eq!(h.channel.snapshot().pipeline_capacity, 6);

        for frame_index in 1..6u64 {
            component.queued.lock()[frame_index as usize].input.buffers.clear();
            component.listener().on_input_buffer_done(frame_index, 0);
        }
        assert!(h.inputs.try_recv().is_err());

        component.complete(0, Some(linear(&[0])), vec![]);
        let mut queued = 0;
        while let Ok((_, buffer)) = h.inputs.try_recv() {
            buffer.write(&[9]).unwrap();
            h.channel.queue_input_buffer(&buffer).unwrap();
            queued += 1;
            let snapshot = h.channel.snapshot();
            assert!(snapshot.frames_in_flight <= snapshot.pipeline_capacity);
        }
        assert_eq!(queued, 1);
        assert_eq!(h.channel.health().input_buffers_offered(), 7);
        assert_eq!(h.channel.snapshot().frames_in_flight, 6);
    }

    #[test]
    fn test_keepalive_when_pipeline_paused() {
        let config = ChannelConfig {
            smoothness_factor: 1,
            paused_keepalive: true,
            pipeline_paused_timeout_ms: 20,
            ..ChannelConfig::default()
        };
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), config);
        h.start(Some(video()), None, false);
        h.queue(&[1], 0, BufferFlags::empty()).unwrap();

        std::thread::sleep(Duration::from_millis(40));
        h.channel.feed_input_buffer_if_available();
        h.channel.feed_input_buffer_if_available();

        let works = component.queued.lock();
        assert_eq!(works.len(), 2);
        assert_eq!(works[1].input.flags, FrameFlags::DROP_FRAME);
        assert!(works[1].input.buffers.is_empty());
        assert_eq!(h.channel.health().keepalives(), 1);
        assert_eq!(h.channel.snapshot().frames_in_flight, 1);
    }

    #[test]
    fn test_input_array_mode_is_stable() {
        let component = RecordingComponent::new(vec![]);
        let h = harness(component.clone(), ChannelConfig::default());
        h.channel
            .start(Some(Arc::new(video())), None, false)
            .unwrap();

        let array = h.channel.get_input_buffer_array().unwrap();
        assert_eq!(array.len(), 4);
        let again = h.channel.get_input_buffer_array().unwrap();
        assert!(Arc::ptr_eq(&array[0], &again[0]));

        let offered = h.channel.prepare_initial_input_buffers().unwrap();
        assert_eq!(offered.len(), 4);
        for (index, buffer) in &offered {
            assert!(Arc::ptr_eq(&array[*index], buffer));
        }
    }

    #[test]
    fn test_loopback_stream_in_order_within_capacity() {
        let component = LoopbackComponent::new(
            "c2.loopback.decoder",
            LoopbackOptions {
                reorder_window: 2,
                ..Default::default()
            },
        );
        let h = harness(component, ChannelConfig::default());
        h.start(Some(video()), None, false);

        let mut delivered = Vec::new();
        let drain = |delivered: &mut Vec<(u64, BufferFlags)>| {
            while let Ok((_, buffer)) = h.outputs.try_recv() {
                let meta = buffer.meta();
                delivered.push((meta.frame_index.unwrap(), meta.flags));
                h.channel.discard_buffer(&buffer).unwrap();
            }
        };
        let next_input = |delivered: &mut Vec<(u64, BufferFlags)>| {
            let deadline = Instant::now() + TIMEOUT;
            loop {
                drain(&mut *delivered);
                if let Ok((_, buffer)) = h.inputs.recv_timeout(Duration::from_millis(10)) {
                    return buffer;
                }
                assert!(Instant::now() < deadline, "no input buffer offered");
            }
        };

        for i in 0..13i64 {
            let buffer = next_input(&mut delivered);
            if i < 12 {
                buffer.write(&[i as u8; 8]).unwrap();
            }
            buffer.update_meta(|meta| {
                meta.time_us = i * 1000;
                meta.flags = if i == 12 {
                    BufferFlags::END_OF_STREAM
                } else {
                    BufferFlags::empty()
                };
            });
            h.channel.queue_input_buffer(&buffer).unwrap();
            let snapshot = h.channel.snapshot();
            assert!(snapshot.frames_in_flight <= snapshot.pipeline_capacity);
        }

        let deadline = Instant::now() + TIMEOUT;
        while !delivered
            .last()
            .is_some_and(|(_, flags)| flags.contains(BufferFlags::END_OF_STREAM))
        {
            assert!(Instant::now() < deadline, "EOS not delivered");
            drain(&mut delivered);
            std::thread::sleep(Duration::from_millis(1));
        }
        let order: Vec<u64> = delivered.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, (0..13).collect::<Vec<u64>>());
    }
}
