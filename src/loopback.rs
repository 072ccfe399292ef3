//! Software pass-through component.
//!
//! Each queued work produces one output worklet carrying a copy of its
//! input. Work is processed on a worker thread; with a non-zero reorder
//! window, completions are released in groups whose newest frame comes
//! first, the way a decoder with B-frames returns output.

use crate::buffers::block::CodecBuffer;
use crate::buffers::pool::{
    AllocatorId, BasicBlockPool, BlockPool, MemoryUsage, PLATFORM_POOL_START, PoolId,
};
use crate::component::{Component, WorkListener};
use crate::error::{Result, Status};
use crate::pipeline::types::{BufferKind, FrameFlags, Param, ParamKey, Work, WorkResult};
use bytes::Bytes;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct LoopbackOptions {
    pub input_delay: usize,
    pub output_delay: usize,
    /// Frames held back and released out of order.
    pub reorder_window: usize,
    pub buffer_kind: BufferKind,
    /// Codec-specific data reported with the first output.
    pub csd: Option<Bytes>,
}

enum Command {
    Queue(Vec<Work>),
    Flush(std::sync::mpsc::Sender<Vec<Work>>),
}

type Listener = Arc<Mutex<Option<Weak<dyn WorkListener>>>>;

pub struct LoopbackComponent {
    name: String,
    options: LoopbackOptions,
    listener: Listener,
    output_pool: Arc<Mutex<Option<Arc<dyn BlockPool>>>>,
    next_pool_id: AtomicU64,
    tx: Option<mpsc::UnboundedSender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl LoopbackComponent {
    pub fn new(name: &str, options: LoopbackOptions) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(Mutex::new(None));
        let output_pool = Arc::new(Mutex::new(None));
        let worker = {
            let mut worker = Worker {
                name: name.to_string(),
                window: options.reorder_window,
                csd: options.csd.clone(),
                listener: listener.clone(),
                output_pool: output_pool.clone(),
                held: Vec::new(),
            };
            thread::spawn(move || worker.run(rx))
        };
        Arc::new(Self {
            name: name.to_string(),
            options,
            listener,
            output_pool,
            next_pool_id: AtomicU64::new(PLATFORM_POOL_START),
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.send(command).ok())
            .ok_or(Status::InvalidOperation)
    }
}

impl Component for LoopbackComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn query(&self, keys: &[ParamKey]) -> Result<Vec<Param>> {
        let options = &self.options;
        Ok(keys
            .iter()
            .filter_map(|key| match key {
                ParamKey::InputDelay => Some(Param::InputDelay(options.input_delay)),
                ParamKey::PipelineDelay => Some(Param::PipelineDelay(options.reorder_window)),
                ParamKey::OutputDelay => Some(Param::OutputDelay(options.output_delay)),
                ParamKey::ReorderDepth => Some(Param::ReorderDepth(options.reorder_window)),
                ParamKey::InputBufferKind => Some(Param::InputBufferKind(options.buffer_kind)),
                ParamKey::OutputBufferKind => Some(Param::OutputBufferKind(options.buffer_kind)),
                _ => None,
            })
            .collect())
    }

    fn config(&self, params: &[Param]) -> Result<()> {
        for param in params {
            trace!("[{}] config {:?}", self.name, param);
        }
        Ok(())
    }

    fn queue(&self, works: Vec<Work>) -> Result<()> {
        self.send(Command::Queue(works))
    }

    fn flush(&self) -> Result<Vec<Work>> {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.send(Command::Flush(reply_tx))?;
        reply_rx.recv().map_err(|_| Status::Unknown)
    }

    fn set_listener(&self, listener: Weak<dyn WorkListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn create_block_pool(&self, allocator: AllocatorId) -> Result<Arc<dyn BlockPool>> {
        let id = self.next_pool_id.fetch_add(1, Ordering::Relaxed);
        let pool: Arc<dyn BlockPool> = Arc::new(BasicBlockPool::new(id, allocator));
        debug!("[{}] created block pool {} ({})", self.name, id, allocator);
        *self.output_pool.lock() = Some(pool.clone());
        Ok(pool)
    }

    fn destroy_block_pool(&self, id: PoolId) -> Result<()> {
        let mut pool = self.output_pool.lock();
        match pool.as_ref() {
            Some(current) if current.local_id() == id => {
                pool.take();
                Ok(())
            }
            _ => Err(Status::NotFound),
        }
    }
}

impl Drop for LoopbackComponent {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take()
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
    }
}

struct Worker {
    name: String,
    window: usize,
    csd: Option<Bytes>,
    listener: Listener,
    output_pool: Arc<Mutex<Option<Arc<dyn BlockPool>>>>,
    held: Vec<Work>,
}

impl Worker {
    fn run(&mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Queue(works) => {
                    for work in works {
                        self.process(work);
                    }
                }
                Command::Flush(reply) => {
                    let mut flushed: Vec<Work> = self.held.drain(..).collect();
                    for work in flushed.iter_mut() {
                        work.result = WorkResult::NotFound;
                        work.worklets.iter_mut().for_each(|w| w.output = Default::default());
                    }
                    debug!("[{}] flushed {} works", self.name, flushed.len());
                    let _ = reply.send(flushed);
                }
            }
        }
        trace!("[{}] worker exiting", self.name);
    }

    fn listener(&self) -> Option<Arc<dyn WorkListener>> {
        self.listener.lock().as_ref().and_then(Weak::upgrade)
    }

    fn process(&mut self, mut work: Work) {
        let flags = work.input.flags;
        let output = match self.produce(&work) {
            Ok(output) => output,
            Err(err) => {
                warn!("[{}] #{} failed: {}", self.name, work.frame_index(), err);
                work.result = WorkResult::Error(err.code());
                self.emit(vec![work]);
                return;
            }
        };

        if work.worklets.is_empty() {
            work.result = WorkResult::Error(Status::BadValue.code());
            self.emit(vec![work]);
            return;
        }
        let worklet = &mut work.worklets[0];
        worklet.output.ordinal = work.input.ordinal;
        worklet.output.flags = flags & (FrameFlags::END_OF_STREAM | FrameFlags::CODEC_CONFIG);
        if flags.contains(FrameFlags::DROP_FRAME) {
            worklet.output.flags |= FrameFlags::DROP_FRAME;
        } else if let Some(buffer) = output {
            worklet.output.buffers.push(buffer);
            if let Some(csd) = self.csd.take() {
                worklet.output.config_update.push(Param::InitData(csd));
            }
        }

        // The component keeps codec config data, other input is done.
        if !flags.contains(FrameFlags::CODEC_CONFIG) {
            let count = work.input.buffers.len();
            work.input.buffers.clear();
            if let Some(listener) = self.listener() {
                for index in 0..count {
                    listener.on_input_buffer_done(work.frame_index(), index);
                }
            }
        }

        if flags.contains(FrameFlags::END_OF_STREAM) {
            let mut ready: Vec<Work> = self.held.drain(..).collect();
            ready.push(work);
            self.emit(ready);
            return;
        }
        self.held.push(work);
        if self.held.len() > self.window {
            let mut ready: Vec<Work> = self.held.drain(..).collect();
            if let Some(newest) = ready.pop() {
                ready.insert(0, newest);
            }
            self.emit(ready);
        }
    }

    fn produce(&self, work: &Work) -> Result<Option<Arc<CodecBuffer>>> {
        let Some(input) = work.input.buffers.first() else {
            return Ok(None);
        };
        let Some(block) = input.as_linear() else {
            return Ok(Some(input.clone()));
        };
        let data = block.map()?;
        let pool = self.output_pool.lock().clone();
        let mut output = match pool {
            Some(pool) => {
                pool.fetch_linear_block(data.len().max(1), MemoryUsage::CPU_READ_WRITE)?
            }
            None => crate::buffers::block::LinearBlock::detached(data.len().max(1)),
        };
        output.map()?[..data.len()].copy_from_slice(data);
        let buffer = CodecBuffer::linear(output.share(0, data.len())?);
        if let Some(units) = input.access_units() {
            buffer.set_info(crate::buffers::block::BufferInfo::AccessUnits(units));
        }
        buffer.set_info(crate::buffers::block::BufferInfo::PictureType {
            sync: work.input.flags.is_empty(),
        });
        Ok(Some(Arc::new(buffer)))
    }

    fn emit(&self, works: Vec<Work>) {
        if works.is_empty() {
            return;
        }
        match self.listener() {
            Some(listener) => listener.on_work_done(works),
            None => debug!("[{}] dropping {} works without listener", self.name, works.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::block::LinearBlock;
    use crate::pipeline::types::Ordinal;
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::time::Duration;

    struct Collector {
        done: Mutex<Sender<u64>>,
        input_done: Mutex<Vec<u64>>,
    }

    impl WorkListener for Collector {
        fn on_work_done(&self, works: Vec<Work>) {
            for work in works {
                let _ = self.done.lock().send(work.frame_index());
            }
        }

        fn on_input_buffer_done(&self, frame_index: u64, _array_index: usize) {
            self.input_done.lock().push(frame_index);
        }
    }

    fn setup(options: LoopbackOptions) -> (Arc<LoopbackComponent>, Arc<Collector>, Receiver<u64>) {
        let component = LoopbackComponent::new("loopback", options);
        let (tx, rx) = channel();
        let collector = Arc::new(Collector {
            done: Mutex::new(tx),
            input_done: Mutex::new(Vec::new()),
        });
        let listener: Arc<dyn WorkListener> = collector.clone();
        component.set_listener(Arc::downgrade(&listener));
        (component, collector, rx)
    }

    fn work(frame_index: u64, flags: FrameFlags) -> Work {
        let mut work = Work::new(
            Ordinal {
                timestamp: frame_index as i64,
                frame_index,
                custom_ordinal: frame_index as i64,
            },
            flags,
        );
        let mut block = LinearBlock::detached(2);
        block.map().unwrap().copy_from_slice(&[1, 2]);
        work.input
            .buffers
            .push(Arc::new(CodecBuffer::linear(block.share(0, 2).unwrap())));
        work
    }

    fn collect(rx: &Receiver<u64>, n: usize) -> Vec<u64> {
        (0..n)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect()
    }

    #[test]
    fn test_in_order_without_window() {
        let (component, collector, rx) = setup(LoopbackOptions::default());
        component
            .queue((0..3).map(|i| work(i, FrameFlags::empty())).collect())
            .unwrap();
        assert_eq!(collect(&rx, 3), vec![0, 1, 2]);
        assert_eq!(*collector.input_done.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reorder_window() {
        let (component, _collector, rx) = setup(LoopbackOptions {
            reorder_window: 2,
            ..Default::default()
        });
        component
            .queue((0..3).map(|i| work(i, FrameFlags::empty())).collect())
            .unwrap();
        assert_eq!(collect(&rx, 3), vec![2, 0, 1]);

        component.queue(vec![work(3, FrameFlags::empty())]).unwrap();
        component.queue(vec![work(4, FrameFlags::END_OF_STREAM)]).unwrap();
        assert_eq!(collect(&rx, 2), vec![3, 4]);
    }

    #[test]
    fn test_flush_returns_held_work() {
        let (component, _collector, rx) = setup(LoopbackOptions {
            reorder_window: 4,
            ..Default::default()
        });
        component
            .queue((0..2).map(|i| work(i, FrameFlags::empty())).collect())
            .unwrap();
        let flushed = component.flush().unwrap();
        assert_eq!(flushed.len(), 2);
        assert!(flushed.iter().all(|w| w.result == WorkResult::NotFound));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_query_reports_delays() {
        let component = LoopbackComponent::new(
            "loopback",
            LoopbackOptions {
                input_delay: 1,
                reorder_window: 2,
                ..Default::default()
            },
        );
        let params = component
            .query(&[ParamKey::InputDelay, ParamKey::PipelineDelay, ParamKey::OutputPoolId])
            .unwrap();
        assert_eq!(params, vec![Param::InputDelay(1), Param::PipelineDelay(2)]);
    }

    #[test]
    fn test_output_pool_lifecycle() {
        let component = LoopbackComponent::new("loopback", LoopbackOptions::default());
        let pool = component.create_block_pool(AllocatorId::Linear).unwrap();
        assert_eq!(pool.local_id(), PLATFORM_POOL_START);
        assert!(component.destroy_block_pool(pool.local_id()).is_ok());
        assert_eq!(
            component.destroy_block_pool(pool.local_id()),
            Err(Status::NotFound)
        );
    }
}
