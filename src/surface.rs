//! Output surface handling.
//!
//! Rendering a decoded graphic buffer queues it to an [`OutputSurface`]. The
//! surface reports frame events back, which [`RenderTracker`] turns into
//! rendered-frame notifications. Buffer released/attached notifications from
//! the surface arrive on producer threads and are forwarded to the component
//! by [`SurfaceCallbackHandler`] on its own worker thread.

use crate::buffers::block::{CodecBuffer, Rect};
use crate::component::Component;
use crate::error::Result;
use crate::pipeline::types::HdrMetadata;
use bitflags::bitflags;
use log::{debug, trace};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

bitflags! {
    /// Buffer transform applied by the surface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Transform: u32 {
        const FLIP_H = 0x01;
        const FLIP_V = 0x02;
        const ROT_90 = 0x04;
        const ROT_180 = Self::FLIP_H.bits() | Self::FLIP_V.bits();
        const ROT_270 = Self::ROT_180.bits() | Self::ROT_90.bits();
    }
}

impl Transform {
    /// Transform for a clockwise rotation in degrees, optionally mirrored.
    pub fn from_rotation(degrees: i32, flip: bool) -> Self {
        let mut transform = match (degrees / 90).rem_euclid(4) {
            1 => Transform::ROT_90,
            2 => Transform::ROT_180,
            3 => Transform::ROT_270,
            _ => Transform::empty(),
        };
        if flip {
            transform ^= Transform::FLIP_H;
        }
        transform
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    Freeze,
    #[default]
    ScaleToWindow,
    ScaleCrop,
    NoScaleCrop,
}

/// Everything the surface needs to present one buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueBufferInput {
    pub timestamp_ns: i64,
    pub crop: Rect,
    pub scaling_mode: ScalingMode,
    pub transform: Transform,
    pub hdr: Option<HdrMetadata>,
    /// Damaged region; `None` means the whole buffer.
    pub damage: Option<Rect>,
}

/// Timing event of a frame previously queued to the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEvent {
    pub frame_number: u64,
    /// Present time, `None` while the frame is not on screen yet.
    pub present_time_ns: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueBufferOutput {
    pub frame_number: u64,
    pub events: Vec<FrameEvent>,
}

/// A frame that reached the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedFrame {
    pub media_time_us: i64,
    pub render_time_ns: i64,
}

/// Consumer of rendered output.
pub trait OutputSurface: Send + Sync {
    fn queue_buffer(
        &self,
        buffer: &Arc<CodecBuffer>,
        input: &QueueBufferInput,
    ) -> Result<QueueBufferOutput>;

    fn set_max_dequeued_buffer_count(&self, count: usize) -> Result<()>;
}

/// Frames queued to the surface and not yet reported as rendered.
#[derive(Debug, Default)]
pub struct RenderTracker {
    tracked: BTreeMap<u64, i64>,
}

impl RenderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, frame_number: u64, media_time_us: i64) {
        self.tracked.insert(frame_number, media_time_us);
    }

    /// Match `events` against tracked frames. Frames older than a rendered
    /// one that never got a present time were dropped by the surface and are
    /// forgotten.
    pub fn process(&mut self, events: &[FrameEvent]) -> Vec<RenderedFrame> {
        let mut rendered = Vec::new();
        for event in events {
            let Some(render_time_ns) = event.present_time_ns else {
                continue;
            };
            if let Some(media_time_us) = self.tracked.remove(&event.frame_number) {
                rendered.push(RenderedFrame {
                    media_time_us,
                    render_time_ns,
                });
            }
            let stale: Vec<u64> = self
                .tracked
                .range(..event.frame_number)
                .map(|(frame, _)| *frame)
                .collect();
            for frame in stale {
                trace!("RenderTracker: frame {} dropped", frame);
                self.tracked.remove(&frame);
            }
        }
        rendered
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
    }
}

/// Notification from the output surface's producer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    BufferReleased { generation: u32 },
    BufferAttached { generation: u32 },
}

/// Forwards surface notifications to the component on a dedicated thread,
/// so producer threads never take channel locks.
pub struct SurfaceCallbackHandler {
    tx: Option<mpsc::UnboundedSender<SurfaceEvent>>,
    quit: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SurfaceCallbackHandler {
    pub fn new(name: &str, component: Weak<dyn Component>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SurfaceEvent>();
        let quit = Arc::new(AtomicBool::new(false));
        let worker = {
            let quit = quit.clone();
            let name = name.to_string();
            thread::spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    if quit.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(component) = component.upgrade() else {
                        debug!("[{}] surface event {:?} after component release", name, event);
                        continue;
                    };
                    match event {
                        SurfaceEvent::BufferReleased { generation } => {
                            component.on_buffer_released_from_output_surface(generation)
                        }
                        SurfaceEvent::BufferAttached { generation } => {
                            component.on_buffer_attached_to_output_surface(generation)
                        }
                    }
                }
                trace!("[{}] surface callback worker exiting", name);
            })
        };
        Self {
            tx: Some(tx),
            quit,
            worker: Some(worker),
        }
    }

    pub fn post(&self, event: SurfaceEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

impl Drop for SurfaceCallbackHandler {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Release);
        self.tx.take();
        if let Some(worker) = self.worker.take()
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::pool::{AllocatorId, BlockPool, PoolId};
    use crate::component::WorkListener;
    use crate::error::Status;
    use crate::pipeline::types::{Param, ParamKey, Work};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct SurfaceRecorder {
        events: Mutex<Vec<SurfaceEvent>>,
        tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
    }

    impl Component for SurfaceRecorder {
        fn name(&self) -> &str {
            "c2.test.surface"
        }

        fn query(&self, _keys: &[ParamKey]) -> Result<Vec<Param>> {
            Ok(Vec::new())
        }

        fn config(&self, _params: &[Param]) -> Result<()> {
            Ok(())
        }

        fn queue(&self, _works: Vec<Work>) -> Result<()> {
            Ok(())
        }

        fn set_listener(&self, _listener: Weak<dyn WorkListener>) {}

        fn create_block_pool(&self, _allocator: AllocatorId) -> Result<Arc<dyn BlockPool>> {
            Err(Status::NotSupported)
        }

        fn destroy_block_pool(&self, _id: PoolId) -> Result<()> {
            Ok(())
        }

        fn on_buffer_released_from_output_surface(&self, generation: u32) {
            self.events
                .lock()
                .push(SurfaceEvent::BufferReleased { generation });
            if let Some(tx) = self.tx.lock().as_ref() {
                let _ = tx.send(());
            }
        }

        fn on_buffer_attached_to_output_surface(&self, generation: u32) {
            self.events
                .lock()
                .push(SurfaceEvent::BufferAttached { generation });
            if let Some(tx) = self.tx.lock().as_ref() {
                let _ = tx.send(());
            }
        }
    }

    #[test]
    fn test_transform_from_rotation() {
        assert_eq!(Transform::from_rotation(0, false), Transform::empty());
        assert_eq!(Transform::from_rotation(90, false), Transform::ROT_90);
        assert_eq!(Transform::from_rotation(180, false), Transform::ROT_180);
        assert_eq!(Transform::from_rotation(-90, false), Transform::ROT_270);
        assert_eq!(Transform::from_rotation(0, true), Transform::FLIP_H);
        assert_eq!(Transform::from_rotation(180, true), Transform::FLIP_V);
    }

    #[test]
    fn test_render_tracker() {
        let mut tracker = RenderTracker::new();
        tracker.track(1, 1000);
        tracker.track(2, 2000);
        tracker.track(3, 3000);

        let pending = tracker.process(&[FrameEvent {
            frame_number: 2,
            present_time_ns: None,
        }]);
        assert!(pending.is_empty());
        assert_eq!(tracker.len(), 3);

        let rendered = tracker.process(&[FrameEvent {
            frame_number: 2,
            present_time_ns: Some(77),
        }]);
        assert_eq!(
            rendered,
            vec![RenderedFrame {
                media_time_us: 2000,
                render_time_ns: 77
            }]
        );
        // frame 1 was skipped by the surface
        assert_eq!(tracker.len(), 1);
        tracker.clear();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_handler_forwards_in_order() {
        let recorder = Arc::new(SurfaceRecorder::default());
        let (tx, rx) = std::sync::mpsc::channel();
        *recorder.tx.lock() = Some(tx);
        let component: Arc<dyn Component> = recorder.clone();
        let handler = SurfaceCallbackHandler::new("test", Arc::downgrade(&component));

        handler.post(SurfaceEvent::BufferReleased { generation: 1 });
        handler.post(SurfaceEvent::BufferAttached { generation: 2 });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        drop(handler);

        assert_eq!(
            *recorder.events.lock(),
            vec![
                SurfaceEvent::BufferReleased { generation: 1 },
                SurfaceEvent::BufferAttached { generation: 2 },
            ]
        );
    }

    #[test]
    fn test_handler_holds_component_weakly() {
        let recorder = Arc::new(SurfaceRecorder::default());
        let component: Arc<dyn Component> = recorder.clone();
        let handler = SurfaceCallbackHandler::new("test", Arc::downgrade(&component));
        drop(component);
        drop(recorder);
        handler.post(SurfaceEvent::BufferReleased { generation: 1 });
        drop(handler);
    }
}
