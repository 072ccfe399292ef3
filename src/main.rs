use anyhow::{Context, bail};
use bytes::Bytes;
use clap::{Arg, ArgAction, Command, value_parser};
use codec_channel::buffers::ClientBuffer;
use codec_channel::config::{app_name, version};
use codec_channel::pipeline::{HealthAlert, HealthMonitor};
use codec_channel::{
    BufferChannel, BufferFlags, ChannelConfig, ClientCallback, Component, ErrorAction,
    LoopbackComponent, LoopbackOptions, MediaFormat, SessionCallback, Status,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

const FRAME_DURATION_US: i64 = 33_333;
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

enum Event {
    Input(usize, Arc<ClientBuffer>),
    Output(usize, Arc<ClientBuffer>),
    Error(Status, ErrorAction),
}

/// Forwards channel callbacks to the driver loop.
struct Driver {
    tx: Mutex<Sender<Event>>,
}

impl ClientCallback for Driver {
    fn on_input_buffer_available(&self, index: usize, buffer: Arc<ClientBuffer>) {
        let _ = self.tx.lock().send(Event::Input(index, buffer));
    }

    fn on_output_buffer_available(&self, index: usize, buffer: Arc<ClientBuffer>) {
        let _ = self.tx.lock().send(Event::Output(index, buffer));
    }
}

impl SessionCallback for Driver {
    fn on_error(&self, status: Status, action: ErrorAction) {
        let _ = self.tx.lock().send(Event::Error(status, action));
    }

    fn on_output_buffers_changed(&self) {
        debug!("output buffers changed");
    }
}

struct SessionOptions {
    frames: usize,
    frame_size: usize,
}

#[derive(Debug, Default)]
struct SessionStats {
    queued: usize,
    delivered: usize,
    codec_config: usize,
    out_of_order: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Channel configuration (JSON).")
                .required(false),
        )
        .arg(
            Arg::new("frames")
                .short('n')
                .long("frames")
                .value_name("COUNT")
                .help("Number of frames to push through the channel.")
                .value_parser(value_parser!(usize))
                .default_value("120"),
        )
        .arg(
            Arg::new("frame-size")
                .long("frame-size")
                .value_name("BYTES")
                .help("Payload size of each input frame.")
                .value_parser(value_parser!(usize))
                .default_value("4096"),
        )
        .arg(
            Arg::new("reorder-window")
                .short('r')
                .long("reorder-window")
                .value_name("FRAMES")
                .help("Frames the loopback component releases out of order.")
                .value_parser(value_parser!(usize))
                .default_value("2"),
        )
        .arg(
            Arg::new("csd")
                .long("csd")
                .help("Have the component report codec-specific data.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => ChannelConfig::from_json_file(path)?,
        None => ChannelConfig::default(),
    };
    let frames = *matches.get_one::<usize>("frames").unwrap_or(&120);
    let frame_size = *matches.get_one::<usize>("frame-size").unwrap_or(&4096);
    let reorder_window = *matches.get_one::<usize>("reorder-window").unwrap_or(&2);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .context("setting Ctrl-C handler")?;
    }

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;

    let component = LoopbackComponent::new(
        "c2.loopback.decoder",
        LoopbackOptions {
            reorder_window,
            csd: matches
                .get_flag("csd")
                .then(|| Bytes::from_static(&[0x00, 0x00, 0x01, 0x67])),
            ..Default::default()
        },
    );
    let (tx, rx) = mpsc::channel();
    let driver = Arc::new(Driver { tx: Mutex::new(tx) });
    let channel = BufferChannel::new(component.clone(), driver.clone(), config);
    channel.set_client(driver);

    let (alert_tx, mut alert_rx) = tokio::sync::mpsc::channel::<HealthAlert>(16);
    let monitor = HealthMonitor::new(channel.health(), alert_tx)
        .with_check_interval(Duration::from_secs(1))
        .with_stall_threshold(STALL_TIMEOUT);
    runtime.spawn(async move { monitor.run().await });
    runtime.spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            warn!("health: {}", alert);
        }
    });

    let format = Arc::new(MediaFormat {
        max_input_size: Some(frame_size),
        ..MediaFormat::video("video/x-loopback", 1280, 720)
    });
    channel.start(Some(format.clone()), Some(format), false)?;
    let initial = channel.prepare_initial_input_buffers()?;
    channel.request_initial_input_buffers(initial)?;

    let options = SessionOptions { frames, frame_size };
    let result = drive(&channel, &rx, &options, &interrupted);

    channel.stop();
    let flushed = component.flush().unwrap_or_else(|err| {
        warn!("component flush failed: {}", err);
        Vec::new()
    });
    channel.flush(flushed);
    info!("{}", channel.health().summary());
    channel.release();
    runtime.shutdown_background();

    let stats = result?;
    info!(
        "{} frames queued, {} delivered ({} codec config, {} out of order)",
        stats.queued, stats.delivered, stats.codec_config, stats.out_of_order
    );
    if stats.out_of_order > 0 {
        bail!("{} frames delivered out of order", stats.out_of_order);
    }
    Ok(())
}

/// Feed `options.frames` frames and an end-of-stream, and drain output until
/// the end-of-stream comes back.
fn drive(
    channel: &BufferChannel,
    rx: &Receiver<Event>,
    options: &SessionOptions,
    interrupted: &AtomicBool,
) -> anyhow::Result<SessionStats> {
    let mut stats = SessionStats::default();
    let mut eos_queued = false;
    let mut last_frame: Option<u64> = None;

    loop {
        if interrupted.load(Ordering::SeqCst) {
            info!("interrupted after {} frames", stats.queued);
            return Ok(stats);
        }
        let event = match rx.recv_timeout(STALL_TIMEOUT) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                bail!("no progress for {:?}: {:?}", STALL_TIMEOUT, channel.snapshot())
            }
            Err(RecvTimeoutError::Disconnected) => bail!("channel callbacks disconnected"),
        };

        match event {
            Event::Input(index, buffer) => {
                if eos_queued {
                    channel.discard_buffer(&buffer)?;
                    continue;
                }
                let time_us = stats.queued as i64 * FRAME_DURATION_US;
                if stats.queued < options.frames {
                    let size = options.frame_size.min(buffer.capacity());
                    let payload: Vec<u8> = (0..size).map(|i| (i + stats.queued) as u8).collect();
                    buffer.write(&payload)?;
                    buffer.update_meta(|meta| {
                        meta.time_us = time_us;
                        meta.flags = BufferFlags::empty();
                    });
                    stats.queued += 1;
                } else {
                    buffer.update_meta(|meta| {
                        meta.time_us = time_us;
                        meta.flags = BufferFlags::END_OF_STREAM;
                    });
                    eos_queued = true;
                }
                debug!("queueing input #{} (ts={})", index, time_us);
                channel.queue_input_buffer(&buffer)?;
            }
            Event::Output(index, buffer) => {
                let meta = buffer.meta();
                if meta.flags.contains(BufferFlags::CODEC_CONFIG) {
                    stats.codec_config += 1;
                } else if let Some(frame) = meta.frame_index {
                    if last_frame.is_some_and(|last| frame <= last) {
                        warn!("output #{} (frame {}) out of order", index, frame);
                        stats.out_of_order += 1;
                    }
                    last_frame = Some(frame);
                    if buffer.size() > 0 {
                        stats.delivered += 1;
                    }
                }
                channel.discard_buffer(&buffer)?;
                if meta.flags.contains(BufferFlags::END_OF_STREAM) {
                    info!("end of stream after {} frames", stats.delivered);
                    return Ok(stats);
                }
            }
            Event::Error(status, action) => {
                error!("channel error: {} ({})", status, action);
                bail!("channel reported {} error {}", action, status);
            }
        }
    }
}
