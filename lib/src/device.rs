//! The capture device: stream lifecycle and buffer pipeline.
//!
//! A `Device` is created from a `DeviceConfig` and the `DevicePorts` it talks
//! to. It then goes through the following states:
//!
//! ```text
//!   closed --open()--> idle --stream_on(ch)--> generating
//!     ^                 |  <--stream_off(ch)--
//!     +----close()------+
//! ```
//!
//! Buffers are admitted with `queue_buffer` and come back either through the
//! `BufferSink` (`DoneMode::Callback`) or through `dequeue_done`
//! (`DoneMode::Pickup`). While generating, `handle_interrupt` must be called
//! for every interrupt raised by the capture hardware.
//!
//! Three locks are involved. The pipeline lock protects the frame queues and
//! the statistics pool and is only ever held for short, non-blocking
//! sections, including from `handle_interrupt`. The 3A lock protects the 3A
//! state and is only taken by the deferred tasks. The stream lock serializes
//! open, close, stream on and stream off.
mod buffer;
mod frame_queue;
mod isr;
mod stat_pool;
mod state;
mod worker;

pub use buffer::{BufferSink, CompletedBuffer, DoneNotifier, VideoBuffer};
pub use frame_queue::{FrameQueue, MIN_QUEUED_BUFFERS};
pub use isr::{IrqOutcome, StatsOutcome};
pub use stat_pool::{LockedStat, RotateError, StatBuffer, StatBufferState, StatCounts, StatPool};
pub use state::{Status, StreamState};

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::hw::{CsiEngine, CsiIrq, IspEngine, IspIrq};
use crate::isp::{
    Algorithm3a, BoxedAlgorithm, CtrlParams, Isp3a, Isp3aResult, IspTables, LensActuator,
    SensorControl, StatLayout,
};
use crate::memory::{AllocError, DmaAddr, DmaAllocator, DmaArena, HeapAllocator};
use crate::{BufferStatus, CaptureMode, MAX_CHANNELS};
use buffer::FrameClock;
use worker::{Job, JobHandler, StatJob, Worker};

/// Where completed buffers go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DoneMode {
    /// Completed buffers are passed to the `BufferSink` right away.
    #[default]
    Callback,
    /// Completed buffers are kept in a per-channel list until picked up with
    /// `Device::dequeue_done`.
    Pickup,
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    num_channels: usize,
    stat_buffers: usize,
    isp_used: bool,
    bayer_raw: bool,
    multi_channel_output: bool,
    done_mode: DoneMode,
    stat_layout: StatLayout,
    combined_exposure: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            num_channels: 1,
            stat_buffers: 5,
            isp_used: false,
            bayer_raw: false,
            multi_channel_output: false,
            done_mode: DoneMode::Callback,
            stat_layout: Default::default(),
            combined_exposure: false,
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn num_channels(self, num_channels: usize) -> Self {
        Self {
            num_channels,
            ..self
        }
    }

    /// Number of statistics buffers to allocate when statistics are enabled.
    pub fn stat_buffers(self, stat_buffers: usize) -> Self {
        Self {
            stat_buffers,
            ..self
        }
    }

    /// Frames go through the ISP.
    pub fn isp(self, isp_used: bool) -> Self {
        Self { isp_used, ..self }
    }

    /// The sensor outputs raw Bayer data. Together with `isp`, this enables
    /// statistics and 3A processing.
    pub fn bayer_raw(self, bayer_raw: bool) -> Self {
        Self { bayer_raw, ..self }
    }

    /// Pick the channel to service from the frame-done status of all
    /// channels, instead of using the last channel streamed on.
    pub fn multi_channel_output(self, multi_channel_output: bool) -> Self {
        Self {
            multi_channel_output,
            ..self
        }
    }

    pub fn done_mode(self, done_mode: DoneMode) -> Self {
        Self { done_mode, ..self }
    }

    pub fn stat_layout(self, stat_layout: StatLayout) -> Self {
        Self {
            stat_layout,
            ..self
        }
    }

    /// Push exposure and gain to the sensor as one command.
    pub fn combined_exposure(self, combined_exposure: bool) -> Self {
        Self {
            combined_exposure,
            ..self
        }
    }

    pub fn stats_enabled(&self) -> bool {
        self.isp_used && self.bayer_raw
    }

    pub fn channels(&self) -> usize {
        self.num_channels
    }
}

/// Sensor, lens and algorithm driven by the 3A tasks.
pub struct Isp3aPorts {
    sensor: Arc<dyn SensorControl>,
    actuator: Option<Arc<dyn LensActuator>>,
    algorithm: BoxedAlgorithm,
}

impl Isp3aPorts {
    pub fn new<A: Algorithm3a>(sensor: Arc<dyn SensorControl>, algorithm: A) -> Self {
        Self {
            sensor,
            actuator: None,
            algorithm: Box::new(algorithm),
        }
    }

    pub fn with_actuator(self, actuator: Arc<dyn LensActuator>) -> Self {
        Self {
            actuator: Some(actuator),
            ..self
        }
    }
}

/// Everything a device talks to.
pub struct DevicePorts {
    pub csi: Arc<dyn CsiEngine>,
    pub isp: Option<Arc<dyn IspEngine>>,
    pub sink: Arc<dyn BufferSink>,
    pub allocator: Arc<dyn DmaAllocator>,
    pub isp3a: Option<Isp3aPorts>,
}

impl DevicePorts {
    pub fn new(csi: Arc<dyn CsiEngine>, sink: Arc<dyn BufferSink>) -> Self {
        Self {
            csi,
            isp: None,
            sink,
            allocator: Arc::new(HeapAllocator::default()),
            isp3a: None,
        }
    }

    pub fn with_isp(self, isp: Arc<dyn IspEngine>) -> Self {
        Self {
            isp: Some(isp),
            ..self
        }
    }

    pub fn with_isp3a(self, isp3a: Isp3aPorts) -> Self {
        Self {
            isp3a: Some(isp3a),
            ..self
        }
    }

    pub fn with_allocator(self, allocator: Arc<dyn DmaAllocator>) -> Self {
        Self { allocator, ..self }
    }
}

#[derive(Debug, Error)]
pub enum DeviceCreateError {
    #[error("invalid number of channels: {0}")]
    InvalidChannelCount(usize),
    #[error("statistics are enabled but no statistics buffer is requested")]
    NoStatBuffers,
    #[error("invalid statistics layout")]
    InvalidStatLayout,
    #[error("ISP is used but no ISP engine is provided")]
    MissingIsp,
    #[error("statistics are enabled but no 3A ports are provided")]
    MissingIsp3a,
    #[error("cannot spawn worker thread: {0}")]
    Worker(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("device is already opened")]
    Busy,
    #[error("cannot allocate ISP memory: {0}")]
    Alloc(#[from] AllocError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CloseError {
    #[error("device is not opened")]
    NotOpen,
    #[error("device is still generating frames")]
    StillGenerating,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamOnError {
    #[error("device is not opened")]
    NotOpen,
    #[error("invalid channel {0}")]
    InvalidChannel(usize),
    #[error("no buffer queued on channel {0}")]
    NoBuffers(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamOffError {
    #[error("device is not opened")]
    NotOpen,
    #[error("invalid channel {0}")]
    InvalidChannel(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueBufferError {
    #[error("device is not opened")]
    NotOpen,
    #[error("invalid channel {0}")]
    InvalidChannel(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DequeueError {
    #[error("device is not opened")]
    NotOpen,
    #[error("invalid channel {0}")]
    InvalidChannel(usize),
    #[error("device does not keep completed buffers for pickup")]
    NotPickupMode,
    #[error("no completed buffer")]
    NotReady,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureModeError {
    #[error("cannot change capture mode while generating")]
    Generating,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferCountError {
    #[error("frame size is zero")]
    ZeroFrameSize,
    #[error("frame of {0} bytes does not fit in frame memory")]
    FrameTooLarge(usize),
}

/// Memory all buffers of a channel may use together.
pub const MAX_FRAME_MEMORY: usize = 150 * 1024 * 1024;

/// Number of buffers to allocate when none is requested.
pub const DEFAULT_BUFFER_COUNT: u32 = 8;

/// Adjust the number of buffers requested for a stream of `frame_size`-byte
/// frames.
///
/// The count is reduced until all buffers fit in `MAX_FRAME_MEMORY`. If no
/// reduction was needed, single image capture gets exactly one buffer and
/// continuous modes get at least three.
pub fn negotiate_buffer_count(
    requested: u32,
    frame_size: usize,
    mode: CaptureMode,
) -> Result<u32, BufferCountError> {
    if frame_size == 0 {
        return Err(BufferCountError::ZeroFrameSize);
    }
    if frame_size > MAX_FRAME_MEMORY {
        error!("One buffer is larger than the frame memory");
        return Err(BufferCountError::FrameTooLarge(frame_size));
    }

    let count = if requested == 0 {
        DEFAULT_BUFFER_COUNT
    } else {
        requested
    };
    let max = (MAX_FRAME_MEMORY / frame_size) as u32;
    if count > max {
        warn!("Buffer count reduced from {} to {}", count, max);
        return Ok(max);
    }

    let count = match mode {
        CaptureMode::SingleImage if count != 1 => {
            warn!("Buffer count set to 1 in image capture mode");
            1
        }
        CaptureMode::ContinuousVideo | CaptureMode::Preview if count < MIN_QUEUED_BUFFERS as u32 => {
            warn!(
                "Buffer count set to {} in video capture mode",
                MIN_QUEUED_BUFFERS
            );
            MIN_QUEUED_BUFFERS as u32
        }
        _ => count,
    };
    debug!("Negotiated {} buffers of {} bytes", count, frame_size);

    Ok(count)
}

#[derive(Default)]
struct ChannelQueue {
    frames: FrameQueue,
    /// Interrupts seen since the channel started or was last starved.
    first_seen: u8,
    sequence: u32,
}

struct Statistics {
    pool: StatPool,
    arena: Arc<DmaArena>,
}

/// Everything protected by the pipeline lock.
struct Pipeline {
    channels: Vec<ChannelQueue>,
    stats: Option<Statistics>,
    mode: CaptureMode,
    clock: FrameClock,
}

type Notifier = Arc<dyn Fn(usize) + Send + Sync>;

/// State shared between the device, its deferred workers and the interrupt
/// path.
pub(crate) struct DeviceCore {
    config: DeviceConfig,
    csi: Arc<dyn CsiEngine>,
    isp: Option<Arc<dyn IspEngine>>,
    sink: Arc<dyn BufferSink>,
    allocator: Arc<dyn DmaAllocator>,
    state: StreamState,
    current_channel: AtomicUsize,
    pipeline: Mutex<Pipeline>,
    isp3a: Option<Mutex<Isp3a>>,
    tables: Mutex<Option<IspTables>>,
    notifier: Mutex<Option<Notifier>>,
}

impl DeviceCore {
    fn set_output_addr(&self, channel: usize, addr: DmaAddr) {
        match &self.isp {
            Some(isp) => isp.set_output_addr(channel, addr),
            None => self.csi.set_output_addr(channel, addr),
        }
    }

    fn notify(&self, channel: usize) {
        let notifier = self.notifier.lock().unwrap().clone();
        if let Some(notifier) = notifier {
            notifier(channel);
        }
    }

    fn release_stat(&self, slot: usize) {
        let mut pipeline = self.pipeline.lock().unwrap();
        if let Some(stats) = pipeline.stats.as_mut() {
            stats.pool.release(slot);
        }
    }
}

impl JobHandler for DeviceCore {
    fn run_job(&self, job: Job) {
        let Some(isp3a) = &self.isp3a else {
            return;
        };

        match job {
            Job::Statistics(stat) => {
                {
                    let mut isp3a = isp3a.lock().unwrap();
                    let layout = self.config.stat_layout;
                    let parsed = stat.arena.read(stat.slot, |bytes| match layout.split(bytes) {
                        Some(sections) => {
                            isp3a.process_statistics(&sections, stat.frame_number);
                            true
                        }
                        None => false,
                    });
                    if parsed != Some(true) {
                        error!("Cannot parse statistics buffer {}", stat.slot);
                    }
                }
                self.release_stat(stat.slot);
            }
            Job::SensorUpdate => isp3a.lock().unwrap().update_sensor_exposure(),
        }
    }
}

pub struct Device {
    core: Arc<DeviceCore>,
    stat_worker: Option<Worker>,
    sensor_worker: Option<Worker>,
    stream_lock: Mutex<()>,
    /// Held for reading by interrupts until their deferred work is scheduled.
    irq_gate: RwLock<()>,
}

impl Device {
    pub fn new(config: DeviceConfig, ports: DevicePorts) -> Result<Self, DeviceCreateError> {
        if config.num_channels == 0 || config.num_channels > MAX_CHANNELS {
            return Err(DeviceCreateError::InvalidChannelCount(config.num_channels));
        }
        if config.isp_used && ports.isp.is_none() {
            return Err(DeviceCreateError::MissingIsp);
        }

        let stats_enabled = config.stats_enabled();
        if stats_enabled {
            if config.stat_buffers == 0 {
                return Err(DeviceCreateError::NoStatBuffers);
            }
            if !config.stat_layout.is_valid() {
                return Err(DeviceCreateError::InvalidStatLayout);
            }
        }

        let isp3a = match ports.isp3a {
            Some(p) if stats_enabled => Some(Mutex::new(Isp3a::new(
                p.algorithm,
                p.sensor,
                p.actuator,
                config.combined_exposure,
            ))),
            Some(_) => {
                debug!("Statistics are disabled, ignoring 3A ports");
                None
            }
            None if stats_enabled => return Err(DeviceCreateError::MissingIsp3a),
            None => None,
        };

        let pipeline = Pipeline {
            channels: (0..config.num_channels)
                .map(|_| ChannelQueue::default())
                .collect(),
            stats: None,
            mode: Default::default(),
            clock: Default::default(),
        };

        let core = Arc::new(DeviceCore {
            config,
            csi: ports.csi,
            isp: ports.isp,
            sink: ports.sink,
            allocator: ports.allocator,
            state: StreamState::new(),
            current_channel: AtomicUsize::new(0),
            pipeline: Mutex::new(pipeline),
            isp3a,
            tables: Mutex::new(None),
            notifier: Mutex::new(None),
        });

        let (stat_worker, sensor_worker) = if stats_enabled {
            (
                Some(Worker::new("vfer-3a", Arc::clone(&core))?),
                Some(Worker::new("vfer-sensor", Arc::clone(&core))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            core,
            stat_worker,
            sensor_worker,
            stream_lock: Mutex::new(()),
            irq_gate: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.core.config
    }

    fn check_channel(&self, channel: usize) -> bool {
        channel < self.core.config.num_channels
    }

    /// Wait for interrupts being serviced to have scheduled their deferred
    /// work.
    fn synchronize_irq(&self) {
        drop(self.irq_gate.write().unwrap());
    }

    /// Wait until all the deferred 3A and sensor work scheduled so far has
    /// completed.
    pub fn flush_deferred(&self) {
        if let Some(worker) = &self.stat_worker {
            worker.flush();
        }
        if let Some(worker) = &self.sensor_worker {
            worker.flush();
        }
    }

    pub fn open(&self) -> Result<(), OpenError> {
        let _guard = self.stream_lock.lock().unwrap();
        let core = &self.core;

        if core.state.is_opened() {
            error!("Device open busy");
            return Err(OpenError::Busy);
        }

        if core.config.stats_enabled() {
            let tables = IspTables::allocate(&*core.allocator)?;
            let arena = Arc::new(DmaArena::uniform(
                &*core.allocator,
                core.config.stat_buffers,
                core.config.stat_layout.size,
            )?);
            if let Some(isp) = &core.isp {
                isp.load_tables(&tables);
            }
            *core.tables.lock().unwrap() = Some(tables);

            let pool = StatPool::new(arena.regions().map(|r| r.dma));
            debug!("Allocated {} statistics buffers", pool.capacity());
            core.pipeline.lock().unwrap().stats = Some(Statistics { pool, arena });

            if let Some(isp3a) = &core.isp3a {
                isp3a.lock().unwrap().reset();
            }
        }

        {
            let mut pipeline = core.pipeline.lock().unwrap();
            for queue in pipeline.channels.iter_mut() {
                queue.first_seen = 0;
                queue.sequence = 0;
            }
            pipeline.clock.reset();
        }

        core.state.try_open().map_err(|_| OpenError::Busy)?;
        debug!("Device opened");

        Ok(())
    }

    /// Close the device. All its channels must have been streamed off.
    ///
    /// Buffers still queued, or completed but not picked up, are returned to
    /// the sink.
    pub fn close(&self) -> Result<(), CloseError> {
        let _guard = self.stream_lock.lock().unwrap();
        let core = &self.core;

        let status = core.state.status();
        if !status.opened {
            return Err(CloseError::NotOpen);
        }
        if status.generating != 0 {
            error!("Cannot close device while it is generating ({})", status);
            return Err(CloseError::StillGenerating);
        }

        for channel in 0..core.config.num_channels {
            core.csi.disable_int(channel, CsiIrq::ALL);
        }
        core.csi.set_streaming(false);
        core.csi.disable();
        if let Some(isp) = &core.isp {
            isp.disable_irq(IspIrq::ALL);
            isp.disable();
        }

        // The statistics memory must outlive any task still using it.
        self.synchronize_irq();
        self.flush_deferred();

        let leftovers = {
            let mut pipeline = core.pipeline.lock().unwrap();
            pipeline.stats = None;
            let mut leftovers = Vec::new();
            for queue in pipeline.channels.iter_mut() {
                leftovers.extend(queue.frames.drain_done());
                leftovers.extend(queue.frames.drain_all().into_iter().map(|buffer| {
                    CompletedBuffer {
                        buffer,
                        status: BufferStatus::Error,
                    }
                }));
                queue.first_seen = 0;
            }
            leftovers
        };
        *core.tables.lock().unwrap() = None;
        if let Some(isp3a) = &core.isp3a {
            isp3a.lock().unwrap().on_close();
        }

        core.state
            .try_close()
            .map_err(|_| CloseError::StillGenerating)?;

        debug!("Device closed, {} buffers returned", leftovers.len());
        for buffer in leftovers {
            core.sink.buffer_done(buffer);
        }

        Ok(())
    }

    pub fn set_capture_mode(&self, mode: CaptureMode) -> Result<(), CaptureModeError> {
        let _guard = self.stream_lock.lock().unwrap();
        if self.core.state.any_generating() {
            return Err(CaptureModeError::Generating);
        }
        self.core.pipeline.lock().unwrap().mode = mode;
        debug!("Capture mode set to {}", mode);
        Ok(())
    }

    pub fn capture_mode(&self) -> CaptureMode {
        self.core.pipeline.lock().unwrap().mode
    }

    /// Admit `buffer` at the tail of the queue of `channel`.
    pub fn queue_buffer(
        &self,
        channel: usize,
        mut buffer: VideoBuffer,
    ) -> Result<(), QueueBufferError> {
        if !self.core.state.is_opened() {
            return Err(QueueBufferError::NotOpen);
        }
        if !self.check_channel(channel) {
            return Err(QueueBufferError::InvalidChannel(channel));
        }

        buffer.channel = channel;
        buffer.timestamp = None;
        trace!("Queueing buffer {} on channel {}", buffer.index, channel);
        self.core.pipeline.lock().unwrap().channels[channel]
            .frames
            .admit(buffer);

        Ok(())
    }

    /// Take the oldest completed buffer of `channel`, in pickup mode.
    pub fn dequeue_done(&self, channel: usize) -> Result<CompletedBuffer, DequeueError> {
        if self.core.config.done_mode != DoneMode::Pickup {
            return Err(DequeueError::NotPickupMode);
        }
        if !self.core.state.is_opened() {
            return Err(DequeueError::NotOpen);
        }
        if !self.check_channel(channel) {
            return Err(DequeueError::InvalidChannel(channel));
        }

        self.core.pipeline.lock().unwrap().channels[channel]
            .frames
            .pop_done()
            .ok_or(DequeueError::NotReady)
    }

    /// Set the callback run when buffers are added to a pickup list. It runs
    /// without any device lock held.
    pub fn set_done_notifier<N: DoneNotifier>(&self, notifier: N) {
        *self.core.notifier.lock().unwrap() = Some(Arc::new(notifier));
    }

    pub fn clear_done_notifier(&self) {
        *self.core.notifier.lock().unwrap() = None;
    }

    /// Start generating frames on `channel`. Does nothing if the channel is
    /// already generating.
    pub fn stream_on(&self, channel: usize) -> Result<(), StreamOnError> {
        let _guard = self.stream_lock.lock().unwrap();
        let core = &self.core;

        if !core.state.is_opened() {
            return Err(StreamOnError::NotOpen);
        }
        if !self.check_channel(channel) {
            return Err(StreamOnError::InvalidChannel(channel));
        }
        if core.state.is_generating(channel) {
            debug!("Stream already on for channel {}", channel);
            return Ok(());
        }

        let first = !core.state.any_generating();
        let mode = {
            let mut pipeline = core.pipeline.lock().unwrap();
            let pipeline = &mut *pipeline;

            let Some(head) = pipeline.channels[channel].frames.head().map(|b| b.dma_addr) else {
                error!("Stream on, but no buffer queued on channel {}", channel);
                return Err(StreamOnError::NoBuffers(channel));
            };

            if first {
                core.csi.enable();
                if let Some(isp) = &core.isp {
                    isp.enable();
                }
                pipeline.clock.reset();
            }

            let queue = &mut pipeline.channels[channel];
            queue.first_seen = 0;
            queue.sequence = 0;
            core.current_channel.store(channel, Ordering::Release);
            core.set_output_addr(channel, head);

            if let Some(stats) = pipeline.stats.as_mut() {
                if first {
                    stats.pool.reset();
                }
                if let (Some(isp), Some(addr)) = (&core.isp, stats.pool.program_next_address()) {
                    isp.set_statistics_addr(addr);
                }
            }

            // Set while the queues are primed, so the interrupt path never
            // sees one without the other.
            core.state.start_generating(channel);
            pipeline.mode
        };

        match &core.isp {
            Some(isp) => {
                isp.set_para_ready(true);
                isp.clear_irq_status(IspIrq::ALL);
                isp.enable_irq(IspIrq::FINISH | IspIrq::SRC0_FIFO_OVERFLOW);
                if core.config.stats_enabled() {
                    core.csi.enable_int(channel, CsiIrq::VSYNC_TRIG);
                }
                isp.start_capture(mode);
            }
            None => {
                core.csi.clear_int_status(channel, CsiIrq::ALL);
                core.csi.enable_int(
                    channel,
                    CsiIrq::CAPTURE_DONE | CsiIrq::FRAME_DONE | CsiIrq::OVERFLOW,
                );
            }
        }
        if first {
            core.csi.set_streaming(true);
        }
        debug!("Stream on for channel {} in {} mode", channel, mode);

        Ok(())
    }

    /// Stop generating frames on `channel`. Buffers still queued on it are
    /// returned with `BufferStatus::Error`, through the sink or the pickup
    /// list. Does nothing if the channel is not generating.
    ///
    /// This blocks until the deferred 3A work in flight has completed.
    pub fn stream_off(&self, channel: usize) -> Result<(), StreamOffError> {
        let _guard = self.stream_lock.lock().unwrap();
        let core = &self.core;

        if !core.state.is_opened() {
            return Err(StreamOffError::NotOpen);
        }
        if !self.check_channel(channel) {
            return Err(StreamOffError::InvalidChannel(channel));
        }
        if !core.state.is_generating(channel) {
            debug!("Stream already off for channel {}", channel);
            return Ok(());
        }

        let last = core.state.status().generating == 1 << channel;

        // Interrupt sources go first, so the queues can be drained safely.
        if let Some(isp) = &core.isp {
            if last {
                isp.disable_irq(IspIrq::ALL);
                isp.clear_irq_status(IspIrq::ALL);
            }
        }
        core.csi.disable_int(channel, CsiIrq::ALL);
        core.csi.clear_int_status(channel, CsiIrq::ALL);
        if last {
            core.csi.set_streaming(false);
            if let Some(isp) = &core.isp {
                isp.stop_capture();
            }
        }

        // A slot locked by an interrupt still running must reach the 3A
        // worker before it is flushed.
        self.synchronize_irq();
        self.flush_deferred();

        let (canceled, moved) = {
            let mut pipeline = core.pipeline.lock().unwrap();
            let queue = &mut pipeline.channels[channel];
            let drained = queue.frames.drain_all();
            queue.first_seen = 0;
            core.state.stop_generating(channel);

            match core.config.done_mode {
                DoneMode::Callback => (drained, 0),
                DoneMode::Pickup => {
                    let moved = drained.len();
                    for buffer in drained {
                        queue.frames.push_done(CompletedBuffer {
                            buffer,
                            status: BufferStatus::Error,
                        });
                    }
                    (Vec::new(), moved)
                }
            }
        };

        debug!(
            "Stream off for channel {}, {} buffers canceled",
            channel,
            canceled.len() + moved
        );
        for buffer in canceled {
            core.sink.buffer_done(CompletedBuffer {
                buffer,
                status: BufferStatus::Error,
            });
        }
        if moved > 0 {
            core.notify(channel);
        }

        if last {
            if let Some(isp) = &core.isp {
                isp.disable();
            }
            core.csi.disable();
        }

        Ok(())
    }

    /// Service one interrupt of the capture hardware. Never blocks, except
    /// against a concurrent `stream_off` or `close` waiting for it.
    ///
    /// Deferred work is scheduled before completed buffers are handed out, so
    /// a consumer stopping the stream from its callback flushes it.
    pub fn handle_interrupt(&self) -> IrqOutcome {
        let dispatch = {
            let _in_flight = self.irq_gate.read().unwrap();
            let mut dispatch = self.core.dispatch_interrupt();
            if let Some(job) = dispatch.stat_job.take() {
                self.schedule_statistics(job);
            }
            if dispatch.sensor_update {
                if let Some(worker) = &self.sensor_worker {
                    worker.schedule(Job::SensorUpdate);
                }
            }
            dispatch
        };

        if let Some(completed) = dispatch.completed {
            self.core.sink.buffer_done(completed);
        }
        if let Some(channel) = dispatch.notify {
            self.core.notify(channel);
        }

        dispatch.outcome
    }

    fn schedule_statistics(&self, job: StatJob) {
        let slot = job.slot;
        let scheduled = match (&self.stat_worker, &self.core.isp) {
            (Some(worker), Some(isp)) => {
                isp.set_para_ready(false);
                let scheduled = worker.schedule(Job::Statistics(job));
                isp.set_para_ready(true);
                scheduled
            }
            _ => false,
        };
        if !scheduled {
            self.core.release_stat(slot);
        }
    }

    pub fn status(&self) -> Status {
        self.core.state.status()
    }

    /// The channel serviced by interrupts when multi-channel output is off.
    pub fn current_channel(&self) -> usize {
        self.core.current_channel.load(Ordering::Acquire)
    }

    /// Number of buffers queued on `channel` and not completed yet.
    pub fn queued_buffers(&self, channel: usize) -> usize {
        self.core
            .pipeline
            .lock()
            .unwrap()
            .channels
            .get(channel)
            .map_or(0, |q| q.frames.len())
    }

    /// Interrupts counted towards priming on `channel`.
    pub fn first_frame_seen(&self, channel: usize) -> Option<u8> {
        self.core
            .pipeline
            .lock()
            .unwrap()
            .channels
            .get(channel)
            .map(|q| q.first_seen)
    }

    pub fn stat_counts(&self) -> Option<StatCounts> {
        self.core
            .pipeline
            .lock()
            .unwrap()
            .stats
            .as_ref()
            .map(|s| s.pool.counts())
    }

    /// The statistics buffers, while the device is opened with statistics
    /// enabled.
    pub fn statistics_memory(&self) -> Option<Arc<DmaArena>> {
        self.core
            .pipeline
            .lock()
            .unwrap()
            .stats
            .as_ref()
            .map(|s| Arc::clone(&s.arena))
    }

    /// Latest 3A result. Blocks while a 3A task is running.
    pub fn isp_result(&self) -> Option<Isp3aResult> {
        self.core
            .isp3a
            .as_ref()
            .map(|i| i.lock().unwrap().result().clone())
    }

    /// Last values applied to the sensor and lens.
    pub fn ctrl_params(&self) -> Option<CtrlParams> {
        self.core
            .isp3a
            .as_ref()
            .map(|i| i.lock().unwrap().ctrl_params())
    }
}
