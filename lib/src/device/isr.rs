//! Interrupt dispatch.
//!
//! Everything here runs with the pipeline lock held and must not block.
//! Work that needs to run without the lock (returning buffers, scheduling
//! deferred tasks) is collected in a `Dispatch` and carried out by the
//! caller once the lock is released.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error, trace, warn};

use super::buffer::{CompletedBuffer, VideoBuffer};
use super::stat_pool::RotateError;
use super::worker::StatJob;
use super::{DeviceCore, DoneMode, Pipeline};
use crate::hw::{CsiIrq, IspIrq};
use crate::memory::DmaAddr;
use crate::{BufferStatus, CaptureMode};

/// Frame-done interrupts to let through after stream on or starvation before
/// buffers start being retired.
const PRIMING_INTERRUPTS: u8 = 2;

/// What happened to the statistics of a retired frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatsOutcome {
    /// The device does not collect statistics.
    Disabled,
    /// The statistics buffer `slot` was handed to the 3A task.
    Locked { slot: usize, frame_number: u32 },
    /// The 3A task still owns `slot`; the statistics of this frame are
    /// dropped.
    PreviousLocked(usize),
    NoBufferAvailable,
}

/// How an interrupt has been handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqOutcome {
    /// No channel is generating. Pending status has been cleared.
    NotGenerating,
    /// No frame event was asserted.
    Spurious { channel: usize },
    Vsync {
        channel: usize,
        /// A sensor update was scheduled.
        sensor_update: bool,
    },
    /// The capture engine overflowed and has been reset.
    Overflow { channel: usize },
    IspOverflow { channel: usize },
    /// Single image mode. `index` is `None` if no buffer was queued.
    ImageCaptured { channel: usize, index: Option<u32> },
    /// The frame was not retired while the hardware pipeline fills up.
    Priming { channel: usize, seen: u8 },
    /// Too few buffers are queued to retire one; priming starts over.
    Starved { channel: usize, queued: usize },
    FrameDone {
        channel: usize,
        index: u32,
        stats: StatsOutcome,
    },
}

pub(super) struct Dispatch {
    pub outcome: IrqOutcome,
    pub completed: Option<CompletedBuffer>,
    pub notify: Option<usize>,
    pub stat_job: Option<StatJob>,
    pub sensor_update: bool,
}

impl Dispatch {
    fn new(outcome: IrqOutcome) -> Self {
        Self {
            outcome,
            completed: None,
            notify: None,
            stat_job: None,
            sensor_update: false,
        }
    }
}

impl DeviceCore {
    /// Pick the channel to service and read its status.
    fn select_channel(&self) -> (usize, CsiIrq) {
        if self.config.multi_channel_output {
            for channel in 0..self.config.num_channels {
                let status = self.csi.int_status(channel);
                if status.contains(CsiIrq::FRAME_DONE) {
                    return (channel, status);
                }
            }
        }

        let channel = self.current_channel.load(Ordering::Acquire);
        (channel, self.csi.int_status(channel))
    }

    fn ack_all(&self, channel: usize) {
        self.csi.clear_int_status(channel, CsiIrq::ALL);
        if let Some(isp) = &self.isp {
            isp.clear_irq_status(IspIrq::ALL);
        }
    }

    fn disable_done_irq(&self, channel: usize, irq: CsiIrq) {
        match &self.isp {
            Some(isp) => isp.disable_irq(IspIrq::FINISH),
            None => self.csi.disable_int(channel, irq),
        }
    }

    /// Acknowledge the frame events and re-enable the done interrupt in
    /// continuous modes.
    fn rearm(&self, channel: usize, mode: CaptureMode) {
        self.csi
            .clear_int_status(channel, CsiIrq::CAPTURE_DONE | CsiIrq::FRAME_DONE);
        match &self.isp {
            Some(isp) => {
                isp.clear_irq_status(IspIrq::FINISH);
                if mode.is_continuous() {
                    isp.enable_irq(IspIrq::FINISH);
                }
            }
            None => {
                if mode.is_continuous() {
                    self.csi.enable_int(channel, CsiIrq::FRAME_DONE);
                }
            }
        }
    }

    fn program_next_frame(&self, channel: usize, next: Option<DmaAddr>) {
        match next {
            Some(addr) => self.set_output_addr(channel, addr),
            None => trace!("No buffer to program next on channel {}", channel),
        }
    }

    fn complete(
        &self,
        pipeline: &mut Pipeline,
        channel: usize,
        mut buffer: VideoBuffer,
        dispatch: &mut Dispatch,
    ) {
        buffer.timestamp = Some(pipeline.clock.stamp());
        let queue = &mut pipeline.channels[channel];
        buffer.sequence = queue.sequence;
        queue.sequence = queue.sequence.wrapping_add(1);

        let completed = CompletedBuffer {
            buffer,
            status: BufferStatus::Done,
        };
        match self.config.done_mode {
            DoneMode::Callback => dispatch.completed = Some(completed),
            DoneMode::Pickup => {
                queue.frames.push_done(completed);
                dispatch.notify = Some(channel);
            }
        }
    }

    pub(super) fn dispatch_interrupt(&self) -> Dispatch {
        if !self.state.any_generating() {
            self.ack_all(self.current_channel.load(Ordering::Acquire));
            return Dispatch::new(IrqOutcome::NotGenerating);
        }

        let mut pipeline = self.pipeline.lock().unwrap();
        let (channel, status) = self.select_channel();
        trace!("Interrupt on channel {}: {:?}", channel, status);

        if !self.state.is_generating(channel) {
            self.ack_all(channel);
            return Dispatch::new(IrqOutcome::NotGenerating);
        }

        if !status.intersects(CsiIrq::EVENTS) {
            debug!("Interrupt on channel {} without frame event", channel);
            self.ack_all(channel);
            return Dispatch::new(IrqOutcome::Spurious { channel });
        }

        let stats_enabled = self.config.stats_enabled();
        if status.contains(CsiIrq::VSYNC_TRIG)
            && (stats_enabled
                || !status.intersects(CsiIrq::CAPTURE_DONE | CsiIrq::FRAME_DONE | CsiIrq::OVERFLOW))
        {
            let sensor_update = stats_enabled && pipeline.mode.is_continuous();
            self.csi.clear_int_status(channel, CsiIrq::VSYNC_TRIG);
            let mut dispatch = Dispatch::new(IrqOutcome::Vsync {
                channel,
                sensor_update,
            });
            dispatch.sensor_update = sensor_update;
            return dispatch;
        }

        let mut dispatch = Dispatch::new(IrqOutcome::NotGenerating);
        let outcome = self.process_frame(&mut pipeline, channel, status, &mut dispatch);
        dispatch.outcome = outcome;
        self.rearm(channel, pipeline.mode);

        dispatch
    }

    fn process_frame(
        &self,
        pipeline: &mut Pipeline,
        channel: usize,
        status: CsiIrq,
        dispatch: &mut Dispatch,
    ) -> IrqOutcome {
        if status.intersects(CsiIrq::OVERFLOW) {
            if status.intersects(CsiIrq::FIFO_OVERFLOW) {
                self.csi.clear_int_status(channel, CsiIrq::FIFO_OVERFLOW);
                error!("FIFO overflow on channel {}", channel);
            }
            if status.contains(CsiIrq::HBLANK_OVERFLOW) {
                self.csi.clear_int_status(channel, CsiIrq::HBLANK_OVERFLOW);
                error!("Hblank overflow on channel {}", channel);
            }
            error!("Resetting capture engine");
            self.csi.reset();
            if self.isp.is_none() {
                return IrqOutcome::Overflow { channel };
            }
        }

        if let Some(isp) = &self.isp {
            if isp.irq_status().contains(IspIrq::SRC0_FIFO_OVERFLOW) {
                error!("ISP source FIFO overflow");
                isp.clear_irq_status(IspIrq::SRC0_FIFO_OVERFLOW);
                return IrqOutcome::IspOverflow { channel };
            }
        }

        if pipeline.mode == CaptureMode::SingleImage {
            self.disable_done_irq(channel, CsiIrq::CAPTURE_DONE);
            let index = match pipeline.channels[channel].frames.drain_head() {
                Some(buffer) => {
                    let index = buffer.index;
                    debug!("Image captured in buffer {} on channel {}", index, channel);
                    self.complete(pipeline, channel, buffer, dispatch);
                    Some(index)
                }
                None => {
                    warn!("Image captured on channel {} but no buffer is queued", channel);
                    None
                }
            };
            return IrqOutcome::ImageCaptured { channel, index };
        }

        self.disable_done_irq(channel, CsiIrq::FRAME_DONE);

        let queue = &mut pipeline.channels[channel];
        if queue.first_seen < PRIMING_INTERRUPTS {
            queue.first_seen += 1;
            let seen = queue.first_seen;
            debug!("Channel {} priming, interrupt {}", channel, seen);
            let next = queue.frames.peek_second().map(|b| b.dma_addr);

            if let Some(stats) = &pipeline.stats {
                if let (Some(isp), Some(addr)) = (&self.isp, stats.pool.program_next_address()) {
                    isp.set_statistics_addr(addr);
                }
            }
            self.program_next_frame(channel, next);
            return IrqOutcome::Priming { channel, seen };
        }

        if queue.frames.is_starved() {
            let queued = queue.frames.len();
            warn!("Only {} buffers left on channel {}", queued, channel);
            queue.first_seen = 0;
            return IrqOutcome::Starved { channel, queued };
        }

        // The hardware moves on to the buffer after the head, so that is the
        // one to program while the head is retired.
        let next = queue.frames.peek_second().map(|b| b.dma_addr);
        let Some(buffer) = queue.frames.drain_head() else {
            return IrqOutcome::Starved { channel, queued: 0 };
        };
        let index = buffer.index;
        self.complete(pipeline, channel, buffer, dispatch);

        let stats = match pipeline.stats.as_mut() {
            None => StatsOutcome::Disabled,
            Some(stats) => match stats.pool.rotate_and_lock() {
                Ok(locked) => {
                    dispatch.stat_job = Some(StatJob {
                        slot: locked.slot,
                        frame_number: locked.frame_number,
                        arena: Arc::clone(&stats.arena),
                    });
                    if let (Some(isp), Some(addr)) = (&self.isp, stats.pool.program_next_address())
                    {
                        isp.set_statistics_addr(addr);
                    }
                    StatsOutcome::Locked {
                        slot: locked.slot,
                        frame_number: locked.frame_number,
                    }
                }
                Err(RotateError::PreviousLocked(slot)) => StatsOutcome::PreviousLocked(slot),
                Err(RotateError::NoBufferAvailable) => {
                    error!("No active statistics buffer");
                    StatsOutcome::NoBufferAvailable
                }
            },
        };

        self.program_next_frame(channel, next);
        trace!("Channel {} retired buffer {}", channel, index);

        IrqOutcome::FrameDone {
            channel,
            index,
            stats,
        }
    }
}
