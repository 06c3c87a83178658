//! Video buffers as seen by the pipeline, and how completed ones leave it.
use std::time::Duration;

use log::{trace, warn};
use nix::time::{clock_gettime, ClockId};

use crate::memory::DmaAddr;
use crate::BufferStatus;

/// A frame-sized memory region admitted by the buffer consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoBuffer {
    /// Identifier chosen by the consumer.
    pub index: u32,
    /// Device address the frame will be written to.
    pub dma_addr: DmaAddr,
    /// Channel the buffer was admitted on.
    pub channel: usize,
    /// Completion time, on the monotonic clock.
    pub timestamp: Option<Duration>,
    /// Position of the frame in the channel's stream, starting at 0.
    pub sequence: u32,
}

impl VideoBuffer {
    pub fn new(index: u32, dma_addr: DmaAddr) -> Self {
        Self {
            index,
            dma_addr,
            channel: 0,
            timestamp: None,
            sequence: 0,
        }
    }
}

/// A buffer leaving the pipeline, and whether it holds a valid frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedBuffer {
    pub buffer: VideoBuffer,
    pub status: BufferStatus,
}

/// Consumer of completed buffers.
///
/// `buffer_done` is called exactly once for every admitted buffer that does
/// not go through the pickup list, never with a device lock held. It may thus
/// queue buffers back into the device.
pub trait BufferSink: Send + Sync {
    fn buffer_done(&self, buffer: CompletedBuffer);
}

/// Callback invoked with the channel number when buffers have been added to
/// the pickup list of that channel.
pub trait DoneNotifier: Fn(usize) + Send + Sync + 'static {}
impl<F> DoneNotifier for F where F: Fn(usize) + Send + Sync + 'static {}

/// Hands out strictly increasing completion timestamps.
#[derive(Debug, Default)]
pub(crate) struct FrameClock {
    last: Option<Duration>,
}

impl FrameClock {
    fn now() -> Option<Duration> {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Some(Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32)),
            Err(e) => {
                warn!("Cannot read monotonic clock: {}", e);
                None
            }
        }
    }

    pub(crate) fn stamp(&mut self) -> Duration {
        let now = Self::now();
        let stamp = match (now, self.last) {
            (Some(now), Some(last)) if now > last => {
                trace!("Frame interval {} us", (now - last).as_micros());
                now
            }
            (Some(now), None) => now,
            (_, Some(last)) => last + Duration::from_nanos(1),
            (None, None) => Duration::ZERO,
        };
        self.last = Some(stamp);
        stamp
    }

    pub(crate) fn reset(&mut self) {
        self.last = None;
    }
}
