//! This library implements the buffer pipeline of a camera capture front end,
//! i.e. the part of a CSI/ISP driver that sits between the hardware interrupt
//! and the buffer consumer:
//!
//! * The `device` module provides the `Device` type, which owns the per-channel
//!   frame queues, the pool of ISP statistics buffers and the streaming state,
//!   and exposes the stream lifecycle (open, stream on/off, close) as well as
//!   the interrupt entry point (`Device::handle_interrupt`). Heavyweight 3A
//!   processing is handed over to dedicated worker threads.
//!
//! * The `hw`, `isp` and `memory` modules define the ports through which the
//!   pipeline talks to the outside world: capture and ISP register blocks,
//!   sensor and lens controls, the 3A algorithm, and DMA memory. Nothing in
//!   this crate touches real registers; a simulated backend is available in
//!   `hw::sim` for tests and demos.
//!
//! * The `registry` module maps integer device ids to devices, for entry
//!   points (like the C API of `vfer-ffi`) that can only pass ids around.
//!
pub mod device;
pub mod hw;
pub mod isp;
pub mod memory;
pub mod registry;

use std::fmt;
use std::fmt::{Debug, Display};

use enumn::N;

/// Maximum number of capture channels a single device can expose.
pub const MAX_CHANNELS: usize = 4;

/// How frames are produced while the device is generating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default, N)]
#[repr(u32)]
pub enum CaptureMode {
    /// One frame is captured, after which the capture-done interrupt stays
    /// disabled until the next stream on.
    SingleImage = 1,
    /// Frames are produced continuously and every completed buffer is
    /// returned to the consumer.
    #[default]
    ContinuousVideo = 2,
    /// Same buffer handling as `ContinuousVideo`.
    Preview = 3,
}

impl CaptureMode {
    /// Returns whether frames keep coming after the first one.
    pub fn is_continuous(&self) -> bool {
        matches!(self, CaptureMode::ContinuousVideo | CaptureMode::Preview)
    }
}

impl Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Status a video buffer is returned with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    /// The buffer contains a complete frame.
    Done,
    /// The buffer was canceled (e.g. by a stream off) and contains no valid
    /// data.
    Error,
}

impl Display for BufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferStatus::Done => f.write_str("done"),
            BufferStatus::Error => f.write_str("error"),
        }
    }
}
