//! Opened/generating flags of a device, packed in one atomic word so that no
//! reader can observe a half-updated combination.
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::MAX_CHANNELS;

const OPENED: u32 = 1 << 31;
const GENERATING_MASK: u32 = (1 << MAX_CHANNELS) - 1;

/// Snapshot of the streaming flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub opened: bool,
    /// Bit `n` is set if channel `n` is generating.
    pub generating: u32,
}

impl Status {
    fn from_raw(raw: u32) -> Self {
        Self {
            opened: raw & OPENED != 0,
            generating: raw & GENERATING_MASK,
        }
    }

    pub fn is_generating(&self, channel: usize) -> bool {
        self.generating & (1 << channel) != 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.opened, self.generating) {
            (false, _) => f.write_str("closed"),
            (true, 0) => f.write_str("idle"),
            (true, g) => write!(f, "generating ({:#x})", g),
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamState(AtomicU32);

impl StreamState {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn status(&self) -> Status {
        Status::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn is_opened(&self) -> bool {
        self.status().opened
    }

    pub fn is_generating(&self, channel: usize) -> bool {
        self.status().is_generating(channel)
    }

    pub fn any_generating(&self) -> bool {
        self.status().generating != 0
    }

    fn update<F: FnMut(u32) -> Option<u32>>(&self, f: F) -> Result<Status, Status> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, f)
            .map(Status::from_raw)
            .map_err(Status::from_raw)
    }

    /// Mark the device opened. Fails if it already was.
    pub fn try_open(&self) -> Result<(), Status> {
        self.update(|raw| (raw & OPENED == 0).then_some(OPENED))
            .map(|_| ())
    }

    /// Mark the device closed. Fails if it is not opened or some channel is
    /// still generating.
    pub fn try_close(&self) -> Result<(), Status> {
        self.update(|raw| (raw == OPENED).then_some(0)).map(|_| ())
    }

    /// Set the generating flag of `channel`. Returns `false` if the device is
    /// not opened or the channel was already generating.
    pub fn start_generating(&self, channel: usize) -> bool {
        let bit = 1 << channel;
        self.update(|raw| (raw & OPENED != 0 && raw & bit == 0).then_some(raw | bit))
            .is_ok()
    }

    /// Clear the generating flag of `channel`. Returns `false` if it was
    /// not set.
    pub fn stop_generating(&self, channel: usize) -> bool {
        let bit = 1 << channel;
        self.update(|raw| (raw & bit != 0).then_some(raw & !bit))
            .is_ok()
    }
}
