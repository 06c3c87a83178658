//! Pool of ISP statistics buffers.
//!
//! Each slot is either IDLE (free, not queued anywhere useful), ACTIVE (in the
//! active queue, waiting for the statistics engine to write to it) or LOCKED
//! (filled, owned by the 3A task). The interrupt path locks the active head
//! once per frame. The 3A task only flips its slot back to IDLE when done:
//! putting it back in the active queue is left to the next rotation.
use std::collections::VecDeque;
use std::fmt;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::memory::DmaAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatBufferState {
    Idle,
    Active,
    Locked,
}

impl fmt::Display for StatBufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug)]
pub struct StatBuffer {
    pub id: usize,
    pub dma_addr: DmaAddr,
    pub state: StatBufferState,
    /// Number of times this slot has been locked.
    pub frame_number: u32,
}

/// A slot just locked for the 3A task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockedStat {
    pub slot: usize,
    pub frame_number: u32,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RotateError {
    #[error("statistics buffer {0} is still locked")]
    PreviousLocked(usize),
    #[error("no statistics buffer available")]
    NoBufferAvailable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatCounts {
    pub idle: usize,
    pub active: usize,
    pub locked: usize,
}

impl StatCounts {
    pub fn total(&self) -> usize {
        self.idle + self.active + self.locked
    }
}

pub struct StatPool {
    slots: Vec<StatBuffer>,
    active: VecDeque<usize>,
    locked: VecDeque<usize>,
}

impl StatPool {
    /// Create a pool with one IDLE slot per address.
    pub fn new<I: IntoIterator<Item = DmaAddr>>(addrs: I) -> Self {
        let slots = addrs
            .into_iter()
            .enumerate()
            .map(|(id, dma_addr)| StatBuffer {
                id,
                dma_addr,
                state: StatBufferState::Idle,
                frame_number: 0,
            })
            .collect::<Vec<_>>();

        Self {
            active: VecDeque::with_capacity(slots.len()),
            locked: VecDeque::with_capacity(slots.len()),
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, id: usize) -> Option<&StatBuffer> {
        self.slots.get(id)
    }

    /// Make every slot ACTIVE and queue them in id order. A slot still owned
    /// by the 3A task stays LOCKED and is recycled once released.
    pub fn reset(&mut self) {
        let slots = &self.slots;
        self.locked
            .retain(|id| slots[*id].state == StatBufferState::Locked);
        self.active.clear();
        for slot in self.slots.iter_mut() {
            if slot.state == StatBufferState::Locked {
                warn!("Statistics buffer {} still locked at reset", slot.id);
                continue;
            }
            slot.state = StatBufferState::Active;
            self.active.push_back(slot.id);
        }
    }

    /// Lock the head of the active queue for the 3A task.
    pub fn rotate_and_lock(&mut self) -> Result<LockedStat, RotateError> {
        if let Some(id) = self
            .locked
            .iter()
            .copied()
            .find(|id| self.slots[*id].state == StatBufferState::Locked)
        {
            debug!("Statistics buffer {} still locked, dropping statistics", id);
            return Err(RotateError::PreviousLocked(id));
        }

        for slot in self.slots.iter_mut() {
            if slot.state == StatBufferState::Idle {
                trace!("Recycling statistics buffer {}", slot.id);
                self.locked.retain(|id| *id != slot.id);
                self.active.retain(|id| *id != slot.id);
                self.active.push_back(slot.id);
                slot.state = StatBufferState::Active;
            }
        }

        let Some(id) = self.active.pop_front() else {
            return Err(RotateError::NoBufferAvailable);
        };
        let slot = &mut self.slots[id];
        slot.state = StatBufferState::Locked;
        slot.frame_number = slot.frame_number.wrapping_add(1);
        self.locked.push_back(id);

        if self.active.len() == 1 {
            warn!("Only one statistics buffer left for the next frame");
        }

        Ok(LockedStat {
            slot: id,
            frame_number: slot.frame_number,
        })
    }

    /// Address the statistics of the next frame should be written to.
    pub fn program_next_address(&self) -> Option<DmaAddr> {
        self.active.front().map(|id| self.slots[*id].dma_addr)
    }

    /// Give a LOCKED slot back. Returns `false` if the slot was not locked.
    pub fn release(&mut self, id: usize) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) if slot.state == StatBufferState::Locked => {
                slot.state = StatBufferState::Idle;
                true
            }
            Some(slot) => {
                warn!(
                    "Releasing statistics buffer {} which is {}",
                    id, slot.state
                );
                false
            }
            None => {
                warn!("Releasing unknown statistics buffer {}", id);
                false
            }
        }
    }

    pub fn counts(&self) -> StatCounts {
        let mut counts = StatCounts::default();
        for slot in &self.slots {
            match slot.state {
                StatBufferState::Idle => counts.idle += 1,
                StatBufferState::Active => counts.active += 1,
                StatBufferState::Locked => counts.locked += 1,
            }
        }
        counts
    }

    pub fn active_queue(&self) -> Vec<usize> {
        self.active.iter().copied().collect()
    }

    pub fn locked_queue(&self) -> Vec<usize> {
        self.locked.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> StatPool {
        StatPool::new((0..n).map(|i| DmaAddr(0x8000 + 0x4000 * i as u64)))
    }

    #[test]
    fn test_reset_activates_all() {
        let mut pool = pool(4);
        assert_eq!(pool.counts().idle, 4);

        pool.reset();
        assert_eq!(pool.active_queue(), vec![0, 1, 2, 3]);
        assert!(pool.locked_queue().is_empty());
        assert_eq!(pool.counts().active, 4);
        assert_eq!(pool.program_next_address(), Some(DmaAddr(0x8000)));
    }

    #[test]
    fn test_reset_keeps_locked_slot() {
        let mut pool = pool(4);
        pool.reset();
        assert_eq!(pool.rotate_and_lock().unwrap().slot, 0);

        // The 3A task still parses slot 0: it must not be handed to the
        // statistics engine again.
        pool.reset();
        assert_eq!(pool.slot(0).unwrap().state, StatBufferState::Locked);
        assert_eq!(pool.active_queue(), vec![1, 2, 3]);
        assert_eq!(pool.locked_queue(), vec![0]);
        assert_eq!(pool.program_next_address(), Some(DmaAddr(0xc000)));
        assert_eq!(pool.counts().total(), pool.capacity());
        assert_eq!(pool.rotate_and_lock(), Err(RotateError::PreviousLocked(0)));

        assert!(pool.release(0));
        assert_eq!(pool.rotate_and_lock().unwrap().slot, 1);
        assert_eq!(pool.active_queue(), vec![2, 3, 0]);
    }

    #[test]
    fn test_rotate_while_locked() {
        let mut pool = pool(4);
        pool.reset();

        let locked = pool.rotate_and_lock().unwrap();
        assert_eq!(locked.slot, 0);
        assert_eq!(locked.frame_number, 1);
        assert_eq!(pool.locked_queue(), vec![0]);
        assert_eq!(pool.active_queue(), vec![1, 2, 3]);
        assert_eq!(pool.program_next_address(), Some(DmaAddr(0xc000)));

        // Nothing moves until slot 0 is released.
        assert_eq!(pool.rotate_and_lock(), Err(RotateError::PreviousLocked(0)));
        assert_eq!(pool.locked_queue(), vec![0]);
        assert_eq!(pool.active_queue(), vec![1, 2, 3]);
        assert_eq!(pool.slot(0).unwrap().state, StatBufferState::Locked);
    }

    #[test]
    fn test_release_defers_recycling() {
        let mut pool = pool(3);
        pool.reset();
        pool.rotate_and_lock().unwrap();

        assert!(pool.release(0));
        assert_eq!(pool.slot(0).unwrap().state, StatBufferState::Idle);
        // Released slots stay out of the active queue until the next rotation.
        assert_eq!(pool.active_queue(), vec![1, 2]);
        assert_eq!(pool.locked_queue(), vec![0]);

        let locked = pool.rotate_and_lock().unwrap();
        assert_eq!(locked.slot, 1);
        assert_eq!(pool.active_queue(), vec![2, 0]);
        assert_eq!(pool.locked_queue(), vec![1]);
    }

    #[test]
    fn test_release_requires_locked() {
        let mut pool = pool(2);
        pool.reset();
        assert!(!pool.release(1));
        assert!(!pool.release(5));
        assert_eq!(pool.slot(1).unwrap().state, StatBufferState::Active);
    }

    #[test]
    fn test_rotation_cycles_through_slots() {
        let mut pool = pool(3);
        pool.reset();

        let mut order = Vec::new();
        for _ in 0..7 {
            let locked = pool.rotate_and_lock().unwrap();
            order.push(locked.slot);
            assert_eq!(pool.counts().locked, 1);
            assert_eq!(pool.counts().total(), 3);
            pool.release(locked.slot);
            assert_eq!(pool.counts().total(), 3);
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(pool.slot(0).unwrap().frame_number, 3);
    }

    #[test]
    fn test_no_buffer_available() {
        let mut pool = pool(1);
        pool.reset();
        assert_eq!(pool.rotate_and_lock().map(|l| l.slot), Ok(0));
        assert_eq!(pool.program_next_address(), None);

        let mut empty = StatPool::new(std::iter::empty());
        empty.reset();
        assert_eq!(empty.rotate_and_lock(), Err(RotateError::NoBufferAvailable));
    }
}
