//! Per-channel queues of video buffers.
use std::collections::VecDeque;

use super::buffer::{CompletedBuffer, VideoBuffer};

/// Number of queued buffers needed to retire one while keeping the hardware
/// fed: the one completing, the one being written, and the next one to
/// program.
pub const MIN_QUEUED_BUFFERS: usize = 3;

/// Buffers admitted on one channel, in admission order, plus the list of
/// completed buffers waiting for pickup.
#[derive(Debug, Default)]
pub struct FrameQueue {
    active: VecDeque<VideoBuffer>,
    done: VecDeque<CompletedBuffer>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn admit(&mut self, buffer: VideoBuffer) {
        self.active.push_back(buffer);
    }

    pub fn drain_head(&mut self) -> Option<VideoBuffer> {
        self.active.pop_front()
    }

    pub fn head(&self) -> Option<&VideoBuffer> {
        self.active.front()
    }

    /// The buffer following the head, i.e. the one the hardware should be
    /// told about while the head completes.
    pub fn peek_second(&self) -> Option<&VideoBuffer> {
        self.active.get(1)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Returns whether too few buffers are queued to retire the head.
    pub fn is_starved(&self) -> bool {
        self.active.len() < MIN_QUEUED_BUFFERS
    }

    /// Remove every admitted buffer, oldest first.
    pub fn drain_all(&mut self) -> Vec<VideoBuffer> {
        self.active.drain(..).collect()
    }

    pub fn push_done(&mut self, buffer: CompletedBuffer) {
        self.done.push_back(buffer);
    }

    pub fn pop_done(&mut self) -> Option<CompletedBuffer> {
        self.done.pop_front()
    }

    pub fn num_done(&self) -> usize {
        self.done.len()
    }

    pub fn drain_done(&mut self) -> Vec<CompletedBuffer> {
        self.done.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DmaAddr;
    use crate::BufferStatus;

    fn buffer(index: u32) -> VideoBuffer {
        VideoBuffer::new(index, DmaAddr(0x1000 * index as u64))
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = FrameQueue::new();
        for i in 0..4 {
            queue.admit(buffer(i));
        }

        assert_eq!(queue.head().map(|b| b.index), Some(0));
        assert_eq!(queue.peek_second().map(|b| b.index), Some(1));
        assert_eq!(queue.drain_head().map(|b| b.index), Some(0));
        assert_eq!(queue.peek_second().map(|b| b.index), Some(2));
        assert_eq!(
            queue.drain_all().iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(queue.is_empty());
        assert!(queue.drain_head().is_none());
        assert!(queue.peek_second().is_none());
    }

    #[test]
    fn test_starvation() {
        let mut queue = FrameQueue::new();
        assert!(queue.is_starved());
        queue.admit(buffer(0));
        queue.admit(buffer(1));
        assert!(queue.is_starved());
        queue.admit(buffer(2));
        assert!(!queue.is_starved());
    }

    #[test]
    fn test_done_list() {
        let mut queue = FrameQueue::new();
        queue.push_done(CompletedBuffer {
            buffer: buffer(3),
            status: BufferStatus::Done,
        });
        queue.push_done(CompletedBuffer {
            buffer: buffer(4),
            status: BufferStatus::Error,
        });

        assert_eq!(queue.num_done(), 2);
        assert_eq!(queue.pop_done().map(|c| c.buffer.index), Some(3));
        let rest = queue.drain_done();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].status, BufferStatus::Error);
        assert!(queue.pop_done().is_none());
    }
}
