//! Fixed-capacity FIFO for pending frame buffers

use ::ringbuf::traits::{Consumer, Observer, Producer};
use ::ringbuf::HeapRb;

use crate::capture::frame::FrameBuffer;

/// Pre-allocated FIFO of buffers awaiting capture.
///
/// Storage is allocated once at construction; push and pop never allocate,
/// so both are usable from the trigger path. Not synchronized on its own:
/// the capture queue keeps it behind its lock.
pub struct PendingRing {
    ring: HeapRb<FrameBuffer>,
}

impl PendingRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
        }
    }

    /// Append to the tail. Hands the buffer back when full.
    pub fn push(&mut self, buffer: FrameBuffer) -> Result<(), FrameBuffer> {
        self.ring.try_push(buffer)
    }

    /// Take the head.
    pub fn pop(&mut self) -> Option<FrameBuffer> {
        self.ring.try_pop()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
