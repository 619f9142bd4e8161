use std::fmt;
use std::time::Instant;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Pixel formats the sensor can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Argb32,
    Rgb24,
    Gray16,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Argb32 => 4,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Gray16 => 2,
            PixelFormat::Gray8 => 1,
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Argb32 => *b"BA24",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Gray16 => *b"Y16 ",
            PixelFormat::Gray8 => *b"GREY",
        }
    }
}

/// Where a buffer is in its capture lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Freshly allocated, never submitted.
    Prepared,
    Queued,
    Active,
    Done,
    Error,
}

/// Why a buffer completed in the `Error` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    Transport(TransportError),
    /// Still queued when the stream stopped.
    Cancelled,
}

/// Per-buffer capture metadata
#[derive(Debug, Clone, Copy)]
pub struct FrameMetadata {
    pub state: BufferState,
    /// Stream-scoped sequence, stamped when the buffer is claimed.
    pub sequence: Option<u64>,
    pub started: Option<Instant>,
    /// Completion time (DONE or ERROR).
    pub timestamp: Option<Instant>,
    pub bytes_used: usize,
    pub fault: Option<FrameFault>,
}

impl FrameMetadata {
    fn prepared() -> Self {
        Self {
            state: BufferState::Prepared,
            sequence: None,
            started: None,
            timestamp: None,
            bytes_used: 0,
            fault: None,
        }
    }
}

/// A fixed-size capture buffer.
///
/// Not `Clone`: whoever holds the value has custody of the memory. The queue
/// additionally tracks custody by index so a second buffer carrying the same
/// index is rejected.
pub struct FrameBuffer {
    index: u32,
    memory: BytesMut,
    meta: FrameMetadata,
}

impl FrameBuffer {
    /// Wrap an externally allocated memory region.
    pub fn new(index: u32, memory: BytesMut) -> Self {
        Self {
            index,
            memory,
            meta: FrameMetadata::prepared(),
        }
    }

    /// Allocate a zeroed buffer of `len` bytes.
    pub fn zeroed(index: u32, len: usize) -> Self {
        Self::new(index, BytesMut::zeroed(len))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn state(&self) -> BufferState {
        self.meta.state
    }

    pub fn sequence(&self) -> Option<u64> {
        self.meta.sequence
    }

    pub fn timestamp(&self) -> Option<Instant> {
        self.meta.timestamp
    }

    pub fn fault(&self) -> Option<FrameFault> {
        self.meta.fault
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.meta
    }

    /// Captured bytes. Empty unless the buffer completed `Done`.
    pub fn data(&self) -> &[u8] {
        &self.memory[..self.meta.bytes_used]
    }

    /// Whole backing region, e.g. for consumers that reuse it in place.
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Release the backing memory.
    pub fn into_memory(self) -> BytesMut {
        self.memory
    }

    pub(crate) fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub(crate) fn mark_queued(&mut self) {
        self.meta = FrameMetadata {
            state: BufferState::Queued,
            ..FrameMetadata::prepared()
        };
    }

    pub(crate) fn mark_active(&mut self, sequence: u64, started: Instant) {
        self.meta.state = BufferState::Active;
        self.meta.sequence = Some(sequence);
        self.meta.started = Some(started);
    }

    pub(crate) fn mark_done(&mut self, bytes_used: usize, at: Instant) {
        self.meta.state = BufferState::Done;
        self.meta.bytes_used = bytes_used.min(self.memory.len());
        self.meta.timestamp = Some(at);
        self.meta.fault = None;
    }

    pub(crate) fn mark_error(&mut self, fault: FrameFault, at: Instant) {
        self.meta.state = BufferState::Error;
        self.meta.bytes_used = 0;
        self.meta.timestamp = Some(at);
        self.meta.fault = Some(fault);
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("index", &self.index)
            .field("capacity", &self.memory.len())
            .field("state", &self.meta.state)
            .field("sequence", &self.meta.sequence)
            .field("fault", &self.meta.fault)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_stamps_metadata() {
        let mut buf = FrameBuffer::zeroed(3, 64);
        assert_eq!(buf.state(), BufferState::Prepared);
        assert!(buf.data().is_empty());

        buf.mark_queued();
        assert_eq!(buf.state(), BufferState::Queued);

        let t0 = Instant::now();
        buf.mark_active(7, t0);
        assert_eq!(buf.state(), BufferState::Active);
        assert_eq!(buf.sequence(), Some(7));

        buf.memory_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        buf.mark_done(64, Instant::now());
        assert_eq!(buf.state(), BufferState::Done);
        assert_eq!(buf.data().len(), 64);
        assert_eq!(&buf.data()[..4], &[1, 2, 3, 4]);
        assert!(buf.timestamp().unwrap() >= t0);
    }

    #[test]
    fn requeue_clears_previous_outcome() {
        let mut buf = FrameBuffer::zeroed(0, 16);
        buf.mark_active(0, Instant::now());
        buf.mark_error(FrameFault::Transport(TransportError::Timeout), Instant::now());
        assert_eq!(
            buf.fault(),
            Some(FrameFault::Transport(TransportError::Timeout))
        );
        assert!(buf.data().is_empty());

        buf.mark_queued();
        assert_eq!(buf.fault(), None);
        assert_eq!(buf.sequence(), None);
        assert_eq!(buf.timestamp(), None);
    }

    #[test]
    fn bytes_used_is_clamped_to_capacity() {
        let mut buf = FrameBuffer::zeroed(1, 8);
        buf.mark_done(100, Instant::now());
        assert_eq!(buf.data().len(), 8);
    }
}
