//! Error types for the capture pipeline.
//!
//! Precondition failures (`FormatError`, `QueueError`, `StreamError`) are
//! returned synchronously to the caller. `TransportError` is per-buffer: it
//! is recorded on the buffer and delivered through the completion channel,
//! never returned from a control call.

use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

use crate::capture::frame::{FrameBuffer, FrameFault, PixelFormat};

/// Result type alias for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Format negotiation failures. No state changes when one is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("pixel format {0:?} is not supported by the sensor")]
    UnsupportedPixelFormat(PixelFormat),

    #[error("width {requested} is not supported: sensor lines are {supported} pixels wide")]
    InvalidWidth { requested: u32, supported: u32 },

    #[error("height {requested} is out of range: 1..={max} lines")]
    InvalidHeight { requested: u32, max: u32 },

    #[error("a {width}px {format:?} line needs {needed} bytes, stride is {stride}")]
    LineTooWide {
        width: u32,
        format: PixelFormat,
        needed: usize,
        stride: usize,
    },

    #[error("image size {size} is not a multiple of the {word_bytes}-byte bus word")]
    Misaligned { size: usize, word_bytes: usize },

    /// Streaming, stopping, or buffers sized for the current format are queued.
    #[error("format cannot change while the device is busy")]
    Busy,
}

/// Buffer submission and allocation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("buffer {index} is queued, in flight or not yet dequeued")]
    AlreadyQueued { index: u32 },

    #[error("buffer index {index} is outside the {capacity}-slot table")]
    IndexOutOfRange { index: u32, capacity: usize },

    #[error("buffer {index} holds {len} bytes, the negotiated image needs {required}")]
    BufferTooSmall {
        index: u32,
        len: usize,
        required: usize,
    },

    #[error("no format negotiated; buffers cannot be sized")]
    NoFormat,

    /// Buffers are queued, in flight, or completed but not yet dequeued.
    #[error("buffers are still out of the consumer's hands")]
    Busy,
}

/// A rejected submission. The buffer is handed back untouched.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct SubmitError {
    #[source]
    pub error: QueueError,
    pub buffer: FrameBuffer,
}

impl SubmitError {
    pub fn into_buffer(self) -> FrameBuffer {
        self.buffer
    }
}

/// Stream state machine failures.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("{queued} buffers queued, streaming needs at least {required}")]
    InsufficientBuffers { queued: usize, required: usize },

    #[error("no format negotiated")]
    NoFormatConfigured,

    #[error("stream is already running")]
    AlreadyStreaming,

    /// The in-flight transfer did not finish before the drain deadline.
    /// The hardware must be considered indeterminate.
    #[error("buffer {index} still in flight after {waited:?}; hardware reset required")]
    StopTimeout { index: u32, waited: Duration },

    /// A stop is still draining, or timed out and has not been retried
    /// successfully.
    #[error("stream has not finished stopping; stop it again before restarting")]
    Wedged,

    #[error("trigger source: {0}")]
    Trigger(#[from] TriggerError),
}

/// Per-buffer bus transfer failure. `Copy` so the interrupt path can record
/// it without allocating.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("bus I/O failed: {0}")]
    Io(Errno),

    #[error("bus transfer timed out")]
    Timeout,

    #[error("short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("transfer length {len} is not a multiple of the {word_bytes}-byte word")]
    InvalidLength { len: usize, word_bytes: usize },

    #[error("no transfer settings are armed")]
    NotConfigured,
}

/// Trigger source failures.
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("an edge handler is already attached")]
    AlreadyAttached,

    #[error("no edge handler attached")]
    NotAttached,

    #[error("trigger I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Completion receive failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueError {
    #[error("no completed buffer within the timeout")]
    Timeout,

    #[error("completion channel closed")]
    Disconnected,
}

/// Read-mode failures. Except for `Requeue`, the buffer is already back in
/// the pending queue when one is returned.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error(transparent)]
    Dequeue(#[from] DequeueError),

    #[error("frame in buffer {index} failed: {fault:?}")]
    Frame { index: u32, fault: FrameFault },

    /// The buffer could not be queued again; it is handed back.
    #[error("could not requeue buffer: {0}")]
    Requeue(#[from] SubmitError),
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Dequeue(#[from] DequeueError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("no SPI device node found")]
    NoDevice,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
