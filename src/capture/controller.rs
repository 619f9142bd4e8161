//! Stream state machine: IDLE -> STREAMING -> STOPPING -> IDLE.
//!
//! Stop ordering is fixed: the trigger is disabled and the queue disarmed
//! before waiting for the in-flight transfer, and the pending queue is only
//! flushed once that transfer has been handed back. A flushed buffer can
//! therefore never be written by a late transfer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};

use crate::bus::TransferSettings;
use crate::capture::engine::CaptureEngine;
use crate::capture::format::{FormatNegotiator, NegotiatedFormat};
use crate::capture::frame::{FrameFault, PixelFormat};
use crate::capture::queue::CaptureQueue;
use crate::error::{FormatError, QueueError, StreamError};
use crate::pipeline::CaptureStats;
use crate::trigger::TriggerSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    /// Draining, or wedged after a stop timeout.
    Stopping,
}

struct ControlState {
    stream: StreamState,
    format: Option<NegotiatedFormat>,
}

pub struct StreamController {
    state: Mutex<ControlState>,
    /// Serializes `stop` calls across the drain wait.
    stop_serial: Mutex<()>,
    queue: Arc<CaptureQueue>,
    engine: Arc<CaptureEngine>,
    trigger: Box<dyn TriggerSource>,
    stats: Arc<CaptureStats>,
    negotiator: FormatNegotiator,
    min_queued: usize,
    stop_timeout: Duration,
    clock_hz: u32,
    bits_per_word: u8,
}

/// Stream parameters not owned by the negotiator.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub min_queued: usize,
    pub stop_timeout: Duration,
    pub clock_hz: u32,
    pub bits_per_word: u8,
}

impl StreamController {
    pub fn new(
        queue: Arc<CaptureQueue>,
        engine: Arc<CaptureEngine>,
        trigger: Box<dyn TriggerSource>,
        stats: Arc<CaptureStats>,
        negotiator: FormatNegotiator,
        limits: StreamLimits,
    ) -> Self {
        Self {
            state: Mutex::new(ControlState {
                stream: StreamState::Idle,
                format: None,
            }),
            stop_serial: Mutex::new(()),
            queue,
            engine,
            trigger,
            stats,
            negotiator,
            min_queued: limits.min_queued,
            stop_timeout: limits.stop_timeout,
            clock_hz: limits.clock_hz,
            bits_per_word: limits.bits_per_word,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.lock().stream
    }

    pub fn format(&self) -> Option<NegotiatedFormat> {
        self.state.lock().format
    }

    pub fn min_queued(&self) -> usize {
        self.min_queued
    }

    pub fn negotiator(&self) -> &FormatNegotiator {
        &self.negotiator
    }

    /// Validate and commit a frame geometry. Only while IDLE with nothing
    /// queued or in flight; on error nothing changes.
    #[instrument(skip(self))]
    pub fn negotiate(
        &self,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    ) -> Result<NegotiatedFormat, FormatError> {
        let mut ctl = self.state.lock();
        if ctl.stream != StreamState::Idle || !self.queue.is_idle() {
            return Err(FormatError::Busy);
        }
        let format = self.negotiator.validate(width, height, pixel_format)?;
        ctl.format = Some(format);
        debug!(size_image = format.size_image, "format committed");
        Ok(format)
    }

    /// The committed format, provided buffers may be (re)allocated now:
    /// IDLE and every index back with the consumer, dequeued completions
    /// included.
    pub fn allocation_format(&self) -> Result<NegotiatedFormat, QueueError> {
        let ctl = self.state.lock();
        if ctl.stream != StreamState::Idle || !self.queue.is_quiescent() {
            return Err(QueueError::Busy);
        }
        ctl.format.ok_or(QueueError::NoFormat)
    }

    /// IDLE -> STREAMING. Opens a new stream generation at sequence 0 that
    /// accepts edges of the trigger's current epoch only.
    #[instrument(skip(self), fields(trigger = self.trigger.name()))]
    pub fn start(&self) -> Result<(), StreamError> {
        let mut ctl = self.state.lock();
        match ctl.stream {
            StreamState::Idle => {}
            StreamState::Streaming => return Err(StreamError::AlreadyStreaming),
            StreamState::Stopping => return Err(StreamError::Wedged),
        }
        let format = ctl.format.ok_or(StreamError::NoFormatConfigured)?;
        let queued = self.queue.depth();
        if queued < self.min_queued {
            return Err(StreamError::InsufficientBuffers {
                queued,
                required: self.min_queued,
            });
        }

        self.engine.load_settings(TransferSettings {
            length: format.size_image,
            clock_hz: self.clock_hz,
            bits_per_word: self.bits_per_word,
        });
        let epoch = self.trigger.epoch();
        self.queue.arm(epoch);
        if let Err(e) = self.trigger.enable() {
            self.queue.disarm();
            self.engine.clear_settings();
            return Err(e.into());
        }
        ctl.stream = StreamState::Streaming;
        info!(queued, epoch, size_image = format.size_image, "streaming");
        Ok(())
    }

    /// STREAMING -> STOPPING -> IDLE. Returns how many queued buffers were
    /// cancelled. Stopping an idle stream is a no-op.
    ///
    /// The state lock is not held across the drain, so state queries and
    /// submissions proceed meanwhile. On `StopTimeout` the controller stays
    /// in STOPPING; calling `stop` again retries the drain.
    #[instrument(skip(self), fields(timeout = ?self.stop_timeout))]
    pub fn stop(&self) -> Result<usize, StreamError> {
        let _serial = self.stop_serial.lock();
        {
            let mut ctl = self.state.lock();
            match ctl.stream {
                StreamState::Idle => return Ok(0),
                StreamState::Streaming => {
                    self.trigger.disable();
                    self.queue.disarm();
                    ctl.stream = StreamState::Stopping;
                    debug!("trigger disabled, draining");
                }
                StreamState::Stopping => debug!("retrying drain"),
            }
        }

        let started = Instant::now();
        if let Err(index) = self.queue.wait_drained(started + self.stop_timeout) {
            let waited = started.elapsed();
            error!(index, ?waited, "stop timed out; hardware reset required");
            return Err(StreamError::StopTimeout { index, waited });
        }

        let mut ctl = self.state.lock();
        let cancelled = self.queue.flush_all(FrameFault::Cancelled);
        self.stats.record_cancelled(cancelled);
        self.engine.clear_settings();
        ctl.stream = StreamState::Idle;
        info!(cancelled, "stream stopped");
        Ok(cancelled)
    }
}
