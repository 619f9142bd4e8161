//! Consumer-facing capture device

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::bus::BusTransport;
use crate::capture::controller::{StreamController, StreamLimits, StreamState};
use crate::capture::engine::CaptureEngine;
use crate::capture::format::{Capabilities, FormatNegotiator, NegotiatedFormat};
use crate::capture::frame::{FrameBuffer, PixelFormat};
use crate::capture::queue::{CaptureQueue, Custody};
use crate::error::{DequeueError, FormatError, QueueError, ReadError, StreamError, SubmitError};
use crate::pipeline::{completion_channel, CaptureStats, CompletionReceiver};
use crate::trigger::TriggerSource;
use crate::{Config, Metrics, Result};

pub const DRIVER_NAME: &str = "tofcap";

/// One sensor on one bus with one trigger source.
///
/// Every method takes `&self`; the device can be shared between a control
/// thread and a consumer thread behind an `Arc`.
pub struct CaptureDevice {
    controller: StreamController,
    queue: Arc<CaptureQueue>,
    completions: CompletionReceiver,
    stats: Arc<CaptureStats>,
    card: String,
    bus_info: String,
    max_buffers: usize,
}

impl CaptureDevice {
    /// Wire a transport and a trigger into a capture device. The trigger is
    /// attached here and stays disabled until `start_stream`.
    #[instrument(skip_all, fields(transport = transport.name(), trigger = trigger.name()))]
    pub fn new(
        config: &Config,
        transport: Arc<dyn BusTransport>,
        trigger: Box<dyn TriggerSource>,
    ) -> Result<Self> {
        config.validate()?;
        let slots = config.stream.max_buffers;
        let bus_info = format!("spi:{}", transport.name());

        let stats = Arc::new(CaptureStats::new());
        let (tx, completions) = completion_channel(slots);
        let queue = Arc::new(CaptureQueue::new(slots, tx, stats.clone()));
        let engine = Arc::new(CaptureEngine::new(queue.clone(), transport, stats.clone()));
        trigger.attach(engine.clone())?;

        let controller = StreamController::new(
            queue.clone(),
            engine,
            trigger,
            stats.clone(),
            FormatNegotiator::new(config.sensor.clone(), config.bus.bits_per_word),
            StreamLimits {
                min_queued: config.stream.min_queued,
                stop_timeout: config.stream.stop_timeout(),
                clock_hz: config.bus.clock_hz,
                bits_per_word: config.bus.bits_per_word,
            },
        );
        info!(card = %config.sensor.name, slots, "capture device ready");

        Ok(Self {
            controller,
            queue,
            completions,
            stats,
            card: config.sensor.name.clone(),
            bus_info,
            max_buffers: slots,
        })
    }

    pub fn query_capabilities(&self) -> Capabilities {
        Capabilities {
            driver: DRIVER_NAME,
            card: self.card.clone(),
            bus_info: self.bus_info.clone(),
            streaming: true,
            read_write: true,
            min_buffers: self.controller.min_queued(),
            max_buffers: self.max_buffers,
            formats: self.enum_formats().to_vec(),
        }
    }

    pub fn enum_formats(&self) -> &[PixelFormat] {
        self.controller.negotiator().formats()
    }

    /// The committed format, if any.
    pub fn format(&self) -> Option<NegotiatedFormat> {
        self.controller.format()
    }

    /// Nearest supported format to the request. Changes nothing.
    pub fn try_format(&self, width: u32, height: u32, pixel_format: PixelFormat) -> NegotiatedFormat {
        self.controller
            .negotiator()
            .try_format(width, height, pixel_format)
    }

    pub fn negotiate_format(
        &self,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    ) -> std::result::Result<NegotiatedFormat, FormatError> {
        self.controller.negotiate(width, height, pixel_format)
    }

    /// Allocate buffers sized for the committed format with indices
    /// `0..n`. `count` is raised to the minimum queue depth and capped at
    /// the slot count. Refused with `Busy` until every earlier buffer has
    /// been dequeued, so a fresh index never aliases one still in the
    /// completion channel.
    #[instrument(skip(self))]
    pub fn allocate_buffers(&self, count: usize) -> std::result::Result<Vec<FrameBuffer>, QueueError> {
        let format = self.controller.allocation_format()?;
        let count = count.clamp(self.controller.min_queued(), self.max_buffers);
        let buffers = (0..count as u32)
            .map(|index| FrameBuffer::zeroed(index, format.size_image))
            .collect::<Vec<_>>();
        debug!(count, size = format.size_image, "buffers allocated");
        Ok(buffers)
    }

    /// Queue a buffer for capture. A rejected buffer is handed back inside
    /// the error with its ownership unchanged.
    pub fn submit(&self, buffer: FrameBuffer) -> std::result::Result<(), SubmitError> {
        let Some(format) = self.controller.format() else {
            return Err(SubmitError {
                error: QueueError::NoFormat,
                buffer,
            });
        };
        if buffer.capacity() < format.size_image {
            return Err(SubmitError {
                error: QueueError::BufferTooSmall {
                    index: buffer.index(),
                    len: buffer.capacity(),
                    required: format.size_image,
                },
                buffer,
            });
        }
        self.queue.submit(buffer)
    }

    /// Block until the next buffer finishes (DONE, ERROR or cancelled).
    pub fn dequeue_completed(&self) -> std::result::Result<FrameBuffer, DequeueError> {
        self.completions.recv().map(|b| self.queue.reclaim(b))
    }

    pub fn dequeue_completed_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<FrameBuffer, DequeueError> {
        self.completions
            .recv_timeout(timeout)
            .map(|b| self.queue.reclaim(b))
    }

    pub fn try_dequeue_completed(&self) -> Option<FrameBuffer> {
        self.completions.try_recv().map(|b| self.queue.reclaim(b))
    }

    pub async fn dequeue_completed_async(&self) -> std::result::Result<FrameBuffer, DequeueError> {
        let buffer = self.completions.recv_async().await?;
        Ok(self.queue.reclaim(buffer))
    }

    /// Read mode: copy the next completed frame into `dst` and queue its
    /// buffer again. Returns the number of bytes copied, at most
    /// `dst.len()`. Blocks until a frame completes.
    pub fn read_frame(&self, dst: &mut [u8]) -> std::result::Result<usize, ReadError> {
        let buffer = self.dequeue_completed()?;
        self.copy_and_requeue(buffer, dst)
    }

    pub fn read_frame_timeout(
        &self,
        dst: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, ReadError> {
        let buffer = self.dequeue_completed_timeout(timeout)?;
        self.copy_and_requeue(buffer, dst)
    }

    fn copy_and_requeue(
        &self,
        buffer: FrameBuffer,
        dst: &mut [u8],
    ) -> std::result::Result<usize, ReadError> {
        let index = buffer.index();
        let outcome = match buffer.fault() {
            Some(fault) => Err(ReadError::Frame { index, fault }),
            None => {
                let n = dst.len().min(buffer.data().len());
                dst[..n].copy_from_slice(&buffer.data()[..n]);
                Ok(n)
            }
        };
        self.submit(buffer)?;
        outcome
    }

    pub fn start_stream(&self) -> std::result::Result<(), StreamError> {
        self.controller.start()
    }

    /// Blocks until the stream is IDLE or the drain deadline passes.
    /// Returns how many queued buffers were cancelled.
    pub fn stop_stream(&self) -> std::result::Result<usize, StreamError> {
        self.controller.stop()
    }

    pub fn state(&self) -> StreamState {
        self.controller.state()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn custody(&self, index: u32) -> Option<Custody> {
        self.queue.custody(index)
    }

    /// Completed buffers waiting to be dequeued.
    pub fn completed_len(&self) -> usize {
        self.completions.len()
    }

    pub fn metrics(&self) -> Metrics {
        self.stats.snapshot()
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        if self.controller.state() != StreamState::Idle {
            if let Err(e) = self.controller.stop() {
                warn!(error = %e, "stream did not stop cleanly on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimulatedTransport;
    use crate::trigger::ManualTrigger;

    fn device() -> CaptureDevice {
        CaptureDevice::new(
            &Config::default(),
            Arc::new(SimulatedTransport::new(Duration::ZERO, None)),
            Box::new(ManualTrigger::new()),
        )
        .unwrap()
    }

    #[test]
    fn capabilities_describe_the_sensor() {
        let caps = device().query_capabilities();
        assert_eq!(caps.driver, "tofcap");
        assert_eq!(caps.card, "tof");
        assert_eq!(caps.bus_info, "spi:simulated");
        assert!(caps.streaming);
        assert!(caps.read_write);
        assert_eq!((caps.min_buffers, caps.max_buffers), (2, 16));
        assert_eq!(caps.formats, vec![PixelFormat::Argb32]);
    }

    #[test]
    fn try_format_does_not_commit() {
        let dev = device();
        let adjusted = dev.try_format(100, 500, PixelFormat::Argb32);
        assert_eq!((adjusted.width, adjusted.height), (80, 240));
        assert_eq!(dev.format(), None);
    }

    #[test]
    fn allocation_clamps_count() {
        let dev = device();
        assert_eq!(dev.allocate_buffers(4).unwrap_err(), QueueError::NoFormat);
        dev.negotiate_format(80, 60, PixelFormat::Argb32).unwrap();

        let few = dev.allocate_buffers(1).unwrap();
        assert_eq!(few.len(), 2);
        assert!(few.iter().all(|b| b.capacity() == 1024 * 60));
        assert_eq!(dev.allocate_buffers(100).unwrap().len(), 16);
    }

    #[test]
    fn submit_checks_buffer_size_and_returns_buffer() {
        let dev = device();
        let err = dev.submit(FrameBuffer::zeroed(0, 16)).unwrap_err();
        assert_eq!(err.error, QueueError::NoFormat);

        dev.negotiate_format(80, 2, PixelFormat::Argb32).unwrap();
        let err = dev.submit(FrameBuffer::zeroed(3, 100)).unwrap_err();
        assert_eq!(
            err.error,
            QueueError::BufferTooSmall {
                index: 3,
                len: 100,
                required: 2048
            }
        );
        assert_eq!(err.into_buffer().index(), 3);
        assert_eq!(dev.queue_depth(), 0);
        assert_eq!(dev.custody(3), Some(Custody::Consumer));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.stream.min_queued = 1;
        assert!(CaptureDevice::new(
            &config,
            Arc::new(SimulatedTransport::new(Duration::ZERO, None)),
            Box::new(ManualTrigger::new()),
        )
        .is_err());
    }
}
