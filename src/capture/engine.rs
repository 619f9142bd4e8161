//! Per-edge capture: claim, transfer, complete.
//!
//! Runs in the trigger context. Nothing here blocks, allocates or logs above
//! `trace` on the success path; the queue lock is only spun on for the
//! claim and the completion, never across the bus transfer.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use tracing::{trace, warn};

use crate::bus::{BusTransport, TransferSettings};
use crate::capture::frame::FrameFault;
use crate::capture::queue::{CaptureQueue, Claim};
use crate::error::TransportError;
use crate::pipeline::CaptureStats;
use crate::trigger::{EdgeHandler, EdgeOutcome};

pub struct CaptureEngine {
    queue: Arc<CaptureQueue>,
    transport: Arc<dyn BusTransport>,
    settings: ArcSwapOption<TransferSettings>,
    stats: Arc<CaptureStats>,
}

impl CaptureEngine {
    pub fn new(
        queue: Arc<CaptureQueue>,
        transport: Arc<dyn BusTransport>,
        stats: Arc<CaptureStats>,
    ) -> Self {
        Self {
            queue,
            transport,
            settings: ArcSwapOption::empty(),
            stats,
        }
    }

    /// Install the transfer parameters for the next stream generation.
    pub fn load_settings(&self, settings: TransferSettings) {
        self.settings.store(Some(Arc::new(settings)));
    }

    pub fn clear_settings(&self) {
        self.settings.store(None);
    }

    pub fn settings(&self) -> Option<TransferSettings> {
        self.settings.load().as_deref().copied()
    }

    /// Handle one trigger edge seen in trigger `epoch`.
    pub fn capture_once(&self, epoch: u64) -> EdgeOutcome {
        let mut buffer = match self.queue.claim_next(epoch) {
            Claim::Buffer(buffer) => buffer,
            Claim::Underrun => {
                self.stats.record_underrun();
                trace!("underrun: no buffer queued");
                return EdgeOutcome::Underrun;
            }
            Claim::Busy => {
                self.stats.record_overlap();
                return EdgeOutcome::Overlapped;
            }
            Claim::Disarmed => {
                self.stats.record_disarmed();
                return EdgeOutcome::Disarmed;
            }
        };
        let index = buffer.index();
        let sequence = buffer.sequence().unwrap_or_default();
        let started = Instant::now();

        let settings = self.settings.load();
        let result = match settings.as_deref() {
            Some(settings) if settings.length <= buffer.capacity() => {
                let len = settings.length;
                self.transport
                    .transfer(&mut buffer.memory_mut()[..len], settings)
                    .map(|()| len)
            }
            Some(settings) => Err(TransportError::ShortTransfer {
                expected: settings.length,
                actual: buffer.capacity(),
            }),
            None => Err(TransportError::NotConfigured),
        };

        let finished = Instant::now();
        let ok = result.is_ok();
        match result {
            Ok(len) => buffer.mark_done(len, finished),
            Err(e) => {
                warn!(index, sequence, error = %e, "transfer failed");
                buffer.mark_error(FrameFault::Transport(e), finished);
            }
        }
        self.stats.record_transfer(finished - started, ok);
        trace!(index, sequence, ok, "buffer done");

        self.queue.complete(buffer);
        EdgeOutcome::Captured {
            index,
            sequence,
            ok,
        }
    }
}

impl EdgeHandler for CaptureEngine {
    fn on_edge(&self, epoch: u64) -> EdgeOutcome {
        self.capture_once(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimulatedTransport;
    use crate::capture::frame::{BufferState, FrameBuffer};
    use crate::pipeline::{completion_channel, CompletionReceiver};
    use std::time::Duration;

    fn engine(
        transport: SimulatedTransport,
    ) -> (CaptureEngine, Arc<CaptureQueue>, CompletionReceiver, Arc<CaptureStats>) {
        let (tx, rx) = completion_channel(4);
        let stats = Arc::new(CaptureStats::new());
        let queue = Arc::new(CaptureQueue::new(4, tx, stats.clone()));
        let engine = CaptureEngine::new(queue.clone(), Arc::new(transport), stats.clone());
        engine.load_settings(TransferSettings {
            length: 64,
            clock_hz: 18_000_000,
            bits_per_word: 32,
        });
        (engine, queue, rx, stats)
    }

    #[test]
    fn successful_edge_delivers_done_buffer() {
        let (engine, queue, rx, stats) = engine(SimulatedTransport::new(Duration::ZERO, None));
        queue.submit(FrameBuffer::zeroed(0, 128)).unwrap();
        queue.arm(0);

        assert_eq!(
            engine.on_edge(0),
            EdgeOutcome::Captured {
                index: 0,
                sequence: 0,
                ok: true
            }
        );
        let b = rx.try_recv().unwrap();
        assert_eq!(b.state(), BufferState::Done);
        assert_eq!(b.data().len(), 64);
        assert_eq!(SimulatedTransport::transfer_number(b.data()), Some(1));
        assert!(b.timestamp().is_some());
        assert_eq!(stats.snapshot().captured_frames, 1);
    }

    #[test]
    fn transport_failure_marks_error_and_stream_continues() {
        let (engine, queue, rx, stats) = engine(SimulatedTransport::new(Duration::ZERO, Some(1)));
        queue.submit(FrameBuffer::zeroed(0, 64)).unwrap();
        queue.submit(FrameBuffer::zeroed(1, 64)).unwrap();
        queue.arm(0);

        engine.on_edge(0);
        engine.on_edge(0);
        for (i, seq) in [(0, 0), (1, 1)] {
            let b = rx.try_recv().unwrap();
            assert_eq!(b.index(), i);
            assert_eq!(b.sequence(), Some(seq));
            assert_eq!(b.state(), BufferState::Error);
            assert_eq!(
                b.fault(),
                Some(FrameFault::Transport(TransportError::Timeout))
            );
        }
        assert_eq!(stats.snapshot().transfer_errors, 2);
        assert!(queue.is_idle());
    }

    #[test]
    fn underrun_is_counted_not_delivered() {
        let (engine, queue, rx, stats) = engine(SimulatedTransport::new(Duration::ZERO, None));
        queue.arm(0);
        assert_eq!(engine.on_edge(0), EdgeOutcome::Underrun);
        assert_eq!(engine.on_edge(0), EdgeOutcome::Underrun);
        assert!(rx.is_empty());
        assert_eq!(stats.snapshot().underruns, 2);
    }

    #[test]
    fn disarmed_edge_leaves_queue_untouched() {
        let (engine, queue, rx, stats) = engine(SimulatedTransport::new(Duration::ZERO, None));
        queue.submit(FrameBuffer::zeroed(0, 64)).unwrap();
        assert_eq!(engine.on_edge(0), EdgeOutcome::Disarmed);
        assert_eq!(queue.depth(), 1);
        assert!(rx.is_empty());
        assert_eq!(stats.snapshot().disarmed_edges, 1);
    }

    #[test]
    fn edge_from_an_earlier_epoch_claims_nothing() {
        let (engine, queue, rx, stats) = engine(SimulatedTransport::new(Duration::ZERO, None));
        queue.submit(FrameBuffer::zeroed(0, 64)).unwrap();
        queue.arm(3);
        assert_eq!(engine.on_edge(2), EdgeOutcome::Disarmed);
        assert_eq!(queue.depth(), 1);
        assert!(rx.is_empty());
        assert_eq!(stats.snapshot().disarmed_edges, 1);

        assert!(matches!(
            engine.on_edge(3),
            EdgeOutcome::Captured { sequence: 0, .. }
        ));
    }

    #[test]
    fn undersized_buffer_fails_without_touching_the_bus() {
        let transport = SimulatedTransport::new(Duration::ZERO, None);
        let (engine, queue, rx, _) = engine(transport);
        queue.submit(FrameBuffer::zeroed(2, 16)).unwrap();
        queue.arm(0);
        engine.on_edge(0);
        let b = rx.try_recv().unwrap();
        assert_eq!(
            b.fault(),
            Some(FrameFault::Transport(TransportError::ShortTransfer {
                expected: 64,
                actual: 16
            }))
        );
    }

    #[test]
    fn missing_settings_fail_the_buffer() {
        let (engine, queue, rx, _) = engine(SimulatedTransport::new(Duration::ZERO, None));
        engine.clear_settings();
        queue.submit(FrameBuffer::zeroed(0, 64)).unwrap();
        queue.arm(0);
        engine.on_edge(0);
        assert_eq!(
            rx.try_recv().unwrap().fault(),
            Some(FrameFault::Transport(TransportError::NotConfigured))
        );
    }
}
