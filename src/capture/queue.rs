//! Pending-buffer queue shared by the submission API and the trigger path.
//!
//! One short-hold lock covers the pending FIFO, the per-index custody
//! table, the in-flight slot, the arming flag and the stream sequence
//! counter, so a buffer's custody changes atomically with every state read.
//! Process-context callers take the lock normally; the trigger path only
//! ever spins on `try_lock`, and nothing holds the lock across a bus
//! transfer or a wait.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::capture::frame::{FrameBuffer, FrameFault};
use crate::error::{QueueError, SubmitError};
use crate::pipeline::{CaptureStats, CompletionSender, PendingRing};

/// Which component holds a buffer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Custody {
    Consumer,
    Queued,
    Active,
    /// In the completion channel, not yet dequeued.
    Delivered,
}

/// Result of a claim attempt from the trigger path.
#[derive(Debug)]
pub enum Claim {
    Buffer(FrameBuffer),
    /// Pending queue empty.
    Underrun,
    /// A transfer is still active.
    Busy,
    /// Stream is not armed (never started, or stop has begun), or the edge
    /// belongs to an earlier trigger epoch.
    Disarmed,
}

struct Inner {
    pending: PendingRing,
    custody: Vec<Custody>,
    in_flight: Option<u32>,
    armed: bool,
    epoch: u64,
    next_sequence: u64,
}

pub struct CaptureQueue {
    inner: Mutex<Inner>,
    drained: Condvar,
    completion: CompletionSender,
    stats: Arc<CaptureStats>,
}

impl CaptureQueue {
    /// `capacity` is the number of buffer slots (indices `0..capacity`).
    pub fn new(capacity: usize, completion: CompletionSender, stats: Arc<CaptureStats>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: PendingRing::new(capacity),
                custody: vec![Custody::Consumer; capacity],
                in_flight: None,
                armed: false,
                epoch: 0,
                next_sequence: 0,
            }),
            drained: Condvar::new(),
            completion,
            stats,
        }
    }

    /// Append a buffer to the tail of the pending queue.
    pub fn submit(&self, mut buffer: FrameBuffer) -> Result<(), SubmitError> {
        let mut inner = self.inner.lock();
        let index = buffer.index();
        let capacity = inner.custody.len();
        let slot = match inner.custody.get(index as usize) {
            Some(slot) => *slot,
            None => {
                return Err(SubmitError {
                    error: QueueError::IndexOutOfRange { index, capacity },
                    buffer,
                })
            }
        };
        if slot != Custody::Consumer {
            return Err(SubmitError {
                error: QueueError::AlreadyQueued { index },
                buffer,
            });
        }

        buffer.mark_queued();
        if let Err(buffer) = inner.pending.push(buffer) {
            // custody table and ring have the same capacity, so a free
            // slot always has room; a full ring means a duplicate index
            return Err(SubmitError {
                error: QueueError::AlreadyQueued { index },
                buffer,
            });
        }
        inner.custody[index as usize] = Custody::Queued;
        trace!(index, depth = inner.pending.len(), "buffer queued");
        Ok(())
    }

    /// Pop the head for capture on behalf of an edge from trigger `epoch`.
    /// Trigger-path safe: spins, never blocks or allocates. On success the
    /// buffer is ACTIVE with its sequence stamped.
    pub fn claim_next(&self, epoch: u64) -> Claim {
        let mut inner = self.lock_spinning();
        if !inner.armed || inner.epoch != epoch {
            return Claim::Disarmed;
        }
        if inner.in_flight.is_some() {
            return Claim::Busy;
        }
        let Some(mut buffer) = inner.pending.pop() else {
            return Claim::Underrun;
        };
        let index = buffer.index();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.custody[index as usize] = Custody::Active;
        inner.in_flight = Some(index);
        buffer.mark_active(sequence, Instant::now());
        Claim::Buffer(buffer)
    }

    /// Return a finished in-flight buffer to the consumer. Trigger-path safe.
    pub fn complete(&self, buffer: FrameBuffer) {
        let index = buffer.index();
        {
            let mut inner = self.lock_spinning();
            debug_assert_eq!(inner.in_flight, Some(index));
            inner.in_flight = None;
            // delivered under the lock so a concurrent flush cannot overtake it
            let custody = self.deliver(buffer);
            if let Some(slot) = inner.custody.get_mut(index as usize) {
                *slot = custody;
            }
        }
        self.drained.notify_all();
    }

    /// Cancel every queued buffer with `reason` and hand each back through
    /// the completion channel, oldest first. Returns how many were flushed.
    pub fn flush_all(&self, reason: FrameFault) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut flushed = 0;
        while let Some(mut buffer) = inner.pending.pop() {
            let index = buffer.index();
            buffer.mark_error(reason, now);
            inner.custody[index as usize] = self.deliver(buffer);
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed, ?reason, "pending queue flushed");
        }
        flushed
    }

    /// Record that the consumer dequeued `buffer`. Its index may be
    /// submitted again from here on.
    pub fn reclaim(&self, buffer: FrameBuffer) -> FrameBuffer {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.custody.get_mut(buffer.index() as usize) {
            if *slot == Custody::Delivered {
                *slot = Custody::Consumer;
            }
        }
        buffer
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn in_flight(&self) -> Option<u32> {
        self.inner.lock().in_flight
    }

    pub fn custody(&self, index: u32) -> Option<Custody> {
        self.inner.lock().custody.get(index as usize).copied()
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().armed
    }

    /// Open a new stream generation for edges of trigger `epoch`: claims
    /// are allowed and sequence numbering restarts at zero.
    pub fn arm(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        inner.armed = true;
        inner.epoch = epoch;
        inner.next_sequence = 0;
    }

    /// Refuse further claims. A claim already made stays in flight.
    pub fn disarm(&self) {
        self.inner.lock().armed = false;
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending.is_empty() && inner.in_flight.is_none()
    }

    /// True when every index is held by the consumer. A completion still
    /// waiting to be dequeued does not count as held.
    pub fn is_quiescent(&self) -> bool {
        self.inner
            .lock()
            .custody
            .iter()
            .all(|slot| *slot == Custody::Consumer)
    }

    /// Block until no transfer is in flight or `deadline` passes.
    /// On timeout returns the index still in flight.
    pub fn wait_drained(&self, deadline: Instant) -> Result<(), u32> {
        let mut inner = self.inner.lock();
        while let Some(index) = inner.in_flight {
            if self.drained.wait_until(&mut inner, deadline).timed_out() {
                return match inner.in_flight {
                    Some(index) => {
                        warn!(index, "in-flight transfer missed the drain deadline");
                        Err(index)
                    }
                    None => Ok(()),
                };
            }
            trace!(index, "drain wake-up");
        }
        Ok(())
    }

    /// Hand a buffer to the completion channel and return the custody its
    /// index moves to. A buffer the channel refuses is gone for good.
    fn deliver(&self, buffer: FrameBuffer) -> Custody {
        match self.completion.deliver(buffer) {
            Ok(()) => Custody::Delivered,
            Err(lost) => {
                self.stats.record_lost();
                warn!(index = lost.index(), "completion receiver gone, buffer dropped");
                Custody::Consumer
            }
        }
    }

    fn lock_spinning(&self) -> MutexGuard<'_, Inner> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }
            backoff.spin();
        }
    }
}
