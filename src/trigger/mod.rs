//! Trigger sources: deliver one call to the capture engine per edge.

#[cfg(all(feature = "linux-hw", target_os = "linux"))]
pub mod gpio;
pub mod interval;
pub mod manual;

#[cfg(all(feature = "linux-hw", target_os = "linux"))]
pub use gpio::GpioEdgeTrigger;
pub use interval::IntervalTrigger;
pub use manual::ManualTrigger;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::error::TriggerError;

/// What one edge did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    Captured { index: u32, sequence: u64, ok: bool },
    Underrun,
    /// A transfer was still active.
    Overlapped,
    /// The stream was not armed.
    Disarmed,
}

/// Receives edges. Runs in the non-blocking trigger context.
///
/// `epoch` is the trigger epoch observed when the edge passed the gate. An
/// edge that passed before a `disable()` carries an older epoch than any
/// edge of the next enable period.
pub trait EdgeHandler: Send + Sync {
    fn on_edge(&self, epoch: u64) -> EdgeOutcome;
}

/// A hardware or software edge source.
///
/// After `enable()` every edge invokes the attached handler once. Once
/// `disable()` returns no new edge is dispatched; an edge dispatched just
/// before may still be running, which the capture queue fences by
/// disarming and by comparing epochs.
pub trait TriggerSource: Send + Sync {
    fn attach(&self, handler: Arc<dyn EdgeHandler>) -> Result<(), TriggerError>;

    fn enable(&self) -> Result<(), TriggerError>;

    fn disable(&self);

    /// Current epoch. Advances on every `disable()` of an enabled source and
    /// is stable while disabled.
    fn epoch(&self) -> u64;

    fn name(&self) -> &str;
}

/// Shared enable gate and handler slot used by every trigger source.
///
/// The gate word packs `epoch << 1 | enabled` so an edge reads both in one
/// load.
#[derive(Default)]
pub(crate) struct EdgeLine {
    handler: OnceCell<Arc<dyn EdgeHandler>>,
    gate: AtomicU64,
}

impl EdgeLine {
    pub(crate) fn attach(&self, handler: Arc<dyn EdgeHandler>) -> Result<(), TriggerError> {
        self.handler
            .set(handler)
            .map_err(|_| TriggerError::AlreadyAttached)
    }

    pub(crate) fn enable(&self) -> Result<(), TriggerError> {
        if self.handler.get().is_none() {
            return Err(TriggerError::NotAttached);
        }
        self.gate.fetch_or(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn disable(&self) {
        let _ = self
            .gate
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                (word & 1 == 1).then(|| ((word >> 1) + 1) << 1)
            });
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.gate.load(Ordering::SeqCst) & 1 == 1
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.gate.load(Ordering::SeqCst) >> 1
    }

    /// Deliver one edge. `None` when disabled.
    pub(crate) fn dispatch(&self) -> Option<EdgeOutcome> {
        let word = self.gate.load(Ordering::SeqCst);
        if word & 1 == 0 {
            return None;
        }
        self.handler.get().map(|handler| handler.on_edge(word >> 1))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts edges and reports underruns.
    #[derive(Default)]
    pub(crate) struct CountingHandler {
        pub(crate) edges: AtomicUsize,
    }

    impl EdgeHandler for CountingHandler {
        fn on_edge(&self, _epoch: u64) -> EdgeOutcome {
            self.edges.fetch_add(1, Ordering::SeqCst);
            EdgeOutcome::Underrun
        }
    }

    #[test]
    fn enable_requires_a_handler() {
        let line = EdgeLine::default();
        assert!(matches!(line.enable(), Err(TriggerError::NotAttached)));
    }

    #[test]
    fn dispatch_follows_the_gate() {
        let line = EdgeLine::default();
        let handler = Arc::new(CountingHandler::default());
        line.attach(handler.clone()).unwrap();
        assert_eq!(line.dispatch(), None);
        line.enable().unwrap();
        assert_eq!(line.dispatch(), Some(EdgeOutcome::Underrun));
        line.disable();
        assert_eq!(line.dispatch(), None);
        assert_eq!(handler.edges.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn epoch_advances_once_per_enabled_period() {
        let line = EdgeLine::default();
        line.attach(Arc::new(CountingHandler::default())).unwrap();
        assert_eq!(line.epoch(), 0);
        line.disable();
        assert_eq!(line.epoch(), 0);

        line.enable().unwrap();
        line.enable().unwrap();
        assert!(line.is_enabled());
        assert_eq!(line.epoch(), 0);
        line.disable();
        assert!(!line.is_enabled());
        assert_eq!(line.epoch(), 1);
        line.disable();
        assert_eq!(line.epoch(), 1);
    }

    #[test]
    fn second_attach_is_refused() {
        let line = EdgeLine::default();
        line.attach(Arc::new(CountingHandler::default())).unwrap();
        assert!(matches!(
            line.attach(Arc::new(CountingHandler::default())),
            Err(TriggerError::AlreadyAttached)
        ));
    }
}
