//! Lock-free capture counters written from the trigger path

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;

use crate::Metrics;

/// Counters shared by the engine, the queue and the controller.
#[derive(Default)]
pub struct CaptureStats {
    counters: CachePadded<Counters>,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    transfer_errors: AtomicU64,
    underruns: AtomicU64,
    overlapped: AtomicU64,
    disarmed: AtomicU64,
    cancelled: AtomicU64,
    lost: AtomicU64,
    transfer_us_total: AtomicU64,
    transfer_us_max: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transfer(&self, elapsed: Duration, ok: bool) {
        let c = &self.counters;
        if ok {
            c.captured.fetch_add(1, Ordering::Relaxed);
        } else {
            c.transfer_errors.fetch_add(1, Ordering::Relaxed);
        }
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        c.transfer_us_total.fetch_add(us, Ordering::Relaxed);
        c.transfer_us_max.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_underrun(&self) {
        self.counters.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overlap(&self) {
        self.counters.overlapped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disarmed(&self) {
        self.counters.disarmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self, count: usize) {
        self.counters
            .cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_lost(&self) {
        self.counters.lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Metrics {
        let c = &self.counters;
        let captured = c.captured.load(Ordering::Relaxed);
        let transfer_errors = c.transfer_errors.load(Ordering::Relaxed);
        let transfers = captured + transfer_errors;
        let total_us = c.transfer_us_total.load(Ordering::Relaxed);
        Metrics {
            captured_frames: captured,
            transfer_errors,
            underruns: c.underruns.load(Ordering::Relaxed),
            overlapped_edges: c.overlapped.load(Ordering::Relaxed),
            disarmed_edges: c.disarmed.load(Ordering::Relaxed),
            cancelled_frames: c.cancelled.load(Ordering::Relaxed),
            lost_deliveries: c.lost.load(Ordering::Relaxed),
            avg_transfer_us: if transfers == 0 { 0 } else { total_us / transfers },
            max_transfer_us: c.transfer_us_max.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_averages_over_all_transfers() {
        let stats = CaptureStats::new();
        stats.record_transfer(Duration::from_micros(100), true);
        stats.record_transfer(Duration::from_micros(300), false);
        stats.record_underrun();
        stats.record_cancelled(3);

        let m = stats.snapshot();
        assert_eq!(m.captured_frames, 1);
        assert_eq!(m.transfer_errors, 1);
        assert_eq!(m.underruns, 1);
        assert_eq!(m.cancelled_frames, 3);
        assert_eq!(m.avg_transfer_us, 200);
        assert_eq!(m.max_transfer_us, 300);
    }

    #[test]
    fn empty_snapshot_has_no_average() {
        assert_eq!(CaptureStats::new().snapshot(), Metrics::default());
    }
}
