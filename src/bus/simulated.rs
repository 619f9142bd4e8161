//! Stand-in transport for running the pipeline without hardware

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::bus::{BusTransport, TransferSettings};
use crate::error::TransportError;
use crate::BusConfig;

/// Fills buffers with a deterministic pattern.
///
/// Each 32-bit little-endian word holds the transfer number in the high
/// half and the word offset in the low half, so a consumer can check that
/// frames arrive whole and in order. Every `fail_every`-th transfer times
/// out instead.
pub struct SimulatedTransport {
    latency: Duration,
    fail_every: Option<u64>,
    transfers: AtomicU64,
}

impl SimulatedTransport {
    pub fn new(latency: Duration, fail_every: Option<u64>) -> Self {
        Self {
            latency,
            fail_every: fail_every.filter(|n| *n > 0),
            transfers: AtomicU64::new(0),
        }
    }

    pub fn from_config(bus: &BusConfig) -> Self {
        Self::new(Duration::from_micros(bus.sim_latency_us), bus.sim_fail_every)
    }

    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Decode the transfer number stamped into a filled buffer.
    pub fn transfer_number(data: &[u8]) -> Option<u16> {
        let word: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some((u32::from_le_bytes(word) >> 16) as u16)
    }
}

impl BusTransport for SimulatedTransport {
    fn transfer(&self, dst: &mut [u8], settings: &TransferSettings) -> Result<(), TransportError> {
        let n = self.transfers.fetch_add(1, Ordering::Relaxed) + 1;
        let word_bytes = settings.word_bytes();
        if dst.len() % word_bytes != 0 {
            return Err(TransportError::InvalidLength {
                len: dst.len(),
                word_bytes,
            });
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if self.fail_every.is_some_and(|k| n % k == 0) {
            return Err(TransportError::Timeout);
        }

        let high = (n as u32 & 0xffff) << 16;
        let mut words = dst.chunks_exact_mut(4);
        for (offset, word) in words.by_ref().enumerate() {
            word.copy_from_slice(&(high | (offset as u32 & 0xffff)).to_le_bytes());
        }
        words.into_remainder().fill(0);
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(length: usize) -> TransferSettings {
        TransferSettings {
            length,
            clock_hz: 18_000_000,
            bits_per_word: 32,
        }
    }

    #[test]
    fn stamps_transfer_number_and_offsets() {
        let t = SimulatedTransport::new(Duration::ZERO, None);
        let mut buf = vec![0u8; 16];
        t.transfer(&mut buf, &settings(16)).unwrap();
        t.transfer(&mut buf, &settings(16)).unwrap();
        assert_eq!(SimulatedTransport::transfer_number(&buf), Some(2));
        assert_eq!(u32::from_le_bytes(buf[12..16].try_into().unwrap()) & 0xffff, 3);
        assert_eq!(t.transfers(), 2);
    }

    #[test]
    fn injects_periodic_faults() {
        let t = SimulatedTransport::new(Duration::ZERO, Some(3));
        let mut buf = vec![0u8; 8];
        let results: Vec<bool> = (0..6)
            .map(|_| t.transfer(&mut buf, &settings(8)).is_ok())
            .collect();
        assert_eq!(results, vec![true, true, false, true, true, false]);
    }

    #[test]
    fn rejects_partial_words() {
        let t = SimulatedTransport::new(Duration::ZERO, None);
        let mut buf = vec![0u8; 6];
        assert_eq!(
            t.transfer(&mut buf, &settings(6)),
            Err(TransportError::InvalidLength {
                len: 6,
                word_bytes: 4
            })
        );
    }
}
