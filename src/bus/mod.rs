//! Synchronous serial bus transports that fill a frame buffer once triggered.

pub mod simulated;
#[cfg(all(feature = "linux-hw", target_os = "linux"))]
pub mod spidev;

pub use simulated::SimulatedTransport;
#[cfg(all(feature = "linux-hw", target_os = "linux"))]
pub use spidev::SpidevTransport;

use crate::error::TransportError;

/// Per-transfer bus parameters, fixed for a stream generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    /// Bytes to read into the buffer.
    pub length: usize,
    pub clock_hz: u32,
    pub bits_per_word: u8,
}

impl TransferSettings {
    pub fn word_bytes(&self) -> usize {
        usize::from(self.bits_per_word).div_ceil(8).max(1)
    }
}

/// A bus that reads one frame into `dst`.
///
/// Called from the trigger path: implementations must return within a
/// bounded time and must not re-enter the capture engine. Calls are already
/// serialized (one transfer in flight at a time).
pub trait BusTransport: Send + Sync {
    fn transfer(&self, dst: &mut [u8], settings: &TransferSettings) -> Result<(), TransportError>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_bytes_round_up() {
        let mut s = TransferSettings {
            length: 0,
            clock_hz: 1,
            bits_per_word: 32,
        };
        assert_eq!(s.word_bytes(), 4);
        s.bits_per_word = 12;
        assert_eq!(s.word_bytes(), 2);
        s.bits_per_word = 8;
        assert_eq!(s.word_bytes(), 1);
    }
}
