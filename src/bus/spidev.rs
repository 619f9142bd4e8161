//! Linux spidev transport
//!
//! Receive-only full-duplex transfers through `SPI_IOC_MESSAGE`. The
//! kernel caps a single message at the spidev `bufsiz` (4096 by default),
//! so a frame is read as consecutive word-aligned chunks.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::errno::Errno;
use tracing::{info, instrument};

use crate::bus::{BusTransport, TransferSettings};
use crate::error::{Error, TransportError};
use crate::BusConfig;

const SPI_IOC_MAGIC: u8 = b'k';

/// `struct spi_ioc_transfer` from `linux/spi/spidev.h`
#[repr(C)]
#[derive(Debug, Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

nix::ioctl_write_ptr!(spi_write_mode, SPI_IOC_MAGIC, 1, u8);
nix::ioctl_write_ptr!(spi_write_bits_per_word, SPI_IOC_MAGIC, 3, u8);
nix::ioctl_write_ptr!(spi_write_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
nix::ioctl_write_buf!(spi_message, SPI_IOC_MAGIC, 0, SpiIocTransfer);

pub struct SpidevTransport {
    file: File,
    path: String,
    max_chunk: usize,
}

impl SpidevTransport {
    /// Open and configure a spidev node (mode, word size, max clock).
    #[instrument(skip_all, fields(device = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, config: &BusConfig) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = file.as_raw_fd();

        let mode = config.mode;
        let bits = config.bits_per_word;
        let max_speed = config.max_clock_hz;
        // SAFETY: fd is open for the duration of each call and the pointers
        // reference live locals of the types the ioctls expect.
        unsafe {
            spi_write_mode(fd, &mode).map_err(io_error)?;
            spi_write_bits_per_word(fd, &bits).map_err(io_error)?;
            spi_write_max_speed_hz(fd, &max_speed).map_err(io_error)?;
        }

        info!(
            mode,
            bits_per_word = bits,
            max_speed_hz = max_speed,
            "SPI bus configured"
        );

        Ok(Self {
            file,
            path: path.display().to_string(),
            max_chunk: config.max_transfer_bytes.max(4),
        })
    }
}

fn io_error(errno: Errno) -> Error {
    Error::Io(std::io::Error::from(errno))
}

impl BusTransport for SpidevTransport {
    fn transfer(&self, dst: &mut [u8], settings: &TransferSettings) -> Result<(), TransportError> {
        let word_bytes = settings.word_bytes();
        if dst.is_empty() || dst.len() % word_bytes != 0 {
            return Err(TransportError::InvalidLength {
                len: dst.len(),
                word_bytes,
            });
        }

        let expected = dst.len();
        let chunk = (self.max_chunk - self.max_chunk % word_bytes).max(word_bytes);
        let fd = self.file.as_raw_fd();
        let mut received = 0;
        for piece in dst.chunks_mut(chunk) {
            let xfer = SpiIocTransfer {
                rx_buf: piece.as_mut_ptr() as u64,
                len: piece.len() as u32,
                speed_hz: settings.clock_hz,
                bits_per_word: settings.bits_per_word,
                ..Default::default()
            };
            // SAFETY: rx_buf points at `piece`, which stays mutably borrowed
            // and valid for `len` bytes until the ioctl returns; tx_buf is 0
            // so the kernel clocks out zeros.
            let n = unsafe { spi_message(fd, std::slice::from_ref(&xfer)) }
                .map_err(TransportError::Io)?;
            let n = usize::try_from(n).unwrap_or(0);
            if n < piece.len() {
                return Err(TransportError::ShortTransfer {
                    expected,
                    actual: received + n,
                });
            }
            received += piece.len();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_struct_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<SpiIocTransfer>(), 32);
    }
}
