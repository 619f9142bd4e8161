use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{Error, Result};

const MAX_BUS: u32 = 4;
const MAX_CHIP_SELECT: u32 = 4;

// Detected SPI device node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: PathBuf,
    pub bus: u32,
    pub chip_select: u32,
}

/// Find the first `spidevB.C` node, lowest bus then chip select first.
pub fn auto_detect_device() -> Result<FoundDevice> {
    auto_detect_in(Path::new("/dev"))
}

/// Scan `dir` instead of `/dev`.
pub fn auto_detect_in(dir: &Path) -> Result<FoundDevice> {
    info!(dir = %dir.display(), "auto-detecting SPI devices");

    for bus in 0..MAX_BUS {
        for chip_select in 0..MAX_CHIP_SELECT {
            let path = dir.join(format!("spidev{bus}.{chip_select}"));
            if !path.exists() {
                continue;
            }
            debug!(path = %path.display(), "found spidev node");
            return Ok(FoundDevice {
                path,
                bus,
                chip_select,
            });
        }
    }

    Err(Error::NoDevice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tofcap-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn picks_lowest_bus_and_chip_select() {
        let dir = scratch_dir("detect");
        fs::write(dir.join("spidev1.0"), b"").unwrap();
        fs::write(dir.join("spidev0.2"), b"").unwrap();

        let found = auto_detect_in(&dir).unwrap();
        assert_eq!((found.bus, found.chip_select), (0, 2));
        assert_eq!(found.path, dir.join("spidev0.2"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_directory_reports_no_device() {
        let dir = scratch_dir("empty");
        assert!(matches!(auto_detect_in(&dir), Err(Error::NoDevice)));
        fs::remove_dir_all(&dir).unwrap();
    }
}
