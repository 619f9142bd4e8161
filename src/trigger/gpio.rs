//! Frame-sync edge from a sysfs GPIO line

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::TriggerError;
use crate::trigger::{EdgeHandler, EdgeLine, TriggerSource};

/// How often the edge thread rechecks its stop flag.
const POLL_INTERVAL_MS: u16 = 100;

/// Rising edges on an exported sysfs GPIO, waited for with `poll(POLLPRI)`.
pub struct GpioEdgeTrigger {
    line_number: u32,
    root: PathBuf,
    pin_core: Option<usize>,
    line: Arc<EdgeLine>,
    stop: Mutex<Option<Arc<AtomicBool>>>,
}

impl GpioEdgeTrigger {
    pub fn new(line_number: u32) -> Self {
        Self::with_root(line_number, "/sys/class/gpio")
    }

    pub fn with_root(line_number: u32, root: impl Into<PathBuf>) -> Self {
        Self {
            line_number,
            root: root.into(),
            pin_core: None,
            line: Arc::new(EdgeLine::default()),
            stop: Mutex::new(None),
        }
    }

    pub fn pinned(mut self, core: Option<usize>) -> Self {
        self.pin_core = core;
        self
    }

    fn gpio_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.line_number))
    }

    /// Export the line if needed and configure it as a rising-edge input.
    #[instrument(skip(self), fields(line = self.line_number))]
    fn configure(&self) -> Result<File, TriggerError> {
        let dir = self.gpio_dir();
        if !dir.exists() {
            fs::write(self.root.join("export"), self.line_number.to_string())?;
            debug!("gpio exported");
        }
        fs::write(dir.join("direction"), "in")?;
        fs::write(dir.join("edge"), "rising")?;
        let mut value = File::open(dir.join("value"))?;
        // consume the initial level so the first poll waits for a real edge
        let mut scratch = [0u8; 8];
        let _ = value.read(&mut scratch)?;
        Ok(value)
    }

    fn spawn(&self, value: File) -> Result<Arc<AtomicBool>, TriggerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let line = self.line.clone();
        let thread_stop = stop.clone();
        let pin_core = self.pin_core;
        let number = self.line_number;

        thread::Builder::new()
            .name(format!("tofcap-gpio{number}"))
            .spawn(move || {
                if let Some(id) = pin_core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!(core = id, "could not pin gpio trigger thread");
                    }
                }
                edge_loop(&value, &line, &thread_stop);
                debug!(line = number, "gpio trigger thread exiting");
            })?;
        Ok(stop)
    }
}

fn edge_loop(value: &File, line: &EdgeLine, stop: &AtomicBool) {
    let mut scratch = [0u8; 8];
    let mut fds = [PollFd::new(
        value.as_fd(),
        PollFlags::POLLPRI | PollFlags::POLLERR,
    )];
    while !stop.load(Ordering::Acquire) {
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => continue,
            Ok(_) => {
                // re-read the value to clear the pending edge
                let mut file = value;
                if file.seek(SeekFrom::Start(0)).is_err() || file.read(&mut scratch).is_err() {
                    warn!("failed to acknowledge gpio edge");
                }
                if !stop.load(Ordering::Acquire) {
                    line.dispatch();
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "gpio poll failed; edge thread stopping");
                break;
            }
        }
    }
}

impl TriggerSource for GpioEdgeTrigger {
    fn attach(&self, handler: Arc<dyn EdgeHandler>) -> Result<(), TriggerError> {
        self.line.attach(handler)
    }

    fn enable(&self) -> Result<(), TriggerError> {
        self.line.enable()?;
        let mut running = self.stop.lock();
        if running.is_none() {
            match self.configure().and_then(|value| self.spawn(value)) {
                Ok(stop) => *running = Some(stop),
                Err(e) => {
                    self.line.disable();
                    return Err(e);
                }
            }
            info!(line = self.line_number, "gpio trigger armed");
        }
        Ok(())
    }

    fn disable(&self) {
        self.line.disable();
        if let Some(stop) = self.stop.lock().take() {
            stop.store(true, Ordering::Release);
        }
    }

    fn epoch(&self) -> u64 {
        self.line.epoch()
    }

    fn name(&self) -> &str {
        "gpio"
    }
}

impl Drop for GpioEdgeTrigger {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpio_directory_follows_line_number() {
        let trigger = GpioEdgeTrigger::with_root(17, "/tmp/gpio-root");
        assert_eq!(trigger.gpio_dir(), PathBuf::from("/tmp/gpio-root/gpio17"));
    }

    #[test]
    fn enable_fails_cleanly_without_sysfs() {
        let trigger = GpioEdgeTrigger::with_root(3, "/nonexistent/tofcap-gpio");
        trigger
            .attach(Arc::new(crate::trigger::tests::CountingHandler::default()))
            .unwrap();
        assert!(matches!(trigger.enable(), Err(TriggerError::Io(_))));
        assert!(trigger.stop.lock().is_none());
        assert!(!trigger.line.is_enabled());
    }
}
