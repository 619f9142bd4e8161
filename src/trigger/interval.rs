//! Free-running timer trigger for sensors without a frame-sync line

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::TriggerError;
use crate::trigger::{EdgeHandler, EdgeLine, TriggerSource};

/// Fires edges at a fixed period on a dedicated thread.
pub struct IntervalTrigger {
    period: Duration,
    pin_core: Option<usize>,
    line: Arc<EdgeLine>,
    worker: Mutex<Option<Worker>>,
}

/// Handle on a running tick thread.
struct Worker {
    wake: Sender<()>,
    stopped: Arc<AtomicBool>,
}

impl IntervalTrigger {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            pin_core: None,
            line: Arc::new(EdgeLine::default()),
            worker: Mutex::new(None),
        }
    }

    pub fn with_fps(fps: u32) -> Self {
        Self::new(Duration::from_secs(1) / fps.max(1))
    }

    /// Pin the trigger thread to one CPU.
    pub fn pinned(mut self, core: Option<usize>) -> Self {
        self.pin_core = core;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn spawn(&self) -> Result<Worker, TriggerError> {
        let (wake, wake_rx) = bounded::<()>(1);
        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stopped = stopped.clone();
        let line = self.line.clone();
        let period = self.period;
        let pin_core = self.pin_core;

        thread::Builder::new()
            .name("tofcap-trigger".into())
            .spawn(move || {
                if let Some(id) = pin_core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!(core = id, "could not pin trigger thread");
                    }
                }
                tick_loop(&tick(period), &wake_rx, &thread_stopped, &line);
                debug!("interval trigger thread exiting");
            })?;
        Ok(Worker { wake, stopped })
    }
}

/// Dispatch one edge per tick until woken. A thread told to stop never
/// dispatches again, even if the line has since been re-enabled for its
/// successor.
fn tick_loop(
    ticker: &Receiver<Instant>,
    wake: &Receiver<()>,
    stopped: &AtomicBool,
    line: &EdgeLine,
) {
    loop {
        select! {
            recv(ticker) -> _ => {
                if stopped.load(Ordering::Acquire) {
                    break;
                }
                line.dispatch();
            }
            recv(wake) -> _ => break,
        }
    }
}

impl TriggerSource for IntervalTrigger {
    fn attach(&self, handler: Arc<dyn EdgeHandler>) -> Result<(), TriggerError> {
        self.line.attach(handler)
    }

    fn enable(&self) -> Result<(), TriggerError> {
        self.line.enable()?;
        let mut worker = self.worker.lock();
        if worker.is_none() {
            match self.spawn() {
                Ok(spawned) => *worker = Some(spawned),
                Err(e) => {
                    self.line.disable();
                    return Err(e);
                }
            }
            info!(period = ?self.period, "interval trigger started");
        }
        Ok(())
    }

    fn disable(&self) {
        self.line.disable();
        // Not joined: the thread may be inside a transfer that the
        // controller waits on separately.
        if let Some(worker) = self.worker.lock().take() {
            worker.stopped.store(true, Ordering::Release);
            let _ = worker.wake.try_send(());
        }
    }

    fn epoch(&self) -> u64 {
        self.line.epoch()
    }

    fn name(&self) -> &str {
        "interval"
    }
}

impl Drop for IntervalTrigger {
    fn drop(&mut self) {
        self.disable();
    }
}
