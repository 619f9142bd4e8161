use std::sync::Arc;

use crate::error::TriggerError;
use crate::trigger::{EdgeHandler, EdgeLine, EdgeOutcome, TriggerSource};

/// Software trigger: each `fire()` is one edge, run on the caller's thread.
///
/// Cloning yields another handle to the same line, so a caller can keep a
/// handle after passing one to the device.
#[derive(Clone, Default)]
pub struct ManualTrigger {
    line: Arc<EdgeLine>,
}

impl ManualTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one edge. `None` while disabled.
    pub fn fire(&self) -> Option<EdgeOutcome> {
        self.line.dispatch()
    }

    pub fn is_enabled(&self) -> bool {
        self.line.is_enabled()
    }
}

impl TriggerSource for ManualTrigger {
    fn attach(&self, handler: Arc<dyn EdgeHandler>) -> Result<(), TriggerError> {
        self.line.attach(handler)
    }

    fn enable(&self) -> Result<(), TriggerError> {
        self.line.enable()
    }

    fn disable(&self) {
        self.line.disable()
    }

    fn epoch(&self) -> u64 {
        self.line.epoch()
    }

    fn name(&self) -> &str {
        "manual"
    }
}
