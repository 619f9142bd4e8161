pub mod controller;
pub mod device;
pub mod engine;
pub mod format;
pub mod frame;
pub mod queue;

pub use controller::{StreamController, StreamState};
pub use device::CaptureDevice;
pub use engine::CaptureEngine;
pub use format::{Capabilities, NegotiatedFormat};
pub use frame::{BufferState, FrameBuffer, FrameFault, PixelFormat};
pub use queue::{CaptureQueue, Custody};
