pub mod completion;
pub mod ringbuf;
pub mod stats;

pub use completion::{completion_channel, CompletionReceiver, CompletionSender};
pub use self::ringbuf::PendingRing;
pub use stats::CaptureStats;
