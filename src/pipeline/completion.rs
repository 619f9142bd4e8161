//! Completion channel: the only path by which buffers return to the consumer

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::capture::frame::FrameBuffer;
use crate::error::DequeueError;

/// Create a completion channel able to hold `capacity` buffers.
///
/// Capacity matches the buffer slot table. An index stays out of the
/// consumer's hands until its completion is dequeued, so the channel never
/// holds more than one buffer per slot and a delivery can only fail if the
/// receiver is gone.
pub fn completion_channel(capacity: usize) -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    (CompletionSender { tx }, CompletionReceiver { rx })
}

#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<FrameBuffer>,
}

impl CompletionSender {
    /// Non-blocking hand-off. Returns the buffer if it could not be delivered.
    pub fn deliver(&self, buffer: FrameBuffer) -> Result<(), FrameBuffer> {
        self.tx.try_send(buffer).map_err(|e| e.into_inner())
    }
}

pub struct CompletionReceiver {
    rx: Receiver<FrameBuffer>,
}

impl CompletionReceiver {
    pub fn recv(&self) -> Result<FrameBuffer, DequeueError> {
        self.rx.recv().map_err(|_| DequeueError::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<FrameBuffer, DequeueError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => DequeueError::Timeout,
            RecvTimeoutError::Disconnected => DequeueError::Disconnected,
        })
    }

    pub fn try_recv(&self) -> Option<FrameBuffer> {
        match self.rx.try_recv() {
            Ok(buffer) => Some(buffer),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub async fn recv_async(&self) -> Result<FrameBuffer, DequeueError> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| DequeueError::Disconnected)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_order() {
        let (tx, rx) = completion_channel(4);
        tx.deliver(FrameBuffer::zeroed(2, 4)).unwrap();
        tx.deliver(FrameBuffer::zeroed(0, 4)).unwrap();
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.recv().unwrap().index(), 2);
        assert_eq!(rx.try_recv().unwrap().index(), 0);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn times_out_when_idle() {
        let (_tx, rx) = completion_channel(1);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(5)).unwrap_err(),
            DequeueError::Timeout
        );
    }

    #[test]
    fn dropped_receiver_returns_buffer() {
        let (tx, rx) = completion_channel(1);
        drop(rx);
        let back = tx.deliver(FrameBuffer::zeroed(5, 4)).unwrap_err();
        assert_eq!(back.index(), 5);
    }
}
