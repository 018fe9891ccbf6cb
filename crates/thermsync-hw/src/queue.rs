//! Bounded single-producer/single-consumer queue for radiometric frames.
//!
//! The producer half lives on the driver's callback thread and never blocks:
//! a frame that arrives while the queue is full is dropped. The consumer half
//! is owned by the thermal adapter on the capture thread and waits with a
//! timeout.

use crate::frame::RawThermalFrame;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// Default queue depth. The pipeline wants the freshest frame, not a backlog.
pub const QUEUE_CAPACITY: usize = 2;

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Queue was at capacity; the frame was discarded.
    Dropped,
    /// Consumer is gone; the frame was discarded.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DequeueError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("frame producer disconnected")]
    Disconnected,
}

/// Create a connected producer/consumer pair with the given capacity.
pub fn frame_queue(capacity: usize) -> (FrameProducer, FrameConsumer) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (FrameProducer { tx }, FrameConsumer { rx })
}

/// Producer half. Deliberately not `Clone`: there is exactly one producer.
pub struct FrameProducer {
    tx: Sender<RawThermalFrame>,
}

impl FrameProducer {
    /// Enqueue without blocking; drops the frame if the queue is full.
    pub fn enqueue(&self, frame: RawThermalFrame) -> Enqueued {
        match self.tx.try_send(frame) {
            Ok(()) => Enqueued::Accepted,
            Err(TrySendError::Full(_)) => Enqueued::Dropped,
            Err(TrySendError::Disconnected(_)) => Enqueued::Disconnected,
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer half. Deliberately not `Clone`: there is exactly one consumer.
pub struct FrameConsumer {
    rx: Receiver<RawThermalFrame>,
}

impl FrameConsumer {
    /// Block up to `timeout` for the next frame, in FIFO order.
    pub fn dequeue(&self, timeout: Duration) -> Result<RawThermalFrame, DequeueError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => DequeueError::Timeout(timeout),
            RecvTimeoutError::Disconnected => DequeueError::Disconnected,
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(QUEUE_CAPACITY)
    }
}
