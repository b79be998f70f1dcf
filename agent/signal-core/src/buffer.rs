//! Bounded multi-producer/single-consumer queue of decoded samples.
//!
//! Producers are the bus adapters (one task per CAN interface, one for OBD);
//! the single consumer is the trigger engine. Backpressure policy is
//! drop-newest: a full queue drops the incoming frame and bumps a counter,
//! it never blocks the acquisition path.

use tokio::sync::mpsc;
use tracing::warn;

use crate::CollectedFrame;

/// Producer half. Cheap to clone, one per data source.
#[derive(Clone)]
pub struct SignalBufferTx {
    tx: mpsc::Sender<CollectedFrame>,
}

/// Consumer half, owned by the trigger engine.
pub struct SignalBufferRx {
    rx: mpsc::Receiver<CollectedFrame>,
}

/// Creates the shared signal buffer with the given capacity in frames.
pub fn signal_buffer(capacity: usize) -> (SignalBufferTx, SignalBufferRx) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SignalBufferTx { tx }, SignalBufferRx { rx })
}

impl SignalBufferTx {
    /// Pushes a frame without blocking. Returns false if the queue was full
    /// and the frame was dropped.
    pub fn push(&self, frame: CollectedFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("canflux.signal_buffer.drops").increment(1);
                warn!("signal buffer full, dropping newest frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("signal buffer consumer gone, dropping frame");
                false
            }
        }
    }
}

impl SignalBufferRx {
    /// Waits for the next frame. Returns `None` once all producers are gone.
    pub async fn recv(&mut self) -> Option<CollectedFrame> {
        self.rx.recv().await
    }

    /// Drains whatever is currently queued without waiting.
    pub fn drain_ready(&mut self, out: &mut Vec<CollectedFrame>) {
        while let Ok(frame) = self.rx.try_recv() {
            out.push(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Sample, SignalValue};

    fn frame(id: u32) -> CollectedFrame {
        CollectedFrame::Signals(vec![Sample::new(id, 0, SignalValue::Double(0.0))])
    }

    #[tokio::test]
    async fn drop_newest_when_full() {
        let (tx, mut rx) = signal_buffer(2);
        assert!(tx.push(frame(1)));
        assert!(tx.push(frame(2)));
        // Queue full: the newest frame is the one dropped.
        assert!(!tx.push(frame(3)));

        assert_eq!(rx.recv().await, Some(frame(1)));
        assert_eq!(rx.recv().await, Some(frame(2)));
    }

    #[tokio::test]
    async fn drain_ready_collects_queued_frames() {
        let (tx, mut rx) = signal_buffer(8);
        tx.push(frame(1));
        tx.push(frame(2));
        let mut out = Vec::new();
        rx.drain_ready(&mut out);
        assert_eq!(out.len(), 2);
        out.clear();
        rx.drain_ready(&mut out);
        assert!(out.is_empty());
    }
}
