//! Bounded userspace event queue
//!
//! Ring buffer readers push decoded records here and the collector drains
//! them at its own pace. Producers never wait: when the queue is full the
//! new record is dropped and counted, the same contract the kernel ring
//! buffers follow.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tcp_metrics_common::capture::{EventSink, Submit};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Producer handle of a bounded drop-on-full channel
///
/// Clones share the queue and the loss counter.
pub struct EventChannel<T> {
    tx: mpsc::Sender<T>,
    lost: Arc<AtomicU64>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            lost: Arc::clone(&self.lost),
        }
    }
}

impl<T> EventChannel<T> {
    /// Create a channel holding at most `capacity` undrained records
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        let channel = Self {
            tx,
            lost: Arc::new(AtomicU64::new(0)),
        };
        (channel, rx)
    }

    /// Records dropped so far
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Shared loss counter, readable after the producers are gone
    pub fn loss_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.lost)
    }
}

impl<T: Copy> EventSink<T> for EventChannel<T> {
    fn submit(&self, record: &T) -> Submit {
        match self.tx.try_send(*record) {
            Ok(()) => Submit::Delivered,
            // A closed receiver loses records just like a full one
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                Submit::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_submit_beyond_capacity_is_dropped() {
        let (channel, mut rx) = EventChannel::<u32>::bounded(3);

        for record in 0..3 {
            assert_eq!(channel.submit(&record), Submit::Delivered);
        }
        assert_eq!(channel.lost(), 0);

        assert_eq!(channel.submit(&99), Submit::Dropped);
        assert_eq!(channel.lost(), 1);

        let drained = drain(&mut rx);
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(!drained.contains(&99));
    }

    #[test]
    fn test_space_frees_up_after_drain() {
        let (channel, mut rx) = EventChannel::<u32>::bounded(1);

        channel.submit(&1);
        channel.submit(&2);
        assert_eq!(drain(&mut rx), vec![1]);

        assert_eq!(channel.submit(&3), Submit::Delivered);
        assert_eq!(drain(&mut rx), vec![3]);
        assert_eq!(channel.lost(), 1);
    }

    #[test]
    fn test_closed_receiver_counts_as_loss() {
        let (channel, rx) = EventChannel::<u32>::bounded(4);
        drop(rx);

        assert_eq!(channel.submit(&1), Submit::Dropped);
        assert_eq!(channel.loss_counter().load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_per_producer_order_is_preserved() {
        let (channel, mut rx) = EventChannel::<(u8, u32)>::bounded(1024);

        let producers: Vec<_> = (0..4u8)
            .map(|producer| {
                let channel = channel.clone();
                tokio::spawn(async move {
                    for seq in 0..100u32 {
                        channel.submit(&(producer, seq));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        drop(channel);

        let mut next = [0u32; 4];
        while let Some((producer, seq)) = rx.recv().await {
            assert_eq!(seq, next[producer as usize]);
            next[producer as usize] += 1;
        }
        assert_eq!(next, [100; 4]);
    }
}
