use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

use crate::EncodeError;
use crate::picture::PictureId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSendError {
    Full,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRecvError {
    Disconnected,
    Timeout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub peak_depth: usize,
}

#[derive(Debug, Default)]
struct QueueCounters {
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
}

impl QueueCounters {
    fn on_send(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
    }

    fn on_recv(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            depth: self.depth.load(Ordering::Relaxed),
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
        }
    }
}

/// Sending half of a bounded channel between the caller and the encode worker.
#[derive(Debug)]
pub struct BoundedQueueTx<T> {
    inner: SyncSender<T>,
    counters: Arc<QueueCounters>,
}

impl<T> Clone for BoundedQueueTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

#[derive(Debug)]
pub struct BoundedQueueRx<T> {
    inner: Receiver<T>,
    counters: Arc<QueueCounters>,
}

impl<T> BoundedQueueTx<T> {
    pub fn send(&self, value: T) -> Result<(), QueueSendError> {
        self.inner
            .send(value)
            .map_err(|_| QueueSendError::Disconnected)?;
        self.counters.on_send();
        Ok(())
    }

    pub fn try_send(&self, value: T) -> Result<(), QueueSendError> {
        match self.inner.try_send(value) {
            Ok(()) => {
                self.counters.on_send();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(QueueSendError::Full),
            Err(TrySendError::Disconnected(_)) => Err(QueueSendError::Disconnected),
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }
}

impl<T> BoundedQueueRx<T> {
    pub fn recv(&self) -> Result<T, QueueRecvError> {
        let item = self
            .inner
            .recv()
            .map_err(|_| QueueRecvError::Disconnected)?;
        self.counters.on_recv();
        Ok(item)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, QueueRecvError> {
        match self.inner.recv_timeout(timeout) {
            Ok(item) => {
                self.counters.on_recv();
                Ok(item)
            }
            Err(RecvTimeoutError::Timeout) => Err(QueueRecvError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(QueueRecvError::Disconnected),
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }
}

pub fn bounded_queue<T>(capacity: usize) -> (BoundedQueueTx<T>, BoundedQueueRx<T>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let counters = Arc::new(QueueCounters::default());
    (
        BoundedQueueTx {
            inner: tx,
            counters: Arc::clone(&counters),
        },
        BoundedQueueRx {
            inner: rx,
            counters,
        },
    )
}

pub(crate) fn map_send_err(err: QueueSendError, queue: &str) -> EncodeError {
    match err {
        QueueSendError::Full => EncodeError::TemporaryBackpressure(format!("{queue} is full")),
        QueueSendError::Disconnected => EncodeError::Backend(format!("{queue} disconnected")),
    }
}

/// Issued pictures awaiting `output`, oldest first. Never holds more than the
/// configured async depth.
#[derive(Debug)]
pub struct EncodeFifo {
    queue: VecDeque<PictureId>,
    capacity: usize,
    peak_depth: usize,
}

impl EncodeFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            peak_depth: 0,
        }
    }

    pub fn can_write(&self) -> bool {
        self.queue.len() < self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn push(&mut self, id: PictureId) -> Result<(), EncodeError> {
        if !self.can_write() {
            return Err(EncodeError::TemporaryBackpressure(format!(
                "encode fifo holds {} pictures",
                self.capacity
            )));
        }
        self.queue.push_back(id);
        self.peak_depth = self.peak_depth.max(self.queue.len());
        Ok(())
    }

    pub fn pop(&mut self) -> Option<PictureId> {
        self.queue.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PictureId> + '_ {
        self.queue.drain(..)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.queue.len(),
            peak_depth: self.peak_depth,
        }
    }
}

/// Time spent inside each hardware operation, reported when metrics are enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct StageTiming {
    pub alloc: Duration,
    pub issue: Duration,
    pub output: Duration,
    pub free: Duration,
    pub pictures: u64,
    pub packets: u64,
}

impl StageTiming {
    pub(crate) fn total(&self) -> Duration {
        self.alloc + self.issue + self.output + self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SurfaceHandle;
    use crate::picture::PictureArena;

    #[test]
    fn queue_stats_track_depth_and_peak() {
        let (tx, rx) = bounded_queue::<usize>(2);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(tx.try_send(3), Err(QueueSendError::Full));
        let stats = tx.stats();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.peak_depth, 2);

        assert_eq!(rx.recv().unwrap(), 1);
        let stats_after = rx.stats();
        assert_eq!(stats_after.depth, 1);
        assert_eq!(stats_after.peak_depth, 2);
    }

    #[test]
    fn full_queue_maps_to_backpressure() {
        let err = map_send_err(QueueSendError::Full, "frame queue");
        assert!(err.is_backpressure());
        let err = map_send_err(QueueSendError::Disconnected, "frame queue");
        assert!(matches!(err, EncodeError::Backend(_)));
    }

    #[test]
    fn fifo_respects_capacity() {
        let mut arena = PictureArena::<()>::new();
        let ids = (0..3)
            .map(|i| arena.insert(i, SurfaceHandle(i as u64), None, ()))
            .collect::<Vec<_>>();
        let mut fifo = EncodeFifo::new(2);
        fifo.push(ids[0]).unwrap();
        fifo.push(ids[1]).unwrap();
        assert!(!fifo.can_write());
        assert!(fifo.push(ids[2]).unwrap_err().is_backpressure());
        assert_eq!(fifo.pop(), Some(ids[0]));
        fifo.push(ids[2]).unwrap();
        assert_eq!(fifo.stats(), QueueStats { depth: 2, peak_depth: 2 });
        assert_eq!(fifo.drain().collect::<Vec<_>>(), vec![ids[1], ids[2]]);
        assert!(fifo.is_empty());
    }
}
