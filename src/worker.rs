use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::pipeline::{
    BoundedQueueRx, BoundedQueueTx, QueueRecvError, QueueStats, bounded_queue, map_send_err,
};
use crate::{EncodeError, EncodeScheduler, InputFrame, Packet, ReceiveStatus};

#[derive(Debug)]
enum WorkerTask {
    Frame(InputFrame),
    Flush,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Packet(Packet),
    /// Every packet of the flushed stream has been delivered.
    Drained,
}

/// Runs an [`EncodeScheduler`] on its own thread. Frames go in and packets
/// come out through bounded queues, so a slow consumer stalls the worker
/// instead of growing memory.
#[derive(Debug)]
pub struct EncodeWorker {
    in_tx: BoundedQueueTx<WorkerTask>,
    out_rx: Option<BoundedQueueRx<Result<WorkerEvent, EncodeError>>>,
    worker: Option<JoinHandle<()>>,
}

impl EncodeWorker {
    pub fn spawn<P>(scheduler: EncodeScheduler<P>, queue_capacity: usize) -> Self
    where
        P: Send + 'static,
    {
        let (in_tx, in_rx) = bounded_queue(queue_capacity.max(1));
        let (out_tx, out_rx) = bounded_queue(queue_capacity.max(1));
        let worker = thread::spawn(move || run_worker(scheduler, in_rx, out_tx));
        Self {
            in_tx,
            out_rx: Some(out_rx),
            worker: Some(worker),
        }
    }

    /// Queues a frame without blocking; a full queue reports backpressure.
    pub fn submit(&self, frame: InputFrame) -> Result<(), EncodeError> {
        self.in_tx
            .try_send(WorkerTask::Frame(frame))
            .map_err(|err| map_send_err(err, "worker frame queue"))
    }

    /// Ends the stream. The worker answers with the remaining packets followed by
    /// [`WorkerEvent::Drained`].
    pub fn flush(&self) -> Result<(), EncodeError> {
        self.in_tx
            .send(WorkerTask::Flush)
            .map_err(|err| map_send_err(err, "worker frame queue"))
    }

    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Result<WorkerEvent, EncodeError>>, EncodeError> {
        let out_rx = self
            .out_rx
            .as_ref()
            .ok_or_else(|| EncodeError::Backend("worker output closed".to_string()))?;
        match out_rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(QueueRecvError::Timeout) => Ok(None),
            Err(QueueRecvError::Disconnected) => Err(EncodeError::Backend(
                "worker output queue disconnected".to_string(),
            )),
        }
    }

    pub fn input_stats(&self) -> QueueStats {
        self.in_tx.stats()
    }
}

impl Drop for EncodeWorker {
    fn drop(&mut self) {
        // Unblock a worker stuck on a full output queue before asking it to stop.
        self.out_rx.take();
        let _ = self.in_tx.send(WorkerTask::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker<P>(
    mut scheduler: EncodeScheduler<P>,
    in_rx: BoundedQueueRx<WorkerTask>,
    out_tx: BoundedQueueTx<Result<WorkerEvent, EncodeError>>,
) {
    while let Ok(task) = in_rx.recv() {
        match task {
            WorkerTask::Shutdown => break,
            WorkerTask::Frame(frame) => {
                let accepted = loop {
                    match scheduler.send_frame(frame.clone()) {
                        Ok(()) => break true,
                        Err(err) if err.is_backpressure() => {
                            if !forward_ready(&mut scheduler, &out_tx) {
                                let _ = out_tx.send(Err(err));
                                break false;
                            }
                        }
                        Err(err) => {
                            let _ = out_tx.send(Err(err));
                            break false;
                        }
                    }
                };
                if accepted {
                    forward_ready(&mut scheduler, &out_tx);
                }
            }
            WorkerTask::Flush => {
                match scheduler.drain() {
                    Ok(packets) => {
                        for packet in packets {
                            let _ = out_tx.send(Ok(WorkerEvent::Packet(packet)));
                        }
                        let _ = out_tx.send(Ok(WorkerEvent::Drained));
                    }
                    Err(err) => {
                        let _ = out_tx.send(Err(err));
                    }
                }
                debug!("worker flushed");
            }
        }
    }

    if let Err(err) = scheduler.close() {
        warn!(%err, "encode worker closed with an error");
    }
}

/// Forwards every packet that is ready; returns whether at least one was sent.
fn forward_ready<P>(
    scheduler: &mut EncodeScheduler<P>,
    out_tx: &BoundedQueueTx<Result<WorkerEvent, EncodeError>>,
) -> bool {
    let mut forwarded = false;
    loop {
        match scheduler.receive_packet() {
            Ok(ReceiveStatus::Packet(packet)) => {
                let _ = out_tx.send(Ok(WorkerEvent::Packet(packet)));
                forwarded = true;
            }
            Ok(ReceiveStatus::NeedMoreInput | ReceiveStatus::EndOfStream) => return forwarded,
            Err(err) => {
                error!(%err, "encode worker failed to receive a packet");
                let _ = out_tx.send(Err(err));
                return forwarded;
            }
        }
    }
}
