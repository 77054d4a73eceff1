//! Per-worker job queue.
//!
//! Each worker owns exactly one [`JobQueue`]: the worker is the sole
//! consumer, while producers are the worker itself (flushing staged children
//! during a commit) and the executor facade (seeding a freshly admitted
//! procedure). Batches appended through [`schedule`](JobQueue::schedule) are
//! contiguous: producers serialise on an async mutex, so a consumer never
//! observes another producer's jobs interleaved into a batch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::job::Job;

/// MPSC FIFO of jobs awaiting execution on one worker.
pub struct JobQueue {
    tx: flume::Sender<Arc<Job>>,
    rx: flume::Receiver<Arc<Job>>,
    batch: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
}

impl JobQueue {
    /// Create a queue; `capacity` bounds it, `None` leaves it unbounded.
    /// A bounded queue applies backpressure to producers via
    /// [`schedule`](Self::schedule).
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        let (tx, rx) = match capacity {
            Some(capacity) => flume::bounded(capacity),
            None => flume::unbounded(),
        };
        Self {
            tx,
            rx,
            batch: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Remove the next job from the queue, waiting for one to arrive.
    ///
    /// `None` is the shutdown sentinel: it is returned only when the queue
    /// has been disconnected.
    pub async fn get(&self) -> Option<Arc<Job>> {
        self.rx.recv_async().await.ok()
    }

    /// Atomically append a batch of jobs.
    ///
    /// Blocks while a bounded queue is full. The batch is contiguous in
    /// delivery order; concurrent `schedule` calls never interleave.
    pub async fn schedule(&self, jobs: Vec<Arc<Job>>) {
        let _batch = self.batch.lock().await;
        for job in jobs {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            if self.tx.send_async(job).await.is_err() {
                // Receiver gone: the owning worker exited mid-shutdown.
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!("job queue disconnected; dropping scheduled batch remainder");
                return;
            }
        }
    }

    /// Signal that the last-delivered job was processed.
    pub fn done(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Jobs scheduled but not yet reported done.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs currently waiting in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
