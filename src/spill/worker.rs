//! Spill worker
//!
//! The single thread that moves records from the producer channel to the
//! target queue, detouring through the spill queue whenever the target is
//! full or older records are still on disk.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::bridge::BridgeStats;
use super::codec::RecordCodec;
use super::queue::SpillQueue;
use crate::metrics;
use crate::queue::TargetQueue;

/// State shared between a bridge and its worker
pub(crate) struct WorkerShared {
    /// Bridge topic, used in logs and metric labels
    pub topic: String,
    /// Counters and the published spill size
    pub stats: Mutex<BridgeStats>,
    /// Graceful stop requested
    pub shutdown: AtomicBool,
    /// Immediate stop requested
    pub abort: AtomicBool,
    /// Worker thread is running
    pub worker_alive: AtomicBool,
    /// Worker thread was launched
    pub started: AtomicBool,
    /// Records accepted by `put` and not yet delivered, dropped or discarded
    pub backlog: AtomicUsize,
    /// Held while a record enters the target and leaves the backlog
    pub routing: Mutex<()>,
}

impl WorkerShared {
    pub fn new(topic: String) -> Self {
        Self {
            topic,
            stats: Mutex::new(BridgeStats::default()),
            shutdown: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            worker_alive: AtomicBool::new(false),
            started: AtomicBool::new(false),
            backlog: AtomicUsize::new(0),
            routing: Mutex::new(()),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn update(&self, f: impl FnOnce(&mut BridgeStats)) {
        f(&mut self.stats.lock());
    }

    /// Take `count` records off the backlog
    pub fn release(&self, count: usize) {
        let _ = self
            .backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(count))
            });
    }
}

/// Clears the liveness flag however the worker thread ends
pub(crate) struct AliveGuard {
    pub shared: Arc<WorkerShared>,
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.shared.worker_alive.store(false, Ordering::Release);
        metrics::update_worker_alive(&self.shared.topic, false);
    }
}

/// Owner of the spill queue and everything on disk
pub(crate) struct SpillWorker<T> {
    producer: Receiver<T>,
    target: Arc<dyn TargetQueue<T>>,
    codec: Arc<dyn RecordCodec<T>>,
    queue: SpillQueue,
    /// Unspilled record the target refused; delivered before anything else
    held: Option<T>,
    shared: Arc<WorkerShared>,
    output_wait: Duration,
}

impl<T: Send + 'static> SpillWorker<T> {
    pub fn new(
        producer: Receiver<T>,
        target: Arc<dyn TargetQueue<T>>,
        codec: Arc<dyn RecordCodec<T>>,
        queue: SpillQueue,
        shared: Arc<WorkerShared>,
        output_wait: Duration,
    ) -> Self {
        Self {
            producer,
            target,
            codec,
            queue,
            held: None,
            shared,
            output_wait,
        }
    }

    /// Process records until stopped, then hand the spill queue back
    pub fn run(mut self) -> SpillQueue {
        info!(
            "Spill worker for {} started in {:?}",
            self.shared.topic,
            self.queue.pool().directory()
        );

        loop {
            if self.shared.is_abort_requested() {
                if self.is_spilling() {
                    warn!(
                        "Spill worker for {} aborted with {} records still spilled",
                        self.shared.topic,
                        self.pending()
                    );
                }
                break;
            }

            match self.producer.recv_timeout(self.output_wait) {
                Ok(record) => self.accept(record),
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_spilling() {
                        self.unspill_pass();
                    } else if self.shared.is_shutdown_requested() {
                        debug!("Spill worker for {} drained, stopping", self.shared.topic);
                        break;
                    }
                },
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Producer channel for {} closed", self.shared.topic);
                    break;
                },
            }

            self.publish();
        }

        self.finish()
    }

    /// Give up on everything not yet on disk and return the spill queue
    ///
    /// Records still in the producer channel and a held record are counted
    /// as discarded.
    pub fn finish(mut self) -> SpillQueue {
        let leftover = self.producer.try_iter().count() + usize::from(self.held.take().is_some());

        if leftover > 0 {
            warn!(
                "Spill worker for {} discarding {} records not yet spilled",
                self.shared.topic, leftover
            );
            self.shared.update(|s| s.discarded += leftover as u64);
            self.shared.release(leftover);
            metrics::record_path(&self.shared.topic, metrics::PATH_DISCARDED, leftover as u64);
        }

        self.publish();
        info!("Spill worker for {} stopped", self.shared.topic);
        self.queue
    }

    /// True while anything is waiting to be delivered ahead of new records
    fn is_spilling(&self) -> bool {
        self.held.is_some() || self.queue.is_spilling()
    }

    fn pending(&self) -> usize {
        self.queue.size() + usize::from(self.held.is_some())
    }

    /// Route one record from the producer channel
    fn accept(&mut self, record: T) {
        let record = if !self.is_spilling() && self.target.remaining_capacity() > 0 {
            match self.deliver(record) {
                Ok(()) => {
                    self.shared.update(|s| s.direct += 1);
                    metrics::record_path(&self.shared.topic, metrics::PATH_DIRECT, 1);
                    return;
                },
                Err(record) => record,
            }
        } else {
            record
        };

        self.spill(record);
        self.unspill_pass();
    }

    fn spill(&mut self, record: T) {
        let bytes = match self.codec.encode(Some(&record)) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Dropping record for {}: {}", self.shared.topic, e);
                self.drop_records(1, "codec", "encode");
                return;
            },
        };

        if let Err(e) = self.queue.spill(&bytes) {
            error!("Spill failed for {}: {}", self.shared.topic, e);
            self.drop_records(e.lost(), "io", "spill");
            return;
        }

        if self.queue.size() == 1 {
            debug!("Target queue for {} full, spilling to disk", self.shared.topic);
        }

        self.shared.update(|s| s.spilled += 1);
        metrics::record_path(&self.shared.topic, metrics::PATH_SPILLED, 1);
    }

    /// Move spilled records to the target while it has room
    fn unspill_pass(&mut self) {
        if let Some(record) = self.held.take() {
            match self.deliver(record) {
                Ok(()) => self.record_unspilled(),
                Err(record) => {
                    self.held = Some(record);
                    return;
                },
            }
        }

        while self.target.remaining_capacity() > 0 && self.queue.is_spilling() {
            if self.shared.is_abort_requested() {
                return;
            }

            let bytes = match self.queue.unspill() {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => {
                    error!("Unspill failed for {}: {}", self.shared.topic, e);
                    self.drop_records(e.lost(), "io", "unspill");
                    continue;
                },
            };

            let record = match self.codec.decode(&bytes) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    trace!("Skipping absent record for {}", self.shared.topic);
                    self.shared.release(1);
                    continue;
                },
                Err(e) => {
                    warn!("Dropping unreadable spilled record for {}: {}", self.shared.topic, e);
                    self.drop_records(1, "codec", "decode");
                    continue;
                },
            };

            if let Err(record) = self.deliver(record) {
                error!(
                    "Target queue for {} refused a record while reporting free capacity, holding it",
                    self.shared.topic
                );
                self.shared.update(|s| s.offer_refusals += 1);
                metrics::record_error(&self.shared.topic, "offer_refused", "unspill");
                self.held = Some(record);
                break;
            }

            self.record_unspilled();
        }

        if !self.is_spilling() {
            debug!("Spill queue for {} drained", self.shared.topic);
        }
    }

    /// Offer to the target and leave the backlog as one step
    ///
    /// `OverflowBridge::size` takes the same lock, so a record is never
    /// counted both in the target and in the backlog.
    fn deliver(&self, record: T) -> Result<(), T> {
        let _routing = self.shared.routing.lock();
        self.target.offer(record)?;
        self.shared.release(1);
        Ok(())
    }

    fn record_unspilled(&self) {
        self.shared.update(|s| s.unspilled += 1);
        metrics::record_path(&self.shared.topic, metrics::PATH_UNSPILLED, 1);
    }

    fn drop_records(&self, count: usize, error_type: &str, operation: &str) {
        self.shared.update(|s| s.dropped += count as u64);
        self.shared.release(count);
        metrics::record_path(&self.shared.topic, metrics::PATH_DROPPED, count as u64);
        metrics::record_error(&self.shared.topic, error_type, operation);
    }

    /// Publish the spill size and pool counters
    fn publish(&self) {
        let pending = self.pending();
        let pool = self.queue.pool();

        self.shared.update(|s| {
            s.spilled_pending = pending;
            s.files_created = pool.files_created();
            s.files_reused = pool.files_reused();
        });
        metrics::update_pending(&self.shared.topic, pending);
    }
}
