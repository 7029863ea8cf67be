//! Overflow bridge
//!
//! The public face of the spill subsystem. Producers call [`OverflowBridge::put`]
//! and never wait on consumers; consumers poll the bridge, which reads the
//! target queue. Everything in between belongs to the worker thread.
//!
//! # Shutdown
//!
//! [`OverflowBridge::shut_down`] lets the worker finish delivering what is
//! spilled; it only stops once the disk is empty. [`OverflowBridge::shut_down_and_close`]
//! waits a bounded time for that, then aborts the worker and reclaims every
//! spill file. Records still on disk at that point are discarded and counted
//! in the returned [`ShutdownReport`].

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::codec::RecordCodec;
use super::error::PoolError;
use super::pool::SpillFilePool;
use super::queue::SpillQueue;
use super::worker::{AliveGuard, SpillWorker, WorkerShared};
use crate::config::SpillConfig;
use crate::error::BridgeError;
use crate::health::{BridgeHealth, HealthStatus};
use crate::metrics;
use crate::queue::TargetQueue;

/// Name used for missing or blank topics
pub const UNKNOWN_TOPIC: &str = "Unknown";

/// How long an aborted worker gets to hand back its spill queue
const ABORT_GRACE: Duration = Duration::from_secs(2);

/// Result of [`OverflowBridge::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Accepted; `retries` counts the full retry intervals waited
    Queued {
        /// Retry intervals waited before the record was accepted
        retries: u32,
    },
    /// Shutdown was requested; the record was ignored
    ShuttingDown,
    /// The worker is gone, so the record could not be queued
    Interrupted,
}

impl PutOutcome {
    /// Whether the record was accepted
    pub fn is_queued(&self) -> bool {
        matches!(self, PutOutcome::Queued { .. })
    }

    /// Whether the wait to enqueue was cut short
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PutOutcome::Interrupted)
    }
}

/// Bridge counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Records accepted by `put`
    pub received: u64,
    /// Records returned by `poll`/`take`
    pub read: u64,
    /// Records forwarded without touching disk
    pub direct: u64,
    /// Records written to disk
    pub spilled: u64,
    /// Records read back from disk and delivered
    pub unspilled: u64,
    /// Records lost to I/O or codec failures
    pub dropped: u64,
    /// Records undelivered at shutdown
    pub discarded: u64,
    /// Offers refused by a target that reported free capacity
    pub offer_refusals: u64,
    /// Records currently waiting on disk
    pub spilled_pending: usize,
    /// Spill files created
    pub files_created: u64,
    /// Spill files reused
    pub files_reused: u64,
}

/// What `shut_down_and_close` did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Records that will never be delivered
    pub discarded: u64,
    /// Whether the worker handed its spill queue back
    pub worker_stopped: bool,
    /// Files removed from an orphaned spill directory
    pub files_purged: usize,
    /// Records accepted over the bridge's lifetime
    pub received: u64,
    /// Records read over the bridge's lifetime
    pub read: u64,
    /// Records spilled over the bridge's lifetime
    pub spilled: u64,
}

/// Normalize a topic name for logs, thread names and directory names
///
/// Missing or blank names become `Unknown`; spaces and dots become `_`.
pub fn clean_topic_name(topic: Option<&str>) -> String {
    match topic.map(str::trim) {
        None | Some("") => UNKNOWN_TOPIC.to_string(),
        Some(name) => name.replace([' ', '.'], "_"),
    }
}

/// A worker that has not been launched yet
struct PendingWorker<T> {
    worker: SpillWorker<T>,
    done: Sender<SpillQueue>,
}

/// Non-blocking producer side in front of a bounded consumer queue
pub struct OverflowBridge<T: Send + 'static> {
    shared: Arc<WorkerShared>,
    target: Arc<dyn TargetQueue<T>>,
    /// Producer channel; `None` when spilling is disabled
    producer: Option<Sender<T>>,
    /// Spill queue handed back by the worker on exit
    done: Option<Receiver<SpillQueue>>,
    pending: Mutex<Option<PendingWorker<T>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    report: Mutex<Option<ShutdownReport>>,
    spill_directory: Option<PathBuf>,
    keep_files: bool,
    put_retry: Duration,
    join_timeout: Duration,
}

impl<T: Send + 'static> OverflowBridge<T> {
    /// Create a bridge delivering into `target`
    ///
    /// An invalid configuration is an error. An unusable spill directory
    /// is not: the bridge logs it and runs with spilling disabled.
    pub fn new<C>(
        topic: Option<&str>,
        target: Arc<dyn TargetQueue<T>>,
        codec: C,
        config: &SpillConfig,
    ) -> Result<Self, BridgeError>
    where
        C: RecordCodec<T> + 'static,
    {
        config.validate()?;

        let topic = clean_topic_name(topic);
        let shared = Arc::new(WorkerShared::new(topic.clone()));

        let pool = if config.enabled {
            match Self::open_pool(&topic, config) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!("Spilling disabled for {}: {}", topic, e);
                    None
                },
            }
        } else {
            None
        };

        let Some(pool) = pool else {
            info!("Overflow bridge for {} running without spill", topic);
            return Ok(Self {
                shared,
                target,
                producer: None,
                done: None,
                pending: Mutex::new(None),
                handle: Mutex::new(None),
                report: Mutex::new(None),
                spill_directory: None,
                keep_files: config.keep_files,
                put_retry: config.put_retry_duration(),
                join_timeout: config.join_timeout_duration(),
            });
        };

        let spill_directory = pool.directory().to_path_buf();
        let queue = SpillQueue::new(pool, config.max_records_per_file);

        let (producer, receiver) = match config.producer_queue_capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let (done_tx, done_rx) = bounded(1);

        let worker = SpillWorker::new(
            receiver,
            Arc::clone(&target),
            Arc::new(codec),
            queue,
            Arc::clone(&shared),
            config.output_wait_duration(),
        );

        info!(
            "Overflow bridge for {} spilling to {:?} ({} records per file)",
            topic, spill_directory, config.max_records_per_file
        );

        Ok(Self {
            shared,
            target,
            producer: Some(producer),
            done: Some(done_rx),
            pending: Mutex::new(Some(PendingWorker {
                worker,
                done: done_tx,
            })),
            handle: Mutex::new(None),
            report: Mutex::new(None),
            spill_directory: Some(spill_directory),
            keep_files: config.keep_files,
            put_retry: config.put_retry_duration(),
            join_timeout: config.join_timeout_duration(),
        })
    }

    /// Create this bridge's working subdirectory and a pool inside it
    fn open_pool(topic: &str, config: &SpillConfig) -> Result<SpillFilePool, PoolError> {
        std::fs::create_dir_all(&config.directory).map_err(|e| PoolError::Directory {
            path: config.directory.clone(),
            source: e,
        })?;

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let stem = format!(
            "SFP_{}_{}_{}_{}_",
            topic,
            config.source_tag,
            std::process::id(),
            millis
        );

        let directory = SpillFilePool::create_unique_directory(
            &config.directory,
            &stem,
            config.name_attempts,
            config.name_backoff_duration(),
        )?;

        Ok(SpillFilePool::new(directory, config.reuse_files, config.keep_files)?
            .with_name_retry(config.name_attempts, config.name_backoff_duration()))
    }

    /// Launch the worker thread
    ///
    /// Does nothing when spilling is disabled or the worker already ran.
    pub fn start(&self) -> Result<(), BridgeError> {
        let Some(PendingWorker { worker, done }) = self.pending.lock().take() else {
            return Ok(());
        };

        self.shared.started.store(true, Ordering::Release);
        self.shared.worker_alive.store(true, Ordering::Release);
        metrics::update_worker_alive(&self.shared.topic, true);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("spill-{}", self.shared.topic))
            .spawn(move || {
                let topic = shared.topic.clone();
                let _alive = AliveGuard { shared };

                match panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
                    Ok(queue) => {
                        if let Err(returned) = done.send(queue) {
                            debug!("Bridge for {} already gone, closing spill queue", topic);
                            returned.into_inner().close();
                        }
                    },
                    Err(_) => error!("Spill worker for {} panicked, spilled records are lost", topic),
                }
            });

        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                Ok(())
            },
            Err(e) => {
                self.shared.worker_alive.store(false, Ordering::Release);
                metrics::update_worker_alive(&self.shared.topic, false);
                error!("Unable to start spill worker for {}: {}", self.shared.topic, e);
                Err(BridgeError::Spawn {
                    topic: self.shared.topic.clone(),
                    source: e,
                })
            },
        }
    }

    /// Hand a record to the bridge
    ///
    /// With spilling enabled this only waits when a bounded producer channel
    /// is full, retrying every `put_retry` interval.
    pub fn put(&self, record: T) -> PutOutcome {
        if self.shared.is_shutdown_requested() {
            warn!("Put on {} after shutdown was requested, record ignored", self.shared.topic);
            return PutOutcome::ShuttingDown;
        }

        match &self.producer {
            Some(producer) => self.put_spilling(producer, record),
            None => self.put_direct(record),
        }
    }

    fn put_spilling(&self, producer: &Sender<T>, mut record: T) -> PutOutcome {
        let mut retries = 0;

        // Counted before the send so the worker can never deliver it first
        self.shared.backlog.fetch_add(1, Ordering::AcqRel);

        loop {
            match producer.send_timeout(record, self.put_retry) {
                Ok(()) => return self.accepted(retries),
                Err(SendTimeoutError::Timeout(returned)) => {
                    retries += 1;
                    warn!(
                        "Producer queue for {} still full after {:?}, retry {}",
                        self.shared.topic, self.put_retry, retries
                    );
                    if self.shared.is_shutdown_requested() {
                        self.shared.release(1);
                        return PutOutcome::ShuttingDown;
                    }
                    record = returned;
                },
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.shared.release(1);
                    error!(
                        "Spill worker for {} is gone, record not queued",
                        self.shared.topic
                    );
                    metrics::record_error(&self.shared.topic, "worker_gone", "put");
                    return PutOutcome::Interrupted;
                },
            }
        }
    }

    fn put_direct(&self, mut record: T) -> PutOutcome {
        let mut retries = 0;

        loop {
            match self.target.offer_timeout(record, self.put_retry) {
                Ok(()) => {
                    self.shared.update(|s| s.direct += 1);
                    metrics::record_path(&self.shared.topic, metrics::PATH_DIRECT, 1);
                    return self.accepted(retries);
                },
                Err(returned) => {
                    retries += 1;
                    warn!(
                        "Target queue for {} still full after {:?}, retry {}",
                        self.shared.topic, self.put_retry, retries
                    );
                    if self.shared.is_shutdown_requested() {
                        return PutOutcome::ShuttingDown;
                    }
                    record = returned;
                },
            }
        }
    }

    fn accepted(&self, retries: u32) -> PutOutcome {
        self.shared.update(|s| s.received += 1);
        metrics::record_put(&self.shared.topic);
        PutOutcome::Queued { retries }
    }

    /// Remove the head, waiting up to `timeout`
    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let record = self.target.poll_timeout(timeout);

        if record.is_some() {
            self.record_read();
        } else if self.is_spilling() {
            warn!(
                "Empty poll on {} while {} records are spilled",
                self.shared.topic,
                self.spilled_pending()
            );
        }

        record
    }

    /// Remove the head, waiting as long as it takes
    pub fn take(&self) -> T {
        let record = self.target.take();
        self.record_read();
        record
    }

    /// Remove the head if there is one
    pub fn try_poll(&self) -> Option<T> {
        let record = self.target.try_poll();
        if record.is_some() {
            self.record_read();
        }
        record
    }

    fn record_read(&self) {
        self.shared.update(|s| s.read += 1);
        metrics::record_read(&self.shared.topic);
    }

    /// Records anywhere in the bridge: producer channel, worker, disk and target
    ///
    /// Taken while no record is moving into the target, so each record is
    /// counted once.
    pub fn size(&self) -> usize {
        if !self.is_enabled() {
            return self.target.len();
        }

        let _routing = self.shared.routing.lock();
        self.shared.backlog.load(Ordering::Acquire) + self.target.len()
    }

    /// Whether the bridge holds no records
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Unbounded while spilling is enabled, else the target's free room
    pub fn remaining_capacity(&self) -> usize {
        if self.is_enabled() {
            usize::MAX
        } else {
            self.target.remaining_capacity()
        }
    }

    /// Whether records are waiting on disk
    pub fn is_spilling(&self) -> bool {
        self.spilled_pending() > 0
    }

    fn spilled_pending(&self) -> usize {
        self.shared.stats.lock().spilled_pending
    }

    /// Ask the worker to stop once nothing is spilled
    pub fn shut_down(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            info!("Shutdown requested for {}", self.shared.topic);
        }
    }

    /// Stop the worker and reclaim every spill file
    ///
    /// Waits up to the join timeout for the worker to drain, then aborts it.
    /// Calling this again returns the first report.
    pub fn shut_down_and_close(&self) -> ShutdownReport {
        self.shut_down();

        let mut report_slot = self.report.lock();
        if let Some(report) = report_slot.as_ref() {
            return report.clone();
        }

        let mut report = ShutdownReport::default();

        if let Some(done) = &self.done {
            let queue = match self.pending.lock().take() {
                // Never started: nothing to wait for
                Some(PendingWorker { worker, .. }) => Some(worker.finish()),
                None => self.wait_for_worker(done),
            };

            match queue {
                Some(queue) => {
                    let discarded = queue.close() as u64;
                    self.shared.release(discarded as usize);
                    self.shared.update(|s| {
                        s.discarded += discarded;
                        s.spilled_pending = 0;
                    });
                    metrics::record_path(&self.shared.topic, metrics::PATH_DISCARDED, discarded);
                    metrics::update_pending(&self.shared.topic, 0);
                    report.worker_stopped = true;
                },
                None => {
                    if let Some(directory) = &self.spill_directory {
                        report.files_purged = self.purge_orphaned(directory);
                    }
                },
            }
        } else {
            report.worker_stopped = true;
        }

        let stats = self.stats();
        report.discarded = stats.discarded;
        report.received = stats.received;
        report.read = stats.read;
        report.spilled = stats.spilled;

        info!(
            "Closed bridge {}: received {}, read {}, spilled {}, discarded {}",
            self.shared.topic, report.received, report.read, report.spilled, report.discarded
        );

        *report_slot = Some(report.clone());
        report
    }

    /// Wait for the worker to hand back its spill queue, aborting it if needed
    fn wait_for_worker(&self, done: &Receiver<SpillQueue>) -> Option<SpillQueue> {
        let queue = match done.recv_timeout(self.join_timeout) {
            Ok(queue) => Some(queue),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Spill worker for {} did not stop within {:?}, aborting",
                    self.shared.topic, self.join_timeout
                );
                self.shared.abort.store(true, Ordering::Release);

                match done.recv_timeout(ABORT_GRACE) {
                    Ok(queue) => Some(queue),
                    Err(_) => {
                        error!(
                            "Spill worker for {} ignored abort, leaving it behind",
                            self.shared.topic
                        );
                        return None;
                    },
                }
            },
            Err(RecvTimeoutError::Disconnected) => {
                error!("Spill worker for {} exited abnormally", self.shared.topic);
                None
            },
        };

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("Spill worker thread for {} panicked", self.shared.topic);
            }
        }

        queue
    }

    fn purge_orphaned(&self, directory: &Path) -> usize {
        let pending = self.spilled_pending() as u64;
        self.shared.backlog.store(0, Ordering::Release);
        self.shared.update(|s| {
            s.discarded += pending;
            s.spilled_pending = 0;
        });
        metrics::record_path(&self.shared.topic, metrics::PATH_DISCARDED, pending);

        if self.keep_files {
            return 0;
        }
        SpillFilePool::purge_directory(directory)
    }

    /// Whether the worker thread is running
    pub fn is_worker_alive(&self) -> bool {
        self.shared.worker_alive.load(Ordering::Acquire)
    }

    /// Snapshot of the bridge counters
    pub fn stats(&self) -> BridgeStats {
        self.shared.stats.lock().clone()
    }

    /// Current health
    pub fn health(&self) -> BridgeHealth {
        let stats = self.stats();
        let worker_alive = self.is_worker_alive();
        let worker_lost = self.is_enabled()
            && self.shared.started.load(Ordering::Acquire)
            && !worker_alive
            && !self.shared.is_shutdown_requested();

        let (status, message) = if worker_lost {
            (
                HealthStatus::Unhealthy,
                Some("spill worker stopped unexpectedly".to_string()),
            )
        } else if stats.spilled_pending > 0 {
            (
                HealthStatus::Degraded,
                Some(format!("{} records spilled", stats.spilled_pending)),
            )
        } else {
            (HealthStatus::Healthy, None)
        };

        BridgeHealth {
            topic: self.shared.topic.clone(),
            status,
            enabled: self.is_enabled(),
            worker_alive,
            spilled_pending: stats.spilled_pending,
            dropped: stats.dropped,
            spill_directory: self.spill_directory.clone(),
            message,
        }
    }

    /// Cleaned topic name
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Whether records can spill to disk
    pub fn is_enabled(&self) -> bool {
        self.producer.is_some()
    }

    /// This bridge's working subdirectory
    pub fn spill_directory(&self) -> Option<&Path> {
        self.spill_directory.as_deref()
    }
}

impl<T: Send + 'static> Drop for OverflowBridge<T> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.abort.store(true, Ordering::Release);

        // A worker that never ran still owns the working directory
        if let Some(PendingWorker { worker, .. }) = self.pending.get_mut().take() {
            let discarded = worker.finish().close();
            debug!(
                "Dropped unstarted bridge {}, {} records discarded",
                self.shared.topic, discarded
            );
        }
    }
}
