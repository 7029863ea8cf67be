//! Edge cases for spill storage and misbehaving collaborators
//!
//! This test suite covers:
//! - Corrupt spill files found by the reader
//! - Target queues that refuse offers they claimed to have room for
//! - Slow target queues and the size reported while records move into them
//! - Codecs that fail on some records
//! - A worker that dies mid-run

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use telemetry_spill::spill::error::{CodecError, CodecResult, FileError};
use telemetry_spill::spill::{SpillFilePool, SpillQueue, SpillRecordFile};
use telemetry_spill::{
    BoundedQueue, HealthStatus, JsonCodec, OverflowBridge, RawCodec, RecordCodec, SpillConfig,
    TargetQueue,
};
use tempfile::TempDir;

fn config(dir: &Path) -> SpillConfig {
    SpillConfig::new(dir)
        .output_wait(Duration::from_millis(10))
        .join_timeout(Duration::from_millis(300))
        .max_records_per_file(4)
}

fn wait_until(what: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if what() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    what()
}

// ============================================================================
// CORRUPTION
// ============================================================================

/// A negative length is reported as corruption, not an allocation attempt
#[test]
fn test_negative_length_is_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("negative.spill");

    let mut file = SpillRecordFile::create(&path, 2).unwrap();
    file.write_record(b"xyz").unwrap();
    file.close_for_writing().unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[4..8].copy_from_slice(&(-5i32).to_be_bytes());
    std::fs::write(&path, bytes).unwrap();

    file.open_for_reading().unwrap();
    match file.read_record() {
        Err(FileError::Corruption { index, message, .. }) => {
            assert_eq!(index, 0);
            assert!(message.contains("negative"));
        },
        other => panic!("expected corruption, got {:?}", other),
    }
}

/// A queue survives one corrupt file and keeps delivering from the next
#[test]
fn test_queue_skips_corrupt_file() {
    let temp_dir = TempDir::new().unwrap();
    let pool = SpillFilePool::new(temp_dir.path(), true, false).unwrap();
    let mut queue = SpillQueue::new(pool, 2);

    for i in 0u8..6 {
        queue.spill(&[i]).unwrap();
    }

    // Break the second file
    let mut paths: Vec<_> = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    std::fs::write(&paths[1], [0u8; 9]).unwrap();

    assert_eq!(queue.unspill().unwrap(), Some(vec![0]));
    assert_eq!(queue.unspill().unwrap(), Some(vec![1]));
    assert_eq!(queue.unspill().unwrap_err().lost(), 2);
    assert_eq!(queue.unspill().unwrap(), Some(vec![4]));
    assert_eq!(queue.unspill().unwrap(), Some(vec![5]));
    assert_eq!(queue.unspill().unwrap(), None);
}

// ============================================================================
// MISBEHAVING TARGET QUEUE
// ============================================================================

/// Claims room but refuses every third offer
struct FlakyQueue {
    inner: BoundedQueue<u32>,
    offers: AtomicUsize,
}

impl TargetQueue<u32> for FlakyQueue {
    fn offer(&self, item: u32) -> Result<(), u32> {
        if self.offers.fetch_add(1, Ordering::Relaxed) % 3 == 2 {
            return Err(item);
        }
        self.inner.offer(item)
    }

    fn offer_timeout(&self, item: u32, timeout: Duration) -> Result<(), u32> {
        self.inner.offer_timeout(item, timeout)
    }

    fn poll_timeout(&self, timeout: Duration) -> Option<u32> {
        self.inner.poll_timeout(timeout)
    }

    fn take(&self) -> u32 {
        self.inner.take()
    }

    fn remaining_capacity(&self) -> usize {
        self.inner.remaining_capacity()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Refused offers are retried later; nothing is lost or reordered
#[test]
fn test_flaky_target_loses_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let target = Arc::new(FlakyQueue {
        inner: BoundedQueue::new(3),
        offers: AtomicUsize::new(0),
    });
    let bridge = Arc::new(
        OverflowBridge::<u32>::new(
            Some("flaky"),
            target,
            JsonCodec::<u32>::new(),
            &config(temp_dir.path()),
        )
        .unwrap(),
    );
    bridge.start().unwrap();

    for i in 0..100 {
        bridge.put(i);
    }
    // Third offer is refused on the direct path; the rest must come off disk
    assert!(wait_until(|| bridge.stats().spilled_pending == 97));

    let mut out = Vec::new();
    while out.len() < 100 {
        match bridge.poll_timeout(Duration::from_secs(5)) {
            Some(v) => out.push(v),
            None => break,
        }
    }

    assert_eq!(out, (0..100).collect::<Vec<_>>());
    assert!(bridge.stats().offer_refusals > 0);
    assert_eq!(bridge.stats().dropped, 0);
    bridge.shut_down_and_close();
}

/// Sleeps after each accepted offer once `slow` is set
struct SlowQueue {
    inner: BoundedQueue<u32>,
    slow: AtomicBool,
}

impl TargetQueue<u32> for SlowQueue {
    fn offer(&self, item: u32) -> Result<(), u32> {
        self.inner.offer(item)?;
        if self.slow.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(200));
        }
        Ok(())
    }

    fn offer_timeout(&self, item: u32, timeout: Duration) -> Result<(), u32> {
        self.inner.offer_timeout(item, timeout)
    }

    fn poll_timeout(&self, timeout: Duration) -> Option<u32> {
        self.inner.poll_timeout(timeout)
    }

    fn take(&self) -> u32 {
        self.inner.take()
    }

    fn remaining_capacity(&self) -> usize {
        self.inner.remaining_capacity()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Size stays exact while unspilled records are still entering the target
#[test]
fn test_size_during_slow_unspill() {
    let temp_dir = TempDir::new().unwrap();
    let target = Arc::new(SlowQueue {
        inner: BoundedQueue::new(2),
        slow: AtomicBool::new(false),
    });
    let bridge = OverflowBridge::<u32>::new(
        Some("slow"),
        target.clone(),
        JsonCodec::<u32>::new(),
        &config(temp_dir.path()),
    )
    .unwrap();
    bridge.start().unwrap();

    for i in 0..10 {
        bridge.put(i);
    }
    assert!(wait_until(|| bridge.stats().spilled_pending == 8));
    assert_eq!(bridge.size(), 10);

    target.slow.store(true, Ordering::Release);
    assert_eq!(bridge.try_poll(), Some(0));
    assert_eq!(bridge.try_poll(), Some(1));

    let deadline = Instant::now() + Duration::from_millis(600);
    let mut observed = Vec::new();
    while Instant::now() < deadline {
        observed.push(bridge.size());
        thread::sleep(Duration::from_millis(5));
    }

    assert!(bridge.stats().unspilled > 0);
    assert!(observed.iter().all(|&size| size == 8), "sizes seen: {:?}", observed);
    assert!(!bridge.is_empty());

    bridge.shut_down_and_close();
}

/// A record on its way into the target never makes the bridge look empty
#[test]
fn test_record_in_flight_is_counted() {
    let temp_dir = TempDir::new().unwrap();
    let target = Arc::new(SlowQueue {
        inner: BoundedQueue::new(4),
        slow: AtomicBool::new(true),
    });
    let bridge = OverflowBridge::<u32>::new(
        Some("in_flight"),
        target,
        JsonCodec::<u32>::new(),
        &config(temp_dir.path()),
    )
    .unwrap();
    bridge.start().unwrap();

    bridge.put(7);
    let deadline = Instant::now() + Duration::from_millis(150);
    while Instant::now() < deadline {
        assert_eq!(bridge.size(), 1);
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(bridge.poll_timeout(Duration::from_secs(5)), Some(7));
    assert!(bridge.is_empty());
    bridge.shut_down_and_close();
}

// ============================================================================
// FAILING CODEC
// ============================================================================

/// Raw codec that cannot decode payloads starting with 0xEE
struct Fussy;

impl RecordCodec<Vec<u8>> for Fussy {
    fn encode(&self, record: Option<&Vec<u8>>) -> CodecResult<Vec<u8>> {
        RawCodec.encode(record)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Option<Vec<u8>>> {
        if bytes.get(1) == Some(&0xEE) {
            return Err(CodecError::Decode {
                type_name: "Vec<u8>",
                len: bytes.len(),
                message: "rejected".to_string(),
            });
        }
        RawCodec.decode(bytes)
    }
}

/// An undecodable record is dropped and counted; its neighbours arrive
#[test]
fn test_undecodable_record_is_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let target = Arc::new(BoundedQueue::<Vec<u8>>::new(1));
    let bridge =
        OverflowBridge::<Vec<u8>>::new(Some("fussy"), target, Fussy, &config(temp_dir.path())).unwrap();
    bridge.start().unwrap();

    bridge.put(vec![1]);
    bridge.put(vec![2]);
    bridge.put(vec![0xEE]);
    bridge.put(vec![]);
    assert!(wait_until(|| bridge.stats().spilled_pending == 3));
    assert_eq!(bridge.health().status, HealthStatus::Degraded);

    let mut out = Vec::new();
    while let Some(v) = bridge.poll_timeout(Duration::from_millis(500)) {
        out.push(v);
    }

    assert_eq!(out, vec![vec![1], vec![2], vec![]]);
    assert_eq!(bridge.stats().dropped, 1);
    assert_eq!(bridge.health().dropped, 1);

    let report = bridge.shut_down_and_close();
    assert_eq!(report.discarded, 0);
}

// ============================================================================
// WORKER DEATH
// ============================================================================

/// Encodes as JSON, panics on decode
struct Explosive;

impl RecordCodec<u32> for Explosive {
    fn encode(&self, record: Option<&u32>) -> CodecResult<Vec<u8>> {
        JsonCodec::<u32>::new().encode(record)
    }

    fn decode(&self, _bytes: &[u8]) -> CodecResult<Option<u32>> {
        panic!("decoder blew up");
    }
}

/// A panicking worker is reported, refuses puts and has its files purged
#[test]
fn test_worker_panic_is_reported_and_purged() {
    let temp_dir = TempDir::new().unwrap();
    let target = Arc::new(BoundedQueue::<u32>::new(1));
    let bridge =
        OverflowBridge::<u32>::new(Some("explosive"), target, Explosive, &config(temp_dir.path()))
            .unwrap();
    let working = bridge.spill_directory().unwrap().to_path_buf();
    bridge.start().unwrap();
    assert!(bridge.is_worker_alive());

    assert!(bridge.put(1).is_queued());
    assert!(bridge.put(2).is_queued());
    assert!(wait_until(|| bridge.stats().spilled_pending == 1));

    // Room opens up, the worker reads record 2 back and dies decoding it
    assert_eq!(bridge.take(), 1);
    assert!(wait_until(|| !bridge.is_worker_alive()));

    let health = bridge.health();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(!health.worker_alive);
    assert!(bridge.put(3).is_interrupted());

    let report = bridge.shut_down_and_close();
    assert!(!report.worker_stopped);
    assert_eq!(report.files_purged, 1);
    assert_eq!(report.discarded, 1);
    assert!(!working.exists());
}
