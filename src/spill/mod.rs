//! Disk-spill overflow bridge
//!
//! Sits between producers that must never block and a bounded queue read
//! by consumers. While the consumer queue has room, records pass straight
//! through. When it is full, records are encoded and appended to files on
//! local disk, then read back in order as room frees up.
//!
//! # Architecture
//!
//! ```text
//!  put ──► producer channel ──► SpillWorker ──offer──► TargetQueue ──► poll
//!                                   │    ▲
//!                             spill │    │ unspill
//!                                   ▼    │
//!                     ┌────────────────────────────────┐
//!                     │           SpillQueue           │
//!                     │  in-progress │ populated │ read │
//!                     └────────────────────────────────┘
//!                                   │
//!                            SpillFilePool
//!                 spill-<pid>-<n>-00000000.spill  ...
//! ```
//!
//! The worker thread owns the spill queue, the pool and every open file.
//! Producers and consumers never touch the files; they only see the
//! producer channel and the target queue.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemetry_spill::spill::{JsonCodec, OverflowBridge};
//! use telemetry_spill::{BoundedQueue, SpillConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpillConfig::new("/var/spool/telemetry");
//! let target = Arc::new(BoundedQueue::<u64>::new(1024));
//! let bridge = OverflowBridge::<u64>::new(Some("EHA"), target, JsonCodec::<u64>::new(), &config)?;
//! bridge.start()?;
//!
//! bridge.put(42);
//! assert_eq!(bridge.take(), 42);
//!
//! let report = bridge.shut_down_and_close();
//! assert_eq!(report.discarded, 0);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod codec;
pub mod error;
pub mod file;
pub mod pool;
pub mod queue;
pub(crate) mod worker;

pub use bridge::{clean_topic_name, BridgeStats, OverflowBridge, PutOutcome, ShutdownReport};
pub use codec::{JsonCodec, RawCodec, RecordCodec};
pub use error::{CodecError, FileError, PoolError, SpillError, SpillResult};
pub use file::{FilePhase, SpillFileId, SpillRecordFile};
pub use pool::SpillFilePool;
pub use queue::SpillQueue;

use std::sync::atomic::{AtomicU64, Ordering};

/// Global pool counter
static POOL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique pool number
pub fn next_pool_id() -> u64 {
    POOL_COUNTER.fetch_add(1, Ordering::Relaxed)
}
