//! Telemetry Spill - disk-backed overflow for telemetry publication queues
//!
//! This library lets telemetry producers hand records to a bounded consumer
//! queue without ever blocking on slow consumers:
//! - Records pass straight through while the consumer queue has room
//! - Overflow is appended to rotating files on local disk
//! - Spilled records are delivered back in their original order
//! - Shutdown reclaims every file, reporting what was left undelivered

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;

/// Consumer-facing bounded queues
pub mod queue;

/// Overflow bridge, spill queue and spill files
pub mod spill;

/// Prometheus metrics for bridges
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Bridge health reporting
pub mod health;

// Re-export main types
pub use config::SpillConfig;
pub use error::{BridgeError, ConfigError, Error, Result};
pub use health::{BridgeHealth, HealthStatus};
pub use queue::{BoundedQueue, TargetQueue};
pub use spill::{BridgeStats, JsonCodec, OverflowBridge, PutOutcome, RawCodec, RecordCodec, ShutdownReport};
