//! Error types for the crate
//!
//! Errors raised inside the spill worker live in [`crate::spill::error`];
//! they are handled there and never reach producers or consumers. The
//! types here are the ones a caller can actually see.

use thiserror::Error;

use crate::spill::error::{CodecError, FileError, PoolError, SpillError};

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bridge error
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Spill queue error
    #[error("Spill error: {0}")]
    Spill(#[from] SpillError),

    /// Spill file pool error
    #[error("Spill pool error: {0}")]
    Pool(#[from] PoolError),

    /// Spill file error
    #[error("Spill file error: {0}")]
    File(#[from] FileError),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A value is out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Configuration could not be read, parsed or written
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// Bridge construction and lifecycle errors
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The bridge configuration was rejected
    #[error("Invalid bridge configuration: {0}")]
    Config(#[from] ConfigError),

    /// The worker thread could not be spawned
    #[error("Unable to spawn spill worker for topic {topic}: {source}")]
    Spawn {
        /// Bridge topic
        topic: String,
        /// Spawn failure
        #[source]
        source: std::io::Error,
    },
}
