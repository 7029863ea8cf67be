//! Spill error types
//!
//! Every error here is recovered locally by the spill worker: it is logged,
//! counted, and processing continues. None of them reach `put` or `poll`
//! callers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::file::FilePhase;

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Result type for single-file operations
pub type FileResult<T> = Result<T, FileError>;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Result type for spill queue operations
pub type SpillResult<T> = Result<T, SpillError>;

/// A record could not be converted to or from bytes.
///
/// Kept apart from I/O failures so a single corrupt record can be skipped
/// without abandoning the file it came from.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed
    #[error("Unable to encode {type_name}: {message}")]
    Encode {
        /// Record type being encoded
        type_name: &'static str,
        /// Description of the failure
        message: String,
    },

    /// Bytes do not represent a value of the expected type
    #[error("Unable to decode {type_name} from {len} bytes: {message}")]
    Decode {
        /// Record type being decoded
        type_name: &'static str,
        /// Length of the offending record
        len: usize,
        /// Description of the failure
        message: String,
    },
}

/// Backing file errors
#[derive(Debug, Error)]
pub enum FileError {
    /// I/O error on a backing file
    #[error("Spill file I/O error ({context}) on {path:?}: {source}")]
    Io {
        /// Path of the file
        path: PathBuf,
        /// What was being done
        context: String,
        /// The I/O error
        #[source]
        source: io::Error,
    },

    /// Operation not valid in the file's current phase
    #[error("Cannot {operation} spill file {path:?} while {phase}")]
    WrongPhase {
        /// Path of the file
        path: PathBuf,
        /// Attempted operation
        operation: &'static str,
        /// Phase the file was in
        phase: FilePhase,
    },

    /// Every record written has already been read
    #[error("End of spill file {path:?} after {count} records")]
    EndOfFile {
        /// Path of the file
        path: PathBuf,
        /// Records in the file
        count: usize,
    },

    /// Structural corruption detected while reading
    #[error("Spill file corruption in {path:?} at record {index}: {message}")]
    Corruption {
        /// Path of the file
        path: PathBuf,
        /// Index of the record being read
        index: usize,
        /// Description of the corruption
        message: String,
    },

    /// Payload does not fit the 32-bit length prefix
    #[error("Spill record of {len} bytes exceeds maximum of {max}")]
    RecordTooLarge {
        /// Payload length
        len: usize,
        /// Maximum allowed
        max: usize,
    },
}

impl FileError {
    /// True for the I/O error kind that signals a name collision
    pub fn is_already_exists(&self) -> bool {
        matches!(self, FileError::Io { source, .. } if source.kind() == io::ErrorKind::AlreadyExists)
    }

    /// True when a read ran past the last record
    pub fn is_end_of_file(&self) -> bool {
        matches!(self, FileError::EndOfFile { .. })
    }
}

/// Pool errors: a backing file could not be provided
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool directory could not be created or used
    #[error("Spill directory {path:?} unusable: {source}")]
    Directory {
        /// Directory path
        path: PathBuf,
        /// The I/O error
        #[source]
        source: io::Error,
    },

    /// No free name found after the configured attempts
    #[error("Unable to create a unique name under {directory:?} after {attempts} attempts")]
    NameExhausted {
        /// Directory searched
        directory: PathBuf,
        /// Attempts made
        attempts: u32,
    },

    /// A new backing file could not be created
    #[error("Unable to create spill file: {0}")]
    Create(#[source] FileError),

    /// A reusable backing file could not be reopened for writing
    #[error("Unable to reopen spill file for reuse: {0}")]
    Reopen(#[source] FileError),
}

/// Spill queue errors.
///
/// The records counted in `lost` are gone; the caller only logs them.
#[derive(Debug, Error)]
pub enum SpillError {
    /// No backing file was available for writing
    #[error("Spill failed, no file available ({lost} records lost): {source}")]
    Pool {
        /// Records lost
        lost: usize,
        /// Underlying pool error
        #[source]
        source: PoolError,
    },

    /// Writing, rotating or reading a backing file failed
    #[error("Spill file abandoned ({lost} records lost): {source}")]
    File {
        /// Records lost
        lost: usize,
        /// Underlying file error
        #[source]
        source: FileError,
    },
}

impl SpillError {
    /// Number of records lost by the failed operation
    pub fn lost(&self) -> usize {
        match self {
            SpillError::Pool { lost, .. } | SpillError::File { lost, .. } => *lost,
        }
    }
}

/// Extension trait for attaching path and context to I/O errors
pub trait IoResultExt<T> {
    /// Convert an I/O error into a [`FileError::Io`]
    fn with_path_context(self, path: &std::path::Path, context: impl Into<String>)
        -> FileResult<T>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn with_path_context(
        self,
        path: &std::path::Path,
        context: impl Into<String>,
    ) -> FileResult<T> {
        self.map_err(|e| FileError::Io {
            path: path.to_path_buf(),
            context: context.into(),
            source: e,
        })
    }
}
