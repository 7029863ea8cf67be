//! Spill record file
//!
//! A single backing file holding a sequence of length-prefixed records. A
//! file is used in strict phases: written sequentially, closed, then read
//! sequentially from the start. Once drained it can be recycled by the pool.
//!
//! # Record Format
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┐
//! │    Marker    │    Length    │   Payload    │
//! │  (4 bytes)   │  (4 bytes)   │  (N bytes)   │
//! └──────────────┴──────────────┴──────────────┘
//! ```
//!
//! - **Marker**: fixed sentinel `-1` (`0xFFFFFFFF`), checked on read to
//!   detect structural corruption. It is not a format version.
//! - **Length**: signed payload length
//! - **Payload**: the encoded record, possibly empty
//!
//! Both header fields are big-endian signed 32-bit integers.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use super::error::{FileError, FileResult, IoResultExt};

/// Spill file ID type
pub type SpillFileId = u64;

/// Sentinel written before every record
pub const RECORD_MARKER: i32 = -1;

/// Record header size in bytes (marker + length)
pub const RECORD_HEADER_SIZE: usize = 8;

/// Largest payload the length prefix can describe
pub const MAX_RECORD_SIZE: usize = i32::MAX as usize;

/// Extension used for backing files
pub const SPILL_FILE_EXTENSION: &str = "spill";

/// Write buffer capacity
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Lifecycle phase of a spill file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePhase {
    /// Accepting appended records
    Writing,
    /// Being consumed sequentially
    Reading,
    /// No handle open
    Closed,
}

impl fmt::Display for FilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilePhase::Writing => write!(f, "writing"),
            FilePhase::Reading => write!(f, "reading"),
            FilePhase::Closed => write!(f, "closed"),
        }
    }
}

/// One backing file of spilled records
///
/// Invariant: `next <= count`. `count` is the number of records written
/// in the current writing session, `next` the index of the next record to
/// read.
pub struct SpillRecordFile {
    /// File ID
    id: SpillFileId,
    /// File path
    path: PathBuf,
    /// Current phase
    phase: FilePhase,
    /// Handle while writing
    writer: Option<BufWriter<File>>,
    /// Handle while reading
    reader: Option<BufReader<File>>,
    /// Records written this session
    count: usize,
    /// Index of next record to read
    next: usize,
    /// Bytes written this session
    bytes_written: u64,
}

impl SpillRecordFile {
    /// Create a new empty file in the `Writing` phase
    ///
    /// Fails with an `AlreadyExists` I/O error if the path is taken, which
    /// the pool treats as a name collision.
    pub fn create(path: impl Into<PathBuf>, id: SpillFileId) -> FileResult<Self> {
        let path = path.into();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .with_path_context(&path, "creating spill file")?;

        debug!("Created spill file {} at {:?}", id, path);

        Ok(Self {
            id,
            path,
            phase: FilePhase::Writing,
            writer: Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
            reader: None,
            count: 0,
            next: 0,
            bytes_written: 0,
        })
    }

    /// Append one record
    pub fn write_record(&mut self, bytes: &[u8]) -> FileResult<()> {
        if bytes.len() > MAX_RECORD_SIZE {
            return Err(FileError::RecordTooLarge {
                len: bytes.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let writer = match (self.phase, self.writer.as_mut()) {
            (FilePhase::Writing, Some(writer)) => writer,
            _ => return Err(self.wrong_phase("write")),
        };

        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0..4].copy_from_slice(&RECORD_MARKER.to_be_bytes());
        header[4..8].copy_from_slice(&(bytes.len() as i32).to_be_bytes());

        writer
            .write_all(&header)
            .with_path_context(&self.path, "writing record header")?;
        writer
            .write_all(bytes)
            .with_path_context(&self.path, "writing record payload")?;

        self.count += 1;
        self.bytes_written += (RECORD_HEADER_SIZE + bytes.len()) as u64;

        Ok(())
    }

    /// Flush and release the writer, moving to `Closed`
    pub fn close_for_writing(&mut self) -> FileResult<()> {
        if self.phase != FilePhase::Writing {
            return Err(self.wrong_phase("close for writing"));
        }

        self.close()
    }

    /// Release whatever handle is open, from any phase
    pub fn close(&mut self) -> FileResult<()> {
        self.reader = None;
        self.phase = FilePhase::Closed;

        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .with_path_context(&self.path, "flushing spill file")?;
        }

        Ok(())
    }

    /// Open a closed file for reading from the first record
    pub fn open_for_reading(&mut self) -> FileResult<()> {
        if self.phase != FilePhase::Closed {
            return Err(self.wrong_phase("open for reading"));
        }

        let file = File::open(&self.path).with_path_context(&self.path, "opening for reading")?;

        self.reader = Some(BufReader::new(file));
        self.phase = FilePhase::Reading;
        self.next = 0;

        trace!("Opened spill file {} for reading ({} records)", self.id, self.count);
        Ok(())
    }

    /// Switch the file being written straight to reading
    ///
    /// The writer is flushed and the same handle rewound to offset 0, so
    /// there is no separate close and reopen.
    pub fn reopen_for_reading(&mut self) -> FileResult<()> {
        if self.phase != FilePhase::Writing {
            return Err(self.wrong_phase("reopen for reading"));
        }

        let writer = self.writer.take().ok_or_else(|| self.wrong_phase("reopen for reading"))?;

        let mut file = match writer.into_inner() {
            Ok(file) => file,
            Err(e) => {
                self.phase = FilePhase::Closed;
                return Err(e.into_error())
                    .with_path_context(&self.path, "flushing before reading");
            },
        };

        if let Err(e) = file.seek(SeekFrom::Start(0)) {
            self.phase = FilePhase::Closed;
            return Err(e).with_path_context(&self.path, "rewinding for reading");
        }

        self.reader = Some(BufReader::new(file));
        self.phase = FilePhase::Reading;
        self.next = 0;

        trace!("Rewound spill file {} for reading ({} records)", self.id, self.count);
        Ok(())
    }

    /// Reset a closed file for reuse: truncated, counters zeroed
    pub fn reopen_for_writing(&mut self) -> FileResult<()> {
        if self.phase != FilePhase::Closed {
            return Err(self.wrong_phase("reopen for writing"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .with_path_context(&self.path, "reopening for writing")?;

        self.writer = Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file));
        self.phase = FilePhase::Writing;
        self.count = 0;
        self.next = 0;
        self.bytes_written = 0;

        trace!("Reopened spill file {} for writing", self.id);
        Ok(())
    }

    /// Read the next record
    pub fn read_record(&mut self) -> FileResult<Vec<u8>> {
        if self.phase != FilePhase::Reading || self.reader.is_none() {
            return Err(self.wrong_phase("read"));
        }

        if self.next >= self.count {
            return Err(FileError::EndOfFile {
                path: self.path.clone(),
                count: self.count,
            });
        }

        let index = self.next;
        let path = &self.path;
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => {
                return Err(FileError::WrongPhase {
                    path: path.clone(),
                    operation: "read",
                    phase: self.phase,
                })
            },
        };

        let mut header = [0u8; RECORD_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .with_path_context(path, format!("reading header of record {}", index))?;

        let marker = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if marker != RECORD_MARKER {
            return Err(FileError::Corruption {
                path: path.clone(),
                index,
                message: format!(
                    "invalid marker: expected {:08x}, got {:08x}",
                    RECORD_MARKER, marker
                ),
            });
        }

        let len = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len < 0 {
            return Err(FileError::Corruption {
                path: path.clone(),
                index,
                message: format!("negative record length {}", len),
            });
        }

        let file_len = reader
            .get_ref()
            .metadata()
            .with_path_context(path, "reading file length")?
            .len();
        let position = reader
            .stream_position()
            .with_path_context(path, format!("locating payload of record {}", index))?;
        let available = file_len.saturating_sub(position);
        if len as u64 > available {
            return Err(FileError::Corruption {
                path: path.clone(),
                index,
                message: format!(
                    "record length {} exceeds the {} bytes left in the file",
                    len, available
                ),
            });
        }

        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact(&mut payload)
            .with_path_context(path, format!("reading payload of record {}", index))?;

        self.next += 1;
        Ok(payload)
    }

    /// True once every record written has been read
    pub fn is_at_end_of_file(&self) -> bool {
        self.next == self.count
    }

    /// Records written but not yet read
    pub fn remaining(&self) -> usize {
        self.count - self.next
    }

    /// Close and remove the file, logging rather than returning failures
    pub fn delete(mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing spill file {:?} before delete: {}", self.path, e);
        }

        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Deleted spill file {}", self.id),
            Err(e) => warn!("Unable to delete spill file {:?}: {}", self.path, e),
        }
    }

    fn wrong_phase(&self, operation: &'static str) -> FileError {
        FileError::WrongPhase {
            path: self.path.clone(),
            operation,
            phase: self.phase,
        }
    }

    /// Get file ID
    pub fn id(&self) -> SpillFileId {
        self.id
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current phase
    pub fn phase(&self) -> FilePhase {
        self.phase
    }

    /// Records written this session
    pub fn count(&self) -> usize {
        self.count
    }

    /// Index of the next record to read
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Bytes written this session
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl fmt::Debug for SpillRecordFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpillRecordFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("phase", &self.phase)
            .field("count", &self.count)
            .field("next", &self.next)
            .finish()
    }
}
