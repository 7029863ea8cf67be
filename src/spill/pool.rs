//! Spill file pool
//!
//! Creates, recycles and deletes [`SpillRecordFile`]s inside one working
//! directory. Drained files are kept for reuse when reuse is enabled so a
//! long spill episode does not churn the filesystem.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, trace, warn};

use super::error::{PoolError, PoolResult};
use super::file::{SpillRecordFile, SPILL_FILE_EXTENSION};
use super::next_pool_id;

/// Default attempts when looking for an unused name
pub const DEFAULT_NAME_ATTEMPTS: u32 = 100;

/// Default upper bound of the randomized backoff between name attempts
pub const DEFAULT_NAME_BACKOFF: Duration = Duration::from_millis(500);

/// Pool of backing files for one spill queue
pub struct SpillFilePool {
    /// Working directory
    directory: PathBuf,
    /// File name prefix, unique per process and pool
    prefix: String,
    /// Next file name suffix
    next_suffix: u64,
    /// Recycle drained files
    reuse: bool,
    /// Leave files on disk instead of deleting them (diagnostics)
    keep: bool,
    /// Name collision attempts
    name_attempts: u32,
    /// Upper bound of collision backoff
    name_backoff: Duration,
    /// Drained, closed files ready for reuse
    reusable: Vec<SpillRecordFile>,
    /// Files created
    files_created: u64,
    /// Files handed out again after draining
    files_reused: u64,
}

impl SpillFilePool {
    /// Create a pool in `directory`, creating the directory if needed
    pub fn new(directory: impl Into<PathBuf>, reuse: bool, keep: bool) -> PoolResult<Self> {
        let directory = directory.into();

        fs::create_dir_all(&directory).map_err(|e| PoolError::Directory {
            path: directory.clone(),
            source: e,
        })?;

        let prefix = format!("spill-{}-{}", std::process::id(), next_pool_id());

        debug!(
            "Spill file pool at {:?} (reuse={}, keep={})",
            directory, reuse, keep
        );

        Ok(Self {
            directory,
            prefix,
            next_suffix: 0,
            reuse,
            keep,
            name_attempts: DEFAULT_NAME_ATTEMPTS,
            name_backoff: DEFAULT_NAME_BACKOFF,
            reusable: Vec::new(),
            files_created: 0,
            files_reused: 0,
        })
    }

    /// Override the file name prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set name collision retry policy
    pub fn with_name_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.name_attempts = attempts.max(1);
        self.name_backoff = backoff;
        self
    }

    /// Get a file in the `Writing` phase
    ///
    /// A drained file is reused when possible, otherwise a new uniquely
    /// named file is created.
    pub fn acquire(&mut self) -> PoolResult<SpillRecordFile> {
        if self.reuse {
            if let Some(mut file) = self.reusable.pop() {
                return match file.reopen_for_writing() {
                    Ok(()) => {
                        self.files_reused += 1;
                        trace!("Reusing spill file {:?}", file.path());
                        Ok(file)
                    },
                    Err(e) => {
                        file.delete();
                        Err(PoolError::Reopen(e))
                    },
                };
            }
        }

        for attempt in 0..self.name_attempts {
            let suffix = self.next_suffix;
            self.next_suffix += 1;
            let path = self.file_path(suffix);

            match SpillRecordFile::create(&path, suffix) {
                Ok(file) => {
                    self.files_created += 1;
                    crate::metrics::record_file_created();
                    return Ok(file);
                },
                Err(e) if e.is_already_exists() => {
                    debug!(
                        "Spill file name {:?} taken (attempt {}), retrying",
                        path,
                        attempt + 1
                    );
                    random_sleep(self.name_backoff);
                },
                Err(e) => return Err(PoolError::Create(e)),
            }
        }

        Err(PoolError::NameExhausted {
            directory: self.directory.clone(),
            attempts: self.name_attempts,
        })
    }

    /// Return a drained file to the pool
    pub fn release(&mut self, mut file: SpillRecordFile) {
        if let Err(e) = file.close() {
            warn!("Error closing released spill file {:?}: {}", file.path(), e);
        }

        if self.reuse {
            self.reusable.push(file);
        } else if self.keep {
            trace!("Keeping spill file {:?}", file.path());
        } else {
            file.delete();
        }
    }

    /// Drop a file that still holds undelivered records
    pub fn discard(&mut self, mut file: SpillRecordFile) {
        if self.keep {
            if let Err(e) = file.close() {
                warn!("Error closing kept spill file {:?}: {}", file.path(), e);
            }
        } else {
            file.delete();
        }
    }

    /// Delete every reusable file, returning how many were reclaimed
    pub fn reclaim_all(&mut self) -> usize {
        let count = self.reusable.len();

        for file in self.reusable.drain(..) {
            if !self.keep {
                file.delete();
            }
        }

        if count > 0 {
            debug!("Reclaimed {} spill files in {:?}", count, self.directory);
        }

        count
    }

    /// Remove the pool directory if nothing is left in it
    ///
    /// Advisory cleanup; failures are only logged.
    pub fn remove_directory_if_empty(&self) {
        match fs::read_dir(&self.directory) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    trace!("Spill directory {:?} not empty, leaving it", self.directory);
                    return;
                }
            },
            Err(e) => {
                trace!("Spill directory {:?} unreadable: {}", self.directory, e);
                return;
            },
        }

        if let Err(e) = fs::remove_dir(&self.directory) {
            warn!("Unable to remove spill directory {:?}: {}", self.directory, e);
        }
    }

    /// Create a fresh subdirectory `<parent>/<stem><n>`
    ///
    /// `n` counts up from 0; each collision sleeps for a random interval of
    /// at most `backoff` before the next attempt.
    pub fn create_unique_directory(
        parent: &Path,
        stem: &str,
        attempts: u32,
        backoff: Duration,
    ) -> PoolResult<PathBuf> {
        if !parent.is_dir() {
            return Err(PoolError::Directory {
                path: parent.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "parent is not a directory"),
            });
        }

        for i in 0..attempts.max(1) {
            let candidate = parent.join(format!("{}{}", stem, i));

            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => random_sleep(backoff),
                Err(e) => {
                    return Err(PoolError::Directory {
                        path: candidate,
                        source: e,
                    })
                },
            }
        }

        Err(PoolError::NameExhausted {
            directory: parent.to_path_buf(),
            attempts: attempts.max(1),
        })
    }

    /// Delete every spill file in `directory`, then the directory
    ///
    /// Used when the owner of the files cannot be reached. Returns the
    /// number of files removed.
    pub fn purge_directory(directory: &Path) -> usize {
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Nothing to purge in {:?}: {}", directory, e);
                return 0;
            },
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_spill = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == SPILL_FILE_EXTENSION);

            if !is_spill {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Unable to purge spill file {:?}: {}", path, e),
            }
        }

        if let Err(e) = fs::remove_dir(directory) {
            warn!("Unable to remove spill directory {:?}: {}", directory, e);
        }

        if removed > 0 {
            info!("Purged {} spill files from {:?}", removed, directory);
        }

        removed
    }

    fn file_path(&self, suffix: u64) -> PathBuf {
        self.directory
            .join(format!("{}-{:08}.{}", self.prefix, suffix, SPILL_FILE_EXTENSION))
    }

    /// Get pool directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Drained files waiting for reuse
    pub fn reusable_count(&self) -> usize {
        self.reusable.len()
    }

    /// Files created so far
    pub fn files_created(&self) -> u64 {
        self.files_created
    }

    /// Files reused so far
    pub fn files_reused(&self) -> u64 {
        self.files_reused
    }

    /// Whether drained files are recycled
    pub fn is_reuse_enabled(&self) -> bool {
        self.reuse
    }

    /// Whether files are left on disk
    pub fn is_keep_enabled(&self) -> bool {
        self.keep
    }
}

/// Sleep for a random interval in `[1ms, max]`
fn random_sleep(max: Duration) {
    let max_ms = (max.as_millis() as u64).max(1);
    let ms = rand::rng().random_range(1..=max_ms);
    thread::sleep(Duration::from_millis(ms));
}
