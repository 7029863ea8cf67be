//! Spill queue
//!
//! Composes many [`SpillRecordFile`]s into one FIFO queue of byte records
//! with unbounded capacity.
//!
//! ```text
//!   spill ──► [in-progress] ──rotate──► [populated ... populated] ──► [unspiller] ──► unspill
//!                  │                                                      ▲
//!                  └──────────── promoted when nothing older ─────────────┘
//! ```
//!
//! At most one file is open for writing (the in-progress file) and at most
//! one for reading (the unspiller). Populated files are full and closed,
//! oldest first. Reading always drains older files before the file that is
//! still being written, which is what keeps the queue strictly FIFO.

use std::collections::VecDeque;

use tracing::{debug, error, trace, warn};

use super::error::{SpillError, SpillResult};
use super::file::SpillRecordFile;
use super::pool::SpillFilePool;

/// Disk-backed FIFO of byte records
pub struct SpillQueue {
    /// Source of backing files
    pool: SpillFilePool,
    /// Rotation threshold
    max_records_per_file: usize,
    /// File accepting writes
    in_progress: Option<SpillRecordFile>,
    /// Full files waiting to be read, oldest first
    populated: VecDeque<SpillRecordFile>,
    /// File being read
    unspiller: Option<SpillRecordFile>,
    /// Records spilled over the queue's lifetime
    total_spilled: u64,
    /// Records unspilled over the queue's lifetime
    total_unspilled: u64,
}

impl SpillQueue {
    /// Create a queue drawing files from `pool`
    pub fn new(pool: SpillFilePool, max_records_per_file: usize) -> Self {
        Self {
            pool,
            max_records_per_file: max_records_per_file.max(1),
            in_progress: None,
            populated: VecDeque::new(),
            unspiller: None,
            total_spilled: 0,
            total_unspilled: 0,
        }
    }

    /// Append one record
    ///
    /// On a write failure the in-progress file is abandoned; the error
    /// reports how many records went with it, the current one included.
    pub fn spill(&mut self, bytes: &[u8]) -> SpillResult<()> {
        let mut file = match self.in_progress.take() {
            Some(file) => file,
            None => self
                .pool
                .acquire()
                .map_err(|e| SpillError::Pool { lost: 1, source: e })?,
        };

        if let Err(e) = file.write_record(bytes) {
            let lost = file.count() + 1;
            error!(
                "Abandoning spill file {:?} after write failure, {} records lost",
                file.path(),
                lost
            );
            self.pool.discard(file);
            return Err(SpillError::File { lost, source: e });
        }

        self.total_spilled += 1;

        if file.count() >= self.max_records_per_file {
            if let Err(e) = file.close_for_writing() {
                let lost = file.count();
                error!(
                    "Abandoning spill file {:?} after close failure, {} records lost",
                    file.path(),
                    lost
                );
                self.pool.discard(file);
                return Err(SpillError::File { lost, source: e });
            }

            trace!(
                "Rotated spill file {:?} with {} records",
                file.path(),
                file.count()
            );
            self.populated.push_back(file);
        } else {
            self.in_progress = Some(file);
        }

        Ok(())
    }

    /// Remove the oldest record, or `None` if nothing is spilled
    pub fn unspill(&mut self) -> SpillResult<Option<Vec<u8>>> {
        if self.unspiller.is_none() && !self.promote_unspiller()? {
            return Ok(None);
        }

        let mut file = match self.unspiller.take() {
            Some(file) => file,
            None => return Ok(None),
        };

        match file.read_record() {
            Ok(bytes) => {
                self.total_unspilled += 1;

                if file.is_at_end_of_file() {
                    trace!("Spill file {:?} drained", file.path());
                    self.pool.release(file);
                } else {
                    self.unspiller = Some(file);
                }

                Ok(Some(bytes))
            },
            Err(e) => {
                let lost = file.remaining();
                error!(
                    "Abandoning spill file {:?} after read failure, {} records lost",
                    file.path(),
                    lost
                );
                self.pool.discard(file);
                Err(SpillError::File { lost, source: e })
            },
        }
    }

    /// Pick the next file to read from
    ///
    /// Oldest populated file first, then the in-progress file if it holds
    /// anything. Returns false when there is nothing to read.
    fn promote_unspiller(&mut self) -> SpillResult<bool> {
        if let Some(mut file) = self.populated.pop_front() {
            if let Err(e) = file.open_for_reading() {
                let lost = file.count();
                self.pool.discard(file);
                return Err(SpillError::File { lost, source: e });
            }

            self.unspiller = Some(file);
            return Ok(true);
        }

        let has_unread = self.in_progress.as_ref().is_some_and(|f| f.count() > 0);
        if !has_unread {
            return Ok(false);
        }

        let mut file = match self.in_progress.take() {
            Some(file) => file,
            None => return Ok(false),
        };

        if let Err(e) = file.reopen_for_reading() {
            let lost = file.count();
            self.pool.discard(file);
            return Err(SpillError::File { lost, source: e });
        }

        self.unspiller = Some(file);
        Ok(true)
    }

    /// True while any record is waiting on disk
    pub fn is_spilling(&self) -> bool {
        !self.populated.is_empty()
            || self.in_progress.as_ref().is_some_and(|f| f.count() > 0)
            || self.unspiller.as_ref().is_some_and(|f| f.remaining() > 0)
    }

    /// Number of unread records on disk
    pub fn size(&self) -> usize {
        let writing = self.in_progress.as_ref().map_or(0, |f| f.count());
        let populated: usize = self.populated.iter().map(|f| f.count()).sum();
        let reading = self.unspiller.as_ref().map_or(0, |f| f.remaining());

        writing + populated + reading
    }

    /// Number of full files waiting to be read
    pub fn populated_files(&self) -> usize {
        self.populated.len()
    }

    /// Records in the in-progress file
    pub fn in_progress_len(&self) -> usize {
        self.in_progress.as_ref().map_or(0, |f| f.count())
    }

    /// Records spilled over the queue's lifetime
    pub fn total_spilled(&self) -> u64 {
        self.total_spilled
    }

    /// Records unspilled over the queue's lifetime
    pub fn total_unspilled(&self) -> u64 {
        self.total_unspilled
    }

    /// Access the file pool
    pub fn pool(&self) -> &SpillFilePool {
        &self.pool
    }

    /// Drop every undelivered record, returning how many were discarded
    pub fn discard_all(&mut self) -> usize {
        let discarded = self.size();

        if let Some(file) = self.unspiller.take() {
            self.pool.discard(file);
        }
        while let Some(file) = self.populated.pop_front() {
            self.pool.discard(file);
        }
        if let Some(file) = self.in_progress.take() {
            self.pool.discard(file);
        }

        if discarded > 0 {
            warn!(
                "Discarded {} undelivered spilled records in {:?}",
                discarded,
                self.pool.directory()
            );
        }

        discarded
    }

    /// Discard everything and reclaim the pool's files and directory
    pub fn close(mut self) -> usize {
        let discarded = self.discard_all();
        self.pool.reclaim_all();
        self.pool.remove_directory_if_empty();

        debug!(
            "Closed spill queue at {:?}: spilled {}, unspilled {}, discarded {}",
            self.pool.directory(),
            self.total_spilled,
            self.total_unspilled,
            discarded
        );

        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn queue(dir: &Path, per_file: usize) -> SpillQueue {
        SpillQueue::new(SpillFilePool::new(dir, true, false).unwrap(), per_file)
    }

    fn spill_n(q: &mut SpillQueue, range: std::ops::Range<u32>) {
        for i in range {
            q.spill(&i.to_be_bytes()).unwrap();
        }
    }

    fn unspill_u32(q: &mut SpillQueue) -> Option<u32> {
        q.unspill()
            .unwrap()
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[test]
    fn test_empty_queue() {
        let dir = tempdir().unwrap();
        let mut q = queue(dir.path(), 3);

        assert!(!q.is_spilling());
        assert_eq!(q.size(), 0);
        assert_eq!(q.unspill().unwrap(), None);
    }

    #[test]
    fn test_rotation() {
        let dir = tempdir().unwrap();
        let mut q = queue(dir.path(), 3);

        spill_n(&mut q, 0..7);

        assert_eq!(q.populated_files(), 2);
        assert_eq!(q.in_progress_len(), 1);
        assert_eq!(q.size(), 7);
        assert!(q.is_spilling());

        let drained: Vec<u32> = std::iter::from_fn(|| unspill_u32(&mut q)).collect();
        assert_eq!(drained, (0..7).collect::<Vec<_>>());
        assert!(!q.is_spilling());
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_interleaved_spill_unspill_is_fifo() {
        let dir = tempdir().unwrap();
        let mut q = queue(dir.path(), 2);
        let mut out = Vec::new();

        spill_n(&mut q, 0..3);
        out.push(unspill_u32(&mut q).unwrap());
        spill_n(&mut q, 3..6);
        out.push(unspill_u32(&mut q).unwrap());
        out.push(unspill_u32(&mut q).unwrap());
        spill_n(&mut q, 6..7);
        while let Some(v) = unspill_u32(&mut q) {
            out.push(v);
        }

        assert_eq!(out, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_in_progress_promoted_when_nothing_older() {
        let dir = tempdir().unwrap();
        let mut q = queue(dir.path(), 10);

        spill_n(&mut q, 0..2);
        assert_eq!(q.populated_files(), 0);
        assert_eq!(unspill_u32(&mut q), Some(0));
        assert_eq!(q.in_progress_len(), 0);

        // New writes go to a fresh file while the old one is read
        spill_n(&mut q, 2..4);
        assert_eq!(q.size(), 3);
        assert_eq!(unspill_u32(&mut q), Some(1));
        assert_eq!(unspill_u32(&mut q), Some(2));
        assert_eq!(unspill_u32(&mut q), Some(3));
        assert_eq!(unspill_u32(&mut q), None);
    }

    #[test]
    fn test_drained_file_is_reused() {
        let dir = tempdir().unwrap();
        let mut q = queue(dir.path(), 2);

        spill_n(&mut q, 0..2);
        let first_path = q.populated.front().unwrap().path().to_path_buf();
        unspill_u32(&mut q);
        unspill_u32(&mut q);
        assert_eq!(q.pool().reusable_count(), 1);

        spill_n(&mut q, 2..3);
        assert_eq!(q.in_progress.as_ref().unwrap().path(), first_path.as_path());
        assert_eq!(q.pool().files_created(), 1);
    }

    #[test]
    fn test_empty_record_round_trip() {
        let dir = tempdir().unwrap();
        let mut q = queue(dir.path(), 4);

        q.spill(b"").unwrap();
        assert!(q.is_spilling());
        assert_eq!(q.unspill().unwrap(), Some(Vec::new()));
        assert!(!q.is_spilling());
    }

    #[test]
    fn test_corrupt_file_is_abandoned() {
        let dir = tempdir().unwrap();
        let mut q = queue(dir.path(), 2);

        spill_n(&mut q, 0..4);
        let path = q.populated.front().unwrap().path().to_path_buf();
        std::fs::write(&path, [0u8; 16]).unwrap();

        let err = q.unspill().unwrap_err();
        assert_eq!(err.lost(), 2);

        // The second file is unaffected
        assert_eq!(unspill_u32(&mut q), Some(2));
        assert_eq!(unspill_u32(&mut q), Some(3));
    }

    #[test]
    fn test_close_discards_and_reclaims() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let mut q = queue(&work, 3);

        spill_n(&mut q, 0..5);
        unspill_u32(&mut q);

        assert_eq!(q.close(), 4);
        assert!(!work.exists());
    }
}
