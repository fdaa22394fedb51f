//! Serialized copies into one destination filesystem
//!
//! Producers call [`CopyQueue::enqueue`] from any thread. A single consumer at a
//! time runs [`CopyQueue::drain`], which performs the physical copies one by
//! one. An entry leaves the queue only once its copy has been attempted; a
//! failed copy is recorded and the drain moves on.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

use crate::error::{Result, VhdiffError};
use crate::fs::{ensure_writable, parent, SharedFileSystem};
use crate::types::{CopyReport, FailedEntry};

/// One pending copy
#[derive(Clone)]
struct CopyJob {
    source: SharedFileSystem,
    source_path: String,
    dest_path: String,
}

/// Bounded-consumer copy queue for a shared destination
pub struct CopyQueue {
    destination: SharedFileSystem,
    pending: Mutex<VecDeque<CopyJob>>,
    drain_lock: Mutex<()>,
}

impl std::fmt::Debug for CopyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyQueue")
            .field("destination", &self.destination.kind())
            .field("pending", &self.pending())
            .finish()
    }
}

impl CopyQueue {
    /// Queue that writes into `destination`
    pub fn new(destination: SharedFileSystem) -> Self {
        Self {
            destination,
            pending: Mutex::new(VecDeque::new()),
            drain_lock: Mutex::new(()),
        }
    }

    /// Schedule `source_path` on `source` to be written at `dest_path`
    pub fn enqueue(&self, source: SharedFileSystem, source_path: impl Into<String>, dest_path: impl Into<String>) {
        let job = CopyJob {
            source,
            source_path: source_path.into(),
            dest_path: dest_path.into(),
        };
        trace!("Queued {} -> {}", job.source_path, job.dest_path);
        self.pending.lock().push_back(job);
    }

    /// Copies not yet attempted
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Copy everything queued so far, blocking while another drain runs
    pub fn drain(&self) -> CopyReport {
        let _consumer = self.drain_lock.lock();
        self.drain_locked()
    }

    /// Like [`drain`](Self::drain), but returns `None` instead of waiting for
    /// a drain already in progress
    pub fn try_drain(&self) -> Option<CopyReport> {
        let _consumer = self.drain_lock.try_lock()?;
        Some(self.drain_locked())
    }

    fn drain_locked(&self) -> CopyReport {
        let mut report = CopyReport::default();
        loop {
            // Peek only; the sole consumer pops after the attempt.
            let Some(job) = self.pending.lock().front().cloned() else { break };
            match self.copy_one(&job) {
                Ok(bytes) => {
                    report.files_copied += 1;
                    report.bytes_copied += bytes;
                }
                Err(e) => {
                    warn!("Copy of {} to {} failed: {}", job.source_path, job.dest_path, e);
                    report.failures.push(FailedEntry::new(job.source_path.clone(), e));
                }
            }
            self.pending.lock().pop_front();
        }
        if report.files_copied > 0 || !report.failures.is_empty() {
            debug!(
                "Drained {} files ({} bytes, {} failed)",
                report.files_copied,
                report.bytes_copied,
                report.failures.len()
            );
        }
        report
    }

    fn copy_one(&self, job: &CopyJob) -> Result<u64> {
        ensure_writable(self.destination.as_ref())?;
        if let Some(limit) = self.destination.max_file_size() {
            if let Some(stat) = job.source.metadata(&job.source_path)? {
                if stat.size > limit {
                    return Err(VhdiffError::FileTooLarge {
                        path: job.source_path.clone(),
                        size: stat.size,
                        limit,
                    });
                }
            }
        }
        let dir = parent(&job.dest_path);
        if !dir.is_empty() {
            self.destination.create_dir_all(dir)?;
        }
        let mut written = 0;
        job.source.read_with(&job.source_path, &mut |reader| {
            written = self.destination.write_from(&job.dest_path, reader)?;
            Ok(())
        })?;
        Ok(written)
    }
}
