//! Disk-space admission control.
//!
//! Writers ask a [`DiskSpaceChecker`] before extending a file. A `false`
//! answer is a refusal, not a failure: the write is abandoned with
//! [`io::ErrorKind::StorageFull`] and the caller decides whether to retry.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{trace, warn};

use crate::bucket::BucketError;

/// Default number of bytes written between two admission checks.
pub const DEFAULT_DISK_CHECK_INTERVAL: u64 = 1024 * 1024;

/// Decides whether `to_write` more bytes may be written under `path`.
///
/// `buffer_size` is the amount the caller will write before asking again, so
/// implementations may keep that much headroom in reserve.
pub trait DiskSpaceChecker: Send + Sync {
    fn check_disk_space(&self, path: &Path, to_write: u64, buffer_size: u64) -> bool;
}

impl<F> DiskSpaceChecker for F
where
    F: Fn(&Path, u64, u64) -> bool + Send + Sync,
{
    fn check_disk_space(&self, path: &Path, to_write: u64, buffer_size: u64) -> bool {
        self(path, to_write, buffer_size)
    }
}

/// Keeps at least `min_free` bytes available on the filesystem.
#[derive(Debug, Clone, Copy)]
pub struct MinFreeSpaceChecker {
    min_free: u64,
}

impl MinFreeSpaceChecker {
    pub fn new(min_free: u64) -> Self {
        Self { min_free }
    }

    pub fn min_free(&self) -> u64 {
        self.min_free
    }
}

impl DiskSpaceChecker for MinFreeSpaceChecker {
    fn check_disk_space(&self, path: &Path, to_write: u64, buffer_size: u64) -> bool {
        // Query the directory when the file itself does not exist yet
        let probe = if path.exists() {
            path
        } else {
            path.parent().unwrap_or(path)
        };

        match fs2::available_space(probe) {
            Ok(available) => {
                let needed = to_write
                    .saturating_add(buffer_size)
                    .saturating_add(self.min_free);
                trace!(available, needed, "Disk space check");
                available >= needed
            }
            Err(e) => {
                // An unanswerable query must not block all writes
                warn!(path = %probe.display(), error = %e, "Failed to query free disk space");
                true
            }
        }
    }
}

/// Per-stream batching of admission checks.
///
/// Consults the checker before the first write and then once every
/// `interval` bytes.
pub(crate) struct AdmissionGate {
    checker: Option<Arc<dyn DiskSpaceChecker>>,
    path: PathBuf,
    interval: u64,
    since_check: u64,
    checked: bool,
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("enabled", &self.checker.is_some())
            .field("path", &self.path)
            .field("interval", &self.interval)
            .field("since_check", &self.since_check)
            .finish()
    }
}

impl AdmissionGate {
    pub(crate) fn new(
        checker: Option<Arc<dyn DiskSpaceChecker>>,
        path: PathBuf,
        interval: u64,
    ) -> Self {
        Self {
            checker,
            path,
            interval: interval.max(1),
            since_check: 0,
            checked: false,
        }
    }

    /// Admit a write of `len` bytes or refuse it with `StorageFull`.
    pub(crate) fn admit(&mut self, len: u64) -> io::Result<()> {
        let Some(checker) = &self.checker else {
            return Ok(());
        };

        if self.checked && self.since_check.saturating_add(len) < self.interval {
            self.since_check += len;
            return Ok(());
        }

        if !checker.check_disk_space(&self.path, len, self.interval) {
            warn!(path = %self.path.display(), requested = len, "Write refused: insufficient disk space");
            return Err(insufficient_space(&self.path, len));
        }

        // The admitted write counts towards the next interval
        self.checked = true;
        self.since_check = len;
        Ok(())
    }
}

/// The `StorageFull` error surfaced to `Write` callers on refusal.
pub(crate) fn insufficient_space(path: &Path, requested: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::StorageFull,
        BucketError::InsufficientDiskSpace {
            path: path.to_path_buf(),
            requested,
        },
    )
}
