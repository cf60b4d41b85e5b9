//! File-backed buckets in a managed temp directory.
//!
//! Serialized form (big-endian):
//!
//! ```text
//! MAGIC(4) | VERSION(4) = 1 | ID(8) | FLAGS(1)
//! ```
//!
//! `FLAGS` bit 0 is read-only, bit 1 delete-on-dispose, bit 2 secure delete and
//! bit 3 persistent. Any other bit is a format error.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, trace, warn};

use super::{
    Bucket, BucketContext, BucketError, BucketHandle, BucketOutput, FormatError, InputStream,
    OutputStream, RestoreContext, close_on_drop, closed_stream_error, codec,
};
use crate::{
    cleaner::{CleanerHandle, GlobalCleaner},
    fs::{
        DEFAULT_DISK_CHECK_INTERVAL, DiskSpaceChecker, FileId, Preallocator,
        disk_space::AdmissionGate, filename::format_id, secure_delete,
    },
    persist::{DelayedDispose, PersistentFileTracker, ResumeContext, ResumeFailedError, Resumable},
};

/// `"OXBF"`
pub const FILE_BUCKET_MAGIC: u32 = 0x4f58_4246;
const FILE_BUCKET_VERSION: u32 = 1;

const FLAG_READ_ONLY: u8 = 1 << 0;
const FLAG_DELETE_ON_DISPOSE: u8 = 1 << 1;
const FLAG_SECURE_DELETE: u8 = 1 << 2;
const FLAG_PERSISTENT: u8 = 1 << 3;
const KNOWN_FLAGS: u8 = FLAG_READ_ONLY | FLAG_DELETE_ON_DISPOSE | FLAG_SECURE_DELETE | FLAG_PERSISTENT;

/// How a [`TempFileBucket`] behaves.
#[derive(Clone)]
pub struct FileBucketOptions {
    /// Delete the file when the bucket is disposed
    pub delete_on_dispose: bool,
    /// Overwrite before unlinking
    pub secure_delete: bool,
    /// Survives restarts; disposal goes through the tracker
    pub persistent: bool,
    /// Expected physical size, used for preallocation
    pub size_hint: u64,
    pub preallocate: bool,
    pub disk_space: Option<Arc<dyn DiskSpaceChecker>>,
    pub disk_check_interval: u64,
}

impl Default for FileBucketOptions {
    fn default() -> Self {
        Self {
            delete_on_dispose: true,
            secure_delete: false,
            persistent: false,
            size_hint: 0,
            preallocate: false,
            disk_space: None,
            disk_check_interval: DEFAULT_DISK_CHECK_INTERVAL,
        }
    }
}

impl fmt::Debug for FileBucketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBucketOptions")
            .field("delete_on_dispose", &self.delete_on_dispose)
            .field("secure_delete", &self.secure_delete)
            .field("persistent", &self.persistent)
            .field("size_hint", &self.size_hint)
            .field("preallocate", &self.preallocate)
            .field("disk_space", &self.disk_space.is_some())
            .field("disk_check_interval", &self.disk_check_interval)
            .finish()
    }
}

/// The file shared by a bucket and its shadows. Deleted at most once.
#[derive(Debug)]
pub(crate) struct FileTarget {
    path: RwLock<PathBuf>,
    secure_delete: bool,
    deleted: AtomicBool,
}

impl FileTarget {
    fn new(path: PathBuf, secure_delete: bool) -> Self {
        Self {
            path: RwLock::new(path),
            secure_delete,
            deleted: AtomicBool::new(false),
        }
    }

    fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    fn set_path(&self, path: PathBuf) {
        *self.path.write() = path;
    }

    /// Remove the file. Returns `false` (after logging) if it could not be
    /// removed, so the caller can retry.
    fn delete(&self) -> bool {
        if self.deleted.load(Ordering::Acquire) {
            return true;
        }
        let path = self.path();
        let result = if self.secure_delete {
            secure_delete(&path)
        } else {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        };
        match result {
            Ok(()) => {
                self.deleted.store(true, Ordering::Release);
                debug!(path = %path.display(), secure = self.secure_delete, "Deleted bucket file");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete bucket file");
                false
            }
        }
    }
}

impl DelayedDispose for FileTarget {
    fn real_dispose(&self) -> bool {
        self.delete()
    }

    fn path(&self) -> Option<PathBuf> {
        Some(FileTarget::path(self))
    }
}

/// A bucket backed by one file in a managed directory.
///
/// Non-persistent buckets register their deletion with the [`GlobalCleaner`],
/// so a bucket dropped without `dispose` still has its file removed.
/// Persistent buckets hand disposal to the [`PersistentFileTracker`], which
/// defers it until no durable snapshot can still reference the file.
pub struct TempFileBucket {
    id: FileId,
    target: Arc<FileTarget>,
    options: FileBucketOptions,
    shadow: bool,
    read_only: AtomicBool,
    disposed: AtomicBool,
    created_commit_id: AtomicU64,
    tracker: OnceLock<Arc<PersistentFileTracker>>,
    cleaner: Arc<GlobalCleaner>,
    cleaner_handle: Mutex<Option<CleanerHandle>>,
    // Lets the cleaner see when this bucket is gone
    liveness: Arc<()>,
}

impl fmt::Debug for TempFileBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempFileBucket")
            .field("id", &format_id(self.id))
            .field("path", &self.target.path())
            .field("shadow", &self.shadow)
            .field("read_only", &self.is_read_only())
            .field("disposed", &self.is_disposed())
            .field("persistent", &self.options.persistent)
            .finish_non_exhaustive()
    }
}

impl TempFileBucket {
    /// Wrap the already-created file at `path`.
    ///
    /// Persistent buckets attached to a tracker record its current commit ID
    /// as their creation generation.
    pub fn new(
        id: FileId,
        path: PathBuf,
        options: FileBucketOptions,
        tracker: Option<Arc<PersistentFileTracker>>,
        cleaner: Arc<GlobalCleaner>,
    ) -> Self {
        let created = match (&tracker, options.persistent) {
            (Some(tracker), true) => tracker.commit_id(),
            _ => 0,
        };
        let bucket = Self::build(id, path, options, false, created, tracker, cleaner);
        bucket.register_cleanup();
        bucket
    }

    fn build(
        id: FileId,
        path: PathBuf,
        options: FileBucketOptions,
        shadow: bool,
        created_commit_id: u64,
        tracker: Option<Arc<PersistentFileTracker>>,
        cleaner: Arc<GlobalCleaner>,
    ) -> Self {
        let target = Arc::new(FileTarget::new(path, options.secure_delete));
        Self::with_target(id, target, options, shadow, created_commit_id, tracker, cleaner)
    }

    fn with_target(
        id: FileId,
        target: Arc<FileTarget>,
        options: FileBucketOptions,
        shadow: bool,
        created_commit_id: u64,
        tracker: Option<Arc<PersistentFileTracker>>,
        cleaner: Arc<GlobalCleaner>,
    ) -> Self {
        let tracker_cell = OnceLock::new();
        if let Some(tracker) = tracker {
            let _ = tracker_cell.set(tracker);
        }
        Self {
            id,
            target,
            options,
            shadow,
            read_only: AtomicBool::new(shadow),
            disposed: AtomicBool::new(false),
            created_commit_id: AtomicU64::new(created_commit_id),
            tracker: tracker_cell,
            cleaner,
            cleaner_handle: Mutex::new(None),
            liveness: Arc::new(()),
        }
    }

    fn owns_file(&self) -> bool {
        !self.shadow && self.options.delete_on_dispose
    }

    fn register_cleanup(&self) {
        if !self.owns_file() || self.options.persistent {
            return;
        }
        let target = Arc::clone(&self.target);
        let handle = self
            .cleaner
            .register_fallible(&self.liveness, move || target.delete());
        *self.cleaner_handle.lock() = Some(handle);
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> PathBuf {
        self.target.path()
    }

    pub fn is_persistent(&self) -> bool {
        self.options.persistent
    }

    pub fn is_shadow(&self) -> bool {
        self.shadow
    }

    /// The commit ID this bucket was created (or resumed) under; 0 if unknown.
    pub fn created_commit_id(&self) -> u64 {
        self.created_commit_id.load(Ordering::Acquire)
    }

    fn context(&self, operation: &'static str) -> BucketContext {
        BucketContext::new()
            .with_operation(operation)
            .with_path(self.target.path())
    }

    fn ensure_live(&self, operation: &'static str) -> Result<(), BucketError> {
        if self.is_disposed() {
            return Err(BucketError::Disposed {
                context: self.context(operation),
            });
        }
        Ok(())
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_read_only() {
            flags |= FLAG_READ_ONLY;
        }
        if self.owns_file() {
            flags |= FLAG_DELETE_ON_DISPOSE;
        }
        if self.options.secure_delete {
            flags |= FLAG_SECURE_DELETE;
        }
        if self.options.persistent {
            flags |= FLAG_PERSISTENT;
        }
        flags
    }

    /// Read the body that follows [`FILE_BUCKET_MAGIC`].
    pub(crate) fn restore(
        reader: &mut dyn std::io::Read,
        context: &RestoreContext,
    ) -> Result<Self, BucketError> {
        codec::expect_version(reader, "file bucket", FILE_BUCKET_VERSION)?;
        let id = codec::read_u64(reader, "file id")? as FileId;
        let flags = codec::read_u8(reader, "file flags")?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(FormatError::InvalidFlag {
                field: "file flags",
                value: flags,
            }
            .into());
        }

        let options = FileBucketOptions {
            delete_on_dispose: flags & FLAG_DELETE_ON_DISPOSE != 0,
            secure_delete: flags & FLAG_SECURE_DELETE != 0,
            persistent: flags & FLAG_PERSISTENT != 0,
            size_hint: 0,
            preallocate: false,
            disk_space: context.disk_space_checker().cloned(),
            disk_check_interval: context.disk_check_interval(),
        };
        let path = context.generator().get_path(id);
        trace!(path = %path.display(), flags, "Restored file bucket");

        // Creation generation stays unknown until on_resume stamps it
        let bucket = Self::build(
            id,
            path,
            options,
            false,
            0,
            context.tracker().cloned(),
            Arc::clone(context.cleaner()),
        );
        if flags & FLAG_READ_ONLY != 0 {
            bucket.read_only.store(true, Ordering::Release);
        }
        bucket.register_cleanup();
        Ok(bucket)
    }
}

impl Resumable for TempFileBucket {
    #[instrument(level = "debug", skip_all, fields(id = %format_id(self.id)))]
    fn on_resume(&self, context: &ResumeContext) -> Result<(), ResumeFailedError> {
        if !self.options.persistent {
            return Ok(());
        }
        let tracker = context.tracker();
        let _ = self.tracker.set(Arc::clone(tracker));
        self.created_commit_id
            .store(tracker.commit_id(), Ordering::Release);

        let path = self.target.path();
        let managed = tracker.generator().maybe_move(&path, self.id);
        if managed != path {
            self.target.set_path(managed.clone());
        }
        if !managed.is_file() {
            return Err(ResumeFailedError::MissingFile { path: managed });
        }
        let expected = tracker.generator().get_path(self.id);
        if managed != expected {
            return Err(ResumeFailedError::Tracker {
                reason: format!(
                    "{} could not be moved to {}",
                    managed.display(),
                    expected.display()
                ),
            });
        }
        tracker.register(&managed);
        Ok(())
    }
}

impl Bucket for TempFileBucket {
    fn name(&self) -> String {
        self.target.path().display().to_string()
    }

    fn size(&self) -> u64 {
        fs::metadata(self.target.path()).map_or(0, |m| m.len())
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    fn output_stream_unbuffered(&self) -> Result<OutputStream, BucketError> {
        self.ensure_live("open for writing")?;
        if self.is_read_only() {
            return Err(BucketError::ReadOnly {
                context: self.context("open for writing"),
            });
        }

        let path = self.target.path();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| BucketError::io_with_context(e, self.context("open for writing")))?;

        let mut preallocated = false;
        if self.options.preallocate && self.options.size_hint > 0 {
            let dir = path.parent().unwrap_or(Path::new("."));
            match Preallocator::global(dir).preallocate(&mut file, self.options.size_hint) {
                Ok(()) => preallocated = true,
                Err(e) => warn!(path = %path.display(), error = %e, "Preallocation failed"),
            }
        }

        let gate = AdmissionGate::new(
            self.options.disk_space.clone(),
            path.clone(),
            self.options.disk_check_interval,
        );
        Ok(Box::new(FileOutput {
            file: Some(file),
            path,
            gate,
            written: 0,
            truncate_on_close: preallocated,
            sync_on_close: self.options.persistent,
        }))
    }

    fn input_stream_unbuffered(&self) -> Result<InputStream, BucketError> {
        self.ensure_live("open for reading")?;
        let file = File::open(self.target.path())
            .map_err(|e| BucketError::io_with_context(e, self.context("open for reading")))?;
        Ok(Box::new(file))
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let path = self.target.path();

        if !self.owns_file() {
            trace!(path = %path.display(), "Disposed non-owning file bucket");
            return;
        }

        if self.options.persistent {
            match self.tracker.get() {
                Some(tracker) => {
                    let outcome = tracker.delayed_dispose(
                        Arc::clone(&self.target) as Arc<dyn DelayedDispose>,
                        self.created_commit_id(),
                    );
                    debug!(path = %path.display(), ?outcome, "Persistent bucket disposal requested");
                }
                None => {
                    warn!(path = %path.display(), "Persistent bucket disposed without a tracker, leaving file for the resume sweep");
                }
            }
            return;
        }

        match self.cleaner_handle.lock().take() {
            Some(handle) => {
                self.cleaner.clean(handle);
            }
            None => {
                if !self.target.delete() {
                    let target = Arc::clone(&self.target);
                    let _retry = self.cleaner.retry_later(move || target.delete());
                }
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn create_shadow(&self) -> Option<BucketHandle> {
        if self.is_disposed() {
            return None;
        }
        let shadow = Self::with_target(
            self.id,
            Arc::clone(&self.target),
            self.options.clone(),
            true,
            self.created_commit_id(),
            self.tracker.get().cloned(),
            Arc::clone(&self.cleaner),
        );
        Some(Arc::new(shadow))
    }

    fn store_to(&self, out: &mut dyn Write) -> Result<(), BucketError> {
        codec::write_u32(out, FILE_BUCKET_MAGIC)?;
        codec::write_u32(out, FILE_BUCKET_VERSION)?;
        codec::write_u64(out, self.id as u64)?;
        codec::write_u8(out, self.flags())
    }
}

impl Drop for TempFileBucket {
    fn drop(&mut self) {
        if let Some(handle) = self.cleaner_handle.get_mut().take() {
            self.cleaner.clean(handle);
        }
    }
}

/// Write side of a [`TempFileBucket`].
struct FileOutput {
    file: Option<File>,
    path: PathBuf,
    gate: AdmissionGate,
    written: u64,
    truncate_on_close: bool,
    sync_on_close: bool,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self.file.as_mut().ok_or_else(closed_stream_error)?;
        self.gate.admit(buf.len() as u64)?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl BucketOutput for FileOutput {
    fn close(&mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        if self.truncate_on_close {
            file.set_len(self.written)?;
        }
        if self.sync_on_close {
            file.sync_all()?;
        }
        trace!(path = %self.path.display(), written = self.written, "Closed file bucket stream");
        Ok(())
    }
}

impl Drop for FileOutput {
    fn drop(&mut self) {
        if self.file.is_some() {
            close_on_drop(self, "file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FilenameGenerator;
    use std::io::Read;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<FilenameGenerator>, Arc<GlobalCleaner>) {
        let temp = TempDir::new().unwrap();
        let generator = Arc::new(FilenameGenerator::new(temp.path(), "t-", false).unwrap());
        (temp, generator, Arc::new(GlobalCleaner::new()))
    }

    fn make(
        generator: &FilenameGenerator,
        cleaner: &Arc<GlobalCleaner>,
        options: FileBucketOptions,
    ) -> TempFileBucket {
        let id = generator.make_random_filename().unwrap();
        TempFileBucket::new(id, generator.get_path(id), options, None, Arc::clone(cleaner))
    }

    fn write(bucket: &dyn Bucket, data: &[u8]) {
        let mut out = bucket.output_stream().unwrap();
        out.write_all(data).unwrap();
        out.close().unwrap();
    }

    fn read(bucket: &dyn Bucket) -> Vec<u8> {
        let mut buf = Vec::new();
        bucket.input_stream().unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_write_read_dispose() {
        let (_temp, generator, cleaner) = setup();
        let bucket = make(&generator, &cleaner, FileBucketOptions::default());
        let path = bucket.path();

        write(&bucket, b"hello world");
        assert_eq!(bucket.size(), 11);
        assert_eq!(read(&bucket), b"hello world");
        assert_eq!(cleaner.len(), 1);

        bucket.dispose();
        bucket.dispose();
        assert!(!path.exists());
        assert!(bucket.is_disposed());
        assert!(cleaner.is_empty());
        assert!(matches!(
            bucket.input_stream(),
            Err(BucketError::Disposed { .. })
        ));
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let (_temp, generator, cleaner) = setup();
        let bucket = make(&generator, &cleaner, FileBucketOptions::default());
        bucket.set_read_only();
        bucket.set_read_only();
        assert!(matches!(
            bucket.output_stream(),
            Err(BucketError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_failed_delete_is_retried_by_cleaner() {
        let (_temp, generator, cleaner) = setup();
        let bucket = make(&generator, &cleaner, FileBucketOptions::default());
        let path = bucket.path();

        // A non-empty directory in its place cannot be unlinked
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("blocker"), b"x").unwrap();

        bucket.dispose();
        assert!(bucket.is_disposed());
        assert_eq!(cleaner.len(), 1, "failed deletion was dropped");

        assert_eq!(cleaner.reap(), 0);
        assert_eq!(cleaner.len(), 1);

        std::fs::remove_dir_all(&path).unwrap();
        std::fs::write(&path, b"stale").unwrap();
        assert_eq!(cleaner.reap(), 1);
        assert!(!path.exists());
        assert!(cleaner.is_empty());
    }

    #[test]
    fn test_drop_deletes_temp_file() {
        let (_temp, generator, cleaner) = setup();
        let bucket = make(&generator, &cleaner, FileBucketOptions::default());
        let path = bucket.path();
        assert!(path.exists());

        drop(bucket);
        assert!(!path.exists());
        assert!(cleaner.is_empty());
    }

    #[test]
    fn test_preallocated_file_truncated_on_close() {
        let (_temp, generator, cleaner) = setup();
        let options = FileBucketOptions {
            size_hint: 100_000,
            preallocate: true,
            ..FileBucketOptions::default()
        };
        let bucket = make(&generator, &cleaner, options);

        write(&bucket, &[7u8; 1234]);
        assert_eq!(bucket.size(), 1234);
        assert_eq!(read(&bucket), vec![7u8; 1234]);
    }

    #[test]
    fn test_shadow_is_read_only_and_non_owning() {
        let (_temp, generator, cleaner) = setup();
        let bucket = make(&generator, &cleaner, FileBucketOptions::default());
        write(&bucket, b"hello");

        let shadow = bucket.create_shadow().unwrap();
        assert!(shadow.is_read_only());
        assert!(shadow.output_stream().is_err());

        shadow.dispose();
        assert!(bucket.path().exists());
        assert_eq!(read(&bucket), b"hello");

        // Writes to the original are visible through a fresh shadow
        write(&bucket, b"changed");
        let shadow = bucket.create_shadow().unwrap();
        assert_eq!(read(shadow.as_ref()), b"changed");
    }

    #[test]
    fn test_store_restore() {
        let (_temp, generator, cleaner) = setup();
        let bucket = make(&generator, &cleaner, FileBucketOptions::default());
        write(&bucket, b"persist me");
        bucket.set_read_only();

        let mut stored = Vec::new();
        bucket.store_to(&mut stored).unwrap();
        assert_eq!(&stored[..4], &FILE_BUCKET_MAGIC.to_be_bytes());

        let ctx = RestoreContext::new(Arc::clone(&generator)).with_cleaner(Arc::clone(&cleaner));
        let restored = crate::bucket::restore_bucket(&mut stored.as_slice(), &ctx).unwrap();
        assert!(restored.is_read_only());
        assert_eq!(restored.name(), bucket.name());
        assert_eq!(read(restored.as_ref()), b"persist me");
    }

    #[test]
    fn test_restore_rejects_unknown_flags() {
        let (_temp, generator, _cleaner) = setup();
        let mut stored = Vec::new();
        stored.extend_from_slice(&FILE_BUCKET_MAGIC.to_be_bytes());
        stored.extend_from_slice(&1u32.to_be_bytes());
        stored.extend_from_slice(&5u64.to_be_bytes());
        stored.push(0x80);

        let ctx = RestoreContext::new(generator);
        assert!(matches!(
            crate::bucket::restore_bucket(&mut stored.as_slice(), &ctx),
            Err(BucketError::Format(FormatError::InvalidFlag { value: 0x80, .. }))
        ));
    }

    #[test]
    fn test_write_refused_when_disk_full() {
        let (_temp, generator, cleaner) = setup();
        let options = FileBucketOptions {
            disk_space: Some(Arc::new(|_: &Path, _: u64, _: u64| false)),
            ..FileBucketOptions::default()
        };
        let bucket = make(&generator, &cleaner, options);

        let mut out = bucket.output_stream_unbuffered().unwrap();
        let err = out.write_all(b"data").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
    }

    #[test]
    fn test_secure_delete_removes_file() {
        let (_temp, generator, cleaner) = setup();
        let options = FileBucketOptions {
            secure_delete: true,
            ..FileBucketOptions::default()
        };
        let bucket = make(&generator, &cleaner, options);
        write(&bucket, &[1u8; 4096]);
        let path = bucket.path();
        bucket.dispose();
        assert!(!path.exists());
    }
}
