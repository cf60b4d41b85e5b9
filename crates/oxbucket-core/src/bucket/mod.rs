//! Buckets: named, sized, disposable byte containers.
//!
//! A bucket is used through the [`Bucket`] trait regardless of how many layers
//! it is built from. The concrete variants are:
//!
//! - [`TempFileBucket`]: a file in a managed temp directory
//! - [`PaddedBucket`]: pads its inner bucket to a block multiple on close
//! - [`AeadCryptBucket`]: authenticated encryption over its inner bucket
//!
//! Wrappers own an inner [`BucketHandle`] and delegate everything they do not
//! change. Each variant has a self-describing binary form written by
//! [`Bucket::store_to`] and read back by [`restore_bucket`], which dispatches
//! on a leading 4-byte magic.

pub mod aead;
mod codec;
pub mod file;
pub mod padded;

use std::{
    fmt,
    io::{self, BufReader, BufWriter, Read, Write},
    path::PathBuf,
    sync::Arc,
};

use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    cleaner::GlobalCleaner,
    crypto::{CryptoError, MasterSecret},
    fs::{DEFAULT_DISK_CHECK_INTERVAL, DiskSpaceChecker, FilenameGenerator},
    persist::{PersistentFileTracker, Resumable},
};

pub use aead::{AEAD_BUCKET_MAGIC, AeadCryptBucket};
pub use file::{FILE_BUCKET_MAGIC, FileBucketOptions, TempFileBucket};
pub use padded::{DEFAULT_PADDING_BLOCK_SIZE, PADDED_BUCKET_MAGIC, PaddedBucket, padded_length};

/// Buffer size of [`Bucket::output_stream`] and [`Bucket::input_stream`].
pub const STREAM_BUFFER_SIZE: usize = 32 * 1024;

/// Shared, type-erased bucket.
pub type BucketHandle = Arc<dyn Bucket>;

/// Readable view of a bucket's contents.
pub type InputStream = Box<dyn Read + Send>;

/// Writable view of a bucket's contents.
pub type OutputStream = Box<dyn BucketOutput>;

/// A writer that must be explicitly finalised.
///
/// `close` commits whatever the layer needs at the end of a stream: the final
/// AEAD chunk, padding fill, truncating preallocated space. It is idempotent;
/// writes after it fail. Dropping an unclosed stream closes it best-effort
/// and logs any failure, so callers who care about errors call `close`.
pub trait BucketOutput: Write + Send {
    fn close(&mut self) -> io::Result<()>;
}

/// Context for bucket errors
#[derive(Debug, Clone, Default)]
pub struct BucketContext {
    /// The bucket's name (if known)
    pub name: Option<String>,
    /// The backing file
    pub path: Option<PathBuf>,
    /// The operation that failed
    pub operation: Option<&'static str>,
}

impl BucketContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }
}

impl fmt::Display for BucketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(operation) = self.operation {
            parts.push(format!("during {operation}"));
        }
        if let Some(ref name) = self.name {
            parts.push(format!("bucket '{name}'"));
        }
        if let Some(ref path) = self.path {
            parts.push(format!("at {:?}", path.display()));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum BucketError {
    #[error("IO error {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: BucketContext,
    },

    #[error("Bucket is read-only: {context}")]
    ReadOnly { context: BucketContext },

    #[error("Bucket has been disposed: {context}")]
    Disposed { context: BucketContext },

    #[error("Insufficient disk space to write {requested} bytes under {path:?}")]
    InsufficientDiskSpace { path: PathBuf, requested: u64 },

    #[error("Cleaner has shut down, no new temp buckets under {path:?}")]
    ShutDown { path: PathBuf },

    #[error("Bucket format error: {0}")]
    Format(#[from] FormatError),

    #[error("Bucket crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<io::Error> for BucketError {
    fn from(source: io::Error) -> Self {
        BucketError::Io {
            source,
            context: BucketContext::new(),
        }
    }
}

impl BucketError {
    /// Create an IO error with context
    #[must_use]
    pub fn io_with_context(source: io::Error, context: BucketContext) -> Self {
        BucketError::Io { source, context }
    }

    /// Whether this error is a disk-space refusal, directly or carried
    /// inside an `io::Error` of kind `StorageFull`.
    pub fn is_admission_refusal(&self) -> bool {
        match self {
            BucketError::InsufficientDiskSpace { .. } => true,
            BucketError::Io { source, .. } => source.kind() == io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}

/// Malformed serialized bucket.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Unknown bucket magic {0:#010x}")]
    UnknownMagic(u32),

    #[error("Unsupported {kind} version: expected {expected}, got {actual}")]
    UnsupportedVersion {
        kind: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("Invalid key length {0}: expected 16, 24 or 32")]
    InvalidKeyLength(usize),

    #[error("Invalid value {value:#04x} for {field}")]
    InvalidFlag { field: &'static str, value: u8 },

    #[error("Serialized bucket truncated in {field}")]
    Truncated { field: &'static str },

    #[error("Bucket layers nested deeper than {max}")]
    TooDeep { max: usize },
}

/// A named, sized, disposable byte container.
///
/// All methods take `&self`; implementations are safe to share across
/// threads. Each stream returned is independent of every other stream.
pub trait Bucket: Resumable + Send + Sync + fmt::Debug {
    /// Human-readable name, usually the backing path.
    fn name(&self) -> String;

    /// Logical size in bytes, excluding any wrapper overhead.
    fn size(&self) -> u64;

    fn is_read_only(&self) -> bool;

    /// Make the bucket read-only. One-way and idempotent.
    fn set_read_only(&self);

    /// Open the bucket for writing, replacing its contents.
    ///
    /// Fails with [`BucketError::ReadOnly`] on read-only buckets.
    fn output_stream_unbuffered(&self) -> Result<OutputStream, BucketError>;

    fn output_stream(&self) -> Result<OutputStream, BucketError> {
        Ok(Box::new(BufferedOutput::new(self.output_stream_unbuffered()?)))
    }

    fn input_stream_unbuffered(&self) -> Result<InputStream, BucketError>;

    fn input_stream(&self) -> Result<InputStream, BucketError> {
        Ok(Box::new(BufReader::with_capacity(
            STREAM_BUFFER_SIZE,
            self.input_stream_unbuffered()?,
        )))
    }

    /// Release the backing storage. Safe to call repeatedly and from any
    /// thread; only the first call has an effect.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    /// An independent read-only view of the same bytes.
    ///
    /// Disposing the shadow never touches the original's storage. Returns
    /// `None` if the bucket has been disposed.
    fn create_shadow(&self) -> Option<BucketHandle>;

    /// Write the self-describing serialized form, magic first.
    fn store_to(&self, out: &mut dyn Write) -> Result<(), BucketError>;
}

/// [`OutputStream`] behind a [`BufWriter`].
pub struct BufferedOutput {
    inner: BufWriter<OutputStream>,
}

impl fmt::Debug for BufferedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedOutput")
            .field("buffered", &self.inner.buffer().len())
            .finish_non_exhaustive()
    }
}

impl BufferedOutput {
    pub fn new(inner: OutputStream) -> Self {
        Self {
            inner: BufWriter::with_capacity(STREAM_BUFFER_SIZE, inner),
        }
    }
}

impl Write for BufferedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl BucketOutput for BufferedOutput {
    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_mut().close()
    }
}

/// Collaborators needed to rebuild buckets from their serialized form.
#[derive(Clone)]
pub struct RestoreContext {
    generator: Arc<FilenameGenerator>,
    tracker: Option<Arc<PersistentFileTracker>>,
    master_secret: Option<Arc<MasterSecret>>,
    disk_space: Option<Arc<dyn DiskSpaceChecker>>,
    disk_check_interval: u64,
    cleaner: Arc<GlobalCleaner>,
}

impl fmt::Debug for RestoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreContext")
            .field("dir", &self.generator.dir())
            .field("tracker", &self.tracker.is_some())
            .field("master_secret", &self.master_secret.is_some())
            .field("disk_space", &self.disk_space.is_some())
            .finish_non_exhaustive()
    }
}

impl RestoreContext {
    pub fn new(generator: Arc<FilenameGenerator>) -> Self {
        Self {
            generator,
            tracker: None,
            master_secret: None,
            disk_space: None,
            disk_check_interval: DEFAULT_DISK_CHECK_INTERVAL,
            cleaner: GlobalCleaner::global(),
        }
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<PersistentFileTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    #[must_use]
    pub fn with_master_secret(mut self, master_secret: Arc<MasterSecret>) -> Self {
        self.master_secret = Some(master_secret);
        self
    }

    #[must_use]
    pub fn with_disk_space_checker(
        mut self,
        checker: Arc<dyn DiskSpaceChecker>,
        interval: u64,
    ) -> Self {
        self.disk_space = Some(checker);
        self.disk_check_interval = interval;
        self
    }

    #[must_use]
    pub fn with_cleaner(mut self, cleaner: Arc<GlobalCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn generator(&self) -> &Arc<FilenameGenerator> {
        &self.generator
    }

    pub fn tracker(&self) -> Option<&Arc<PersistentFileTracker>> {
        self.tracker.as_ref()
    }

    pub fn master_secret(&self) -> Option<&Arc<MasterSecret>> {
        self.master_secret.as_ref()
    }

    pub fn disk_space_checker(&self) -> Option<&Arc<dyn DiskSpaceChecker>> {
        self.disk_space.as_ref()
    }

    pub fn disk_check_interval(&self) -> u64 {
        self.disk_check_interval
    }

    pub fn cleaner(&self) -> &Arc<GlobalCleaner> {
        &self.cleaner
    }
}

/// Deepest wrapper nesting accepted when restoring.
pub const MAX_NESTING_DEPTH: usize = 8;

/// Rebuild a bucket from the form written by [`Bucket::store_to`].
pub fn restore_bucket(
    reader: &mut dyn Read,
    context: &RestoreContext,
) -> Result<BucketHandle, BucketError> {
    restore_nested(reader, context, 0)
}

/// Restore one layer; wrappers call back in with `depth + 1` for their inner
/// bucket.
pub(crate) fn restore_nested(
    reader: &mut dyn Read,
    context: &RestoreContext,
    depth: usize,
) -> Result<BucketHandle, BucketError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(FormatError::TooDeep {
            max: MAX_NESTING_DEPTH,
        }
        .into());
    }
    let magic = codec::read_u32(reader, "magic")?;
    trace!(magic = %format!("{magic:#010x}"), depth, "Restoring bucket");
    let bucket: BucketHandle = match magic {
        FILE_BUCKET_MAGIC => Arc::new(TempFileBucket::restore(reader, context)?),
        PADDED_BUCKET_MAGIC => Arc::new(PaddedBucket::restore(reader, context, depth)?),
        AEAD_BUCKET_MAGIC => Arc::new(AeadCryptBucket::restore(reader, context, depth)?),
        other => return Err(FormatError::UnknownMagic(other).into()),
    };
    Ok(bucket)
}

/// Close `stream`, logging instead of failing. Used from `Drop`.
pub(crate) fn close_on_drop(stream: &mut dyn BucketOutput, what: &str) {
    if let Err(e) = stream.close() {
        warn!(stream = what, error = %e, "Failed to close bucket stream on drop");
    }
}

pub(crate) fn closed_stream_error() -> io::Error {
    io::Error::other("bucket stream already closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        assert_eq!(BucketContext::new().to_string(), "(no context)");
        let ctx = BucketContext::new()
            .with_operation("write")
            .with_name("temp-1f");
        assert_eq!(ctx.to_string(), "during write, bucket 'temp-1f'");
    }

    #[test]
    fn test_unknown_magic() {
        let temp = tempfile::TempDir::new().unwrap();
        let generator = Arc::new(FilenameGenerator::new(temp.path(), "t-", false).unwrap());
        let ctx = RestoreContext::new(generator);
        let mut input: &[u8] = &[0xDE, 0xAD, 0xBE, 0xEF];
        let err = restore_bucket(&mut input, &ctx).unwrap_err();
        assert!(matches!(
            err,
            BucketError::Format(FormatError::UnknownMagic(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let temp = tempfile::TempDir::new().unwrap();
        let generator = Arc::new(FilenameGenerator::new(temp.path(), "t-", false).unwrap());
        let ctx = RestoreContext::new(generator);

        // Padded headers all the way down
        let mut stored = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH + 1 {
            stored.extend_from_slice(&PADDED_BUCKET_MAGIC.to_be_bytes());
            stored.extend_from_slice(&1u32.to_be_bytes());
            stored.extend_from_slice(&0u64.to_be_bytes());
            stored.extend_from_slice(&4096u32.to_be_bytes());
            stored.push(0);
        }
        let err = restore_bucket(&mut stored.as_slice(), &ctx).unwrap_err();
        assert!(matches!(
            err,
            BucketError::Format(FormatError::TooDeep { max: MAX_NESTING_DEPTH })
        ));
    }

    #[test]
    fn test_admission_refusal_detection() {
        let direct = BucketError::InsufficientDiskSpace {
            path: PathBuf::from("/x"),
            requested: 1,
        };
        assert!(direct.is_admission_refusal());

        let wrapped = BucketError::from(io::Error::from(io::ErrorKind::StorageFull));
        assert!(wrapped.is_admission_refusal());

        let other = BucketError::from(io::Error::from(io::ErrorKind::NotFound));
        assert!(!other.is_admission_refusal());
    }
}
