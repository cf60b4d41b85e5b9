//! Block padding, so file sizes on disk only reveal a coarse length.
//!
//! Serialized form (big-endian):
//!
//! ```text
//! MAGIC(4) | VERSION(4) = 1 | SIZE(8) | BLOCK(4) | READONLY(1) | inner
//! ```

use std::{
    fmt,
    io::{self, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use rand::RngCore;
use tracing::trace;

use super::{
    Bucket, BucketContext, BucketError, BucketHandle, BucketOutput, InputStream, OutputStream,
    RestoreContext, close_on_drop, closed_stream_error, codec, restore_nested,
};
use crate::persist::{ResumeContext, ResumeFailedError, Resumable};

/// `"OXBP"`
pub const PADDED_BUCKET_MAGIC: u32 = 0x4f58_4250;
const PADDED_BUCKET_VERSION: u32 = 1;

pub const DEFAULT_PADDING_BLOCK_SIZE: u64 = 4096;

const PAD_BUFFER_SIZE: usize = 8192;

/// `len` rounded up to a whole number of blocks, at least one block.
///
/// A block size of zero disables padding.
pub fn padded_length(len: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return len;
    }
    len.div_ceil(block_size).max(1).saturating_mul(block_size)
}

/// Pads the inner bucket with random bytes up to a block multiple on close.
///
/// The logical size is tracked here, not derived from the inner bucket, and
/// reads stop there. Shadows share the recorded size, so a write through the
/// original is visible to them once closed.
pub struct PaddedBucket {
    inner: BucketHandle,
    block_size: u64,
    size: Arc<AtomicU64>,
    read_only: AtomicBool,
}

impl fmt::Debug for PaddedBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaddedBucket")
            .field("inner", &self.inner)
            .field("block_size", &self.block_size)
            .field("size", &self.size())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl PaddedBucket {
    /// `block_size` of zero is treated as one (no effective padding).
    pub fn new(inner: BucketHandle, block_size: u64) -> Self {
        let read_only = inner.is_read_only();
        Self {
            inner,
            block_size: block_size.max(1),
            size: Arc::new(AtomicU64::new(0)),
            read_only: AtomicBool::new(read_only),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn inner(&self) -> &BucketHandle {
        &self.inner
    }

    pub(crate) fn restore(
        reader: &mut dyn Read,
        context: &RestoreContext,
        depth: usize,
    ) -> Result<Self, BucketError> {
        codec::expect_version(reader, "padded bucket", PADDED_BUCKET_VERSION)?;
        let size = codec::read_u64(reader, "padded size")?;
        let block_size = u64::from(codec::read_u32(reader, "padding block size")?);
        let read_only = codec::read_bool(reader, "padded read-only")?;
        let inner = restore_nested(reader, context, depth + 1)?;

        Ok(Self {
            inner,
            block_size: block_size.max(1),
            size: Arc::new(AtomicU64::new(size)),
            read_only: AtomicBool::new(read_only),
        })
    }
}

impl Resumable for PaddedBucket {
    fn on_resume(&self, context: &ResumeContext) -> Result<(), ResumeFailedError> {
        self.inner.on_resume(context)
    }
}

impl Bucket for PaddedBucket {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
        self.inner.set_read_only();
    }

    fn output_stream_unbuffered(&self) -> Result<OutputStream, BucketError> {
        if self.is_read_only() {
            return Err(BucketError::ReadOnly {
                context: BucketContext::new()
                    .with_operation("open for writing")
                    .with_name(self.name()),
            });
        }
        let inner = self.inner.output_stream_unbuffered()?;
        Ok(Box::new(PaddedOutput {
            inner: Some(inner),
            block_size: self.block_size,
            written: 0,
            size: Arc::clone(&self.size),
        }))
    }

    fn input_stream_unbuffered(&self) -> Result<InputStream, BucketError> {
        let inner = self.inner.input_stream_unbuffered()?;
        Ok(Box::new(inner.take(self.size())))
    }

    fn dispose(&self) {
        self.inner.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    fn create_shadow(&self) -> Option<BucketHandle> {
        let inner = self.inner.create_shadow()?;
        Some(Arc::new(Self {
            inner,
            block_size: self.block_size,
            size: Arc::clone(&self.size),
            read_only: AtomicBool::new(true),
        }))
    }

    fn store_to(&self, out: &mut dyn Write) -> Result<(), BucketError> {
        codec::write_u32(out, PADDED_BUCKET_MAGIC)?;
        codec::write_u32(out, PADDED_BUCKET_VERSION)?;
        codec::write_u64(out, self.size())?;
        codec::write_u32(out, u32::try_from(self.block_size).unwrap_or(u32::MAX))?;
        codec::write_bool(out, self.is_read_only())?;
        self.inner.store_to(out)
    }
}

struct PaddedOutput {
    inner: Option<OutputStream>,
    block_size: u64,
    written: u64,
    size: Arc<AtomicU64>,
}

impl Write for PaddedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let inner = self.inner.as_mut().ok_or_else(closed_stream_error)?;
        let n = inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl BucketOutput for PaddedOutput {
    fn close(&mut self) -> io::Result<()> {
        let Some(mut inner) = self.inner.take() else {
            return Ok(());
        };

        let mut remaining = padded_length(self.written, self.block_size) - self.written;
        trace!(written = self.written, padding = remaining, "Padding bucket");
        let mut rng = rand::rng();
        let mut fill = [0u8; PAD_BUFFER_SIZE];
        while remaining > 0 {
            let n = remaining.min(PAD_BUFFER_SIZE as u64) as usize;
            rng.fill_bytes(&mut fill[..n]);
            inner.write_all(&fill[..n])?;
            remaining -= n as u64;
        }

        inner.close()?;
        self.size.store(self.written, Ordering::Release);
        Ok(())
    }
}

impl Drop for PaddedOutput {
    fn drop(&mut self) {
        if self.inner.is_some() {
            close_on_drop(self, "padded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bucket::{FileBucketOptions, TempFileBucket, restore_bucket},
        cleaner::GlobalCleaner,
        fs::FilenameGenerator,
    };
    use tempfile::TempDir;

    fn file_bucket(generator: &FilenameGenerator, cleaner: &Arc<GlobalCleaner>) -> BucketHandle {
        let id = generator.make_random_filename().unwrap();
        Arc::new(TempFileBucket::new(
            id,
            generator.get_path(id),
            FileBucketOptions::default(),
            None,
            Arc::clone(cleaner),
        ))
    }

    #[test]
    fn test_padded_length() {
        assert_eq!(padded_length(0, 4096), 4096);
        assert_eq!(padded_length(1, 4096), 4096);
        assert_eq!(padded_length(4096, 4096), 4096);
        assert_eq!(padded_length(4097, 4096), 8192);
        assert_eq!(padded_length(123, 0), 123);
    }

    #[test]
    fn test_pads_file_and_limits_reads() {
        let temp = TempDir::new().unwrap();
        let generator = FilenameGenerator::new(temp.path(), "p-", false).unwrap();
        let cleaner = Arc::new(GlobalCleaner::new());
        let inner = file_bucket(&generator, &cleaner);
        let padded = PaddedBucket::new(Arc::clone(&inner), 1024);

        let mut out = padded.output_stream().unwrap();
        out.write_all(&[9u8; 1500]).unwrap();
        out.close().unwrap();

        assert_eq!(padded.size(), 1500);
        assert_eq!(inner.size(), 2048);

        let mut data = Vec::new();
        padded.input_stream().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![9u8; 1500]);
    }

    #[test]
    fn test_shadow_sees_size() {
        let temp = TempDir::new().unwrap();
        let generator = FilenameGenerator::new(temp.path(), "p-", false).unwrap();
        let cleaner = Arc::new(GlobalCleaner::new());
        let padded = PaddedBucket::new(file_bucket(&generator, &cleaner), 64);
        let shadow = padded.create_shadow().unwrap();

        let mut out = padded.output_stream().unwrap();
        out.write_all(b"abc").unwrap();
        out.close().unwrap();

        assert_eq!(shadow.size(), 3);
        assert!(shadow.is_read_only());
    }

    #[test]
    fn test_store_restore() {
        let temp = TempDir::new().unwrap();
        let generator = Arc::new(FilenameGenerator::new(temp.path(), "p-", false).unwrap());
        let cleaner = Arc::new(GlobalCleaner::new());
        let padded = PaddedBucket::new(file_bucket(&generator, &cleaner), 512);

        let mut out = padded.output_stream().unwrap();
        out.write_all(b"padded payload").unwrap();
        out.close().unwrap();

        let mut stored = Vec::new();
        padded.store_to(&mut stored).unwrap();

        let ctx = RestoreContext::new(generator).with_cleaner(Arc::clone(&cleaner));
        let restored = restore_bucket(&mut stored.as_slice(), &ctx).unwrap();
        assert_eq!(restored.size(), 14);

        let mut data = Vec::new();
        restored.input_stream().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"padded payload");
    }
}
