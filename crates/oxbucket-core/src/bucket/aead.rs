//! Authenticated encryption over an arbitrary inner bucket.
//!
//! Serialized form (big-endian):
//!
//! ```text
//! MAGIC(4) | VERSION(4) = 1 | KEY_LEN(1) | KEY(KEY_LEN) | READONLY(1) | inner
//! ```
//!
//! `KEY_LEN` must be 16, 24 or 32. The key is stored in the clear; the
//! serialized form must itself live somewhere protected.
//!
//! # Reading
//!
//! Each chunk is authenticated before its plaintext is returned, but stream
//! completeness is only known at the final chunk. A reader abandoned before
//! EOF has not verified that the stream was not truncated.

use std::{
    fmt,
    io::{self, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, instrument};
use zeroize::Zeroizing;

use super::{
    Bucket, BucketContext, BucketError, BucketHandle, BucketOutput, FormatError, InputStream,
    OutputStream, RestoreContext, close_on_drop, codec, restore_nested,
};
use crate::{
    crypto::{
        KeySize,
        stream::{AeadStreamReader, AeadStreamWriter, encrypted_to_plaintext_size},
    },
    persist::{ResumeContext, ResumeFailedError, Resumable},
};

/// `"OXBA"`
pub const AEAD_BUCKET_MAGIC: u32 = 0x4f58_4241;
const AEAD_BUCKET_VERSION: u32 = 1;

/// Encrypts everything written to the inner bucket with AES-GCM.
///
/// Every output stream uses a fresh random stream nonce, so rewriting the
/// bucket under the same key never reuses a nonce.
pub struct AeadCryptBucket {
    inner: BucketHandle,
    key: Zeroizing<Vec<u8>>,
    read_only: AtomicBool,
}

impl fmt::Debug for AeadCryptBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadCryptBucket")
            .field("inner", &self.inner)
            .field("key", &"[REDACTED]")
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl AeadCryptBucket {
    /// Wrap `inner`, copying `key`.
    ///
    /// # Errors
    ///
    /// [`BucketError::Crypto`] with `InvalidKeyLength` unless the key is 16,
    /// 24 or 32 bytes.
    pub fn new(inner: BucketHandle, key: &[u8]) -> Result<Self, BucketError> {
        KeySize::from_len(key.len())?;
        let read_only = inner.is_read_only();
        Ok(Self {
            inner,
            key: Zeroizing::new(key.to_vec()),
            read_only: AtomicBool::new(read_only),
        })
    }

    pub fn inner(&self) -> &BucketHandle {
        &self.inner
    }

    /// Read the body that follows [`AEAD_BUCKET_MAGIC`].
    #[instrument(level = "debug", skip_all)]
    pub(crate) fn restore(
        reader: &mut dyn Read,
        context: &RestoreContext,
        depth: usize,
    ) -> Result<Self, BucketError> {
        codec::expect_version(reader, "encrypted bucket", AEAD_BUCKET_VERSION)?;
        let key_len = usize::from(codec::read_u8(reader, "key length")?);
        if KeySize::from_len(key_len).is_err() {
            return Err(FormatError::InvalidKeyLength(key_len).into());
        }
        let key = Zeroizing::new(codec::read_bytes(reader, key_len, "key")?);
        let read_only = codec::read_bool(reader, "encrypted read-only")?;
        let inner = restore_nested(reader, context, depth + 1)?;

        debug!(name = %inner.name(), "Restored encrypted bucket");
        Ok(Self {
            inner,
            key,
            read_only: AtomicBool::new(read_only),
        })
    }
}

impl Resumable for AeadCryptBucket {
    fn on_resume(&self, context: &ResumeContext) -> Result<(), ResumeFailedError> {
        self.inner.on_resume(context)
    }
}

impl Bucket for AeadCryptBucket {
    fn name(&self) -> String {
        self.inner.name()
    }

    /// Plaintext length derived from the inner size; 0 if the inner bucket
    /// does not hold a well-formed stream.
    fn size(&self) -> u64 {
        encrypted_to_plaintext_size(self.inner.size()).unwrap_or(0)
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
        let writer = AeadStreamWriter::new(inner, &self.key)?;
        Ok(Box::new(AeadOutput {
            writer,
            closed: false,
        }))
    }

    fn input_stream_unbuffered(&self) -> Result<InputStream, BucketError> {
        let inner = self.inner.input_stream_unbuffered()?;
        Ok(Box::new(AeadStreamReader::new(inner, &self.key)?))
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
            key: self.key.clone(),
            read_only: AtomicBool::new(true),
        }))
    }

    fn store_to(&self, out: &mut dyn Write) -> Result<(), BucketError> {
        codec::write_u32(out, AEAD_BUCKET_MAGIC)?;
        codec::write_u32(out, AEAD_BUCKET_VERSION)?;
        // Key length was validated at construction
        codec::write_u8(out, self.key.len() as u8)?;
        out.write_all(&self.key)?;
        codec::write_bool(out, self.is_read_only())?;
        self.inner.store_to(out)
    }
}

struct AeadOutput {
    writer: AeadStreamWriter<OutputStream>,
    closed: bool,
}

impl Write for AeadOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl BucketOutput for AeadOutput {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.writer.finish()?;
        self.writer.inner_mut().close()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for AeadOutput {
    fn drop(&mut self) {
        if !self.closed {
            close_on_drop(self, "aead");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bucket::{FileBucketOptions, PaddedBucket, TempFileBucket, restore_bucket},
        cleaner::GlobalCleaner,
        fs::FilenameGenerator,
    };
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        generator: Arc<FilenameGenerator>,
        cleaner: Arc<GlobalCleaner>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let generator = Arc::new(FilenameGenerator::new(temp.path(), "a-", false).unwrap());
            Self {
                _temp: temp,
                generator,
                cleaner: Arc::new(GlobalCleaner::new()),
            }
        }

        fn file(&self) -> BucketHandle {
            let id = self.generator.make_random_filename().unwrap();
            Arc::new(TempFileBucket::new(
                id,
                self.generator.get_path(id),
                FileBucketOptions::default(),
                None,
                Arc::clone(&self.cleaner),
            ))
        }
    }

    fn write(bucket: &dyn Bucket, data: &[u8]) {
        let mut out = bucket.output_stream().unwrap();
        out.write_all(data).unwrap();
        out.close().unwrap();
    }

    fn read(bucket: &dyn Bucket) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        bucket.input_stream().unwrap().read_to_end(&mut buf)?;
        Ok(buf)
    }

    #[test]
    fn test_rejects_bad_key_length() {
        let fx = Fixture::new();
        for len in [0, 8, 20, 33] {
            assert!(matches!(
                AeadCryptBucket::new(fx.file(), &vec![1u8; len]),
                Err(BucketError::Crypto(_))
            ));
        }
    }

    #[test]
    fn test_roundtrip_and_size() {
        let fx = Fixture::new();
        for key_len in [16, 24, 32] {
            let inner = fx.file();
            let bucket = AeadCryptBucket::new(Arc::clone(&inner), &vec![0x11; key_len]).unwrap();
            let data: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();

            write(&bucket, &data);
            assert_eq!(bucket.size(), data.len() as u64);
            assert!(inner.size() > bucket.size());
            assert_eq!(read(&bucket).unwrap(), data);
        }
    }

    #[test]
    fn test_tamper_detected() {
        let fx = Fixture::new();
        let inner = fx.file();
        let bucket = AeadCryptBucket::new(Arc::clone(&inner), &[0x22; 32]).unwrap();
        write(&bucket, b"attack at dawn");

        let path = std::path::PathBuf::from(inner.name());
        let mut raw = fs::read(&path).unwrap();
        raw[20] ^= 0x01;
        fs::write(&path, &raw).unwrap();

        let err = read(&bucket).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_shadow_shares_key_and_is_read_only() {
        let fx = Fixture::new();
        let bucket = AeadCryptBucket::new(fx.file(), &[0x33; 16]).unwrap();
        write(&bucket, b"hello");

        let shadow = bucket.create_shadow().unwrap();
        assert!(shadow.is_read_only());
        assert!(matches!(
            shadow.output_stream(),
            Err(BucketError::ReadOnly { .. })
        ));
        assert_eq!(read(shadow.as_ref()).unwrap(), b"hello");

        shadow.dispose();
        assert_eq!(read(&bucket).unwrap(), b"hello");
    }

    #[test]
    fn test_store_restore_over_padding() {
        let fx = Fixture::new();
        let padded: BucketHandle = Arc::new(PaddedBucket::new(fx.file(), 4096));
        let bucket = AeadCryptBucket::new(padded, &[0x44; 24]).unwrap();
        write(&bucket, b"layered");

        let mut stored = Vec::new();
        bucket.store_to(&mut stored).unwrap();
        assert_eq!(&stored[..4], &AEAD_BUCKET_MAGIC.to_be_bytes());
        assert_eq!(stored[8], 24);

        let ctx = RestoreContext::new(Arc::clone(&fx.generator)).with_cleaner(Arc::clone(&fx.cleaner));
        let restored = restore_bucket(&mut stored.as_slice(), &ctx).unwrap();
        assert_eq!(restored.size(), 7);
        assert_eq!(read(restored.as_ref()).unwrap(), b"layered");
    }

    #[test]
    fn test_restore_rejects_bad_key_length() {
        let fx = Fixture::new();
        let mut stored = Vec::new();
        stored.extend_from_slice(&AEAD_BUCKET_MAGIC.to_be_bytes());
        stored.extend_from_slice(&1u32.to_be_bytes());
        stored.push(17);

        let ctx = RestoreContext::new(Arc::clone(&fx.generator));
        assert!(matches!(
            restore_bucket(&mut stored.as_slice(), &ctx),
            Err(BucketError::Format(FormatError::InvalidKeyLength(17)))
        ));
    }

    #[test]
    fn test_restore_rejects_future_version() {
        let fx = Fixture::new();
        let mut stored = Vec::new();
        stored.extend_from_slice(&AEAD_BUCKET_MAGIC.to_be_bytes());
        stored.extend_from_slice(&2u32.to_be_bytes());

        let ctx = RestoreContext::new(Arc::clone(&fx.generator));
        assert!(matches!(
            restore_bucket(&mut stored.as_slice(), &ctx),
            Err(BucketError::Format(FormatError::UnsupportedVersion { actual: 2, .. }))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let fx = Fixture::new();
        let bucket = AeadCryptBucket::new(fx.file(), &[0xAB; 16]).unwrap();
        let debug = format!("{bucket:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("[171, 171"));
    }
}
