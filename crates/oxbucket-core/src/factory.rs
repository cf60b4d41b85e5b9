//! Ready-to-use temp buckets.
//!
//! The factory allocates a random file through the [`FilenameGenerator`] and,
//! when encryption is on, wraps it in a [`PaddedBucket`] and then an
//! [`AeadCryptBucket`] keyed from the [`MasterSecret`]. Callers only see the
//! outermost [`BucketHandle`].

use std::{fmt, sync::Arc};

use tracing::{debug, instrument};

use crate::{
    bucket::{
        AeadCryptBucket, BucketContext, BucketError, BucketHandle, DEFAULT_PADDING_BLOCK_SIZE,
        FileBucketOptions, PaddedBucket, RestoreContext, TempFileBucket, padded_length,
    },
    cleaner::GlobalCleaner,
    config::{ConfigError, StoreConfig},
    crypto::{MasterSecret, stream::plaintext_to_encrypted_size},
    fs::{DEFAULT_DISK_CHECK_INTERVAL, DiskSpaceChecker, FilenameGenerator, MinFreeSpaceChecker},
    persist::PersistentFileTracker,
};

#[derive(Debug, Clone, Copy)]
struct FactoryOptions {
    encrypt: bool,
    padding_block_size: u64,
    secure_delete: bool,
    disk_check_interval: u64,
    preallocate: bool,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            encrypt: false,
            padding_block_size: DEFAULT_PADDING_BLOCK_SIZE,
            secure_delete: false,
            disk_check_interval: DEFAULT_DISK_CHECK_INTERVAL,
            preallocate: true,
        }
    }
}

/// Creates buckets in one managed directory.
///
/// With a tracker attached the buckets are persistent: they record the
/// current commit ID and their disposal is deferred by the tracker.
/// Without one they are plain temp files, removed on dispose or drop.
pub struct TempFileBucketFactory {
    generator: Arc<FilenameGenerator>,
    tracker: Option<Arc<PersistentFileTracker>>,
    master_secret: Option<Arc<MasterSecret>>,
    disk_space: Option<Arc<dyn DiskSpaceChecker>>,
    cleaner: Arc<GlobalCleaner>,
    options: FactoryOptions,
}

impl fmt::Debug for TempFileBucketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempFileBucketFactory")
            .field("dir", &self.generator.dir())
            .field("persistent", &self.tracker.is_some())
            .field("options", &self.options)
            .field("disk_space", &self.disk_space.is_some())
            .finish_non_exhaustive()
    }
}

impl TempFileBucketFactory {
    /// Unencrypted, non-persistent buckets in `generator`'s directory.
    pub fn new(generator: Arc<FilenameGenerator>) -> Self {
        Self {
            generator,
            tracker: None,
            master_secret: None,
            disk_space: None,
            cleaner: GlobalCleaner::global(),
            options: FactoryOptions::default(),
        }
    }

    /// Persistent buckets in the tracker's directory.
    pub fn persistent(tracker: Arc<PersistentFileTracker>) -> Self {
        let mut factory = Self::new(Arc::clone(tracker.generator()));
        if let Some(checker) = tracker.disk_space_checker() {
            factory.disk_space = Some(Arc::clone(checker));
        }
        factory.tracker = Some(tracker);
        factory
    }

    /// Build generator, disk checker and factory from `config`.
    ///
    /// A tracker, if given, must manage `config.temp_dir`; its generator is
    /// used instead of creating one.
    pub fn from_config(
        config: &StoreConfig,
        master_secret: Option<Arc<MasterSecret>>,
        tracker: Option<Arc<PersistentFileTracker>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut factory = match tracker {
            Some(tracker) => Self::persistent(tracker),
            None => {
                let generator =
                    FilenameGenerator::new(&config.temp_dir, &config.prefix, config.wipe_on_startup)?;
                Self::new(Arc::new(generator))
            }
        };

        if config.encrypt {
            let secret = master_secret.ok_or(ConfigError::MissingMasterSecret)?;
            factory = factory.with_encryption(secret);
        }
        if config.min_free_space > 0 {
            factory = factory.with_disk_space_checker(
                Arc::new(MinFreeSpaceChecker::new(config.min_free_space)),
                config.disk_check_interval,
            );
        }

        factory.options.padding_block_size = config.padding_block_size;
        factory.options.secure_delete = config.secure_delete;
        factory.options.disk_check_interval = config.disk_check_interval;
        factory.options.preallocate = config.preallocate;
        Ok(factory)
    }

    /// Encrypt every bucket with a key derived from `master_secret`.
    #[must_use]
    pub fn with_encryption(mut self, master_secret: Arc<MasterSecret>) -> Self {
        self.master_secret = Some(master_secret);
        self.options.encrypt = true;
        self
    }

    /// Padding block for encrypted buckets; 0 disables padding.
    #[must_use]
    pub fn with_padding(mut self, block_size: u64) -> Self {
        self.options.padding_block_size = block_size;
        self
    }

    #[must_use]
    pub fn with_secure_delete(mut self, secure_delete: bool) -> Self {
        self.options.secure_delete = secure_delete;
        self
    }

    #[must_use]
    pub fn with_preallocation(mut self, preallocate: bool) -> Self {
        self.options.preallocate = preallocate;
        self
    }

    #[must_use]
    pub fn with_disk_space_checker(
        mut self,
        checker: Arc<dyn DiskSpaceChecker>,
        interval: u64,
    ) -> Self {
        self.disk_space = Some(checker);
        self.options.disk_check_interval = interval.max(1);
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

    pub fn is_encrypted(&self) -> bool {
        self.options.encrypt
    }

    /// Bytes on disk for `size` bytes of content.
    pub fn physical_size(&self, size: u64) -> u64 {
        if self.options.encrypt {
            padded_length(
                plaintext_to_encrypted_size(size),
                self.options.padding_block_size,
            )
        } else {
            size
        }
    }

    /// A fresh, empty bucket expected to hold about `size` bytes.
    ///
    /// # Errors
    ///
    /// [`BucketError::InsufficientDiskSpace`] if the disk-space checker
    /// refuses `size`, [`BucketError::ShutDown`] for a temp bucket once the
    /// cleaner has shut down, or an I/O error if no file could be created.
    #[instrument(level = "debug", skip(self))]
    pub fn make_bucket(&self, size: u64) -> Result<BucketHandle, BucketError> {
        // A temp bucket's cleanup would run as soon as it was registered
        if self.tracker.is_none() && self.cleaner.is_shut_down() {
            return Err(BucketError::ShutDown {
                path: self.generator.dir().to_path_buf(),
            });
        }
        let physical = self.physical_size(size);

        if let Some(checker) = &self.disk_space
            && !checker.check_disk_space(
                self.generator.dir(),
                physical,
                self.options.disk_check_interval,
            )
        {
            return Err(BucketError::InsufficientDiskSpace {
                path: self.generator.dir().to_path_buf(),
                requested: physical,
            });
        }

        let id = self.generator.make_random_filename().map_err(|e| {
            BucketError::io_with_context(
                e,
                BucketContext::new()
                    .with_operation("create bucket file")
                    .with_path(self.generator.dir()),
            )
        })?;
        let path = self.generator.get_path(id);

        let options = FileBucketOptions {
            delete_on_dispose: true,
            secure_delete: self.options.secure_delete,
            persistent: self.tracker.is_some(),
            size_hint: physical,
            preallocate: self.options.preallocate,
            disk_space: self.disk_space.clone(),
            disk_check_interval: self.options.disk_check_interval,
        };
        if let Some(tracker) = &self.tracker {
            tracker.register(&path);
        }
        let file = TempFileBucket::new(
            id,
            path,
            options,
            self.tracker.clone(),
            Arc::clone(&self.cleaner),
        );
        let mut bucket: BucketHandle = Arc::new(file);

        if self.options.encrypt
            && let Some(secret) = &self.master_secret
        {
            if self.options.padding_block_size > 0 {
                bucket = Arc::new(PaddedBucket::new(bucket, self.options.padding_block_size));
            }
            let key = secret.create_symmetric_key();
            bucket = Arc::new(AeadCryptBucket::new(bucket, key.as_slice())?);
        }

        debug!(name = %bucket.name(), size, physical, "Bucket created");
        Ok(bucket)
    }

    /// A [`RestoreContext`] over this factory's collaborators.
    pub fn restore_context(&self) -> RestoreContext {
        let mut ctx = RestoreContext::new(Arc::clone(&self.generator))
            .with_cleaner(Arc::clone(&self.cleaner));
        if let Some(tracker) = &self.tracker {
            ctx = ctx.with_tracker(Arc::clone(tracker));
        }
        if let Some(secret) = &self.master_secret {
            ctx = ctx.with_master_secret(Arc::clone(secret));
        }
        if let Some(checker) = &self.disk_space {
            ctx = ctx.with_disk_space_checker(Arc::clone(checker), self.options.disk_check_interval);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        path::Path,
    };
    use tempfile::TempDir;

    fn factory(temp: &TempDir) -> TempFileBucketFactory {
        let generator = Arc::new(FilenameGenerator::new(temp.path(), "f-", false).unwrap());
        TempFileBucketFactory::new(generator).with_cleaner(Arc::new(GlobalCleaner::new()))
    }

    #[test]
    fn test_plain_bucket() {
        let temp = TempDir::new().unwrap();
        let factory = factory(&temp);
        let bucket = factory.make_bucket(10).unwrap();

        let mut out = bucket.output_stream().unwrap();
        out.write_all(b"plain text").unwrap();
        out.close().unwrap();
        assert_eq!(bucket.size(), 10);

        let on_disk = std::fs::read(bucket.name()).unwrap();
        assert_eq!(on_disk, b"plain text");
    }

    #[test]
    fn test_encrypted_bucket_is_padded() {
        let temp = TempDir::new().unwrap();
        let factory = factory(&temp)
            .with_encryption(Arc::new(MasterSecret::random()))
            .with_padding(4096);
        assert!(factory.is_encrypted());
        assert_eq!(factory.physical_size(100), 4096);

        let bucket = factory.make_bucket(100).unwrap();
        let mut out = bucket.output_stream().unwrap();
        out.write_all(&[3u8; 100]).unwrap();
        out.close().unwrap();

        assert_eq!(bucket.size(), 100);
        assert_eq!(std::fs::metadata(bucket.name()).unwrap().len(), 4096);

        let mut data = Vec::new();
        bucket.input_stream().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![3u8; 100]);
    }

    #[test]
    fn test_admission_refused_before_file_created() {
        let temp = TempDir::new().unwrap();
        let factory =
            factory(&temp).with_disk_space_checker(Arc::new(|_: &Path, _: u64, _: u64| false), 1024);

        assert!(matches!(
            factory.make_bucket(1),
            Err(BucketError::InsufficientDiskSpace { requested: 1, .. })
        ));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_from_config_requires_secret_for_encryption() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig {
            temp_dir: temp.path().to_path_buf(),
            encrypt: true,
            ..StoreConfig::default()
        };
        assert!(matches!(
            TempFileBucketFactory::from_config(&config, None, None),
            Err(ConfigError::MissingMasterSecret)
        ));

        let factory = TempFileBucketFactory::from_config(
            &config,
            Some(Arc::new(MasterSecret::random())),
            None,
        )
        .unwrap();
        assert!(factory.is_encrypted());
    }

    #[test]
    fn test_persistent_factory_registers_files() {
        let temp = TempDir::new().unwrap();
        let generator = Arc::new(FilenameGenerator::new(temp.path(), "f-", false).unwrap());
        let tracker = Arc::new(PersistentFileTracker::new(generator));
        let factory = TempFileBucketFactory::persistent(Arc::clone(&tracker))
            .with_cleaner(Arc::new(GlobalCleaner::new()));

        let bucket = factory.make_bucket(5).unwrap();
        assert!(tracker.is_registered(Path::new(&bucket.name())));
    }
}
