use std::{
    io::{Read, Write},
    sync::Arc,
};

use oxbucket_core::{Bucket, FilenameGenerator, GlobalCleaner, TempFileBucketFactory};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

pub const TEST_PREFIX: &str = "temp-";

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic master secret bytes for tests
#[allow(dead_code)]
pub const TEST_SECRET: [u8; 32] = [0x5A; 32];

/// Content of exactly the specified size
#[allow(dead_code)]
pub fn create_sized_content(size: usize) -> Vec<u8> {
    let pattern = b"0123456789ABCDEF";
    (0..size).map(|i| pattern[i % pattern.len()]).collect()
}

/// Pseudorandom content, reproducible from `seed`
#[allow(dead_code)]
pub fn create_random_content(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut content = vec![0u8; size];
    rng.fill_bytes(&mut content);
    content
}

/// A managed directory plus an isolated cleaner.
pub struct TestStore {
    pub temp: TempDir,
    pub generator: Arc<FilenameGenerator>,
    pub cleaner: Arc<GlobalCleaner>,
}

impl TestStore {
    pub fn new() -> Self {
        init_tracing();
        let temp = TempDir::new().expect("Failed to create temp dir");
        let generator = Arc::new(
            FilenameGenerator::new(temp.path(), TEST_PREFIX, false)
                .expect("Failed to create generator"),
        );
        Self {
            temp,
            generator,
            cleaner: Arc::new(GlobalCleaner::new()),
        }
    }

    #[allow(dead_code)]
    pub fn factory(&self) -> TempFileBucketFactory {
        TempFileBucketFactory::new(Arc::clone(&self.generator)).with_cleaner(Arc::clone(&self.cleaner))
    }

    /// Number of files with the managed prefix
    #[allow(dead_code)]
    pub fn managed_files(&self) -> usize {
        std::fs::read_dir(self.generator.dir())
            .expect("Failed to list dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEST_PREFIX))
            .count()
    }
}

#[allow(dead_code)]
pub fn write_bucket(bucket: &dyn Bucket, data: &[u8]) {
    let mut out = bucket.output_stream().expect("Failed to open output");
    out.write_all(data).expect("Failed to write");
    out.close().expect("Failed to close");
}

#[allow(dead_code)]
pub fn read_bucket(bucket: &dyn Bucket) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::new();
    bucket
        .input_stream()
        .map_err(std::io::Error::other)?
        .read_to_end(&mut data)?;
    Ok(data)
}
