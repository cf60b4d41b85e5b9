//! Fuzz target for restoring serialized buckets
//!
//! Arbitrary bytes fed to `restore_bucket` must produce a bucket or an error,
//! never a panic. Both a plain and a persistent, keyed context are tried so
//! the file, padded and AEAD layers all see malformed input.

#![no_main]

use std::sync::{Arc, OnceLock};

use libfuzzer_sys::fuzz_target;
use oxbucket_core::{
    Bucket, FilenameGenerator, GlobalCleaner, MasterSecret, PersistentFileTracker, RestoreContext,
    restore_bucket,
};
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    plain: RestoreContext,
    persistent: RestoreContext,
}

fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let temp = TempDir::new().expect("temp dir");
        let generator =
            Arc::new(FilenameGenerator::new(temp.path(), "fuzz-", false).expect("generator"));
        let cleaner = Arc::new(GlobalCleaner::new());
        let secret = Arc::new(MasterSecret::from_bytes(&[0x42; 32]).expect("secret"));
        let tracker = Arc::new(PersistentFileTracker::new(Arc::clone(&generator)));

        let plain = RestoreContext::new(Arc::clone(&generator)).with_cleaner(Arc::clone(&cleaner));
        let persistent = RestoreContext::new(generator)
            .with_cleaner(cleaner)
            .with_tracker(tracker)
            .with_master_secret(secret);
        Fixture {
            _temp: temp,
            plain,
            persistent,
        }
    })
}

fuzz_target!(|data: &[u8]| {
    if data.len() > 64 * 1024 {
        return;
    }
    let fixture = fixture();

    for ctx in [&fixture.plain, &fixture.persistent] {
        if let Ok(bucket) = restore_bucket(&mut &data[..], ctx) {
            // Restored buckets point at files that mostly do not exist;
            // every query must still fail cleanly
            let _ = bucket.size();
            let _ = bucket.input_stream();
            let _ = bucket.create_shadow();

            let mut stored = Vec::new();
            let _ = bucket.store_to(&mut stored);
            bucket.dispose();
        }
    }
});
