//! Crash-safe, optionally encrypted bucket storage.
//!
//! Buckets are anonymous on-disk byte containers with collision-free random
//! names. Persistent buckets take part in a commit protocol so files still
//! referenced by the last durable snapshot are never deleted early.

pub mod bucket;
pub mod cleaner;
pub mod config;
pub mod crypto;
pub mod error;
pub mod factory;
pub mod fs;
pub mod persist;

// Re-export commonly used types at crate root
pub use bucket::{
    AeadCryptBucket, Bucket, BucketHandle, BucketOutput, InputStream, OutputStream, PaddedBucket,
    RestoreContext, TempFileBucket, restore_bucket,
};
pub use cleaner::{CleanerHandle, GlobalCleaner};
pub use config::StoreConfig;
pub use crypto::MasterSecret;
pub use factory::TempFileBucketFactory;
pub use fs::{DiskSpaceChecker, FileId, FilenameGenerator, MinFreeSpaceChecker, WipeStats};
pub use persist::{
    CommitTicket, DisposalOutcome, PersistentFileTracker, ResumeContext, Resumable, resume_buckets,
};
