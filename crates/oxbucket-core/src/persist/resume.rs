//! Re-attaching restored buckets to live resources after a restart.

use std::{fmt, io::Read, path::PathBuf, sync::Arc};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::PersistentFileTracker;
use crate::{
    bucket::{BucketError, BucketHandle, RestoreContext, restore_bucket},
    cleaner::GlobalCleaner,
    crypto::MasterSecret,
    fs::DEFAULT_DISK_CHECK_INTERVAL,
};

/// Resuming an object graph failed; nothing in it may be used.
#[derive(Error, Debug)]
pub enum ResumeFailedError {
    #[error("Failed to resume bucket {name}: {source}")]
    Bucket {
        name: String,
        #[source]
        source: BucketError,
    },

    #[error("Tracker unavailable for resume: {reason}")]
    Tracker { reason: String },

    #[error("Bucket file missing on resume: {path:?}")]
    MissingFile { path: PathBuf },
}

/// Objects that need fixing up after being deserialized in a new process.
pub trait Resumable {
    /// Re-open handles, re-register with the tracker and so on.
    ///
    /// The default does nothing.
    fn on_resume(&self, _context: &ResumeContext) -> Result<(), ResumeFailedError> {
        Ok(())
    }
}

/// What resumed objects may attach to.
#[derive(Clone)]
pub struct ResumeContext {
    tracker: Arc<PersistentFileTracker>,
    master_secret: Option<Arc<MasterSecret>>,
    cleaner: Arc<GlobalCleaner>,
}

impl fmt::Debug for ResumeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeContext")
            .field("tracker", &self.tracker)
            .field("master_secret", &self.master_secret.is_some())
            .finish_non_exhaustive()
    }
}

impl ResumeContext {
    pub fn new(tracker: Arc<PersistentFileTracker>) -> Self {
        Self {
            tracker,
            master_secret: None,
            cleaner: GlobalCleaner::global(),
        }
    }

    #[must_use]
    pub fn with_master_secret(mut self, master_secret: Arc<MasterSecret>) -> Self {
        self.master_secret = Some(master_secret);
        self
    }

    #[must_use]
    pub fn with_cleaner(mut self, cleaner: Arc<GlobalCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn tracker(&self) -> &Arc<PersistentFileTracker> {
        &self.tracker
    }

    pub fn master_secret(&self) -> Option<&Arc<MasterSecret>> {
        self.master_secret.as_ref()
    }

    pub fn cleaner(&self) -> &Arc<GlobalCleaner> {
        &self.cleaner
    }

    /// A [`RestoreContext`] over the same collaborators, for deserializing
    /// the buckets about to be resumed.
    pub fn restore_context(&self) -> RestoreContext {
        let mut ctx = RestoreContext::new(Arc::clone(self.tracker.generator()))
            .with_tracker(Arc::clone(&self.tracker))
            .with_cleaner(Arc::clone(&self.cleaner));
        if let Some(secret) = &self.master_secret {
            ctx = ctx.with_master_secret(Arc::clone(secret));
        }
        if let Some(checker) = self.tracker.disk_space_checker() {
            ctx = ctx.with_disk_space_checker(Arc::clone(checker), DEFAULT_DISK_CHECK_INTERVAL);
        }
        ctx
    }

    /// Deserialize one bucket and resume it.
    pub fn restore_and_resume(&self, reader: &mut dyn Read) -> Result<BucketHandle, ResumeFailedError> {
        let bucket = restore_bucket(reader, &self.restore_context()).map_err(|source| {
            ResumeFailedError::Bucket {
                name: "<serialized>".to_string(),
                source,
            }
        })?;
        bucket.on_resume(self)?;
        Ok(bucket)
    }
}

/// Resume every bucket, stopping at the first failure.
///
/// Resume is all-or-nothing per object graph: on error the caller must
/// discard the whole graph, including buckets that resumed successfully.
#[instrument(level = "debug", skip_all, fields(count = buckets.len()))]
pub fn resume_buckets(
    buckets: &[BucketHandle],
    context: &ResumeContext,
) -> Result<(), ResumeFailedError> {
    for bucket in buckets {
        if let Err(e) = bucket.on_resume(context) {
            warn!(bucket = %bucket.name(), error = %e, "Resume failed");
            return Err(e);
        }
    }
    debug!("All buckets resumed");
    Ok(())
}
