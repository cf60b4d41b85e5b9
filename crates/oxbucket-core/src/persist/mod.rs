//! Persistence generations, deferred disposal and crash recovery.

pub mod resume;
pub mod tracker;

pub use resume::{ResumeContext, ResumeFailedError, Resumable, resume_buckets};
pub use tracker::{
    CommitTicket, DelayedDispose, DisposalOutcome, INITIAL_COMMIT_ID, PersistentFileTracker,
};
