//! Error types for the bucket store
//!
//! Errors live next to the code that raises them; this module gathers them.

// Re-export error types from submodules
pub use crate::bucket::{BucketContext, BucketError, FormatError};
pub use crate::config::ConfigError;
pub use crate::crypto::CryptoError;
pub use crate::fs::GeneratorError;
pub use crate::persist::ResumeFailedError;
