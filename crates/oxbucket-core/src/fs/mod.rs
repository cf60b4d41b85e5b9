//! Managed temp directories, disk admission and preallocation.

pub mod disk_space;
pub mod filename;
pub mod prealloc;

pub use disk_space::{DEFAULT_DISK_CHECK_INTERVAL, DiskSpaceChecker, MinFreeSpaceChecker};
pub use filename::{FileId, FilenameGenerator, GeneratorError, RESERVED_FILE_ID, WipeStats};
pub use prealloc::{PreallocStrategy, Preallocator, fill_pseudorandom, secure_delete};
