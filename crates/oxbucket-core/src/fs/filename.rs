//! Random, collision-free filenames under a managed temp directory.
//!
//! Every managed file is named `<prefix><lowercase-hex(id)>`. IDs are drawn at
//! random and claimed with an exclusive create, so two generators sharing a
//! directory (or two threads sharing a generator) can never hand out the same
//! file. The filesystem's create-if-absent is the only synchronization used.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

/// Opaque 64-bit identifier of a managed file.
pub type FileId = i64;

/// Never issued; reserved as an out-of-band marker.
pub const RESERVED_FILE_ID: FileId = -1;

/// Whether managed names are compared case-insensitively on this platform.
const CASE_INSENSITIVE_NAMES: bool = cfg!(any(target_os = "windows", target_os = "macos"));

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Failed to prepare temp directory {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("Temp directory {path:?} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("Temp directory {path:?} cannot be made readable and writable")]
    NotAccessible { path: PathBuf },

    #[error("Invalid filename prefix {prefix:?}: {reason}")]
    InvalidPrefix { prefix: String, reason: &'static str },
}

/// Counts from one sweep of a managed directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WipeStats {
    /// Directory entries looked at
    pub scanned: usize,
    /// Entries matching the managed prefix
    pub eligible: usize,
    /// Entries actually deleted
    pub wiped: usize,
}

impl WipeStats {
    /// Whether every eligible entry was removed.
    pub fn is_complete(&self) -> bool {
        self.eligible == self.wiped
    }
}

impl fmt::Display for WipeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {}, eligible {}, wiped {}",
            self.scanned, self.eligible, self.wiped
        )
    }
}

/// Maps file IDs to paths inside one managed directory.
#[derive(Debug, Clone)]
pub struct FilenameGenerator {
    dir: PathBuf,
    prefix: String,
}

impl FilenameGenerator {
    /// Prepare `dir` (creating it if needed) and optionally delete stale files
    /// left there by a previous run.
    #[instrument(level = "debug", skip(dir), fields(dir = %dir.as_ref().display()))]
    pub fn new(
        dir: impl AsRef<Path>,
        prefix: &str,
        wipe_files: bool,
    ) -> Result<Self, GeneratorError> {
        validate_prefix(prefix)?;
        let dir = prepare_dir(dir.as_ref())?;

        let generator = Self {
            dir,
            prefix: prefix.to_string(),
        };

        if wipe_files {
            let stats = generator.wipe_files();
            info!(dir = %generator.dir.display(), %stats, "Wiped stale temp files");
        }

        debug!(dir = %generator.dir.display(), prefix, "Filename generator ready");
        Ok(generator)
    }

    /// The canonical managed directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Claim a fresh random ID and create its (empty) file.
    ///
    /// A collision with an existing file is retried silently with a new ID.
    pub fn make_random_filename(&self) -> io::Result<FileId> {
        let mut rng = rand::rng();
        loop {
            let id: FileId = rng.random();
            if id == RESERVED_FILE_ID {
                continue;
            }
            let path = self.get_path(id);
            match create_exclusive(&path) {
                Ok(()) => {
                    trace!(id = %format_id(id), "Claimed filename");
                    return Ok(id);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    trace!(id = %format_id(id), "Filename collision, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Path of the file with the given ID. Pure, no I/O.
    pub fn get_path(&self, id: FileId) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, format_id(id)))
    }

    /// The ID encoded in `path`, if it names a file managed by this generator.
    pub fn get_id(&self, path: &Path) -> Option<FileId> {
        if path.parent() != Some(self.dir.as_path()) {
            return None;
        }
        let name = path.file_name()?.to_str()?;
        let hex = self.strip_prefix(name)?;
        if hex.is_empty() || hex.len() > 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(|v| v as FileId)
    }

    /// Whether `name` carries the managed prefix.
    pub fn matches_prefix(&self, name: &str) -> bool {
        self.strip_prefix(name).is_some()
    }

    fn strip_prefix<'a>(&self, name: &'a str) -> Option<&'a str> {
        if name.len() < self.prefix.len() || !name.is_char_boundary(self.prefix.len()) {
            return None;
        }
        let (head, tail) = name.split_at(self.prefix.len());
        let matches = if CASE_INSENSITIVE_NAMES {
            head.eq_ignore_ascii_case(&self.prefix)
        } else {
            head == self.prefix
        };
        matches.then_some(tail)
    }

    /// Bring `path` under management as the file for `id`.
    ///
    /// Returns the managed path on success. If the file already lives at the
    /// managed location it is returned unchanged. On failure the original path
    /// is returned and the problem logged.
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    pub fn maybe_move(&self, path: &Path, id: FileId) -> PathBuf {
        let target = self.get_path(id);
        if path == target || self.get_id(path) == Some(id) {
            return path.to_path_buf();
        }

        match claim_path(path, &target) {
            Ok(()) => {
                debug!(target = %target.display(), "Moved file under management");
                target
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(target = %target.display(), "Not moving file: managed path already taken");
                path.to_path_buf()
            }
            Err(e) => {
                warn!(target = %target.display(), error = %e, "Failed to move file under management");
                path.to_path_buf()
            }
        }
    }

    /// Delete every entry in the managed directory whose name carries the
    /// prefix. Everything else is left alone.
    pub fn wipe_files(&self) -> WipeStats {
        self.sweep(|_| true)
    }

    /// Delete prefix-matching files for which `should_delete` returns true.
    pub(crate) fn sweep(&self, mut should_delete: impl FnMut(&Path) -> bool) -> WipeStats {
        let mut stats = WipeStats::default();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list temp directory");
                return stats;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Failed to read directory entry");
                    continue;
                }
            };
            stats.scanned += 1;

            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !self.matches_prefix(name) {
                continue;
            }

            let path = entry.path();
            if !should_delete(&path) {
                continue;
            }
            stats.eligible += 1;

            match fs::remove_file(&path) {
                Ok(()) => stats.wiped += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => stats.wiped += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete temp file"),
            }
        }

        stats
    }
}

/// Lowercase hex of the ID's two's-complement bits.
pub fn format_id(id: FileId) -> String {
    format!("{:x}", id as u64)
}

fn validate_prefix(prefix: &str) -> Result<(), GeneratorError> {
    let invalid = |reason| GeneratorError::InvalidPrefix {
        prefix: prefix.to_string(),
        reason,
    };
    if prefix.is_empty() {
        return Err(invalid("prefix must not be empty"));
    }
    if prefix.contains(['/', '\\']) || prefix == "." || prefix == ".." {
        return Err(invalid("prefix must not contain path separators"));
    }
    Ok(())
}

fn prepare_dir(dir: &Path) -> Result<PathBuf, GeneratorError> {
    let io_err = |source| GeneratorError::Io {
        source,
        path: dir.to_path_buf(),
    };

    if !dir.exists() {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(dir).map_err(io_err)?;
    }

    let dir = dir.canonicalize().map_err(io_err)?;
    let metadata = fs::metadata(&dir).map_err(io_err)?;
    if !metadata.is_dir() {
        return Err(GeneratorError::NotADirectory { path: dir });
    }

    if metadata.permissions().readonly() {
        let mut permissions = metadata.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            permissions.set_mode(permissions.mode() | 0o700);
        }
        #[cfg(not(unix))]
        permissions.set_readonly(false);

        if fs::set_permissions(&dir, permissions).is_err() {
            return Err(GeneratorError::NotAccessible { path: dir });
        }
    }

    Ok(dir)
}

fn create_exclusive(path: &Path) -> io::Result<()> {
    open_exclusive(path).map(drop)
}

fn open_exclusive(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Move `source` to `target` without ever replacing an existing `target`.
///
/// A hard link claims the name atomically; across filesystems the contents
/// are copied into an exclusively created file instead.
fn claim_path(source: &Path, target: &Path) -> io::Result<()> {
    match fs::hard_link(source, target) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            let mut src = fs::File::open(source)?;
            let mut dest = open_exclusive(target)?;
            if let Err(e) = io::copy(&mut src, &mut dest).and_then(|_| dest.sync_all()) {
                let _ = fs::remove_file(target);
                return Err(e);
            }
        }
        Err(e) => return Err(e),
    }

    if let Err(e) = fs::remove_file(source) {
        warn!(source = %source.display(), error = %e, "Claimed managed path but failed to remove source");
    }
    Ok(())
}
