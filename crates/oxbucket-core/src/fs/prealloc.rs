//! File preallocation and pseudorandom fill.
//!
//! Which strategy to use is decided once per process by probing the first
//! managed directory: if the native `fallocate`-style call works there it is
//! used from then on, otherwise files are extended by writing a ChaCha8
//! keystream. The fill is also what secure deletion overwrites files with.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::Path,
    sync::OnceLock,
};

use fs2::FileExt;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace, warn};

const FILL_BUFFER_SIZE: usize = 32 * 1024;
const PROBE_LEN: u64 = 4096;
const PROBE_NAME: &str = ".oxbucket-prealloc-probe";

static GLOBAL: OnceLock<Preallocator> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreallocStrategy {
    /// Native filesystem allocation
    Native,
    /// Portable pseudorandom fill
    Fill,
}

#[derive(Debug, Clone, Copy)]
pub struct Preallocator {
    strategy: PreallocStrategy,
}

impl Preallocator {
    /// The process-wide preallocator, probing `dir` on first use.
    pub fn global(dir: &Path) -> &'static Preallocator {
        GLOBAL.get_or_init(|| Self::probe(dir))
    }

    /// Test whether native allocation works in `dir`.
    pub fn probe(dir: &Path) -> Self {
        let path = dir.join(PROBE_NAME);
        let result = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .and_then(|file| {
                file.allocate(PROBE_LEN)?;
                file.metadata()
            });
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "Failed to remove preallocation probe");
        }

        let strategy = match result {
            Ok(meta) if meta.len() >= PROBE_LEN => PreallocStrategy::Native,
            Ok(_) => PreallocStrategy::Fill,
            Err(e) => {
                debug!(error = %e, "Native preallocation unavailable, using fill");
                PreallocStrategy::Fill
            }
        };
        debug!(?strategy, dir = %dir.display(), "Preallocation strategy chosen");
        Self { strategy }
    }

    pub fn with_strategy(strategy: PreallocStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> PreallocStrategy {
        self.strategy
    }

    /// Extend `file` to at least `len` bytes and rewind it.
    ///
    /// Files already that long are left as they are.
    pub fn preallocate(&self, file: &mut File, len: u64) -> io::Result<()> {
        let current = file.metadata()?.len();
        if current < len {
            match self.strategy {
                PreallocStrategy::Native => file.allocate(len)?,
                PreallocStrategy::Fill => {
                    file.seek(SeekFrom::Start(current))?;
                    fill_pseudorandom(&mut *file, len - current, len ^ current)?;
                }
            }
            trace!(len, strategy = ?self.strategy, "Preallocated file");
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

/// Write `len` bytes of the ChaCha8 keystream seeded by `seed`.
///
/// Output is identical for identical seeds.
pub fn fill_pseudorandom<W: Write>(mut out: W, len: u64, seed: u64) -> io::Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut buf = vec![0u8; FILL_BUFFER_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(FILL_BUFFER_SIZE as u64) as usize;
        rng.fill_bytes(&mut buf[..n]);
        out.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Overwrite `path` with pseudorandom bytes, sync, then unlink it.
///
/// A missing file counts as deleted.
pub fn secure_delete(path: &Path) -> io::Result<()> {
    match OpenOptions::new().write(true).open(path) {
        Ok(mut file) => {
            let len = file.metadata()?.len();
            fill_pseudorandom(&mut file, len, rand::rng().next_u64())?;
            file.sync_all()?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fill_is_reproducible() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        fill_pseudorandom(&mut a, 100_000, 7).unwrap();
        fill_pseudorandom(&mut b, 100_000, 7).unwrap();
        assert_eq!(a.len(), 100_000);
        assert_eq!(a, b);

        let mut c = Vec::new();
        fill_pseudorandom(&mut c, 100_000, 8).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_fill_prefix_stable_across_lengths() {
        let mut short = Vec::new();
        let mut long = Vec::new();
        fill_pseudorandom(&mut short, 1000, 99).unwrap();
        fill_pseudorandom(&mut long, 50_000, 99).unwrap();
        assert_eq!(&long[..1000], &short[..]);
    }

    #[test]
    fn test_preallocate_both_strategies() {
        let temp = TempDir::new().unwrap();
        for strategy in [PreallocStrategy::Native, PreallocStrategy::Fill] {
            let path = temp.path().join(format!("{strategy:?}"));
            let mut file = File::create(&path).unwrap();
            let prealloc = Preallocator::with_strategy(strategy);
            match prealloc.preallocate(&mut file, 10_000) {
                Ok(()) => {
                    assert!(file.metadata().unwrap().len() >= 10_000);
                    assert_eq!(file.stream_position().unwrap(), 0);
                }
                // Some filesystems lack native allocation
                Err(_) => assert_eq!(strategy, PreallocStrategy::Native),
            }
        }
    }

    #[test]
    fn test_probe_leaves_no_file() {
        let temp = TempDir::new().unwrap();
        let _ = Preallocator::probe(temp.path());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_secure_delete() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("secret");
        fs::write(&path, vec![0x55; 5000]).unwrap();

        secure_delete(&path).unwrap();
        assert!(!path.exists());

        // Already gone
        secure_delete(&path).unwrap();
    }
}
