//! Commit generations and deferred disposal of persistent files.
//!
//! A durable snapshot of higher-level state may reference bucket files. Such a
//! file must outlive every snapshot that references it, so disposing it is a
//! request, honoured only once a later snapshot has been durably written.
//!
//! The snapshot writer drives the protocol:
//!
//! ```text
//! let ticket = tracker.begin_commit();   // commit ID advances
//! write_snapshot()?;                     // serialize live state
//! tracker.commit_succeeded(ticket);      // or commit_failed(ticket)
//! ```
//!
//! Disposal requests queued before `begin_commit` are carried by the ticket
//! and performed only when that commit succeeds. Commits may overlap: a
//! ticket that succeeds while an older one is still unresolved has its
//! disposals parked until every older ticket has succeeded or failed, since
//! the older snapshot may still reference those files. The snapshot with the
//! highest commit ID is the one restored. The queue itself is not
//! persisted: after a crash, [`PersistentFileTracker::finish_resume`] deletes
//! every managed file that no restored bucket registered.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::fs::{DiskSpaceChecker, FilenameGenerator, WipeStats};

/// First commit ID handed out. Zero is reserved for "unknown generation".
pub const INITIAL_COMMIT_ID: u64 = 1;

/// Something whose physical disposal can be postponed.
pub trait DelayedDispose: Send + Sync + fmt::Debug {
    /// Release the resource. Returns `false` if that failed and should be
    /// retried later.
    fn real_dispose(&self) -> bool;

    /// The managed file behind this resource, if any.
    fn path(&self) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposalOutcome {
    /// Disposed during the call
    Immediate,
    /// Queued until a later commit succeeds
    Deferred,
}

#[derive(Debug)]
struct DisposalEntry {
    target: Arc<dyn DelayedDispose>,
    created_commit_id: u64,
}

/// Disposals owed by one in-flight commit.
#[derive(Debug)]
#[must_use = "a commit ticket must be passed to commit_succeeded or commit_failed"]
pub struct CommitTicket {
    commit_id: u64,
    entries: Vec<DisposalEntry>,
}

impl CommitTicket {
    /// The commit ID this snapshot is written under.
    pub fn commit_id(&self) -> u64 {
        self.commit_id
    }

    /// Number of disposals that run if the commit succeeds.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

/// Disposals of a succeeded commit, held back by an older unresolved one.
#[derive(Debug)]
struct ParkedBatch {
    commit_id: u64,
    entries: Vec<DisposalEntry>,
}

#[derive(Debug)]
struct TrackerState {
    commit_id: u64,
    pending: Vec<DisposalEntry>,
    registered: HashSet<PathBuf>,
    in_flight: BTreeSet<u64>,
    parked: Vec<ParkedBatch>,
}

impl TrackerState {
    /// Take every parked batch no unresolved older commit holds back.
    fn take_released(&mut self) -> Vec<DisposalEntry> {
        let oldest = self.in_flight.first().copied();
        let (released, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|batch| oldest.is_none_or(|oldest| oldest > batch.commit_id));
        self.parked = held;
        released.into_iter().flat_map(|batch| batch.entries).collect()
    }
}

/// Tracks which managed files are live and when they may be deleted.
///
/// One mutex guards the commit counter, the disposal queue and the registered
/// set. Disposal itself (file I/O) always happens outside the lock.
pub struct PersistentFileTracker {
    generator: Arc<FilenameGenerator>,
    disk_space: Option<Arc<dyn DiskSpaceChecker>>,
    state: Mutex<TrackerState>,
}

impl fmt::Debug for PersistentFileTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PersistentFileTracker")
            .field("dir", &self.generator.dir())
            .field("commit_id", &state.commit_id)
            .field("pending", &state.pending.len())
            .field("parked", &state.parked.len())
            .field("registered", &state.registered.len())
            .finish_non_exhaustive()
    }
}

impl PersistentFileTracker {
    pub fn new(generator: Arc<FilenameGenerator>) -> Self {
        Self {
            generator,
            disk_space: None,
            state: Mutex::new(TrackerState {
                commit_id: INITIAL_COMMIT_ID,
                pending: Vec::new(),
                registered: HashSet::new(),
                in_flight: BTreeSet::new(),
                parked: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn with_disk_space_checker(mut self, checker: Arc<dyn DiskSpaceChecker>) -> Self {
        self.disk_space = Some(checker);
        self
    }

    /// The managed directory.
    pub fn dir(&self) -> &Path {
        self.generator.dir()
    }

    pub fn generator(&self) -> &Arc<FilenameGenerator> {
        &self.generator
    }

    pub fn disk_space_checker(&self) -> Option<&Arc<dyn DiskSpaceChecker>> {
        self.disk_space.as_ref()
    }

    /// The current persistence generation. Never zero, never decreases.
    pub fn commit_id(&self) -> u64 {
        self.state.lock().commit_id
    }

    /// Mark `path` as referenced so the resume sweep keeps it.
    ///
    /// Returns `false` if it was already registered.
    pub fn register(&self, path: &Path) -> bool {
        self.state.lock().registered.insert(path.to_path_buf())
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.state.lock().registered.contains(path)
    }

    pub fn registered_count(&self) -> usize {
        self.state.lock().registered.len()
    }

    /// Number of disposals waiting for a commit, excluding in-flight tickets.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of disposals of succeeded commits still held back by an older
    /// unresolved commit.
    pub fn parked_count(&self) -> usize {
        self.state
            .lock()
            .parked
            .iter()
            .map(|batch| batch.entries.len())
            .sum()
    }

    /// Request disposal of `target`, created under `created_commit_id`.
    ///
    /// Generation 0 means no snapshot since the last restart can reference
    /// the target, so it is disposed now; a failure there queues it for retry.
    /// Anything else waits for the next successful commit.
    pub fn delayed_dispose(
        &self,
        target: Arc<dyn DelayedDispose>,
        created_commit_id: u64,
    ) -> DisposalOutcome {
        if created_commit_id == 0 {
            if target.real_dispose() {
                self.forget(target.as_ref());
                return DisposalOutcome::Immediate;
            }
            debug!(?target, "Immediate disposal failed, queueing for retry");
        }

        let mut state = self.state.lock();
        state.pending.push(DisposalEntry {
            target,
            created_commit_id,
        });
        DisposalOutcome::Deferred
    }

    /// Start writing a snapshot: advance the commit ID and take over every
    /// queued disposal.
    pub fn begin_commit(&self) -> CommitTicket {
        let mut state = self.state.lock();
        state.commit_id += 1;
        let commit_id = state.commit_id;
        state.in_flight.insert(commit_id);
        let entries = std::mem::take(&mut state.pending);
        debug!(commit_id, disposals = entries.len(), "Commit started");
        CommitTicket { commit_id, entries }
    }

    /// The snapshot is durable: perform the ticket's disposals.
    ///
    /// If an older commit is still unresolved the disposals are parked until
    /// it resolves. Returns how many were disposed during this call, including
    /// parked batches this commit released. Failures go back on the queue.
    #[instrument(level = "debug", skip_all, fields(commit_id = ticket.commit_id))]
    pub fn commit_succeeded(&self, ticket: CommitTicket) -> usize {
        let ready = {
            let mut state = self.state.lock();
            state.in_flight.remove(&ticket.commit_id);
            if state
                .in_flight
                .first()
                .is_some_and(|&oldest| oldest < ticket.commit_id)
            {
                debug!(
                    disposals = ticket.entries.len(),
                    "Older commit in flight, parking disposals"
                );
                state.parked.push(ParkedBatch {
                    commit_id: ticket.commit_id,
                    entries: ticket.entries,
                });
                return 0;
            }
            let mut ready = ticket.entries;
            ready.extend(state.take_released());
            ready
        };

        let disposed = self.dispose_entries(ready);
        debug!(disposed, "Commit succeeded");
        disposed
    }

    /// The snapshot was not written: keep its disposals for a later commit.
    ///
    /// Parked batches this commit was holding back are released.
    pub fn commit_failed(&self, ticket: CommitTicket) {
        let released = {
            let mut state = self.state.lock();
            state.in_flight.remove(&ticket.commit_id);
            let count = ticket.entries.len();
            state.pending.extend(ticket.entries);
            warn!(commit_id = ticket.commit_id, requeued = count, "Commit failed");
            state.take_released()
        };
        if !released.is_empty() {
            self.dispose_entries(released);
        }
    }

    /// Number of commits begun but not yet resolved.
    pub fn commits_in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Dispose outside the lock and requeue failures.
    fn dispose_entries(&self, entries: Vec<DisposalEntry>) -> usize {
        let mut disposed = 0;
        let mut failed = Vec::new();

        for entry in entries {
            if entry.target.real_dispose() {
                self.forget(entry.target.as_ref());
                disposed += 1;
            } else {
                failed.push(entry);
            }
        }

        if !failed.is_empty() {
            warn!(count = failed.len(), "Deferred disposals failed, requeued");
            self.state.lock().pending.append(&mut failed);
        }
        disposed
    }

    /// After all restored buckets have been resumed, delete every managed
    /// file none of them registered.
    pub fn finish_resume(&self) -> WipeStats {
        let registered = self.state.lock().registered.clone();
        let stats = self.generator.sweep(|path| !registered.contains(path));
        info!(dir = %self.generator.dir().display(), %stats, "Resume sweep finished");
        stats
    }

    fn forget(&self, target: &dyn DelayedDispose) {
        if let Some(path) = target.path() {
            self.state.lock().registered.remove(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Probe {
        disposed: AtomicUsize,
        fail: AtomicBool,
    }

    impl DelayedDispose for Probe {
        fn real_dispose(&self) -> bool {
            if self.fail.load(Ordering::SeqCst) {
                return false;
            }
            self.disposed.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn tracker() -> (TempDir, PersistentFileTracker) {
        let temp = TempDir::new().unwrap();
        let generator = Arc::new(FilenameGenerator::new(temp.path(), "p-", false).unwrap());
        (temp, PersistentFileTracker::new(generator))
    }

    #[test]
    fn test_commit_id_starts_positive_and_increases() {
        let (_temp, tracker) = tracker();
        assert_eq!(tracker.commit_id(), INITIAL_COMMIT_ID);

        let ticket = tracker.begin_commit();
        assert_eq!(ticket.commit_id(), 2);
        tracker.commit_failed(ticket);
        assert_eq!(tracker.commit_id(), 2);

        let ticket = tracker.begin_commit();
        tracker.commit_succeeded(ticket);
        assert_eq!(tracker.commit_id(), 3);
    }

    #[test]
    fn test_generation_zero_disposes_immediately() {
        let (_temp, tracker) = tracker();
        let probe = Arc::new(Probe::default());
        let outcome = tracker.delayed_dispose(probe.clone(), 0);
        assert_eq!(outcome, DisposalOutcome::Immediate);
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_deferred_until_commit_succeeds() {
        let (_temp, tracker) = tracker();
        let probe = Arc::new(Probe::default());
        let created = tracker.commit_id();

        assert_eq!(
            tracker.delayed_dispose(probe.clone(), created),
            DisposalOutcome::Deferred
        );
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 0);

        let ticket = tracker.begin_commit();
        assert!(tracker.commit_id() > created);
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 0);

        assert_eq!(tracker.commit_succeeded(ticket), 1);
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_during_commit_waits_for_next() {
        let (_temp, tracker) = tracker();
        let probe = Arc::new(Probe::default());

        let ticket = tracker.begin_commit();
        tracker.delayed_dispose(probe.clone(), 1);
        tracker.commit_succeeded(ticket);
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.pending_count(), 1);

        let ticket = tracker.begin_commit();
        tracker.commit_succeeded(ticket);
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_commit_requeues() {
        let (_temp, tracker) = tracker();
        let probe = Arc::new(Probe::default());
        tracker.delayed_dispose(probe.clone(), 1);

        let ticket = tracker.begin_commit();
        assert_eq!(ticket.pending(), 1);
        assert_eq!(tracker.commits_in_flight(), 1);
        tracker.commit_failed(ticket);
        assert_eq!(tracker.commits_in_flight(), 0);
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_disposal_requeues() {
        let (_temp, tracker) = tracker();
        let probe = Arc::new(Probe::default());
        probe.fail.store(true, Ordering::SeqCst);

        // Even immediate disposal is retried later
        assert_eq!(
            tracker.delayed_dispose(probe.clone(), 0),
            DisposalOutcome::Deferred
        );

        let ticket = tracker.begin_commit();
        assert_eq!(tracker.commit_succeeded(ticket), 0);
        assert_eq!(tracker.pending_count(), 1);

        probe.fail.store(false, Ordering::SeqCst);
        let ticket = tracker.begin_commit();
        assert_eq!(tracker.commit_succeeded(ticket), 1);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_overlapping_commits_wait_for_oldest() {
        let (_temp, tracker) = tracker();
        let probe = Arc::new(Probe::default());

        let older = tracker.begin_commit();
        tracker.delayed_dispose(probe.clone(), tracker.commit_id());
        let newer = tracker.begin_commit();
        assert_eq!(newer.pending(), 1);

        // The older snapshot may still reference the file
        assert_eq!(tracker.commit_succeeded(newer), 0);
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.parked_count(), 1);
        assert_eq!(tracker.commits_in_flight(), 1);

        assert_eq!(tracker.commit_succeeded(older), 1);
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.parked_count(), 0);
        assert_eq!(tracker.commits_in_flight(), 0);
    }

    #[test]
    fn test_failed_older_commit_releases_parked() {
        let (_temp, tracker) = tracker();
        let early = Arc::new(Probe::default());
        let late = Arc::new(Probe::default());

        tracker.delayed_dispose(early.clone(), 1);
        let older = tracker.begin_commit();
        tracker.delayed_dispose(late.clone(), tracker.commit_id());
        let newer = tracker.begin_commit();

        tracker.commit_succeeded(newer);
        assert_eq!(late.disposed.load(Ordering::SeqCst), 0);

        tracker.commit_failed(older);
        assert_eq!(late.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(early.disposed.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.parked_count(), 0);
    }

    #[test]
    fn test_newer_commit_in_flight_does_not_park() {
        let (_temp, tracker) = tracker();
        let probe = Arc::new(Probe::default());
        tracker.delayed_dispose(probe.clone(), 1);

        let older = tracker.begin_commit();
        let newer = tracker.begin_commit();
        assert_eq!(tracker.commit_succeeded(older), 1);
        assert_eq!(probe.disposed.load(Ordering::SeqCst), 1);
        tracker.commit_succeeded(newer);
    }

    #[test]
    fn test_register_is_idempotent() {
        let (_temp, tracker) = tracker();
        let path = tracker.dir().join("p-1");
        assert!(tracker.register(&path));
        assert!(!tracker.register(&path));
        assert!(tracker.is_registered(&path));
        assert_eq!(tracker.registered_count(), 1);
    }

    #[test]
    fn test_finish_resume_keeps_registered_files() {
        let (temp, tracker) = tracker();
        let generator = Arc::clone(tracker.generator());
        let keep = generator.make_random_filename().unwrap();
        let stale = generator.make_random_filename().unwrap();
        std::fs::write(temp.path().join("unrelated"), b"x").unwrap();

        tracker.register(&generator.get_path(keep));
        let stats = tracker.finish_resume();

        assert_eq!(stats.eligible, 1);
        assert_eq!(stats.wiped, 1);
        assert!(generator.get_path(keep).exists());
        assert!(!generator.get_path(stale).exists());
        assert!(temp.path().join("unrelated").exists());
    }
}
