//! Process-wide registry of cleanup actions.
//!
//! An action is registered against an object it watches through a [`Weak`]
//! reference, never a strong one. It runs exactly once, whichever comes
//! first:
//!
//! - an explicit [`GlobalCleaner::clean`]
//! - [`GlobalCleaner::reap`] noticing the watched object is gone
//! - [`GlobalCleaner::shutdown`]
//!
//! Registering after shutdown runs the action immediately. An action added
//! with [`GlobalCleaner::register_fallible`] that reports failure stays
//! registered, detached from its target, and is retried by the next `reap` or
//! `shutdown`.
//!
//! Removal from the registry is the claim to run an action, so concurrent
//! callers race on a single map removal and exactly one of them wins.
//!
//! # Thread Safety
//!
//! `GlobalCleaner` is `Send + Sync`. Actions run on the calling thread, outside
//! any internal lock.

use std::{
    any::Any,
    fmt,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

static GLOBAL_CLEANER: OnceLock<Arc<GlobalCleaner>> = OnceLock::new();

/// Returns `false` if the cleanup did not complete and should be retried.
type CleanupAction = Box<dyn FnMut() -> bool + Send + Sync>;

struct Registration {
    target: Weak<dyn Any + Send + Sync>,
    action: CleanupAction,
}

/// Claim on one registered action.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "dropping a CleanerHandle leaves the action to reap or shutdown"]
pub struct CleanerHandle {
    id: u64,
}

impl CleanerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct GlobalCleaner {
    next_id: AtomicU64,
    entries: DashMap<u64, Registration>,
    shut_down: AtomicBool,
}

impl fmt::Debug for GlobalCleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalCleaner")
            .field("registered", &self.entries.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Default for GlobalCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalCleaner {
    /// An independent cleaner. Most code uses [`global`](Self::global).
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The process-wide cleaner.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_CLEANER.get_or_init(|| Arc::new(Self::new())))
    }

    /// Run `action` once `target` is cleaned, reaped or shut down.
    ///
    /// Only a weak reference to `target` is kept. The action must not hold a
    /// strong reference to it either, or reaping can never fire.
    pub fn register<T, F>(&self, target: &Arc<T>, action: F) -> CleanerHandle
    where
        T: Send + Sync + 'static,
        F: FnOnce() + Send + Sync + 'static,
    {
        let mut action = Some(action);
        self.register_fallible(target, move || {
            if let Some(action) = action.take() {
                action();
            }
            true
        })
    }

    /// Like [`register`](Self::register), for an action that can fail.
    ///
    /// An action returning `false` is kept and retried by the next
    /// [`reap`](Self::reap) or [`shutdown`](Self::shutdown).
    pub fn register_fallible<T, F>(&self, target: &Arc<T>, action: F) -> CleanerHandle
    where
        T: Send + Sync + 'static,
        F: FnMut() -> bool + Send + Sync + 'static,
    {
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(target) as Weak<dyn Any + Send + Sync>;
        self.insert(weak, Box::new(action))
    }

    /// Queue an action that already failed once for the next `reap`.
    pub fn retry_later<F>(&self, action: F) -> CleanerHandle
    where
        F: FnMut() -> bool + Send + Sync + 'static,
    {
        self.insert(detached(), Box::new(action))
    }

    fn insert(&self, target: Weak<dyn Any + Send + Sync>, action: CleanupAction) -> CleanerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, Registration { target, action });
        trace!(id, "Cleanup registered");

        // A shutdown that already swept will never see this entry
        if self.shut_down.load(Ordering::SeqCst)
            && let Some((id, registration)) = self.entries.remove(&id)
        {
            debug!(id, "Cleaner already shut down, running cleanup now");
            self.run(id, registration);
        }
        CleanerHandle { id }
    }

    /// Run a claimed action; a failed one goes back in, detached.
    fn run(&self, id: u64, mut registration: Registration) -> bool {
        if (registration.action)() {
            return true;
        }
        warn!(id, "Cleanup failed, keeping it for retry");
        registration.target = detached();
        self.entries.insert(id, registration);
        false
    }

    /// Run and deregister the action now.
    ///
    /// Returns `false` if it already ran (or was deregistered) elsewhere. An
    /// action that fails here stays registered for retry.
    pub fn clean(&self, handle: CleanerHandle) -> bool {
        match self.entries.remove(&handle.id) {
            Some((id, registration)) => {
                trace!(id, "Running cleanup");
                self.run(id, registration);
                true
            }
            None => false,
        }
    }

    /// Forget the action without running it.
    pub fn deregister(&self, handle: CleanerHandle) -> bool {
        self.entries.remove(&handle.id).is_some()
    }

    /// Run the old action, then register `action` for `target`.
    ///
    /// For a resource superseded in place.
    pub fn replace<T, F>(&self, handle: CleanerHandle, target: &Arc<T>, action: F) -> CleanerHandle
    where
        T: Send + Sync + 'static,
        F: FnOnce() + Send + Sync + 'static,
    {
        self.clean(handle);
        self.register(target, action)
    }

    /// Run the actions of every watched object that no longer exists, and
    /// retry failed ones. Returns how many completed.
    pub fn reap(&self) -> usize {
        let dead: Vec<u64> = self
            .entries
            .iter()
            .filter(|entry| entry.value().target.strong_count() == 0)
            .map(|entry| *entry.key())
            .collect();

        let mut ran = 0;
        for id in dead {
            if let Some((id, registration)) = self.entries.remove(&id)
                && self.run(id, registration)
            {
                ran += 1;
            }
        }
        if ran > 0 {
            debug!(ran, "Reaped cleanup actions");
        }
        ran
    }

    /// Run every outstanding action. Only the first call does anything; later
    /// registrations run on the spot.
    ///
    /// Returns how many completed. Failures stay registered for `reap`.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let ids: Vec<u64> = self.entries.iter().map(|entry| *entry.key()).collect();

        let mut ran = 0;
        for id in ids {
            if let Some((id, registration)) = self.entries.remove(&id)
                && self.run(id, registration)
            {
                ran += 1;
            }
        }
        info!(ran, failed = self.entries.len(), "Cleaner shut down");
        ran
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Runs [`shutdown`](Self::shutdown) when dropped.
    ///
    /// Hold one in `main` so the sweep also happens on early returns.
    pub fn shutdown_guard(self: &Arc<Self>) -> ShutdownGuard {
        ShutdownGuard {
            cleaner: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A watch reference that is already dead, so `reap` picks the entry up.
fn detached() -> Weak<dyn Any + Send + Sync> {
    Weak::<()>::new() as Weak<dyn Any + Send + Sync>
}

#[derive(Debug)]
#[must_use = "the guard shuts the cleaner down when dropped"]
pub struct ShutdownGuard {
    cleaner: Arc<GlobalCleaner>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.cleaner.shutdown();
    }
}
