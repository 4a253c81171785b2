//! Per-key advisory lock.
//!
//! One binary semaphore per key, created on first use and dropped from the
//! map once nobody holds or waits on it, so transient keys (image ids) do not
//! accumulate over the life of a process. The map itself sits behind a single
//! coarse mutex that is never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The caller's cancellation future completed before the lock was granted.
    #[error("lock on {key} cancelled while waiting")]
    Cancelled { key: String },
}

#[derive(Debug)]
struct KeyLock {
    semaphore: Arc<Semaphore>,
    /// Holders plus waiters.
    refs: usize,
}

/// Lock keyed by string.
///
/// Unlike a guard-based mutex, `lock` and `unlock` are separate calls so a
/// lock can be taken in one task and released in another. Releasing a key
/// nobody holds is a bug in the caller and panics.
#[derive(Debug, Default)]
pub struct KeyedLocker {
    locks: Mutex<HashMap<String, KeyLock>>,
}

/// Gives back a reference taken by `lock`/`try_lock` unless the lock was
/// actually acquired. Runs on early return and when the waiting future is
/// dropped.
struct PendingRef<'a> {
    locker: &'a KeyedLocker,
    key: &'a str,
    armed: bool,
}

impl Drop for PendingRef<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.locker.release_ref(self.key);
        }
    }
}

impl KeyedLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, KeyLock>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `key` and return its semaphore.
    fn take_ref(&self, key: &str) -> Arc<Semaphore> {
        let mut locks = self.map();
        let entry = locks.entry(key.to_string()).or_insert_with(|| KeyLock {
            semaphore: Arc::new(Semaphore::new(1)),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.semaphore)
    }

    fn release_ref(&self, key: &str) {
        let mut locks = self.map();
        let Some(entry) = locks.get_mut(key) else {
            panic!("keyed lock: release of unlocked key {key}");
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            locks.remove(key);
        }
    }

    /// Wait until `key` is free and take it.
    ///
    /// Cancel-safe: dropping the returned future before it resolves leaves no
    /// trace in the lock map.
    pub async fn lock(&self, key: &str) {
        let semaphore = self.take_ref(key);
        let mut pending = PendingRef {
            locker: self,
            key,
            armed: true,
        };

        // The semaphore is never closed, so acquire cannot fail.
        if let Ok(permit) = semaphore.acquire().await {
            permit.forget();
            pending.armed = false;
        };
    }

    /// Like [`lock`](Self::lock), but gives up once `cancel` completes.
    pub async fn lock_or_cancel<F>(&self, key: &str, cancel: F) -> Result<(), LockError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.lock(key) => Ok(()),
            _ = cancel => Err(LockError::Cancelled { key: key.to_string() }),
        }
    }

    /// Take `key` if it is free right now.
    pub fn try_lock(&self, key: &str) -> bool {
        let semaphore = self.take_ref(key);
        let mut pending = PendingRef {
            locker: self,
            key,
            armed: true,
        };

        let acquired = match semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                pending.armed = false;
                true
            }
            Err(_) => false,
        };
        acquired
    }

    /// Release `key`.
    ///
    /// # Panics
    ///
    /// If `key` is not currently held.
    pub fn unlock(&self, key: &str) {
        let mut locks = self.map();
        let Some(entry) = locks.get_mut(key) else {
            panic!("keyed lock: unlock of unlocked key {key}");
        };
        // A present entry with a free permit only has waiters, no holder.
        if entry.semaphore.available_permits() > 0 {
            panic!("keyed lock: unlock of unlocked key {key}");
        }

        entry.semaphore.add_permits(1);
        entry.refs -= 1;
        if entry.refs == 0 {
            locks.remove(key);
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
