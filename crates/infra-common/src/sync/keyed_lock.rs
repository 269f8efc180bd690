//! Per-key async locks
//!
//! Serializes work on the same key (a tenant, a phone number, a ledger
//! account) while letting different keys proceed in parallel. Entries are
//! removed from the map once the last holder or waiter goes away, so the map
//! only ever contains keys that are in use.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Arena of async mutexes keyed by string
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<LockMap>,
}

/// Guard for a single key; the key is unlocked on drop
#[derive(Debug)]
pub struct KeyedLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<LockMap>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> KeyedLockGuard {
        let mutex = self
            .inner
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyedLockGuard {
            key: key.to_string(),
            guard: Some(guard),
            map: self.inner.clone(),
        }
    }

    /// Lock several keys at once.
    ///
    /// Keys are de-duplicated and acquired in sorted order, so two callers
    /// locking overlapping sets can never deadlock each other.
    pub async fn lock_many<I, S>(&self, keys: I) -> Vec<KeyedLockGuard>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.inner.len()
    }
}

impl KeyedLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        // Release the mutex before checking whether anyone else still refers to it.
        self.guard.take();
        self.map
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
