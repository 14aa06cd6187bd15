use crate::error::{AppError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Mutual exclusion for one idempotency slot.
#[async_trait]
pub trait KeyLock: Send + Sync {
    /// Waits until the caller is the only holder for `slot`.
    async fn acquire(&self, slot: &str) -> Result<KeyGuard>;

    /// Drops bookkeeping for slots nobody holds. Returns entries removed.
    fn prune_idle(&self) -> usize {
        0
    }
}

/// Held for the duration of a ledger step; releases on drop.
#[derive(Debug)]
pub struct KeyGuard {
    _guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    fn held(guard: OwnedMutexGuard<()>) -> Self {
        Self {
            _guard: Some(guard),
        }
    }

    /// A guard that excludes nothing; atomicity comes from the store.
    pub fn unlocked() -> Self {
        Self { _guard: None }
    }

    pub fn is_held(&self) -> bool {
        self._guard.is_some()
    }
}

/// Per-slot async mutex table for single-instance deployments.
///
/// Unrelated slots never share a mutex.
pub struct InProcessKeyLock {
    locks: DashMap<String, Arc<Mutex<()>>>,
    max_entries: usize,
}

impl InProcessKeyLock {
    /// Upper bound on tracked slots so a key flood cannot exhaust memory.
    pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

    pub fn new() -> Self {
        Self::with_max_entries(Self::DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            locks: DashMap::new(),
            max_entries,
        }
    }

    pub fn active_entries(&self) -> usize {
        self.locks.len()
    }
}

impl Default for InProcessKeyLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyLock for InProcessKeyLock {
    async fn acquire(&self, slot: &str) -> Result<KeyGuard> {
        if self.locks.len() >= self.max_entries && !self.locks.contains_key(slot) {
            // Reclaim before refusing; most entries are usually idle.
            self.prune_idle();
            if self.locks.len() >= self.max_entries {
                return Err(AppError::StorageUnavailable(
                    "Too many concurrent idempotency keys, retry later".to_string(),
                ));
            }
        }

        let lock = Arc::clone(
            self.locks
                .entry(slot.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        Ok(KeyGuard::held(lock.lock_owned().await))
    }

    fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        // A waiter holds an Arc clone; a holder keeps try_lock failing.
        self.locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before.saturating_sub(self.locks.len())
    }
}

/// Lock strategy for multi-instance deployments.
///
/// Takes no local lock and relies on the store's atomic conditional insert,
/// which every shared backend provides.
#[derive(Debug, Default, Clone, Copy)]
pub struct StorageKeyLock;

#[async_trait]
impl KeyLock for StorageKeyLock {
    async fn acquire(&self, _slot: &str) -> Result<KeyGuard> {
        Ok(KeyGuard::unlocked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_slot_is_exclusive() {
        let locks = Arc::new(InProcessKeyLock::new());
        let guard = locks.acquire("CreateProduct:k1").await.unwrap();
        assert!(guard.is_held());

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("CreateProduct:k1").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unrelated_slots_do_not_contend() {
        let locks = InProcessKeyLock::new();
        let _a = locks.acquire("CreateProduct:k1").await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("CreateProduct:k2"))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_entries() {
        let locks = InProcessKeyLock::new();
        let held = locks.acquire("a").await.unwrap();
        drop(locks.acquire("b").await.unwrap());

        assert_eq!(locks.active_entries(), 2);
        assert_eq!(locks.prune_idle(), 1);
        assert_eq!(locks.active_entries(), 1);
        drop(held);
        assert_eq!(locks.prune_idle(), 1);
    }

    #[tokio::test]
    async fn test_entry_limit() {
        let locks = InProcessKeyLock::with_max_entries(1);
        let _held = locks.acquire("a").await.unwrap();
        let refused = locks.acquire("b").await;
        assert!(matches!(refused, Err(AppError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_storage_lock_is_passthrough() {
        let guard = StorageKeyLock.acquire("anything").await.unwrap();
        assert!(!guard.is_held());
    }
}
