use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-container-name mutexes shared by every update run.
#[derive(Debug, Clone, Default)]
pub struct NameLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other run holds `name`.
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self.inner.entry(name.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drops entries nobody holds or waits for.
    pub fn prune(&self) {
        self.inner.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_name_is_exclusive() {
        let locks = NameLocks::new();
        let guard = locks.acquire("web").await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = contender.acquire("web").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_names_do_not_block() {
        let locks = NameLocks::new();
        let _web = locks.acquire("web").await;
        let _worker = locks.acquire("worker").await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = NameLocks::new();
        let held = locks.acquire("web").await;
        drop(locks.acquire("worker").await);

        locks.prune();
        assert_eq!(locks.len(), 1);

        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}
