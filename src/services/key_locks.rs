//! Per-identifier mutual exclusion.
//!
//! Each file id maps to its own async mutex, created on first use. The table
//! only holds weak handles, so an entry dies as soon as the last guard or
//! waiter for that id goes away; dead entries are pruned on acquisition.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard for one id. The lock is released when the guard is dropped.
pub type KeyGuard = OwnedMutexGuard<()>;

/// Lock acquisition waited longer than the configured timeout.
#[derive(Debug, Clone, Copy)]
pub struct LockTimeout;

pub struct KeyLocks {
    table: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
    wait: Duration,
}

impl KeyLocks {
    pub fn new(wait: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            wait,
        }
    }

    /// Acquire the exclusive lock for `key`, waiting at most the configured
    /// timeout.
    pub async fn lock(&self, key: &str) -> Result<KeyGuard, LockTimeout> {
        let handle = self.handle(key);
        tokio::time::timeout(self.wait, handle.lock_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = table.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        table.retain(|_, handle| handle.strong_count() > 0);
        let handle = Arc::new(AsyncMutex::new(()));
        table.insert(key.to_string(), Arc::downgrade(&handle));
        handle
    }

    /// Number of ids with a live lock handle.
    #[cfg(test)]
    fn active(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        table.values().filter(|handle| handle.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new(Duration::from_secs(5)));
        let guard = locks.lock("a").await.unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let locks = Arc::clone(&locks);
            let released = Arc::clone(&released);
            tokio::spawn(async move {
                let _guard = locks.lock("a").await.unwrap();
                assert!(released.load(Ordering::SeqCst));
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        released.store(true, Ordering::SeqCst);
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let locks = KeyLocks::new(Duration::from_millis(50));
        let _a = locks.lock("a").await.unwrap();
        let _b = locks.lock("b").await.unwrap();
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn wait_is_bounded() {
        let locks = KeyLocks::new(Duration::from_millis(10));
        let _held = locks.lock("a").await.unwrap();
        assert!(locks.lock("a").await.is_err());
    }

    #[tokio::test]
    async fn unused_entries_are_dropped() {
        let locks = KeyLocks::new(Duration::from_secs(1));
        for i in 0..100 {
            let _guard = locks.lock(&format!("id-{}", i)).await.unwrap();
        }
        assert_eq!(locks.active(), 0);

        let _guard = locks.lock("fresh").await.unwrap();
        let table_len = locks.table.lock().unwrap().len();
        assert_eq!(table_len, 1);
    }
}
