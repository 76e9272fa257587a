//! Named async locks.
//!
//! Used wherever work must be serialized per container or per service while
//! leaving unrelated names fully concurrent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A lazily populated map of name -> async mutex.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Lock several keys at once.
    ///
    /// Keys are acquired in sorted order so two callers locking overlapping
    /// sets cannot deadlock.
    pub async fn lock_many<'a, I>(&self, keys: I) -> Vec<OwnedMutexGuard<()>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut keys: Vec<&str> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn is_free(locks: &KeyedLocks, key: &str) -> bool {
        tokio::time::timeout(Duration::from_millis(20), locks.lock(key)).await.is_ok()
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("chat").await;
        assert!(!is_free(&locks, "chat").await);
        drop(guard);
        assert!(is_free(&locks, "chat").await);
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let locks = KeyedLocks::new();
        let _chat = locks.lock("chat").await;
        assert!(is_free(&locks, "stream").await);
    }

    #[tokio::test]
    async fn test_lock_many_dedups() {
        let locks = KeyedLocks::new();
        let guards = locks.lock_many(["b", "a", "b"]).await;
        assert_eq!(guards.len(), 2);
        assert!(!is_free(&locks, "a").await);
        assert!(!is_free(&locks, "b").await);
    }
}
