use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Async mutexes keyed by record id. Every read-modify-write of an account
/// (and of an offer code) runs while holding its key's guard.
///
/// Ordering: an account guard is always taken before an offer guard, and
/// never while another account's guard is held. Callback guards are never
/// held together with any other guard.
///
/// A key's entry lives only while some task holds or waits for it.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

/// Releases the key on drop and forgets it when nobody else wants it.
pub struct KeyedGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<LockMap>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Waiters clone the Arc under the same shard lock, so a count of one
        // means the map holds the only reference.
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;

        KeyedGuard {
            guard: Some(guard),
            key: key.to_string(),
            locks: self.locks.clone(),
        }
    }

    pub async fn lock_account(&self, account_id: &str) -> KeyedGuard {
        self.lock(&format!("account:{}", account_id)).await
    }

    pub async fn lock_offer(&self, code: &str) -> KeyedGuard {
        self.lock(&format!("offer:{}", code)).await
    }

    pub async fn lock_callback(&self, gateway_ref: &str) -> KeyedGuard {
        self.lock(&format!("callback:{}", gateway_ref)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock_account("a1").await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock_account("a1").await;

        let other = tokio::time::timeout(Duration::from_millis(100), locks.lock_account("a2")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn released_keys_are_forgotten() {
        let locks = KeyedLocks::new();

        for id in 0..50 {
            let _guard = locks.lock_account(&format!("a{}", id)).await;
        }
        assert!(locks.locks.is_empty());

        let held = locks.lock_offer("PROMO").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock_offer("PROMO").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(locks.locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.locks.is_empty());
    }
}
