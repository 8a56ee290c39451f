//! Distributed per-item locks
//!
//! Short-TTL locks over the shared key-value store. The lock is the only
//! cross-process coordination: at most one consumer processes a given
//! `(queue, entity id)` at a time. Keys are `locks:<queue>:<entity-id>`;
//! the TTL is the crash safety net, explicit release the fast path.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::Result;

/// Compose the lock key for a work item.
pub fn lock_key(queue: &str, entity_id: &str) -> String {
    format!("locks:{}:{}", queue, entity_id)
}

/// Lock operations used by the enqueuer and the workers.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Set `key` iff absent, with expiry. Returns whether it was acquired.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Residual TTL for `key`; `None` when the key does not exist or has
    /// no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Best-effort delete.
    async fn release(&self, key: &str) -> Result<()>;
}

/// Redis-backed lock manager.
#[derive(Clone)]
pub struct RedisLocker {
    redis: redis::aio::ConnectionManager,
}

impl RedisLocker {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.redis.clone();
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2: key missing, -1: no expiry
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

/// Derive the observed queue age of a delivery from the residual lock TTL.
///
/// The enqueuer sets the lock with `timeout` as TTL right before the push,
/// so `timeout - ttl` is how long the item waited plus dequeue overhead.
pub fn queue_age(timeout: Duration, residual_ttl: Option<Duration>) -> Duration {
    match residual_ttl {
        Some(ttl) => timeout.saturating_sub(ttl),
        None => Duration::ZERO,
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory lock manager for tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    pub struct MemoryLocker {
        entries: Mutex<HashMap<String, Instant>>,
    }

    impl MemoryLocker {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Locker for MemoryLocker {
        async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
            let mut entries = self.entries.lock().unwrap();
            let now = Instant::now();
            entries.retain(|_, expires| *expires > now);
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(key.to_string(), now + ttl);
            Ok(true)
        }

        async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
            let entries = self.entries.lock().unwrap();
            Ok(entries
                .get(key)
                .map(|expires| expires.saturating_duration_since(Instant::now())))
        }

        async fn release(&self, key: &str) -> Result<()> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryLocker;
    use super::*;

    #[test]
    fn lock_key_format() {
        assert_eq!(lock_key("notifications", "42"), "locks:notifications:42");
        assert_eq!(
            lock_key("live-activities", "tok"),
            "locks:live-activities:tok"
        );
    }

    #[test]
    fn queue_age_from_residual_ttl() {
        let timeout = Duration::from_secs(300);
        assert_eq!(
            queue_age(timeout, Some(Duration::from_secs(295))),
            Duration::from_secs(5)
        );
        assert_eq!(queue_age(timeout, None), Duration::ZERO);
        // A TTL above the timeout clamps to zero rather than underflowing.
        assert_eq!(
            queue_age(timeout, Some(Duration::from_secs(400))),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn memory_locker_is_exclusive_until_released() {
        let locker = MemoryLocker::new();
        let ttl = Duration::from_secs(10);

        assert!(locker.acquire("locks:notifications:1", ttl).await.unwrap());
        assert!(!locker.acquire("locks:notifications:1", ttl).await.unwrap());
        assert!(locker.acquire("locks:notifications:2", ttl).await.unwrap());

        locker.release("locks:notifications:1").await.unwrap();
        assert!(locker.acquire("locks:notifications:1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn memory_locker_expires_entries() {
        let locker = MemoryLocker::new();
        assert!(
            locker
                .acquire("locks:users:9", Duration::from_millis(20))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(
            locker
                .acquire("locks:users:9", Duration::from_secs(10))
                .await
                .unwrap()
        );
    }
}
