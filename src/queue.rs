//! Named work queues over Redis lists
//!
//! Each queue is a pair of lists: `queues:<name>:ready` and
//! `queues:<name>:unacked`. Publishing pushes onto the ready list;
//! consuming atomically moves a payload to the unacked list, and an
//! acknowledgement removes it there. Payloads left in unacked by a crashed
//! process are re-queued by the enqueuer's clean tick, which preserves
//! at-least-once delivery.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::Result;

/// Queue names, one per work kind.
pub const NOTIFICATIONS: &str = "notifications";
pub const SUBREDDITS: &str = "subreddits";
pub const USERS: &str = "users";
pub const TRENDING: &str = "trending";
pub const LIVE_ACTIVITIES: &str = "live-activities";
pub const STUCK_NOTIFICATIONS: &str = "stuck-notifications";

/// All queue names, in clean-tick order.
pub const ALL_QUEUES: [&str; 6] = [
    NOTIFICATIONS,
    SUBREDDITS,
    USERS,
    TRENDING,
    LIVE_ACTIVITIES,
    STUCK_NOTIFICATIONS,
];

fn ready_key(queue: &str) -> String {
    format!("queues:{}:ready", queue)
}

fn unacked_key(queue: &str) -> String {
    format!("queues:{}:unacked", queue)
}

/// Publishing side, used by the enqueuer.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, queue: &str, payload: &str) -> Result<()>;
}

/// A dequeued payload awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: &'static str,
    pub payload: String,
}

/// Redis-backed queue connection shared by publishers and consumers.
#[derive(Clone)]
pub struct QueueConnection {
    redis: redis::aio::ConnectionManager,
}

impl QueueConnection {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }

    /// Pop one payload from `queue` into its unacked list.
    ///
    /// Non-blocking: the shared multiplexed connection must never run
    /// blocking commands. Consumer loops poll and sleep on `None`.
    pub async fn consume(&self, queue: &'static str) -> Result<Option<Delivery>> {
        let mut conn = self.redis.clone();
        let payload: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(ready_key(queue))
            .arg(unacked_key(queue))
            .query_async(&mut conn)
            .await?;

        Ok(payload.map(|payload| Delivery { queue, payload }))
    }

    /// Acknowledge a delivery, removing it from the unacked list.
    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .lrem(unacked_key(delivery.queue), -1, &delivery.payload)
            .await?;
        Ok(())
    }

    /// Number of payloads waiting in the ready list.
    pub async fn ready_depth(&self, queue: &str) -> Result<i64> {
        let mut conn = self.redis.clone();
        let depth: i64 = conn.llen(ready_key(queue)).await?;
        Ok(depth)
    }

    /// Payloads currently sitting in the unacked list.
    pub async fn unacked_payloads(&self, queue: &str) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let payloads: Vec<String> = conn.lrange(unacked_key(queue), 0, -1).await?;
        Ok(payloads)
    }

    /// Move one orphaned payload from unacked back to ready.
    ///
    /// The caller must hold the payload's item lock; a live consumer
    /// keeps that lock until after its ack, so holding it proves the
    /// payload is orphaned. Returns false when the payload was acked in
    /// the meantime.
    pub async fn requeue_unacked(&self, queue: &str, payload: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.lrem(unacked_key(queue), 1, payload).await?;
        if removed == 0 {
            return Ok(false);
        }
        let _: i64 = conn.lpush(ready_key(queue), payload).await?;
        Ok(true)
    }
}

#[async_trait]
impl Publisher for QueueConnection {
    async fn publish(&self, queue: &str, payload: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.lpush(ready_key(queue), payload).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory publisher capturing published payloads for tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryPublisher {
        pub published: Mutex<Vec<(String, String)>>,
    }

    impl MemoryPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn payloads(&self, queue: &str) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|(q, _)| q == queue)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Publisher for MemoryPublisher {
        async fn publish(&self, queue: &str, payload: &str) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((queue.to_string(), payload.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_key_layout() {
        assert_eq!(ready_key("notifications"), "queues:notifications:ready");
        assert_eq!(
            unacked_key("live-activities"),
            "queues:live-activities:unacked"
        );
    }

    #[test]
    fn all_queues_are_distinct() {
        let mut names: Vec<&str> = ALL_QUEUES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_QUEUES.len());
    }
}
