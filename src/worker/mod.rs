//! Notification workers
//!
//! Each worker kind is a fleet of queue consumers sharing one skeleton:
//! dequeue, measure lock-derived queue age, load the entity, refresh
//! tokens, fetch upstream, diff, dispatch, persist, release the lock.
//! Deliveries are always acknowledged; re-work is scheduled by the
//! enqueuer, never by queue redelivery.

pub mod live_activities;
pub mod notifications;
pub mod post_watchers;
pub mod stuck_notifications;
pub mod subreddits;
pub mod trending;
pub mod users;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::lock::{lock_key, queue_age, Locker};
use crate::metrics::{CONSUMER_RUNTIME_SECONDS, DEQUEUE_LATENCY_SECONDS};
use crate::queue::{Delivery, QueueConnection};
use crate::store::models::NOTIFICATION_CHECK_TIMEOUT;

/// Poll cadence for an idle consumer; also how often shutdown is observed.
const DEQUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One queue consumer. The fleet runner drives `consume` sequentially per
/// consumer; a delivery in flight is never cancelled by shutdown.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Queue this consumer drains.
    fn queue(&self) -> &'static str;

    /// Lock manager holding the per-item lock the enqueuer acquired.
    fn locks(&self) -> &dyn Locker;

    /// Process one delivery. Errors are handled internally; the runner
    /// acknowledges regardless, to avoid poison-message loops.
    async fn consume(&self, delivery: &Delivery);
}

/// Spawn `count` consumers draining `consumer`'s queue until shutdown.
pub fn spawn_fleet<C: Consumer>(
    queue: QueueConnection,
    consumer: Arc<C>,
    count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let name = consumer.queue();
    tracing::info!(queue = name, consumers = count, "Starting consumer fleet");

    (0..count)
        .map(|tag| {
            let queue = queue.clone();
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                consume_loop(queue, consumer, tag, shutdown).await;
            })
        })
        .collect()
}

async fn consume_loop<C: Consumer>(
    queue: QueueConnection,
    consumer: Arc<C>,
    tag: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = consumer.queue();

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Shutdown may only interrupt an idle poll, never a delivery
        // already being processed.
        let delivery = match queue.consume(name).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(DEQUEUE_POLL_INTERVAL) => continue,
                    _ = shutdown.changed() => break,
                }
            }
            Err(error) => {
                tracing::error!(%error, queue = name, tag, "Failed to dequeue");
                tokio::select! {
                    _ = tokio::time::sleep(DEQUEUE_POLL_INTERVAL) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        let start = Instant::now();
        consumer.consume(&delivery).await;
        CONSUMER_RUNTIME_SECONDS
            .with_label_values(&[name])
            .observe(start.elapsed().as_secs_f64());

        if let Err(error) = queue.ack(&delivery).await {
            tracing::error!(
                %error,
                queue = name,
                payload = %delivery.payload,
                "Failed to acknowledge delivery"
            );
        }

        // Ack before release: the clean tick treats an unacked payload
        // with no lock as orphaned, so the lock must outlive the ack.
        release_lock(consumer.locks(), &lock_key(name, &delivery.payload)).await;
    }

    tracing::debug!(queue = name, tag, "Consumer stopped");
}

/// Record the observed queue age of a delivery, derived from the residual
/// TTL of its lock.
pub(crate) async fn observe_queue_age(locks: &dyn Locker, queue: &str, key: &str) {
    let residual = match locks.ttl(key).await {
        Ok(ttl) => ttl,
        Err(error) => {
            tracing::debug!(%error, key, "Failed to read lock TTL");
            None
        }
    };
    let age = queue_age(NOTIFICATION_CHECK_TIMEOUT, residual);
    DEQUEUE_LATENCY_SECONDS
        .with_label_values(&[queue])
        .observe(age.as_secs_f64());
}

/// Release a work-item lock; failures are logged, the TTL is the backstop.
pub(crate) async fn release_lock(locks: &dyn Locker, key: &str) {
    if let Err(error) = locks.release(key).await {
        tracing::error!(%error, key, "Failed to release lock");
    }
}

/// Truncate to at most `max` bytes on a char boundary, for alert bodies.
pub(crate) fn truncate_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_body_keeps_short_strings() {
        assert_eq!(truncate_body("hello", 100), "hello");
    }

    #[test]
    fn truncate_body_respects_char_boundaries() {
        let body = "ééééé";
        let truncated = truncate_body(body, 3);
        assert!(truncated.starts_with('é'));
        assert!(truncated.ends_with('…'));
    }
}
