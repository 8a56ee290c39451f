//! Enqueue scheduler
//!
//! Periodic ticks, one per work kind, that scan the store for due
//! entities and publish their ids onto the named queues. Before each
//! publish the per-item lock is set with the delivery timeout as TTL;
//! an item whose lock is already held is still being processed and is
//! skipped this tick. The lock is set before the queue push, never after.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::lock::{lock_key, Locker};
use crate::metrics::{ITEMS_ENQUEUED_TOTAL, ITEMS_SKIPPED_LOCKED_TOTAL, QUEUE_READY_DEPTH};
use crate::queue::{self, Publisher, QueueConnection};
use crate::store::models::{
    LIVE_ACTIVITY_CHECK_INTERVAL, NOTIFICATION_CHECK_INTERVAL, NOTIFICATION_CHECK_TIMEOUT,
    STUCK_NOTIFICATION_CHECK_INTERVAL, SUBREDDIT_CHECK_INTERVAL, TRENDING_CHECK_INTERVAL,
    USER_CHECK_INTERVAL,
};
use crate::store::{
    AccountRepository, DeviceRepository, LiveActivityRepository, SubredditRepository,
    UserRepository,
};

/// Cadence of the unacked-requeue and queue-depth tick.
const CLEAN_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the stale device/account pruning tick.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// One scheduler tick kind.
#[derive(Debug, Clone, Copy)]
enum Tick {
    Accounts,
    Subreddits,
    Users,
    Trending,
    LiveActivities,
    Stuck,
    Clean,
    Prune,
}

impl Tick {
    const ALL: [Tick; 8] = [
        Tick::Accounts,
        Tick::Subreddits,
        Tick::Users,
        Tick::Trending,
        Tick::LiveActivities,
        Tick::Stuck,
        Tick::Clean,
        Tick::Prune,
    ];

    fn name(self) -> &'static str {
        match self {
            Tick::Accounts => "accounts",
            Tick::Subreddits => "subreddits",
            Tick::Users => "users",
            Tick::Trending => "trending",
            Tick::LiveActivities => "live-activities",
            Tick::Stuck => "stuck-notifications",
            Tick::Clean => "clean",
            Tick::Prune => "prune",
        }
    }

    fn interval(self) -> Duration {
        match self {
            Tick::Accounts => NOTIFICATION_CHECK_INTERVAL,
            Tick::Subreddits => SUBREDDIT_CHECK_INTERVAL,
            Tick::Users => USER_CHECK_INTERVAL,
            Tick::Trending => TRENDING_CHECK_INTERVAL,
            Tick::LiveActivities => LIVE_ACTIVITY_CHECK_INTERVAL,
            Tick::Stuck => STUCK_NOTIFICATION_CHECK_INTERVAL,
            Tick::Clean => CLEAN_INTERVAL,
            Tick::Prune => PRUNE_INTERVAL,
        }
    }
}

/// Acquire the item lock, then publish. Returns (published, skipped).
pub(crate) async fn enqueue_items<I>(
    locks: &dyn Locker,
    publisher: &dyn Publisher,
    queue: &'static str,
    items: I,
    ttl: Duration,
) -> Result<(usize, usize)>
where
    I: IntoIterator<Item = String>,
{
    let mut published = 0usize;
    let mut skipped = 0usize;

    for item in items {
        let key = lock_key(queue, &item);
        if !locks.acquire(&key, ttl).await? {
            // Still in flight from a previous tick.
            skipped += 1;
            continue;
        }
        if let Err(error) = publisher.publish(queue, &item).await {
            // Without the payload the lock would block the item until
            // its TTL elapses; release it so the next tick retries.
            locks.release(&key).await?;
            return Err(error);
        }
        published += 1;
    }

    ITEMS_ENQUEUED_TOTAL
        .with_label_values(&[queue])
        .inc_by(published as u64);
    ITEMS_SKIPPED_LOCKED_TOTAL
        .with_label_values(&[queue])
        .inc_by(skipped as u64);

    Ok((published, skipped))
}

pub struct Enqueuer {
    account_repo: Arc<dyn AccountRepository>,
    device_repo: Arc<dyn DeviceRepository>,
    subreddit_repo: Arc<dyn SubredditRepository>,
    user_repo: Arc<dyn UserRepository>,
    live_activity_repo: Arc<dyn LiveActivityRepository>,
    locks: Arc<dyn Locker>,
    publisher: Arc<dyn Publisher>,
    queue: QueueConnection,
}

impl Enqueuer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_repo: Arc<dyn AccountRepository>,
        device_repo: Arc<dyn DeviceRepository>,
        subreddit_repo: Arc<dyn SubredditRepository>,
        user_repo: Arc<dyn UserRepository>,
        live_activity_repo: Arc<dyn LiveActivityRepository>,
        locks: Arc<dyn Locker>,
        publisher: Arc<dyn Publisher>,
        queue: QueueConnection,
    ) -> Self {
        Self {
            account_repo,
            device_repo,
            subreddit_repo,
            user_repo,
            live_activity_repo,
            locks,
            publisher,
            queue,
        }
    }

    /// Spawn one interval task per tick kind.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!("Starting enqueue scheduler");

        Tick::ALL
            .iter()
            .map(|tick| self.clone().spawn_tick(*tick, shutdown.clone()))
            .collect()
    }

    fn spawn_tick(self: Arc<Self>, tick: Tick, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(tick.interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(error) = self.run_tick(tick).await {
                            tracing::error!(%error, tick = tick.name(), "Enqueue tick failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!(tick = tick.name(), "Enqueue tick stopped");
        })
    }

    async fn run_tick(&self, tick: Tick) -> Result<()> {
        match tick {
            Tick::Accounts => self.tick_accounts().await,
            Tick::Subreddits => self.tick_subreddits().await,
            Tick::Users => self.tick_users().await,
            Tick::Trending => self.tick_trending().await,
            Tick::LiveActivities => self.tick_live_activities().await,
            Tick::Stuck => self.tick_stuck().await,
            Tick::Clean => self.tick_clean().await,
            Tick::Prune => self.tick_prune().await,
        }
    }

    async fn tick_accounts(&self) -> Result<()> {
        let now = Utc::now();
        let checked_before =
            now - chrono::Duration::from_std(NOTIFICATION_CHECK_INTERVAL).unwrap_or_else(|_| chrono::Duration::zero());
        let ids = self.account_repo.get_due(checked_before, now).await?;
        let (published, skipped) = enqueue_items(
            self.locks.as_ref(),
            self.publisher.as_ref(),
            queue::NOTIFICATIONS,
            ids.into_iter().map(|id| id.to_string()),
            NOTIFICATION_CHECK_TIMEOUT,
        )
        .await?;
        if published > 0 || skipped > 0 {
            tracing::debug!(published, skipped, "Enqueued due accounts");
        }
        Ok(())
    }

    async fn tick_subreddits(&self) -> Result<()> {
        let now = Utc::now();
        let checked_before =
            now - chrono::Duration::from_std(SUBREDDIT_CHECK_INTERVAL).unwrap_or_else(|_| chrono::Duration::zero());
        let ids = self.subreddit_repo.get_due(checked_before).await?;
        let (published, skipped) = enqueue_items(
            self.locks.as_ref(),
            self.publisher.as_ref(),
            queue::SUBREDDITS,
            ids.into_iter().map(|id| id.to_string()),
            NOTIFICATION_CHECK_TIMEOUT,
        )
        .await?;
        if published > 0 || skipped > 0 {
            tracing::debug!(published, skipped, "Enqueued due subreddits");
        }
        Ok(())
    }

    async fn tick_users(&self) -> Result<()> {
        let now = Utc::now();
        let checked_before =
            now - chrono::Duration::from_std(USER_CHECK_INTERVAL).unwrap_or_else(|_| chrono::Duration::zero());
        let ids = self.user_repo.get_due(checked_before).await?;
        let (published, skipped) = enqueue_items(
            self.locks.as_ref(),
            self.publisher.as_ref(),
            queue::USERS,
            ids.into_iter().map(|id| id.to_string()),
            NOTIFICATION_CHECK_TIMEOUT,
        )
        .await?;
        if published > 0 || skipped > 0 {
            tracing::debug!(published, skipped, "Enqueued due users");
        }
        Ok(())
    }

    async fn tick_trending(&self) -> Result<()> {
        let ids = self.subreddit_repo.get_trending().await?;
        let (published, skipped) = enqueue_items(
            self.locks.as_ref(),
            self.publisher.as_ref(),
            queue::TRENDING,
            ids.into_iter().map(|id| id.to_string()),
            NOTIFICATION_CHECK_TIMEOUT,
        )
        .await?;
        if published > 0 || skipped > 0 {
            tracing::debug!(published, skipped, "Enqueued trending subreddits");
        }
        Ok(())
    }

    async fn tick_live_activities(&self) -> Result<()> {
        let tokens = self.live_activity_repo.list_tokens().await?;
        let (published, skipped) = enqueue_items(
            self.locks.as_ref(),
            self.publisher.as_ref(),
            queue::LIVE_ACTIVITIES,
            tokens,
            NOTIFICATION_CHECK_TIMEOUT,
        )
        .await?;
        if published > 0 || skipped > 0 {
            tracing::debug!(published, skipped, "Enqueued live activities");
        }
        Ok(())
    }

    async fn tick_stuck(&self) -> Result<()> {
        let now = Utc::now();
        let unstuck_before =
            now - chrono::Duration::from_std(STUCK_NOTIFICATION_CHECK_INTERVAL).unwrap_or_else(|_| chrono::Duration::zero());
        let ids = self.account_repo.get_stuck_due(unstuck_before, now).await?;
        let (published, skipped) = enqueue_items(
            self.locks.as_ref(),
            self.publisher.as_ref(),
            queue::STUCK_NOTIFICATIONS,
            ids.into_iter().map(|id| id.to_string()),
            NOTIFICATION_CHECK_TIMEOUT,
        )
        .await?;
        if published > 0 || skipped > 0 {
            tracing::debug!(published, skipped, "Enqueued stuck-marker checks");
        }
        Ok(())
    }

    /// Requeue unacked payloads orphaned by crashed consumers and refresh
    /// queue-depth gauges.
    ///
    /// A payload is orphaned once its item lock is gone: live consumers
    /// hold the lock until after their ack. Requeueing takes the lock
    /// first, the same lock-before-publish order as a normal enqueue, so
    /// an in-flight or freshly re-enqueued item is left alone.
    async fn tick_clean(&self) -> Result<()> {
        for name in queue::ALL_QUEUES {
            let mut moved = 0u64;
            for payload in self.queue.unacked_payloads(name).await? {
                let key = lock_key(name, &payload);
                if !self.locks.acquire(&key, NOTIFICATION_CHECK_TIMEOUT).await? {
                    continue;
                }
                if self.queue.requeue_unacked(name, &payload).await? {
                    moved += 1;
                } else {
                    // Acked in the meantime; nothing was requeued.
                    self.locks.release(&key).await?;
                }
            }
            if moved > 0 {
                tracing::info!(queue = name, moved, "Requeued orphaned deliveries");
            }
            let depth = self.queue.ready_depth(name).await?;
            QUEUE_READY_DEPTH.with_label_values(&[name]).set(depth);
        }
        Ok(())
    }

    /// Delete devices past their grace period, then accounts that no
    /// in-grace device references.
    async fn tick_prune(&self) -> Result<()> {
        let now = Utc::now();
        let devices = self.device_repo.prune_stale(now).await?;
        let accounts = self.account_repo.prune_stale(now).await?;
        if devices > 0 || accounts > 0 {
            tracing::info!(devices, accounts, "Pruned stale entities");
        }
        Ok(())
    }
}
