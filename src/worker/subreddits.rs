//! Subreddit-watcher worker
//!
//! Scans the newest posts of a watched subreddit and fires the watchers
//! whose filter predicate matches.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::post_watchers::{authenticated_for_watchers, fan_out};
use super::{observe_queue_age, Consumer};
use crate::error::{AppError, Result};
use crate::lock::{lock_key, Locker};
use crate::queue::{Delivery, SUBREDDITS};
use crate::reddit;
use crate::store::models::WatcherType;
use crate::store::{
    AccountRepository, DeviceRepository, SubredditRepository, WatcherRepository,
};

pub struct SubredditsConsumer {
    subreddit_repo: Arc<dyn SubredditRepository>,
    watcher_repo: Arc<dyn WatcherRepository>,
    account_repo: Arc<dyn AccountRepository>,
    device_repo: Arc<dyn DeviceRepository>,
    locks: Arc<dyn Locker>,
    reddit: Arc<reddit::Client>,
    apns: Arc<dyn crate::apns::Pusher>,
    bundle_id: String,
}

impl SubredditsConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subreddit_repo: Arc<dyn SubredditRepository>,
        watcher_repo: Arc<dyn WatcherRepository>,
        account_repo: Arc<dyn AccountRepository>,
        device_repo: Arc<dyn DeviceRepository>,
        locks: Arc<dyn Locker>,
        reddit: Arc<reddit::Client>,
        apns: Arc<dyn crate::apns::Pusher>,
        bundle_id: String,
    ) -> Self {
        Self {
            subreddit_repo,
            watcher_repo,
            account_repo,
            device_repo,
            locks,
            reddit,
            apns,
            bundle_id,
        }
    }

    async fn process(&self, subreddit_id: i64) -> Result<()> {
        let now = Utc::now();
        let subreddit = match self.subreddit_repo.get_by_id(subreddit_id).await {
            Ok(subreddit) => subreddit,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let watchers = self
            .watcher_repo
            .get_by_type_and_watchee_id(WatcherType::Subreddit, subreddit_id)
            .await?;
        if watchers.is_empty() {
            self.subreddit_repo
                .update_last_checked(subreddit_id, now)
                .await?;
            return Ok(());
        }

        // Poll with the first watcher's account tokens.
        let Some(handle) =
            authenticated_for_watchers(&self.reddit, self.account_repo.as_ref(), &watchers[0], now)
                .await?
        else {
            return Ok(());
        };

        let posts = match handle.subreddit_posts(&subreddit.name).await {
            Ok(posts) => posts,
            Err(reddit::Error::RateLimited) => {
                tracing::debug!(subreddit = %subreddit.name, "Upstream rate limited, skipping tick");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(subreddit = %subreddit.name, error = %err, "Post fetch failed");
                return Ok(());
            }
        };

        let sent = fan_out(
            self.watcher_repo.as_ref(),
            self.device_repo.as_ref(),
            self.apns.as_ref(),
            &self.bundle_id,
            "subreddit_watcher",
            &watchers,
            &posts,
            now,
        )
        .await?;

        tracing::debug!(
            subreddit = %subreddit.name,
            watchers = watchers.len(),
            posts = posts.len(),
            sent,
            "Subreddit scan complete"
        );

        self.subreddit_repo
            .update_last_checked(subreddit_id, now)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Consumer for SubredditsConsumer {
    fn queue(&self) -> &'static str {
        SUBREDDITS
    }

    fn locks(&self) -> &dyn Locker {
        self.locks.as_ref()
    }

    async fn consume(&self, delivery: &Delivery) {
        let key = lock_key(SUBREDDITS, &delivery.payload);
        observe_queue_age(self.locks.as_ref(), SUBREDDITS, &key).await;

        let result = match delivery.payload.parse::<i64>() {
            Ok(subreddit_id) => self.process(subreddit_id).await,
            Err(_) => Err(AppError::Validation(format!(
                "malformed subreddit id payload {:?}",
                delivery.payload
            ))),
        };

        if let Err(error) = result {
            tracing::error!(%error, payload = %delivery.payload, "Subreddit scan failed");
        }
    }
}
