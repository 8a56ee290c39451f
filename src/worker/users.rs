//! User-watcher worker
//!
//! Scans the newest submissions of a watched user.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::post_watchers::{authenticated_for_watchers, fan_out};
use super::{observe_queue_age, Consumer};
use crate::error::{AppError, Result};
use crate::lock::{lock_key, Locker};
use crate::queue::{Delivery, USERS};
use crate::reddit;
use crate::store::models::WatcherType;
use crate::store::{AccountRepository, DeviceRepository, UserRepository, WatcherRepository};

pub struct UsersConsumer {
    user_repo: Arc<dyn UserRepository>,
    watcher_repo: Arc<dyn WatcherRepository>,
    account_repo: Arc<dyn AccountRepository>,
    device_repo: Arc<dyn DeviceRepository>,
    locks: Arc<dyn Locker>,
    reddit: Arc<reddit::Client>,
    apns: Arc<dyn crate::apns::Pusher>,
    bundle_id: String,
}

impl UsersConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_repo: Arc<dyn UserRepository>,
        watcher_repo: Arc<dyn WatcherRepository>,
        account_repo: Arc<dyn AccountRepository>,
        device_repo: Arc<dyn DeviceRepository>,
        locks: Arc<dyn Locker>,
        reddit: Arc<reddit::Client>,
        apns: Arc<dyn crate::apns::Pusher>,
        bundle_id: String,
    ) -> Self {
        Self {
            user_repo,
            watcher_repo,
            account_repo,
            device_repo,
            locks,
            reddit,
            apns,
            bundle_id,
        }
    }

    async fn process(&self, user_id: i64) -> Result<()> {
        let now = Utc::now();
        let user = match self.user_repo.get_by_id(user_id).await {
            Ok(user) => user,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let watchers = self
            .watcher_repo
            .get_by_type_and_watchee_id(WatcherType::User, user_id)
            .await?;
        if watchers.is_empty() {
            self.user_repo.update_last_checked(user_id, now).await?;
            return Ok(());
        }

        let Some(handle) =
            authenticated_for_watchers(&self.reddit, self.account_repo.as_ref(), &watchers[0], now)
                .await?
        else {
            return Ok(());
        };

        let posts = match handle.user_posts(&user.name).await {
            Ok(posts) => posts,
            Err(reddit::Error::RateLimited) => {
                tracing::debug!(user = %user.name, "Upstream rate limited, skipping tick");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(user = %user.name, error = %err, "Submission fetch failed");
                return Ok(());
            }
        };

        let sent = fan_out(
            self.watcher_repo.as_ref(),
            self.device_repo.as_ref(),
            self.apns.as_ref(),
            &self.bundle_id,
            "user_watcher",
            &watchers,
            &posts,
            now,
        )
        .await?;

        tracing::debug!(
            user = %user.name,
            watchers = watchers.len(),
            posts = posts.len(),
            sent,
            "User scan complete"
        );

        self.user_repo.update_last_checked(user_id, now).await?;
        Ok(())
    }
}

#[async_trait]
impl Consumer for UsersConsumer {
    fn queue(&self) -> &'static str {
        USERS
    }

    fn locks(&self) -> &dyn Locker {
        self.locks.as_ref()
    }

    async fn consume(&self, delivery: &Delivery) {
        let key = lock_key(USERS, &delivery.payload);
        observe_queue_age(self.locks.as_ref(), USERS, &key).await;

        let result = match delivery.payload.parse::<i64>() {
            Ok(user_id) => self.process(user_id).await,
            Err(_) => Err(AppError::Validation(format!(
                "malformed user id payload {:?}",
                delivery.payload
            ))),
        };

        if let Err(error) = result {
            tracing::error!(%error, payload = %delivery.payload, "User scan failed");
        }
    }
}
