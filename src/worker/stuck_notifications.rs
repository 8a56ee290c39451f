//! Stuck-notification repair worker
//!
//! An account's inbox diff stalls forever if its high-water message is
//! deleted upstream: the before-cursor then never matches anything. This
//! worker verifies the stored marker still exists and rewinds it to the
//! newest inbox item when it does not.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{observe_queue_age, Consumer};
use crate::error::{AppError, Result};
use crate::lock::{lock_key, Locker};
use crate::queue::{Delivery, STUCK_NOTIFICATIONS};
use crate::reddit;
use crate::store::AccountRepository;

pub struct StuckNotificationsConsumer {
    account_repo: Arc<dyn AccountRepository>,
    locks: Arc<dyn Locker>,
    reddit: Arc<reddit::Client>,
}

impl StuckNotificationsConsumer {
    pub fn new(
        account_repo: Arc<dyn AccountRepository>,
        locks: Arc<dyn Locker>,
        reddit: Arc<reddit::Client>,
    ) -> Self {
        Self {
            account_repo,
            locks,
            reddit,
        }
    }

    async fn process(&self, account_id: i64) -> Result<()> {
        let now = Utc::now();
        let account = match self.account_repo.get_by_id(account_id).await {
            Ok(account) => account,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        if account.last_message_id.is_empty() {
            self.account_repo
                .update_last_unstuck(account_id, now, None)
                .await?;
            return Ok(());
        }

        let handle = self.reddit.new_authenticated(
            &account.reddit_account_id,
            &account.refresh_token,
            &account.access_token,
        );

        let marker = match handle.message_by_id(&account.last_message_id).await {
            Ok(marker) => marker,
            Err(reddit::Error::OauthRevoked) => {
                tracing::info!(account_id, "Upstream grant revoked, deleting account");
                self.account_repo.delete(account_id).await?;
                return Ok(());
            }
            Err(err) => {
                tracing::debug!(account_id, error = %err, "Marker lookup failed, skipping tick");
                return Ok(());
            }
        };

        if marker.is_some() {
            // Marker still resolvable upstream; nothing to repair.
            self.account_repo
                .update_last_unstuck(account_id, now, None)
                .await?;
            return Ok(());
        }

        // Rewind the marker to the newest inbox item.
        let rewound = match handle.inbox(None).await {
            Ok(page) => page
                .first()
                .map(|message| message.name.clone())
                .unwrap_or_default(),
            Err(err) => {
                tracing::debug!(account_id, error = %err, "Inbox fetch failed, skipping tick");
                return Ok(());
            }
        };

        tracing::info!(
            account_id,
            stale_marker = %account.last_message_id,
            rewound_marker = %rewound,
            "Rewinding stuck high-water marker"
        );

        self.account_repo
            .update_last_unstuck(account_id, now, Some(&rewound))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Consumer for StuckNotificationsConsumer {
    fn queue(&self) -> &'static str {
        STUCK_NOTIFICATIONS
    }

    fn locks(&self) -> &dyn Locker {
        self.locks.as_ref()
    }

    async fn consume(&self, delivery: &Delivery) {
        let key = lock_key(STUCK_NOTIFICATIONS, &delivery.payload);
        observe_queue_age(self.locks.as_ref(), STUCK_NOTIFICATIONS, &key).await;

        let result = match delivery.payload.parse::<i64>() {
            Ok(account_id) => self.process(account_id).await,
            Err(_) => Err(AppError::Validation(format!(
                "malformed account id payload {:?}",
                delivery.payload
            ))),
        };

        if let Err(error) = result {
            tracing::error!(%error, payload = %delivery.payload, "Stuck check failed");
        }
    }
}
