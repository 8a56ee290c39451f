//! Shared watcher fan-out
//!
//! The subreddit, user and trending workers differ only in how they load
//! the watchee and fetch posts; matching, hit bookkeeping and dispatch are
//! identical and live here.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::truncate_body;
use crate::apns::{alert_payload, Notification, PushOutcome, PushType, Pusher};
use crate::error::Result;
use crate::metrics::{NOTIFICATIONS_FAILED_TOTAL, NOTIFICATIONS_SENT_TOTAL};
use crate::reddit::{self, AuthenticatedClient, Post};
use crate::store::{AccountRepository, DeviceRepository, Watcher, WatcherRepository};

const MAX_BODY_LEN: usize = 2000;

/// Build the alert pushed for one watcher hit.
pub fn build_notification(
    post: &Post,
    watcher: &Watcher,
    kind: &'static str,
    bundle_id: &str,
) -> Notification {
    let title = if watcher.label.is_empty() {
        match kind {
            "user_watcher" => format!("New post by u/{}", watcher.watchee_label),
            "trending_post" => format!("Trending in r/{}", watcher.watchee_label),
            _ => format!("New post in r/{}", watcher.watchee_label),
        }
    } else {
        watcher.label.clone()
    };

    let payload = alert_payload(
        &title,
        &truncate_body(&post.title, MAX_BODY_LEN),
        &post.id,
        &[
            ("author", serde_json::json!(post.author)),
            ("post_id", serde_json::json!(post.id)),
            ("subreddit", serde_json::json!(post.subreddit)),
            ("watcher_id", serde_json::json!(watcher.id)),
            ("type", serde_json::json!(kind)),
        ],
    );

    Notification {
        device_token: watcher.device.apns_token.clone(),
        topic: bundle_id.to_string(),
        push_type: PushType::Alert,
        payload,
    }
}

/// Evaluate every watcher against every post and dispatch matches.
///
/// Each matching watcher fires at most once per post; the hit counter and
/// `last_notified_at` advance in one store update.
pub(crate) async fn fan_out(
    watcher_repo: &dyn WatcherRepository,
    device_repo: &dyn DeviceRepository,
    apns: &dyn Pusher,
    bundle_id: &str,
    kind: &'static str,
    watchers: &[Watcher],
    posts: &[Post],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut fired: HashSet<(i64, String)> = HashSet::new();
    let mut deleted_devices: HashSet<i64> = HashSet::new();
    let mut sent = 0usize;

    for post in posts {
        for watcher in watchers {
            if deleted_devices.contains(&watcher.device.id) {
                continue;
            }
            if !watcher.matches(post) {
                continue;
            }
            if !fired.insert((watcher.id, post.id.clone())) {
                continue;
            }

            watcher_repo.increment_hits(watcher.id, now).await?;

            let notification = build_notification(post, watcher, kind, bundle_id);
            match apns.push(&notification, watcher.device.sandbox).await {
                PushOutcome::Sent => {
                    sent += 1;
                    NOTIFICATIONS_SENT_TOTAL.with_label_values(&[kind]).inc();
                }
                PushOutcome::Permanent(reason) => {
                    NOTIFICATIONS_FAILED_TOTAL
                        .with_label_values(&[kind, "true"])
                        .inc();
                    tracing::info!(
                        watcher_id = watcher.id,
                        device_id = watcher.device.id,
                        reason,
                        "Permanent delivery failure, deleting device"
                    );
                    device_repo.delete(watcher.device.id).await?;
                    deleted_devices.insert(watcher.device.id);
                }
                PushOutcome::Retriable(reason) => {
                    NOTIFICATIONS_FAILED_TOTAL
                        .with_label_values(&[kind, "false"])
                        .inc();
                    tracing::warn!(
                        watcher_id = watcher.id,
                        device_id = watcher.device.id,
                        reason,
                        "Transient delivery failure"
                    );
                }
            }
        }
    }

    Ok(sent)
}

/// Build an authenticated handle for the account a watcher scan polls
/// with, refreshing its tokens when they are close to expiry.
///
/// Returns `None` when the grant is revoked; the account is deleted and
/// the scan should stop (cascades will have removed its watchers).
pub(crate) async fn authenticated_for_watchers<'a>(
    reddit: &'a reddit::Client,
    account_repo: &dyn AccountRepository,
    watcher: &Watcher,
    now: DateTime<Utc>,
) -> Result<Option<AuthenticatedClient<'a>>> {
    let account = &watcher.account;
    let handle = reddit.new_authenticated(
        &account.reddit_account_id,
        &account.refresh_token,
        &account.access_token,
    );

    if !account.needs_refresh(now) {
        return Ok(Some(handle));
    }

    match handle.refresh_tokens().await {
        Ok(tokens) => {
            let expires_at = now + chrono::Duration::from_std(tokens.expiry).unwrap_or_else(|_| chrono::Duration::zero());
            account_repo
                .update_tokens(
                    account.id,
                    &tokens.access_token,
                    &tokens.refresh_token,
                    expires_at,
                )
                .await?;
            Ok(Some(reddit.new_authenticated(
                &account.reddit_account_id,
                &tokens.refresh_token,
                &tokens.access_token,
            )))
        }
        Err(reddit::Error::OauthRevoked) => {
            tracing::info!(
                account_id = account.id,
                "Upstream grant revoked, deleting account"
            );
            account_repo.delete(account.id).await?;
            Ok(None)
        }
        Err(err) => {
            tracing::warn!(account_id = account.id, error = %err, "Token refresh failed");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apns::testing::MemoryPusher;
    use crate::store::models::{WatcherAccount, WatcherDevice, WatcherType};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryWatcherRepo {
        hits: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl WatcherRepository for MemoryWatcherRepo {
        async fn get_by_type_and_watchee_id(
            &self,
            _watcher_type: WatcherType,
            _watchee_id: i64,
        ) -> Result<Vec<Watcher>> {
            Ok(Vec::new())
        }

        async fn increment_hits(&self, id: i64, _notified_at: DateTime<Utc>) -> Result<()> {
            self.hits.lock().unwrap().push(id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryDeviceRepo {
        deleted: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl DeviceRepository for MemoryDeviceRepo {
        async fn get_by_id(&self, _id: i64) -> Result<crate::store::Device> {
            Err(crate::error::AppError::NotFound)
        }

        async fn get_inbox_notifiable_by_account_id(
            &self,
            _account_id: i64,
        ) -> Result<Vec<crate::store::Device>> {
            Ok(Vec::new())
        }

        async fn delete(&self, id: i64) -> Result<()> {
            self.deleted.lock().unwrap().push(id);
            Ok(())
        }

        async fn prune_stale(&self, _before: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    fn post(id: &str, score: i64) -> Post {
        Post {
            id: id.to_string(),
            title: "HELLO world".to_string(),
            author: "alice".to_string(),
            subreddit: "r".to_string(),
            body: String::new(),
            flair: String::new(),
            domain: "self.r".to_string(),
            score,
            num_comments: 0,
            created_at: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap(),
            permalink: format!("/r/r/comments/{}", id),
        }
    }

    fn watcher(label: &str) -> Watcher {
        Watcher {
            id: 1,
            created_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            last_notified_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            label: label.to_string(),
            device_id: 5,
            account_id: 9,
            watcher_type: WatcherType::Subreddit,
            watchee_id: 10,
            author: String::new(),
            subreddit: String::new(),
            upvotes: 5,
            keyword: "hello".to_string(),
            flair: String::new(),
            domain: String::new(),
            hits: 0,
            watchee_label: "r".to_string(),
            device: WatcherDevice {
                id: 5,
                apns_token: "devicetoken".to_string(),
                sandbox: false,
            },
            account: WatcherAccount {
                id: 9,
                reddit_account_id: "acct".to_string(),
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                token_expires_at: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
            },
        }
    }

    #[test]
    fn labelled_watcher_keeps_its_label() {
        let notification =
            build_notification(&post("t3_a", 10), &watcher("Keyboard deals"), "subreddit_watcher", "com.cometapp.Comet");
        assert_eq!(
            notification.payload["aps"]["alert"]["title"],
            "Keyboard deals"
        );
        assert_eq!(notification.payload["type"], "subreddit_watcher");
        assert_eq!(notification.payload["aps"]["thread-id"], "t3_a");
    }

    #[test]
    fn unlabelled_watcher_gets_a_default_title() {
        let notification =
            build_notification(&post("t3_a", 10), &watcher(""), "trending_post", "com.cometapp.Comet");
        assert_eq!(
            notification.payload["aps"]["alert"]["title"],
            "Trending in r/r"
        );
    }

    #[tokio::test]
    async fn matching_watcher_fires_once_per_post() {
        let watcher_repo = MemoryWatcherRepo::default();
        let device_repo = MemoryDeviceRepo::default();
        let pusher = MemoryPusher::sending();
        let now = Utc::now();

        // The same post delivered twice in one batch fires once.
        let posts = vec![post("t3_a", 10), post("t3_a", 10)];
        let watchers = vec![watcher("")];

        let sent = fan_out(
            &watcher_repo,
            &device_repo,
            &pusher,
            "com.cometapp.Comet",
            "subreddit_watcher",
            &watchers,
            &posts,
            now,
        )
        .await
        .unwrap();

        assert_eq!(sent, 1);
        assert_eq!(pusher.count(), 1);
        assert_eq!(watcher_repo.hits.lock().unwrap().as_slice(), &[1]);
    }

    #[tokio::test]
    async fn non_matching_posts_do_not_fire() {
        let watcher_repo = MemoryWatcherRepo::default();
        let device_repo = MemoryDeviceRepo::default();
        let pusher = MemoryPusher::sending();

        // Below the upvote threshold.
        let posts = vec![post("t3_low", 1)];
        let watchers = vec![watcher("")];

        let sent = fan_out(
            &watcher_repo,
            &device_repo,
            &pusher,
            "com.cometapp.Comet",
            "subreddit_watcher",
            &watchers,
            &posts,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(sent, 0);
        assert_eq!(pusher.count(), 0);
        assert!(watcher_repo.hits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_deletes_the_device_and_stops_pushing_to_it() {
        let watcher_repo = MemoryWatcherRepo::default();
        let device_repo = MemoryDeviceRepo::default();
        let pusher = MemoryPusher::failing_permanently("Unregistered");

        let posts = vec![post("t3_a", 10), post("t3_b", 12)];
        let watchers = vec![watcher("")];

        let sent = fan_out(
            &watcher_repo,
            &device_repo,
            &pusher,
            "com.cometapp.Comet",
            "subreddit_watcher",
            &watchers,
            &posts,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(sent, 0);
        // One push, then the dead device is skipped for the second post.
        assert_eq!(pusher.count(), 1);
        assert_eq!(device_repo.deleted.lock().unwrap().as_slice(), &[5]);
    }
}
