//! Live-activities worker
//!
//! Computes a rolling content state from the tracked thread's top-level
//! comments and pushes `update` events until the activity expires, then
//! exactly one `end` event before deleting it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{observe_queue_age, Consumer};
use crate::apns::{
    live_activity_payload, DynamicIslandNotification, Notification, PushOutcome, PushType, Pusher,
};
use crate::error::Result;
use crate::lock::{lock_key, Locker};
use crate::metrics::{NOTIFICATIONS_FAILED_TOTAL, NOTIFICATIONS_SENT_TOTAL};
use crate::queue::{Delivery, LIVE_ACTIVITIES};
use crate::reddit::{self, Comment, Thread};
use crate::store::models::LIVE_ACTIVITY_CHECK_INTERVAL;
use crate::store::{LiveActivity, LiveActivityRepository};

/// Push event for a live activity, decided by its expiry.
pub fn activity_event(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> &'static str {
    if expires_at <= now {
        "end"
    } else {
        "update"
    }
}

/// Select candidate comments with an escalating recency cutoff.
///
/// Tries cutoffs of 1x, 2x and 4x the check interval; the first tier that
/// yields at least one comment wins. Quiet threads therefore still
/// surface something rather than nothing.
pub fn select_candidates<'a>(
    comments: &'a [Comment],
    now: DateTime<Utc>,
    interval: Duration,
) -> Vec<&'a Comment> {
    let interval = chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
    for multiplier in [1, 2, 4] {
        let cutoff = now - interval * multiplier;
        let candidates: Vec<&Comment> = comments
            .iter()
            .filter(|comment| comment.created_at > cutoff)
            .collect();
        if !candidates.is_empty() {
            return candidates;
        }
    }
    Vec::new()
}

/// Build the content state: post tallies plus the highest-scoring
/// candidate comment, when there is one.
pub fn build_content_state(
    thread: &Thread,
    candidates: &[&Comment],
) -> DynamicIslandNotification {
    let mut state = DynamicIslandNotification {
        post_total_comments: thread.post.num_comments,
        post_score: thread.post.score,
        ..Default::default()
    };

    if let Some(best) = candidates.iter().max_by_key(|comment| comment.score) {
        state.comment_id = best.id.clone();
        state.comment_author = best.author.clone();
        state.comment_body = best.body.clone();
        state.comment_age = best.created_at.timestamp();
        state.comment_score = best.score;
    }

    state
}

pub struct LiveActivitiesConsumer {
    live_activity_repo: Arc<dyn LiveActivityRepository>,
    locks: Arc<dyn Locker>,
    reddit: Arc<reddit::Client>,
    apns: Arc<dyn Pusher>,
    bundle_id: String,
}

impl LiveActivitiesConsumer {
    pub fn new(
        live_activity_repo: Arc<dyn LiveActivityRepository>,
        locks: Arc<dyn Locker>,
        reddit: Arc<reddit::Client>,
        apns: Arc<dyn Pusher>,
        bundle_id: String,
    ) -> Self {
        Self {
            live_activity_repo,
            locks,
            reddit,
            apns,
            bundle_id,
        }
    }

    fn live_activity_topic(&self) -> String {
        format!("{}.push-type.liveactivity", self.bundle_id)
    }

    async fn process(&self, apns_token: &str) -> Result<()> {
        let now = Utc::now();
        let mut activity = match self.live_activity_repo.get(apns_token).await {
            Ok(activity) => activity,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut handle = self.reddit.new_authenticated(
            &activity.reddit_account_id,
            &activity.refresh_token,
            &activity.access_token,
        );

        if activity.needs_refresh(now) {
            tracing::debug!(
                apns_token,
                access_token = %handle.obfuscated_access_token(),
                "Refreshing upstream tokens"
            );
            match handle.refresh_tokens().await {
                Ok(tokens) => {
                    let expires_at =
                        now + chrono::Duration::from_std(tokens.expiry).unwrap_or_else(|_| chrono::Duration::zero());
                    self.live_activity_repo
                        .update_tokens(
                            apns_token,
                            &tokens.access_token,
                            &tokens.refresh_token,
                            expires_at,
                        )
                        .await?;
                    activity.access_token = tokens.access_token;
                    activity.refresh_token = tokens.refresh_token;
                    handle = self.reddit.new_authenticated(
                        &activity.reddit_account_id,
                        &activity.refresh_token,
                        &activity.access_token,
                    );
                }
                Err(reddit::Error::OauthRevoked) => {
                    tracing::info!(apns_token, "Upstream grant revoked, deleting live activity");
                    self.live_activity_repo.delete(apns_token).await?;
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(apns_token, error = %err, "Token refresh failed");
                    return Ok(());
                }
            }
        }

        let thread = match handle
            .top_level_comments(&activity.subreddit, &activity.thread_id)
            .await
        {
            Ok(thread) => thread,
            Err(reddit::Error::OauthRevoked) => {
                tracing::info!(apns_token, "Upstream grant revoked, deleting live activity");
                self.live_activity_repo.delete(apns_token).await?;
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(apns_token, error = %err, "Comment fetch failed");
                return Ok(());
            }
        };

        let expired = activity.expires_at <= now;

        if thread.comments.is_empty() && !expired {
            tracing::debug!(apns_token, "No comments yet");
            return Ok(());
        }

        let candidates = select_candidates(&thread.comments, now, LIVE_ACTIVITY_CHECK_INTERVAL);
        if candidates.is_empty() && !expired {
            tracing::debug!(apns_token, "No new comments");
            return Ok(());
        }

        let event = activity_event(activity.expires_at, now);
        let state = build_content_state(&thread, &candidates);
        let payload = live_activity_payload(
            &state,
            event,
            activity.expires_at.timestamp(),
            now.timestamp(),
        );
        let notification = Notification {
            device_token: activity.apns_token.clone(),
            topic: self.live_activity_topic(),
            push_type: PushType::LiveActivity,
            payload,
        };

        match self.apns.push(&notification, activity.development).await {
            PushOutcome::Sent => {
                NOTIFICATIONS_SENT_TOTAL
                    .with_label_values(&["live_activity"])
                    .inc();
            }
            PushOutcome::Permanent(reason) => {
                NOTIFICATIONS_FAILED_TOTAL
                    .with_label_values(&["live_activity", "true"])
                    .inc();
                tracing::info!(
                    apns_token,
                    reason,
                    "Permanent delivery failure, deleting live activity"
                );
                self.live_activity_repo.delete(apns_token).await?;
                return Ok(());
            }
            PushOutcome::Retriable(reason) => {
                NOTIFICATIONS_FAILED_TOTAL
                    .with_label_values(&["live_activity", "false"])
                    .inc();
                tracing::warn!(apns_token, reason, "Transient delivery failure");
            }
        }

        // Terminal emission: one end event, then the activity is gone.
        if expired {
            tracing::debug!(apns_token, "Live activity expired, deleting");
            self.live_activity_repo.delete(apns_token).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Consumer for LiveActivitiesConsumer {
    fn queue(&self) -> &'static str {
        LIVE_ACTIVITIES
    }

    fn locks(&self) -> &dyn Locker {
        self.locks.as_ref()
    }

    async fn consume(&self, delivery: &Delivery) {
        let key = lock_key(LIVE_ACTIVITIES, &delivery.payload);
        observe_queue_age(self.locks.as_ref(), LIVE_ACTIVITIES, &key).await;

        tracing::debug!(apns_token = %delivery.payload, "Starting live-activity job");

        if let Err(error) = self.process(&delivery.payload).await {
            tracing::error!(
                %error,
                apns_token = %delivery.payload,
                "Live-activity update failed"
            );
        }
    }
}

/// Expiry check helper for tests and the enqueuer.
pub fn is_expired(activity: &LiveActivity, now: DateTime<Utc>) -> bool {
    activity.expires_at <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reddit::Post;
    use chrono::TimeZone;

    fn comment(id: &str, score: i64, age_secs: i64, now: DateTime<Utc>) -> Comment {
        Comment {
            id: id.to_string(),
            author: format!("author_{}", id),
            body: format!("body {}", id),
            score,
            created_at: now - chrono::Duration::seconds(age_secs),
        }
    }

    fn thread(comments: Vec<Comment>) -> Thread {
        Thread {
            post: Post {
                id: "t3_game".to_string(),
                title: "Game thread".to_string(),
                author: "mod".to_string(),
                subreddit: "soccer".to_string(),
                body: String::new(),
                flair: String::new(),
                domain: "self.soccer".to_string(),
                score: 345,
                num_comments: 12,
                created_at: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap(),
                permalink: "/r/soccer/comments/game".to_string(),
            },
            comments,
        }
    }

    #[test]
    fn event_is_end_once_expired() {
        let now = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(activity_event(now - chrono::Duration::seconds(1), now), "end");
        assert_eq!(activity_event(now, now), "end");
        assert_eq!(
            activity_event(now + chrono::Duration::seconds(1), now),
            "update"
        );
    }

    #[test]
    fn first_cutoff_wins_when_fresh_comments_exist() {
        let now = Utc::now();
        let interval = Duration::from_secs(30);
        let comments = vec![
            comment("fresh", 3, 10, now),
            comment("stale", 50, 100, now),
        ];

        let candidates = select_candidates(&comments, now, interval);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "fresh");
    }

    #[test]
    fn cutoff_escalates_on_quiet_threads() {
        let now = Utc::now();
        let interval = Duration::from_secs(30);
        // Older than 1x and 2x, within 4x.
        let comments = vec![comment("older", 7, 90, now)];

        let candidates = select_candidates(&comments, now, interval);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "older");
    }

    #[test]
    fn no_candidates_beyond_last_cutoff() {
        let now = Utc::now();
        let interval = Duration::from_secs(30);
        let comments = vec![comment("ancient", 7, 1000, now)];

        assert!(select_candidates(&comments, now, interval).is_empty());
    }

    #[test]
    fn content_state_picks_highest_scoring_candidate() {
        let now = Utc::now();
        let comments = vec![
            comment("a", 3, 5, now),
            comment("b", 9, 8, now),
            comment("c", 1, 2, now),
        ];
        let thread = thread(comments);
        let candidates = select_candidates(&thread.comments, now, Duration::from_secs(30));

        let state = build_content_state(&thread, &candidates);
        assert_eq!(state.post_total_comments, 12);
        assert_eq!(state.post_score, 345);
        assert_eq!(state.comment_id, "b");
        assert_eq!(state.comment_score, 9);
        assert_eq!(state.comment_author, "author_b");
    }

    #[test]
    fn content_state_without_candidates_keeps_post_tallies() {
        let thread = thread(vec![]);
        let state = build_content_state(&thread, &[]);
        assert_eq!(state.post_total_comments, 12);
        assert!(state.comment_id.is_empty());
    }
}
