//! Account-inbox worker
//!
//! Diffs the account's inbox against its high-water marker, classifies
//! each new message, applies the per-pair notifiability policy and pushes
//! one alert per (message, device).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{observe_queue_age, truncate_body, Consumer};
use crate::apns::{alert_payload, Notification, PushOutcome, PushType, Pusher};
use crate::error::{AppError, Result};
use crate::lock::{lock_key, Locker};
use crate::metrics::{NOTIFICATIONS_FAILED_TOTAL, NOTIFICATIONS_SENT_TOTAL};
use crate::queue::{Delivery, NOTIFICATIONS};
use crate::reddit::{self, Message};
use crate::store::{Account, AccountRepository, Device, DeviceRepository};

/// Runaway guard on cursor pagination within one tick.
const MAX_INBOX_PAGES: usize = 10;

const MAX_BODY_LEN: usize = 2000;

/// Message kinds the client routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    CommentReply,
    PostReply,
    UsernameMention,
    PrivateMessage,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommentReply => "comment_reply",
            Self::PostReply => "post_reply",
            Self::UsernameMention => "username_mention",
            Self::PrivateMessage => "private_message",
        }
    }
}

/// Classify an inbox item by upstream-supplied kind and subject.
///
/// Returns `None` for comment-shaped items with an unrecognized subject;
/// those are moderation artifacts the client has no route for.
pub fn classify_message(message: &Message) -> Option<MessageKind> {
    if message.kind == "t4" {
        return Some(MessageKind::PrivateMessage);
    }
    if message.kind != "t1" {
        return None;
    }
    match message.subject.as_str() {
        "comment reply" => Some(MessageKind::CommentReply),
        "post reply" => Some(MessageKind::PostReply),
        "username mention" => Some(MessageKind::UsernameMention),
        _ => None,
    }
}

/// Thread identifier passed through for client-side coalescing.
///
/// Prefers the post fullname from `parent_id`, then the permalink context,
/// then the message's own name.
pub fn thread_id(message: &Message) -> String {
    if message.parent_id.starts_with("t3_") {
        return message.parent_id.clone();
    }
    if let Some(post_id) = post_id_from_context(&message.context) {
        return post_id;
    }
    message.name.clone()
}

fn post_id_from_context(context: &str) -> Option<String> {
    // Context looks like /r/<sub>/comments/<id>/<slug>/<comment>/
    let mut segments = context.split('/').filter(|s| !s.is_empty());
    loop {
        match segments.next() {
            Some("comments") => {
                return segments.next().map(|id| format!("t3_{}", id));
            }
            Some(_) => continue,
            None => return None,
        }
    }
}

fn alert_for(message: &Message, kind: MessageKind) -> (String, String) {
    let title = match kind {
        MessageKind::CommentReply => {
            format!("{} in {}", message.author, message.link_title)
        }
        MessageKind::PostReply => {
            format!("{} to {}", message.author, message.link_title)
        }
        MessageKind::UsernameMention => {
            if message.subreddit.is_empty() {
                format!("{} mentioned you", message.author)
            } else {
                format!("{} mentioned you in r/{}", message.author, message.subreddit)
            }
        }
        MessageKind::PrivateMessage => {
            format!("{}: {}", message.author, message.subject)
        }
    };
    (title, truncate_body(&message.body, MAX_BODY_LEN))
}

/// Build the alert pushed to one device for one inbox message.
pub fn build_notification(
    message: &Message,
    kind: MessageKind,
    account: &Account,
    device: &Device,
    bundle_id: &str,
) -> Notification {
    let (title, body) = alert_for(message, kind);
    let payload = alert_payload(
        &title,
        &body,
        &thread_id(message),
        &[
            ("account_id", serde_json::json!(account.reddit_account_id)),
            ("author", serde_json::json!(message.author)),
            ("destination", serde_json::json!(message.destination)),
            ("message_id", serde_json::json!(message.name)),
            ("subreddit", serde_json::json!(message.subreddit)),
            ("type", serde_json::json!(kind.as_str())),
        ],
    );

    Notification {
        device_token: device.apns_token.clone(),
        topic: bundle_id.to_string(),
        push_type: PushType::Alert,
        payload,
    }
}

pub struct NotificationsConsumer {
    account_repo: Arc<dyn AccountRepository>,
    device_repo: Arc<dyn DeviceRepository>,
    locks: Arc<dyn Locker>,
    reddit: Arc<reddit::Client>,
    apns: Arc<dyn Pusher>,
    bundle_id: String,
}

impl NotificationsConsumer {
    pub fn new(
        account_repo: Arc<dyn AccountRepository>,
        device_repo: Arc<dyn DeviceRepository>,
        locks: Arc<dyn Locker>,
        reddit: Arc<reddit::Client>,
        apns: Arc<dyn Pusher>,
        bundle_id: String,
    ) -> Self {
        Self {
            account_repo,
            device_repo,
            locks,
            reddit,
            apns,
            bundle_id,
        }
    }

    async fn process(&self, account_id: i64) -> Result<()> {
        let now = Utc::now();
        let mut account = match self.account_repo.get_by_id(account_id).await {
            Ok(account) => account,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut handle = self.reddit.new_authenticated(
            &account.reddit_account_id,
            &account.refresh_token,
            &account.access_token,
        );

        if account.needs_refresh(now) {
            tracing::debug!(
                account_id,
                access_token = %handle.obfuscated_access_token(),
                "Refreshing upstream tokens"
            );
            match handle.refresh_tokens().await {
                Ok(tokens) => {
                    let expires_at = now
                        + chrono::Duration::from_std(tokens.expiry).unwrap_or_else(|_| chrono::Duration::zero());
                    self.account_repo
                        .update_tokens(
                            account_id,
                            &tokens.access_token,
                            &tokens.refresh_token,
                            expires_at,
                        )
                        .await?;
                    account.access_token = tokens.access_token;
                    account.refresh_token = tokens.refresh_token;
                    handle = self.reddit.new_authenticated(
                        &account.reddit_account_id,
                        &account.refresh_token,
                        &account.access_token,
                    );
                }
                Err(reddit::Error::OauthRevoked) => {
                    tracing::info!(account_id, "Upstream grant revoked, deleting account");
                    self.account_repo.delete(account_id).await?;
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(account_id, error = %err, "Token refresh failed");
                    return Ok(());
                }
            }
        }

        // First check initializes the marker without notifying.
        if account.last_message_id.is_empty() {
            let page = match handle.inbox(None).await {
                Ok(page) => page,
                Err(err) => return self.handle_fetch_error(account_id, err).await,
            };
            if let Some(newest) = page.first() {
                self.account_repo
                    .update_last_message(account_id, &newest.name, now)
                    .await?;
            } else {
                self.account_repo
                    .update_last_checked(account_id, now)
                    .await?;
            }
            return Ok(());
        }

        // Page with the before cursor until exhausted.
        let mut messages: Vec<Message> = Vec::new();
        let mut cursor = account.last_message_id.clone();
        for _ in 0..MAX_INBOX_PAGES {
            let page = match handle.inbox(Some(&cursor)).await {
                Ok(page) => page,
                Err(err) => return self.handle_fetch_error(account_id, err).await,
            };
            if page.is_empty() {
                break;
            }
            // Newest-first within a page; the page's newest becomes the
            // next cursor.
            cursor = page[0].name.clone();
            messages.extend(page);
        }

        if messages.is_empty() {
            self.account_repo
                .update_last_checked(account_id, now)
                .await?;
            return Ok(());
        }

        let newest = messages
            .iter()
            .max_by_key(|message| message.created_at)
            .map(|message| message.name.clone())
            .unwrap_or_else(|| cursor.clone());

        // Advance the marker before dispatch so a crash cannot replay
        // already-delivered messages.
        self.account_repo
            .update_last_message(account_id, &newest, now)
            .await?;

        let devices = self
            .device_repo
            .get_inbox_notifiable_by_account_id(account_id)
            .await?;
        if devices.is_empty() {
            return Ok(());
        }

        // Deliver in chronological order.
        messages.sort_by_key(|message| message.created_at);

        for message in &messages {
            let Some(kind) = classify_message(message) else {
                tracing::debug!(
                    account_id,
                    message_id = %message.name,
                    subject = %message.subject,
                    "Skipping unroutable inbox item"
                );
                continue;
            };

            for device in &devices {
                let notification =
                    build_notification(message, kind, &account, device, &self.bundle_id);
                match self.apns.push(&notification, device.sandbox).await {
                    PushOutcome::Sent => {
                        NOTIFICATIONS_SENT_TOTAL
                            .with_label_values(&[kind.as_str()])
                            .inc();
                    }
                    PushOutcome::Permanent(reason) => {
                        NOTIFICATIONS_FAILED_TOTAL
                            .with_label_values(&[kind.as_str(), "true"])
                            .inc();
                        tracing::info!(
                            account_id,
                            device_id = device.id,
                            reason,
                            "Permanent delivery failure, deleting device"
                        );
                        self.device_repo.delete(device.id).await?;
                    }
                    PushOutcome::Retriable(reason) => {
                        NOTIFICATIONS_FAILED_TOTAL
                            .with_label_values(&[kind.as_str(), "false"])
                            .inc();
                        tracing::warn!(
                            account_id,
                            device_id = device.id,
                            reason,
                            "Transient delivery failure"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Fetch-error policy: rate limits and transport errors skip the tick
    /// without touching the high-water marker.
    async fn handle_fetch_error(&self, account_id: i64, err: reddit::Error) -> Result<()> {
        match err {
            reddit::Error::OauthRevoked => {
                tracing::info!(account_id, "Upstream grant revoked, deleting account");
                self.account_repo.delete(account_id).await?;
                Ok(())
            }
            reddit::Error::RateLimited => {
                tracing::debug!(account_id, "Upstream rate limited, skipping tick");
                Ok(())
            }
            err => {
                tracing::warn!(account_id, error = %err, "Inbox fetch failed");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Consumer for NotificationsConsumer {
    fn queue(&self) -> &'static str {
        NOTIFICATIONS
    }

    fn locks(&self) -> &dyn Locker {
        self.locks.as_ref()
    }

    async fn consume(&self, delivery: &Delivery) {
        let key = lock_key(NOTIFICATIONS, &delivery.payload);
        observe_queue_age(self.locks.as_ref(), NOTIFICATIONS, &key).await;

        let result = match delivery.payload.parse::<i64>() {
            Ok(account_id) => self.process(account_id).await,
            Err(_) => Err(AppError::Validation(format!(
                "malformed account id payload {:?}",
                delivery.payload
            ))),
        };

        if let Err(error) = result {
            tracing::error!(
                %error,
                payload = %delivery.payload,
                "Inbox check failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(kind: &str, subject: &str) -> Message {
        Message {
            id: "abc".to_string(),
            name: "t1_abc".to_string(),
            kind: kind.to_string(),
            subject: subject.to_string(),
            author: "alice".to_string(),
            body: "nice post".to_string(),
            subreddit: "rust".to_string(),
            context: "/r/rust/comments/xyz/a_post/abc/".to_string(),
            parent_id: "t3_xyz".to_string(),
            link_title: "A post".to_string(),
            destination: "bob".to_string(),
            created_at: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn classify_by_kind_and_subject() {
        assert_eq!(
            classify_message(&message("t1", "comment reply")),
            Some(MessageKind::CommentReply)
        );
        assert_eq!(
            classify_message(&message("t1", "post reply")),
            Some(MessageKind::PostReply)
        );
        assert_eq!(
            classify_message(&message("t1", "username mention")),
            Some(MessageKind::UsernameMention)
        );
        assert_eq!(
            classify_message(&message("t4", "hello there")),
            Some(MessageKind::PrivateMessage)
        );
        assert_eq!(classify_message(&message("t1", "mod removal")), None);
    }

    #[test]
    fn thread_id_prefers_post_parent() {
        assert_eq!(thread_id(&message("t1", "comment reply")), "t3_xyz");
    }

    #[test]
    fn thread_id_falls_back_to_context() {
        let mut msg = message("t1", "comment reply");
        msg.parent_id = "t1_parent".to_string();
        assert_eq!(thread_id(&msg), "t3_xyz");
    }

    #[test]
    fn thread_id_falls_back_to_name() {
        let mut msg = message("t4", "hello");
        msg.parent_id = String::new();
        msg.context = String::new();
        assert_eq!(thread_id(&msg), "t1_abc");
    }

    #[test]
    fn alert_templates_per_kind() {
        let msg = message("t1", "comment reply");
        let (title, body) = alert_for(&msg, MessageKind::CommentReply);
        assert_eq!(title, "alice in A post");
        assert_eq!(body, "nice post");

        let (title, _) = alert_for(&msg, MessageKind::UsernameMention);
        assert_eq!(title, "alice mentioned you in r/rust");

        let pm = message("t4", "question");
        let (title, _) = alert_for(&pm, MessageKind::PrivateMessage);
        assert_eq!(title, "alice: question");
    }

    #[test]
    fn notification_carries_routing_keys() {
        let msg = message("t1", "comment reply");
        let account = Account {
            id: 1,
            reddit_account_id: "abcde".to_string(),
            username: "bob".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            token_expires_at: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
            last_message_id: String::new(),
            last_checked_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            last_unstuck_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        };
        let device = Device {
            id: 7,
            apns_token: "devicetoken".to_string(),
            sandbox: true,
            expires_at: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
            grace_period_expires_at: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
        };

        let notification = build_notification(
            &msg,
            MessageKind::CommentReply,
            &account,
            &device,
            "com.cometapp.Comet",
        );

        assert_eq!(notification.device_token, "devicetoken");
        assert_eq!(notification.topic, "com.cometapp.Comet");
        assert_eq!(notification.push_type, PushType::Alert);
        assert_eq!(notification.payload["type"], "comment_reply");
        assert_eq!(notification.payload["message_id"], "t1_abc");
        assert_eq!(notification.payload["aps"]["thread-id"], "t3_xyz");
    }
}
