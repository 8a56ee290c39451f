//! Data models
//!
//! Rust structs representing database entities, plus the polling cadence
//! constants shared by the enqueuer and the workers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reddit::Post;

// =============================================================================
// Polling cadence
// =============================================================================

/// How often an account becomes due for an inbox check.
pub const NOTIFICATION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on one delivery; also the per-item lock TTL.
pub const NOTIFICATION_CHECK_TIMEOUT: Duration = Duration::from_secs(300);

/// How often a subreddit with at least one watcher is scanned.
pub const SUBREDDIT_CHECK_INTERVAL: Duration = Duration::from_secs(150);

/// How often a watched user is scanned.
pub const USER_CHECK_INTERVAL: Duration = Duration::from_secs(150);

/// How often trending candidates are scanned. Deliberately long.
pub const TRENDING_CHECK_INTERVAL: Duration = Duration::from_secs(600);

/// How often an account's high-water marker is verified upstream.
pub const STUCK_NOTIFICATION_CHECK_INTERVAL: Duration = Duration::from_secs(120);

/// Live-activity update cadence. Not backed off.
pub const LIVE_ACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Tokens expiring within this window are refreshed before use.
pub const TOKEN_REFRESH_WINDOW: Duration = Duration::from_secs(300);

// =============================================================================
// Device
// =============================================================================

/// A registered device, identified by its APNs push token.
///
/// A device past `grace_period_expires_at` is never enqueued and is
/// eventually pruned together with accounts only it referenced.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    /// APNs device token (opaque hex string, unique)
    pub apns_token: String,
    /// Selects the APNs sandbox environment
    pub sandbox: bool,
    pub expires_at: DateTime<Utc>,
    pub grace_period_expires_at: DateTime<Utc>,
}

// =============================================================================
// Account
// =============================================================================

/// An upstream platform identity bound to zero or more devices.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    /// Upstream account id
    pub reddit_account_id: String,
    pub username: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    /// Upstream id of the newest processed inbox item; empty when unset
    pub last_message_id: String,
    pub last_checked_at: DateTime<Utc>,
    /// Last time the stuck-notifications worker verified the marker
    pub last_unstuck_at: DateTime<Utc>,
}

impl Account {
    /// True when the access token should be refreshed before use.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at
            <= now + chrono::Duration::from_std(TOKEN_REFRESH_WINDOW).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

// =============================================================================
// Watchee registries
// =============================================================================

/// A subreddit referenced by at least one watcher.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subreddit {
    pub id: i64,
    /// Upstream subreddit id (fullname without prefix)
    pub subreddit_id: String,
    pub name: String,
    pub last_checked_at: DateTime<Utc>,
}

/// A user referenced by at least one watcher.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    /// Upstream user id (fullname without prefix)
    pub user_id: String,
    pub name: String,
    pub last_checked_at: DateTime<Utc>,
}

// =============================================================================
// Watcher
// =============================================================================

/// Watcher discriminator. Stored as an integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum WatcherType {
    Subreddit = 0,
    User = 1,
    Trending = 2,
}

impl WatcherType {
    pub fn from_i16(raw: i16) -> Option<Self> {
        match raw {
            0 => Some(Self::Subreddit),
            1 => Some(Self::User),
            2 => Some(Self::Trending),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

/// A persistent match rule bound to one device and one account.
///
/// String filters are case-insensitive; an empty filter is a wildcard.
#[derive(Debug, Clone)]
pub struct Watcher {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub last_notified_at: DateTime<Utc>,
    pub label: String,
    pub device_id: i64,
    pub account_id: i64,
    pub watcher_type: WatcherType,
    pub watchee_id: i64,
    pub author: String,
    pub subreddit: String,
    pub upvotes: i64,
    pub keyword: String,
    pub flair: String,
    pub domain: String,
    pub hits: i64,
    /// Display name of the watchee (subreddit or user)
    pub watchee_label: String,
    /// Joined device fields needed for dispatch
    pub device: WatcherDevice,
    /// Joined account fields needed to poll on behalf of the watcher
    pub account: WatcherAccount,
}

/// Device columns joined into a watcher row.
#[derive(Debug, Clone)]
pub struct WatcherDevice {
    pub id: i64,
    pub apns_token: String,
    pub sandbox: bool,
}

/// Account columns joined into a watcher row.
#[derive(Debug, Clone)]
pub struct WatcherAccount {
    pub id: i64,
    pub reddit_account_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
}

impl WatcherAccount {
    /// True when the access token should be refreshed before use.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at
            <= now + chrono::Duration::from_std(TOKEN_REFRESH_WINDOW).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

impl Watcher {
    /// Validate the invariant that at least one discriminating filter is set.
    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        let has_filter = !self.author.is_empty()
            || !self.subreddit.is_empty()
            || !self.keyword.is_empty()
            || !self.flair.is_empty()
            || !self.domain.is_empty()
            || self.upvotes > 0;
        if !has_filter {
            return Err(crate::error::AppError::Validation(
                "watcher requires at least one non-empty filter".to_string(),
            ));
        }
        Ok(())
    }

    /// Evaluate the filter predicate against an observed post.
    ///
    /// Unsetting any field can only broaden matches: every string filter is
    /// a wildcard when empty, and the score/recency terms use the stored
    /// values directly.
    pub fn matches(&self, post: &Post) -> bool {
        if !self.author.is_empty() && !ci_eq(&post.author, &self.author) {
            return false;
        }
        if !self.subreddit.is_empty() && !ci_eq(&post.subreddit, &self.subreddit) {
            return false;
        }
        if !self.keyword.is_empty()
            && !ci_contains(&post.title, &self.keyword)
            && !ci_contains(&post.body, &self.keyword)
        {
            return false;
        }
        if !self.flair.is_empty() && !ci_eq(&post.flair, &self.flair) {
            return false;
        }
        if !self.domain.is_empty() && !ci_eq(&post.domain, &self.domain) {
            return false;
        }
        if post.score < self.upvotes {
            return false;
        }
        post.created_at > self.last_notified_at
    }
}

fn ci_eq(left: &str, right: &str) -> bool {
    left.eq_ignore_ascii_case(right)
}

fn ci_contains(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .to_lowercase()
        .contains(needle.to_lowercase().as_str())
}

// =============================================================================
// Live activity
// =============================================================================

/// A push-driven, short-lived UI surface keyed by its own APNs token.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LiveActivity {
    pub id: i64,
    /// APNs live-activity token (distinct from a push token)
    pub apns_token: String,
    pub reddit_account_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub subreddit: String,
    pub thread_id: String,
    /// Selects the APNs sandbox environment
    pub development: bool,
    pub expires_at: DateTime<Utc>,
}

impl LiveActivity {
    /// True when the access token should be refreshed before use.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at
            <= now + chrono::Duration::from_std(TOKEN_REFRESH_WINDOW).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_post() -> Post {
        Post {
            id: "t3_abc123".to_string(),
            title: "HELLO world".to_string(),
            author: "alice".to_string(),
            subreddit: "r".to_string(),
            body: String::new(),
            flair: String::new(),
            domain: "self.r".to_string(),
            score: 10,
            num_comments: 3,
            created_at: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap(),
            permalink: "/r/r/comments/abc123".to_string(),
        }
    }

    fn sample_watcher() -> Watcher {
        Watcher {
            id: 1,
            created_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            last_notified_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            label: "test".to_string(),
            device_id: 1,
            account_id: 1,
            watcher_type: WatcherType::Subreddit,
            watchee_id: 10,
            author: String::new(),
            subreddit: "r".to_string(),
            upvotes: 5,
            keyword: "hello".to_string(),
            flair: String::new(),
            domain: String::new(),
            hits: 0,
            watchee_label: "r".to_string(),
            device: WatcherDevice {
                id: 1,
                apns_token: "token".to_string(),
                sandbox: false,
            },
            account: WatcherAccount {
                id: 1,
                reddit_account_id: "acct".to_string(),
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                token_expires_at: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
            },
        }
    }

    #[test]
    fn matches_is_case_insensitive() {
        let watcher = sample_watcher();
        assert!(watcher.matches(&sample_post()));
    }

    #[test]
    fn matches_rejects_low_score() {
        let mut watcher = sample_watcher();
        watcher.upvotes = 20;
        assert!(!watcher.matches(&sample_post()));
    }

    #[test]
    fn matches_rejects_wrong_author() {
        let mut watcher = sample_watcher();
        watcher.author = "bob".to_string();
        assert!(!watcher.matches(&sample_post()));
    }

    #[test]
    fn matches_keyword_in_body() {
        let mut watcher = sample_watcher();
        watcher.keyword = "needle".to_string();
        let mut post = sample_post();
        post.body = "the NEEDLE is here".to_string();
        assert!(watcher.matches(&post));
    }

    #[test]
    fn matches_rejects_already_notified_posts() {
        let mut watcher = sample_watcher();
        watcher.last_notified_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(!watcher.matches(&sample_post()));
    }

    #[test]
    fn unsetting_a_filter_broadens_matches() {
        let post = sample_post();
        let strict = {
            let mut w = sample_watcher();
            w.author = "bob".to_string();
            w
        };
        assert!(!strict.matches(&post));

        let mut relaxed = strict.clone();
        relaxed.author = String::new();
        assert!(relaxed.matches(&post));
    }

    #[test]
    fn validate_requires_a_filter() {
        let mut watcher = sample_watcher();
        watcher.subreddit = String::new();
        watcher.keyword = String::new();
        watcher.upvotes = 0;
        assert!(watcher.validate().is_err());
    }

    #[test]
    fn watcher_type_roundtrip() {
        assert_eq!(WatcherType::from_i16(0), Some(WatcherType::Subreddit));
        assert_eq!(WatcherType::from_i16(1), Some(WatcherType::User));
        assert_eq!(WatcherType::from_i16(2), Some(WatcherType::Trending));
        assert_eq!(WatcherType::from_i16(3), None);
        assert_eq!(WatcherType::Trending.as_i16(), 2);
    }
}
