//! Entity store
//!
//! Repository traits plus their Postgres implementations. Reads return
//! [`AppError::NotFound`] for expected absence; writes are atomic
//! single-row updates and rely on the lock discipline, not the store, for
//! cross-worker serialization.

pub mod models;

mod account;
mod device;
mod live_activity;
mod subreddit;
mod user;
mod watcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
pub use account::PostgresAccountRepository;
pub use device::PostgresDeviceRepository;
pub use live_activity::PostgresLiveActivityRepository;
pub use models::*;
pub use subreddit::PostgresSubredditRepository;
pub use user::PostgresUserRepository;
pub use watcher::PostgresWatcherRepository;

/// Devices keyed by APNs push token.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Device>;

    /// Devices notified for an account's inbox: associations with
    /// `inbox_notifiable` set and `global_mute` clear.
    async fn get_inbox_notifiable_by_account_id(&self, account_id: i64) -> Result<Vec<Device>>;

    async fn delete(&self, id: i64) -> Result<()>;

    /// Delete devices whose grace period elapsed before `before`.
    async fn prune_stale(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Upstream accounts and their device associations.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Account>;

    /// Ids of accounts due for an inbox check: `last_checked_at` older
    /// than the cadence, at least one notifiable association, and at
    /// least one associated device still within its grace period.
    async fn get_due(&self, checked_before: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<Vec<i64>>;

    /// Ids of accounts due for a stuck-marker verification.
    async fn get_stuck_due(&self, unstuck_before: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<Vec<i64>>;

    async fn update_tokens(
        &self,
        id: i64,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Advance the inbox high-water marker and stamp the check time.
    async fn update_last_message(
        &self,
        id: i64,
        last_message_id: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn update_last_checked(&self, id: i64, checked_at: DateTime<Utc>) -> Result<()>;

    /// Stamp a stuck-check, optionally rewinding the high-water marker.
    async fn update_last_unstuck(
        &self,
        id: i64,
        unstuck_at: DateTime<Utc>,
        rewound_message_id: Option<&str>,
    ) -> Result<()>;

    async fn delete(&self, id: i64) -> Result<()>;

    /// Remove one device-account association. Deletes the account when
    /// that was its last device.
    async fn disassociate(&self, account_id: i64, device_id: i64) -> Result<()>;

    /// Delete accounts whose every association points at a device that is
    /// out of grace as of `before`.
    async fn prune_stale(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Watched subreddits.
#[async_trait]
pub trait SubredditRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Subreddit>;

    /// Ids of subreddits with at least one subreddit watcher whose scan
    /// is older than the cadence.
    async fn get_due(&self, checked_before: DateTime<Utc>) -> Result<Vec<i64>>;

    /// Ids of subreddits referenced by at least one trending watcher.
    async fn get_trending(&self) -> Result<Vec<i64>>;

    async fn update_last_checked(&self, id: i64, checked_at: DateTime<Utc>) -> Result<()>;
}

/// Watched users.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<User>;

    async fn get_due(&self, checked_before: DateTime<Utc>) -> Result<Vec<i64>>;

    async fn update_last_checked(&self, id: i64, checked_at: DateTime<Utc>) -> Result<()>;
}

/// Watcher match rules.
#[async_trait]
pub trait WatcherRepository: Send + Sync {
    /// Watchers of `watcher_type` observing `watchee_id` whose
    /// device-account pair has `watcher_notifiable` set and `global_mute`
    /// clear.
    async fn get_by_type_and_watchee_id(
        &self,
        watcher_type: WatcherType,
        watchee_id: i64,
    ) -> Result<Vec<Watcher>>;

    /// Record a hit: `hits + 1` and `last_notified_at` in one update.
    async fn increment_hits(&self, id: i64, notified_at: DateTime<Utc>) -> Result<()>;
}

/// Live activities keyed by their APNs live-activity token.
#[async_trait]
pub trait LiveActivityRepository: Send + Sync {
    async fn get(&self, apns_token: &str) -> Result<LiveActivity>;

    /// All tracked live-activity tokens; the enqueuer publishes every one
    /// each cadence tick, lock-deduplicated.
    async fn list_tokens(&self) -> Result<Vec<String>>;

    async fn update_tokens(
        &self,
        apns_token: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete(&self, apns_token: &str) -> Result<()>;
}

/// Map an optional row onto the not-found sentinel.
pub(crate) fn required<T>(row: Option<T>) -> Result<T> {
    row.ok_or(crate::error::AppError::NotFound)
}
