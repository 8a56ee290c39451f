//! Postgres watcher repository
//!
//! Watcher rows are fetched joined with their device, account and watchee
//! label so the workers can dispatch without further lookups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::models::{Watcher, WatcherAccount, WatcherDevice, WatcherType};
use super::WatcherRepository;
use crate::error::{AppError, Result};

pub struct PostgresWatcherRepository {
    pool: PgPool,
}

impl PostgresWatcherRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<Watcher> {
        let raw_type: i16 = row.try_get("type")?;
        let watcher_type = WatcherType::from_i16(raw_type).ok_or_else(|| {
            AppError::Validation(format!("unknown watcher type {}", raw_type))
        })?;

        let subreddit_label: String = row.try_get("subreddit_label")?;
        let user_label: String = row.try_get("user_label")?;
        let watchee_label = match watcher_type {
            WatcherType::Subreddit | WatcherType::Trending => subreddit_label,
            WatcherType::User => user_label,
        };

        Ok(Watcher {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            last_notified_at: row.try_get("last_notified_at")?,
            label: row.try_get("label")?,
            device_id: row.try_get("device_id")?,
            account_id: row.try_get("account_id")?,
            watcher_type,
            watchee_id: row.try_get("watchee_id")?,
            author: row.try_get("author")?,
            subreddit: row.try_get("subreddit")?,
            upvotes: row.try_get("upvotes")?,
            keyword: row.try_get("keyword")?,
            flair: row.try_get("flair")?,
            domain: row.try_get("domain")?,
            hits: row.try_get("hits")?,
            watchee_label,
            device: WatcherDevice {
                id: row.try_get("joined_device_id")?,
                apns_token: row.try_get("device_apns_token")?,
                sandbox: row.try_get("device_sandbox")?,
            },
            account: WatcherAccount {
                id: row.try_get("joined_account_id")?,
                reddit_account_id: row.try_get("account_reddit_id")?,
                access_token: row.try_get("account_access_token")?,
                refresh_token: row.try_get("account_refresh_token")?,
                token_expires_at: row.try_get("account_token_expires_at")?,
            },
        })
    }
}

#[async_trait]
impl WatcherRepository for PostgresWatcherRepository {
    async fn get_by_type_and_watchee_id(
        &self,
        watcher_type: WatcherType,
        watchee_id: i64,
    ) -> Result<Vec<Watcher>> {
        let rows = sqlx::query(
            r#"
            SELECT
                watchers.id,
                watchers.created_at,
                watchers.last_notified_at,
                watchers.label,
                watchers.device_id,
                watchers.account_id,
                watchers.type,
                watchers.watchee_id,
                watchers.author,
                watchers.subreddit,
                watchers.upvotes,
                watchers.keyword,
                watchers.flair,
                watchers.domain,
                watchers.hits,
                devices.id AS joined_device_id,
                devices.apns_token AS device_apns_token,
                devices.sandbox AS device_sandbox,
                accounts.id AS joined_account_id,
                accounts.reddit_account_id AS account_reddit_id,
                accounts.access_token AS account_access_token,
                accounts.refresh_token AS account_refresh_token,
                accounts.token_expires_at AS account_token_expires_at,
                COALESCE(subreddits.name, '') AS subreddit_label,
                COALESCE(users.name, '') AS user_label
            FROM watchers
            INNER JOIN devices ON watchers.device_id = devices.id
            INNER JOIN accounts ON watchers.account_id = accounts.id
            INNER JOIN devices_accounts
                ON devices.id = devices_accounts.device_id
                AND accounts.id = devices_accounts.account_id
            LEFT JOIN subreddits
                ON watchers.type IN (0, 2) AND watchers.watchee_id = subreddits.id
            LEFT JOIN users
                ON watchers.type = 1 AND watchers.watchee_id = users.id
            WHERE watchers.type = $1
                AND watchers.watchee_id = $2
                AND devices_accounts.watcher_notifiable = TRUE
                AND devices_accounts.global_mute = FALSE"#,
        )
        .bind(watcher_type.as_i16())
        .bind(watchee_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn increment_hits(&self, id: i64, notified_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE watchers SET hits = hits + 1, last_notified_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(notified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
