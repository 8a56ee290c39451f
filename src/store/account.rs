//! Postgres account repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::Account;
use super::{required, AccountRepository};
use crate::error::Result;

pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn get_by_id(&self, id: i64) -> Result<Account> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, reddit_account_id, username, access_token, refresh_token,
                token_expires_at, last_message_id, last_checked_at, last_unstuck_at
            FROM accounts
            WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        required(account)
    }

    async fn get_due(
        &self,
        checked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT DISTINCT accounts.id
            FROM accounts
            INNER JOIN devices_accounts ON devices_accounts.account_id = accounts.id
            INNER JOIN devices ON devices.id = devices_accounts.device_id
            WHERE accounts.last_checked_at < $1
                AND devices.grace_period_expires_at > $2
                AND (devices_accounts.inbox_notifiable = TRUE
                    OR devices_accounts.watcher_notifiable = TRUE)"#,
        )
        .bind(checked_before)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn get_stuck_due(
        &self,
        unstuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT DISTINCT accounts.id
            FROM accounts
            INNER JOIN devices_accounts ON devices_accounts.account_id = accounts.id
            INNER JOIN devices ON devices.id = devices_accounts.device_id
            WHERE accounts.last_unstuck_at < $1
                AND accounts.last_message_id <> ''
                AND devices.grace_period_expires_at > $2"#,
        )
        .bind(unstuck_before)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn update_tokens(
        &self,
        id: i64,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET access_token = $2, refresh_token = $3, token_expires_at = $4
            WHERE id = $1"#,
        )
        .bind(id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_last_message(
        &self,
        id: i64,
        last_message_id: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET last_message_id = $2, last_checked_at = $3
            WHERE id = $1"#,
        )
        .bind(id)
        .bind(last_message_id)
        .bind(checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_last_checked(&self, id: i64, checked_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_checked_at = $2 WHERE id = $1")
            .bind(id)
            .bind(checked_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_last_unstuck(
        &self,
        id: i64,
        unstuck_at: DateTime<Utc>,
        rewound_message_id: Option<&str>,
    ) -> Result<()> {
        match rewound_message_id {
            Some(message_id) => {
                sqlx::query(
                    r#"
                    UPDATE accounts
                    SET last_unstuck_at = $2, last_message_id = $3
                    WHERE id = $1"#,
                )
                .bind(id)
                .bind(unstuck_at)
                .bind(message_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("UPDATE accounts SET last_unstuck_at = $2 WHERE id = $1")
                    .bind(id)
                    .bind(unstuck_at)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disassociate(&self, account_id: i64, device_id: i64) -> Result<()> {
        sqlx::query(
            "DELETE FROM devices_accounts WHERE account_id = $1 AND device_id = $2",
        )
        .bind(account_id)
        .bind(device_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM accounts
            WHERE id = $1
                AND NOT EXISTS (
                    SELECT 1 FROM devices_accounts
                    WHERE devices_accounts.account_id = $1
                )"#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_stale(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM accounts
            WHERE NOT EXISTS (
                SELECT 1
                FROM devices_accounts
                INNER JOIN devices ON devices.id = devices_accounts.device_id
                WHERE devices_accounts.account_id = accounts.id
                    AND devices.grace_period_expires_at > $1
            )"#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
