//! Postgres live-activity repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::LiveActivity;
use super::{required, LiveActivityRepository};
use crate::error::Result;

pub struct PostgresLiveActivityRepository {
    pool: PgPool,
}

impl PostgresLiveActivityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LiveActivityRepository for PostgresLiveActivityRepository {
    async fn get(&self, apns_token: &str) -> Result<LiveActivity> {
        let activity = sqlx::query_as::<_, LiveActivity>(
            r#"
            SELECT id, apns_token, reddit_account_id, access_token, refresh_token,
                token_expires_at, subreddit, thread_id, development, expires_at
            FROM live_activities
            WHERE apns_token = $1"#,
        )
        .bind(apns_token)
        .fetch_optional(&self.pool)
        .await?;

        required(activity)
    }

    async fn list_tokens(&self) -> Result<Vec<String>> {
        let tokens = sqlx::query_scalar::<_, String>(
            "SELECT apns_token FROM live_activities",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }

    async fn update_tokens(
        &self,
        apns_token: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE live_activities
            SET access_token = $2, refresh_token = $3, token_expires_at = $4
            WHERE apns_token = $1"#,
        )
        .bind(apns_token)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, apns_token: &str) -> Result<()> {
        sqlx::query("DELETE FROM live_activities WHERE apns_token = $1")
            .bind(apns_token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
