//! Postgres subreddit repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::{Subreddit, WatcherType};
use super::{required, SubredditRepository};
use crate::error::Result;

pub struct PostgresSubredditRepository {
    pool: PgPool,
}

impl PostgresSubredditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubredditRepository for PostgresSubredditRepository {
    async fn get_by_id(&self, id: i64) -> Result<Subreddit> {
        let subreddit = sqlx::query_as::<_, Subreddit>(
            r#"
            SELECT id, subreddit_id, name, last_checked_at
            FROM subreddits
            WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        required(subreddit)
    }

    async fn get_due(&self, checked_before: DateTime<Utc>) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT DISTINCT subreddits.id
            FROM subreddits
            INNER JOIN watchers ON watchers.watchee_id = subreddits.id
            WHERE watchers.type = $1 AND subreddits.last_checked_at < $2"#,
        )
        .bind(WatcherType::Subreddit.as_i16())
        .bind(checked_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn get_trending(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT DISTINCT subreddits.id
            FROM subreddits
            INNER JOIN watchers ON watchers.watchee_id = subreddits.id
            WHERE watchers.type = $1"#,
        )
        .bind(WatcherType::Trending.as_i16())
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn update_last_checked(&self, id: i64, checked_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE subreddits SET last_checked_at = $2 WHERE id = $1")
            .bind(id)
            .bind(checked_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
