//! Postgres user repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::{User, WatcherType};
use super::{required, UserRepository};
use crate::error::Result;

pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn get_by_id(&self, id: i64) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, user_id, name, last_checked_at
            FROM users
            WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        required(user)
    }

    async fn get_due(&self, checked_before: DateTime<Utc>) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT DISTINCT users.id
            FROM users
            INNER JOIN watchers ON watchers.watchee_id = users.id
            WHERE watchers.type = $1 AND users.last_checked_at < $2"#,
        )
        .bind(WatcherType::User.as_i16())
        .bind(checked_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn update_last_checked(&self, id: i64, checked_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_checked_at = $2 WHERE id = $1")
            .bind(id)
            .bind(checked_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
