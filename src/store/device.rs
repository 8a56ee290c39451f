//! Postgres device repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::Device;
use super::{required, DeviceRepository};
use crate::error::Result;

pub struct PostgresDeviceRepository {
    pool: PgPool,
}

impl PostgresDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    async fn get_by_id(&self, id: i64) -> Result<Device> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT id, apns_token, sandbox, expires_at, grace_period_expires_at
            FROM devices
            WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        required(device)
    }

    async fn get_inbox_notifiable_by_account_id(&self, account_id: i64) -> Result<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            r#"
            SELECT devices.id, devices.apns_token, devices.sandbox,
                devices.expires_at, devices.grace_period_expires_at
            FROM devices
            INNER JOIN devices_accounts ON devices.id = devices_accounts.device_id
            WHERE devices_accounts.account_id = $1
                AND devices_accounts.inbox_notifiable = TRUE
                AND devices_accounts.global_mute = FALSE"#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_stale(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM devices WHERE grace_period_expires_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
