//! Devices allowed to submit telemetry.

use crate::errors::Result;
use crate::model::Device;
use sqlx::{Executor, Sqlite};

/// Registers `device_id`. Registering a known device is a no-op.
pub async fn register<'e, E>(executor: E, device_id: &str, now: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO devices (id, created_at) VALUES (?, ?) ON CONFLICT (id) DO NOTHING")
        .bind(device_id)
        .bind(now)
        .execute(executor)
        .await?;

    Ok(())
}

pub async fn is_registered<'e, E>(executor: E, device_id: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM devices WHERE id = ? LIMIT 1")
        .bind(device_id)
        .fetch_optional(executor)
        .await?;

    Ok(found.is_some())
}

pub async fn find<'e, E>(executor: E, device_id: &str) -> Result<Option<Device>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let device = sqlx::query_as::<_, Device>("SELECT id, created_at FROM devices WHERE id = ?")
        .bind(device_id)
        .fetch_optional(executor)
        .await?;

    Ok(device)
}
