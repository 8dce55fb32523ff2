//! Replay protection.
//!
//! Every accepted `(device_id, nonce)` pair is recorded forever. Uniqueness
//! is enforced by the `nonces` table's UNIQUE constraint, so two concurrent
//! submissions of the same pair cannot both be accepted, whichever process
//! they run in.

use crate::errors::Result;
use sqlx::{Executor, Sqlite};

/// Records the pair and returns `true`, or returns `false` if it was
/// already recorded. A single conflict-detecting insert, never a
/// select followed by an insert.
pub async fn try_consume<'e, E>(executor: E, device_id: &str, nonce: &str, now: i64) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "INSERT INTO nonces (device_id, nonce, seen_at) VALUES (?, ?, ?) \
         ON CONFLICT (device_id, nonce) DO NOTHING",
    )
    .bind(device_id)
    .bind(nonce)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}
