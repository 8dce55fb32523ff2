//! Append-only telemetry table.

use crate::errors::Result;
use crate::model::TelemetrySample;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

// 5 bound values per row keeps each statement well under SQLite's variable limit
const MAX_ROWS_PER_STATEMENT: usize = 1000;

/// Inserts every sample. Atomicity across chunks is the caller's
/// transaction; returns the number of rows written.
pub async fn insert_batch(conn: &mut SqliteConnection, batch: &[TelemetrySample]) -> Result<u64> {
    let mut inserted = 0;

    for chunk in batch.chunks(MAX_ROWS_PER_STATEMENT) {
        let mut query = QueryBuilder::<Sqlite>::new(
            "INSERT INTO telemetry (device_id, ts, current_mA, power_dW, temp_cC) ",
        );
        query.push_values(chunk, |mut row, sample| {
            row.push_bind(sample.device_id.as_str())
                .push_bind(sample.ts)
                .push_bind(sample.current_ma)
                .push_bind(sample.power_dw)
                .push_bind(sample.temp_cc);
        });

        inserted += query.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(inserted)
}

/// Samples for one device, oldest first.
pub async fn samples_for_device(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<Vec<TelemetrySample>> {
    let samples = sqlx::query_as::<_, TelemetrySample>(
        "SELECT device_id, ts, current_mA, power_dW, temp_cC FROM telemetry \
         WHERE device_id = ? ORDER BY ts, rowid",
    )
    .bind(device_id)
    .fetch_all(conn)
    .await?;

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;

    fn sample(ts: i64) -> TelemetrySample {
        TelemetrySample {
            device_id: "dev1".to_string(),
            ts,
            current_ma: 500,
            power_dw: 10,
            temp_cc: -250,
        }
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let (_dir, pool) = temp_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let written = insert_batch(&mut conn, &[sample(200), sample(100)]).await.unwrap();
        assert_eq!(written, 2);

        let stored = samples_for_device(&mut conn, "dev1").await.unwrap();
        assert_eq!(stored, vec![sample(100), sample(200)]);
        assert!(samples_for_device(&mut conn, "dev2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (_dir, pool) = temp_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        assert_eq!(insert_batch(&mut conn, &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_large_batch_spans_statements() {
        let (_dir, pool) = temp_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let batch: Vec<_> = (1..=2_500).map(sample).collect();
        assert_eq!(insert_batch(&mut conn, &batch).await.unwrap(), 2_500);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let (_dir, pool) = temp_pool().await;
        sqlx::query(
            "CREATE TRIGGER reject_ts BEFORE INSERT ON telemetry WHEN NEW.ts = 1500 \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        // the failing row sits in the second statement
        let batch: Vec<_> = (1..=2_000).map(sample).collect();
        let mut tx = pool.begin().await.unwrap();
        assert!(insert_batch(&mut tx, &batch).await.is_err());
        tx.rollback().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert!(samples_for_device(&mut conn, "dev1").await.unwrap().is_empty());
    }
}
