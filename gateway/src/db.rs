use crate::errors::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Opens the pool and brings the schema up to date.
pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    info!("Connecting to database...");
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // writers queue on the database lock instead of failing immediately
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Whether a failed statement is worth retrying as a whole transaction.
pub fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            // SQLite reports extended result codes
            db_err.code().is_some_and(|code| {
                code == "5" ||   // SQLITE_BUSY
                code == "6" ||   // SQLITE_LOCKED
                code == "261" || // SQLITE_BUSY_RECOVERY
                code == "262" || // SQLITE_LOCKED_SHAREDCACHE
                code == "517" || // SQLITE_BUSY_SNAPSHOT
                code == "773" // SQLITE_BUSY_TIMEOUT
            })
        }
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_make_pool_runs_migrations() {
        let (_dir, pool) = test_support::temp_pool().await;

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(tables, vec!["devices", "nonces", "telemetry"]);
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
        assert!(!is_transient_error(&sqlx::Error::PoolClosed));
    }
}
