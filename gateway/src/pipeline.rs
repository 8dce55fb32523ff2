//! Authenticated ingestion.
//!
//! Each request runs linearly through decode, parse, authorize, replay
//! check and persist. Every stage either hands a typed value to the next
//! one or stops with a [`Rejection`]. The pipeline keeps no state of its
//! own; the database is the only thing shared between requests.

use crate::clock::Clock;
use crate::db::is_transient_error;
use crate::envelope::{EnvelopeCodec, EnvelopeError};
use crate::errors::Error;
use crate::metrics::{DB_FAILURES_TOTAL, RECORDS_SAVED_TOTAL, RECORDS_SKIPPED_TOTAL};
use crate::model::{DataRequest, RegisterRequest};
use crate::validate::{self, PayloadError};
use crate::{ledger, registry, store};
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 25;

/// Why a request was not accepted.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("empty request body")]
    Empty,

    #[error("envelope rejected: {0}")]
    BadEnvelope(EnvelopeError),

    #[error("plaintext is not a JSON object")]
    BadJson,

    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("device is not registered")]
    NotRegistered,

    #[error("nonce already used")]
    Replay,

    #[error("no such route")]
    NotFound,

    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

impl Rejection {
    /// Wire status. Both envelope failure kinds share one value.
    pub fn status(&self) -> &'static str {
        match self {
            Rejection::Empty => "empty",
            Rejection::BadEnvelope(_) => "badenc",
            Rejection::BadJson => "badjson",
            Rejection::BadRequest(_) => "badreq",
            Rejection::NotRegistered => "notreg",
            Rejection::Replay => "replay",
            Rejection::NotFound => "nf",
            Rejection::Internal(_) => "error",
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Rejection::Internal(_))
    }
}

impl From<Error> for Rejection {
    fn from(err: Error) -> Self {
        Rejection::Internal(err.into())
    }
}

impl From<PayloadError> for Rejection {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::NotJson => Rejection::BadJson,
            PayloadError::Schema(reason) => Rejection::BadRequest(reason),
        }
    }
}

/// What an accepted `/data` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataReceipt {
    pub saved: u64,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    pool: SqlitePool,
    codec: Arc<dyn EnvelopeCodec>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(pool: SqlitePool, codec: Arc<dyn EnvelopeCodec>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, codec, clock }
    }

    /// Server time in unix seconds, for device clock correction.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// `/register`: envelope only, no nonce, idempotent.
    pub async fn register(&self, body: &[u8]) -> Result<RegisterRequest, Rejection> {
        let plaintext = self.open(body)?;
        let request = validate::parse_register(&plaintext)?;

        registry::register(&self.pool, &request.device_id, self.clock.now()).await?;
        info!(device_id = %request.device_id, "Device registered");

        Ok(request)
    }

    /// `/data`: envelope, registration and nonce, then one atomic batch.
    pub async fn ingest(&self, body: &[u8]) -> Result<DataReceipt, Rejection> {
        let plaintext = self.open(body)?;
        let request = validate::parse_data(&plaintext)?;

        debug!(
            device_id = %request.device_id,
            nonce = %request.nonce,
            records = request.samples.len() + request.skipped,
            "Data request parsed"
        );

        if !registry::is_registered(&self.pool, &request.device_id).await? {
            return Err(Rejection::NotRegistered);
        }

        let saved = self.persist(&request).await?;

        RECORDS_SAVED_TOTAL.inc_by(saved as f64);
        RECORDS_SKIPPED_TOTAL.inc_by(request.skipped as f64);
        info!(
            device_id = %request.device_id,
            saved,
            skipped = request.skipped,
            "Batch stored"
        );

        Ok(DataReceipt {
            saved,
            skipped: request.skipped,
        })
    }

    fn open(&self, body: &[u8]) -> Result<Vec<u8>, Rejection> {
        if body.is_empty() {
            return Err(Rejection::Empty);
        }

        let plaintext = self.codec.decode(body).map_err(Rejection::BadEnvelope)?;
        debug!(
            body_len = body.len(),
            plain_len = plaintext.len(),
            "Envelope decoded"
        );
        Ok(plaintext)
    }

    /// Consumes the nonce and writes the batch, retrying the whole
    /// transaction on lock contention.
    async fn persist(&self, request: &DataRequest) -> Result<u64, Rejection> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.persist_once(request).await {
                Ok(Some(saved)) => return Ok(saved),
                Ok(None) => return Err(Rejection::Replay),
                Err(Error::Database(e)) if attempt < MAX_ATTEMPTS && is_transient_error(&e) => {
                    DB_FAILURES_TOTAL.inc();
                    let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                    warn!(
                        "Batch transaction failed (attempt {}/{}), retrying in {}ms: {}",
                        attempt, MAX_ATTEMPTS, backoff_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    DB_FAILURES_TOTAL.inc();
                    return Err(e.into());
                }
            }
        }
    }

    /// `None` means the nonce was already used; nothing is written then.
    async fn persist_once(&self, request: &DataRequest) -> crate::errors::Result<Option<u64>> {
        let mut tx = self.pool.begin().await?;

        let fresh =
            ledger::try_consume(&mut *tx, &request.device_id, &request.nonce, self.clock.now())
                .await?;
        if !fresh {
            tx.rollback().await?;
            return Ok(None);
        }

        let saved = store::insert_batch(&mut tx, &request.samples).await?;
        tx.commit().await?;

        Ok(Some(saved))
    }
}

/// Bounds a pipeline call. On expiry the call is dropped, which rolls back
/// any open transaction.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, Rejection>
where
    F: Future<Output = Result<T, Rejection>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(Rejection::Internal(anyhow::anyhow!(
            "request exceeded its {}ms deadline",
            deadline.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::test_support::temp_pool;
    use crate::envelope::AesCbcHmacCodec;
    use serde_json::json;

    const SECRET: &str = "pipeline-secret";

    fn ingestor(pool: SqlitePool) -> Ingestor {
        Ingestor::new(
            pool,
            Arc::new(AesCbcHmacCodec::new(SECRET)),
            Arc::new(FixedClock(1_700_000_000)),
        )
    }

    fn seal(value: serde_json::Value) -> Vec<u8> {
        AesCbcHmacCodec::new(SECRET).encode(&serde_json::to_vec(&value).unwrap())
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_then_ingest() {
        let (_dir, pool) = temp_pool().await;
        let ingestor = ingestor(pool.clone());

        let registered = ingestor.register(&seal(json!({"device_id": "dev1"}))).await.unwrap();
        assert_eq!(registered.device_id, "dev1");

        let body = seal(json!({
            "device_id": "dev1",
            "nonce": "n1",
            "records": [
                {"ts": 100, "current_mA": 500, "power_dW": 10, "temp_cC": 2500},
                {"ts": 0, "current_mA": 1, "power_dW": 1, "temp_cC": 1}
            ]
        }));

        let receipt = ingestor.ingest(&body).await.unwrap();
        assert_eq!(receipt, DataReceipt { saved: 1, skipped: 1 });

        assert!(matches!(ingestor.ingest(&body).await, Err(Rejection::Replay)));
        assert_eq!(count(&pool, "telemetry").await, 1);

        let seen_at: i64 = sqlx::query_scalar("SELECT seen_at FROM nonces")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(seen_at, 1_700_000_000);
    }

    #[tokio::test]
    async fn test_unregistered_device() {
        let (_dir, pool) = temp_pool().await;
        let ingestor = ingestor(pool.clone());

        let body = seal(json!({"device_id": "ghost", "nonce": "n1", "records": [{"ts": 5}]}));
        assert!(matches!(ingestor.ingest(&body).await, Err(Rejection::NotRegistered)));

        // the nonce is not burned by a rejected request
        assert_eq!(count(&pool, "nonces").await, 0);
        assert_eq!(count(&pool, "telemetry").await, 0);
    }

    #[tokio::test]
    async fn test_envelope_gate_has_no_side_effects() {
        let (_dir, pool) = temp_pool().await;
        let ingestor = ingestor(pool.clone());

        let forged = AesCbcHmacCodec::new("wrong")
            .encode(br#"{"device_id":"dev1","nonce":"n1","records":[{"ts":1}]}"#);

        assert!(matches!(
            ingestor.register(&forged).await,
            Err(Rejection::BadEnvelope(EnvelopeError::Authentication))
        ));
        assert!(matches!(
            ingestor.ingest(&forged).await,
            Err(Rejection::BadEnvelope(EnvelopeError::Authentication))
        ));
        assert!(matches!(
            ingestor.ingest(b"short").await,
            Err(Rejection::BadEnvelope(EnvelopeError::Malformed))
        ));
        assert!(matches!(ingestor.ingest(b"").await, Err(Rejection::Empty)));

        for table in ["devices", "nonces", "telemetry"] {
            assert_eq!(count(&pool, table).await, 0, "{} should be empty", table);
        }
    }

    #[tokio::test]
    async fn test_payload_errors() {
        let (_dir, pool) = temp_pool().await;
        let ingestor = ingestor(pool);

        let not_json = AesCbcHmacCodec::new(SECRET).encode(b"device_id=dev1");
        assert!(matches!(ingestor.register(&not_json).await, Err(Rejection::BadJson)));

        let missing = seal(json!({"device_id": "dev1", "records": []}));
        assert!(matches!(ingestor.ingest(&missing).await, Err(Rejection::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_nothing() {
        let (_dir, pool) = temp_pool().await;
        let ingestor = ingestor(pool.clone());
        ingestor.register(&seal(json!({"device_id": "dev1"}))).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER reject_ts BEFORE INSERT ON telemetry WHEN NEW.ts = 13 \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let body = seal(json!({
            "device_id": "dev1",
            "nonce": "n1",
            "records": [{"ts": 11}, {"ts": 12}, {"ts": 13}, {"ts": 14}]
        }));
        let result = ingestor.ingest(&body).await;
        assert!(matches!(result, Err(Rejection::Internal(_))));

        assert_eq!(count(&pool, "telemetry").await, 0);
        assert_eq!(count(&pool, "nonces").await, 0);
    }

    #[tokio::test]
    async fn test_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Rejection>(())
        };
        let result = with_deadline(Duration::from_millis(10), slow).await;
        assert!(matches!(result, Err(Rejection::Internal(_))));

        let fast = async { Ok::<_, Rejection>(7) };
        assert_eq!(with_deadline(Duration::from_secs(1), fast).await.unwrap(), 7);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(Rejection::BadEnvelope(EnvelopeError::Malformed).status(), "badenc");
        assert_eq!(Rejection::BadEnvelope(EnvelopeError::Authentication).status(), "badenc");
        assert_eq!(Rejection::from(PayloadError::NotJson).status(), "badjson");
        assert_eq!(Rejection::from(PayloadError::Schema("x")).status(), "badreq");
        assert!(Rejection::from(Error::Config("x".into())).is_internal());
    }
}
