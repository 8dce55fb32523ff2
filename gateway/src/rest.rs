use crate::metrics::{INGEST_LATENCY_SECONDS, REQUESTS_TOTAL};
use crate::model::{StatusResponse, TimeResponse};
use crate::pipeline::{with_deadline, Ingestor, Rejection};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::any::Any;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info_span, warn, Instrument};

/// Deployed firmware posts to `/index.php/<route>`; both forms are served.
const FRONT_CONTROLLER: &str = "/index.php";

#[derive(Debug, Clone)]
struct AppState {
    ingestor: Ingestor,
    request_timeout: Duration,
}

pub fn create_router(ingestor: Ingestor, request_timeout: Duration, max_body_bytes: usize) -> Router {
    let state = AppState {
        ingestor,
        request_timeout,
    };

    let routes = Router::new()
        .route(
            "/sync_time",
            get(sync_time).post(sync_time).fallback(not_found),
        )
        .route("/register", post(register).fallback(not_found))
        .route("/data", post(data).fallback(not_found));

    Router::new()
        .merge(routes.clone())
        .nest(FRONT_CONTROLLER, routes)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

fn request_span(route: &'static str) -> tracing::Span {
    info_span!("request", request_id = %uuid::Uuid::new_v4(), route)
}

async fn sync_time(State(state): State<AppState>) -> Json<TimeResponse> {
    async move {
        let ts = state.ingestor.now();
        debug!(ts, "Time sync");
        REQUESTS_TOTAL.with_label_values(&["sync_time", "OK"]).inc();
        Json(TimeResponse { ts })
    }
    .instrument(request_span("sync_time"))
    .await
}

async fn register(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    handle("register", async move {
        let body = read_body(body)?;
        with_deadline(state.request_timeout, state.ingestor.register(&body)).await?;
        Ok(())
    })
    .await
}

async fn data(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    handle("data", async move {
        let body = read_body(body)?;
        with_deadline(state.request_timeout, state.ingestor.ingest(&body)).await?;
        Ok(())
    })
    .await
}

async fn not_found(method: Method, uri: Uri) -> Response {
    request_span("unmatched").in_scope(|| {
        debug!(%method, %uri, "No route");
        REQUESTS_TOTAL.with_label_values(&["unmatched", "nf"]).inc();
        Rejection::NotFound.into_response()
    })
}

fn read_body(body: Result<Bytes, BytesRejection>) -> Result<Bytes, Rejection> {
    body.map_err(|e| {
        warn!("Unreadable request body: {}", e);
        Rejection::BadRequest("request body could not be read")
    })
}

/// Runs one pipeline call inside a request span and turns its outcome into
/// the wire response.
async fn handle<F>(route: &'static str, call: F) -> Response
where
    F: std::future::Future<Output = Result<(), Rejection>>,
{
    async move {
        let start = Instant::now();
        let result = call.await;
        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                REQUESTS_TOTAL.with_label_values(&[route, "OK"]).inc();
                ok_response()
            }
            Err(rejection) => {
                if rejection.is_internal() {
                    error!("Request failed: {}", rejection);
                } else {
                    warn!("Request rejected: {}", rejection);
                }
                REQUESTS_TOTAL
                    .with_label_values(&[route, rejection.status()])
                    .inc();
                rejection.into_response()
            }
        }
    }
    .instrument(request_span(route))
    .await
}

fn ok_response() -> Response {
    Json(StatusResponse {
        status: "OK".to_string(),
    })
    .into_response()
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let code = match &self {
            Rejection::Empty
            | Rejection::BadEnvelope(_)
            | Rejection::BadJson
            | Rejection::BadRequest(_) => StatusCode::BAD_REQUEST,
            Rejection::NotRegistered | Rejection::Replay => StatusCode::FORBIDDEN,
            Rejection::NotFound => StatusCode::NOT_FOUND,
            Rejection::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            code,
            Json(StatusResponse {
                status: self.status().to_string(),
            }),
        )
            .into_response()
    }
}

fn panic_response(_payload: Box<dyn Any + Send + 'static>) -> Response {
    error!("Request handler panicked");
    Rejection::Internal(anyhow::anyhow!("handler panicked")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::test_support::temp_pool;
    use crate::envelope::AesCbcHmacCodec;
    use axum::body::to_bytes;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (buffer, tracing::subscriber::set_default(subscriber))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_rejection_status_codes() {
        tokio_test::block_on(async {
            let cases = vec![
                (Rejection::Empty, StatusCode::BAD_REQUEST, "empty"),
                (Rejection::BadJson, StatusCode::BAD_REQUEST, "badjson"),
                (Rejection::BadRequest("x"), StatusCode::BAD_REQUEST, "badreq"),
                (Rejection::NotRegistered, StatusCode::FORBIDDEN, "notreg"),
                (Rejection::Replay, StatusCode::FORBIDDEN, "replay"),
                (Rejection::NotFound, StatusCode::NOT_FOUND, "nf"),
                (
                    Rejection::Internal(anyhow::anyhow!("disk on fire")),
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "error",
                ),
            ];

            for (rejection, code, status) in cases {
                let response = rejection.into_response();
                assert_eq!(response.status(), code);
                assert_eq!(body_json(response).await, serde_json::json!({ "status": status }));
            }
        });
    }

    #[test]
    fn test_internal_detail_not_exposed() {
        tokio_test::block_on(async {
            let response = Rejection::Internal(anyhow::anyhow!("secret detail")).into_response();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert!(!String::from_utf8_lossy(&bytes).contains("secret detail"));
        });
    }

    #[test]
    fn test_every_route_logs_inside_request_span() {
        let (logs, _guard) = capture_logs();

        tokio_test::block_on(async {
            let (_dir, pool) = temp_pool().await;
            let state = AppState {
                ingestor: Ingestor::new(
                    pool,
                    Arc::new(AesCbcHmacCodec::new("secret")),
                    Arc::new(FixedClock(1_700_000_000)),
                ),
                request_timeout: Duration::from_secs(1),
            };

            let Json(reply) = sync_time(State(state)).await;
            assert_eq!(reply.ts, 1_700_000_000);

            let response = not_found(Method::GET, Uri::from_static("/nowhere")).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        });

        let out = logs.contents();
        let time_sync = out.lines().find(|l| l.contains("Time sync")).unwrap();
        assert!(time_sync.contains("request_id="), "{}", time_sync);
        assert!(time_sync.contains("route=\"sync_time\""), "{}", time_sync);

        let no_route = out.lines().find(|l| l.contains("No route")).unwrap();
        assert!(no_route.contains("request_id="), "{}", no_route);
        assert!(no_route.contains("route=\"unmatched\""), "{}", no_route);
    }

    #[test]
    fn test_panic_maps_to_error() {
        tokio_test::block_on(async {
            let response = panic_response(Box::new("boom"));
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body_json(response).await, serde_json::json!({ "status": "error" }));
        });
    }
}
