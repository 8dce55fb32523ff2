use axum::{http::StatusCode, routing::get, Router};
use gateway::clock::SystemClock;
use gateway::config::Config;
use gateway::envelope::AesCbcHmacCodec;
use gateway::{db, metrics, rest, Ingestor};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting telemetry gateway");
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());
    info!("Request timeout: {:?}", config.request_timeout);

    // Initialize metrics
    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    // Connect to database
    let pool = match db::make_pool(&config.database_url, config.db_max_connections).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let ingestor = Ingestor::new(
        pool.clone(),
        Arc::new(AesCbcHmacCodec::new(&config.secret)),
        Arc::new(SystemClock),
    );

    // Build HTTP app with ingestion routes and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(
            ingestor,
            config.request_timeout,
            config.max_body_bytes,
        ));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
    });

    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
    }

    pool.close().await;
    info!("Shutting down");
}

async fn metrics_handler() -> Result<String, StatusCode> {
    metrics::gather_metrics().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
