use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_requests_total", "Requests handled, by route and outcome"),
        &["route", "status"]
    )
    .unwrap();
    pub static ref RECORDS_SAVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_records_saved_total",
        "Telemetry records persisted"
    ))
    .unwrap();
    pub static ref RECORDS_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_records_skipped_total",
        "Telemetry records dropped for a non-positive or missing timestamp"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_db_failures_total",
        "Total database failures, including retried ones"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_ingest_latency_seconds",
            "Time taken to handle one ingestion request"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

/// Registers every collector. Calling it again is harmless.
pub fn init_metrics() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(REQUESTS_TOTAL.clone()),
        Box::new(RECORDS_SAVED_TOTAL.clone()),
        Box::new(RECORDS_SKIPPED_TOTAL.clone()),
        Box::new(DB_FAILURES_TOTAL.clone()),
        Box::new(INGEST_LATENCY_SECONDS.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
