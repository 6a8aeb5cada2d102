//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Objects rewritten successfully
    pub static ref OBJECTS_MIGRATED: CounterVec = register_counter_vec!(
        "storage_version_migrator_objects_migrated_total",
        "Number of objects rewritten under the current storage version",
        &["resource"]
    ).unwrap();

    /// Objects or resource types that ended with an error
    pub static ref OBJECT_FAILURES: CounterVec = register_counter_vec!(
        "storage_version_migrator_object_failures_total",
        "Number of migration outcomes carrying an error",
        &["resource"]
    ).unwrap();

    /// Resource type migrations by outcome
    pub static ref MIGRATIONS_TOTAL: CounterVec = register_counter_vec!(
        "storage_version_migrator_migrations_total",
        "Resource type migrations by outcome",
        &["outcome", "resource"]
    ).unwrap();

    /// Retried list or write calls
    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "storage_version_migrator_retries_total",
        "Retried API calls by resource and error reason",
        &["resource", "reason"]
    ).unwrap();

    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "storage_version_migrator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "storage_version_migrator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "storage_version_migrator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.1, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    /// Migrator health (1 = healthy, 0 = unhealthy)
    pub static ref MIGRATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "storage_version_migrator_health",
        "Migrator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    MIGRATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" | "/readyz" | "/ready" => health_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

/// 200 while the health gauge is up, 503 otherwise
fn health_response() -> Response<Full<Bytes>> {
    if MIGRATOR_HEALTH.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
