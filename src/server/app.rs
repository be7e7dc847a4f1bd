//! Primary (internal) listener application
//!
//! Wraps the service router with:
//! - `GET /ping` for the watchdog and `GET /metrics` for Prometheus
//! - per-request accounting headers (`Execution-Time`, `Query-Time`,
//!   `Query-Count`, `Write-Count`)
//! - a cap on in-flight requests

use crate::server::metrics::SharedMetrics;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::warn;

/// Accounting for one request
///
/// Inserted into request extensions as `Arc<RequestStats>`; handlers of the
/// wrapped service record their database work into it.
#[derive(Debug, Default)]
pub struct RequestStats {
    query_count: AtomicU64,
    write_count: AtomicU64,
    query_time_us: AtomicU64,
}

impl RequestStats {
    /// Record one query and how long it took
    pub fn record_query(&self, elapsed: Duration) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.query_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Cumulative query time in milliseconds
    pub fn query_time_ms(&self) -> u64 {
        self.query_time_us.load(Ordering::Relaxed) / 1000
    }
}

/// Liveness endpoint probed by the watchdog
async fn ping() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(metrics): State<SharedMetrics>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn track_request(mut req: Request, next: Next) -> Response {
    let start = Instant::now();
    let stats = Arc::new(RequestStats::default());
    req.extensions_mut().insert(Arc::clone(&stats));

    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    headers.insert(
        "Execution-Time",
        HeaderValue::from(start.elapsed().as_millis() as u64),
    );
    headers.insert("Query-Time", HeaderValue::from(stats.query_time_ms()));
    headers.insert("Query-Count", HeaderValue::from(stats.query_count()));
    headers.insert("Write-Count", HeaderValue::from(stats.write_count()));
    response
}

async fn limit_concurrency(
    State(permits): State<Arc<Semaphore>>,
    req: Request,
    next: Next,
) -> Response {
    // The semaphore is never closed
    let Ok(_permit) = permits.acquire().await else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    next.run(req).await
}

/// Build the primary listener's router around `service`
pub fn build_app(service: Router, metrics_handle: SharedMetrics, max_concurrent: usize) -> Router {
    let internal = Router::new()
        .route("/ping", get(ping))
        .route("/metrics", get(metrics))
        .with_state(metrics_handle);

    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));

    service
        .merge(internal)
        .layer(middleware::from_fn_with_state(permits, limit_concurrency))
        .layer(middleware::from_fn(track_request))
}

#[cfg(test)]
#[path = "app_test.rs"]
mod tests;
