use crate::actor::Feature;
use crate::error::{GatewayError, Result};
use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{header, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Prometheus recorder and renderer.
///
/// The helpers in this module record through the `metrics` facade, which is
/// a no-op until [`MetricsService::new`] installs the recorder.
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the process-wide Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_requests_total",
            "Total number of HTTP requests received"
        );
        describe_histogram!(
            "gateway_request_duration_seconds",
            "HTTP request latencies in seconds"
        );

        describe_counter!(
            "gateway_limiter_decisions_total",
            "Limiter outcomes by limiter (granted, rate_limited, no_access)"
        );
        describe_counter!(
            "gateway_limiter_commit_errors_total",
            "Usage commits that failed after the request was served"
        );
        describe_counter!(
            "gateway_rate_limit_alerts_total",
            "Usage threshold alerts dispatched"
        );

        describe_counter!(
            "gateway_source_sync_total",
            "Actor source synchronisations by outcome"
        );
        describe_histogram!(
            "gateway_source_sync_duration_seconds",
            "Actor source synchronisation latencies in seconds"
        );
        describe_gauge!(
            "gateway_sync_lock_held",
            "Whether this replica holds the source sync lock (1 = held)"
        );

        debug!("All metrics registered with descriptions");
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    let mut response = Response::new(Body::from(service.render()));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

/// Record an HTTP request; `route` is the matched route template
pub fn record_request(method: &str, route: &str, status: u16, duration: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status", status.to_string()),
    ];

    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Record method, matched route, status and latency of every request
pub async fn metrics_middleware(request: Request, next: Next) -> axum::response::Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    record_request(&method, &route, response.status().as_u16(), start.elapsed());
    response
}

/// Record a limiter decision
pub fn record_limiter_decision(limiter: &'static str, outcome: &'static str) {
    counter!("gateway_limiter_decisions_total", "limiter" => limiter, "outcome" => outcome)
        .increment(1);
}

/// Record a failed usage commit
pub fn record_commit_error() {
    counter!("gateway_limiter_commit_errors_total").increment(1);
}

/// Record a dispatched usage alert
pub fn record_alert(feature: Feature, bucket: u32) {
    let labels = [
        ("feature", feature.as_str().to_string()),
        ("bucket", bucket.to_string()),
    ];
    counter!("gateway_rate_limit_alerts_total", &labels).increment(1);
}

/// Record one source synchronisation
pub fn record_source_sync(source: &str, success: bool, duration: Duration) {
    let outcome = if success { "success" } else { "error" };
    let labels = [("source", source.to_string()), ("outcome", outcome.to_string())];
    counter!("gateway_source_sync_total", &labels).increment(1);
    histogram!(
        "gateway_source_sync_duration_seconds",
        "source" => source.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record whether this replica holds the sync lock
pub fn record_sync_lock_held(held: bool) {
    gauge!("gateway_sync_lock_held").set(if held { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_dont_panic() {
        // No recorder is installed here; recording must be a no-op
        record_request("POST", "/v1/chat/completions", 200, Duration::from_millis(12));
        record_limiter_decision("actor.rate_limit", "granted");
        record_commit_error();
        record_alert(Feature::Embeddings, 90);
        record_source_sync("subscription", false, Duration::from_millis(5));
        record_sync_lock_held(true);
    }
}
