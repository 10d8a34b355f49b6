//! Prometheus metrics for the controller.
//!
//! All metrics live in a crate-level registry exposed through a small HTTP
//! listener. Nothing registers itself at import time; `router()` is wired
//! up explicitly in `main`.

use std::sync::LazyLock;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Crate-level metrics registry.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Latency of machine API calls, by request kind.
pub static API_REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "talosccm_api_request_duration_seconds",
        "Latency of a machine API call",
    )
    .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]);
    let histogram = HistogramVec::new(opts, &["request"]).expect("static metric");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("static metric");
    histogram
});

/// Total errors of machine API calls, by request kind.
pub static API_REQUEST_ERRORS: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "talosccm_api_request_errors_total",
        "Total number of errors for a machine API call",
    );
    let counter = CounterVec::new(opts, &["request"]).expect("static metric");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("static metric");
    counter
});

/// Latency of transformer runs, by transformation kind.
pub static TRANSFORMER_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "talosccm_transformer_duration_seconds",
        "Latency of a transformer call",
    )
    .buckets(vec![0.001, 0.01, 0.05, 0.1]);
    let histogram = HistogramVec::new(opts, &["type"]).expect("static metric");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("static metric");
    histogram
});

/// Total errors of transformer runs, by transformation kind.
pub static TRANSFORMER_ERRORS: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "talosccm_transformer_errors_total",
        "Total number of errors for a transformer call",
    );
    let counter = CounterVec::new(opts, &["type"]).expect("static metric");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("static metric");
    counter
});

/// Count of approved and denied node CSRs.
pub static CSR_APPROVAL_COUNT: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "talosccm_csr_approval_count",
        "Count of approved and denied node CSRs",
    );
    let counter = CounterVec::new(opts, &["status"]).expect("static metric");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("static metric");
    counter
});

/// Record one machine API call.
pub fn observe_api_request(request: &str, elapsed: Duration, failed: bool) {
    API_REQUEST_DURATION
        .with_label_values(&[request])
        .observe(elapsed.as_secs_f64());

    if failed {
        API_REQUEST_ERRORS.with_label_values(&[request]).inc();
    }
}

/// Record one transformer run.
pub fn observe_transformer(kind: &str, elapsed: Duration, failed: bool) {
    TRANSFORMER_DURATION
        .with_label_values(&[kind])
        .observe(elapsed.as_secs_f64());

    if failed {
        TRANSFORMER_ERRORS.with_label_values(&[kind]).inc();
    }
}

/// Record one CSR decision.
pub fn observe_csr_decision(approved: bool) {
    let status = if approved { "approve" } else { "deny" };
    CSR_APPROVAL_COUNT.with_label_values(&[status]).inc();
}

/// Router serving `/metrics` and `/healthz`.
pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    match encoder.encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_pinned() {
        observe_api_request("metadata", Duration::from_millis(120), true);
        observe_transformer("node", Duration::from_millis(2), false);
        observe_csr_decision(true);
        observe_csr_decision(false);

        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();

        for expected in [
            "talosccm_api_request_duration_seconds",
            "talosccm_api_request_errors_total",
            "talosccm_transformer_duration_seconds",
            "talosccm_csr_approval_count",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn csr_counter_has_both_statuses() {
        observe_csr_decision(true);
        observe_csr_decision(false);

        assert!(CSR_APPROVAL_COUNT.with_label_values(&["approve"]).get() >= 1.0);
        assert!(CSR_APPROVAL_COUNT.with_label_values(&["deny"]).get() >= 1.0);
    }
}
