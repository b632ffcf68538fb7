//! Request metrics emitted by the entry filter.

use std::time::Duration;

use axum::http::{Method, StatusCode};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};

#[derive(Clone)]
pub struct RequestMetrics {
    latency: Histogram<f64>,
    statuses: Counter<u64>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        let meter = global::meter("revenant");

        let latency = meter
            .f64_histogram("proxy_request_duration_seconds")
            .with_description("Latency of requests through the proxy, in seconds")
            .build();
        let statuses = meter
            .u64_counter("proxy_requests_total")
            .with_description("Requests by status code and method")
            .build();

        Self { latency, statuses }
    }

    pub fn observe(&self, elapsed: Duration, status: StatusCode, method: &Method) {
        self.latency.record(elapsed.as_secs_f64(), &[]);
        self.statuses.add(
            1,
            &[
                KeyValue::new("code", status.as_u16().to_string()),
                KeyValue::new("method", method.as_str().to_string()),
            ],
        );
    }
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}
