//! Process-level Prometheus telemetry.
//!
//! These are operational counters for whoever scrapes the server process.
//! They are independent of the per-run metric stream: the stream is the
//! product, these are plumbing.

use std::env;

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, TextEncoder};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "barrage".to_string());

    pub static ref REQUEST_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_total", "Total number of load requests issued")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_STATUS_CODES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_status_codes_total", "Number of load requests by status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["status_code"]
        ).unwrap();

    pub static ref CONCURRENT_REQUESTS: Gauge =
        Gauge::with_opts(
            Opts::new("concurrent_requests", "Number of load requests currently in flight")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RUNS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("runs_total", "Number of finished runs by terminal status")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["status"]
        ).unwrap();

    pub static ref ACTIVE_RUN: Gauge =
        Gauge::with_opts(
            Opts::new("active_run", "1 while a run occupies the active slot")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
///
/// Call once at startup; a second call fails with a duplicate-registration
/// error.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(REQUEST_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_STATUS_CODES.clone()))?;
    registry.register(Box::new(CONCURRENT_REQUESTS.clone()))?;
    registry.register(Box::new(RUNS_TOTAL.clone()))?;
    registry.register(Box::new(ACTIVE_RUN.clone()))?;
    Ok(())
}

/// Returns a static label for common status codes.
///
/// Avoids a heap `String` allocation on every request in the hot path.
/// Uncommon codes fall back to "other" rather than allocating a unique
/// string.
pub fn status_code_label(code: u16) -> &'static str {
    match code {
        200 => "200",
        201 => "201",
        204 => "204",
        301 => "301",
        302 => "302",
        304 => "304",
        400 => "400",
        401 => "401",
        403 => "403",
        404 => "404",
        405 => "405",
        408 => "408",
        409 => "409",
        422 => "422",
        429 => "429",
        500 => "500",
        502 => "502",
        503 => "503",
        504 => "504",
        _ => "other",
    }
}

/// Gathers and encodes the default registry in the Prometheus text format.
pub fn gather_metrics_text() -> (String, Vec<u8>) {
    let encoder = TextEncoder::new();
    let families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    (encoder.format_type().to_string(), buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_cover_the_common_codes() {
        assert_eq!(status_code_label(200), "200");
        assert_eq!(status_code_label(503), "503");
        assert_eq!(status_code_label(418), "other");
    }

    #[test]
    fn counters_increment_without_registration() {
        let before = REQUEST_TOTAL.get();
        REQUEST_TOTAL.inc();
        assert_eq!(REQUEST_TOTAL.get(), before + 1);
    }
}
