//! Load execution engine.
//!
//! Drives one target with U parallel workers sharing a single HTTP client.
//! Workers are symmetric and uncoordinated: the only shared state is the
//! cancellation token, the sample accumulator, and the RPS window. The engine
//! is open-loop: it issues as fast as the workers can, with no pacing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reqwest::header::HeaderMap;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::BearerToken;
use crate::client;
use crate::metrics::{self, CONCURRENT_REQUESTS, REQUEST_STATUS_CODES, REQUEST_TOTAL};
use crate::model::{self, HttpMethod, MetricSample, RunAggregate};
use crate::stats;
use crate::store::RunStore;
use crate::stream::{EventHub, StreamEvent};

/// Status recorded when the transport fails before a response arrives.
pub const TRANSPORT_FAILURE_STATUS: u16 = 503;

/// Width of the sliding window behind `current_rps` and the peak tracker.
const RPS_WINDOW: Duration = Duration::from_secs(1);

/// One in this many samples is persisted to the store's timeline.
const SNAPSHOT_SAMPLING: u64 = 10;

/// When to stop: a total request budget or a wall-clock duration. Exactly
/// one applies to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCriterion {
    /// Total request budget R. Each of U workers performs `floor(R/U)`
    /// requests; the `R mod U` stragglers are dropped to keep workers
    /// symmetric, so the effective total may fall short by up to U−1.
    Budget(u64),
    /// Wall-clock duration in seconds.
    Duration(u64),
}

/// Everything the engine needs to drive one run.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub run_token: String,
    pub url: String,
    pub method: HttpMethod,
    pub users: u32,
    pub stop: StopCriterion,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub insecure: bool,
    pub bearer: Option<BearerToken>,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Invalid request headers: {0}")]
    Headers(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// What the engine hands back after all workers have exited.
#[derive(Debug)]
pub struct EngineOutcome {
    pub aggregate: RunAggregate,
    pub cancelled: bool,
}

/// Executes the plan and returns once every worker has exited.
///
/// Each recorded sample fans out to the stream (`MetricReceived`) and, for
/// every tenth sample, to the store's timeline. Cancellation is checked at
/// the top of each worker iteration and raced against the in-flight request,
/// so a stop is observed within roughly one request's time.
pub async fn run_load(
    plan: LoadPlan,
    cancel: CancellationToken,
    hub: EventHub,
    store: Option<Arc<RunStore>>,
) -> Result<EngineOutcome, EngineError> {
    let http = client::build_client(plan.insecure, None)?;
    let headers = match &plan.headers {
        Some(raw) => Some(client::header_map(raw).map_err(EngineError::Headers)?),
        None => None,
    };

    let users = plan.users.max(1);
    let per_worker_quota = match plan.stop {
        StopCriterion::Budget(total) => Some(total / users as u64),
        StopCriterion::Duration(_) => None,
    };
    let started = Instant::now();
    let deadline = match plan.stop {
        StopCriterion::Duration(secs) => Some(started + Duration::from_secs(secs)),
        StopCriterion::Budget(_) => None,
    };

    info!(
        run_token = %plan.run_token,
        url = %plan.url,
        method = %plan.method,
        users = users,
        stop = ?plan.stop,
        "Engine starting"
    );

    let run_token = plan.run_token.clone();
    let shared = Arc::new(WorkerShared {
        run_token: plan.run_token,
        url: plan.url,
        method: plan.method,
        content_type: plan.content_type,
        body: plan.body,
        bearer: plan.bearer,
        headers,
        client: http,
        telemetry: Telemetry::new(),
        hub,
        store,
    });

    let mut workers: JoinSet<()> = JoinSet::new();
    for worker_id in 0..users {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        workers.spawn(async move {
            run_worker(worker_id, shared, cancel, per_worker_quota, deadline).await;
        });
    }

    // Join every worker before computing the aggregate: the final sample is
    // enqueued before this loop completes, which is the happens-before edge
    // the terminal stream event relies on.
    let mut worker_failure: Option<String> = None;
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            worker_failure.get_or_insert_with(|| e.to_string());
        }
    }
    if let Some(message) = worker_failure {
        return Err(EngineError::Worker(message));
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let aggregate = shared.telemetry.aggregate(&run_token, elapsed_ms);
    let cancelled = cancel.is_cancelled();

    info!(
        run_token = %run_token,
        total = aggregate.total_requests,
        elapsed_ms = elapsed_ms,
        peak_rps = aggregate.requests_per_second,
        cancelled = cancelled,
        "Engine finished"
    );

    Ok(EngineOutcome {
        aggregate,
        cancelled,
    })
}

/// State shared by all workers of one run.
struct WorkerShared {
    run_token: String,
    url: String,
    method: HttpMethod,
    content_type: Option<String>,
    body: Option<String>,
    bearer: Option<BearerToken>,
    headers: Option<HeaderMap>,
    client: reqwest::Client,
    telemetry: Telemetry,
    hub: EventHub,
    store: Option<Arc<RunStore>>,
}

impl WorkerShared {
    fn build_request(&self) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(client::reqwest_method(self.method), &self.url);
        if let Some(headers) = &self.headers {
            request = request.headers(headers.clone());
        }
        if let Some(content_type) = &self.content_type {
            request = request.header("Content-Type", content_type);
        }
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }
        if let Some(bearer) = &self.bearer {
            request = request.header(&bearer.header_name, &bearer.value);
        }
        request
    }

    /// Records one response and fans the snapshot out to the stream and,
    /// for every tenth sample, to the store's timeline.
    fn emit(&self, status: u16, elapsed_ms: u64) {
        let (sample, sequence) = self.telemetry.record(&self.run_token, status, elapsed_ms);

        if sequence % SNAPSHOT_SAMPLING == 0 {
            if let Some(store) = &self.store {
                let store = Arc::clone(store);
                let snapshot = sample.clone();
                // Offloaded so the worker never waits on SQLite. Timeline
                // persistence is best-effort telemetry.
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = store.append_snapshot(&snapshot) {
                        warn!(error = %e, "Failed to persist metric snapshot");
                    }
                });
            }
        }

        self.hub.publish(StreamEvent::MetricReceived(sample));
    }
}

async fn run_worker(
    worker_id: u32,
    shared: Arc<WorkerShared>,
    cancel: CancellationToken,
    quota: Option<u64>,
    deadline: Option<Instant>,
) {
    debug!(worker_id = worker_id, "Worker starting");

    let mut issued = 0u64;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if let Some(quota) = quota {
            if issued >= quota {
                break;
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }

        CONCURRENT_REQUESTS.inc();
        REQUEST_TOTAL.inc();

        let timer = Instant::now();
        let outcome = tokio::select! {
            result = shared.build_request().send() => result,
            _ = cancel.cancelled() => {
                // The in-flight request is dropped, aborting it promptly.
                CONCURRENT_REQUESTS.dec();
                break;
            }
        };
        let elapsed_ms = timer.elapsed().as_millis() as u64;
        CONCURRENT_REQUESTS.dec();

        let status = match outcome {
            // Headers are in; drop the response without draining the body so
            // elapsed covers time-to-headers only.
            Ok(response) => response.status().as_u16(),
            Err(e) => {
                debug!(worker_id = worker_id, error = %e, "Request failed");
                TRANSPORT_FAILURE_STATUS
            }
        };
        REQUEST_STATUS_CODES
            .with_label_values(&[metrics::status_code_label(status)])
            .inc();

        shared.emit(status, elapsed_ms);
        issued += 1;
    }

    debug!(worker_id = worker_id, issued = issued, "Worker exiting");
}

/// The engine-local accumulator: running totals, the append-only sample log,
/// the 1-second RPS window and the peak tracker.
struct Telemetry {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    latency_sum_ms: AtomicU64,
    sequence: AtomicU64,
    samples: Mutex<Vec<(u16, u64)>>,
    window: Mutex<VecDeque<Instant>>,
    peak_rps_bits: AtomicU64,
}

impl Telemetry {
    fn new() -> Self {
        Telemetry {
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            latency_sum_ms: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            samples: Mutex::new(Vec::new()),
            window: Mutex::new(VecDeque::new()),
            peak_rps_bits: AtomicU64::new(0),
        }
    }

    /// Appends one sample and returns the snapshot to fan out plus its
    /// 1-based sequence number.
    fn record(&self, run_token: &str, status: u16, elapsed_ms: u64) -> (MetricSample, u64) {
        let success = model::is_success_status(status);
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        let successful = if success {
            self.successful.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.successful.load(Ordering::Relaxed)
        };
        let failed = if success {
            self.failed.load(Ordering::Relaxed)
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed) + 1
        };
        let latency_sum = self.latency_sum_ms.fetch_add(elapsed_ms, Ordering::Relaxed) + elapsed_ms;

        self.samples
            .lock()
            .expect("sample log poisoned")
            .push((status, elapsed_ms));

        let current_rps = self.observe_rate();
        self.update_peak(current_rps);

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let sample = MetricSample {
            run_token: run_token.to_string(),
            timestamp: Utc::now(),
            response_time_ms: elapsed_ms,
            status_code: status,
            is_success: success,
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            current_rps,
            average_response_time: latency_sum as f64 / total as f64,
        };
        (sample, sequence)
    }

    /// Enqueues now into the window, lazily evicting entries older than the
    /// window width, and returns the windowed rate.
    fn observe_rate(&self) -> f64 {
        let mut window = self.window.lock().expect("rps window poisoned");
        let now = Instant::now();
        window.push_back(now);
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) > RPS_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        window.len() as f64
    }

    /// Compare-and-set max over the f64 bit pattern. Non-negative floats
    /// order the same as their bit patterns, but the loop compares as f64
    /// anyway.
    fn update_peak(&self, rps: f64) {
        let mut observed = self.peak_rps_bits.load(Ordering::Relaxed);
        while rps > f64::from_bits(observed) {
            match self.peak_rps_bits.compare_exchange_weak(
                observed,
                rps.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }
    }

    fn aggregate(&self, run_token: &str, elapsed_ms: u64) -> RunAggregate {
        let samples = self.samples.lock().expect("sample log poisoned");
        let latencies: Vec<f64> = samples.iter().map(|(_, ms)| *ms as f64).collect();
        let overall = stats::aggregate(&latencies);
        let status_latencies: Vec<(u16, f64)> = samples.iter().map(|(s, ms)| (*s, *ms as f64)).collect();
        let status_codes = stats::per_status(&status_latencies);

        RunAggregate {
            run_token: run_token.to_string(),
            total_requests: overall.count,
            successful_requests: self.successful.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            requests_per_second: f64::from_bits(self.peak_rps_bits.load(Ordering::Relaxed)),
            average_response_time: overall.avg,
            min_response_time: overall.min,
            max_response_time: overall.max,
            percentiles: overall.percentiles,
            total_elapsed_time: elapsed_ms,
            status_codes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tracks_totals_and_success_split() {
        let telemetry = Telemetry::new();
        let (s1, seq1) = telemetry.record("t", 200, 10);
        let (s2, seq2) = telemetry.record("t", 503, 30);

        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);
        assert_eq!(s1.total_requests, 1);
        assert!(s1.is_success);
        assert_eq!(s2.total_requests, 2);
        assert_eq!(s2.successful_requests, 1);
        assert_eq!(s2.failed_requests, 1);
        assert!(!s2.is_success);
        assert_eq!(s2.average_response_time, 20.0);
    }

    #[test]
    fn peak_rps_never_decreases() {
        let telemetry = Telemetry::new();
        telemetry.update_peak(5.0);
        telemetry.update_peak(3.0);
        assert_eq!(f64::from_bits(telemetry.peak_rps_bits.load(Ordering::Relaxed)), 5.0);
        telemetry.update_peak(9.0);
        assert_eq!(f64::from_bits(telemetry.peak_rps_bits.load(Ordering::Relaxed)), 9.0);
    }

    #[test]
    fn aggregate_reflects_recorded_samples() {
        let telemetry = Telemetry::new();
        for ms in [10, 20, 30, 40] {
            telemetry.record("t", 200, ms);
        }
        telemetry.record("t", 500, 100);

        let aggregate = telemetry.aggregate("t", 1234);
        assert_eq!(aggregate.total_requests, 5);
        assert_eq!(aggregate.successful_requests, 4);
        assert_eq!(aggregate.failed_requests, 1);
        assert_eq!(aggregate.min_response_time, 10.0);
        assert_eq!(aggregate.max_response_time, 100.0);
        assert_eq!(aggregate.total_elapsed_time, 1234);
        assert_eq!(aggregate.status_codes[&200].count, 4);
        assert_eq!(aggregate.status_codes[&500].count, 1);
    }

    #[test]
    fn aggregate_with_no_samples_is_all_zero() {
        let telemetry = Telemetry::new();
        let aggregate = telemetry.aggregate("t", 0);
        assert_eq!(aggregate.total_requests, 0);
        assert_eq!(aggregate.average_response_time, 0.0);
        assert_eq!(aggregate.requests_per_second, 0.0);
        assert!(aggregate.status_codes.is_empty());
    }
}
