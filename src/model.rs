//! Domain entities and wire DTOs.
//!
//! Everything the store persists and everything that crosses the wire lives
//! here: projects, endpoints, runs, snapshots, the live metric sample, the
//! final aggregate, and the export/import payloads.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Closed set of HTTP methods a target may use.
///
/// Unknown methods are an explicit parse error rather than silently mapping
/// to GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::Get
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            _ => Err(format!("Unsupported HTTP method: '{}'", s)),
        }
    }
}

/// Lifecycle state of a recorded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(RunStatus::Running),
            "Completed" => Ok(RunStatus::Completed),
            "Failed" => Ok(RunStatus::Failed),
            "Cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(format!("Unknown run status: '{}'", s)),
        }
    }
}

/// Declarative description of how to acquire a bearer token before a run.
///
/// The token is fetched from `url`, located at `token_path` (dot-separated
/// object keys) in the JSON response, prefixed with `header_prefix` and
/// injected as the `header_name` header on every load request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub content_type: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    pub token_path: String,
    pub header_name: String,
    #[serde(default)]
    pub header_prefix: String,
}

/// A named group of endpoints, optionally carrying a shared auth spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub auth: Option<AuthSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating or updating a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A load-test target: URL, method, defaults for the workload shape, and
/// per-endpoint overrides for headers, TLS and auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub url: String,
    pub method: HttpMethod,
    /// Default number of virtual users.
    pub users: u32,
    /// Default total request budget. At most one of `requests` and
    /// `duration_secs` may be set.
    pub requests: Option<u64>,
    /// Default wall-clock duration in seconds.
    pub duration_secs: Option<u64>,
    pub content_type: Option<String>,
    pub body: Option<String>,
    /// Skip TLS certificate verification for this target.
    pub insecure: bool,
    /// Run the token-fetch preflight before driving this target.
    pub requires_auth: bool,
    pub headers: Option<HashMap<String, String>>,
    /// Per-endpoint auth spec; overrides the project's when present.
    pub auth: Option<AuthSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating or updating an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default = "default_users")]
    pub users: u32,
    #[serde(default)]
    pub requests: Option<u64>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
}

fn default_users() -> u32 {
    10
}

/// An ad-hoc run request, carrying the full target description inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default = "default_users")]
    pub users: u32,
    #[serde(default)]
    pub requests: Option<u64>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
}

/// Latency percentiles reported for a run or a status-code group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileSet {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Aggregate for one status-code group within a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusAggregate {
    pub count: u64,
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub percentiles: PercentileSet,
}

/// The final result of a run, as reported to callers and persisted with the
/// run record.
///
/// `requests_per_second` is the PEAK of the 1-second windowed rate observed
/// during the run, not an average.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAggregate {
    pub run_token: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub requests_per_second: f64,
    pub average_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub percentiles: PercentileSet,
    /// Total run time in milliseconds, from the engine's monotonic clock.
    pub total_elapsed_time: u64,
    pub status_codes: BTreeMap<u16, StatusAggregate>,
}

impl RunAggregate {
    /// The all-zero aggregate for a run that produced no samples.
    pub fn empty(run_token: &str) -> Self {
        RunAggregate {
            run_token: run_token.to_string(),
            ..Default::default()
        }
    }
}

/// One live metric event, emitted once per response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub run_token: String,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub is_success: bool,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub current_rps: f64,
    pub average_response_time: f64,
}

/// A persisted point on a run's timeline. One in ten metric samples is
/// stored, giving a sparser timeline sufficient for post-hoc charts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: i64,
    pub run_id: i64,
    pub timestamp: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub response_time_ms: u64,
    pub average_response_time: f64,
    pub current_rps: f64,
    pub status_code: u16,
}

/// A recorded run. The target configuration is captured at run creation so
/// later edits of the endpoint do not alter history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: i64,
    /// Opaque external identifier, unique per run.
    pub token: String,
    pub endpoint_id: Option<i64>,
    pub url: String,
    pub method: HttpMethod,
    pub users: u32,
    pub target_requests: Option<u64>,
    pub target_duration_secs: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub aggregate: RunAggregate,
}

/// A run joined with its (possibly deleted) endpoint and project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    pub run: Run,
    pub endpoint: Option<Endpoint>,
    pub project: Option<Project>,
}

/// A run together with its persisted timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTimeline {
    pub run: Run,
    pub snapshots: Vec<Snapshot>,
}

/// Filters for the run search operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    #[serde(default)]
    pub endpoint_id: Option<i64>,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Cross-run statistics, optionally filtered by project or endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatistics {
    pub total_runs: u64,
    pub running_runs: u64,
    pub completed_runs: u64,
    pub failed_runs: u64,
    pub cancelled_runs: u64,
    pub total_requests: u64,
    /// Mean of per-run average latency across completed runs.
    pub average_response_time: f64,
    /// Mean of per-run peak RPS across completed runs.
    pub average_rps: f64,
}

/// Version tag written into every export file.
pub const EXPORT_VERSION: &str = "1.0";

/// Top level of the export format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub project: ExportedProject,
}

/// A project as it appears in an export file. A missing `name` makes the
/// whole import invalid; every other field is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    #[serde(default)]
    pub endpoints: Vec<ExportedEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedEndpoint {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default = "default_users")]
    pub users: u32,
    #[serde(default)]
    pub requests: Option<u64>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    /// Historical runs of this endpoint. Snapshots are ephemeral telemetry
    /// and are never exported.
    #[serde(default)]
    pub executions: Vec<ExportedRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedRun {
    pub token: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub users: u32,
    #[serde(default)]
    pub target_requests: Option<u64>,
    #[serde(default)]
    pub target_duration_secs: Option<u64>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub aggregate: RunAggregate,
}

const TOKEN_CHARS: &[u8] = b"0123456789abcdef";
const TOKEN_LEN: usize = 24;

/// Generates an opaque run token: 24 lowercase hex characters.
pub fn generate_run_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_CHARS[rng.gen_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}

/// A request counts as successful iff its status code is in [200, 300).
pub fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}
