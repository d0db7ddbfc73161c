//! HTTP adapter.
//!
//! Binds the façade operations to JSON endpoints, streams the live feed as
//! Server-Sent Events, and serves the Prometheus text endpoint. URL layout
//! is an adapter concern; the operations themselves are the contract.

use std::collections::HashMap;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info};

use crate::app::App;
use crate::errors::AppError;
use crate::metrics;
use crate::model::{
    AuthSpec, EndpointDraft, ProjectDraft, ProjectExport, RunFilter, RunRequest, RunStatus,
};

/// Payload of the auth-probe operation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthProbe {
    spec: AuthSpec,
    #[serde(default)]
    insecure: bool,
}

/// Serves the API until the process exits.
pub async fn serve(app: Arc<App>, port: u16) -> Result<(), hyper::Error> {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let app = Arc::clone(&app);
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let app = Arc::clone(&app);
                async move { route(app, req).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port = port, addr = %addr, "API server listening");
    server.await
}

async fn route(app: Arc<App>, req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_string();
    let query = parse_query(req.uri().query());
    let parts: Vec<&str> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    };

    debug!(method = %method, path = %path, "Request");

    let response = match (method.as_str(), parts.as_slice()) {
        ("GET", ["metrics"]) => metrics_response(),
        ("GET", ["api", "events"]) => events_response(&app),

        // Run control
        ("POST", ["api", "runs", "endpoint", id]) => match parse_id(id) {
            Ok(id) => {
                let users = match query.get("users").map(|v| v.parse::<u32>()) {
                    Some(Ok(users)) => Some(users),
                    Some(Err(_)) => return Ok(bad_request("Invalid users override")),
                    None => None,
                };
                match app.start_endpoint_run(id, users) {
                    Ok(token) => json_response(StatusCode::ACCEPTED, &json!({ "runToken": token })),
                    Err(e) => error_response(e),
                }
            }
            Err(resp) => resp,
        },
        ("POST", ["api", "runs", "adhoc"]) => match read_json::<RunRequest>(req).await {
            Ok(request) => match app.start_adhoc_run(&request) {
                Ok(token) => json_response(StatusCode::ACCEPTED, &json!({ "runToken": token })),
                Err(e) => error_response(e),
            },
            Err(resp) => resp,
        },
        ("POST", ["api", "runs", "stop"]) => {
            app.stop_run();
            json_response(StatusCode::OK, &json!({ "stopped": true }))
        }
        ("GET", ["api", "runs", "active"]) => json_response(
            StatusCode::OK,
            &json!({
                "running": app.is_running(),
                "runToken": app.active_run_token(),
            }),
        ),

        // Run queries
        ("GET", ["api", "runs", "recent"]) => {
            let limit = query
                .get("limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20);
            respond(app.list_recent_runs(limit))
        }
        ("GET", ["api", "runs"]) => match run_filter_from_query(&query) {
            Ok(filter) => respond(app.search_runs(&filter)),
            Err(resp) => resp,
        },
        ("GET", ["api", "runs", id]) => match parse_id(id) {
            Ok(id) => respond_opt(app.get_run(id)),
            Err(resp) => resp,
        },
        ("GET", ["api", "runs", id, "timeline"]) => match parse_id(id) {
            Ok(id) => respond_opt(app.get_run_timeline(id)),
            Err(resp) => resp,
        },
        ("DELETE", ["api", "runs", id]) => match parse_id(id) {
            Ok(id) => respond_unit(app.delete_run(id)),
            Err(resp) => resp,
        },
        ("GET", ["api", "statistics"]) => {
            let project_id = query.get("projectId").and_then(|v| v.parse().ok());
            let endpoint_id = query.get("endpointId").and_then(|v| v.parse().ok());
            respond(app.run_statistics(project_id, endpoint_id))
        }

        // Auth probe
        ("POST", ["api", "auth", "test"]) => match read_json::<AuthProbe>(req).await {
            Ok(probe) => match app.test_auth(&probe.spec, probe.insecure).await {
                Ok(token) => {
                    json_response(StatusCode::OK, &json!({ "ok": true, "token": token }))
                }
                Err(e) => json_response(
                    StatusCode::OK,
                    &json!({ "ok": false, "error": e.to_string() }),
                ),
            },
            Err(resp) => resp,
        },

        // Projects
        ("GET", ["api", "projects"]) => respond(app.list_projects()),
        ("POST", ["api", "projects"]) => match read_json::<ProjectDraft>(req).await {
            Ok(draft) => respond_created(app.create_project(&draft)),
            Err(resp) => resp,
        },
        ("GET", ["api", "projects", id]) => match parse_id(id) {
            Ok(id) => respond_opt(app.get_project(id)),
            Err(resp) => resp,
        },
        ("PUT", ["api", "projects", id]) => match parse_id(id) {
            Ok(id) => match read_json::<ProjectDraft>(req).await {
                Ok(draft) => respond(app.update_project(id, &draft)),
                Err(resp) => resp,
            },
            Err(resp) => resp,
        },
        ("DELETE", ["api", "projects", id]) => match parse_id(id) {
            Ok(id) => respond_unit(app.delete_project(id)),
            Err(resp) => resp,
        },
        ("PUT", ["api", "projects", id, "auth"]) => match parse_id(id) {
            Ok(id) => match read_json::<AuthSpec>(req).await {
                Ok(spec) => respond(app.set_project_auth(id, &spec)),
                Err(resp) => resp,
            },
            Err(resp) => resp,
        },
        ("DELETE", ["api", "projects", id, "auth"]) => match parse_id(id) {
            Ok(id) => respond(app.clear_project_auth(id)),
            Err(resp) => resp,
        },
        ("GET", ["api", "projects", id, "endpoints"]) => match parse_id(id) {
            Ok(id) => respond(app.list_endpoints(id)),
            Err(resp) => resp,
        },
        ("POST", ["api", "projects", id, "endpoints"]) => match parse_id(id) {
            Ok(id) => match read_json::<EndpointDraft>(req).await {
                Ok(draft) => respond_created(app.create_endpoint(id, &draft)),
                Err(resp) => resp,
            },
            Err(resp) => resp,
        },
        ("GET", ["api", "projects", id, "export"]) => match parse_id(id) {
            Ok(id) => respond(app.export_project(id)),
            Err(resp) => resp,
        },
        ("POST", ["api", "projects", "import"]) => {
            match read_json::<ProjectExport>(req).await {
                Ok(payload) => respond_created(app.import_project(&payload)),
                Err(resp) => resp,
            }
        }

        // Endpoints
        ("GET", ["api", "endpoints", id]) => match parse_id(id) {
            Ok(id) => respond_opt(app.get_endpoint(id)),
            Err(resp) => resp,
        },
        ("PUT", ["api", "endpoints", id]) => match parse_id(id) {
            Ok(id) => match read_json::<EndpointDraft>(req).await {
                Ok(draft) => respond(app.update_endpoint(id, &draft)),
                Err(resp) => resp,
            },
            Err(resp) => resp,
        },
        ("DELETE", ["api", "endpoints", id]) => match parse_id(id) {
            Ok(id) => respond_unit(app.delete_endpoint(id)),
            Err(resp) => resp,
        },

        _ => json_response(
            StatusCode::NOT_FOUND,
            &json!({ "error": "No such operation" }),
        ),
    };

    Ok(response)
}

fn run_filter_from_query(
    query: &HashMap<String, String>,
) -> Result<RunFilter, Response<Body>> {
    let mut filter = RunFilter {
        endpoint_id: query.get("endpointId").and_then(|v| v.parse().ok()),
        project_id: query.get("projectId").and_then(|v| v.parse().ok()),
        limit: query.get("limit").and_then(|v| v.parse().ok()),
        offset: query.get("offset").and_then(|v| v.parse().ok()),
        ..Default::default()
    };
    if let Some(raw) = query.get("status") {
        match raw.parse::<RunStatus>() {
            Ok(status) => filter.status = Some(status),
            Err(e) => return Err(bad_request(&e)),
        }
    }
    for (key, slot) in [("from", &mut filter.from), ("to", &mut filter.to)] {
        if let Some(raw) = query.get(key) {
            match raw.parse() {
                Ok(ts) => *slot = Some(ts),
                Err(_) => {
                    return Err(bad_request(&format!(
                        "Invalid '{}' timestamp; expected RFC 3339",
                        key
                    )))
                }
            }
        }
    }
    Ok(filter)
}

/// Streams the live feed as Server-Sent Events. The forwarding task ends
/// when the client disconnects, which drops the subscription.
fn events_response(app: &Arc<App>) -> Response<Body> {
    let (mut sender, body) = Body::channel();
    let mut subscription = app.subscribe();

    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "Failed to encode stream event");
                    continue;
                }
            };
            let frame = format!("data: {}\n\n", payload);
            if sender.send_data(frame.into()).await.is_err() {
                break;
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .body(body)
        .unwrap()
}

fn metrics_response() -> Response<Body> {
    let (content_type, buffer) = metrics::gather_metrics_text();
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", content_type)
        .body(Body::from(buffer))
        .unwrap()
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| bad_request(&format!("Failed to read request body: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| bad_request(&format!("Invalid JSON body: {}", e)))
}

fn parse_id(raw: &str) -> Result<i64, Response<Body>> {
    raw.parse()
        .map_err(|_| bad_request(&format!("Invalid id '{}'", raw)))
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| {
            let mut iter = pair.splitn(2, '=');
            match (iter.next(), iter.next()) {
                (Some(key), Some(value)) if !key.is_empty() => {
                    Some((key.to_string(), value.to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn bad_request(message: &str) -> Response<Body> {
    json_response(StatusCode::BAD_REQUEST, &json!({ "error": message }))
}

fn respond<T: Serialize>(result: Result<T, AppError>) -> Response<Body> {
    match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => error_response(e),
    }
}

fn respond_created<T: Serialize>(result: Result<T, AppError>) -> Response<Body> {
    match result {
        Ok(value) => json_response(StatusCode::CREATED, &value),
        Err(e) => error_response(e),
    }
}

fn respond_opt<T: Serialize>(result: Result<Option<T>, AppError>) -> Response<Body> {
    match result {
        Ok(Some(value)) => json_response(StatusCode::OK, &value),
        Ok(None) => json_response(StatusCode::NOT_FOUND, &json!({ "error": "Not found" })),
        Err(e) => error_response(e),
    }
}

fn respond_unit(result: Result<(), AppError>) -> Response<Body> {
    match result {
        Ok(()) => json_response(StatusCode::OK, &json!({ "deleted": true })),
        Err(e) => error_response(e),
    }
}

fn error_response(err: AppError) -> Response<Body> {
    let status = match &err {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::RunInProgress => StatusCode::CONFLICT,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Auth(_) => StatusCode::BAD_GATEWAY,
        AppError::Store(_) | AppError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(status, &json!({ "error": err.to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_handles_pairs_and_noise() {
        let parsed = parse_query(Some("users=4&limit=10&flag&=x"));
        assert_eq!(parsed.get("users").unwrap(), "4");
        assert_eq!(parsed.get("limit").unwrap(), "10");
        assert!(!parsed.contains_key("flag"));
        assert!(!parsed.contains_key(""));
    }

    #[test]
    fn run_filter_rejects_bad_status() {
        let mut query = HashMap::new();
        query.insert("status".to_string(), "Exploded".to_string());
        assert!(run_filter_from_query(&query).is_err());
    }

    #[test]
    fn run_filter_reads_ids_and_window() {
        let mut query = HashMap::new();
        query.insert("endpointId".to_string(), "7".to_string());
        query.insert("status".to_string(), "Completed".to_string());
        query.insert("from".to_string(), "2024-01-01T00:00:00Z".to_string());
        let filter = run_filter_from_query(&query).unwrap();
        assert_eq!(filter.endpoint_id, Some(7));
        assert_eq!(filter.status, Some(RunStatus::Completed));
        assert!(filter.from.is_some());
        assert!(filter.to.is_none());
    }
}
