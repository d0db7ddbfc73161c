//! Preflight bearer-token acquisition.
//!
//! Before a run that requires auth, a single HTTP request is made against the
//! auth spec's URL. The response body is parsed as JSON, the token is located
//! at a dot-separated path of object keys, prefixed with the spec's header
//! prefix, and injected as a header on every subsequent load request. Any
//! failure here aborts the run before the first worker starts.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::client;
use crate::model::AuthSpec;

const AUTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Why the token fetch failed.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Authentication endpoint rejected the request with status {0}")]
    Rejected(u16),

    #[error("Authentication response is not valid JSON: {0}")]
    BadResponse(String),

    #[error("Token path '{0}' not found in authentication response")]
    TokenMissing(String),

    #[error("Authentication request failed: {0}")]
    Transport(String),
}

/// A fetched token, ready to inject: `header_name: value`.
#[derive(Debug, Clone)]
pub struct BearerToken {
    pub header_name: String,
    pub value: String,
}

/// Performs the preflight auth call described by `spec`.
///
/// TLS verification is skipped iff `insecure` is set, matching the policy of
/// the run the token is fetched for.
pub async fn fetch_token(spec: &AuthSpec, insecure: bool) -> Result<BearerToken, AuthError> {
    let http = client::build_client(insecure, Some(AUTH_REQUEST_TIMEOUT))
        .map_err(|e| AuthError::Transport(e.to_string()))?;

    debug!(url = %spec.url, method = %spec.method, "Fetching auth token");

    let mut request = http
        .request(client::reqwest_method(spec.method), &spec.url)
        .header("Content-Type", &spec.content_type);

    if let Some(headers) = &spec.headers {
        let map = client::header_map(headers).map_err(AuthError::Transport)?;
        request = request.headers(map);
    }
    if let Some(body) = &spec.body {
        request = request.body(body.clone());
    }

    let response = request
        .send()
        .await
        .map_err(|e| AuthError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::Rejected(status.as_u16()));
    }

    let text = response
        .text()
        .await
        .map_err(|e| AuthError::Transport(e.to_string()))?;
    let document: Value =
        serde_json::from_str(&text).map_err(|e| AuthError::BadResponse(e.to_string()))?;

    let token = value_at_path(&document, &spec.token_path)
        .ok_or_else(|| AuthError::TokenMissing(spec.token_path.clone()))?;

    info!(header = %spec.header_name, "Auth token acquired");

    Ok(BearerToken {
        header_name: spec.header_name.clone(),
        value: format!("{}{}", spec.header_prefix, token),
    })
}

/// Walks `path` (dot-separated object keys from the root) through a JSON
/// document. Strings are returned verbatim; any other leaf is rendered in
/// its JSON text form, which carries no surrounding quotes.
fn value_at_path(document: &Value, path: &str) -> Option<String> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(match current {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_nested_object_keys() {
        let doc = json!({"data": {"token": "abc"}});
        assert_eq!(value_at_path(&doc, "data.token").unwrap(), "abc");
    }

    #[test]
    fn single_segment_path_reads_the_root_object() {
        let doc = json!({"access_token": "xyz"});
        assert_eq!(value_at_path(&doc, "access_token").unwrap(), "xyz");
    }

    #[test]
    fn non_string_leaves_render_without_quotes() {
        let doc = json!({"session": {"id": 12345, "active": true}});
        assert_eq!(value_at_path(&doc, "session.id").unwrap(), "12345");
        assert_eq!(value_at_path(&doc, "session.active").unwrap(), "true");
    }

    #[test]
    fn missing_segment_yields_none() {
        let doc = json!({"data": {"token": "abc"}});
        assert!(value_at_path(&doc, "data.missing").is_none());
        assert!(value_at_path(&doc, "missing.token").is_none());
    }

    #[test]
    fn path_through_a_non_object_yields_none() {
        let doc = json!({"data": "flat"});
        assert!(value_at_path(&doc, "data.token").is_none());
    }
}
