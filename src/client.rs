//! Run-scoped HTTP client construction.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// Builds the reqwest client shared by all workers of one run.
///
/// The client lives exactly as long as the run; dropping it releases the
/// connection pool. `insecure` skips TLS certificate verification.
pub fn build_client(
    insecure: bool,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    if insecure {
        warn!("Skipping TLS certificate verification");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build()
}

/// Maps the catalog's closed method set onto reqwest's.
pub fn reqwest_method(method: crate::model::HttpMethod) -> reqwest::Method {
    use crate::model::HttpMethod;
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

/// Converts a stored string map into a validated `HeaderMap`.
///
/// Invalid names or values are an error: a target that cannot be expressed
/// on the wire should fail before the run starts, not per request.
pub fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_str(name)
            .map_err(|e| format!("Invalid header name '{}': {}", name, e))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| format!("Invalid header value for '{}': {}", name, e))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_clients_for_both_tls_policies() {
        assert!(build_client(false, None).is_ok());
        assert!(build_client(true, Some(Duration::from_secs(5))).is_ok());
    }

    #[test]
    fn header_map_converts_valid_headers() {
        let mut headers = HashMap::new();
        headers.insert("X-Trace-Id".to_string(), "abc123".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());

        let map = header_map(&headers).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("x-trace-id").unwrap(), "abc123");
    }

    #[test]
    fn header_map_rejects_invalid_names() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "v".to_string());
        assert!(header_map(&headers).is_err());
    }

    #[test]
    fn header_map_rejects_invalid_values() {
        let mut headers = HashMap::new();
        headers.insert("X-Ok".to_string(), "line\nbreak".to_string());
        assert!(header_map(&headers).is_err());
    }
}
