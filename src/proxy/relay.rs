//! Single-attempt forwarding to the vendor API.

use std::time::Duration;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

use crate::error::{Result, SipGuardError};

/// Response headers that describe the upstream connection, not the payload.
fn is_hop_by_hop(name: &header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "transfer-encoding" | "keep-alive" | "content-length"
    )
}

/// A redacted request ready to be sent upstream.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path plus query string, appended verbatim to the base URL.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The upstream answer, passed back to the device unchanged.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for UpstreamResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        for (name, value) in self.headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        response
    }
}

/// Upstream failures surfaced to the device.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream unreachable: {0}")]
    Unreachable(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Unreachable(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// HTTP client bound to a fixed upstream base URL.
#[derive(Debug, Clone)]
pub struct UpstreamRelay {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl UpstreamRelay {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SipGuardError::Server(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send `request` once. Non-2xx upstream statuses are a successful relay.
    pub async fn forward(
        &self,
        request: OutboundRequest,
    ) -> std::result::Result<UpstreamResponse, RelayError> {
        let url = format!("{}{}", self.base_url, request.path_and_query);
        let response = self
            .client
            .request(request.method, &url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| self.classify(&url, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.classify(&url, e))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> RelayError {
        warn!("Upstream request to {} failed: {}", url, err);
        if err.is_timeout() {
            RelayError::Timeout(self.timeout)
        } else {
            RelayError::Unreachable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn relay_errors_map_to_gateway_statuses() {
        assert_eq!(
            RelayError::Timeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::Unreachable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn relay_error_body_is_json() {
        let response = RelayError::Unreachable("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("connection refused"));
    }

    #[test]
    fn passthrough_drops_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("99"));
        headers.insert("x-parse-request-id", HeaderValue::from_static("r1"));

        let response = UpstreamResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"{}"),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        let headers = response.headers();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get("x-parse-request-id").unwrap(), "r1");
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let relay = UpstreamRelay::new("https://api.vendor.example/", Duration::from_secs(5)).unwrap();
        assert_eq!(relay.base_url(), "https://api.vendor.example");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = UpstreamRelay::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        let err = relay
            .forward(OutboundRequest {
                method: Method::GET,
                path_and_query: "/parse/config".into(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
