//! MITM forwarding proxy.
//!
//! Every inbound request is optionally logged in its raw form, stripped of
//! sensitive fields by the [`RuleSet`] and relayed once to the vendor API.
//! The upstream response is passed back unchanged, except for `/parse/config`
//! whose `params` receive the configured overrides.

pub mod relay;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::any;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{Result, SipGuardError};
use crate::logging::{RequestLogger, RequestRecord};
use crate::redact::RuleSet;

pub use relay::{OutboundRequest, RelayError, UpstreamRelay, UpstreamResponse};

const DEFAULT_BODY_LIMIT: usize = 10_000_000;

const CONFIG_PATH: &str = "/parse/config";

/// Normalize a blocked path entry: relative entries live under `/parse/`,
/// and a trailing slash is ignored.
fn normalize_blocked_path(path: &str) -> String {
    let path = path.trim().trim_end_matches('/');
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/parse/{}", path)
    }
}

/// Apply `overrides` to the `params` object of a `/parse/config` body.
///
/// Returns `None` when the body is not JSON or has no `params` object.
fn rewrite_config(body: &[u8], overrides: &Map<String, Value>) -> Option<Bytes> {
    let mut config: Value = serde_json::from_slice(body).ok()?;
    let params = config.get_mut("params")?.as_object_mut()?;
    for (key, value) in overrides {
        params.insert(key.clone(), value.clone());
    }
    serde_json::to_vec(&config).ok().map(Bytes::from)
}

/// Shared state for the proxy handlers. Everything in it is read-only.
#[derive(Clone)]
pub struct MitmState {
    pub rules: Arc<RuleSet>,
    pub logger: RequestLogger,
    pub relay: UpstreamRelay,
    pub blocked_paths: Arc<HashSet<String>>,
    /// Keys forced into the `params` of `/parse/config` responses.
    pub config_overrides: Arc<Map<String, Value>>,
}

impl MitmState {
    fn is_blocked(&self, path: &str) -> bool {
        self.blocked_paths.contains(path.trim_end_matches('/'))
    }
}

/// Build the proxy router: `/` answers locally, everything else is forwarded.
pub fn router(state: MitmState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", any(root_handler))
        .fallback(forward_handler)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

pub struct MitmServer {
    listen_addr: String,
    rules: RuleSet,
    logger: RequestLogger,
    relay: Option<UpstreamRelay>,
    blocked_paths: Vec<String>,
    config_overrides: Map<String, Value>,
    max_body_bytes: usize,
}

impl MitmServer {
    pub fn new(listen_addr: String) -> Self {
        Self {
            listen_addr,
            rules: RuleSet::default(),
            logger: RequestLogger::disabled(),
            relay: None,
            blocked_paths: Vec::new(),
            config_overrides: Map::new(),
            max_body_bytes: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_logger(mut self, logger: RequestLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_relay(mut self, relay: UpstreamRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_blocked_paths(mut self, paths: Vec<String>) -> Self {
        self.blocked_paths = paths;
        self
    }

    pub fn with_config_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.config_overrides = overrides;
        self
    }

    pub fn with_body_limit(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Start the proxy server and return the actual bound address.
    pub async fn start(self) -> Result<SocketAddr> {
        let relay = self
            .relay
            .ok_or_else(|| SipGuardError::ConfigInvalid("no upstream configured".to_string()))?;

        let upstream = relay.base_url().to_string();
        let state = MitmState {
            rules: Arc::new(self.rules),
            logger: self.logger,
            relay,
            blocked_paths: Arc::new(
                self.blocked_paths
                    .iter()
                    .map(|p| normalize_blocked_path(p))
                    .collect(),
            ),
            config_overrides: Arc::new(self.config_overrides),
        };
        let app = router(state, self.max_body_bytes);

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("sipguard MITM proxy listening on {} -> {}", local_addr, upstream);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("MITM server stopped: {}", e);
            }
        });

        Ok(local_addr)
    }
}

/// `/` - local liveness answer, never forwarded.
async fn root_handler(method: Method) -> String {
    format!("success {}", method)
}

async fn forward_handler(
    State(state): State<MitmState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();

    let mut log_id = None;
    if state.logger.is_enabled() {
        let record = RequestRecord::capture(&method, &uri, &headers, &body);
        match state.logger.record(record).await {
            Ok(id) => log_id = id,
            Err(e) => warn!("Failed to log {} {}: {}", method, path, e),
        }
    }

    let (status, body, response) = if state.is_blocked(&path) {
        info!("{} {} -> blocked", method, path);
        let body = serde_json::json!({"result": []});
        let bytes = body.to_string().into_bytes();
        (
            StatusCode::ACCEPTED,
            bytes,
            (StatusCode::ACCEPTED, Json(body)).into_response(),
        )
    } else {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());

        let outbound = OutboundRequest {
            method: method.clone(),
            path_and_query,
            headers: state.rules.filter_headers(&headers),
            body: state.rules.redact_body(&path, &body),
        };

        match state.relay.forward(outbound).await {
            Ok(mut response) => {
                info!("{} {} -> {}", method, path, response.status);
                if path.trim_end_matches('/') == CONFIG_PATH && !state.config_overrides.is_empty() {
                    match rewrite_config(&response.body, &state.config_overrides) {
                        Some(rewritten) => response.body = rewritten,
                        None => warn!("{} response has no params object; passed through", CONFIG_PATH),
                    }
                }
                (response.status, response.body.to_vec(), response.into_response())
            }
            Err(e) => {
                let body = serde_json::json!({"error": e.to_string()});
                (e.status(), body.to_string().into_bytes(), e.into_response())
            }
        }
    };

    if let Some(id) = log_id {
        if let Err(e) = state.logger.record_response(id, status, body).await {
            warn!("Failed to log response for {} {}: {}", method, path, e);
        }
    }
    response
}
