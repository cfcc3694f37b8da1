//! Request extraction shared by every authenticated API endpoint.

use std::collections::HashMap;

use axum::extract::{FromRequest, Query, Request};
use axum::http::Method;
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::server::AppState;
use crate::server::accounts::{self, UserRecord};
use crate::server::auth;
use crate::server::error::{ApiError, ApiResult};

/// An API call after device-key checks and body decoding.
///
/// The Parse SDK tunnels some calls through `POST` with a `_method` body
/// field; [`ApiRequest::method`] is the effective method. When the override
/// turns a call into a `GET`, the body doubles as the query parameters.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub data: Map<String, Value>,
    pub params: Map<String, Value>,
    pub session_token: Option<String>,
}

/// Decode a request body: empty means `{}`, anything else must be a JSON object.
pub fn parse_body(body: &[u8]) -> ApiResult<Map<String, Value>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(ApiError::InvalidJson),
    }
}

impl FromRequest<AppState> for ApiRequest {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        auth::check_device_keys(&parts.headers, &state.config.auth)?;

        let Query(query) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map_err(|_| ApiError::invalid("invalid query"))?;
        let mut params: Map<String, Value> = query
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        let bytes = axum::body::to_bytes(body, state.config.max_body_bytes)
            .await
            .map_err(|_| ApiError::InvalidJson)?;
        let mut data = parse_body(&bytes)?;

        let mut method = parts.method;
        if let Some(overridden) = data.shift_remove("_method") {
            let name = overridden
                .as_str()
                .map(str::to_ascii_uppercase)
                .ok_or(ApiError::InvalidJson)?;
            let overridden =
                Method::from_bytes(name.as_bytes()).map_err(|_| ApiError::InvalidJson)?;
            if overridden == Method::GET && method != Method::GET {
                for (key, value) in &data {
                    params.insert(key.clone(), value.clone());
                }
            }
            method = overridden;
        }

        let session_token = parts
            .headers
            .get(state.config.auth.session_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(ApiRequest {
            method,
            data,
            params,
            session_token,
        })
    }
}

impl ApiRequest {
    /// A string parameter from the query (or overriding body).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// The user behind the session token, if the session is live.
    pub fn session_user(&self, conn: &Connection, state: &AppState) -> ApiResult<Option<UserRecord>> {
        let Some(token) = self.session_token.as_deref() else {
            return Ok(None);
        };
        match auth::resolve_session(conn, &state.config.secret_key, token)? {
            Some(user_id) => accounts::get_user(conn, &user_id),
            None => Ok(None),
        }
    }

    pub fn require_user(&self, conn: &Connection, state: &AppState) -> ApiResult<UserRecord> {
        self.session_user(conn, state)?.ok_or(ApiError::LoginRequired)
    }
}
