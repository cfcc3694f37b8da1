//! Device key checks, host filtering, session tokens and password hashing.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::AuthConfig;
use crate::server::AppState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::schema;

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on session lifetime (100 years).
const MAX_SESSION_AGE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Constant-time comparison of a header value against its expected value.
/// An empty expected value never matches.
fn header_matches(headers: &HeaderMap, name: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let provided = headers
        .get(name)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    provided.ct_eq(expected.as_bytes()).into()
}

/// The application ID must match, plus either the REST API key or the client key.
pub fn check_device_keys(headers: &HeaderMap, auth: &AuthConfig) -> ApiResult<()> {
    let app_id = header_matches(headers, &auth.application_id_header, &auth.application_id);
    let rest_key = header_matches(headers, &auth.rest_api_key_header, &auth.rest_api_key);
    let client_key = header_matches(headers, &auth.client_key_header, &auth.client_key);

    if app_id && (rest_key || client_key) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Match a `Host` header (port stripped) against the allowed host list.
///
/// `"*"` allows everything; a leading dot allows the domain and every
/// subdomain.
pub fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = strip_port(host).to_ascii_lowercase();
    allowed.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        if pattern == "*" {
            true
        } else if let Some(domain) = pattern.strip_prefix('.') {
            host == domain || host.ends_with(&pattern)
        } else {
            host == pattern
        }
    })
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Middleware rejecting requests whose `Host` is not allowed.
pub async fn require_allowed_host(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default();

    if !host_allowed(host, &state.config.allowed_hosts) {
        warn!("Rejected request for host {:?}", host);
        return ApiError::InvalidHost.into_response();
    }
    next.run(request).await
}

// ─── Passwords ──────────────────────────────────────────────────────────────

/// Hash a password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
        .map_err(|e| ApiError::Internal(format!("salt: {}", e)))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(format!("password hash: {}", e)))?;
    Ok(hash.to_string())
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

// ─── Sessions ───────────────────────────────────────────────────────────────

/// Session tokens are stored as HMAC-SHA256(secret_key, token), hex encoded.
pub fn hash_token(secret: &str, token: &str) -> ApiResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::Internal(format!("hmac: {}", e)))?;
    mac.update(token.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Issue a new session for `user_id` and return the client token.
pub fn create_session(
    conn: &Connection,
    secret: &str,
    user_id: &str,
    max_age_secs: u64,
) -> ApiResult<String> {
    let token = format!("r:{}", URL_SAFE_NO_PAD.encode(rand::random::<[u8; 24]>()));
    let now = Utc::now();
    let expires = now + Duration::seconds(max_age_secs.min(MAX_SESSION_AGE_SECS) as i64);
    conn.execute(
        "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            hash_token(secret, &token)?,
            user_id,
            schema::format_timestamp(&now),
            schema::format_timestamp(&expires),
        ],
    )?;
    Ok(token)
}

/// User ID bound to a live session token, if any.
pub fn resolve_session(conn: &Connection, secret: &str, token: &str) -> ApiResult<Option<String>> {
    let user_id = conn
        .query_row(
            "SELECT user_id FROM sessions WHERE token_hash = ?1 AND expires_at > ?2",
            params![hash_token(secret, token)?, schema::now_iso()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(user_id)
}

pub fn end_session(conn: &Connection, secret: &str, token: &str) -> ApiResult<()> {
    conn.execute(
        "DELETE FROM sessions WHERE token_hash = ?1",
        [hash_token(secret, token)?],
    )?;
    Ok(())
}

/// Drop expired sessions. Returns the number removed.
pub fn purge_expired_sessions(conn: &Connection) -> ApiResult<usize> {
    let removed = conn.execute(
        "DELETE FROM sessions WHERE expires_at <= ?1",
        [schema::now_iso()],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::db;
    use axum::http::HeaderValue;

    fn auth() -> AuthConfig {
        AuthConfig {
            application_id: "app".into(),
            rest_api_key: "rest".into(),
            client_key: "client".into(),
            ..AuthConfig::default()
        }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn device_keys_accept_either_key() {
        let auth = auth();
        let rest = headers(&[("x-parse-application-id", "app"), ("x-parse-rest-api-key", "rest")]);
        let client = headers(&[("x-parse-application-id", "app"), ("x-parse-client-key", "client")]);
        assert!(check_device_keys(&rest, &auth).is_ok());
        assert!(check_device_keys(&client, &auth).is_ok());
    }

    #[test]
    fn device_keys_reject_bad_or_missing() {
        let auth = auth();
        let no_key = headers(&[("x-parse-application-id", "app")]);
        let wrong_app = headers(&[("x-parse-application-id", "other"), ("x-parse-rest-api-key", "rest")]);
        let wrong_key = headers(&[("x-parse-application-id", "app"), ("x-parse-rest-api-key", "nope")]);
        assert!(matches!(check_device_keys(&no_key, &auth), Err(ApiError::Unauthorized)));
        assert!(check_device_keys(&wrong_app, &auth).is_err());
        assert!(check_device_keys(&wrong_key, &auth).is_err());
        assert!(check_device_keys(&HeaderMap::new(), &auth).is_err());
    }

    #[test]
    fn empty_expected_key_never_matches() {
        let auth = AuthConfig {
            application_id: "app".into(),
            rest_api_key: "rest".into(),
            ..AuthConfig::default()
        };
        let empty_client = headers(&[("x-parse-application-id", "app"), ("x-parse-client-key", "")]);
        assert!(check_device_keys(&empty_client, &auth).is_err());
    }

    #[test]
    fn host_patterns() {
        let allowed = vec!["localhost".to_string(), ".hydrate.example".to_string()];
        assert!(host_allowed("localhost", &allowed));
        assert!(host_allowed("localhost:8001", &allowed));
        assert!(host_allowed("hydrate.example", &allowed));
        assert!(host_allowed("api.hydrate.example", &allowed));
        assert!(host_allowed("API.Hydrate.Example:443", &allowed));
        assert!(!host_allowed("evilhydrate.example", &allowed));
        assert!(!host_allowed("127.0.0.1", &allowed));
        assert!(host_allowed("anything", &["*".to_string()]));
        assert!(host_allowed("[::1]:8001", &["[::1]".to_string()]));
    }

    #[test]
    fn password_hashing() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(&hash, "hunter2"));
        assert!(!verify_password(&hash, "hunter3"));
        assert!(!verify_password("not-a-phc-string", "hunter2"));
    }

    #[test]
    fn session_lifecycle() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::migrate(&mut conn).unwrap();

        let token = create_session(&conn, "secret", "u1", 3600).unwrap();
        assert!(token.starts_with("r:"));
        assert_eq!(resolve_session(&conn, "secret", &token).unwrap().as_deref(), Some("u1"));
        // Another secret derives a different hash
        assert!(resolve_session(&conn, "other", &token).unwrap().is_none());

        let stored: String = conn
            .query_row("SELECT token_hash FROM sessions", [], |row| row.get(0))
            .unwrap();
        assert_ne!(stored, token);
        assert_eq!(stored.len(), 64);

        end_session(&conn, "secret", &token).unwrap();
        assert!(resolve_session(&conn, "secret", &token).unwrap().is_none());
    }

    #[test]
    fn expired_sessions_do_not_resolve() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::migrate(&mut conn).unwrap();
        let token = create_session(&conn, "secret", "u1", 0).unwrap();
        assert!(resolve_session(&conn, "secret", &token).unwrap().is_none());
        assert_eq!(purge_expired_sessions(&conn).unwrap(), 1);
    }
}
