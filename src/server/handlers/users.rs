//! Accounts: signup, login, logout and the `_User` object.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::Method;
use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{created, updated};
use crate::server::AppState;
use crate::server::accounts::{self, UserRecord};
use crate::server::auth;
use crate::server::error::{ApiError, ApiResult};
use crate::server::request::ApiRequest;
use crate::server::schema::{self, HEALTH_STATS, USER};
use crate::server::store::{self, StoredObject};
use crate::server::totals;

/// Split the password out of a user payload.
fn take_password(payload: &mut Map<String, Value>) -> ApiResult<Option<String>> {
    match payload.shift_remove("password") {
        None => Ok(None),
        Some(Value::String(password)) => Ok(Some(password)),
        Some(_) => Err(ApiError::invalid("Invalid type for password")),
    }
}

fn signup(conn: &mut Connection, state: &AppState, payload: &Map<String, Value>) -> ApiResult<Value> {
    let mut payload = payload.clone();
    let password = take_password(&mut payload)?.ok_or_else(|| ApiError::invalid("no password"))?;

    let now = schema::now_iso();
    let mut data = USER.defaults(&now);
    schema::apply_changes(&USER, &mut data, &payload, &mut |c, id| store::exists(conn, c, id))?;
    schema::check_required(&USER, &data)?;
    let user = UserRecord::new(data, auth::hash_password(&password)?);

    let tx = conn.transaction()?;
    accounts::insert_user(&tx, &user)?;
    let mut stats = HEALTH_STATS.defaults(&now);
    stats.insert("user".to_string(), USER.pointer(user.id()));
    store::insert(&tx, &HEALTH_STATS, &StoredObject::new(Some(user.id().to_string()), stats))?;
    let token = auth::create_session(
        &tx,
        &state.config.secret_key,
        user.id(),
        state.config.session_age_secs,
    )?;
    tx.commit()?;

    info!("Signed up user {} ({})", user.username(), user.id());
    let mut body = created(&user.object);
    body["sessionToken"] = json!(token);
    Ok(body)
}

/// `/parse/users` and `/parse/classes/_User`
pub async fn users(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    let method = req.method.clone();
    let body = match method {
        Method::POST => {
            state
                .run(move |conn, state| signup(conn, state, &req.data))
                .await?
        }
        Method::GET => json!({ "results": [] }),
        _ => return Err(ApiError::MethodNotAllowed),
    };
    Ok(Json(body))
}

fn update_user(conn: &mut Connection, user: &mut UserRecord, payload: &Map<String, Value>) -> ApiResult<Value> {
    let mut payload = payload.clone();
    if let Some(password) = take_password(&mut payload)? {
        user.password_hash = auth::hash_password(&password)?;
    }
    let mut data = user.object.data.clone();
    schema::apply_changes(&USER, &mut data, &payload, &mut |c, id| store::exists(conn, c, id))?;
    schema::check_required(&USER, &data)?;
    user.object.data = data;

    let tx = conn.transaction()?;
    accounts::save_user(&tx, user)?;
    // Days from the last twelve hours on pick up the new goal
    let from = (Utc::now() - Duration::hours(12)).date_naive();
    totals::refresh_goals(&tx, user.id(), totals::effective_goal(&user.object.data), from)?;
    tx.commit()?;
    Ok(updated(&user.object))
}

/// `/parse/users/{id}` and `/parse/classes/_User/{id}`
pub async fn user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: ApiRequest,
) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let current = req.require_user(conn, state)?;
            let mut target = accounts::get_user(conn, &id)?.ok_or(ApiError::DoesNotExist)?;
            if target.id() != current.id() {
                return Err(ApiError::NoPermission);
            }

            match req.method {
                Method::GET => {
                    let mut body = target.object.to_json();
                    body["sessionToken"] = json!(req.session_token);
                    Ok(body)
                }
                Method::PUT => update_user(conn, &mut target, &req.data),
                _ => Err(ApiError::MethodNotAllowed),
            }
        })
        .await?;
    Ok(Json(body))
}

/// `/parse/login`: credentials come from the body, then the query string.
pub async fn login(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    if req.method != Method::GET {
        return Err(ApiError::MethodNotAllowed);
    }
    let credential = |name: &str| {
        req.data
            .get(name)
            .and_then(Value::as_str)
            .or_else(|| req.param(name))
            .map(str::to_string)
    };
    let (Some(username), Some(password)) = (credential("username"), credential("password")) else {
        return Err(ApiError::InvalidLogin);
    };

    let body = state
        .run(move |conn, state| {
            let user = accounts::find_by_username(conn, &username)?
                .filter(|user| auth::verify_password(&user.password_hash, &password))
                .ok_or(ApiError::InvalidLogin)?;
            let token = auth::create_session(
                conn,
                &state.config.secret_key,
                user.id(),
                state.config.session_age_secs,
            )?;

            info!("User {} logged in", user.id());
            let mut body = user.object.to_json();
            body["sessionToken"] = json!(token);
            Ok(body)
        })
        .await?;
    Ok(Json(body))
}

/// `/parse/logout`
pub async fn logout(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    if req.method != Method::POST {
        return Err(ApiError::MethodNotAllowed);
    }
    state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            if let Some(token) = req.session_token.as_deref() {
                auth::end_session(conn, &state.config.secret_key, token)?;
            }
            info!("User {} logged out", user.id());
            Ok(())
        })
        .await?;
    Ok(Json(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::db;
    use crate::server::schema::DAY;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState {
            db: db::open_memory_pool().unwrap(),
            config: Arc::new(ServerConfig {
                secret_key: "secret".into(),
                ..ServerConfig::default()
            }),
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn signup_creates_user_stats_and_session() {
        let state = state();
        let mut conn = state.conn().unwrap();
        let body = signup(
            &mut conn,
            &state,
            &payload(json!({"username": "sam", "email": "sam@example.com", "password": "pw"})),
        )
        .unwrap();

        let token = body["sessionToken"].as_str().unwrap();
        let user_id = body["objectId"].as_str().unwrap();
        assert!(token.starts_with("r:"));
        assert!(body["createdAt"].is_string());

        let user = accounts::get_user(&conn, user_id).unwrap().unwrap();
        assert!(auth::verify_password(&user.password_hash, "pw"));
        assert!(!user.object.data.contains_key("password"));
        assert_eq!(store::list_owned(&conn, &HEALTH_STATS, user_id).unwrap().len(), 1);
        assert_eq!(
            auth::resolve_session(&conn, "secret", token).unwrap().as_deref(),
            Some(user_id)
        );
    }

    #[test]
    fn signup_requires_password_and_fields() {
        let state = state();
        let mut conn = state.conn().unwrap();
        let err = signup(&mut conn, &state, &payload(json!({"username": "sam", "email": "s@x"}))).unwrap_err();
        assert_eq!(err.to_string(), "no password");

        let err = signup(&mut conn, &state, &payload(json!({"username": "sam", "password": "pw"}))).unwrap_err();
        assert_eq!(err.to_string(), "missing email");

        let err = signup(
            &mut conn,
            &state,
            &payload(json!({"username": "sam", "email": "s@x", "password": "pw", "colour": "red"})),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Unknown field colour");
    }

    #[test]
    fn update_changes_password_and_refreshes_goals() {
        let state = state();
        let mut conn = state.conn().unwrap();
        let body = signup(
            &mut conn,
            &state,
            &payload(json!({"username": "sam", "email": "sam@example.com", "password": "pw"})),
        )
        .unwrap();
        let user_id = body["objectId"].as_str().unwrap().to_string();
        let today = Utc::now().date_naive();
        let old = NaiveDate::from_ymd_opt(2020, 1, 6).unwrap();
        totals::ensure_week(&conn, &user_id, 2000.0, old).unwrap();
        totals::ensure_week(&conn, &user_id, 2000.0, today).unwrap();

        let mut user = accounts::get_user(&conn, &user_id).unwrap().unwrap();
        let body = update_user(&mut conn, &mut user, &payload(json!({"goal": 2500, "password": "new"}))).unwrap();
        assert_eq!(body["objectId"], json!(user_id));

        let stored = accounts::get_user(&conn, &user_id).unwrap().unwrap();
        assert!(auth::verify_password(&stored.password_hash, "new"));
        assert_eq!(stored.object.data["goal"], json!(2500.0));

        let today_key = today.format("%Y-%m-%d").to_string();
        for day in store::list_owned(&conn, &DAY, &user_id).unwrap() {
            let date = day.data["date"].as_str().unwrap();
            if date >= today_key.as_str() {
                assert_eq!(day.data["goal"], json!(2500.0));
            } else if date < "2021-01-01" {
                assert_eq!(day.data["goal"], json!(2000.0));
            }
        }
    }
}
