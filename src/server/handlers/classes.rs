//! `/parse/classes/*` endpoints other than `_User`.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::Method;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::{created, fetch_owned, prepare_new, prepare_update, updated, with_fields};
use crate::server::AppState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::query::{self, ListQuery};
use crate::server::request::ApiRequest;
use crate::server::schema::{self, BOTTLE, ClassSpec, DAY, HEALTH_STATS, INSTALLATION, LOCATION, SIP};
use crate::server::store::{self, StoredObject};
use crate::server::totals;

// ─── Shared ─────────────────────────────────────────────────────────────────

type Render = fn(&StoredObject) -> Value;

/// Owned objects of `class` filtered by the request's `where`/`order`/`limit`.
fn list_owned(
    conn: &Connection,
    class: &ClassSpec,
    user_id: &str,
    params: &Map<String, Value>,
    render: Render,
) -> ApiResult<Value> {
    let query = ListQuery::parse(class, params, &mut |c, id| store::exists(conn, c, id))?;
    let objects = query.apply(store::list_owned(conn, class, user_id)?);
    let results: Vec<Value> = objects.iter().map(render).collect();
    Ok(json!({ "results": results }))
}

fn create_owned(
    conn: &Connection,
    class: &ClassSpec,
    user_id: &str,
    payload: &Map<String, Value>,
) -> ApiResult<StoredObject> {
    let object = prepare_new(conn, class, Some(user_id), payload)?;
    store::insert(conn, class, &object)?;
    debug!("Created {} {}", class.name, object.id);
    Ok(object)
}

fn update_owned(
    conn: &Connection,
    class: &ClassSpec,
    id: &str,
    user_id: &str,
    payload: &Map<String, Value>,
) -> ApiResult<StoredObject> {
    let mut object = fetch_owned(conn, class, id, user_id)?;
    prepare_update(conn, class, &mut object, payload)?;
    store::save(conn, class, &mut object)?;
    Ok(object)
}

fn delete_owned(conn: &Connection, class: &ClassSpec, id: &str, user_id: &str) -> ApiResult<StoredObject> {
    let object = fetch_owned(conn, class, id, user_id)?;
    store::delete(conn, class, id)?;
    debug!("Deleted {} {}", class.name, id);
    Ok(object)
}

// ─── Sip ────────────────────────────────────────────────────────────────────

fn day_of(sip: &StoredObject) -> ApiResult<String> {
    sip.data
        .get("day")
        .and_then(schema::pointer_id)
        .map(str::to_string)
        .ok_or_else(|| ApiError::invalid("missing day"))
}

/// Day totals and health stats follow every Sip write.
fn refresh_totals(conn: &Connection, user_id: &str, day_ids: &[&str]) -> ApiResult<()> {
    for day_id in day_ids {
        totals::recompute_day(conn, day_id)?;
    }
    totals::recompute_health_stats(conn, user_id)
}

fn create_sip(conn: &mut Connection, user_id: &str, payload: &Map<String, Value>) -> ApiResult<Value> {
    let tx = conn.transaction()?;
    let sip = prepare_new(&tx, &SIP, Some(user_id), payload)?;
    let day_id = day_of(&sip)?;
    fetch_owned(&tx, &DAY, &day_id, user_id)?;
    store::insert(&tx, &SIP, &sip)?;
    refresh_totals(&tx, user_id, &[&day_id])?;
    tx.commit()?;

    info!("Recorded sip {} on day {}", sip.id, day_id);
    Ok(with_fields(created(&sip), &sip, &["time"]))
}

fn update_sip(conn: &mut Connection, id: &str, user_id: &str, payload: &Map<String, Value>) -> ApiResult<Value> {
    let tx = conn.transaction()?;
    let mut sip = fetch_owned(&tx, &SIP, id, user_id)?;
    let old_day = day_of(&sip)?;
    prepare_update(&tx, &SIP, &mut sip, payload)?;
    let new_day = day_of(&sip)?;
    if new_day != old_day {
        fetch_owned(&tx, &DAY, &new_day, user_id)?;
    }
    store::save(&tx, &SIP, &mut sip)?;
    refresh_totals(&tx, user_id, &[&old_day, &new_day])?;
    tx.commit()?;
    Ok(with_fields(updated(&sip), &sip, &["time"]))
}

fn delete_sip(conn: &mut Connection, id: &str, user_id: &str) -> ApiResult<Value> {
    let tx = conn.transaction()?;
    let sip = delete_owned(&tx, &SIP, id, user_id)?;
    let day_id = day_of(&sip)?;
    refresh_totals(&tx, user_id, &[&day_id])?;
    tx.commit()?;
    Ok(json!({}))
}

/// `/parse/classes/Sip`
pub async fn sips(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            match req.method {
                Method::POST => create_sip(conn, user.id(), &req.data),
                Method::GET => list_owned(conn, &SIP, user.id(), &req.params, StoredObject::to_json),
                _ => Err(ApiError::MethodNotAllowed),
            }
        })
        .await?;
    Ok(Json(body))
}

/// `/parse/classes/Sip/{id}`
pub async fn sip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: ApiRequest,
) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            match req.method {
                Method::GET => Ok(fetch_owned(conn, &SIP, &id, user.id())?.to_json()),
                Method::PUT => update_sip(conn, &id, user.id(), &req.data),
                Method::DELETE => delete_sip(conn, &id, user.id()),
                _ => Err(ApiError::MethodNotAllowed),
            }
        })
        .await?;
    Ok(Json(body))
}

// ─── Bottle ─────────────────────────────────────────────────────────────────

/// `/parse/classes/Bottle`
pub async fn bottles(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            match req.method {
                Method::POST => {
                    let bottle = create_owned(conn, &BOTTLE, user.id(), &req.data)?;
                    Ok(with_fields(created(&bottle), &bottle, &["lastSynced", "shouldUpdate"]))
                }
                Method::GET => list_owned(conn, &BOTTLE, user.id(), &req.params, StoredObject::to_json),
                _ => Err(ApiError::MethodNotAllowed),
            }
        })
        .await?;
    Ok(Json(body))
}

/// `/parse/classes/Bottle/{id}`
pub async fn bottle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: ApiRequest,
) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            match req.method {
                Method::GET => Ok(fetch_owned(conn, &BOTTLE, &id, user.id())?.to_json()),
                Method::PUT => {
                    let bottle = update_owned(conn, &BOTTLE, &id, user.id(), &req.data)?;
                    Ok(with_fields(updated(&bottle), &bottle, &["lastSynced"]))
                }
                Method::DELETE => {
                    delete_owned(conn, &BOTTLE, &id, user.id())?;
                    Ok(json!({}))
                }
                _ => Err(ApiError::MethodNotAllowed),
            }
        })
        .await?;
    Ok(Json(body))
}

// ─── Location ───────────────────────────────────────────────────────────────

/// `/parse/classes/Location`
pub async fn locations(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            if req.method != Method::POST {
                return Err(ApiError::MethodNotAllowed);
            }
            let location = create_owned(conn, &LOCATION, user.id(), &req.data)?;
            Ok(created(&location))
        })
        .await?;
    Ok(Json(body))
}

/// `/parse/classes/Location/{id}`
pub async fn location(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: ApiRequest,
) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            match req.method {
                Method::GET => Ok(fetch_owned(conn, &LOCATION, &id, user.id())?.to_json()),
                Method::PUT => Ok(updated(&update_owned(conn, &LOCATION, &id, user.id(), &req.data)?)),
                Method::DELETE => {
                    delete_owned(conn, &LOCATION, &id, user.id())?;
                    Ok(json!({}))
                }
                _ => Err(ApiError::MethodNotAllowed),
            }
        })
        .await?;
    Ok(Json(body))
}

// ─── Day ────────────────────────────────────────────────────────────────────

pub(crate) fn day_json(day: &StoredObject) -> Value {
    let mut body = day.to_json();
    if let Value::Object(map) = &mut body {
        let used = day.data.get("isLocationUsed").cloned().unwrap_or(Value::Bool(false));
        map.insert("locationUsed".to_string(), used);
    }
    body
}

fn update_day(conn: &mut Connection, id: &str, user_id: &str, payload: &Map<String, Value>) -> ApiResult<Value> {
    let tx = conn.transaction()?;
    let day = update_owned(&tx, &DAY, id, user_id, payload)?;
    totals::recompute_health_stats(&tx, user_id)?;
    tx.commit()?;
    Ok(with_fields(updated(&day), &day, &["recommendedGoal", "goal", "totalBottleAmount"]))
}

fn delete_day(conn: &mut Connection, id: &str, user_id: &str) -> ApiResult<Value> {
    let tx = conn.transaction()?;
    delete_owned(&tx, &DAY, id, user_id)?;
    let sips = store::delete_children(&tx, &SIP, id)?;
    totals::recompute_health_stats(&tx, user_id)?;
    tx.commit()?;
    debug!("Deleted day {} with {} sips", id, sips);
    Ok(json!({}))
}

/// `/parse/classes/Day`
///
/// Listing first makes sure the current week has a Day per date.
pub async fn days(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            if req.method != Method::GET {
                return Err(ApiError::MethodNotAllowed);
            }
            let goal = totals::effective_goal(&user.object.data);
            totals::ensure_week(conn, user.id(), goal, Utc::now().date_naive())?;
            list_owned(conn, &DAY, user.id(), &req.params, day_json)
        })
        .await?;
    Ok(Json(body))
}

/// `/parse/classes/Day/{id}`
pub async fn day(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: ApiRequest,
) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            match req.method {
                Method::GET => Ok(day_json(&fetch_owned(conn, &DAY, &id, user.id())?)),
                Method::PUT => update_day(conn, &id, user.id(), &req.data),
                Method::DELETE => delete_day(conn, &id, user.id()),
                _ => Err(ApiError::MethodNotAllowed),
            }
        })
        .await?;
    Ok(Json(body))
}

// ─── UserHealthStats ────────────────────────────────────────────────────────

fn health_stats_json(stats: &StoredObject) -> Value {
    let mut body = stats.to_json();
    if let (Value::Object(map), Some(owner)) = (&mut body, stats.owner_id.as_deref()) {
        map.insert("user_id".to_string(), json!(owner));
    }
    body
}

fn list_health_stats(conn: &Connection, user_id: &str, params: &Map<String, Value>) -> ApiResult<Value> {
    let user_filter = match query::parse_where(params)? {
        Some(conditions) => match conditions.get("user_id") {
            None => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => return Err(ApiError::invalid("invalid where")),
        },
        None => None,
    };
    let mut params = params.clone();
    params.shift_remove("where");

    let query = ListQuery::parse(&HEALTH_STATS, &params, &mut |c, id| store::exists(conn, c, id))?;
    let mut objects = store::list_owned(conn, &HEALTH_STATS, user_id)?;
    if let Some(filter) = user_filter {
        objects.retain(|stats| stats.is_owned_by(&filter));
    }
    let results: Vec<Value> = query.apply(objects).iter().map(health_stats_json).collect();
    Ok(json!({ "results": results }))
}

/// `/parse/classes/UserHealthStats`
///
/// `where` only understands `user_id`; other keys are ignored.
pub async fn health_stats_list(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            if req.method != Method::GET {
                return Err(ApiError::MethodNotAllowed);
            }
            list_health_stats(conn, user.id(), &req.params)
        })
        .await?;
    Ok(Json(body))
}

/// `/parse/classes/UserHealthStats/{id}`
pub async fn health_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: ApiRequest,
) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            if req.method != Method::PUT {
                return Err(ApiError::MethodNotAllowed);
            }
            let stats = update_owned(conn, &HEALTH_STATS, &id, user.id(), &req.data)?;
            Ok(updated(&stats))
        })
        .await?;
    Ok(Json(body))
}

// ─── Installation ───────────────────────────────────────────────────────────

/// `/parse/classes/_Installation`
///
/// Installations are registered before login; a session, when present,
/// becomes the owner.
pub async fn installations(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    if req.method != Method::POST {
        return Err(ApiError::MethodNotAllowed);
    }
    let body = state
        .run(move |conn, state| {
            let owner = req.session_user(conn, state)?;
            let installation =
                prepare_new(conn, &INSTALLATION, owner.as_ref().map(|u| u.id()), &req.data)?;
            store::insert(conn, &INSTALLATION, &installation)?;
            Ok(created(&installation))
        })
        .await?;
    Ok(Json(body))
}

/// `/parse/classes/_Installation/{id}`
pub async fn installation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: ApiRequest,
) -> ApiResult<Json<Value>> {
    let body = state
        .run(move |conn, _| {
            let mut installation = store::fetch(conn, &INSTALLATION, &id)?;
            match req.method {
                Method::GET => Ok(installation.to_json()),
                Method::PUT => {
                    prepare_update(conn, &INSTALLATION, &mut installation, &req.data)?;
                    store::save(conn, &INSTALLATION, &mut installation)?;
                    Ok(updated(&installation))
                }
                _ => Err(ApiError::MethodNotAllowed),
            }
        })
        .await?;
    Ok(Json(body))
}
