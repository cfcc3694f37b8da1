//! `/parse/functions/*` cloud functions. All of them are called with `POST`.

use axum::Json;
use axum::extract::State;
use axum::http::Method;
use rusqlite::Connection;
use serde_json::{Map, Value, json};
use tracing::debug;
use uuid::Uuid;

use super::{fetch_owned, prepare_new, prepare_update};
use crate::server::AppState;
use crate::server::accounts;
use crate::server::error::{ApiError, ApiResult};
use crate::server::request::ApiRequest;
use crate::server::schema::{DAY, GLOW};
use crate::server::store::{self, StoredObject};

fn require_post(req: &ApiRequest) -> ApiResult<()> {
    if req.method == Method::POST {
        Ok(())
    } else {
        Err(ApiError::MethodNotAllowed)
    }
}

fn required_param<'a>(req: &'a ApiRequest, name: &str) -> ApiResult<&'a str> {
    req.param(name)
        .ok_or_else(|| ApiError::invalid(format!("{} required", name)))
}

/// `userexists`: whether an account uses the `email` query parameter.
pub async fn user_exists(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    require_post(&req)?;
    let Some(email) = req.param("email").map(str::to_string) else {
        return Ok(Json(json!({})));
    };
    let exists = state
        .run(move |conn, _| accounts::email_exists(conn, &email))
        .await?;
    Ok(Json(json!({
        "result": { "exists": exists, "emailverified": false },
    })))
}

/// `canaddbottle`: every account may pair another bottle.
pub async fn can_add_bottle(req: ApiRequest) -> ApiResult<Json<Value>> {
    require_post(&req)?;
    Ok(Json(json!({
        "result": { "canAdd": true, "bottleData": {} },
    })))
}

fn glow_json(glow: &StoredObject) -> Value {
    let mut body = Map::new();
    for field in ["name", "content"] {
        if let Some(value) = glow.data.get(field) {
            body.insert(field.to_string(), value.clone());
        }
    }
    body.insert("id".to_string(), json!(glow.id));
    Value::Object(body)
}

/// `getmyglows`
pub async fn my_glows(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    require_post(&req)?;
    let glows = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            let glows: Vec<Value> = store::list_owned(conn, &GLOW, user.id())?
                .iter()
                .map(glow_json)
                .collect();
            Ok(glows)
        })
        .await?;
    Ok(Json(json!({ "result": glows })))
}

/// Create or replace a glow. An `id` naming one of the user's glows updates
/// it; any other `id` is discarded and a new glow is created.
fn upsert_glow(conn: &Connection, user_id: &str, data: &Map<String, Value>) -> ApiResult<String> {
    let mut payload = match data.get("glow") {
        Some(Value::Object(glow)) => glow.clone(),
        _ => return Err(ApiError::invalid("missing glow")),
    };
    let existing = match payload.shift_remove("id") {
        Some(Value::String(id)) => store::get(conn, &GLOW, &id)?,
        _ => None,
    };

    match existing {
        Some(mut glow) => {
            if !glow.is_owned_by(user_id) {
                return Err(ApiError::NoPermission);
            }
            prepare_update(conn, &GLOW, &mut glow, &payload)?;
            store::save(conn, &GLOW, &mut glow)?;
            Ok(glow.id)
        }
        None => {
            let mut glow = prepare_new(conn, &GLOW, Some(user_id), &payload)?;
            glow.id = Uuid::new_v4().to_string();
            store::insert(conn, &GLOW, &glow)?;
            debug!("Created glow {}", glow.id);
            Ok(glow.id)
        }
    }
}

/// `saveglow`
pub async fn save_glow(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    require_post(&req)?;
    let glow_id = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            upsert_glow(conn, user.id(), &req.data)
        })
        .await?;
    Ok(Json(json!({
        "result": { "message": "Glow saved successfully", "glowId": glow_id },
    })))
}

/// `deleteglow`: the glow is named by the `glowId` query parameter.
pub async fn delete_glow(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    require_post(&req)?;
    let glow_id = required_param(&req, "glowId")?.to_string();
    state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            fetch_owned(conn, &GLOW, &glow_id, user.id())?;
            store::delete(conn, &GLOW, &glow_id)
        })
        .await?;
    Ok(Json(json!({ "result": "Glow deleted successfully" })))
}

/// `calculatedaytotal`: the Day is named by the `dayId` query parameter.
pub async fn day_total(State(state): State<AppState>, req: ApiRequest) -> ApiResult<Json<Value>> {
    require_post(&req)?;
    let day_id = required_param(&req, "dayId")?.to_string();
    let day = state
        .run(move |conn, state| {
            let user = req.require_user(conn, state)?;
            fetch_owned(conn, &DAY, &day_id, user.id())
        })
        .await?;
    Ok(Json(json!({
        "dayTotal": day.data.get("totalAmount").cloned().unwrap_or(json!(0)),
        "dayId": day.id,
    })))
}
