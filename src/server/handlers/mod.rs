//! HTTP handlers for the full server.
//!
//! Handlers are registered with `any(..)` and dispatch on the effective
//! method of the [`ApiRequest`], since the SDK may override it in the body.

pub mod classes;
pub mod functions;
pub mod users;

use axum::Json;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use rusqlite::Connection;
use serde_json::{Map, Value, json};

use crate::server::error::{ApiError, ApiResult};
use crate::server::request::ApiRequest;
use crate::server::schema::{self, ClassSpec, USER};
use crate::server::store::{self, StoredObject};

/// `/` - liveness answer, no authentication.
pub async fn home(method: Method) -> String {
    format!("success {}", method)
}

/// Analytics and social endpoints the server does not implement.
pub async fn empty() -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({"results": [], "result": []})),
    )
        .into_response()
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
}

/// `GET /parse/config` - static client configuration.
pub async fn config(req: ApiRequest) -> ApiResult<Json<Value>> {
    if req.method != Method::GET {
        return Err(ApiError::MethodNotAllowed);
    }
    Ok(Json(json!({
        "params": {
            "iOSLatestVersion": "2.1.7",
            "androidLatestVersion": "2.2.25",
            "firmwareUpdateFractionAndroid": 1,
            "downloadAppUrl": "https://hidrate.page.link/friend",
            "androidPregnancySettings": false,
            "natalModifier": 1.25,
            "bottleVendors": {
                "amazon": "Amazon",
                "hidrate": "HidrateSpark.com",
                "target": "Target",
                "apple": "Apple",
            },
            "trophyShareUrl": "https://hidratesparktrophies.com/trophy/",
            "trophySign": "RANDOM",
            "iOSHideNFC": true,
            "androidNfcVersion": "135",
            "androidTumblerPlasticVisibility": false,
            "hidePro": true,
            "androidNfcEnabled": false,
        },
        "masterKeyOnly": {
            "iOSLatestVersion": false,
            "bottleVendors": false,
            "androidLatestVersion": false,
            "trophyShareUrl": false,
            "trophySign": false,
            "iOSHideNFC": false,
            "androidNfcVersion": false,
            "androidTumblerPlasticVisibility": false,
            "hidePro": false,
            "androidNfcEnabled": false,
        },
    })))
}

// ─── Shared object helpers ──────────────────────────────────────────────────

/// Owned objects always point at their owner; a client may not attach
/// another account's pointer.
fn bind_owner(class: &ClassSpec, data: &mut Map<String, Value>, owner_id: &str) -> ApiResult<()> {
    if class.field("user").is_none() {
        return Ok(());
    }
    match data.get("user").map(schema::pointer_id) {
        None => {
            data.insert("user".to_string(), USER.pointer(owner_id));
            Ok(())
        }
        Some(Some(id)) if id == owner_id => Ok(()),
        Some(_) => Err(ApiError::NoPermission),
    }
}

/// Validate a create payload and build the object without storing it.
pub(crate) fn prepare_new(
    conn: &Connection,
    class: &ClassSpec,
    owner_id: Option<&str>,
    payload: &Map<String, Value>,
) -> ApiResult<StoredObject> {
    let mut data = class.defaults(&schema::now_iso());
    schema::apply_changes(class, &mut data, payload, &mut |c, id| store::exists(conn, c, id))?;
    if let Some(owner_id) = owner_id {
        bind_owner(class, &mut data, owner_id)?;
    }
    schema::check_required(class, &data)?;
    Ok(StoredObject::new(owner_id.map(str::to_string), data))
}

/// Apply an update payload in place without storing it.
pub(crate) fn prepare_update(
    conn: &Connection,
    class: &ClassSpec,
    object: &mut StoredObject,
    payload: &Map<String, Value>,
) -> ApiResult<()> {
    let mut data = object.data.clone();
    schema::apply_changes(class, &mut data, payload, &mut |c, id| store::exists(conn, c, id))?;
    if let Some(owner_id) = object.owner_id.clone() {
        bind_owner(class, &mut data, &owner_id)?;
    }
    schema::check_required(class, &data)?;
    object.data = data;
    Ok(())
}

/// Load an object and check that `user_id` owns it.
pub(crate) fn fetch_owned(
    conn: &Connection,
    class: &ClassSpec,
    id: &str,
    user_id: &str,
) -> ApiResult<StoredObject> {
    let object = store::fetch(conn, class, id)?;
    if !object.is_owned_by(user_id) {
        return Err(ApiError::NoPermission);
    }
    Ok(object)
}

/// Copy selected fields of `object` into a response body.
pub(crate) fn with_fields(mut body: Value, object: &StoredObject, fields: &[&str]) -> Value {
    if let Value::Object(map) = &mut body {
        for field in fields {
            if let Some(value) = object.field(field) {
                map.insert(field.to_string(), value);
            }
        }
    }
    body
}

pub(crate) fn created(object: &StoredObject) -> Value {
    json!({"objectId": object.id, "createdAt": object.created_at})
}

pub(crate) fn updated(object: &StoredObject) -> Value {
    json!({"objectId": object.id, "updatedAt": object.updated_at})
}
