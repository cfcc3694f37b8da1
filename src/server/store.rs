//! Generic persistence for Parse class objects.
//!
//! Every class lives in its own table with the same column layout (see
//! [`crate::server::db`]). The field payload is a JSON document; the owner,
//! natural key and parent link are lifted into columns so they can be
//! indexed and constrained.

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde_json::{Map, Value};

use crate::server::error::{ApiError, ApiResult};
use crate::server::schema::{self, ClassSpec};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub id: String,
    pub owner_id: Option<String>,
    pub data: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl StoredObject {
    /// A new object with a fresh ID, timestamped now.
    pub fn new(owner_id: Option<String>, data: Map<String, Value>) -> Self {
        Self::with_id(schema::new_object_id(), owner_id, data)
    }

    pub fn with_id(id: String, owner_id: Option<String>, data: Map<String, Value>) -> Self {
        let now = schema::now_iso();
        Self {
            id,
            owner_id,
            data,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }

    /// Full wire representation.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("objectId".to_string(), Value::String(self.id.clone()));
        for (key, value) in &self.data {
            out.insert(key.clone(), value.clone());
        }
        out.insert("createdAt".to_string(), Value::String(self.created_at.clone()));
        out.insert("updatedAt".to_string(), Value::String(self.updated_at.clone()));
        Value::Object(out)
    }

    /// Value of a field, with the system fields resolved from columns.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "objectId" => Some(Value::String(self.id.clone())),
            "createdAt" => Some(Value::String(self.created_at.clone())),
            "updatedAt" => Some(Value::String(self.updated_at.clone())),
            _ => self.data.get(name).cloned(),
        }
    }

    fn natural_key(&self, class: &ClassSpec) -> Option<String> {
        let field = class.natural_key?;
        self.data.get(field).and_then(Value::as_str).map(str::to_string)
    }

    fn parent_id(&self, class: &ClassSpec) -> Option<String> {
        let field = class.parent?;
        self.data
            .get(field)
            .and_then(schema::pointer_id)
            .map(str::to_string)
    }
}

fn constraint_to_api(err: rusqlite::Error) -> ApiError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            ApiError::invalid("failed")
        }
        other => other.into(),
    }
}

fn row_to_object(row: &rusqlite::Row<'_>) -> rusqlite::Result<(StoredObject, String)> {
    Ok((
        StoredObject {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            data: Map::new(),
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        },
        row.get(2)?,
    ))
}

fn decode((mut object, data): (StoredObject, String)) -> ApiResult<StoredObject> {
    object.data = serde_json::from_str(&data)?;
    Ok(object)
}

const COLUMNS: &str = "object_id, owner_id, data, created_at, updated_at";

/// Whether an object of the named class exists. Unknown classes never do.
pub fn exists(conn: &Connection, class_name: &str, id: &str) -> ApiResult<bool> {
    let Some(class) = schema::class_by_name(class_name) else {
        return Ok(false);
    };
    let found = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE object_id = ?1", class.table),
            [id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn insert(conn: &Connection, class: &ClassSpec, object: &StoredObject) -> ApiResult<()> {
    let data = serde_json::to_string(&object.data)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (object_id, owner_id, natural_key, parent_id, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            class.table
        ),
        params![
            object.id,
            object.owner_id,
            object.natural_key(class),
            object.parent_id(class),
            data,
            object.created_at,
            object.updated_at,
        ],
    )
    .map_err(constraint_to_api)?;
    Ok(())
}

/// Insert unless an object with the same owner and natural key exists.
/// Returns true if a row was written.
pub fn insert_if_absent(conn: &Connection, class: &ClassSpec, object: &StoredObject) -> ApiResult<bool> {
    let data = serde_json::to_string(&object.data)?;
    let written = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {} (object_id, owner_id, natural_key, parent_id, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            class.table
        ),
        params![
            object.id,
            object.owner_id,
            object.natural_key(class),
            object.parent_id(class),
            data,
            object.created_at,
            object.updated_at,
        ],
    )?;
    Ok(written > 0)
}

pub fn get(conn: &Connection, class: &ClassSpec, id: &str) -> ApiResult<Option<StoredObject>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM {} WHERE object_id = ?1", COLUMNS, class.table),
            [id],
            row_to_object,
        )
        .optional()?;
    row.map(decode).transpose()
}

/// Like [`get`], but a missing object is an API error.
pub fn fetch(conn: &Connection, class: &ClassSpec, id: &str) -> ApiResult<StoredObject> {
    get(conn, class, id)?.ok_or(ApiError::DoesNotExist)
}

/// Persist the object's current data, bumping `updatedAt` and any
/// auto-refreshed date fields.
pub fn save(conn: &Connection, class: &ClassSpec, object: &mut StoredObject) -> ApiResult<()> {
    let now = schema::now_iso();
    for field in class.touch {
        object.data.insert(field.to_string(), schema::date_value(&now));
    }
    object.updated_at = now;

    let data = serde_json::to_string(&object.data)?;
    conn.execute(
        &format!(
            "UPDATE {} SET owner_id = ?2, natural_key = ?3, parent_id = ?4, data = ?5, updated_at = ?6
             WHERE object_id = ?1",
            class.table
        ),
        params![
            object.id,
            object.owner_id,
            object.natural_key(class),
            object.parent_id(class),
            data,
            object.updated_at,
        ],
    )
    .map_err(constraint_to_api)?;
    Ok(())
}

pub fn delete(conn: &Connection, class: &ClassSpec, id: &str) -> ApiResult<bool> {
    let removed = conn.execute(
        &format!("DELETE FROM {} WHERE object_id = ?1", class.table),
        [id],
    )?;
    Ok(removed > 0)
}

/// Delete every object whose parent is `parent_id`. Returns the count.
pub fn delete_children(conn: &Connection, class: &ClassSpec, parent_id: &str) -> ApiResult<usize> {
    let removed = conn.execute(
        &format!("DELETE FROM {} WHERE parent_id = ?1", class.table),
        [parent_id],
    )?;
    Ok(removed)
}

fn collect(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> ApiResult<Vec<StoredObject>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_object)?;
    let mut objects = Vec::new();
    for row in rows {
        objects.push(decode(row?)?);
    }
    Ok(objects)
}

/// Every object owned by `owner_id`, oldest first.
pub fn list_owned(conn: &Connection, class: &ClassSpec, owner_id: &str) -> ApiResult<Vec<StoredObject>> {
    collect(
        conn,
        &format!(
            "SELECT {} FROM {} WHERE owner_id = ?1 ORDER BY created_at, rowid",
            COLUMNS, class.table
        ),
        [owner_id],
    )
}

/// Objects owned by `owner_id` whose natural key is at or after `from`.
pub fn list_owned_from_key(
    conn: &Connection,
    class: &ClassSpec,
    owner_id: &str,
    from: &str,
) -> ApiResult<Vec<StoredObject>> {
    collect(
        conn,
        &format!(
            "SELECT {} FROM {} WHERE owner_id = ?1 AND natural_key >= ?2 ORDER BY natural_key",
            COLUMNS, class.table
        ),
        [owner_id, from],
    )
}

/// Children of `parent_id`, oldest first.
pub fn list_children(conn: &Connection, class: &ClassSpec, parent_id: &str) -> ApiResult<Vec<StoredObject>> {
    collect(
        conn,
        &format!(
            "SELECT {} FROM {} WHERE parent_id = ?1 ORDER BY created_at, rowid",
            COLUMNS, class.table
        ),
        [parent_id],
    )
}
