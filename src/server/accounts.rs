//! `_User` account persistence. Users live in their own table so that username and
//! email uniqueness and the password hash are enforced outside the JSON
//! payload.

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};

use crate::server::error::{ApiError, ApiResult, code};
use crate::server::schema;
use crate::server::store::StoredObject;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub object: StoredObject,
    pub password_hash: String,
}

impl UserRecord {
    pub fn new(data: Map<String, Value>, password_hash: String) -> Self {
        let id = schema::new_object_id();
        let object = StoredObject::with_id(id.clone(), Some(id), data);
        Self {
            object,
            password_hash,
        }
    }

    pub fn id(&self) -> &str {
        &self.object.id
    }

    pub fn username(&self) -> &str {
        self.text("username")
    }

    pub fn email(&self) -> &str {
        self.text("email")
    }

    fn text(&self, field: &str) -> &str {
        self.object
            .data
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode(
    (id, password_hash, data, created_at, updated_at): (String, String, String, String, String),
) -> ApiResult<UserRecord> {
    Ok(UserRecord {
        object: StoredObject {
            owner_id: Some(id.clone()),
            id,
            data: serde_json::from_str(&data)?,
            created_at,
            updated_at,
        },
        password_hash,
    })
}

const COLUMNS: &str = "object_id, password_hash, data, created_at, updated_at";

fn find_one(conn: &Connection, clause: &str, value: &str) -> ApiResult<Option<UserRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE {} = ?1", COLUMNS, clause),
            [value],
            row_to_user,
        )
        .optional()?;
    row.map(decode).transpose()
}

pub fn get_user(conn: &Connection, id: &str) -> ApiResult<Option<UserRecord>> {
    find_one(conn, "object_id", id)
}

pub fn find_by_username(conn: &Connection, username: &str) -> ApiResult<Option<UserRecord>> {
    find_one(conn, "username", username)
}

fn taken(conn: &Connection, column: &str, value: &str, except_id: &str) -> ApiResult<bool> {
    let found = conn
        .query_row(
            &format!("SELECT 1 FROM users WHERE {} = ?1 AND object_id <> ?2", column),
            [value, except_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn email_exists(conn: &Connection, email: &str) -> ApiResult<bool> {
    taken(conn, "email", email, "")
}

fn username_taken() -> ApiError {
    ApiError::Conflict {
        code: code::INVALID_REQUEST,
        message: "Account already exists for this username.".to_string(),
    }
}

fn email_taken() -> ApiError {
    ApiError::Conflict {
        code: code::EMAIL_TAKEN,
        message: "Account already exists for this email address.".to_string(),
    }
}

/// Username and email must stay unique across accounts.
fn check_unique(conn: &Connection, user: &UserRecord) -> ApiResult<()> {
    if taken(conn, "username", user.username(), user.id())? {
        return Err(username_taken());
    }
    if taken(conn, "email", user.email(), user.id())? {
        return Err(email_taken());
    }
    Ok(())
}

/// A concurrent write can slip past [`check_unique`]; the table's UNIQUE
/// constraints then decide, and the failure maps to the same conflict.
fn unique_violation(err: rusqlite::Error) -> ApiError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            if message.contains("users.username") {
                return username_taken();
            }
            if message.contains("users.email") {
                return email_taken();
            }
        }
    }
    err.into()
}

fn insert_row(conn: &Connection, user: &UserRecord) -> ApiResult<()> {
    conn.execute(
        "INSERT INTO users (object_id, username, email, password_hash, data, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user.id(),
            user.username(),
            user.email(),
            user.password_hash,
            serde_json::to_string(&user.object.data)?,
            user.object.created_at,
            user.object.updated_at,
        ],
    )
    .map_err(unique_violation)?;
    Ok(())
}

pub fn insert_user(conn: &Connection, user: &UserRecord) -> ApiResult<()> {
    check_unique(conn, user)?;
    insert_row(conn, user)
}

pub fn save_user(conn: &Connection, user: &mut UserRecord) -> ApiResult<()> {
    check_unique(conn, user)?;
    user.object.updated_at = schema::now_iso();
    conn.execute(
        "UPDATE users SET username = ?2, email = ?3, password_hash = ?4, data = ?5, updated_at = ?6
         WHERE object_id = ?1",
        params![
            user.id(),
            user.username(),
            user.email(),
            user.password_hash,
            serde_json::to_string(&user.object.data)?,
            user.object.updated_at,
        ],
    )
    .map_err(unique_violation)?;
    Ok(())
}
