//! Full-server database: connection pool and versioned schema migrations.
//!
//! The schema version is tracked with `PRAGMA user_version`. Each entry in
//! [`MIGRATIONS`] moves the schema forward by one version and runs inside a
//! transaction together with the version bump.

use std::path::Path;

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, SipGuardError};
use crate::logging::DbPool;

/// Columns shared by every class table.
///
/// `natural_key` is unique per owner (a Day's calendar date) and `parent_id`
/// links a child row to the object that aggregates it (a Sip's Day).
macro_rules! class_table {
    ($name:literal) => {
        concat!(
            "CREATE TABLE ",
            $name,
            " (
                object_id   TEXT PRIMARY KEY,
                owner_id    TEXT,
                natural_key TEXT,
                parent_id   TEXT,
                data        TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                UNIQUE (owner_id, natural_key)
            );
            CREATE INDEX idx_",
            $name,
            "_owner ON ",
            $name,
            "(owner_id);
            CREATE INDEX idx_",
            $name,
            "_parent ON ",
            $name,
            "(parent_id);"
        )
    };
}

const MIGRATIONS: &[&str] = &[
    // 1: users, sessions and the Parse classes
    concat!(
        "CREATE TABLE users (
            object_id     TEXT PRIMARY KEY,
            username      TEXT NOT NULL UNIQUE,
            email         TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            data          TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE TABLE sessions (
            token_hash TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        CREATE INDEX idx_sessions_user ON sessions(user_id);",
        class_table!("installations"),
        class_table!("bottles"),
        class_table!("days"),
        class_table!("sips"),
        class_table!("locations"),
        class_table!("health_stats"),
        class_table!("glows"),
    ),
];

/// Schema version this build expects.
pub fn latest_version() -> i64 {
    MIGRATIONS.len() as i64
}

pub fn schema_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Apply every pending migration. Returns the number applied.
pub fn migrate(conn: &mut Connection) -> Result<usize> {
    let current = schema_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(SipGuardError::Server(format!(
            "database schema version {} is newer than this build ({})",
            current, latest
        )));
    }

    let mut applied = 0;
    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as i64 + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!("Applied schema migration {}", version);
        applied += 1;
    }
    Ok(applied)
}

/// Refuse to run against a database that has pending migrations.
pub fn check_schema(conn: &Connection) -> Result<()> {
    let found = schema_version(conn)?;
    let expected = latest_version();
    if found != expected {
        return Err(SipGuardError::SchemaOutdated { found, expected });
    }
    Ok(())
}

/// Open the server database pool without touching the schema.
pub fn open_pool(path: &Path) -> Result<DbPool> {
    let manager = r2d2_sqlite::SqliteConnectionManager::file(path)
        .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout = 5000;"));
    let pool = r2d2::Pool::builder().max_size(8).build(manager)?;
    Ok(pool)
}

/// Open a migrated in-memory pool (for testing).
pub fn open_memory_pool() -> Result<DbPool> {
    let manager = r2d2_sqlite::SqliteConnectionManager::memory();
    let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
    let mut conn = pool.get()?;
    migrate(&mut conn)?;
    drop(conn);
    Ok(pool)
}
