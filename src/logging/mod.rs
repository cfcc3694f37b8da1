//! SQLite-backed request log for the MITM proxy.
//!
//! When logging is enabled every inbound request is recorded *before*
//! redaction: method, path with query string, every header pair in arrival
//! order, the raw body and the receipt time. Once the request has been
//! answered, the status and body sent back to the device are attached to the
//! same record. Records are never evicted.
//!
//! The database is accessed through an [`r2d2`] connection pool ([`DbPool`]).
//! The proxy talks to it through the [`RequestSink`] trait so that a storage
//! failure can be observed without ever blocking the response path.
//!
//! The [`export`] submodule provides JSON and CSV export of all records.

pub mod export;

use std::sync::Arc;

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use rusqlite::Connection;

use crate::error::{Result, SipGuardError};

/// SQLite connection pool type alias (r2d2 + r2d2-sqlite).
pub type DbPool = r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>;

/// Open a connection pool for the given database file path.
///
/// Creates the database and `requests` table if they don't exist.
/// The pool is configured with a maximum of 4 connections.
pub fn open_pool(path: &std::path::Path) -> Result<DbPool> {
    let manager = r2d2_sqlite::SqliteConnectionManager::file(path);
    let pool = r2d2::Pool::builder().max_size(4).build(manager)?;
    let conn = pool.get()?;
    init_db(&conn)?;
    Ok(pool)
}

/// Open an in-memory connection pool (for testing).
pub fn open_memory_pool() -> Result<DbPool> {
    let manager = r2d2_sqlite::SqliteConnectionManager::memory();
    let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    init_db(&conn)?;
    Ok(pool)
}

/// A raw request as received by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    /// Auto-incremented row ID (`None` for new records before insert).
    pub id: Option<i64>,
    /// RFC 3339 receipt timestamp.
    pub timestamp: String,
    /// HTTP method (e.g., `"PUT"`).
    pub method: String,
    /// Request path including the query string (e.g., `"/parse/classes/Sip?limit=5"`).
    pub path: String,
    /// Header pairs in arrival order; repeated headers appear repeatedly.
    pub headers: Vec<(String, String)>,
    /// Unmodified request body.
    pub body: Vec<u8>,
    /// Status returned to the device; `None` until the request is answered.
    pub response_status: Option<u16>,
    /// Body returned to the device.
    pub response_body: Option<Vec<u8>>,
}

impl RequestRecord {
    /// Capture an inbound request, stamped with the current time.
    pub fn capture(method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Self {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());
        Self {
            id: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            method: method.as_str().to_string(),
            path,
            headers: headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            body: body.to_vec(),
            response_status: None,
            response_body: None,
        }
    }
}

/// Durable storage for request records.
pub trait RequestSink: Send + Sync {
    /// Append a record and return its ID once persisted.
    fn append(&self, record: &RequestRecord) -> Result<i64>;

    /// Attach the answer sent to the device to a stored record.
    fn set_response(&self, id: i64, status: u16, body: &[u8]) -> Result<()>;
}

impl RequestSink for DbPool {
    fn append(&self, record: &RequestRecord) -> Result<i64> {
        let conn = self.get()?;
        log_request(&conn, record)
    }

    fn set_response(&self, id: i64, status: u16, body: &[u8]) -> Result<()> {
        let conn = self.get()?;
        log_response(&conn, id, status, body)
    }
}

/// Best-effort request logger shared by all proxy handlers.
///
/// Disabled loggers return immediately without touching storage.
#[derive(Clone, Default)]
pub struct RequestLogger {
    sink: Option<Arc<dyn RequestSink>>,
}

impl RequestLogger {
    pub fn new(sink: Arc<dyn RequestSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Persist `record` if logging is enabled.
    ///
    /// Returns `Ok(None)` when disabled and `Ok(Some(id))` once the record is
    /// stored. The write runs on the blocking thread pool.
    pub async fn record(&self, record: RequestRecord) -> Result<Option<i64>> {
        let Some(sink) = self.sink.clone() else {
            return Ok(None);
        };
        let id = tokio::task::spawn_blocking(move || sink.append(&record))
            .await
            .map_err(|e| SipGuardError::Server(format!("log writer task failed: {}", e)))??;
        Ok(Some(id))
    }

    /// Attach the response to the record stored as `id`. No-op when disabled.
    pub async fn record_response(&self, id: i64, status: StatusCode, body: Vec<u8>) -> Result<()> {
        let Some(sink) = self.sink.clone() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || sink.set_response(id, status.as_u16(), &body))
            .await
            .map_err(|e| SipGuardError::Server(format!("log writer task failed: {}", e)))?
    }
}

/// Schema version stored in `PRAGMA user_version`.
const LOG_SCHEMA_VERSION: i64 = 1;

/// Initialize the SQLite database and create the requests table if it doesn't exist.
///
/// Logs written before responses were recorded gain the response columns.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS requests (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            method    TEXT NOT NULL,
            path      TEXT NOT NULL,
            headers   TEXT NOT NULL,
            body      BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests(timestamp);
        CREATE INDEX IF NOT EXISTS idx_requests_path ON requests(path);",
    )?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < 1 {
        conn.execute_batch(
            "ALTER TABLE requests ADD COLUMN response_status INTEGER;
            ALTER TABLE requests ADD COLUMN response_body BLOB;",
        )?;
    }
    if version < LOG_SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", LOG_SCHEMA_VERSION)?;
    }
    Ok(())
}

/// Append a record to the database.
pub fn log_request(conn: &Connection, record: &RequestRecord) -> Result<i64> {
    let headers = serde_json::to_string(&record.headers)?;
    conn.execute(
        "INSERT INTO requests (timestamp, method, path, headers, body, response_status, response_body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            record.timestamp,
            record.method,
            record.path,
            headers,
            record.body,
            record.response_status,
            record.response_body,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Store the response for record `id`.
pub fn log_response(conn: &Connection, id: i64, status: u16, body: &[u8]) -> Result<()> {
    conn.execute(
        "UPDATE requests SET response_status = ?1, response_body = ?2 WHERE id = ?3",
        rusqlite::params![status, body, id],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(RequestRecord, String)> {
    Ok((
        RequestRecord {
            id: Some(row.get(0)?),
            timestamp: row.get(1)?,
            method: row.get(2)?,
            path: row.get(3)?,
            headers: Vec::new(),
            body: row.get(5)?,
            response_status: row.get(6)?,
            response_body: row.get(7)?,
        },
        row.get(4)?,
    ))
}

fn decode_headers((mut record, headers): (RequestRecord, String)) -> Result<RequestRecord> {
    record.headers = serde_json::from_str(&headers)?;
    Ok(record)
}

/// Query the most recent N records, newest first.
pub fn query_recent(conn: &Connection, limit: usize) -> Result<Vec<RequestRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, method, path, headers, body, response_status, response_body
         FROM requests ORDER BY id DESC LIMIT ?1",
    )?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(rusqlite::params![limit], row_to_record)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(decode_headers(row?)?);
    }
    Ok(records)
}

/// Fetch a single record by ID.
pub fn get_request(conn: &Connection, id: i64) -> Result<Option<RequestRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, method, path, headers, body, response_status, response_body
         FROM requests WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(rusqlite::params![id], row_to_record)?;
    match rows.next() {
        Some(row) => Ok(Some(decode_headers(row?)?)),
        None => Ok(None),
    }
}

/// Total number of stored records.
pub fn count_requests(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Open or create a SQLite database at the given path.
pub fn open_db(path: &std::path::Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    init_db(&conn)?;
    Ok(conn)
}

/// Open an in-memory SQLite database (for testing).
pub fn open_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_db(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn sample_record(path: &str, method: &str) -> RequestRecord {
        RequestRecord {
            id: None,
            timestamp: "2026-02-12T10:00:00+00:00".to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers: vec![
                ("x-parse-application-id".to_string(), "app".to_string()),
                ("user-agent".to_string(), "Parse Android SDK".to_string()),
            ],
            body: br#"{"lat": 43.6, "amount": 250}"#.to_vec(),
            response_status: None,
            response_body: None,
        }
    }

    #[test]
    fn init_and_insert() {
        let conn = open_memory_db().unwrap();
        let id = log_request(&conn, &sample_record("/parse/classes/Sip", "POST")).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn stored_record_round_trips_exactly() {
        let conn = open_memory_db().unwrap();
        let record = sample_record("/parse/classes/Sip?where=%7B%7D", "POST");
        let id = log_request(&conn, &record).unwrap();

        let stored = get_request(&conn, id).unwrap().unwrap();
        assert_eq!(stored.id, Some(id));
        assert_eq!(stored.method, record.method);
        assert_eq!(stored.path, record.path);
        assert_eq!(stored.headers, record.headers);
        assert_eq!(stored.body, record.body);
        assert_eq!(stored.timestamp, record.timestamp);
        assert_eq!(stored.response_status, None);
        assert_eq!(stored.response_body, None);
    }

    #[test]
    fn response_is_attached_to_request() {
        let conn = open_memory_db().unwrap();
        let record = sample_record("/parse/classes/Sip", "POST");
        let id = log_request(&conn, &record).unwrap();
        log_response(&conn, id, 201, br#"{"objectId":"s1"}"#).unwrap();

        let stored = get_request(&conn, id).unwrap().unwrap();
        assert_eq!(stored.response_status, Some(201));
        assert_eq!(stored.response_body.as_deref(), Some(&br#"{"objectId":"s1"}"#[..]));
        assert_eq!(stored.body, record.body);
    }

    #[test]
    fn old_log_gains_response_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE requests (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                method    TEXT NOT NULL,
                path      TEXT NOT NULL,
                headers   TEXT NOT NULL,
                body      BLOB NOT NULL
            );
            INSERT INTO requests (timestamp, method, path, headers, body)
            VALUES ('2026-02-12T10:00:00+00:00', 'GET', '/old', '[]', x'');",
        )
        .unwrap();

        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let old = get_request(&conn, 1).unwrap().unwrap();
        assert_eq!(old.path, "/old");
        assert_eq!(old.response_status, None);
        log_response(&conn, 1, 200, b"{}").unwrap();
        assert_eq!(get_request(&conn, 1).unwrap().unwrap().response_status, Some(200));
    }

    #[test]
    fn get_missing_record_is_none() {
        let conn = open_memory_db().unwrap();
        assert!(get_request(&conn, 42).unwrap().is_none());
    }

    #[test]
    fn query_recent_returns_in_desc_order() {
        let conn = open_memory_db().unwrap();
        log_request(&conn, &sample_record("/first", "GET")).unwrap();
        log_request(&conn, &sample_record("/second", "POST")).unwrap();
        log_request(&conn, &sample_record("/third", "PUT")).unwrap();

        let records = query_recent(&conn, 2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "/third");
        assert_eq!(records[1].path, "/second");
        assert_eq!(count_requests(&conn).unwrap(), 3);
    }

    #[test]
    fn query_recent_with_unbounded_limit() {
        let conn = open_memory_db().unwrap();
        log_request(&conn, &sample_record("/only", "GET")).unwrap();
        let records = query_recent(&conn, usize::MAX).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn capture_keeps_query_and_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append("x-parse-os-version", HeaderValue::from_static("14"));
        headers.append("accept", HeaderValue::from_static("a"));
        headers.append("accept", HeaderValue::from_static("b"));
        let uri: Uri = "/parse/classes/Day?limit=7".parse().unwrap();

        let record = RequestRecord::capture(&Method::GET, &uri, &headers, b"");
        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/parse/classes/Day?limit=7");
        assert_eq!(record.headers.len(), 3);
        assert_eq!(
            record.headers.iter().filter(|(k, _)| k == "accept").count(),
            2
        );
        assert!(record.body.is_empty());
    }

    #[test]
    fn pool_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("sink.db")).unwrap();
        let sink: &dyn RequestSink = &pool;
        assert_eq!(sink.append(&sample_record("/a", "GET")).unwrap(), 1);
        assert_eq!(sink.append(&sample_record("/b", "GET")).unwrap(), 2);
    }

    #[test]
    fn open_db_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let conn = open_db(&db_path).unwrap();
        log_request(&conn, &sample_record("/persisted", "GET")).unwrap();

        let conn2 = open_db(&db_path).unwrap();
        let records = query_recent(&conn2, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/persisted");
    }

    #[tokio::test]
    async fn disabled_logger_writes_nothing() {
        let logger = RequestLogger::disabled();
        assert!(!logger.is_enabled());
        let result = logger.record(sample_record("/x", "GET")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn enabled_logger_persists() {
        let pool = open_memory_pool().unwrap();
        let logger = RequestLogger::new(Arc::new(pool.clone()));
        let id = logger.record(sample_record("/y", "PUT")).await.unwrap();
        assert_eq!(id, Some(1));

        let conn = pool.get().unwrap();
        assert_eq!(query_recent(&conn, 10).unwrap()[0].path, "/y");
        drop(conn);

        logger
            .record_response(1, StatusCode::ACCEPTED, b"{\"result\":[]}".to_vec())
            .await
            .unwrap();
        let conn = pool.get().unwrap();
        let stored = get_request(&conn, 1).unwrap().unwrap();
        assert_eq!(stored.response_status, Some(202));
        assert_eq!(stored.response_body.unwrap(), b"{\"result\":[]}");
    }

    struct BrokenSink;

    impl RequestSink for BrokenSink {
        fn append(&self, _record: &RequestRecord) -> Result<i64> {
            Err(SipGuardError::Io(std::io::Error::other("disk full")))
        }

        fn set_response(&self, _id: i64, _status: u16, _body: &[u8]) -> Result<()> {
            Err(SipGuardError::Io(std::io::Error::other("disk full")))
        }
    }

    #[tokio::test]
    async fn sink_failure_is_reported() {
        let logger = RequestLogger::new(Arc::new(BrokenSink));
        let err = logger.record(sample_record("/z", "POST")).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }
}
